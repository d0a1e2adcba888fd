use anyhow::Result;
use clap::{Parser, Subcommand};
use invoice_genie::api::ApiServer;
use invoice_genie::db::{migrate, Db};
use invoice_genie::{build_orchestrator, Config};
use std::path::Path;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "invoice-genie")]
#[command(about = "Invoice Genie ingestion and extraction backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run migrations and serve the HTTP API
    Serve {
        /// Override server.port from config.toml
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run migrations and verify the database schema (default)
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config is needed for the default log level; RUST_LOG still wins.
    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", &config.server.log_level)
    ).init();

    match cli.command.unwrap_or(Command::Verify) {
        Command::Serve { port } => run_http_server(config, port).await?,
        Command::Verify => run_schema_verification(config).await?,
    }

    Ok(())
}

async fn prepare_database(config: &Config) -> Result<Db> {
    let db = Db::new(config.db_path());

    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    log::info!("Database initialized at {}", config.db_path().display());
    Ok(db)
}

/// Run the HTTP API
async fn run_http_server(config: Config, port: Option<u16>) -> Result<()> {
    log::info!("Starting Invoice Genie v{}", env!("CARGO_PKG_VERSION"));

    prepare_database(&config).await?;

    let orchestrator = Arc::new(build_orchestrator(&config)?);
    log::info!(
        "OCR model: {}, vision model: {}, admission: {:?}",
        config.ocr.model,
        config.vision.model,
        config.ingest.admission
    );

    let server = ApiServer::new(&config, orchestrator);
    server.run(port.unwrap_or(config.server.port)).await?;

    Ok(())
}

/// Run database schema verification
async fn run_schema_verification(config: Config) -> Result<()> {
    log::info!("Verifying Invoice Genie v{} database", env!("CARGO_PKG_VERSION"));

    let db = prepare_database(&config).await?;

    let (missing, applied) = db.with_connection(|conn| {
        let missing = migrate::missing_tables(conn)?;
        let applied = migrate::get_applied_migrations(conn)?;
        Ok((missing, applied))
    }).await?;

    if !missing.is_empty() {
        for table in &missing {
            log::error!("Missing table: {}", table);
        }
        anyhow::bail!("Not all required tables exist: {}", missing.join(", "));
    }

    log::info!("✓ {} migrations applied", applied.len());
    log::info!("✓ Database schema verification complete");
    Ok(())
}
