use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use invoice_genie::db::migrate;
use invoice_genie::ingest::ProcessRequest;
use invoice_genie::models::NewInvoice;
use invoice_genie::store::{accounts, invoices};
use invoice_genie::{build_orchestrator, Config};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Upload local invoice files for an account and run extraction on each")]
struct Args {
    /// Account email
    #[arg(short, long)]
    email: String,

    /// Project to file the invoices under
    #[arg(short, long)]
    project: Option<String>,

    /// PDF or image files
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    let config = Config::load()?;
    log::info!("Database path: {}", config.db_path().display());

    let orchestrator = build_orchestrator(&config)?;
    let db = orchestrator.db().clone();

    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    let account = accounts::find_account_by_email(&db, &args.email)
        .await?
        .with_context(|| format!("No account with email {}", args.email))?;

    let start = Instant::now();
    let mut completed = 0usize;
    let mut failed = 0usize;

    for path in &args.files {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();
        let file_type = mime_for(path).to_string();

        let invoice = invoices::create_invoice(
            &db,
            &account.id,
            NewInvoice {
                project_id: args.project.clone(),
                file_name: file_name.clone(),
                file_type: file_type.clone(),
                file_size: bytes.len() as i64,
                storage_ref: None,
            },
        )
        .await?;

        let request = ProcessRequest {
            invoice_id: Some(invoice.id.clone()),
            file_path: None,
            base64_data: Some(STANDARD.encode(&bytes)),
            file_type: Some(file_type),
            file_name: Some(file_name),
        };

        match orchestrator.process(&account.id, request).await {
            Ok(outcome) => {
                completed += 1;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            Err(e) => {
                failed += 1;
                log::error!("✗ {} ({}): {}", path.display(), invoice.id, e);
                if matches!(e, invoice_genie::GenieError::QuotaExceeded { .. }) {
                    log::warn!("Quota reached; skipping remaining files");
                    break;
                }
            }
        }
    }

    log::info!(
        "Ingestion finished in {:.1}s: {} completed, {} failed",
        start.elapsed().as_secs_f64(),
        completed,
        failed
    );
    Ok(())
}
