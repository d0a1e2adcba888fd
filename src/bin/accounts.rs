use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use invoice_genie::db::{migrate, Db};
use invoice_genie::models::Account;
use invoice_genie::store::accounts;
use invoice_genie::usage::{SqliteUsageLedger, UsageLedger};
use invoice_genie::Config;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "accounts")]
#[command(about = "Manage Invoice Genie accounts, credentials and quotas")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account
    Create {
        email: String,
        /// Page quota override (defaults to usage.default_page_quota)
        #[arg(long)]
        quota: Option<i64>,
    },
    /// Issue a bearer token for the mobile client
    Token {
        email: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Open a web session
    Session {
        email: String,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
    /// Set an account's page quota
    Quota { email: String, pages: i64 },
    /// Show this period's usage
    Usage { email: String },
}

async fn require_account(db: &Db, email: &str) -> Result<Account> {
    accounts::find_account_by_email(db, email)
        .await?
        .with_context(|| format!("No account with email {}", email))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let config = Config::load()?;
    let db = Db::new(config.db_path());

    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    let ledger = SqliteUsageLedger::new(db.clone(), config.usage.default_page_quota);

    match args.command {
        Command::Create { email, quota } => {
            let account = accounts::create_account(&db, &email, quota).await?;
            println!("Created account {} ({})", account.id, account.email);
        }
        Command::Token { email, label } => {
            let account = require_account(&db, &email).await?;
            let token = accounts::issue_api_token(&db, &account.id, label).await?;
            println!("{}", token);
            eprintln!("Store this token now; it cannot be shown again.");
        }
        Command::Session { email, ttl_hours } => {
            let account = require_account(&db, &email).await?;
            let session = accounts::create_session(&db, &account.id, ttl_hours).await?;
            println!("{}={}", config.server.session_cookie, session);
        }
        Command::Quota { email, pages } => {
            let account = require_account(&db, &email).await?;
            let counter = ledger.set_quota(&account.id, pages).await?;
            println!(
                "{}: quota {} pages ({} used in {})",
                account.email, counter.page_quota, counter.pages_processed, counter.period
            );
        }
        Command::Usage { email } => {
            let account = require_account(&db, &email).await?;
            let counter = ledger.counter(&account.id).await?;
            println!("\n=== Usage for {} ({}) ===\n", account.email, counter.period);
            println!("Pages processed: {}", counter.pages_processed);
            println!("Page quota:      {}", counter.page_quota);
            println!("Remaining:       {}", counter.remaining());
        }
    }

    Ok(())
}
