//! Versioned SQL migrations from `migrations/NNN_name.sql`.

use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use crate::error::{Result, GenieError};

/// Tables the service expects after all migrations ran
pub const EXPECTED_TABLES: &[&str] = &[
    "accounts",
    "api_tokens",
    "extracted_invoice_data",
    "invoices",
    "line_items",
    "processing_events",
    "schema_migrations",
    "sessions",
    "usage_counters",
];

#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );",
    )?;
    Ok(())
}

/// Names of applied migrations, in version order
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

/// `"002_usage_and_access.sql"` -> `(2, "002_usage_and_access")`
fn parse_file_name(file_name: &str) -> Result<(u32, String)> {
    let stem = file_name
        .strip_suffix(".sql")
        .ok_or_else(|| GenieError::Config(format!("Not a migration file: {}", file_name)))?;
    let (prefix, _) = stem
        .split_once('_')
        .ok_or_else(|| GenieError::Config(format!("Migration name lacks a version prefix: {}", file_name)))?;
    let version = prefix
        .parse::<u32>()
        .map_err(|_| GenieError::Config(format!("Invalid migration version in {}", file_name)))?;
    Ok((version, stem.to_string()))
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for entry in fs::read_dir(migrations_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(".sql") {
            continue;
        }
        let (version, name) = parse_file_name(file_name)?;
        let sql = fs::read_to_string(&path)?;
        migrations.push(Migration { version, name, sql });
    }

    migrations.sort_by_key(|m| m.version);
    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(GenieError::Config(format!(
            "Duplicate migration version {}: {} and {}",
            pair[0].version, pair[0].name, pair[1].name
        )));
    }
    Ok(migrations)
}

/// Apply every migration not yet recorded, each in its own transaction
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;
    let applied = get_applied_migrations(conn)?;

    let pending: Vec<Migration> = load_migrations(migrations_dir)?
        .into_iter()
        .filter(|m| !applied.contains(&m.name))
        .collect();

    if pending.is_empty() {
        log::debug!("Schema up to date ({} migrations)", applied.len());
        return Ok(());
    }

    for migration in pending {
        log::info!("Applying migration {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            GenieError::Config(format!("Migration {} failed: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    log::info!("All migrations applied");
    Ok(())
}

/// Names of expected tables that are missing from the database
pub fn missing_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table'")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

    Ok(EXPECTED_TABLES
        .iter()
        .filter(|t| !tables.iter().any(|existing| existing == *t))
        .map(|t| t.to_string())
        .collect())
}
