pub mod config;
pub mod error;
pub mod db;
pub mod models;
pub mod store;
pub mod usage;
pub mod storage;
pub mod extract;
pub mod ingest;
pub mod api;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use config::Config;
pub use error::{GenieError, Result};

use db::Db;
use extract::{MistralOcrClient, OpenAiVisionClient};
use ingest::{IngestSettings, Orchestrator};
use usage::SqliteUsageLedger;

/// Wire the production collaborators described by `config`
pub fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let db = Db::new(config.db_path());
    let ledger = Arc::new(SqliteUsageLedger::new(db.clone(), config.usage.default_page_quota));
    let objects = storage::from_config(&config.storage)?;
    let ocr = Arc::new(MistralOcrClient::from_config(&config.ocr)?);
    let vision = Arc::new(OpenAiVisionClient::from_config(&config.vision)?);

    Ok(Orchestrator::new(
        db,
        ledger,
        objects,
        ocr,
        vision,
        IngestSettings::from(&config.ingest),
    ))
}
