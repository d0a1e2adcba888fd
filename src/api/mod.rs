//! HTTP surface of the ingestion backend.

use std::sync::Arc;

use crate::ingest::Orchestrator;

pub mod handlers;
pub mod identity;
pub mod response;
pub mod server;

pub use identity::{AnyResolver, BearerTokenResolver, CallerIdentity, IdentityResolver, SessionCookieResolver};
pub use server::ApiServer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Web routes: session cookie
    pub web: Arc<dyn IdentityResolver>,
    /// Mobile routes: bearer token
    pub mobile: Arc<dyn IdentityResolver>,
    /// Routes shared by both clients
    pub any: Arc<dyn IdentityResolver>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, session_cookie: &str) -> Self {
        let db = orchestrator.db().clone();
        let web: Arc<dyn IdentityResolver> = Arc::new(SessionCookieResolver::new(db.clone(), session_cookie));
        let mobile: Arc<dyn IdentityResolver> = Arc::new(BearerTokenResolver::new(db));
        let any = Arc::new(AnyResolver::new(vec![web.clone(), mobile.clone()]));
        Self {
            orchestrator,
            web,
            mobile,
            any,
        }
    }
}
