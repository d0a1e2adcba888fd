//! Caller identity resolution.
//!
//! The web client authenticates with a session cookie and the mobile client
//! with a bearer token. Each is a resolver; routes pick the one they accept.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::sync::Arc;

use crate::db::Db;
use crate::error::{GenieError, Result};
use crate::store::accounts;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account_id: String,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<CallerIdentity>;
}

fn unauthorized(reason: &str) -> GenieError {
    GenieError::Unauthorized(reason.to_string())
}

/// Value of cookie `name` from the request's `Cookie` headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Web sessions: `Cookie: <name>=<session>`
pub struct SessionCookieResolver {
    db: Db,
    cookie_name: String,
}

impl SessionCookieResolver {
    pub fn new(db: Db, cookie_name: impl Into<String>) -> Self {
        Self {
            db,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for SessionCookieResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<CallerIdentity> {
        let session = cookie_value(headers, &self.cookie_name).ok_or_else(|| unauthorized("Missing session"))?;
        let account_id = accounts::account_for_session(&self.db, &session)
            .await?
            .ok_or_else(|| unauthorized("Invalid or expired session"))?;
        Ok(CallerIdentity { account_id })
    }
}

/// Mobile clients: `Authorization: Bearer <token>`
pub struct BearerTokenResolver {
    db: Db,
}

impl BearerTokenResolver {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityResolver for BearerTokenResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<CallerIdentity> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| unauthorized("Missing bearer token"))?;
        let account_id = accounts::account_for_token(&self.db, token)
            .await?
            .ok_or_else(|| unauthorized("Invalid token"))?;
        Ok(CallerIdentity { account_id })
    }
}

/// First resolver that accepts the request wins
pub struct AnyResolver {
    resolvers: Vec<Arc<dyn IdentityResolver>>,
}

impl AnyResolver {
    pub fn new(resolvers: Vec<Arc<dyn IdentityResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl IdentityResolver for AnyResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<CallerIdentity> {
        for resolver in &self.resolvers {
            match resolver.resolve(headers).await {
                Ok(identity) => return Ok(identity),
                Err(GenieError::Unauthorized(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(unauthorized("No valid credentials"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::migrated_db;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_cookie_value_parsing() {
        let map = headers(&[
            (header::COOKIE, "theme=dark; genie_session=abc123"),
            (header::COOKIE, "other=1"),
        ]);
        assert_eq!(cookie_value(&map, "genie_session").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&map, "other").as_deref(), Some("1"));
        assert_eq!(cookie_value(&map, "missing"), None);
    }

    #[tokio::test]
    async fn test_resolvers() {
        let (db, _tmp) = migrated_db().await;
        let account = accounts::create_account(&db, "a@example.com", None).await.unwrap();
        let token = accounts::issue_api_token(&db, &account.id, None).await.unwrap();
        let session = accounts::create_session(&db, &account.id, 1).await.unwrap();

        let web = SessionCookieResolver::new(db.clone(), "genie_session");
        let mobile = BearerTokenResolver::new(db.clone());

        let cookie = format!("genie_session={}", session);
        let bearer = format!("Bearer {}", token);
        let web_headers = headers(&[(header::COOKIE, cookie.as_str())]);
        let mobile_headers = headers(&[(header::AUTHORIZATION, bearer.as_str())]);

        assert_eq!(web.resolve(&web_headers).await.unwrap().account_id, account.id);
        assert_eq!(mobile.resolve(&mobile_headers).await.unwrap().account_id, account.id);

        // each resolver only understands its own credential
        assert!(matches!(web.resolve(&mobile_headers).await, Err(GenieError::Unauthorized(_))));
        assert!(matches!(mobile.resolve(&web_headers).await, Err(GenieError::Unauthorized(_))));

        let any = AnyResolver::new(vec![Arc::new(web), Arc::new(mobile)]);
        assert!(any.resolve(&web_headers).await.is_ok());
        assert!(any.resolve(&mobile_headers).await.is_ok());
        assert!(matches!(any.resolve(&HeaderMap::new()).await, Err(GenieError::Unauthorized(_))));
    }
}
