use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{GenieError, Result};
use crate::models::Account;

/// Hex SHA-256 of a credential; only digests are persisted
pub fn credential_hash(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

pub async fn create_account(db: &Db, email: &str, page_quota: Option<i64>) -> Result<Account> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(GenieError::InvalidInput(format!("Invalid email: {}", email)));
    }
    if matches!(page_quota, Some(q) if q < 0) {
        return Err(GenieError::InvalidInput("page_quota must not be negative".to_string()));
    }

    let account = Account {
        id: Uuid::new_v4().to_string(),
        email: email.to_lowercase(),
        page_quota,
        created_at: Utc::now().to_rfc3339(),
    };
    let row = account.clone();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO accounts (id, email, page_quota, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![row.id, row.email, row.page_quota, row.created_at],
        )?;
        Ok(())
    })
    .await?;
    Ok(account)
}

pub async fn get_account(db: &Db, account_id: &str) -> Result<Option<Account>> {
    let account_id = account_id.to_string();
    db.with_connection(move |conn| {
        let account = conn
            .query_row(
                "SELECT id, email, page_quota, created_at FROM accounts WHERE id = ?1",
                params![account_id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        page_quota: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    })
    .await
}

pub async fn find_account_by_email(db: &Db, email: &str) -> Result<Option<Account>> {
    let email = email.trim().to_lowercase();
    let id: Option<String> = db
        .with_connection(move |conn| {
            let id = conn
                .query_row("SELECT id FROM accounts WHERE email = ?1", params![email], |row| row.get(0))
                .optional()?;
            Ok(id)
        })
        .await?;
    match id {
        Some(id) => get_account(db, &id).await,
        None => Ok(None),
    }
}

fn random_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Issue a bearer token for the mobile client. The plaintext is returned once.
pub async fn issue_api_token(db: &Db, account_id: &str, label: Option<String>) -> Result<String> {
    let token = format!("ig_{}", random_secret());
    let hash = credential_hash(&token);
    let account_id = account_id.to_string();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO api_tokens (token_hash, account_id, label, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![hash, account_id, label, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
    .await?;
    Ok(token)
}

/// Open a web session valid for `ttl_hours`. The plaintext cookie value is returned once.
pub async fn create_session(db: &Db, account_id: &str, ttl_hours: i64) -> Result<String> {
    if ttl_hours <= 0 {
        return Err(GenieError::InvalidInput("Session lifetime must be positive".to_string()));
    }
    let session = random_secret();
    let hash = credential_hash(&session);
    let account_id = account_id.to_string();
    let now = Utc::now();
    let expires_at = (now + Duration::hours(ttl_hours)).to_rfc3339();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO sessions (session_hash, account_id, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![hash, account_id, expires_at, now.to_rfc3339()],
        )?;
        Ok(())
    })
    .await?;
    Ok(session)
}

pub async fn account_for_token(db: &Db, token: &str) -> Result<Option<String>> {
    let hash = credential_hash(token);
    db.with_connection(move |conn| {
        let id = conn
            .query_row(
                "SELECT account_id FROM api_tokens WHERE token_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    })
    .await
}

/// Account behind an unexpired session
pub async fn account_for_session(db: &Db, session: &str) -> Result<Option<String>> {
    let hash = credential_hash(session);
    let now = Utc::now().to_rfc3339();
    db.with_connection(move |conn| {
        // RFC 3339 timestamps in UTC compare correctly as text
        let id = conn
            .query_row(
                "SELECT account_id FROM sessions WHERE session_hash = ?1 AND expires_at > ?2",
                params![hash, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    })
    .await
}
