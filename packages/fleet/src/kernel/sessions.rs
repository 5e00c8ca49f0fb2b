//! Encrypted browser-session persistence.
//!
//! Cookies and origin storage are sealed into AES-256-GCM envelopes keyed
//! by `(user_id, domain)`. An envelope that fails authentication is
//! treated as garbage: the row is deleted and the caller sees a miss, so a
//! key rotation or corruption never feeds stale state into a browser.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::warn;
use url::Url;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("envelope is truncated or malformed")]
    Malformed,
    #[error("envelope was sealed with key '{0}', not the configured key")]
    KeyMismatch(String),
    #[error("decryption failed: envelope integrity compromised or wrong key")]
    Decryption,
}

/// Symmetric envelope engine. One key per deployment, identified by
/// `key_id` so rotations can tell old envelopes apart.
pub struct SessionCrypto {
    cipher: Aes256Gcm,
    key_id: String,
}

impl SessionCrypto {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_b64: &str, key_id: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_b64)
            .context("FLEET_ENCRYPTION_KEY must be valid base64")?;
        anyhow::ensure!(
            key_bytes.len() == 32,
            "FLEET_ENCRYPTION_KEY must decode to exactly 32 bytes"
        );
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            key_id: key_id.to_string(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Seal plaintext into `key_id_len || key_id || nonce || ciphertext+tag`.
    ///
    /// A fresh random nonce per call means two seals of identical plaintext
    /// never produce identical envelopes.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EnvelopeError::Decryption)
            .context("failed to seal session envelope")?;

        let key_id = self.key_id.as_bytes();
        let mut envelope = Vec::with_capacity(1 + key_id.len() + NONCE_LEN + ciphertext.len());
        envelope.push(key_id.len() as u8);
        envelope.extend_from_slice(key_id);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope. Any tampering fails the GCM tag check.
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let (&key_id_len, rest) = envelope.split_first().ok_or(EnvelopeError::Malformed)?;
        let key_id_len = key_id_len as usize;
        if rest.len() < key_id_len + NONCE_LEN {
            return Err(EnvelopeError::Malformed);
        }

        let (key_id, rest) = rest.split_at(key_id_len);
        let key_id = std::str::from_utf8(key_id).map_err(|_| EnvelopeError::Malformed)?;
        if key_id != self.key_id {
            return Err(EnvelopeError::KeyMismatch(key_id.to_string()));
        }

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EnvelopeError::Decryption)
    }
}

#[derive(FromRow, Debug)]
struct SessionRow {
    session_data: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// Store for per-(user, domain) browser state.
pub struct SessionStore {
    pool: PgPool,
    crypto: SessionCrypto,
    ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(pool: PgPool, crypto: SessionCrypto, ttl: std::time::Duration) -> Self {
        Self {
            pool,
            crypto,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7)),
        }
    }

    fn domain_of(url: &str) -> Result<String> {
        let parsed = Url::parse(url).with_context(|| format!("invalid session URL: {url}"))?;
        let host = parsed
            .host_str()
            .with_context(|| format!("session URL has no host: {url}"))?;
        Ok(host.to_lowercase())
    }

    /// Encrypt and upsert the storage state for the URL's domain.
    pub async fn save(
        &self,
        user_id: &str,
        url: &str,
        storage_state: &serde_json::Value,
    ) -> Result<()> {
        let domain = Self::domain_of(url)?;
        let plaintext = serde_json::to_vec(storage_state)?;
        let envelope = self.crypto.seal(&plaintext)?;
        let expires_at = Utc::now() + self.ttl;

        sqlx::query(
            r#"
            INSERT INTO browser_sessions
                (user_id, domain, session_data, encryption_key_id, expires_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (user_id, domain) DO UPDATE SET
                session_data = EXCLUDED.session_data,
                encryption_key_id = EXCLUDED.encryption_key_id,
                expires_at = EXCLUDED.expires_at,
                last_used_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(&domain)
        .bind(&envelope)
        .bind(self.crypto.key_id())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the storage state for the URL's domain.
    ///
    /// Expired or undecryptable rows are deleted and reported as a miss.
    pub async fn load(&self, user_id: &str, url: &str) -> Result<Option<serde_json::Value>> {
        let domain = Self::domain_of(url)?;

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_data, expires_at
            FROM browser_sessions
            WHERE user_id = $1 AND domain = $2
            "#,
        )
        .bind(user_id)
        .bind(&domain)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if row.expires_at < Utc::now() {
            self.delete(user_id, &domain).await?;
            return Ok(None);
        }

        let plaintext = match self.crypto.open(&row.session_data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(user_id, domain, error = %e, "dropping undecryptable browser session");
                self.delete(user_id, &domain).await?;
                return Ok(None);
            }
        };

        let state: serde_json::Value = match serde_json::from_slice(&plaintext) {
            Ok(state) => state,
            Err(e) => {
                warn!(user_id, domain, error = %e, "dropping unparseable browser session");
                self.delete(user_id, &domain).await?;
                return Ok(None);
            }
        };

        sqlx::query(
            "UPDATE browser_sessions SET last_used_at = NOW() WHERE user_id = $1 AND domain = $2",
        )
        .bind(user_id)
        .bind(&domain)
        .execute(&self.pool)
        .await?;

        Ok(Some(state))
    }

    /// Delete one domain's session, or all of a user's sessions.
    pub async fn clear(&self, user_id: &str, domain: Option<&str>) -> Result<u64> {
        let deleted = match domain {
            Some(domain) => {
                sqlx::query("DELETE FROM browser_sessions WHERE user_id = $1 AND domain = $2")
                    .bind(user_id)
                    .bind(domain)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM browser_sessions WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(deleted.rows_affected())
    }

    /// Delete expired rows; returns the count.
    pub async fn sweep(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM browser_sessions WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn delete(&self, user_id: &str, domain: &str) -> Result<()> {
        sqlx::query("DELETE FROM browser_sessions WHERE user_id = $1 AND domain = $2")
            .bind(user_id)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
