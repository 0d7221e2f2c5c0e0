//! Registration, token issuance, and tenant isolation.
//!
//! A tenant registers with a provider API key; the key is encrypted with the
//! process-wide AES-256-GCM key and stored under a fresh `user_id`, and a
//! signed bearer token binding that id is returned. Every subsequent request
//! verifies the token into a [`TenantContext`], which is the only way to
//! reach a tenant's store.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{Context, Result};
use base64::Engine as _;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{ServiceError, ServiceResult};

/// JWT claims: the tenant id and expiry.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Verified tenant identity, derived from a bearer token. Every engine
/// operation receives one; the store rejects requests whose `user_id` does
/// not match the tables it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub user_id: String,
}

/// Process-wide key material, initialized once at startup.
#[derive(Debug)]
pub struct AuthKeys {
    jwt_secret: Vec<u8>,
    encryption_key: [u8; 32],
    expiration_days: i64,
}

impl AuthKeys {
    /// Build from config. The JWT secret and the base64-encoded 32-byte
    /// encryption key are both required.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        if config.jwt_secret_key.is_empty() {
            anyhow::bail!("JWT_SECRET_KEY is required");
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&config.encryption_key)
            .context("ENCRYPTION_KEY must be base64")?;
        let encryption_key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY must decode to exactly 32 bytes"))?;

        Ok(Self {
            jwt_secret: config.jwt_secret_key.clone().into_bytes(),
            encryption_key,
            expiration_days: config.jwt_expiration_days,
        })
    }

    /// Issue a signed bearer token for a tenant.
    pub fn issue_token(&self, user_id: &str) -> Result<String> {
        let exp = chrono::Utc::now() + chrono::Duration::days(self.expiration_days);
        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .context("failed to sign token")
    }

    /// Verify a bearer token's signature and expiry.
    pub fn verify_token(&self, token: &str) -> ServiceResult<TenantContext> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &Validation::default(),
        )
        .map_err(|e| ServiceError::Auth(e.to_string()))?;

        Ok(TenantContext {
            user_id: data.claims.sub,
        })
    }

    /// Issue a fresh token for an already-valid token (sliding expiry).
    pub fn refresh_token(&self, token: &str) -> ServiceResult<String> {
        let ctx = self.verify_token(token)?;
        self.issue_token(&ctx.user_id)
            .map_err(|e| ServiceError::Auth(e.to_string()))
    }

    /// Encrypt a provider API key: base64(nonce || ciphertext+tag).
    pub fn encrypt_api_key(&self, api_key: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| anyhow::anyhow!("AEAD key must be 32 bytes"))?;

        let mut nonce_bytes = [0u8; 12];
        use rand::Rng;
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, api_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut packed = Vec::with_capacity(12 + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(packed))
    }

    /// Decrypt a stored provider API key.
    pub fn decrypt_api_key(&self, stored: &str) -> Result<String> {
        let packed = base64::engine::general_purpose::STANDARD
            .decode(stored)
            .context("stored credential is not base64")?;
        if packed.len() < 12 + 16 {
            anyhow::bail!("stored credential too short");
        }

        let (nonce_bytes, ciphertext) = packed.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| anyhow::anyhow!("AEAD key must be 32 bytes"))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or corrupted data"))?;

        String::from_utf8(plaintext).context("decrypted credential is not UTF-8")
    }
}

/// Create a tenant: encrypt and store the credential, return the new id.
pub fn register_user(
    conn: &Connection,
    keys: &AuthKeys,
    provider_api_key: &str,
    embedding_dim: usize,
) -> Result<String> {
    let user_id = uuid::Uuid::now_v7().to_string();
    let encrypted = keys.encrypt_api_key(provider_api_key)?;
    let now = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO users (user_id, api_key_enc, embedding_dim, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![user_id, encrypted, embedding_dim as i64, now],
    )?;

    tracing::info!(user = %user_id, "tenant registered");
    Ok(user_id)
}

/// Look up and decrypt a tenant's provider credential.
pub fn get_user_api_key(
    conn: &Connection,
    keys: &AuthKeys,
    user_id: &str,
) -> ServiceResult<String> {
    let encrypted: Option<String> = conn
        .query_row(
            "SELECT api_key_enc FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    let encrypted =
        encrypted.ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))?;
    keys.decrypt_api_key(&encrypted)
        .map_err(|e| ServiceError::Store(e.to_string()))
}

/// A tenant's declared embedding dimension (write-once at registration).
pub fn get_user_embedding_dim(conn: &Connection, user_id: &str) -> ServiceResult<usize> {
    let dim: Option<i64> = conn
        .query_row(
            "SELECT embedding_dim FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    dim.map(|d| d as usize)
        .ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))
}
