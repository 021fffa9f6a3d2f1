/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Secrets resolution for the broker. The config file names secrets by key
//! (`postgres.password_key`, `bsp.api_key_name`, per-tenant
//! `bsp_api_key_name`/`shopify_secret_key`); providers resolve those names to
//! values. The `env` provider (deployment default) reads the process
//! environment. The `sops` provider decrypts an age-encrypted JSON document
//! holding the same flat `KEY: value` namespace, so a config works unchanged
//! under either provider.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Errors from secrets operations.
#[derive(thiserror::Error, Debug)]
pub enum SecretsError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Trait for secrets providers.
#[async_trait::async_trait]
pub trait SecretsProvider: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<String, SecretsError>;
    async fn list(&self) -> Result<Vec<String>, SecretsError>;
}

// ---------------------------------------------------------------------------
// Env provider
// ---------------------------------------------------------------------------

/// Process-environment provider. Keys map 1:1 onto env var names
/// (`BSP_API_KEY`, `PG_PASSWORD`, `SHOPIFY_WEBHOOK_SECRET`, …).
#[derive(Debug)]
pub struct EnvProvider;

#[async_trait::async_trait]
impl SecretsProvider for EnvProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        match std::env::var(key) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(SecretsError::NotFound(key.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        // Enumerating the whole environment would leak unrelated variables;
        // the env provider only answers point lookups.
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Sops provider
// ---------------------------------------------------------------------------

/// The whole secrets document, decrypted once and reused until the TTL
/// expires. One `sops` subprocess per window, however many tenants and keys
/// the broker resolves — startup touches every tenant's BSP key in a burst.
#[derive(Debug)]
struct CachedDocument {
    values: HashMap<String, String>,
    loaded_at: Instant,
}

/// SOPS-backed provider for development: an age-encrypted JSON file whose
/// top-level entries are flat `KEY: value` pairs mirroring the env namespace.
#[derive(Debug)]
pub struct SopsProvider {
    secrets_file: PathBuf,
    identity: PathBuf,
    document: RwLock<Option<CachedDocument>>,
    ttl: Duration,
    decrypt_timeout: Duration,
}

impl SopsProvider {
    #[must_use]
    pub fn new(secrets_file: PathBuf, identity: PathBuf) -> Self {
        Self {
            secrets_file,
            identity,
            document: RwLock::new(None),
            ttl: Duration::from_secs(300),
            decrypt_timeout: Duration::from_secs(5),
        }
    }

    /// Decrypt the whole document via the `sops` binary.
    async fn decrypt_document(&self) -> Result<HashMap<String, String>, SecretsError> {
        let output = tokio::time::timeout(
            self.decrypt_timeout,
            tokio::process::Command::new("sops")
                .arg("--decrypt")
                .arg("--output-type")
                .arg("json")
                .arg(&self.secrets_file)
                .env("SOPS_AGE_KEY_FILE", &self.identity)
                .output(),
        )
        .await
        .map_err(|_| {
            SecretsError::Unavailable(format!(
                "sops decryption of {} timed out",
                self.secrets_file.display()
            ))
        })?
        .map_err(|e| SecretsError::Unavailable(format!("cannot run sops: {e}")))?;

        if !output.status.success() {
            return Err(SecretsError::Decrypt(format!(
                "sops exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_document(&output.stdout)
    }

    /// Return the cached document, re-decrypting when stale or absent.
    async fn document(&self) -> Result<HashMap<String, String>, SecretsError> {
        {
            let guard = self.document.read().await;
            if let Some(ref doc) = *guard {
                if doc.loaded_at.elapsed() < self.ttl {
                    return Ok(doc.values.clone());
                }
            }
        }

        let values = self.decrypt_document().await?;
        let mut guard = self.document.write().await;
        *guard = Some(CachedDocument {
            values: values.clone(),
            loaded_at: Instant::now(),
        });
        Ok(values)
    }
}

/// Parse a decrypted secrets document: a JSON object whose string-valued
/// top-level entries become the secret namespace. Non-string entries (sops
/// metadata, nested structures) are ignored rather than rejected, so a file
/// can carry both secrets and bookkeeping.
fn parse_document(bytes: &[u8]) -> Result<HashMap<String, String>, SecretsError> {
    let json: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| SecretsError::Decrypt(format!("secrets document is not JSON: {e}")))?;
    let Some(object) = json.as_object() else {
        return Err(SecretsError::Decrypt(
            "secrets document must be a JSON object of KEY: value pairs".to_string(),
        ));
    };

    let mut values = HashMap::with_capacity(object.len());
    for (key, value) in object {
        if key == "sops" {
            continue; // encryption metadata block
        }
        if let Some(s) = value.as_str() {
            values.insert(key.clone(), s.to_string());
        }
    }
    Ok(values)
}

#[async_trait::async_trait]
impl SecretsProvider for SopsProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        self.document()
            .await?
            .remove(key)
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        let mut keys: Vec<String> = self.document().await?.into_keys().collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Create a secrets provider based on the provider name.
///
/// # Errors
///
/// Returns `SecretsError` if the provider name is unknown or a required
/// parameter is missing.
pub fn create_provider(
    provider: &str,
    sops_file: Option<&str>,
    age_identity: Option<&str>,
) -> Result<Box<dyn SecretsProvider>, SecretsError> {
    match provider {
        "env" => Ok(Box::new(EnvProvider)),
        "sops" => {
            let file = sops_file
                .ok_or_else(|| SecretsError::Unavailable("sops_file not configured".to_string()))?;
            let identity = age_identity.ok_or_else(|| {
                SecretsError::Unavailable("age_identity not configured".to_string())
            })?;
            Ok(Box::new(SopsProvider::new(
                expand_tilde(file),
                expand_tilde(identity),
            )))
        }
        other => Err(SecretsError::Unavailable(format!(
            "unknown provider: {other}"
        ))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
