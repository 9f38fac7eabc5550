//! Encrypted per-account token storage.
//!
//! Layout:
//!   <home>/store.key   256-bit AES key, generated on first use (0600)
//!   <home>/tokens/
//!     work.enc      nonce ‖ AES-256-GCM(record JSON), aad = alias
//!     personal.enc
//!
//! Every record carries its own alias inside the ciphertext and is sealed
//! with the alias as associated data, so a record copied or renamed onto
//! another account's path fails to open instead of leaking across accounts.

use crate::error::{GitidError, Result};
use crate::state::TokenState;
use crate::{io, paths};
use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zeroize::{Zeroize, Zeroizing};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A platform access token. Wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct Token(Zeroizing<String>);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(***)")
    }
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn store_token(&self, alias: &str, token: Token, bound_username: &str) -> Result<()>;

    async fn get_token(&self, alias: &str) -> Result<Token>;

    /// Fails when the token stored for `alias` is bound to a different
    /// platform account than `expected_username`.
    async fn validate_token_isolation(&self, alias: &str, expected_username: &str) -> Result<()>;

    async fn token_state(&self, alias: &str) -> Result<Option<TokenState>>;

    async fn set_validity(
        &self,
        alias: &str,
        valid: bool,
        last_validated: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn remove_token(&self, alias: &str) -> Result<bool>;
}

#[derive(Serialize, Deserialize)]
struct TokenRecord {
    alias: String,
    token: String,
    username: String,
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    last_validated: Option<DateTime<Utc>>,
    stored_at: DateTime<Utc>,
}

impl Drop for TokenRecord {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

impl TokenRecord {
    fn to_state(&self) -> TokenState {
        TokenState {
            token: Some(Token::new(self.token.clone())),
            valid: self.valid,
            last_validated: self.last_validated,
            username: self.username.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// File-backed [`TokenStore`]. Operations on one alias are serialized;
/// different aliases never contend.
pub struct CredentialStore {
    dir: PathBuf,
    key_path: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(home: &Path) -> Self {
        Self::with_paths(paths::tokens_dir(home), paths::store_key_path(home))
    }

    pub fn with_paths(dir: PathBuf, key_path: PathBuf) -> Self {
        Self {
            dir,
            key_path,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Aliases that currently have a stored token, sorted.
    pub fn list_aliases(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let suffix = format!(".{}", paths::TOKEN_EXT);
        let mut aliases = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(alias) = name.to_string_lossy().strip_suffix(&suffix) {
                aliases.push(alias.to_string());
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    async fn lock(&self, alias: &str) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        paths::validate_alias(alias)?;
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(alias.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self.load_or_create_key()?;
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| GitidError::Crypto(format!("cipher init: {e}")))
    }

    fn load_or_create_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        if !self.key_path.exists() {
            let mut fresh = Zeroizing::new(vec![0u8; KEY_SIZE]);
            OsRng.fill_bytes(&mut fresh);
            // Losing the race is fine: the winner's key is complete on disk.
            io::write_new(&self.key_path, &fresh)?;
        }
        check_owner_only(&self.key_path)?;
        let key = Zeroizing::new(std::fs::read(&self.key_path)?);
        if key.len() != KEY_SIZE {
            return Err(GitidError::Crypto(format!(
                "store key {} is corrupt",
                self.key_path.display()
            )));
        }
        Ok(key)
    }

    fn read_record(&self, alias: &str) -> Result<Option<TokenRecord>> {
        let path = paths::token_path(&self.dir, alias);
        let sealed = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        open(&self.cipher()?, alias, &sealed).map(Some)
    }

    fn write_record(&self, record: &TokenRecord) -> Result<()> {
        let sealed = seal(&self.cipher()?, &record.alias, record)?;
        io::atomic_write(&paths::token_path(&self.dir, &record.alias), &sealed)
    }

    fn require_record(&self, alias: &str) -> Result<TokenRecord> {
        self.read_record(alias)?
            .ok_or_else(|| GitidError::TokenNotFound(alias.to_string()))
    }
}

#[async_trait]
impl TokenStore for CredentialStore {
    async fn store_token(&self, alias: &str, token: Token, bound_username: &str) -> Result<()> {
        if token.is_empty() {
            return Err(GitidError::InvalidToken("token is empty".into()));
        }
        if bound_username.trim().is_empty() {
            return Err(GitidError::InvalidToken(format!(
                "token for '{alias}' must be bound to a platform username"
            )));
        }
        let _guard = self.lock(alias).await?;
        let record = TokenRecord {
            alias: alias.to_string(),
            token: token.expose().to_string(),
            username: bound_username.trim().to_string(),
            valid: false,
            last_validated: None,
            stored_at: Utc::now(),
        };
        self.write_record(&record)?;
        tracing::debug!(alias, username = %record.username, "token stored");
        Ok(())
    }

    async fn get_token(&self, alias: &str) -> Result<Token> {
        let _guard = self.lock(alias).await?;
        let record = self.require_record(alias)?;
        Ok(Token::new(record.token.clone()))
    }

    async fn validate_token_isolation(&self, alias: &str, expected_username: &str) -> Result<()> {
        let _guard = self.lock(alias).await?;
        let record = self.require_record(alias)?;
        if !record.username.eq_ignore_ascii_case(expected_username.trim()) {
            return Err(GitidError::TokenUsernameMismatch {
                alias: alias.to_string(),
                bound: record.username.clone(),
                expected: expected_username.to_string(),
            });
        }
        Ok(())
    }

    async fn token_state(&self, alias: &str) -> Result<Option<TokenState>> {
        let _guard = self.lock(alias).await?;
        Ok(self.read_record(alias)?.map(|r| r.to_state()))
    }

    async fn set_validity(
        &self,
        alias: &str,
        valid: bool,
        last_validated: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let _guard = self.lock(alias).await?;
        let mut record = self.require_record(alias)?;
        record.valid = valid;
        record.last_validated = last_validated;
        self.write_record(&record)
    }

    async fn remove_token(&self, alias: &str) -> Result<bool> {
        let _guard = self.lock(alias).await?;
        io::remove_if_exists(&paths::token_path(&self.dir, alias))
    }
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

fn seal(cipher: &Aes256Gcm, alias: &str, record: &TokenRecord) -> Result<Vec<u8>> {
    let mut json = Zeroizing::new(serde_json::to_vec(record)?);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: json.as_slice(),
                aad: alias.as_bytes(),
            },
        )
        .map_err(|e| GitidError::Crypto(format!("encryption failed: {e}")))?;
    json.zeroize();

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(cipher: &Aes256Gcm, alias: &str, sealed: &[u8]) -> Result<TokenRecord> {
    if sealed.len() <= NONCE_SIZE {
        return Err(GitidError::Crypto(format!(
            "token record for '{alias}' is truncated"
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| {
                GitidError::Crypto(format!("token record for '{alias}' failed authentication"))
            })?,
    );
    let record: TokenRecord = serde_json::from_slice(&plaintext)?;
    if record.alias != alias {
        return Err(GitidError::TokenOwnerMismatch {
            requested: alias.to_string(),
            found: record.alias.clone(),
        });
    }
    Ok(record)
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(GitidError::Crypto(format!(
            "store key {} is readable by other users (mode {:o}); run chmod 600",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
