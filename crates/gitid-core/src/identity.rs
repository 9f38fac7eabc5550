use crate::error::{GitidError, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A named developer persona: who commits, which key signs in, which
/// platform account its token belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub alias: String,
    pub name: String,
    pub email: String,
    pub ssh_key: PathBuf,
    #[serde(default)]
    pub platform_username: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(
        alias: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        ssh_key: impl Into<PathBuf>,
        platform_username: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            email: email.into(),
            ssh_key: ssh_key.into(),
            platform_username: platform_username.into(),
            created_at: Utc::now(),
            last_used: None,
        }
    }

    /// Structural checks only; the key file is checked by the ssh step.
    pub fn validate(&self) -> Result<()> {
        paths::validate_alias(&self.alias)?;
        if self.name.trim().is_empty() {
            return Err(self.invalid("name is empty"));
        }
        if !self.email.contains('@') {
            return Err(self.invalid(&format!("'{}' is not an email address", self.email)));
        }
        if self.ssh_key.as_os_str().is_empty() {
            return Err(self.invalid("ssh key path is empty"));
        }
        Ok(())
    }

    pub fn key_path(&self) -> PathBuf {
        paths::expand_tilde(&self.ssh_key)
    }

    /// `core.sshCommand` pinning this identity's key and agent socket.
    pub fn git_ssh_command(&self, socket: &Path) -> String {
        format!(
            "ssh -i {} -o IdentitiesOnly=yes -o IdentityAgent={}",
            shell_quote(&self.key_path().to_string_lossy()),
            shell_quote(&socket.to_string_lossy()),
        )
    }

    fn invalid(&self, reason: &str) -> GitidError {
        GitidError::InvalidIdentity {
            alias: self.alias.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Read-only lookup of identities, implemented by the config layer.
pub trait IdentitySource: Send + Sync {
    fn identity(&self, alias: &str) -> Result<Identity>;
}

/// Single-quote `s` for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
