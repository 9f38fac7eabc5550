use crate::error::Result;
use crate::identity::Identity;
use crate::token::Token;
use crate::{io, paths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Per-subsystem state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshAgentState {
    pub socket_path: PathBuf,
    pub pid: Option<u32>,
    #[serde(default)]
    pub fingerprints: Vec<String>,
    /// True only while the agent was started for this account alone and
    /// holds nothing but the account's key.
    pub isolated: bool,
}

/// Values of `user.name`, `user.email` and `core.sshCommand`; `None` means unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitConfigState {
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub ssh_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenState {
    #[serde(skip)]
    pub token: Option<Token>,
    pub valid: bool,
    pub last_validated: Option<DateTime<Utc>>,
    pub username: String,
}

// ---------------------------------------------------------------------------
// AccountState
// ---------------------------------------------------------------------------

/// Snapshot of everything a switch touches. Replaced whole, never edited in
/// place once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub account: Identity,
    pub ssh: SshAgentState,
    pub git: GitConfigState,
    pub token: TokenState,
    pub timestamp: DateTime<Utc>,
}

impl AccountState {
    pub fn alias(&self) -> &str {
        &self.account.alias
    }
}

// ---------------------------------------------------------------------------
// CurrentRecord
// ---------------------------------------------------------------------------

/// Last successful switch, persisted so later invocations can report status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentRecord {
    pub alias: String,
    pub transition_id: Uuid,
    pub socket_path: PathBuf,
    pub switched_at: DateTime<Utc>,
}

impl CurrentRecord {
    pub fn from_state(state: &AccountState, transition_id: Uuid) -> Self {
        Self {
            alias: state.account.alias.clone(),
            transition_id,
            socket_path: state.ssh.socket_path.clone(),
            switched_at: state.timestamp,
        }
    }

    pub fn load(home: &Path) -> Result<Option<Self>> {
        match io::read_optional(&paths::current_path(home))? {
            Some(data) => Ok(Some(serde_yaml::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::current_path(home), data.as_bytes())
    }
}
