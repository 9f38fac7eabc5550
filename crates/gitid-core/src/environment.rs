use crate::error::Result;
use crate::identity::shell_quote;
use crate::io;
use crate::state::AccountState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What the environment file held before a sync, so it can be put back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub path: PathBuf,
    pub previous: Option<String>,
}

#[async_trait]
pub trait EnvironmentSync: Send + Sync {
    async fn sync(&self, state: &AccountState) -> Result<EnvSnapshot>;

    async fn restore(&self, snapshot: &EnvSnapshot) -> Result<()>;
}

/// Sourceable shell file with the active identity's exports.
///
/// Secrets never go in here; only the agent socket and git identity.
#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn render(state: &AccountState) -> String {
        let account = &state.account;
        let mut vars = vec![
            ("GITID_ACCOUNT", account.alias.clone()),
            ("SSH_AUTH_SOCK", state.ssh.socket_path.to_string_lossy().into_owned()),
        ];
        if let Some(cmd) = &state.git.ssh_command {
            vars.push(("GIT_SSH_COMMAND", cmd.clone()));
        }
        vars.extend([
            ("GIT_AUTHOR_NAME", account.name.clone()),
            ("GIT_AUTHOR_EMAIL", account.email.clone()),
            ("GIT_COMMITTER_NAME", account.name.clone()),
            ("GIT_COMMITTER_EMAIL", account.email.clone()),
        ]);

        let mut out = format!("# gitid: {}\n", account.alias);
        for (key, value) in vars {
            out.push_str(&format!("export {key}={}\n", shell_quote(&value)));
        }
        out
    }
}

#[async_trait]
impl EnvironmentSync for EnvFile {
    async fn sync(&self, state: &AccountState) -> Result<EnvSnapshot> {
        let previous = io::read_optional(&self.path)?;
        io::atomic_write(&self.path, Self::render(state).as_bytes())?;
        Ok(EnvSnapshot {
            path: self.path.clone(),
            previous,
        })
    }

    async fn restore(&self, snapshot: &EnvSnapshot) -> Result<()> {
        match &snapshot.previous {
            Some(data) => io::atomic_write(&snapshot.path, data.as_bytes()),
            None => io::remove_if_exists(&snapshot.path).map(|_| ()),
        }
    }
}
