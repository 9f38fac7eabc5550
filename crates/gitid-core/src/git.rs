use crate::config::GitScope;
use crate::error::{GitidError, Result};
use crate::state::GitConfigState;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

const USER_NAME: &str = "user.name";
const USER_EMAIL: &str = "user.email";
const SSH_COMMAND: &str = "core.sshCommand";

/// Reads and writes the three git settings a switch owns.
#[async_trait]
pub trait GitConfigWriter: Send + Sync {
    async fn snapshot(&self) -> Result<GitConfigState>;

    async fn set_user(&self, name: &str, email: &str) -> Result<()>;

    async fn set_ssh_command(&self, command: &str) -> Result<()>;

    /// Put every key back to `state`, unsetting those that were unset.
    async fn restore(&self, state: &GitConfigState) -> Result<()>;
}

/// `git config` against one scope.
#[derive(Debug, Clone)]
pub struct GitCli {
    bin: PathBuf,
    scope: GitScope,
}

impl GitCli {
    pub fn locate(scope: GitScope) -> Result<Self> {
        let bin = which::which("git").map_err(|_| GitidError::ToolNotInstalled("git".into()))?;
        Ok(Self { bin, scope })
    }

    pub fn with_binary(bin: PathBuf, scope: GitScope) -> Self {
        Self { bin, scope }
    }

    pub fn scope(&self) -> &GitScope {
        &self.scope
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        match &self.scope {
            GitScope::Global => {
                cmd.args(["config", "--global"]);
            }
            GitScope::Local { repo } => {
                cmd.arg("-C").arg(repo).args(["config", "--local"]);
            }
            GitScope::File { path } => {
                cmd.args(["config", "--file"]).arg(path);
            }
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let output = self.command().args(["--get", key]).output().await?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            )),
            // exit 1: key is not set
            Some(1) => Ok(None),
            _ => Err(git_error(key, &output.stderr)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let output = self.command().args([key, value]).output().await?;
        if !output.status.success() {
            return Err(git_error(key, &output.stderr));
        }
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        let output = self.command().args(["--unset", key]).output().await?;
        match output.status.code() {
            // exit 5: key was not set
            Some(0) | Some(5) => Ok(()),
            _ => Err(git_error(key, &output.stderr)),
        }
    }

    async fn put(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(v) => self.set(key, v).await,
            None => self.unset(key).await,
        }
    }
}

fn git_error(key: &str, stderr: &[u8]) -> GitidError {
    GitidError::GitConfig(format!(
        "{key}: {}",
        String::from_utf8_lossy(stderr).trim()
    ))
}

#[async_trait]
impl GitConfigWriter for GitCli {
    async fn snapshot(&self) -> Result<GitConfigState> {
        Ok(GitConfigState {
            user_name: self.get(USER_NAME).await?,
            user_email: self.get(USER_EMAIL).await?,
            ssh_command: self.get(SSH_COMMAND).await?,
        })
    }

    async fn set_user(&self, name: &str, email: &str) -> Result<()> {
        self.set(USER_NAME, name).await?;
        self.set(USER_EMAIL, email).await
    }

    async fn set_ssh_command(&self, command: &str) -> Result<()> {
        self.set(SSH_COMMAND, command).await
    }

    async fn restore(&self, state: &GitConfigState) -> Result<()> {
        self.put(USER_NAME, state.user_name.as_deref()).await?;
        self.put(USER_EMAIL, state.user_email.as_deref()).await?;
        self.put(SSH_COMMAND, state.ssh_command.as_deref()).await
    }
}
