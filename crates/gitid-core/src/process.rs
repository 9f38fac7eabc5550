use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{GitidError, Result};

// ─── ProcessAdapter ───────────────────────────────────────────────────────

/// What a live agent reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStatus {
    pub running: bool,
    pub fingerprints: Vec<String>,
}

/// Narrow contract over the external agent and key-loading tools.
///
/// The isolation manager only ever talks to agents through this trait, which
/// keeps shell details out of the switching logic and lets tests drive it
/// with an in-memory fake.
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    /// Start an agent listening on `socket` and return its pid. The agent
    /// may not accept connections yet; see [`wait_ready`](Self::wait_ready).
    async fn start(&self, socket: &Path) -> Result<u32>;

    /// Resolve once `socket` accepts connections. Callers bound this wait.
    async fn wait_ready(&self, socket: &Path) -> Result<()>;

    /// Load `key` into the agent behind `socket`; returns the key's fingerprint.
    async fn load_key(&self, socket: &Path, key: &Path) -> Result<String>;

    async fn status(&self, socket: &Path, pid: u32) -> Result<AgentStatus>;

    async fn stop(&self, socket: &Path, pid: u32) -> Result<()>;
}

// ─── OpenSshAdapter ───────────────────────────────────────────────────────

/// Drives the OpenSSH `ssh-agent`, `ssh-add` and `ssh-keygen` binaries.
///
/// Agents are started daemonized (`ssh-agent -s -a <socket>`) so they
/// outlive the process that created them; `stop` kills them with
/// `ssh-agent -k`.
#[derive(Debug, Clone)]
pub struct OpenSshAdapter {
    agent: PathBuf,
    add: PathBuf,
    keygen: PathBuf,
}

impl OpenSshAdapter {
    /// Find the OpenSSH tools on `PATH`.
    pub fn locate() -> Result<Self> {
        Ok(Self {
            agent: find_tool("ssh-agent")?,
            add: find_tool("ssh-add")?,
            keygen: find_tool("ssh-keygen")?,
        })
    }

    pub fn with_binaries(agent: PathBuf, add: PathBuf, keygen: PathBuf) -> Self {
        Self { agent, add, keygen }
    }

    async fn fingerprint(&self, key: &Path) -> Result<String> {
        let output = Command::new(&self.keygen)
            .args(["-l", "-E", "sha256", "-f"])
            .arg(key)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(GitidError::KeyLoad {
                path: key.to_path_buf(),
                reason: failure_text("ssh-keygen", &output),
            });
        }
        parse_fingerprints(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .next()
            .ok_or_else(|| GitidError::KeyLoad {
                path: key.to_path_buf(),
                reason: "ssh-keygen printed no fingerprint".into(),
            })
    }

    fn add_command(&self, socket: &Path) -> Command {
        let mut cmd = Command::new(&self.add);
        cmd.env("SSH_AUTH_SOCK", socket)
            .env("SSH_ASKPASS_REQUIRE", "never")
            .env_remove("SSH_AGENT_PID")
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl ProcessAdapter for OpenSshAdapter {
    async fn start(&self, socket: &Path) -> Result<u32> {
        let output = Command::new(&self.agent)
            .arg("-s")
            .arg("-a")
            .arg(socket)
            .env_remove("SSH_AUTH_SOCK")
            .env_remove("SSH_AGENT_PID")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let reason = failure_text("ssh-agent", &output);
            return Err(if is_bind_failure(&reason) {
                GitidError::SocketBind {
                    path: socket.to_path_buf(),
                    reason,
                }
            } else {
                GitidError::AgentProcess(reason)
            });
        }

        let pid = parse_agent_pid(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            GitidError::AgentProcess("could not read SSH_AGENT_PID from ssh-agent output".into())
        })?;
        tracing::debug!(pid, socket = %socket.display(), "ssh-agent started");
        Ok(pid)
    }

    async fn wait_ready(&self, socket: &Path) -> Result<()> {
        while !socket.exists() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    async fn load_key(&self, socket: &Path, key: &Path) -> Result<String> {
        let fingerprint = self.fingerprint(key).await?;
        let output = self.add_command(socket).arg(key).output().await?;
        if !output.status.success() {
            return Err(GitidError::KeyLoad {
                path: key.to_path_buf(),
                reason: failure_text("ssh-add", &output),
            });
        }
        Ok(fingerprint)
    }

    async fn status(&self, socket: &Path, _pid: u32) -> Result<AgentStatus> {
        let output = self
            .add_command(socket)
            .args(["-l", "-E", "sha256"])
            .output()
            .await?;
        // ssh-add -l: 0 = identities listed, 1 = agent has none, 2 = no agent.
        Ok(match output.status.code() {
            Some(0) => AgentStatus {
                running: true,
                fingerprints: parse_fingerprints(&String::from_utf8_lossy(&output.stdout)),
            },
            Some(1) => AgentStatus {
                running: true,
                fingerprints: vec![],
            },
            _ => AgentStatus::default(),
        })
    }

    async fn stop(&self, socket: &Path, pid: u32) -> Result<()> {
        let output = Command::new(&self.agent)
            .arg("-k")
            .env("SSH_AGENT_PID", pid.to_string())
            .env("SSH_AUTH_SOCK", socket)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() && socket.exists() {
            return Err(GitidError::AgentProcess(failure_text("ssh-agent -k", &output)));
        }
        tracing::debug!(pid, socket = %socket.display(), "ssh-agent stopped");
        Ok(())
    }
}

fn find_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| GitidError::ToolNotInstalled(name.to_string()))
}

fn failure_text(tool: &str, output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("{tool} exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

fn is_bind_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("bind") || lower.contains("no such file") || lower.contains("address already")
}

/// Extract the pid from `ssh-agent -s` output (`SSH_AGENT_PID=1234; export ...`).
fn parse_agent_pid(stdout: &str) -> Option<u32> {
    stdout
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("SSH_AGENT_PID="))
        .and_then(|pid| pid.trim().parse().ok())
}

/// Second column of `ssh-keygen -l` / `ssh-add -l` lines: `256 SHA256:... comment (ED25519)`.
fn parse_fingerprints(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|fp| fp.contains(':'))
        .map(str::to_string)
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────
