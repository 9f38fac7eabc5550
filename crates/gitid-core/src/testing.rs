//! In-memory stand-ins for the external tools, plus a harness that wires a
//! `StateManager` over them with a real credential store and env file.

use crate::config::{Config, Settings};
use crate::environment::{EnvFile, EnvSnapshot, EnvironmentSync};
use crate::error::{GitidError, Result};
use crate::events::{EventSink, MemorySink, Outcome};
use crate::git::GitConfigWriter;
use crate::identity::Identity;
use crate::manager::StateManager;
use crate::planner::StepKind;
use crate::process::{AgentStatus, ProcessAdapter};
use crate::ssh::SshIsolationManager;
use crate::state::{AccountState, GitConfigState, TokenState};
use crate::token::{CredentialStore, Token, TokenStore};
use crate::transaction::Subsystems;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn write_key(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("fake private key {name}\n")).unwrap();
    path
}

// ---------------------------------------------------------------------------
// FakeProcessAdapter
// ---------------------------------------------------------------------------

struct FakeAgent {
    socket: PathBuf,
    keys: Vec<String>,
}

#[derive(Default)]
pub struct FakeProcessAdapter {
    next_pid: AtomicU32,
    agents: Mutex<HashMap<u32, FakeAgent>>,
    pub start_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
    /// Number of upcoming `start` calls that fail to bind.
    pub fail_binds: AtomicUsize,
    pub fail_load: AtomicBool,
    /// Fail loads of this one key only.
    pub fail_load_for: Mutex<Option<PathBuf>>,
    pub load_delay: Mutex<Duration>,
    /// Agents start but their socket never shows up.
    pub never_ready: AtomicBool,
}

impl FakeProcessAdapter {
    pub fn fingerprint_of(&self, key: &Path) -> String {
        format!("fake:{}", key.display())
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.agents.lock().unwrap().contains_key(&pid)
    }

    pub fn running_count(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    /// Someone else ran `ssh-add` against our agent.
    pub fn inject_key(&self, pid: u32, fingerprint: &str) {
        if let Some(agent) = self.agents.lock().unwrap().get_mut(&pid) {
            agent.keys.push(fingerprint.to_string());
        }
    }

    /// The agent died without cleaning up.
    pub fn kill(&self, pid: u32) {
        self.agents.lock().unwrap().remove(&pid);
    }

    pub fn keys_of(&self, pid: u32) -> Vec<String> {
        self.agents
            .lock()
            .unwrap()
            .get(&pid)
            .map(|a| a.keys.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProcessAdapter for FakeProcessAdapter {
    async fn start(&self, socket: &Path) -> Result<u32> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_binds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let parent_missing = socket.parent().is_some_and(|p| !p.is_dir());
        if injected || parent_missing {
            return Err(GitidError::SocketBind {
                path: socket.to_path_buf(),
                reason: "bind: No such file or directory".into(),
            });
        }
        if !self.never_ready.load(Ordering::SeqCst) {
            std::fs::write(socket, b"")?;
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.agents.lock().unwrap().insert(
            pid,
            FakeAgent {
                socket: socket.to_path_buf(),
                keys: Vec::new(),
            },
        );
        Ok(pid)
    }

    async fn wait_ready(&self, socket: &Path) -> Result<()> {
        while !socket.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn load_key(&self, socket: &Path, key: &Path) -> Result<String> {
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let targeted = self.fail_load_for.lock().unwrap().as_deref() == Some(key);
        if targeted || self.fail_load.load(Ordering::SeqCst) {
            return Err(GitidError::KeyLoad {
                path: key.to_path_buf(),
                reason: "incorrect passphrase".into(),
            });
        }
        let fingerprint = self.fingerprint_of(key);
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .values_mut()
            .find(|a| a.socket == socket)
            .ok_or_else(|| GitidError::AgentProcess("connection refused".into()))?;
        agent.keys.push(fingerprint.clone());
        Ok(fingerprint)
    }

    async fn status(&self, socket: &Path, pid: u32) -> Result<AgentStatus> {
        Ok(match self.agents.lock().unwrap().get(&pid) {
            Some(agent) if agent.socket == socket => AgentStatus {
                running: true,
                fingerprints: agent.keys.clone(),
            },
            _ => AgentStatus::default(),
        })
    }

    async fn stop(&self, socket: &Path, pid: u32) -> Result<()> {
        self.agents.lock().unwrap().remove(&pid);
        let _ = std::fs::remove_file(socket);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeGit
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeGit {
    pub config: Mutex<GitConfigState>,
    pub fail_set_user: AtomicBool,
    pub fail_ssh_command: AtomicBool,
    pub fail_restore: AtomicBool,
    pub restores: AtomicUsize,
}

impl FakeGit {
    pub fn with_user(name: &str, email: &str) -> Self {
        let git = Self::default();
        *git.config.lock().unwrap() = GitConfigState {
            user_name: Some(name.into()),
            user_email: Some(email.into()),
            ssh_command: None,
        };
        git
    }

    pub fn current(&self) -> GitConfigState {
        self.config.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitConfigWriter for FakeGit {
    async fn snapshot(&self) -> Result<GitConfigState> {
        Ok(self.current())
    }

    async fn set_user(&self, name: &str, email: &str) -> Result<()> {
        if self.fail_set_user.load(Ordering::SeqCst) {
            return Err(GitidError::GitConfig("could not lock config file".into()));
        }
        let mut config = self.config.lock().unwrap();
        config.user_name = Some(name.into());
        config.user_email = Some(email.into());
        Ok(())
    }

    async fn set_ssh_command(&self, command: &str) -> Result<()> {
        if self.fail_ssh_command.load(Ordering::SeqCst) {
            return Err(GitidError::GitConfig("could not lock config file".into()));
        }
        self.config.lock().unwrap().ssh_command = Some(command.into());
        Ok(())
    }

    async fn restore(&self, state: &GitConfigState) -> Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(GitidError::GitConfig("restore refused".into()));
        }
        *self.config.lock().unwrap() = state.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlakyEnv
// ---------------------------------------------------------------------------

/// Real env file whose sync can be made to fail.
pub struct FlakyEnv {
    pub inner: EnvFile,
    pub fail_sync: AtomicBool,
}

#[async_trait]
impl EnvironmentSync for FlakyEnv {
    async fn sync(&self, state: &AccountState) -> Result<EnvSnapshot> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(GitidError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            )));
        }
        self.inner.sync(state).await
    }

    async fn restore(&self, snapshot: &EnvSnapshot) -> Result<()> {
        self.inner.restore(snapshot).await
    }
}

// ---------------------------------------------------------------------------
// FlakyTokens
// ---------------------------------------------------------------------------

/// Real credential store whose validity updates can be made to fail.
pub struct FlakyTokens {
    pub inner: CredentialStore,
    pub fail_set_validity: AtomicBool,
}

#[async_trait]
impl TokenStore for FlakyTokens {
    async fn store_token(&self, alias: &str, token: Token, bound_username: &str) -> Result<()> {
        self.inner.store_token(alias, token, bound_username).await
    }

    async fn get_token(&self, alias: &str) -> Result<Token> {
        self.inner.get_token(alias).await
    }

    async fn validate_token_isolation(&self, alias: &str, expected_username: &str) -> Result<()> {
        self.inner
            .validate_token_isolation(alias, expected_username)
            .await
    }

    async fn token_state(&self, alias: &str) -> Result<Option<TokenState>> {
        self.inner.token_state(alias).await
    }

    async fn set_validity(
        &self,
        alias: &str,
        valid: bool,
        last_validated: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.fail_set_validity.load(Ordering::SeqCst) {
            return Err(GitidError::Crypto("token record is locked".into()));
        }
        self.inner.set_validity(alias, valid, last_validated).await
    }

    async fn remove_token(&self, alias: &str) -> Result<bool> {
        self.inner.remove_token(alias).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dir: TempDir,
    pub adapter: Arc<FakeProcessAdapter>,
    pub agents: Arc<SshIsolationManager>,
    pub tokens: Arc<FlakyTokens>,
    pub git: Arc<FakeGit>,
    pub env: Arc<FlakyEnv>,
    pub events: Arc<MemorySink>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let agents = Arc::new(SshIsolationManager::new(
            dir.path().join("run"),
            adapter.clone(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));
        Self {
            tokens: Arc::new(FlakyTokens {
                inner: CredentialStore::new(dir.path()),
                fail_set_validity: AtomicBool::new(false),
            }),
            git: Arc::new(FakeGit::with_user("Original", "original@example.com")),
            env: Arc::new(FlakyEnv {
                inner: EnvFile::new(dir.path().join("active.env")),
                fail_sync: AtomicBool::new(false),
            }),
            events: Arc::new(MemorySink::default()),
            config: Config::default(),
            adapter,
            agents,
            dir,
        }
    }

    pub fn add_account(&mut self, alias: &str, username: &str) -> Identity {
        let key = write_key(self.dir.path(), &format!("id_{alias}"));
        let identity = Identity::new(
            alias,
            format!("{alias} dev"),
            format!("{alias}@example.com"),
            key,
            username,
        );
        self.config.add_account(identity.clone()).unwrap();
        identity
    }

    pub fn manager(&self) -> StateManager {
        self.manager_with(Settings::default())
    }

    pub fn manager_with(&self, settings: Settings) -> StateManager {
        let subsystems = Subsystems {
            tokens: self.tokens.clone(),
            agents: self.agents.clone(),
            git: self.git.clone(),
            environment: self.env.clone(),
            require_token: settings.require_token,
        };
        let events: Arc<dyn EventSink> = self.events.clone();
        StateManager::new(Arc::new(self.config.clone()), subsystems, events, &settings)
    }

    /// Steps with `outcome`, in emission order.
    pub fn steps_with(&self, outcome: Outcome) -> Vec<StepKind> {
        self.events
            .events()
            .into_iter()
            .filter(|e| e.outcome == outcome)
            .map(|e| e.operation)
            .collect()
    }
}
