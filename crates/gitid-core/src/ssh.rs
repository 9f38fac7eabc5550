//! Per-account SSH agent isolation.
//!
//! Every account gets its own agent process and control socket at
//! `<socket_dir>/<alias>.sock`. An agent only ever holds its account's key;
//! anything else found in it is treated as a violation and the agent is
//! rebuilt. Switching to one account never touches another account's agent.
//!
//! Live agents are recorded next to their sockets as `<alias>.agent.yaml`
//! so a later process can adopt them with [`SshIsolationManager::restore_agents`].

use crate::error::{GitidError, Result};
use crate::process::ProcessAdapter;
use crate::state::SshAgentState;
use crate::{io, paths};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentHandle {
    pub alias: String,
    pub socket_path: PathBuf,
    pub pid: u32,
    pub key_path: PathBuf,
    /// Fingerprint of `key_path`; the only key the agent may hold.
    pub key_fingerprint: String,
    pub fingerprints: Vec<String>,
    pub isolated: bool,
    pub started_at: DateTime<Utc>,
}

impl AgentHandle {
    pub fn to_state(&self) -> SshAgentState {
        SshAgentState {
            socket_path: self.socket_path.clone(),
            pid: Some(self.pid),
            fingerprints: self.fingerprints.clone(),
            isolated: self.isolated,
        }
    }
}

/// How a switch obtained its agent; drives what rollback has to undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchOutcome {
    /// The live agent already held this key; nothing was started.
    Reused,
    /// No agent existed for the account; a new one was started.
    Started,
    /// An agent existed with a different key and was replaced.
    Restarted { previous_key: PathBuf },
}

#[derive(Debug, Clone)]
pub struct AgentSwitch {
    pub handle: AgentHandle,
    pub outcome: SwitchOutcome,
}

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AgentManager: Send + Sync {
    /// Ensure `alias` has a live, isolated agent holding exactly `key_path`.
    async fn switch_to_account(
        &self,
        alias: &str,
        key_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentSwitch>;

    async fn get_account_agent(&self, alias: &str) -> Result<AgentHandle>;

    async fn list_active_agents(&self) -> Vec<AgentHandle>;

    /// Stop the agent for `alias`. Returns false if there was none.
    async fn cleanup_agent(&self, alias: &str) -> Result<bool>;

    /// Stop every agent; returns how many were stopped.
    async fn cleanup_all_agents(&self) -> Result<usize>;

    fn socket_path(&self, alias: &str) -> PathBuf;
}

// ---------------------------------------------------------------------------
// SshIsolationManager
// ---------------------------------------------------------------------------

type Slot = Arc<AsyncMutex<Option<AgentHandle>>>;

pub struct SshIsolationManager {
    socket_dir: PathBuf,
    adapter: Arc<dyn ProcessAdapter>,
    bind_timeout: Duration,
    key_load_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for SshIsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshIsolationManager")
            .field("socket_dir", &self.socket_dir)
            .finish_non_exhaustive()
    }
}

impl SshIsolationManager {
    pub fn new(
        socket_dir: PathBuf,
        adapter: Arc<dyn ProcessAdapter>,
        bind_timeout: Duration,
        key_load_timeout: Duration,
    ) -> Self {
        Self {
            socket_dir,
            adapter,
            bind_timeout,
            key_load_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Adopt agents recorded by earlier processes.
    ///
    /// Records whose agent is gone, or whose agent holds anything other than
    /// the recorded key, are removed along with their sockets. Returns the
    /// number of agents adopted.
    pub async fn restore_agents(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.socket_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(paths::AGENT_RECORD_SUFFIX));
            if is_record {
                records.push(path);
            }
        }

        let mut adopted = 0;
        for path in records {
            let handle: AgentHandle = match io::read_optional(&path)?
                .map(|data| serde_yaml::from_str::<AgentHandle>(&data))
                .transpose()
            {
                Ok(Some(h)) => h,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), "dropping unreadable agent record: {e}");
                    io::remove_if_exists(&path)?;
                    continue;
                }
            };

            let slot = self.slot(&handle.alias);
            let mut guard = slot.lock().await;
            if guard.is_some() {
                continue;
            }
            let live = self
                .adapter
                .status(&handle.socket_path, handle.pid)
                .await
                .unwrap_or_default();
            if live.running && is_exclusive(&live.fingerprints, &handle.key_fingerprint) {
                debug!(alias = %handle.alias, pid = handle.pid, "adopted running agent");
                *guard = Some(handle);
                adopted += 1;
            } else {
                warn!(alias = %handle.alias, "removing stale agent record");
                if live.running {
                    self.stop_quietly(&handle.socket_path, handle.pid).await;
                }
                self.forget(&handle.alias)?;
            }
        }
        Ok(adopted)
    }

    fn slot(&self, alias: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(alias.to_string()).or_default())
    }

    fn all_slots(&self) -> Vec<Slot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().cloned().collect()
    }

    /// Start a fresh agent for `alias` holding only `key`. Any failure after
    /// the process exists stops it again, so no half-built agent survives.
    async fn start_isolated(
        &self,
        alias: &str,
        key: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentHandle> {
        let socket = self.socket_path(alias);
        io::ensure_dir(&self.socket_dir)?;
        io::remove_if_exists(&socket)?;

        let spawned = match self.spawn_agent(&socket).await {
            Err(GitidError::SocketBind { reason, .. }) => {
                debug!(alias, "socket bind failed ({reason}); recreating socket dir and retrying");
                io::ensure_dir(&self.socket_dir)?;
                io::remove_if_exists(&socket)?;
                self.spawn_agent(&socket).await
            }
            other => other,
        };
        let pid = match spawned {
            Ok(pid) => pid,
            Err(e) => {
                if let Err(cleanup) = io::remove_if_exists(&socket) {
                    warn!(socket = %socket.display(), "failed to remove socket: {cleanup}");
                }
                return Err(e);
            }
        };

        match self.load_exclusive(alias, &socket, pid, key, cancel).await {
            Ok(fingerprint) => Ok(AgentHandle {
                alias: alias.to_string(),
                socket_path: socket,
                pid,
                key_path: key.to_path_buf(),
                key_fingerprint: fingerprint.clone(),
                fingerprints: vec![fingerprint],
                isolated: true,
                started_at: Utc::now(),
            }),
            Err(e) => {
                self.stop_quietly(&socket, pid).await;
                Err(e)
            }
        }
    }

    /// [`start_isolated`](Self::start_isolated) plus the on-disk record that
    /// lets later processes adopt the agent.
    async fn start_recorded(
        &self,
        alias: &str,
        key: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentHandle> {
        let handle = self.start_isolated(alias, key, cancel).await?;
        if let Err(e) = self.record(&handle) {
            self.stop_quietly(&handle.socket_path, handle.pid).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Start an agent and wait for its socket, both within `bind_timeout`.
    /// An agent whose socket never appears is stopped before returning.
    async fn spawn_agent(&self, socket: &Path) -> Result<u32> {
        let deadline = tokio::time::Instant::now() + self.bind_timeout;
        let timed_out = || GitidError::Timeout {
            operation: format!("binding agent socket {}", socket.display()),
            secs: self.bind_timeout.as_secs(),
        };

        let pid = tokio::time::timeout_at(deadline, self.adapter.start(socket))
            .await
            .map_err(|_| timed_out())??;
        match tokio::time::timeout_at(deadline, self.adapter.wait_ready(socket)).await {
            Ok(Ok(())) => Ok(pid),
            Ok(Err(e)) => {
                self.stop_quietly(socket, pid).await;
                Err(e)
            }
            Err(_) => {
                warn!(pid, socket = %socket.display(), "agent socket never appeared; stopping agent");
                self.stop_quietly(socket, pid).await;
                Err(timed_out())
            }
        }
    }

    async fn load_exclusive(
        &self,
        alias: &str,
        socket: &Path,
        pid: u32,
        key: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(GitidError::Cancelled);
        }
        let fingerprint = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GitidError::Cancelled),
            loaded = tokio::time::timeout(self.key_load_timeout, self.adapter.load_key(socket, key)) => {
                loaded.map_err(|_| GitidError::Timeout {
                    operation: format!("loading key {}", key.display()),
                    secs: self.key_load_timeout.as_secs(),
                })??
            }
        };

        let status = self.adapter.status(socket, pid).await?;
        if !is_exclusive(&status.fingerprints, &fingerprint) {
            return Err(GitidError::IsolationViolation {
                alias: alias.to_string(),
                detail: format!(
                    "agent holds {} key(s) after loading {}",
                    status.fingerprints.len(),
                    key.display()
                ),
            });
        }
        Ok(fingerprint)
    }

    async fn stop_quietly(&self, socket: &Path, pid: u32) {
        if let Err(e) = self.adapter.stop(socket, pid).await {
            warn!(pid, socket = %socket.display(), "failed to stop agent: {e}");
        }
        if let Err(e) = io::remove_if_exists(socket) {
            warn!(socket = %socket.display(), "failed to remove socket: {e}");
        }
    }

    fn record(&self, handle: &AgentHandle) -> Result<()> {
        let data = serde_yaml::to_string(handle)?;
        io::atomic_write(
            &paths::agent_record_path(&self.socket_dir, &handle.alias),
            data.as_bytes(),
        )
    }

    fn forget(&self, alias: &str) -> Result<()> {
        io::remove_if_exists(&paths::agent_record_path(&self.socket_dir, alias))?;
        io::remove_if_exists(&self.socket_path(alias))?;
        Ok(())
    }

    async fn stop_handle(&self, handle: &AgentHandle) -> Result<()> {
        self.adapter.stop(&handle.socket_path, handle.pid).await?;
        self.forget(&handle.alias)?;
        info!(alias = %handle.alias, pid = handle.pid, "ssh agent stopped");
        Ok(())
    }
}

/// True when the agent holds `expected` and nothing else.
fn is_exclusive(live: &[String], expected: &str) -> bool {
    matches!(live, [only] if only == expected)
}

#[async_trait]
impl AgentManager for SshIsolationManager {
    async fn switch_to_account(
        &self,
        alias: &str,
        key_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentSwitch> {
        paths::validate_alias(alias)?;
        if !key_path.is_file() {
            return Err(GitidError::KeyNotFound(key_path.to_path_buf()));
        }

        let slot = self.slot(alias);
        let mut guard = slot.lock().await;
        if cancel.is_cancelled() {
            return Err(GitidError::Cancelled);
        }

        let mut outcome = SwitchOutcome::Started;
        if let Some(existing) = guard.take() {
            let live = self
                .adapter
                .status(&existing.socket_path, existing.pid)
                .await
                .unwrap_or_default();
            let exclusive =
                live.running && is_exclusive(&live.fingerprints, &existing.key_fingerprint);

            if exclusive && existing.key_path == key_path {
                debug!(alias, pid = existing.pid, "agent already holds key; reusing");
                *guard = Some(existing.clone());
                return Ok(AgentSwitch {
                    handle: existing,
                    outcome: SwitchOutcome::Reused,
                });
            }

            if live.running {
                if existing.key_path == key_path {
                    warn!(alias, "agent holds foreign keys; rebuilding it");
                } else {
                    outcome = SwitchOutcome::Restarted {
                        previous_key: existing.key_path.clone(),
                    };
                }
                if let Err(e) = self.stop_handle(&existing).await {
                    *guard = Some(existing);
                    return Err(e);
                }
            } else {
                debug!(alias, "recorded agent is gone; starting a new one");
                self.forget(alias)?;
            }
        }

        let handle = match self.start_recorded(alias, key_path, cancel).await {
            Ok(handle) => handle,
            Err(e) => {
                let SwitchOutcome::Restarted { previous_key } = &outcome else {
                    return Err(e);
                };
                // The replaced agent is already stopped; bring it back before failing.
                warn!(alias, "starting agent failed ({e}); restarting it with {}", previous_key.display());
                return match self
                    .start_recorded(alias, previous_key, &CancellationToken::new())
                    .await
                {
                    Ok(restored) => {
                        info!(alias, pid = restored.pid, "previous ssh agent restored");
                        *guard = Some(restored);
                        Err(e)
                    }
                    Err(restore) => Err(GitidError::AgentNotRestored {
                        alias: alias.to_string(),
                        source: Box::new(e),
                        restore: restore.to_string(),
                    }),
                };
            }
        };
        info!(alias, pid = handle.pid, socket = %handle.socket_path.display(), "isolated ssh agent ready");
        *guard = Some(handle.clone());
        Ok(AgentSwitch { handle, outcome })
    }

    async fn get_account_agent(&self, alias: &str) -> Result<AgentHandle> {
        let slot = self.slot(alias);
        let mut guard = slot.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| GitidError::AgentNotFound(alias.to_string()))?;

        let live = self.adapter.status(&handle.socket_path, handle.pid).await?;
        if !live.running {
            *guard = None;
            self.forget(alias)?;
            return Err(GitidError::AgentNotFound(alias.to_string()));
        }
        handle.isolated = is_exclusive(&live.fingerprints, &handle.key_fingerprint);
        handle.fingerprints = live.fingerprints;
        Ok(handle.clone())
    }

    async fn list_active_agents(&self) -> Vec<AgentHandle> {
        let mut handles = Vec::new();
        for slot in self.all_slots() {
            if let Some(h) = slot.lock().await.as_ref() {
                handles.push(h.clone());
            }
        }
        handles.sort_by(|a, b| a.alias.cmp(&b.alias));
        handles
    }

    async fn cleanup_agent(&self, alias: &str) -> Result<bool> {
        let slot = self.slot(alias);
        let mut guard = slot.lock().await;
        let Some(handle) = guard.take() else {
            return Ok(false);
        };
        if let Err(e) = self.stop_handle(&handle).await {
            *guard = Some(handle);
            return Err(e);
        }
        Ok(true)
    }

    async fn cleanup_all_agents(&self) -> Result<usize> {
        let mut stopped = 0;
        let mut first_error = None;
        for slot in self.all_slots() {
            let mut guard = slot.lock().await;
            let Some(handle) = guard.take() else {
                continue;
            };
            match self.stop_handle(&handle).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!(alias = %handle.alias, "cleanup failed: {e}");
                    *guard = Some(handle);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    fn socket_path(&self, alias: &str) -> PathBuf {
        paths::socket_path(&self.socket_dir, alias)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_key, FakeProcessAdapter};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, adapter: Arc<FakeProcessAdapter>) -> SshIsolationManager {
        SshIsolationManager::new(
            dir.path().join("run"),
            adapter,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn first_switch_starts_isolated_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");

        let sw = mgr
            .switch_to_account("work", &key, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sw.outcome, SwitchOutcome::Started);
        assert!(sw.handle.isolated);
        assert_eq!(sw.handle.socket_path, mgr.socket_path("work"));
        assert_eq!(sw.handle.fingerprints.len(), 1);
        assert!(paths::agent_record_path(mgr.socket_dir(), "work").exists());
    }

    #[tokio::test]
    async fn repeated_switch_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");
        let cancel = CancellationToken::new();

        let first = mgr.switch_to_account("work", &key, &cancel).await.unwrap();
        let second = mgr.switch_to_account("work", &key, &cancel).await.unwrap();
        assert_eq!(second.outcome, SwitchOutcome::Reused);
        assert_eq!(first.handle.pid, second.handle.pid);
        assert_eq!(adapter.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.load_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());

        let err = mgr
            .switch_to_account("work", &dir.path().join("nope"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::KeyNotFound(_)));
        assert_eq!(adapter.start_calls.load(Ordering::SeqCst), 0);
        assert!(mgr.list_active_agents().await.is_empty());
    }

    #[tokio::test]
    async fn different_key_restarts_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let old_key = write_key(dir.path(), "id_old");
        let new_key = write_key(dir.path(), "id_new");
        let cancel = CancellationToken::new();

        let first = mgr.switch_to_account("work", &old_key, &cancel).await.unwrap();
        let second = mgr.switch_to_account("work", &new_key, &cancel).await.unwrap();
        assert_eq!(
            second.outcome,
            SwitchOutcome::Restarted {
                previous_key: old_key.clone()
            }
        );
        assert_ne!(first.handle.pid, second.handle.pid);
        assert!(!adapter.is_running(first.handle.pid));
        assert_eq!(second.handle.key_path, new_key);
    }

    #[tokio::test]
    async fn failed_key_change_restores_previous_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let old_key = write_key(dir.path(), "id_old");
        let new_key = write_key(dir.path(), "id_new");
        let cancel = CancellationToken::new();

        let first = mgr.switch_to_account("work", &old_key, &cancel).await.unwrap();
        *adapter.fail_load_for.lock().unwrap() = Some(new_key.clone());
        let err = mgr
            .switch_to_account("work", &new_key, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::KeyLoad { .. }));

        let agent = mgr.get_account_agent("work").await.unwrap();
        assert_ne!(agent.pid, first.handle.pid);
        assert_eq!(agent.key_path, old_key);
        assert_eq!(agent.fingerprints, vec![adapter.fingerprint_of(&old_key)]);
        assert!(agent.isolated);
        assert_eq!(adapter.running_count(), 1);
        assert!(paths::agent_record_path(mgr.socket_dir(), "work").exists());
    }

    #[tokio::test]
    async fn unrestorable_key_change_is_reported() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let old_key = write_key(dir.path(), "id_old");
        let new_key = write_key(dir.path(), "id_new");
        let cancel = CancellationToken::new();

        mgr.switch_to_account("work", &old_key, &cancel).await.unwrap();
        adapter.fail_load.store(true, Ordering::SeqCst);
        let err = mgr
            .switch_to_account("work", &new_key, &cancel)
            .await
            .unwrap_err();
        match &err {
            GitidError::AgentNotRestored { alias, source, .. } => {
                assert_eq!(alias, "work");
                assert!(matches!(**source, GitidError::KeyLoad { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(adapter.running_count(), 0);
        assert!(mgr.get_account_agent("work").await.is_err());
    }

    #[tokio::test]
    async fn cancelled_key_change_restores_previous_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let old_key = write_key(dir.path(), "id_old");
        let new_key = write_key(dir.path(), "id_new");

        mgr.switch_to_account("work", &old_key, &CancellationToken::new())
            .await
            .unwrap();
        *adapter.load_delay.lock().unwrap() = Duration::from_millis(300);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = mgr
            .switch_to_account("work", &new_key, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::Cancelled));

        let agent = mgr.get_account_agent("work").await.unwrap();
        assert_eq!(agent.key_path, old_key);
        assert!(agent.isolated);
        assert_eq!(adapter.running_count(), 1);
    }

    #[tokio::test]
    async fn socket_that_never_appears_stops_the_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        adapter.never_ready.store(true, Ordering::SeqCst);
        let mgr = SshIsolationManager::new(
            dir.path().join("run"),
            adapter.clone(),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let key = write_key(dir.path(), "id_work");

        let err = mgr
            .switch_to_account("work", &key, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::Timeout { .. }));
        assert_eq!(adapter.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.running_count(), 0);
        assert!(!mgr.socket_path("work").exists());
        assert!(mgr.list_active_agents().await.is_empty());
    }

    #[tokio::test]
    async fn foreign_key_in_agent_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");
        let cancel = CancellationToken::new();

        let first = mgr.switch_to_account("work", &key, &cancel).await.unwrap();
        adapter.inject_key(first.handle.pid, "SHA256:intruder");

        let handle = mgr.get_account_agent("work").await.unwrap();
        assert!(!handle.isolated);

        let second = mgr.switch_to_account("work", &key, &cancel).await.unwrap();
        assert_eq!(second.outcome, SwitchOutcome::Started);
        assert!(second.handle.isolated);
        assert_ne!(second.handle.pid, first.handle.pid);
    }

    #[tokio::test]
    async fn bind_failure_retries_once() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        adapter.fail_binds.store(1, Ordering::SeqCst);
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");

        mgr.switch_to_account("work", &key, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(adapter.start_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_bind_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        adapter.fail_binds.store(2, Ordering::SeqCst);
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");

        let err = mgr
            .switch_to_account("work", &key, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::SocketBind { .. }));
        assert_eq!(adapter.start_calls.load(Ordering::SeqCst), 2);
        assert!(mgr.list_active_agents().await.is_empty());
    }

    #[tokio::test]
    async fn key_load_failure_stops_half_started_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        adapter.fail_load.store(true, Ordering::SeqCst);
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");

        let err = mgr
            .switch_to_account("work", &key, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::KeyLoad { .. }));
        assert_eq!(adapter.running_count(), 0);
        assert!(!mgr.socket_path("work").exists());
    }

    #[tokio::test]
    async fn slow_key_load_times_out() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        *adapter.load_delay.lock().unwrap() = Duration::from_millis(500);
        let mgr = SshIsolationManager::new(
            dir.path().join("run"),
            adapter.clone(),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        let key = write_key(dir.path(), "id_work");

        let err = mgr
            .switch_to_account("work", &key, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GitidError::Timeout { .. }));
        assert_eq!(adapter.running_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_switch_leaves_no_agent() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        *adapter.load_delay.lock().unwrap() = Duration::from_millis(500);
        let mgr = manager(&dir, adapter.clone());
        let key = write_key(dir.path(), "id_work");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = mgr.switch_to_account("work", &key, &cancel).await.unwrap_err();
        assert!(matches!(err, GitidError::Cancelled));
        assert_eq!(adapter.running_count(), 0);
        assert!(mgr.get_account_agent("work").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_switches_get_independent_agents() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = Arc::new(manager(&dir, adapter.clone()));

        let mut tasks = Vec::new();
        for alias in ["work", "personal", "client"] {
            let key = write_key(dir.path(), &format!("id_{alias}"));
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                mgr.switch_to_account(alias, &key, &CancellationToken::new())
                    .await
                    .unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let agents = mgr.list_active_agents().await;
        assert_eq!(agents.len(), 3);
        let sockets: HashSet<_> = agents.iter().map(|a| a.socket_path.clone()).collect();
        assert_eq!(sockets.len(), 3);
        for agent in &agents {
            let live = mgr.get_account_agent(&agent.alias).await.unwrap();
            assert_eq!(live.fingerprints, vec![adapter.fingerprint_of(&agent.key_path)]);
            assert!(live.isolated);
        }
    }

    #[tokio::test]
    async fn switching_accounts_keeps_other_agents() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let cancel = CancellationToken::new();

        let work = mgr
            .switch_to_account("work", &write_key(dir.path(), "id_work"), &cancel)
            .await
            .unwrap();
        mgr.switch_to_account("personal", &write_key(dir.path(), "id_personal"), &cancel)
            .await
            .unwrap();
        assert!(adapter.is_running(work.handle.pid));
        assert_eq!(mgr.list_active_agents().await.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_stops_everything() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let cancel = CancellationToken::new();
        for alias in ["work", "personal"] {
            mgr.switch_to_account(alias, &write_key(dir.path(), alias), &cancel)
                .await
                .unwrap();
        }

        assert_eq!(mgr.cleanup_all_agents().await.unwrap(), 2);
        assert!(mgr.list_active_agents().await.is_empty());
        assert_eq!(adapter.running_count(), 0);
        assert!(!paths::agent_record_path(mgr.socket_dir(), "work").exists());
        assert!(!mgr.cleanup_agent("work").await.unwrap());
    }

    #[tokio::test]
    async fn dead_agent_is_reported_missing() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let mgr = manager(&dir, adapter.clone());
        let sw = mgr
            .switch_to_account("work", &write_key(dir.path(), "id_work"), &CancellationToken::new())
            .await
            .unwrap();
        adapter.kill(sw.handle.pid);

        assert!(matches!(
            mgr.get_account_agent("work").await,
            Err(GitidError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_adopts_live_agents_and_drops_stale_ones() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(FakeProcessAdapter::default());
        let cancel = CancellationToken::new();
        let (live_pid, dead_pid) = {
            let first = manager(&dir, adapter.clone());
            let live = first
                .switch_to_account("work", &write_key(dir.path(), "id_work"), &cancel)
                .await
                .unwrap();
            let dead = first
                .switch_to_account("old", &write_key(dir.path(), "id_old"), &cancel)
                .await
                .unwrap();
            (live.handle.pid, dead.handle.pid)
        };
        adapter.kill(dead_pid);

        let second = manager(&dir, adapter.clone());
        assert_eq!(second.restore_agents().await.unwrap(), 1);
        let agents = second.list_active_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].pid, live_pid);
        assert!(!paths::agent_record_path(second.socket_dir(), "old").exists());

        // Adopted agents are reused, not restarted.
        let again = second
            .switch_to_account("work", &dir.path().join("id_work"), &cancel)
            .await
            .unwrap();
        assert_eq!(again.outcome, SwitchOutcome::Reused);
    }
}
