use crate::config::Settings;
use crate::error::{GitidError, Result};
use crate::events::EventSink;
use crate::identity::{Identity, IdentitySource};
use crate::planner::{StateTransition, TransitionPlanner};
use crate::ssh::AgentHandle;
use crate::state::{AccountState, SshAgentState};
use crate::transaction::{Subsystems, TransactionEngine, TransitionError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owner of the single current identity state.
///
/// Every switch goes through here. Only one runs at a time; a second caller
/// gets [`TransitionError::InProgress`] instead of waiting. Readers see either
/// the state before a switch or the state after it, never anything between.
pub struct StateManager {
    identities: Arc<dyn IdentitySource>,
    planner: TransitionPlanner,
    engine: TransactionEngine,
    switch_lock: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<AccountState>>>,
    history: Mutex<VecDeque<StateTransition>>,
    history_limit: usize,
    switch_timeout: Option<Duration>,
}

impl StateManager {
    pub fn new(
        identities: Arc<dyn IdentitySource>,
        subsystems: Subsystems,
        events: Arc<dyn EventSink>,
        settings: &Settings,
    ) -> Self {
        Self {
            identities,
            planner: TransitionPlanner,
            engine: TransactionEngine::new(subsystems, events),
            switch_lock: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            history_limit: settings.history_limit.max(1),
            switch_timeout: settings.switch_timeout(),
        }
    }

    /// Seed the current state, e.g. from a previous process's last switch.
    pub fn with_current_state(self, state: AccountState) -> Self {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(state));
        self
    }

    pub fn current_state(&self) -> Option<Arc<AccountState>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Switch every subsystem to the account named `alias`.
    pub async fn transition_to(
        &self,
        alias: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<AccountState>, TransitionError> {
        let _guard = self
            .switch_lock
            .try_lock()
            .map_err(|_| TransitionError::InProgress)?;
        let identity = self
            .identities
            .identity(alias)
            .map_err(|source| TransitionError::Planning {
                alias: alias.to_string(),
                source,
            })?;
        self.run(identity, cancel).await
    }

    /// Like [`transition_to`](Self::transition_to) for an identity that is
    /// not in the identity source.
    pub async fn transition_to_identity(
        &self,
        identity: Identity,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<AccountState>, TransitionError> {
        let _guard = self
            .switch_lock
            .try_lock()
            .map_err(|_| TransitionError::InProgress)?;
        identity
            .validate()
            .map_err(|source| TransitionError::Planning {
                alias: identity.alias.clone(),
                source,
            })?;
        self.run(identity, cancel).await
    }

    /// Finished transitions, oldest first, including failed ones.
    pub fn history(&self) -> Vec<StateTransition> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub async fn list_active_agents(&self) -> Vec<AgentHandle> {
        self.engine.subsystems().agents.list_active_agents().await
    }

    pub async fn cleanup_all_agents(&self) -> Result<usize> {
        self.engine.subsystems().agents.cleanup_all_agents().await
    }

    async fn run(
        &self,
        identity: Identity,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<AccountState>, TransitionError> {
        let socket = self.engine.subsystems().agents.socket_path(&identity.alias);
        let mut transition = self.planner.plan(self.current_state(), &identity, socket);

        let step_cancel = cancel.child_token();
        let deadline = self.switch_timeout.map(|limit| {
            let token = step_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let result = self.engine.execute(&mut transition, &step_cancel).await;
        if let Some(timer) = deadline {
            timer.abort();
        }

        let result = match result {
            Ok(state) => {
                let state = Arc::new(state);
                *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&state));
                info!(
                    alias = %identity.alias,
                    transition = %transition.id,
                    from = transition.from_alias().unwrap_or("-"),
                    "identity switched"
                );
                Ok(state)
            }
            Err(e) => {
                self.refresh_current_agent().await;
                let e = self.attribute_deadline(e, cancel);
                warn!(
                    alias = %identity.alias,
                    transition = %transition.id,
                    rollback_clean = e.rollback_clean(),
                    "identity switch failed: {e}"
                );
                Err(e)
            }
        };
        self.record(transition);
        result
    }

    /// After a failed switch, re-read the current account's agent. Undoing a
    /// key change restarts that agent under a new pid, and an agent that could
    /// not be restarted must not keep showing as live.
    async fn refresh_current_agent(&self) {
        let Some(current) = self.current_state() else {
            return;
        };
        let agents = &self.engine.subsystems().agents;
        let ssh = match agents.get_account_agent(current.alias()).await {
            Ok(handle) => handle.to_state(),
            Err(_) => SshAgentState {
                socket_path: current.ssh.socket_path.clone(),
                pid: None,
                fingerprints: Vec::new(),
                isolated: false,
            },
        };
        if ssh.pid == current.ssh.pid {
            return;
        }
        warn!(alias = %current.alias(), old = ?current.ssh.pid, new = ?ssh.pid, "current agent changed during failed switch");
        let mut refreshed = (*current).clone();
        refreshed.ssh = ssh;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(refreshed));
    }

    /// A cancellation the caller didn't ask for came from the switch deadline.
    fn attribute_deadline(&self, e: TransitionError, cancel: &CancellationToken) -> TransitionError {
        let Some(limit) = self.switch_timeout else {
            return e;
        };
        match e {
            TransitionError::Execution {
                step,
                alias,
                source: GitidError::Cancelled,
                rollback,
            } if !cancel.is_cancelled() => TransitionError::Execution {
                step,
                alias,
                source: GitidError::Timeout {
                    operation: "identity switch".into(),
                    secs: limit.as_secs(),
                },
                rollback,
            },
            other => other,
        }
    }

    fn record(&self, mut transition: StateTransition) {
        transition.to.token.token = None;
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(transition);
    }
}
