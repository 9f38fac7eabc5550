//! Step-by-step execution of a planned transition with compensating rollback.
//!
//! Every applied step pushes a [`RollbackOperation`] describing how to undo
//! it. When a later step fails, or the caller cancels, the pushed operations
//! are popped and reverted in reverse order. Rollback is best-effort: a
//! failing revert is recorded in the [`RollbackReport`] and the remaining
//! reverts still run.

use crate::environment::EnvironmentSync;
use crate::error::GitidError;
use crate::events::{EventSink, Outcome, StepEvent};
use crate::git::GitConfigWriter;
use crate::planner::{RollbackOperation, StateTransition, StepKind};
use crate::ssh::{AgentManager, SwitchOutcome};
use crate::state::{AccountState, TokenState};
use crate::token::TokenStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Subsystems
// ---------------------------------------------------------------------------

/// The services a transition drives, resolved once at construction.
#[derive(Clone)]
pub struct Subsystems {
    pub tokens: Arc<dyn TokenStore>,
    pub agents: Arc<dyn AgentManager>,
    pub git: Arc<dyn GitConfigWriter>,
    pub environment: Arc<dyn EnvironmentSync>,
    /// Fail the token step when the target has no stored token.
    pub require_token: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub step: StepKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// Steps reverted successfully, in the order they were reverted.
    pub reverted: Vec<StepKind>,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("another identity switch is already in progress")]
    InProgress,

    #[error("cannot plan switch to '{alias}'")]
    Planning {
        alias: String,
        #[source]
        source: GitidError,
    },

    #[error("{step} check failed for '{alias}'")]
    Validation {
        step: StepKind,
        alias: String,
        #[source]
        source: GitidError,
        rollback: RollbackReport,
    },

    #[error("{step} step failed while switching to '{alias}'")]
    Execution {
        step: StepKind,
        alias: String,
        #[source]
        source: GitidError,
        rollback: RollbackReport,
    },
}

impl TransitionError {
    pub fn failed_step(&self) -> Option<StepKind> {
        match self {
            TransitionError::Validation { step, .. } | TransitionError::Execution { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }

    pub fn rollback(&self) -> Option<&RollbackReport> {
        match self {
            TransitionError::Validation { rollback, .. }
            | TransitionError::Execution { rollback, .. } => Some(rollback),
            _ => None,
        }
    }

    /// False when any revert failed and some subsystem may be left half-switched.
    pub fn rollback_clean(&self) -> bool {
        self.rollback().map_or(true, RollbackReport::is_clean)
    }

    pub fn cause(&self) -> Option<&GitidError> {
        match self {
            TransitionError::Planning { source, .. }
            | TransitionError::Validation { source, .. }
            | TransitionError::Execution { source, .. } => Some(source),
            TransitionError::InProgress => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionEngine
// ---------------------------------------------------------------------------

pub struct TransactionEngine {
    subsystems: Subsystems,
    events: Arc<dyn EventSink>,
}

impl TransactionEngine {
    pub fn new(subsystems: Subsystems, events: Arc<dyn EventSink>) -> Self {
        Self { subsystems, events }
    }

    pub fn subsystems(&self) -> &Subsystems {
        &self.subsystems
    }

    /// Run every planned step. On success returns the final state (with the
    /// live agent pid and token filled in) and marks the transition complete.
    /// On failure everything already applied has been reverted.
    pub async fn execute(
        &self,
        transition: &mut StateTransition,
        cancel: &CancellationToken,
    ) -> Result<AccountState, TransitionError> {
        let alias = transition.alias().to_string();
        let operations = transition.operations.clone();

        for op in operations.iter().filter(|op| op.validate) {
            if let Err(e) = self.validate(op.kind, &transition.to).await {
                transition.failed_step = Some(op.kind);
                self.emit(transition, op.kind, Outcome::Failed, Some(e.to_string()));
                return Err(TransitionError::Validation {
                    step: op.kind,
                    alias,
                    source: e,
                    rollback: RollbackReport::default(),
                });
            }
        }

        let mut state = transition.to.clone();
        for op in &operations {
            let result = self.run_step(transition, op.kind, op.validate, &mut state, cancel).await;
            match result {
                Ok((rollback, outcome)) => {
                    transition.rollbacks.push(rollback);
                    transition.executed.push(op.kind);
                    self.emit(transition, op.kind, outcome, None);
                }
                Err(e) => {
                    transition.failed_step = Some(op.kind);
                    let (e, unreverted) = match e {
                        GitidError::AgentNotRestored { source, restore, .. } => {
                            (*source, Some(restore))
                        }
                        other => (other, None),
                    };
                    self.emit(transition, op.kind, Outcome::Failed, Some(e.to_string()));

                    // The failed step's own partial effect is undone first.
                    let mut failures = Vec::new();
                    if let Some(restore) = unreverted {
                        warn!(step = %op.kind, "could not undo partial step: {restore}");
                        self.emit(transition, op.kind, Outcome::RollbackFailed, Some(restore.clone()));
                        failures.push(RollbackFailure {
                            step: op.kind,
                            error: restore,
                        });
                    }
                    let mut rollback = self.rollback(transition).await;
                    failures.append(&mut rollback.failures);
                    rollback.failures = failures;
                    return Err(TransitionError::Execution {
                        step: op.kind,
                        alias,
                        source: e,
                        rollback,
                    });
                }
            }
        }

        state.timestamp = Utc::now();
        transition.to = state.clone();
        transition.completed = true;
        Ok(state)
    }

    async fn run_step(
        &self,
        transition: &StateTransition,
        kind: StepKind,
        validate: bool,
        state: &mut AccountState,
        cancel: &CancellationToken,
    ) -> Result<(RollbackOperation, Outcome), GitidError> {
        if cancel.is_cancelled() {
            return Err(GitidError::Cancelled);
        }
        self.emit(transition, kind, Outcome::Started, None);
        if validate {
            self.validate(kind, state).await?;
        }
        self.apply(kind, state, cancel).await
    }

    /// Checks that must hold before `kind` may touch anything.
    async fn validate(&self, kind: StepKind, target: &AccountState) -> Result<(), GitidError> {
        let account = &target.account;
        match kind {
            StepKind::TokenIsolation => {
                match self.subsystems.tokens.token_state(&account.alias).await? {
                    Some(_) => {
                        self.subsystems
                            .tokens
                            .validate_token_isolation(&account.alias, &account.platform_username)
                            .await
                    }
                    None if self.subsystems.require_token => {
                        Err(GitidError::TokenNotFound(account.alias.clone()))
                    }
                    None => Ok(()),
                }
            }
            StepKind::SshIsolation => {
                let key = account.key_path();
                if key.is_file() {
                    Ok(())
                } else {
                    Err(GitidError::KeyNotFound(key))
                }
            }
            StepKind::GitConfig => account.validate(),
            StepKind::EnvironmentSync => Ok(()),
        }
    }

    async fn apply(
        &self,
        kind: StepKind,
        state: &mut AccountState,
        cancel: &CancellationToken,
    ) -> Result<(RollbackOperation, Outcome), GitidError> {
        let s = &self.subsystems;
        let alias = state.account.alias.clone();
        match kind {
            StepKind::TokenIsolation => {
                let Some(prior) = s.tokens.token_state(&alias).await? else {
                    if s.require_token {
                        return Err(GitidError::TokenNotFound(alias));
                    }
                    state.token = TokenState {
                        username: state.account.platform_username.clone(),
                        ..TokenState::default()
                    };
                    return Ok((
                        RollbackOperation::TokenIsolation { alias, prior: None },
                        Outcome::Skipped,
                    ));
                };
                let now = Utc::now();
                s.tokens.set_validity(&alias, true, Some(now)).await?;
                state.token = TokenState {
                    token: prior.token.clone(),
                    valid: true,
                    last_validated: Some(now),
                    username: prior.username.clone(),
                };
                Ok((
                    RollbackOperation::TokenIsolation {
                        alias,
                        prior: Some((prior.valid, prior.last_validated)),
                    },
                    Outcome::Succeeded,
                ))
            }
            StepKind::SshIsolation => {
                let key = state.account.key_path();
                let switched = s.agents.switch_to_account(&alias, &key, cancel).await?;
                state.ssh = switched.handle.to_state();
                Ok((
                    RollbackOperation::SshIsolation {
                        alias,
                        outcome: switched.outcome,
                    },
                    Outcome::Succeeded,
                ))
            }
            StepKind::GitConfig => {
                let prior = s.git.snapshot().await?;
                let command = state.git.ssh_command.clone().unwrap_or_default();
                let applied = async {
                    s.git
                        .set_user(&state.account.name, &state.account.email)
                        .await?;
                    s.git.set_ssh_command(&command).await
                }
                .await;
                if let Err(e) = applied {
                    // Undo whatever part of this step landed before failing.
                    if let Err(restore) = s.git.restore(&prior).await {
                        warn!(alias = %alias, "restoring git config after failed step: {restore}");
                    }
                    return Err(e);
                }
                Ok((RollbackOperation::GitConfig { prior }, Outcome::Succeeded))
            }
            StepKind::EnvironmentSync => {
                let prior = s.environment.sync(state).await?;
                Ok((RollbackOperation::EnvironmentSync { prior }, Outcome::Succeeded))
            }
        }
    }

    /// Revert every pushed operation, newest first. Each runs exactly once.
    async fn rollback(&self, transition: &mut StateTransition) -> RollbackReport {
        let mut report = RollbackReport::default();
        while let Some(op) = transition.rollbacks.pop() {
            let kind = op.kind();
            match self.revert(&op).await {
                Ok(()) => {
                    debug!(step = %kind, "reverted");
                    report.reverted.push(kind);
                    self.emit(transition, kind, Outcome::RolledBack, None);
                }
                Err(e) => {
                    warn!(step = %kind, "rollback failed: {e}");
                    self.emit(transition, kind, Outcome::RollbackFailed, Some(e.to_string()));
                    report.failures.push(RollbackFailure {
                        step: kind,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn revert(&self, op: &RollbackOperation) -> Result<(), GitidError> {
        let s = &self.subsystems;
        match op {
            RollbackOperation::TokenIsolation { alias, prior } => match prior {
                Some((valid, last_validated)) => {
                    s.tokens.set_validity(alias, *valid, *last_validated).await
                }
                None => Ok(()),
            },
            RollbackOperation::SshIsolation { alias, outcome } => match outcome {
                SwitchOutcome::Reused => Ok(()),
                SwitchOutcome::Started => s.agents.cleanup_agent(alias).await.map(|_| ()),
                // The caller's token may be what triggered this rollback, so
                // reinstating the previous key runs uncancelled.
                SwitchOutcome::Restarted { previous_key } => s
                    .agents
                    .switch_to_account(alias, previous_key, &CancellationToken::new())
                    .await
                    .map(|_| ()),
            },
            RollbackOperation::GitConfig { prior } => s.git.restore(prior).await,
            RollbackOperation::EnvironmentSync { prior } => s.environment.restore(prior).await,
        }
    }

    fn emit(
        &self,
        transition: &StateTransition,
        kind: StepKind,
        outcome: Outcome,
        detail: Option<String>,
    ) {
        let description = transition
            .operations
            .iter()
            .find(|op| op.kind == kind)
            .map(|op| op.description.clone())
            .unwrap_or_else(|| kind.to_string());
        self.events.emit(&StepEvent {
            transition_id: transition.id,
            alias: transition.alias().to_string(),
            operation: kind,
            description,
            outcome,
            detail,
            at: Utc::now(),
        });
    }
}
