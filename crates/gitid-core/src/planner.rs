use crate::environment::EnvSnapshot;
use crate::identity::Identity;
use crate::ssh::SwitchOutcome;
use crate::state::{AccountState, GitConfigState, SshAgentState, TokenState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    TokenIsolation,
    SshIsolation,
    GitConfig,
    EnvironmentSync,
}

impl StepKind {
    /// Execution order of every transition.
    pub const STANDARD: [StepKind; 4] = [
        StepKind::TokenIsolation,
        StepKind::SshIsolation,
        StepKind::GitConfig,
        StepKind::EnvironmentSync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::TokenIsolation => "token_isolation",
            StepKind::SshIsolation => "ssh_isolation",
            StepKind::GitConfig => "git_config",
            StepKind::EnvironmentSync => "environment_sync",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionOperation {
    pub kind: StepKind,
    pub description: String,
    /// Run this step's checks in pre-flight, before any side effect.
    pub validate: bool,
}

/// Everything needed to reverse one applied step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackOperation {
    TokenIsolation {
        alias: String,
        /// Validity and last-validated time before the step, if a token existed.
        prior: Option<(bool, Option<DateTime<Utc>>)>,
    },
    SshIsolation {
        alias: String,
        outcome: SwitchOutcome,
    },
    GitConfig {
        prior: GitConfigState,
    },
    EnvironmentSync {
        prior: EnvSnapshot,
    },
}

impl RollbackOperation {
    pub fn kind(&self) -> StepKind {
        match self {
            RollbackOperation::TokenIsolation { .. } => StepKind::TokenIsolation,
            RollbackOperation::SshIsolation { .. } => StepKind::SshIsolation,
            RollbackOperation::GitConfig { .. } => StepKind::GitConfig,
            RollbackOperation::EnvironmentSync { .. } => StepKind::EnvironmentSync,
        }
    }
}

// ---------------------------------------------------------------------------
// StateTransition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub id: Uuid,
    pub from: Option<Arc<AccountState>>,
    pub to: AccountState,
    pub operations: Vec<TransitionOperation>,
    /// Steps that were applied, in order.
    pub executed: Vec<StepKind>,
    /// Pending reversals; drained when a rollback runs.
    pub rollbacks: Vec<RollbackOperation>,
    pub started_at: DateTime<Utc>,
    pub completed: bool,
    pub failed_step: Option<StepKind>,
}

impl StateTransition {
    pub fn alias(&self) -> &str {
        self.to.alias()
    }

    pub fn from_alias(&self) -> Option<&str> {
        self.from.as_deref().map(AccountState::alias)
    }
}

// ---------------------------------------------------------------------------
// TransitionPlanner
// ---------------------------------------------------------------------------

/// Turns "go from A to B" into the ordered step list. Never executes anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionPlanner;

impl TransitionPlanner {
    pub fn plan(
        &self,
        from: Option<Arc<AccountState>>,
        target: &Identity,
        socket_path: PathBuf,
    ) -> StateTransition {
        let to = AccountState {
            account: target.clone(),
            git: GitConfigState {
                user_name: Some(target.name.clone()),
                user_email: Some(target.email.clone()),
                ssh_command: Some(target.git_ssh_command(&socket_path)),
            },
            ssh: SshAgentState {
                socket_path,
                pid: None,
                fingerprints: Vec::new(),
                isolated: false,
            },
            token: TokenState {
                username: target.platform_username.clone(),
                ..TokenState::default()
            },
            timestamp: Utc::now(),
        };

        let operations = StepKind::STANDARD
            .iter()
            .map(|&kind| TransitionOperation {
                kind,
                description: describe(kind, target),
                validate: kind != StepKind::EnvironmentSync,
            })
            .collect();

        StateTransition {
            id: Uuid::new_v4(),
            from,
            to,
            operations,
            executed: Vec::new(),
            rollbacks: Vec::new(),
            started_at: Utc::now(),
            completed: false,
            failed_step: None,
        }
    }
}

fn describe(kind: StepKind, target: &Identity) -> String {
    match kind {
        StepKind::TokenIsolation => format!(
            "verify token for '{}' is bound to '{}'",
            target.alias, target.platform_username
        ),
        StepKind::SshIsolation => format!(
            "load {} into the isolated agent for '{}'",
            target.key_path().display(),
            target.alias
        ),
        StepKind::GitConfig => format!("set git identity to {} <{}>", target.name, target.email),
        StepKind::EnvironmentSync => format!("export environment for '{}'", target.alias),
    }
}
