use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitidError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("invalid alias '{0}': must be lowercase alphanumeric with hyphens or underscores")]
    InvalidAlias(String),

    #[error("invalid account '{alias}': {reason}")]
    InvalidIdentity { alias: String, reason: String },

    #[error("ssh key not found at {}", .0.display())]
    KeyNotFound(PathBuf),

    #[error("no token stored for account '{0}'")]
    TokenNotFound(String),

    #[error("token for '{alias}' is bound to '{bound}', expected '{expected}'")]
    TokenUsernameMismatch {
        alias: String,
        bound: String,
        expected: String,
    },

    #[error("token record requested for '{requested}' belongs to '{found}'")]
    TokenOwnerMismatch { requested: String, found: String },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("credential store error: {0}")]
    Crypto(String),

    #[error("no ssh agent running for account '{0}'")]
    AgentNotFound(String),

    #[error("could not bind agent socket {}: {reason}", .path.display())]
    SocketBind { path: PathBuf, reason: String },

    #[error("ssh agent process error: {0}")]
    AgentProcess(String),

    #[error("loading key {} failed: {reason}", .path.display())]
    KeyLoad { path: PathBuf, reason: String },

    /// A key change failed and the agent it replaced could not be restarted.
    #[error("{source}; restarting the previous agent for '{alias}' also failed: {restore}")]
    AgentNotRestored {
        alias: String,
        #[source]
        source: Box<GitidError>,
        restore: String,
    },

    #[error("isolation violated for account '{alias}': {detail}")]
    IsolationViolation { alias: String, detail: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} not found on PATH")]
    ToolNotInstalled(String),

    #[error("git config error: {0}")]
    GitConfig(String),

    #[error("home directory not found: set HOME or GITID_HOME")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GitidError>;
