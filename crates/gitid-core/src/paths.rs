use crate::error::{GitidError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

pub const GITID_DIR: &str = ".gitid";
pub const HOME_ENV: &str = "GITID_HOME";

pub const CONFIG_FILE: &str = "config.yaml";
pub const CURRENT_FILE: &str = "current.yaml";
pub const STORE_KEY_FILE: &str = "store.key";
pub const TOKENS_DIR: &str = "tokens";
pub const RUN_DIR: &str = "run";
pub const ENV_FILE: &str = "active.env";
pub const LOCK_FILE: &str = "switch.lock";

pub const TOKEN_EXT: &str = "enc";
pub const SOCKET_EXT: &str = "sock";
pub const AGENT_RECORD_SUFFIX: &str = ".agent.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Resolve the gitid home directory.
///
/// Priority: explicit path, then `GITID_HOME`, then `~/.gitid`.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    home::home_dir()
        .map(|h| h.join(GITID_DIR))
        .ok_or(GitidError::HomeNotFound)
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_FILE)
}

pub fn current_path(home: &Path) -> PathBuf {
    home.join(CURRENT_FILE)
}

pub fn store_key_path(home: &Path) -> PathBuf {
    home.join(STORE_KEY_FILE)
}

pub fn tokens_dir(home: &Path) -> PathBuf {
    home.join(TOKENS_DIR)
}

pub fn token_path(tokens_dir: &Path, alias: &str) -> PathBuf {
    tokens_dir.join(format!("{alias}.{TOKEN_EXT}"))
}

pub fn run_dir(home: &Path) -> PathBuf {
    home.join(RUN_DIR)
}

pub fn env_path(home: &Path) -> PathBuf {
    home.join(ENV_FILE)
}

pub fn lock_path(home: &Path) -> PathBuf {
    home.join(LOCK_FILE)
}

/// Control socket for `alias`. Deterministic so repeated switches reuse it.
pub fn socket_path(socket_dir: &Path, alias: &str) -> PathBuf {
    socket_dir.join(format!("{alias}.{SOCKET_EXT}"))
}

pub fn agent_record_path(socket_dir: &Path, alias: &str) -> PathBuf {
    socket_dir.join(format!("{alias}{AGENT_RECORD_SUFFIX}"))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match home::home_dir() {
            Some(h) => h.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Alias validation
// ---------------------------------------------------------------------------

static ALIAS_RE: OnceLock<Regex> = OnceLock::new();

fn alias_re() -> &'static Regex {
    ALIAS_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]*$").unwrap())
}

/// Aliases become file names (sockets, token records), so they are kept to a
/// conservative character set and length.
pub fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() || alias.len() > 32 || !alias_re().is_match(alias) {
        return Err(GitidError::InvalidAlias(alias.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
