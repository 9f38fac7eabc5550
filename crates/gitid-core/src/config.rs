use crate::error::{GitidError, Result};
use crate::identity::{Identity, IdentitySource};
use crate::{io, paths};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// GitScope
// ---------------------------------------------------------------------------

/// Which git configuration file a switch writes to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitScope {
    #[default]
    Global,
    Local {
        repo: PathBuf,
    },
    File {
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Fail a switch when the target account has no stored token.
    #[serde(default)]
    pub require_token: bool,
    #[serde(default)]
    pub git_scope: GitScope,
    /// Override for the agent socket directory (default: `<home>/run`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_secs: u64,
    #[serde(default = "default_key_load_timeout")]
    pub key_load_timeout_secs: u64,
    #[serde(default = "default_switch_timeout")]
    pub switch_timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_bind_timeout() -> u64 {
    5
}

fn default_key_load_timeout() -> u64 {
    10
}

fn default_switch_timeout() -> u64 {
    60
}

fn default_history_limit() -> usize {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            require_token: false,
            git_scope: GitScope::default(),
            socket_dir: None,
            bind_timeout_secs: default_bind_timeout(),
            key_load_timeout_secs: default_key_load_timeout(),
            switch_timeout_secs: default_switch_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

impl Settings {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }

    pub fn key_load_timeout(&self) -> Duration {
        Duration::from_secs(self.key_load_timeout_secs)
    }

    /// `None` when the deadline is disabled (`switch_timeout_secs: 0`).
    pub fn switch_timeout(&self) -> Option<Duration> {
        (self.switch_timeout_secs > 0).then(|| Duration::from_secs(self.switch_timeout_secs))
    }

    pub fn socket_dir(&self, home: &Path) -> PathBuf {
        self.socket_dir
            .as_deref()
            .map(paths::expand_tilde)
            .unwrap_or_else(|| paths::run_dir(home))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub accounts: Vec<Identity>,
}

impl Config {
    /// Load `<home>/config.yaml`; a missing file is an empty config.
    pub fn load(home: &Path) -> Result<Self> {
        match io::read_optional(&paths::config_path(home))? {
            Some(data) => Ok(serde_yaml::from_str(&data)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::config_path(home), data.as_bytes())
    }

    pub fn account(&self, alias: &str) -> Option<&Identity> {
        self.accounts.iter().find(|a| a.alias == alias)
    }

    pub fn add_account(&mut self, identity: Identity) -> Result<()> {
        identity.validate()?;
        if self.account(&identity.alias).is_some() {
            return Err(GitidError::AccountExists(identity.alias));
        }
        self.accounts.push(identity);
        Ok(())
    }

    pub fn remove_account(&mut self, alias: &str) -> Result<Identity> {
        let idx = self
            .accounts
            .iter()
            .position(|a| a.alias == alias)
            .ok_or_else(|| GitidError::AccountNotFound(alias.to_string()))?;
        Ok(self.accounts.remove(idx))
    }

    pub fn touch_last_used(&mut self, alias: &str) -> Result<()> {
        let account = self
            .accounts
            .iter_mut()
            .find(|a| a.alias == alias)
            .ok_or_else(|| GitidError::AccountNotFound(alias.to_string()))?;
        account.last_used = Some(Utc::now());
        Ok(())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();

        for account in &self.accounts {
            if !seen.insert(account.alias.as_str()) {
                warnings.push(error(format!("duplicate alias '{}'", account.alias)));
            }
            if let Err(e) = account.validate() {
                warnings.push(error(e.to_string()));
            }
            if !account.key_path().is_file() {
                warnings.push(warning(format!(
                    "account '{}': ssh key not found at {}",
                    account.alias,
                    account.key_path().display()
                )));
            }
            if account.platform_username.is_empty() {
                let msg = format!("account '{}' has no platform_username", account.alias);
                warnings.push(if self.settings.require_token {
                    error(msg)
                } else {
                    warning(msg)
                });
            }
        }

        if self.settings.bind_timeout_secs == 0 || self.settings.key_load_timeout_secs == 0 {
            warnings.push(error(
                "bind_timeout_secs and key_load_timeout_secs must be greater than zero".into(),
            ));
        }

        warnings
    }
}

fn warning(message: String) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Warning,
        message,
    }
}

fn error(message: String) -> ConfigWarning {
    ConfigWarning {
        level: WarnLevel::Error,
        message,
    }
}

impl IdentitySource for Config {
    fn identity(&self, alias: &str) -> Result<Identity> {
        self.account(alias)
            .cloned()
            .ok_or_else(|| GitidError::AccountNotFound(alias.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn account(alias: &str, key: &Path) -> Identity {
        Identity::new(alias, "Dev", format!("{alias}@example.com"), key, alias)
    }

    #[test]
    fn missing_config_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.settings.bind_timeout_secs, 5);
        assert_eq!(config.settings.git_scope, GitScope::Global);
    }

    #[test]
    fn config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config
            .add_account(account("work", Path::new("/keys/work")))
            .unwrap();
        config.settings.git_scope = GitScope::File {
            path: PathBuf::from("/tmp/gitconfig"),
        };
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.identity("work").unwrap().email, "work@example.com");
        assert_eq!(loaded.settings.git_scope, config.settings.git_scope);
    }

    #[test]
    fn parses_tagged_git_scope() {
        let yaml = "settings:\n  git_scope:\n    type: local\n    repo: /src/app\n  require_token: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.settings.git_scope,
            GitScope::Local {
                repo: PathBuf::from("/src/app")
            }
        );
        assert!(config.settings.require_token);
        assert_eq!(config.settings.switch_timeout_secs, 60);
    }

    #[test]
    fn duplicate_account_rejected() {
        let mut config = Config::default();
        config
            .add_account(account("work", Path::new("/k")))
            .unwrap();
        let err = config
            .add_account(account("work", Path::new("/k")))
            .unwrap_err();
        assert!(matches!(err, GitidError::AccountExists(_)));
    }

    #[test]
    fn remove_and_lookup_missing() {
        let mut config = Config::default();
        assert!(matches!(
            config.remove_account("ghost"),
            Err(GitidError::AccountNotFound(_))
        ));
        assert!(matches!(
            config.identity("ghost"),
            Err(GitidError::AccountNotFound(_))
        ));
    }

    #[test]
    fn touch_last_used_stamps_account() {
        let mut config = Config::default();
        config
            .add_account(account("work", Path::new("/k")))
            .unwrap();
        config.touch_last_used("work").unwrap();
        assert!(config.account("work").unwrap().last_used.is_some());
    }

    #[test]
    fn validate_reports_missing_keys_and_duplicates() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("id_work");
        std::fs::write(&key, "k").unwrap();

        let mut config = Config::default();
        config.accounts.push(account("work", &key));
        config.accounts.push(account("work", &key));
        config
            .accounts
            .push(account("broken", &dir.path().join("missing")));

        let warnings = config.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("duplicate alias")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("broken")));
    }

    #[test]
    fn socket_dir_defaults_under_home() {
        let settings = Settings::default();
        assert_eq!(
            settings.socket_dir(Path::new("/h")),
            PathBuf::from("/h/run")
        );
        assert!(settings.switch_timeout().is_some());
    }
}
