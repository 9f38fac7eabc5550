pub mod account;
pub mod agents;
pub mod status;
pub mod switch;
pub mod token;

use anyhow::Context;
use gitid_core::config::Config;
use gitid_core::git::GitConfigWriter;
use gitid_core::identity::IdentitySource;
use gitid_core::process::OpenSshAdapter;
use gitid_core::ssh::{AgentManager, SshIsolationManager};
use gitid_core::state::{AccountState, CurrentRecord, SshAgentState, TokenState};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Run one async command body on a fresh multi-threaded runtime.
pub fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    Ok(rt.block_on(future))
}

pub fn load_config(home: &Path) -> anyhow::Result<Config> {
    Config::load(home).with_context(|| format!("failed to read config in {}", home.display()))
}

/// Agent manager over the real OpenSSH tools, with agents from earlier
/// invocations adopted.
pub async fn isolation_manager(
    home: &Path,
    config: &Config,
) -> anyhow::Result<Arc<SshIsolationManager>> {
    let adapter = OpenSshAdapter::locate().context("ssh agent isolation needs OpenSSH")?;
    let settings = &config.settings;
    let manager = SshIsolationManager::new(
        settings.socket_dir(home),
        Arc::new(adapter),
        settings.bind_timeout(),
        settings.key_load_timeout(),
    );
    let adopted = manager.restore_agents().await?;
    tracing::debug!(adopted, "restored agents");
    Ok(Arc::new(manager))
}

/// Rebuild the state left by the last successful switch, if any.
pub async fn previous_state(
    home: &Path,
    config: &Config,
    agents: &dyn AgentManager,
    git: &dyn GitConfigWriter,
) -> anyhow::Result<Option<AccountState>> {
    let Some(record) = CurrentRecord::load(home)? else {
        return Ok(None);
    };
    let Ok(account) = config.identity(&record.alias) else {
        tracing::warn!(alias = %record.alias, "last active account is no longer configured");
        return Ok(None);
    };
    let ssh = match agents.get_account_agent(&record.alias).await {
        Ok(handle) => handle.to_state(),
        Err(_) => SshAgentState {
            socket_path: record.socket_path.clone(),
            pid: None,
            fingerprints: Vec::new(),
            isolated: false,
        },
    };
    Ok(Some(AccountState {
        token: TokenState {
            username: account.platform_username.clone(),
            ..TokenState::default()
        },
        account,
        ssh,
        git: git.snapshot().await?,
        timestamp: record.switched_at,
    }))
}
