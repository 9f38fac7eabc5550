use crate::cmd;
use crate::output::print_json;
use anyhow::Context;
use gitid_core::environment::EnvFile;
use gitid_core::events::{EventSink, Fanout, MemorySink, StepEvent, TracingSink};
use gitid_core::git::GitCli;
use gitid_core::identity::IdentitySource;
use gitid_core::io::FileLock;
use gitid_core::paths;
use gitid_core::state::{AccountState, CurrentRecord};
use gitid_core::token::CredentialStore;
use gitid_core::transaction::{RollbackReport, TransitionError};
use gitid_core::{GitidError, StateManager, Subsystems};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct SwitchFailure<'a> {
    alias: &'a str,
    step: Option<String>,
    error: String,
    rollback_clean: bool,
    rollback: Option<&'a RollbackReport>,
    events: Vec<StepEvent>,
}

pub fn run(home: &Path, alias: &str, json: bool) -> anyhow::Result<()> {
    let mut config = cmd::load_config(home)?;
    config.identity(alias)?;

    // One switch at a time across processes too.
    let Some(_lock) = FileLock::try_acquire(&paths::lock_path(home))? else {
        anyhow::bail!("another gitid switch is running; try again when it finishes");
    };

    let state = cmd::block_on(switch(home, &config, alias, json))??;

    config.touch_last_used(alias)?;
    config.save(home).context("failed to save config")?;

    if json {
        print_json(&*state)?;
    } else {
        println!("switched to '{}' ({} <{}>)", alias, state.account.name, state.account.email);
        println!("  ssh agent: {}", state.ssh.socket_path.display());
        if state.token.valid {
            println!("  token:     bound to {}", state.token.username);
        }
        println!(
            "\nFor new shells:  source {}",
            paths::env_path(home).display()
        );
    }
    Ok(())
}

async fn switch(
    home: &Path,
    config: &gitid_core::config::Config,
    alias: &str,
    json: bool,
) -> anyhow::Result<Arc<AccountState>> {
    let settings = &config.settings;
    let agents = cmd::isolation_manager(home, config).await?;
    let git = Arc::new(GitCli::locate(settings.git_scope.clone())?);

    let subsystems = Subsystems {
        tokens: Arc::new(CredentialStore::new(home)),
        agents: agents.clone(),
        git: git.clone(),
        environment: Arc::new(EnvFile::new(paths::env_path(home))),
        require_token: settings.require_token,
    };
    let memory = Arc::new(MemorySink::default());
    let events: Arc<dyn EventSink> = Arc::new(Fanout(vec![
        Arc::new(TracingSink) as Arc<dyn EventSink>,
        memory.clone() as Arc<dyn EventSink>,
    ]));

    let mut manager = StateManager::new(Arc::new(config.clone()), subsystems, events, settings);
    if let Some(previous) = cmd::previous_state(home, config, agents.as_ref(), git.as_ref()).await? {
        manager = manager.with_current_state(previous);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match manager.transition_to(alias, &cancel).await {
        Ok(state) => {
            let transition_id = manager
                .history()
                .last()
                .map(|t| t.id)
                .unwrap_or_default();
            CurrentRecord::from_state(&state, transition_id)
                .save(home)
                .context("failed to record active account")?;
            Ok(state)
        }
        Err(e) => {
            report_failure(alias, &e, memory.events(), json)?;
            Err(anyhow::Error::new(e))
        }
    }
}

fn report_failure(
    alias: &str,
    e: &TransitionError,
    events: Vec<StepEvent>,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        return print_json(&SwitchFailure {
            alias,
            step: e.failed_step().map(|s| s.to_string()),
            error: e.cause().map_or_else(|| e.to_string(), ToString::to_string),
            rollback_clean: e.rollback_clean(),
            rollback: e.rollback(),
            events,
        });
    }

    if let Some(report) = e.rollback() {
        if !report.reverted.is_empty() {
            let steps: Vec<String> = report.reverted.iter().map(|s| s.to_string()).collect();
            eprintln!("rolled back: {}", steps.join(", "));
        }
        for failure in &report.failures {
            eprintln!("ROLLBACK FAILED for {}: {}", failure.step, failure.error);
        }
        if !report.is_clean() {
            eprintln!("some settings may still point at '{alias}'; run `gitid status` and fix them by hand");
        }
    }
    if let Some(hint) = hint(alias, e) {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

fn hint(alias: &str, e: &TransitionError) -> Option<String> {
    if matches!(e, TransitionError::InProgress) {
        return Some("another switch is running; try again when it finishes".into());
    }
    Some(match e.cause()? {
        GitidError::KeyNotFound(_) => {
            format!("fix the ssh_key path for '{alias}' in config.yaml (gitid account show {alias})")
        }
        GitidError::TokenNotFound(_) => {
            format!("store a token first: gitid token set {alias} --username <platform user>")
        }
        GitidError::TokenUsernameMismatch { .. } => format!(
            "the stored token belongs to another user; replace it with gitid token set {alias}"
        ),
        GitidError::ToolNotInstalled(tool) => format!("install {tool} and make sure it is on PATH"),
        GitidError::Timeout { .. } => {
            "raise bind_timeout_secs / key_load_timeout_secs / switch_timeout_secs in config.yaml"
                .into()
        }
        GitidError::KeyLoad { .. } => {
            "keys with a passphrase must be loadable without a prompt (SSH_ASKPASS)".into()
        }
        _ => return None,
    })
}
