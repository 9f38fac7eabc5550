use crate::cmd;
use crate::output::{fmt_time, print_json};
use gitid_core::identity::IdentitySource;
use gitid_core::ssh::{AgentHandle, AgentManager};
use gitid_core::state::CurrentRecord;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct Status {
    active: Option<CurrentRecord>,
    name: Option<String>,
    email: Option<String>,
    agent: Option<AgentHandle>,
}

pub fn run(home: &Path, json: bool) -> anyhow::Result<()> {
    let config = cmd::load_config(home)?;
    let Some(record) = CurrentRecord::load(home)? else {
        if json {
            return print_json(&Status {
                active: None,
                name: None,
                email: None,
                agent: None,
            });
        }
        println!("no active account");
        println!("\nSwitch with:  gitid switch <alias>");
        return Ok(());
    };

    let account = config.identity(&record.alias).ok();
    // Agent details need the OpenSSH tools; status still works without them.
    let agent = cmd::block_on(async {
        match cmd::isolation_manager(home, &config).await {
            Ok(agents) => agents.get_account_agent(&record.alias).await.ok(),
            Err(e) => {
                tracing::debug!("agent lookup skipped: {e:#}");
                None
            }
        }
    })?;

    if json {
        return print_json(&Status {
            name: account.as_ref().map(|a| a.name.clone()),
            email: account.as_ref().map(|a| a.email.clone()),
            active: Some(record),
            agent,
        });
    }

    println!("active:    {}", record.alias);
    if let Some(a) = &account {
        println!("identity:  {} <{}>", a.name, a.email);
    } else {
        println!("identity:  (account no longer configured)");
    }
    println!("since:     {}", fmt_time(Some(record.switched_at)));
    match &agent {
        Some(h) if h.isolated => println!("ssh agent: pid {} at {}", h.pid, h.socket_path.display()),
        Some(h) => println!(
            "ssh agent: pid {} holds {} key(s); run `gitid switch {}` to rebuild it",
            h.pid,
            h.fingerprints.len(),
            record.alias
        ),
        None => println!("ssh agent: not running ({})", record.socket_path.display()),
    }
    Ok(())
}
