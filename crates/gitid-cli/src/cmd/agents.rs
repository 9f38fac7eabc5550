use crate::cmd;
use crate::output::{fmt_time, print_json, print_table};
use clap::Subcommand;
use gitid_core::ssh::AgentManager;
use std::path::Path;

#[derive(Subcommand)]
pub enum AgentsSubcommand {
    /// List running per-account agents
    List,
    /// Stop the agent for one account
    Stop {
        /// Account alias
        alias: String,
    },
    /// Stop every agent started by gitid
    Cleanup,
}

pub fn run(home: &Path, subcommand: AgentsSubcommand, json: bool) -> anyhow::Result<()> {
    cmd::block_on(execute(home, subcommand, json))?
}

async fn execute(home: &Path, subcommand: AgentsSubcommand, json: bool) -> anyhow::Result<()> {
    let config = cmd::load_config(home)?;
    let agents = cmd::isolation_manager(home, &config).await?;
    match subcommand {
        AgentsSubcommand::List => {
            let mut handles = Vec::new();
            for handle in agents.list_active_agents().await {
                // Refresh from the live agent; skip ones that died meanwhile.
                if let Ok(live) = agents.get_account_agent(&handle.alias).await {
                    handles.push(live);
                }
            }
            if json {
                return print_json(&handles);
            }
            if handles.is_empty() {
                println!("no agents running");
                return Ok(());
            }
            print_table(
                &["ALIAS", "PID", "SOCKET", "KEYS", "ISOLATED", "STARTED"],
                handles
                    .iter()
                    .map(|h| {
                        vec![
                            h.alias.clone(),
                            h.pid.to_string(),
                            h.socket_path.display().to_string(),
                            h.fingerprints.len().to_string(),
                            if h.isolated { "yes" } else { "NO" }.into(),
                            fmt_time(Some(h.started_at)),
                        ]
                    })
                    .collect(),
            );
            Ok(())
        }

        AgentsSubcommand::Stop { alias } => {
            if agents.cleanup_agent(&alias).await? {
                println!("stopped agent for '{alias}'");
            } else {
                println!("no agent running for '{alias}'");
            }
            Ok(())
        }

        AgentsSubcommand::Cleanup => {
            let stopped = agents.cleanup_all_agents().await?;
            println!("stopped {stopped} agent(s)");
            Ok(())
        }
    }
}
