mod cmd;
mod output;

use clap::{ArgAction, Parser, Subcommand};
use cmd::{account::AccountSubcommand, agents::AgentsSubcommand, token::TokenSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gitid",
    about = "Switch git identity, ssh-agent and access token together, or not at all",
    version,
    propagate_version = true
)]
struct Cli {
    /// gitid home directory (default: ~/.gitid)
    #[arg(long, global = true, env = "GITID_HOME")]
    home: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log more (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configured accounts
    Account {
        #[command(subcommand)]
        subcommand: AccountSubcommand,
    },

    /// Make an account the active identity
    Switch {
        /// Account alias
        alias: String,
    },

    /// Show the active account
    Status,

    /// Inspect and stop per-account ssh agents
    Agents {
        #[command(subcommand)]
        subcommand: AgentsSubcommand,
    },

    /// Manage stored access tokens
    Token {
        #[command(subcommand)]
        subcommand: TokenSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = gitid_core::paths::resolve_home(cli.home.as_deref())
        .map_err(anyhow::Error::from)
        .and_then(|home| match cli.command {
            Commands::Account { subcommand } => cmd::account::run(&home, subcommand, cli.json),
            Commands::Switch { alias } => cmd::switch::run(&home, &alias, cli.json),
            Commands::Status => cmd::status::run(&home, cli.json),
            Commands::Agents { subcommand } => cmd::agents::run(&home, subcommand, cli.json),
            Commands::Token { subcommand } => cmd::token::run(&home, subcommand, cli.json),
        });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
