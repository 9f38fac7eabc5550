use crate::cmd;
use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use gitid_core::config::WarnLevel;
use gitid_core::identity::{Identity, IdentitySource};
use gitid_core::state::CurrentRecord;
use gitid_core::token::{CredentialStore, TokenStore};
use serde::Serialize;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Subcommand tree
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum AccountSubcommand {
    /// List configured accounts
    List,
    /// Show one account and its token status
    Show {
        /// Account alias
        alias: String,
    },
    /// Add an account
    Add {
        /// Short lowercase alias (e.g. work, personal)
        alias: String,
        /// Git author name
        #[arg(long)]
        name: String,
        /// Git author email
        #[arg(long)]
        email: String,
        /// Path to the SSH private key
        #[arg(long)]
        key: PathBuf,
        /// Platform account the token belongs to
        #[arg(long)]
        username: Option<String>,
    },
    /// Remove an account
    Remove {
        /// Account alias
        alias: String,
        /// Also delete the stored token
        #[arg(long)]
        purge: bool,
    },
    /// Validate config.yaml
    Check,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(home: &Path, subcommand: AccountSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        AccountSubcommand::List => list(home, json),
        AccountSubcommand::Show { alias } => show(home, &alias, json),
        AccountSubcommand::Add {
            alias,
            name,
            email,
            key,
            username,
        } => add(home, alias, name, email, key, username),
        AccountSubcommand::Remove { alias, purge } => remove(home, &alias, purge),
        AccountSubcommand::Check => check(home, json),
    }
}

fn list(home: &Path, json: bool) -> anyhow::Result<()> {
    let config = cmd::load_config(home)?;
    if json {
        return print_json(&config.accounts);
    }
    if config.accounts.is_empty() {
        println!("no accounts configured");
        println!("\nAdd one:  gitid account add <alias> --name <name> --email <email> --key <path>");
        return Ok(());
    }
    let active = CurrentRecord::load(home)?.map(|r| r.alias);
    print_table(
        &["", "ALIAS", "NAME", "EMAIL", "USERNAME", "LAST USED"],
        config
            .accounts
            .iter()
            .map(|a| {
                vec![
                    if active.as_deref() == Some(a.alias.as_str()) {
                        "*".into()
                    } else {
                        String::new()
                    },
                    a.alias.clone(),
                    a.name.clone(),
                    a.email.clone(),
                    a.platform_username.clone(),
                    fmt_time(a.last_used),
                ]
            })
            .collect(),
    );
    Ok(())
}

#[derive(Serialize)]
struct AccountView {
    #[serde(flatten)]
    account: Identity,
    token_stored: bool,
    token_username: Option<String>,
    token_valid: bool,
}

fn show(home: &Path, alias: &str, json: bool) -> anyhow::Result<()> {
    let config = cmd::load_config(home)?;
    let account = config.identity(alias)?;
    let store = CredentialStore::new(home);
    let token = cmd::block_on(store.token_state(alias))??;

    let view = AccountView {
        token_stored: token.is_some(),
        token_username: token.as_ref().map(|t| t.username.clone()),
        token_valid: token.as_ref().is_some_and(|t| t.valid),
        account,
    };
    if json {
        return print_json(&view);
    }

    let a = &view.account;
    println!("alias:     {}", a.alias);
    println!("name:      {}", a.name);
    println!("email:     {}", a.email);
    let key = a.key_path();
    let missing = if key.is_file() { "" } else { "  (missing)" };
    println!("ssh key:   {}{missing}", key.display());
    println!("username:  {}", a.platform_username);
    println!("created:   {}", fmt_time(Some(a.created_at)));
    println!("last used: {}", fmt_time(a.last_used));
    match &token {
        Some(t) => println!(
            "token:     bound to {} ({}, checked {})",
            t.username,
            if t.valid { "valid" } else { "unverified" },
            fmt_time(t.last_validated)
        ),
        None => println!("token:     none"),
    }
    Ok(())
}

fn add(
    home: &Path,
    alias: String,
    name: String,
    email: String,
    key: PathBuf,
    username: Option<String>,
) -> anyhow::Result<()> {
    let mut config = cmd::load_config(home)?;
    let identity = Identity::new(alias, name, email, key, username.unwrap_or_default());
    let key_path = identity.key_path();
    let alias = identity.alias.clone();
    config.add_account(identity)?;
    config.save(home).context("failed to save config")?;

    println!("added account '{alias}'");
    if !key_path.is_file() {
        eprintln!("warning: ssh key not found at {}", key_path.display());
    }
    Ok(())
}

fn remove(home: &Path, alias: &str, purge: bool) -> anyhow::Result<()> {
    let mut config = cmd::load_config(home)?;
    config.remove_account(alias)?;
    config.save(home).context("failed to save config")?;
    println!("removed account '{alias}'");

    if purge {
        let store = CredentialStore::new(home);
        if cmd::block_on(store.remove_token(alias))?? {
            println!("deleted stored token");
        }
    }
    Ok(())
}

fn check(home: &Path, json: bool) -> anyhow::Result<()> {
    let config = cmd::load_config(home)?;
    let warnings = config.validate();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&warnings)?;
    } else if warnings.is_empty() {
        println!("config ok ({} account(s))", config.accounts.len());
    } else {
        for w in &warnings {
            let label = match w.level {
                WarnLevel::Error => "error",
                WarnLevel::Warning => "warning",
            };
            println!("{label}: {}", w.message);
        }
    }

    if errors > 0 {
        anyhow::bail!("config has {errors} error(s)");
    }
    Ok(())
}
