use crate::cmd;
use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use gitid_core::identity::IdentitySource;
use gitid_core::token::{CredentialStore, Token, TokenStore};
use serde::Serialize;
use std::io::Read;
use std::path::Path;

#[derive(Subcommand)]
pub enum TokenSubcommand {
    /// Store a token for an account (read from stdin unless --token is given)
    Set {
        /// Account alias
        alias: String,
        /// Platform username the token belongs to (default: the account's username)
        #[arg(long)]
        username: Option<String>,
        /// Token value; prefer stdin so it stays out of shell history
        #[arg(long)]
        token: Option<String>,
    },
    /// Check that a stored token is bound to the expected user
    Validate {
        /// Account alias
        alias: String,
        /// Expected username (default: the account's username)
        #[arg(long)]
        username: Option<String>,
    },
    /// Delete a stored token
    Remove {
        /// Account alias
        alias: String,
    },
    /// List accounts with stored tokens
    List,
}

#[derive(Serialize)]
struct TokenRow {
    alias: String,
    username: String,
    valid: bool,
    last_validated: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn run(home: &Path, subcommand: TokenSubcommand, json: bool) -> anyhow::Result<()> {
    let store = CredentialStore::new(home);
    match subcommand {
        TokenSubcommand::Set {
            alias,
            username,
            token,
        } => {
            let config = cmd::load_config(home)?;
            let account = config.identity(&alias)?;
            let username = username
                .filter(|u| !u.trim().is_empty())
                .unwrap_or(account.platform_username);
            if username.trim().is_empty() {
                anyhow::bail!("no platform username for '{alias}'; pass --username");
            }
            let value = match token {
                Some(t) => t,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read token from stdin")?;
                    buf
                }
            };
            let token = Token::new(value.trim());
            cmd::block_on(store.store_token(&alias, token, &username))??;
            println!("stored token for '{alias}' (bound to {username})");
            Ok(())
        }

        TokenSubcommand::Validate { alias, username } => {
            let expected = match username {
                Some(u) => u,
                None => cmd::load_config(home)?.identity(&alias)?.platform_username,
            };
            cmd::block_on(store.validate_token_isolation(&alias, &expected))??;
            println!("token for '{alias}' is bound to {expected}");
            Ok(())
        }

        TokenSubcommand::Remove { alias } => {
            if cmd::block_on(store.remove_token(&alias))?? {
                println!("removed token for '{alias}'");
            } else {
                println!("no token stored for '{alias}'");
            }
            Ok(())
        }

        TokenSubcommand::List => {
            let rows = cmd::block_on(async {
                let mut rows = Vec::new();
                for alias in store.list_aliases()? {
                    if let Some(state) = store.token_state(&alias).await? {
                        rows.push(TokenRow {
                            alias,
                            username: state.username,
                            valid: state.valid,
                            last_validated: state.last_validated,
                        });
                    }
                }
                anyhow::Ok(rows)
            })??;

            if json {
                return print_json(&rows);
            }
            if rows.is_empty() {
                println!("no tokens stored");
                return Ok(());
            }
            print_table(
                &["ALIAS", "USERNAME", "VALID", "LAST VALIDATED"],
                rows.into_iter()
                    .map(|r| {
                        vec![
                            r.alias,
                            r.username,
                            if r.valid { "yes" } else { "no" }.into(),
                            fmt_time(r.last_validated),
                        ]
                    })
                    .collect(),
            );
            Ok(())
        }
    }
}
