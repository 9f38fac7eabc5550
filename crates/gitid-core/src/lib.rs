//! `gitid-core`: switch the active developer identity across ssh-agent,
//! git config and a credential store as one all-or-nothing operation.
//!
//! ```text
//! StateManager::transition_to(alias)
//!     │  one switch at a time
//!     ▼
//! TransitionPlanner   ← target state + ordered steps
//!     │
//!     ▼
//! TransactionEngine   ← token → ssh → git → environment
//!     │                  reverse-order rollback on failure
//!     ▼
//! TokenStore / AgentManager / GitConfigWriter / EnvironmentSync
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod git;
pub mod identity;
pub mod io;
pub mod manager;
pub mod paths;
pub mod planner;
pub mod process;
pub mod ssh;
pub mod state;
pub mod token;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use error::{GitidError, Result};
pub use manager::StateManager;
pub use transaction::{Subsystems, TransitionError};
