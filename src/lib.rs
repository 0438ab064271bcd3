//! iptctl - idempotent iptables chain manager
//!
//! Creates custom chains, links them into parent chains with tagged jump
//! rules, and manages DNAT port forwards, on the local machine or over SSH.
//! Every change is preceded by a check against the live table, so running the
//! same setup twice leaves the same rules behind.
//!
//! # Architecture
//!
//! - [`core`] - Chain/link/DNAT operations, command building and error classification
//! - [`host`] - Where commands run: locally (optionally elevated) or via `ssh`
//! - [`audit`] - Audit logging for every rule change
//! - [`validators`] - Input validation before anything reaches iptables
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege escalation for local runs
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```no_run
//! use iptctl::host::local::{LocalConfig, LocalHost};
//! use iptctl::{Manager, NAT_TABLE, PREROUTING_CHAIN};
//! use std::sync::Arc;
//!
//! # async fn run() -> iptctl::Result<()> {
//! let manager = Manager::new(Arc::new(LocalHost::new(LocalConfig::default())));
//! manager.create_chain_for_table(NAT_TABLE, "DESKTOP-SERVICES").await?;
//! manager
//!     .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, "DESKTOP-SERVICES", "desktop services portal")
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod host;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, ErrorKind, Result};
pub use core::listing::Link;
pub use core::manager::{Manager, ManagerOptions};
pub use core::tables::{
    FILTER_TABLE, FORWARD_CHAIN, INPUT_CHAIN, NAT_TABLE, OUTPUT_CHAIN, POSTROUTING_CHAIN,
    PREROUTING_CHAIN,
};
pub use host::{DynHost, Host};
