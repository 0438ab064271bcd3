//! Core iptables management functionality
//!
//! This module contains the types and logic for building iptables commands,
//! reading table listings back, and driving idempotent changes through a
//! [`crate::host::Host`]. It provides:
//!
//! - [`manager`]: Check-then-act chain, link and DNAT operations
//! - [`command`]: Argument construction for every iptables invocation
//! - [`listing`]: Parsing of `iptables -S` output
//! - [`comment`]: Description tags carried on managed rules
//! - [`tables`]: Table and chain names, protocols, ports and destinations
//! - [`error`]: Error types and iptables stderr classification

pub mod command;
pub mod comment;
pub mod error;
pub mod listing;
pub mod manager;
pub mod tables;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
