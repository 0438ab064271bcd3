//! Parsing of `iptables -S` output
//!
//! The save format prints one command per line (`-P`, `-N`, `-A`), quoting
//! arguments that contain spaces. iptables normalizes rules when printing them
//! (e.g. an implicit `-m tcp` is added), so listings are never compared
//! textually against built rules; rule existence always goes through `-C`.
//! Listings are used to find which chains exist and which rules jump where.

use crate::core::comment::unwrap_comment;
use serde::Serialize;

/// A rule line from a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    pub chain: String,
    /// Arguments after `-A <chain>`
    pub args: Vec<String>,
}

impl ListedRule {
    fn value_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Raw `--comment` text, if any.
    pub fn comment(&self) -> Option<&str> {
        self.value_after("--comment")
    }

    /// Description recovered from a comment tag written by this crate.
    pub fn description(&self) -> Option<&str> {
        self.comment().and_then(unwrap_comment)
    }

    /// Target of `-j`.
    pub fn jump_target(&self) -> Option<&str> {
        self.value_after("-j")
    }

    /// Chain this rule hands packets to, by `-j` or by `-g` (goto).
    pub fn chain_target(&self) -> Option<&str> {
        self.jump_target().or_else(|| self.value_after("-g"))
    }
}

/// A parent→child jump found in a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub parent: String,
    pub child: String,
    /// `None` when the jump rule has no comment tag from this crate
    pub description: Option<String>,
}

/// Parsed `-S` output of a table (or of a single chain)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableListing {
    /// Built-in chains with their default policy
    pub policies: Vec<(String, String)>,
    /// Custom chains
    pub chains: Vec<String>,
    pub rules: Vec<ListedRule>,
}

impl TableListing {
    pub fn parse(text: &str) -> Self {
        let mut listing = Self::default();

        for line in text.lines() {
            let mut args = split_args(line);
            if args.len() < 2 {
                continue;
            }
            match args[0].as_str() {
                "-P" => {
                    let policy = args.get(2).cloned().unwrap_or_default();
                    listing.policies.push((args.swap_remove(1), policy));
                }
                "-N" => listing.chains.push(args.swap_remove(1)),
                "-A" => {
                    let rest = args.split_off(2);
                    listing.rules.push(ListedRule {
                        chain: args.swap_remove(1),
                        args: rest,
                    });
                }
                _ => {}
            }
        }

        listing
    }

    pub fn is_custom_chain(&self, name: &str) -> bool {
        self.chains.iter().any(|c| c == name)
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.is_custom_chain(name) || self.policies.iter().any(|(c, _)| c == name)
    }

    pub fn rules_in<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a ListedRule> + 'a {
        self.rules.iter().filter(move |r| r.chain == chain)
    }

    /// Rules anywhere in the table that jump or go to `chain`.
    pub fn references_to<'a>(
        &'a self,
        chain: &'a str,
    ) -> impl Iterator<Item = &'a ListedRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.chain_target() == Some(chain))
    }

    /// Jumps from `parent` into custom chains of this table.
    pub fn links_from(&self, parent: &str) -> Vec<Link> {
        self.rules_in(parent)
            .filter_map(|rule| {
                let child = rule.jump_target()?;
                self.is_custom_chain(child).then(|| Link {
                    parent: parent.to_string(),
                    child: child.to_string(),
                    description: rule.description().map(String::from),
                })
            })
            .collect()
    }
}

/// Splits one save-format line into arguments.
///
/// Double quotes group words; inside quotes `\"` and `\\` are escapes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        args.push(current);
    }
    args
}
