//! iptables argument construction
//!
//! All argument lists are built here. Appending, checking and deleting a rule
//! share [`RuleSpec::args`], so the rule whose presence is checked is exactly
//! the rule that was appended and the one that will be deleted.

use crate::core::comment::CommentTag;
use crate::core::tables::{Destination, PortSpec, Protocol};

/// Where a matching packet goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Continue evaluation in another chain
    Jump(String),
    /// Rewrite the destination address
    Dnat(Destination),
}

impl Target {
    fn push_args(&self, args: &mut Vec<String>) {
        args.push("-j".to_string());
        match self {
            Self::Jump(chain) => args.push(chain.clone()),
            Self::Dnat(destination) => {
                args.push("DNAT".to_string());
                args.push("--to-destination".to_string());
                args.push(destination.to_string());
            }
        }
    }
}

/// Match conditions a rule can carry before its comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    /// `-p <protocol> --dport <port>`
    DestinationPort(Protocol, PortSpec),
}

/// A fully specified rule: matches, comment tag and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub matches: Vec<Match>,
    pub comment: CommentTag,
    pub target: Target,
}

impl RuleSpec {
    /// Jump rule linking a parent chain to `child`.
    pub fn jump(child: &str, comment: CommentTag) -> Self {
        Self {
            matches: Vec::new(),
            comment,
            target: Target::Jump(child.to_string()),
        }
    }

    /// Port-forwarding rule redirecting `protocol`/`port` to `destination`.
    pub fn dnat(
        protocol: Protocol,
        port: PortSpec,
        destination: Destination,
        comment: CommentTag,
    ) -> Self {
        Self {
            matches: vec![Match::DestinationPort(protocol, port)],
            comment,
            target: Target::Dnat(destination),
        }
    }

    /// Rule arguments following `-A/-C/-D <chain>`.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(8);

        for m in &self.matches {
            match m {
                Match::DestinationPort(protocol, port) => {
                    args.push("-p".to_string());
                    args.push(protocol.to_string());
                    args.push("--dport".to_string());
                    args.push(port.to_string());
                }
            }
        }

        args.push("-m".to_string());
        args.push("comment".to_string());
        args.push("--comment".to_string());
        args.push(self.comment.as_str().to_string());

        self.target.push_args(&mut args);
        args
    }
}

/// One iptables invocation against a table
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    /// `-N <chain>`
    NewChain(&'a str),
    /// `-S [<chain>]`
    List(Option<&'a str>),
    /// `-F <chain>`
    FlushChain(&'a str),
    /// `-X <chain>`
    DeleteChain(&'a str),
    /// `-A <chain> <rule>`
    Append(&'a str, &'a RuleSpec),
    /// `-C <chain> <rule>`
    Check(&'a str, &'a RuleSpec),
    /// `-D <chain> <rule>`
    Delete(&'a str, &'a RuleSpec),
}

/// Builds argument lists for a single table.
#[derive(Debug, Clone)]
pub struct CommandBuilder<'a> {
    table: &'a str,
    lock_wait_secs: Option<u32>,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(table: &'a str) -> Self {
        Self {
            table,
            lock_wait_secs: None,
        }
    }

    /// Adds `-w <secs>` so iptables waits for the xtables lock.
    pub fn with_lock_wait(mut self, secs: Option<u32>) -> Self {
        self.lock_wait_secs = secs;
        self
    }

    pub fn build(&self, op: Operation<'_>) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.table.to_string()];

        if let Some(secs) = self.lock_wait_secs {
            args.push("-w".to_string());
            args.push(secs.to_string());
        }

        let (flag, chain, rule) = match op {
            Operation::NewChain(chain) => ("-N", Some(chain), None),
            Operation::List(chain) => ("-S", chain, None),
            Operation::FlushChain(chain) => ("-F", Some(chain), None),
            Operation::DeleteChain(chain) => ("-X", Some(chain), None),
            Operation::Append(chain, rule) => ("-A", Some(chain), Some(rule)),
            Operation::Check(chain, rule) => ("-C", Some(chain), Some(rule)),
            Operation::Delete(chain, rule) => ("-D", Some(chain), Some(rule)),
        };

        args.push(flag.to_string());
        if let Some(chain) = chain {
            args.push(chain.to_string());
        }
        if let Some(rule) = rule {
            args.extend(rule.args());
        }
        args
    }
}

/// Renders a command line for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}
