//! Shared test utilities for core module tests
//!
//! Provides an in-memory stand-in for iptables so manager tests never touch
//! the real kernel. This module is only compiled in test mode.

use crate::host::{CommandOutput, DynHost, Host, HostError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

const BUILTIN_TARGETS: [&str; 9] = [
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "LOG",
    "DNAT",
    "SNAT",
    "MASQUERADE",
    "REDIRECT",
];

const NO_SUCH_CHAIN: &str = "iptables: No chain/target/match by that name.\n";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).\n";

#[derive(Debug, Default)]
struct FakeTable {
    /// Chains in creation order: (name, built-in, rules)
    chains: Vec<(String, bool, Vec<Vec<String>>)>,
}

impl FakeTable {
    fn new(table: &str) -> Self {
        let builtins: &[&str] = match table {
            "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            "filter" => &["INPUT", "FORWARD", "OUTPUT"],
            _ => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        };
        Self {
            chains: builtins
                .iter()
                .map(|c| ((*c).to_string(), true, Vec::new()))
                .collect(),
        }
    }

    fn chain(&self, name: &str) -> Option<&(String, bool, Vec<Vec<String>>)> {
        self.chains.iter().find(|(c, _, _)| c == name)
    }

    fn rules_mut(&mut self, name: &str) -> Option<&mut Vec<Vec<String>>> {
        self.chains
            .iter_mut()
            .find(|(c, _, _)| c == name)
            .map(|(_, _, rules)| rules)
    }

    fn target_known(&self, rule: &[String]) -> bool {
        match chain_target(rule) {
            Some(t) => BUILTIN_TARGETS.contains(&t.as_str()) || self.chain(t).is_some(),
            None => true,
        }
    }

    fn references(&self, name: &str) -> usize {
        self.chains
            .iter()
            .flat_map(|(_, _, rules)| rules)
            .filter(|rule| chain_target(rule).is_some_and(|t| t == name))
            .count()
    }

    fn save_lines(&self, only: Option<&str>) -> String {
        let mut out = String::new();
        let selected = self
            .chains
            .iter()
            .filter(|(c, _, _)| only.is_none_or(|o| o == c));

        for (name, builtin, _) in selected.clone() {
            if *builtin {
                out.push_str(&format!("-P {name} ACCEPT\n"));
            } else {
                out.push_str(&format!("-N {name}\n"));
            }
        }
        for (name, _, rules) in selected {
            for rule in rules {
                out.push_str(&format!("-A {name}"));
                for arg in rule {
                    if arg.contains(' ') {
                        out.push_str(&format!(" \"{arg}\""));
                    } else {
                        out.push(' ');
                        out.push_str(arg);
                    }
                }
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct FakeState {
    tables: HashMap<String, FakeTable>,
    history: Vec<Vec<String>>,
    /// Canned failures returned (in order) instead of running the next commands
    injected: Vec<Result<CommandOutput, HostError>>,
    /// One-shot failures for the first command carrying a given operation flag
    fail_on: Vec<(String, CommandOutput)>,
}

/// Value after `-j` or `-g`.
fn chain_target(rule: &[String]) -> Option<&String> {
    rule.iter()
        .position(|a| a == "-j" || a == "-g")
        .and_then(|i| rule.get(i + 1))
}

/// In-memory iptables emulation implementing [`Host`].
///
/// Understands `-t <table> [-w <n>] -N/-S/-A/-C/-D/-F/-X` with the same
/// messages and exit codes as iptables-legacy.
#[derive(Debug, Clone, Default)]
pub struct FakeIptables {
    state: Arc<Mutex<FakeState>>,
}

fn exit(code: i32, stdout: String, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into_bytes(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code: Some(code),
    }
}

impl FakeIptables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_host(&self) -> DynHost {
        Arc::new(self.clone())
    }

    /// Every argument list received so far, in order.
    pub fn history(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().history.clone()
    }

    /// Number of commands using the given operation flag (e.g. `-A`).
    pub fn count_ops(&self, flag: &str) -> usize {
        self.history()
            .iter()
            .filter(|args| args.iter().any(|a| a == flag))
            .count()
    }

    /// Queues a tool failure for the next command.
    pub fn fail_next(&self, exit_code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .injected
            .push(Ok(exit(exit_code, String::new(), stderr)));
    }

    /// Fails the first later command using operation `flag` (e.g. `-X`),
    /// letting every command before it run normally.
    pub fn fail_on(&self, flag: &str, exit_code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .push((flag.to_string(), exit(exit_code, String::new(), stderr)));
    }

    /// Queues a host-level timeout for the next command.
    pub fn time_out_next(&self) {
        self.state
            .lock()
            .unwrap()
            .injected
            .push(Err(HostError::Timeout(Duration::from_secs(30))));
    }

    /// Creates a custom chain directly, bypassing the manager.
    pub fn seed_chain(&self, table: &str, chain: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| FakeTable::new(table))
            .chains
            .push((chain.to_string(), false, Vec::new()));
    }

    /// Appends a rule directly, bypassing the manager.
    pub fn seed_rule(&self, table: &str, chain: &str, rule: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let table = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| FakeTable::new(table));
        table
            .rules_mut(chain)
            .expect("seeded chain must exist")
            .push(rule.iter().map(|s| (*s).to_string()).collect());
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .is_some_and(|t| t.chain(chain).is_some())
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|t| t.chain(chain))
            .map(|(_, _, rules)| rules.clone())
            .unwrap_or_default()
    }

    /// Full `-S` listing of a table.
    pub fn dump(&self, table: &str) -> String {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .map_or_else(|| FakeTable::new(table).save_lines(None), |t| t.save_lines(None))
    }

    fn apply(state: &mut FakeState, args: &[String]) -> CommandOutput {
        let mut rest = args;
        let mut table_name = "filter".to_string();

        if rest.first().is_some_and(|a| a == "-t") {
            table_name = rest[1].clone();
            rest = &rest[2..];
        }
        if rest.first().is_some_and(|a| a == "-w") {
            rest = &rest[2..];
        }

        let table = state
            .tables
            .entry(table_name.clone())
            .or_insert_with(|| FakeTable::new(&table_name));

        let Some((op, rest)) = rest.split_first() else {
            return exit(2, String::new(), "iptables: no command specified\n");
        };
        let chain = rest.first().cloned();
        let rule: Vec<String> = rest.iter().skip(1).cloned().collect();

        match (op.as_str(), chain) {
            ("-S", None) => exit(0, table.save_lines(None), ""),
            ("-S", Some(chain)) => match table.chain(&chain) {
                Some(_) => exit(0, table.save_lines(Some(&chain)), ""),
                None => exit(1, String::new(), NO_SUCH_CHAIN),
            },
            ("-N", Some(chain)) => {
                if table.chain(&chain).is_some() {
                    exit(1, String::new(), "iptables: Chain already exists.\n")
                } else {
                    table.chains.push((chain, false, Vec::new()));
                    exit(0, String::new(), "")
                }
            }
            ("-A" | "-C" | "-D", Some(chain)) => {
                if table.chain(&chain).is_none() || !table.target_known(&rule) {
                    return exit(1, String::new(), NO_SUCH_CHAIN);
                }
                let rules = table.rules_mut(&chain).expect("chain checked above");
                let position = rules.iter().position(|r| *r == rule);
                match (op.as_str(), position) {
                    ("-A", _) => {
                        rules.push(rule);
                        exit(0, String::new(), "")
                    }
                    ("-C", Some(_)) => exit(0, String::new(), ""),
                    ("-D", Some(i)) => {
                        rules.remove(i);
                        exit(0, String::new(), "")
                    }
                    _ => exit(1, String::new(), BAD_RULE),
                }
            }
            ("-F", Some(chain)) => match table.rules_mut(&chain) {
                Some(rules) => {
                    rules.clear();
                    exit(0, String::new(), "")
                }
                None => exit(1, String::new(), NO_SUCH_CHAIN),
            },
            ("-X", Some(chain)) => {
                let refused = match table.chain(&chain) {
                    None | Some((_, true, _)) => Some(NO_SUCH_CHAIN),
                    Some(_) if table.references(&chain) > 0 => Some("iptables: Too many links.\n"),
                    Some((_, _, rules)) if !rules.is_empty() => {
                        Some("iptables: Directory not empty.\n")
                    }
                    Some(_) => None,
                };
                match refused {
                    Some(stderr) => exit(1, String::new(), stderr),
                    None => {
                        table.chains.retain(|(c, _, _)| *c != chain);
                        exit(0, String::new(), "")
                    }
                }
            }
            _ => exit(2, String::new(), "iptables: unknown option\n"),
        }
    }
}

#[async_trait]
impl Host for FakeIptables {
    fn describe(&self) -> String {
        "fake-iptables".to_string()
    }

    async fn execute(&self, _program: &str, args: &[String]) -> Result<CommandOutput, HostError> {
        let mut state = self.state.lock().unwrap();
        state.history.push(args.to_vec());

        if !state.injected.is_empty() {
            return state.injected.remove(0);
        }
        if let Some(i) = state
            .fail_on
            .iter()
            .position(|(flag, _)| args.contains(flag))
        {
            return Ok(state.fail_on.remove(i).1);
        }

        Ok(Self::apply(&mut state, args))
    }
}
