//! Idempotent chain, link and DNAT management
//!
//! The [`Manager`] keeps no record of what it has created. Every operation
//! first asks the live table whether the desired state already holds (chain
//! listing for chains, `iptables -C` for rules) and only mutates when it does
//! not, so re-running a setup sequence converges on the same rule set.
//!
//! Concurrent writers are not coordinated: two managers racing on the same
//! chain can both pass a check before either appends.

use crate::core::command::{CommandBuilder, Operation, RuleSpec, display_command};
use crate::core::comment::wrap_comment;
use crate::core::error::{Error, FailureKind, Result, classify_failure};
use crate::core::listing::{Link, TableListing};
use crate::core::tables::{Destination, NAT_TABLE, PortSpec, Protocol, is_builtin_chain};
use crate::host::{CommandOutput, DynHost};
use crate::validators;
use tracing::{debug, info, warn};

/// iptables binary used when none is configured
pub const DEFAULT_IPTABLES_PATH: &str = match option_env!("IPTCTL_SYSTEM_IPTABLES_PATH") {
    Some(path) => path,
    None => "iptables",
};

/// Fixed settings applied to every command a [`Manager`] issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// iptables binary on the target host
    pub program: String,
    /// Pass `-w <secs>` to wait for the xtables lock
    pub lock_wait_secs: Option<u32>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            program: DEFAULT_IPTABLES_PATH.to_string(),
            lock_wait_secs: None,
        }
    }
}

/// Drives iptables on one host.
pub struct Manager {
    host: DynHost,
    options: ManagerOptions,
}

fn chain_label(table: &str, chain: &str) -> String {
    format!("chain `{chain}` in table `{table}`")
}

fn rule_label(table: &str, chain: &str, rule: &RuleSpec) -> String {
    format!(
        "rule `{}` in chain `{chain}` of table `{table}`",
        rule.comment.description()
    )
}

fn check_table(table: &str) -> Result<()> {
    validators::validate_table_name(table).map_err(|m| Error::validation("table", m))
}

fn check_chain(field: &str, chain: &str) -> Result<()> {
    validators::validate_chain_name(chain).map_err(|m| Error::validation(field, m))
}

impl Manager {
    pub fn new(host: DynHost) -> Self {
        Self::with_options(host, ManagerOptions::default())
    }

    pub fn with_options(host: DynHost, options: ManagerOptions) -> Self {
        Self { host, options }
    }

    /// Runs one operation and returns its raw output with the rendered command line.
    async fn run(&self, table: &str, op: Operation<'_>) -> Result<(CommandOutput, String)> {
        let args = CommandBuilder::new(table)
            .with_lock_wait(self.options.lock_wait_secs)
            .build(op);
        let command = display_command(&self.options.program, &args);

        debug!(host = %self.host.describe(), %command, "executing");

        match self.host.execute(&self.options.program, &args).await {
            Ok(output) => Ok((output, command)),
            Err(source) => Err(Error::Host { command, source }),
        }
    }

    /// Runs one operation, turning a non-zero exit into a classified error.
    async fn run_checked(
        &self,
        table: &str,
        op: Operation<'_>,
        what: &str,
    ) -> Result<CommandOutput> {
        let (output, command) = self.run(table, op).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::from_failure(
                what,
                command,
                output.exit_code,
                &output.stderr_lossy(),
            ))
        }
    }

    /// Runs a read-only query where a recognized "not found" answer means absent.
    ///
    /// Returns `None` when absent.
    async fn query(
        &self,
        table: &str,
        op: Operation<'_>,
        what: &str,
    ) -> Result<Option<CommandOutput>> {
        let (output, command) = self.run(table, op).await?;
        if output.success() {
            return Ok(Some(output));
        }

        let stderr = output.stderr_lossy();
        match classify_failure(output.exit_code, &stderr) {
            FailureKind::NotFound => Ok(None),
            _ => Err(Error::from_failure(what, command, output.exit_code, &stderr)),
        }
    }

    /// Checks whether a fully specified rule is present without changing anything.
    async fn check_rule(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<bool> {
        let what = rule_label(table, chain, rule);
        let present = self
            .query(table, Operation::Check(chain, rule), &what)
            .await?
            .is_some();
        debug!(%what, present, "rule check");
        Ok(present)
    }

    async fn append_rule_if_absent(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<()> {
        let what = rule_label(table, chain, rule);

        if self.check_rule(table, chain, rule).await? {
            debug!(%what, "already present, nothing to append");
            return Ok(());
        }

        self.run_checked(table, Operation::Append(chain, rule), &what)
            .await?;
        info!(%what, "appended");
        Ok(())
    }

    async fn delete_rule(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<()> {
        let what = rule_label(table, chain, rule);

        if !self.check_rule(table, chain, rule).await? {
            return Err(Error::NotFound {
                what,
                detail: "no rule with this specification".to_string(),
            });
        }

        self.run_checked(table, Operation::Delete(chain, rule), &what)
            .await?;
        info!(%what, "deleted");
        Ok(())
    }

    async fn list_table(&self, table: &str) -> Result<TableListing> {
        let output = self
            .run_checked(table, Operation::List(None), &format!("table `{table}`"))
            .await?;
        Ok(TableListing::parse(&output.stdout_lossy()))
    }

    /// Reports whether `chain` exists in `table`.
    ///
    /// # Errors
    ///
    /// Fails on invalid names, or when the listing fails for any reason other
    /// than the chain being absent.
    pub async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        check_table(table)?;
        check_chain("chain", chain)?;

        let exists = self
            .query(table, Operation::List(Some(chain)), &chain_label(table, chain))
            .await?
            .is_some();
        Ok(exists)
    }

    /// Creates a custom chain unless a chain with that name already exists.
    pub async fn create_chain_for_table(&self, table: &str, chain: &str) -> Result<()> {
        let what = chain_label(table, chain);

        if self.chain_exists(table, chain).await? {
            debug!(%what, "already exists, nothing to create");
            return Ok(());
        }

        match self
            .run_checked(table, Operation::NewChain(chain), &what)
            .await
        {
            Ok(_) => {
                info!(%what, "created");
                Ok(())
            }
            Err(Error::AlreadyExists { detail, .. }) => {
                warn!(%what, %detail, "chain appeared between check and create");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Links `child` into `parent` with a jump rule tagged by `description`.
    ///
    /// The tag, not the chain names, identifies the link: calling this again
    /// with the same arguments leaves exactly one such jump rule.
    pub async fn append_chain_to_parent_chain(
        &self,
        table: &str,
        parent: &str,
        child: &str,
        description: &str,
    ) -> Result<()> {
        check_table(table)?;
        check_chain("parent chain", parent)?;
        check_chain("child chain", child)?;
        let rule = RuleSpec::jump(child, wrap_comment(description)?);

        self.append_rule_if_absent(table, parent, &rule).await
    }

    /// Appends a DNAT rule to `chain` in the nat table forwarding
    /// `protocol`/`port` to `destination` (`ip` or `ip:port`).
    pub async fn append_dnat_rule_to_chain(
        &self,
        chain: &str,
        protocol: &str,
        port: &str,
        destination: &str,
        description: &str,
    ) -> Result<()> {
        let rule = dnat_rule(chain, protocol, port, destination, description)?;
        self.append_rule_if_absent(NAT_TABLE, chain, &rule).await
    }

    /// Removes a DNAT rule previously added with the same arguments.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if no such rule exists.
    pub async fn delete_dnat_rule_from_chain(
        &self,
        chain: &str,
        protocol: &str,
        port: &str,
        destination: &str,
        description: &str,
    ) -> Result<()> {
        let rule = dnat_rule(chain, protocol, port, destination, description)?;
        self.delete_rule(NAT_TABLE, chain, &rule).await
    }

    /// Removes only the jump rule linking `child` into `parent`.
    ///
    /// Used to detach a chain that has several parents before the final
    /// [`Manager::delete_chain`].
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if the link does not exist.
    pub async fn remove_link(
        &self,
        table: &str,
        parent: &str,
        child: &str,
        description: &str,
    ) -> Result<()> {
        check_table(table)?;
        check_chain("parent chain", parent)?;
        check_chain("child chain", child)?;
        let rule = RuleSpec::jump(child, wrap_comment(description)?);

        self.delete_rule(table, parent, &rule).await
    }

    /// Removes the link `parent -> chain` tagged `description`, then the chain.
    ///
    /// Before anything is changed, the table is inspected: if `chain` still
    /// links to other custom chains, or other rules besides this link jump
    /// (`-j`) or go (`-g`) to it, the call fails with `Error::Busy` and the
    /// table is left untouched. Otherwise the link is deleted, the chain's own
    /// rules are flushed and the chain is removed.
    ///
    /// The inspection and the three changes are not atomic. If iptables still
    /// refuses the final removal, the link is already gone and the chain is
    /// left in place, empty; the error is returned as-is and a retry reports
    /// the link as not found.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the link does not exist
    /// - `Error::Busy` if the chain is still in use
    /// - `Error::Validation` for built-in chains and malformed names
    pub async fn delete_chain(
        &self,
        table: &str,
        parent: &str,
        chain: &str,
        description: &str,
    ) -> Result<()> {
        check_table(table)?;
        check_chain("parent chain", parent)?;
        check_chain("chain", chain)?;
        if is_builtin_chain(chain) {
            return Err(Error::validation(
                "chain",
                format!("built-in chain `{chain}` cannot be deleted"),
            ));
        }

        let link = RuleSpec::jump(chain, wrap_comment(description)?);
        let what = chain_label(table, chain);

        if !self.check_rule(table, parent, &link).await? {
            return Err(Error::NotFound {
                what: rule_label(table, parent, &link),
                detail: format!("`{parent}` has no link to `{chain}` with this description"),
            });
        }

        let listing = self.list_table(table).await?;

        let children: Vec<String> = listing
            .links_from(chain)
            .into_iter()
            .map(|l| l.child)
            .collect();
        if !children.is_empty() {
            return Err(Error::Busy {
                what,
                detail: format!("still links to {}; delete those first", children.join(", ")),
            });
        }

        let other_parents: Vec<&str> = listing
            .references_to(chain)
            .filter(|r| !(r.chain == parent && r.description() == Some(description)))
            .map(|r| r.chain.as_str())
            .collect();
        if !other_parents.is_empty() {
            return Err(Error::Busy {
                what,
                detail: format!("still referenced from {}", other_parents.join(", ")),
            });
        }

        self.run_checked(
            table,
            Operation::Delete(parent, &link),
            &rule_label(table, parent, &link),
        )
        .await?;
        info!(table, parent, chain, "link removed");

        self.run_checked(table, Operation::FlushChain(chain), &what)
            .await?;
        self.run_checked(table, Operation::DeleteChain(chain), &what)
            .await?;
        info!(%what, "deleted");
        Ok(())
    }

    /// Lists the custom chains `parent` jumps to, with their link descriptions.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if `parent` does not exist.
    pub async fn list_links(&self, table: &str, parent: &str) -> Result<Vec<Link>> {
        check_table(table)?;
        check_chain("parent chain", parent)?;

        let listing = self.list_table(table).await?;
        if !listing.has_chain(parent) {
            return Err(Error::NotFound {
                what: chain_label(table, parent),
                detail: "not present in table listing".to_string(),
            });
        }
        Ok(listing.links_from(parent))
    }
}

fn dnat_rule(
    chain: &str,
    protocol: &str,
    port: &str,
    destination: &str,
    description: &str,
) -> Result<RuleSpec> {
    check_chain("chain", chain)?;
    let protocol: Protocol = protocol.parse().map_err(|_| {
        Error::validation(
            "protocol",
            format!("'{protocol}' is not one of tcp, udp, sctp, dccp"),
        )
    })?;
    let port: PortSpec = port.parse().map_err(|m| Error::validation("port", m))?;
    let destination: Destination = destination
        .parse()
        .map_err(|m| Error::validation("destination", m))?;

    Ok(RuleSpec::dnat(
        protocol,
        port,
        destination,
        wrap_comment(description)?,
    ))
}
