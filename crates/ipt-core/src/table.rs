//! Tables, their built-in chains, and the commit cycle against a
//! [`TableStore`].

use crate::chain::{CHAIN_NAME_MAX, Chain};
use crate::error::{Error, Result};
use crate::ext::{Verdict, available_targets};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Netfilter hook points, in kernel order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    PreRouting,
    LocalIn,
    Forward,
    LocalOut,
    PostRouting,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::PreRouting,
        Hook::LocalIn,
        Hook::Forward,
        Hook::LocalOut,
        Hook::PostRouting,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Name of the built-in chain attached to this hook
    pub fn chain_name(self) -> &'static str {
        match self {
            Hook::PreRouting => "PREROUTING",
            Hook::LocalIn => "INPUT",
            Hook::Forward => "FORWARD",
            Hook::LocalOut => "OUTPUT",
            Hook::PostRouting => "POSTROUTING",
        }
    }

    pub fn from_chain_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|hook| hook.chain_name() == name)
    }
}

/// The built-in IPv4 tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableName {
    Filter,
    Nat,
    Mangle,
    Raw,
    Security,
}

impl TableName {
    pub const ALL: [TableName; 5] = [
        TableName::Filter,
        TableName::Nat,
        TableName::Mangle,
        TableName::Raw,
        TableName::Security,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Filter => "filter",
            TableName::Nat => "nat",
            TableName::Mangle => "mangle",
            TableName::Raw => "raw",
            TableName::Security => "security",
        }
    }

    /// Hooks this table registers on, in hook order
    pub fn hooks(self) -> &'static [Hook] {
        match self {
            TableName::Filter | TableName::Security => {
                &[Hook::LocalIn, Hook::Forward, Hook::LocalOut]
            }
            TableName::Nat => &[
                Hook::PreRouting,
                Hook::LocalIn,
                Hook::LocalOut,
                Hook::PostRouting,
            ],
            TableName::Mangle => &Hook::ALL,
            TableName::Raw => &[Hook::PreRouting, Hook::LocalOut],
        }
    }

    /// Bitmask of `1 << hook` as the kernel reports it
    pub fn valid_hooks(self) -> u32 {
        self.hooks()
            .iter()
            .fold(0, |mask, hook| mask | (1 << hook.index()))
    }
}

impl FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::UnknownTable {
                name: s.to_string(),
            })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where committed tables live. The kernel backend implements this; tests
/// substitute an in-memory one.
pub trait TableStore {
    /// Read the live table
    fn fetch(&mut self, name: TableName) -> Result<Table>;

    /// Atomically swap the live table for `table`. On error the live table
    /// is unchanged.
    fn replace(&mut self, table: &Table) -> Result<()>;
}

/// A working copy of one table plus the last state known to be live
#[derive(Debug, Clone)]
pub struct Table {
    name: TableName,
    chains: Vec<Chain>,
    committed: Vec<Chain>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.chains == other.chains
    }
}

impl Table {
    /// An empty table: built-in chains only, all with ACCEPT policy
    pub fn new(name: TableName) -> Self {
        let chains: Vec<Chain> = name
            .hooks()
            .iter()
            .map(|hook| Chain::builtin(hook.chain_name(), Verdict::Accept))
            .collect();
        Self {
            name,
            committed: chains.clone(),
            chains,
        }
    }

    /// Assemble a table from decoded chains. Built-in chains must all be
    /// present; user chains are sorted into place.
    pub fn from_chains(name: TableName, chains: Vec<Chain>) -> Result<Self> {
        let mut builtin: Vec<Option<Chain>> = vec![None; name.hooks().len()];
        let mut user: Vec<Chain> = Vec::new();

        for chain in chains {
            let slot = name
                .hooks()
                .iter()
                .position(|hook| hook.chain_name() == chain.name());
            match slot {
                Some(index) if chain.is_builtin() => {
                    if builtin[index].is_some() {
                        return Err(Error::ChainExists {
                            table: name.to_string(),
                            chain: chain.name().to_string(),
                        });
                    }
                    builtin[index] = Some(chain);
                }
                _ => {
                    validate_chain_name(chain.name())?;
                    if user.iter().any(|other| other.name() == chain.name()) {
                        return Err(Error::ChainExists {
                            table: name.to_string(),
                            chain: chain.name().to_string(),
                        });
                    }
                    user.push(chain);
                }
            }
        }

        let mut chains = Vec::with_capacity(builtin.len() + user.len());
        for (hook, chain) in name.hooks().iter().zip(builtin) {
            chains.push(chain.ok_or_else(|| Error::ChainNotFound {
                table: name.to_string(),
                chain: hook.chain_name().to_string(),
            })?);
        }
        user.sort_by(|a, b| a.name().cmp(b.name()));
        chains.extend(user);

        Ok(Self {
            name,
            committed: chains.clone(),
            chains,
        })
    }

    pub fn name(&self) -> TableName {
        self.name
    }

    /// Built-in chains in hook order, then user chains by name
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn builtin_chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter().filter(|chain| chain.is_builtin())
    }

    pub fn user_chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter().filter(|chain| !chain.is_builtin())
    }

    pub fn is_chain(&self, name: &str) -> bool {
        self.chain(name).is_some()
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|chain| chain.name() == name)
    }

    pub fn chain_mut(&mut self, name: &str) -> Result<&mut Chain> {
        let table = self.name;
        self.chains
            .iter_mut()
            .find(|chain| chain.name() == name)
            .ok_or_else(|| Error::ChainNotFound {
                table: table.to_string(),
                chain: name.to_string(),
            })
    }

    fn not_found(&self, chain: &str) -> Error {
        Error::ChainNotFound {
            table: self.name.to_string(),
            chain: chain.to_string(),
        }
    }

    /// Create an empty user chain
    pub fn create_chain(&mut self, name: &str) -> Result<&mut Chain> {
        if self.is_chain(name) {
            return Err(Error::ChainExists {
                table: self.name.to_string(),
                chain: name.to_string(),
            });
        }
        validate_chain_name(name)?;

        let index = self.user_slot(name);
        self.chains.insert(index, Chain::user(name));
        debug!(table = %self.name, chain = name, "created chain");
        Ok(&mut self.chains[index])
    }

    /// Sorted insertion point among the user chains
    fn user_slot(&self, name: &str) -> usize {
        let builtin = self.name.hooks().len();
        builtin
            + self.chains[builtin..]
                .iter()
                .take_while(|chain| chain.name() < name)
                .count()
    }

    /// Delete an empty, unreferenced user chain
    pub fn delete_chain(&mut self, name: &str) -> Result<()> {
        let index = self
            .chains
            .iter()
            .position(|chain| chain.name() == name)
            .ok_or_else(|| self.not_found(name))?;
        let chain = &self.chains[index];

        if chain.is_builtin() {
            return Err(Error::BuiltinChain {
                chain: name.to_string(),
            });
        }
        if !chain.is_empty() {
            return Err(Error::ChainNotEmpty {
                chain: name.to_string(),
            });
        }
        if let Some(referrer) = self.chains.iter().find(|other| other.references(name)) {
            return Err(Error::ChainInUse {
                chain: name.to_string(),
                referenced_by: referrer.name().to_string(),
            });
        }

        self.chains.remove(index);
        debug!(table = %self.name, chain = name, "deleted chain");
        Ok(())
    }

    /// Rename a user chain, rewriting every jump that targets it
    pub fn rename_chain(&mut self, old: &str, new: &str) -> Result<()> {
        let chain = self.chain(old).ok_or_else(|| self.not_found(old))?;
        if chain.is_builtin() {
            return Err(Error::BuiltinChain {
                chain: old.to_string(),
            });
        }
        if self.is_chain(new) {
            return Err(Error::ChainExists {
                table: self.name.to_string(),
                chain: new.to_string(),
            });
        }
        validate_chain_name(new)?;

        for rule in self
            .chains
            .iter_mut()
            .flat_map(|chain| chain.rules_mut().iter_mut())
        {
            if let Some(target) = rule.target.as_mut() {
                target.rename_chain(old, new);
            }
        }

        let index = self
            .chains
            .iter()
            .position(|chain| chain.name() == old)
            .ok_or_else(|| self.not_found(old))?;
        let mut chain = self.chains.remove(index);
        chain.set_name(new);
        let slot = self.user_slot(new);
        self.chains.insert(slot, chain);
        debug!(table = %self.name, old, new, "renamed chain");
        Ok(())
    }

    pub fn policy(&self, chain: &str) -> Result<Option<Verdict>> {
        self.chain(chain)
            .map(Chain::policy)
            .ok_or_else(|| self.not_found(chain))
    }

    /// Set a built-in chain's policy by name (`ACCEPT` or `DROP`)
    pub fn set_policy(&mut self, chain: &str, policy: &str) -> Result<()> {
        let verdict = Verdict::parse(policy).ok_or_else(|| Error::InvalidPolicy {
            chain: chain.to_string(),
            policy: policy.to_string(),
        })?;
        self.chain_mut(chain)?.set_policy(verdict)
    }

    /// Remove every rule from every chain
    pub fn flush(&mut self) {
        for chain in &mut self.chains {
            chain.flush();
        }
    }

    pub fn zero_counters(&mut self) {
        for chain in &mut self.chains {
            chain.zero_counters();
        }
    }

    /// Check everything the kernel would refuse: extension constraints,
    /// jumps to missing or built-in chains, and jump loops.
    pub fn validate(&self) -> Result<()> {
        for chain in &self.chains {
            for rule in chain.rules() {
                rule.validate()?;
                let Some(target) = rule.target.as_ref().and_then(|t| t.chain()) else {
                    continue;
                };
                match self.chain(target) {
                    None => return Err(self.not_found(target)),
                    Some(dest) if dest.is_builtin() => {
                        return Err(Error::BuiltinChain {
                            chain: target.to_string(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        self.check_loops()
    }

    fn check_loops(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            table: &'a Table,
            chain: &'a Chain,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<()> {
            match marks.get(chain.name()) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(Error::ChainLoop {
                        chain: chain.name().to_string(),
                    });
                }
                None => {}
            }
            marks.insert(chain.name(), Mark::Visiting);
            for dest in chain
                .rules()
                .iter()
                .filter_map(|rule| rule.target.as_ref().and_then(|t| t.chain()))
                .filter_map(|name| table.chain(name))
            {
                visit(table, dest, marks)?;
            }
            marks.insert(chain.name(), Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for chain in &self.chains {
            visit(self, chain, &mut marks)?;
        }
        Ok(())
    }

    /// Whether the working copy differs from the last committed state
    pub fn is_dirty(&self) -> bool {
        self.chains != self.committed
    }

    /// Read the live table from `store`
    pub fn load<S: TableStore + ?Sized>(store: &mut S, name: TableName) -> Result<Self> {
        store.fetch(name)
    }

    /// Replace the working copy with the live table, dropping local edits
    pub fn refresh<S: TableStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        if self.is_dirty() {
            warn!(table = %self.name, "discarding uncommitted changes on refresh");
        }
        *self = store.fetch(self.name)?;
        Ok(())
    }

    /// Validate and atomically install the working copy. On failure the
    /// committed snapshot is untouched.
    pub fn commit<S: TableStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        self.validate()?;
        store.replace(self)?;
        self.committed = self.chains.clone();
        info!(
            table = %self.name,
            chains = self.chains.len(),
            rules = self.chains.iter().map(Chain::len).sum::<usize>(),
            "committed table"
        );
        Ok(())
    }

    /// Throw away uncommitted edits
    pub fn rollback(&mut self) {
        self.chains = self.committed.clone();
    }

    /// Apply a batch of edits and commit them together. If the batch or the
    /// commit fails, the working copy returns to its state before the batch.
    pub fn transaction<S, F, T>(&mut self, store: &mut S, edit: F) -> Result<T>
    where
        S: TableStore + ?Sized,
        F: FnOnce(&mut Table) -> Result<T>,
    {
        let before = self.chains.clone();
        let result = edit(self).and_then(|value| self.commit(store).map(|()| value));
        if let Err(err) = &result {
            debug!(table = %self.name, error = %err, "transaction failed, restoring working copy");
            self.chains = before;
        }
        result
    }
}

/// iptables-save format
impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "*{}", self.name)?;
        for chain in &self.chains {
            let policy = chain.policy().map(Verdict::as_str).unwrap_or("-");
            writeln!(
                f,
                ":{} {} [{}:{}]",
                chain.name(),
                policy,
                chain.counters.packets,
                chain.counters.bytes
            )?;
        }
        for chain in &self.chains {
            for rule in chain.rules() {
                let rendered = rule.to_string();
                if rendered.is_empty() {
                    writeln!(f, "-A {}", chain.name())?;
                } else {
                    writeln!(f, "-A {} {}", chain.name(), rendered)?;
                }
            }
        }
        writeln!(f, "COMMIT")
    }
}

fn validate_chain_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidChainName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("empty name");
    }
    if name.len() > CHAIN_NAME_MAX {
        return invalid("name longer than 28 bytes");
    }
    if name.starts_with('-') || name.starts_with('!') {
        return invalid("name may not start with '-' or '!'");
    }
    if name.contains(|c: char| c.is_whitespace() || c.is_control()) {
        return invalid("name contains whitespace");
    }
    if Verdict::parse(name).is_some() || Hook::from_chain_name(name).is_some() {
        return invalid("name is reserved");
    }
    if name == "ERROR" || available_targets().contains(&name) {
        return invalid("name clashes with a target");
    }
    Ok(())
}
