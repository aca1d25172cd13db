//! Declarative ruleset documents.
//!
//! A document lists tables, their chains and rules in YAML or JSON. Applying
//! a table document replaces the rules of every chain it names; chains it
//! does not mention are left alone.

use crate::chain::Chain;
use crate::error::{Error, Result as IptResult};
use crate::ext::{Extension, Match, Param, Target, Verdict};
use crate::rule::Rule;
use crate::selector::{Address, Fragment, Interface};
use crate::table::{Table, TableName};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: TableName,
    #[serde(default)]
    pub chains: Vec<ChainSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    /// Built-in chains only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// `true` for `-f`, `false` for `! -f`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<ExtensionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Use `-g` instead of `-j` for a user chain
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub goto: bool,
}

enum Format {
    Yaml,
    Json,
}

fn format_of(path: &Path) -> Result<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        Some("json") => Ok(Format::Json),
        _ => bail!("Unsupported ruleset format for {:?}; use .yaml, .yml or .json", path),
    }
}

impl Ruleset {
    /// Load a ruleset from a YAML or JSON file, chosen by extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ruleset from {:?}", path))?;

        let ruleset = match format_of(path)? {
            Format::Yaml => Self::from_yaml(&content),
            Format::Json => Self::from_json(&content),
        }
        .with_context(|| format!("Failed to parse ruleset {:?}", path))?;

        debug!(path = ?path, tables = ruleset.tables.len(), "loaded ruleset");
        Ok(ruleset)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = match format_of(path)? {
            Format::Yaml => self.to_yaml()?,
            Format::Json => self.to_json()?,
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write ruleset to {:?}", path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse ruleset YAML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse ruleset JSON")
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn table(&self, name: TableName) -> Option<&TableSpec> {
        self.tables.iter().find(|table| table.name == name)
    }
}

impl TableSpec {
    /// A fresh table holding exactly this document
    pub fn build(&self) -> IptResult<Table> {
        let mut table = Table::new(self.name);
        self.apply(&mut table)?;
        Ok(table)
    }

    /// Create missing chains, set policies and replace the rules of every
    /// chain listed. Chains are created before any rule is built so jumps
    /// between them resolve.
    pub fn apply(&self, table: &mut Table) -> IptResult<()> {
        for chain in &self.chains {
            if !table.is_chain(&chain.name) {
                table.create_chain(&chain.name)?;
            }
            if let Some(policy) = &chain.policy {
                table.set_policy(&chain.name, policy)?;
            }
        }

        for chain in &self.chains {
            let rules = chain
                .rules
                .iter()
                .map(|rule| rule.to_rule(table))
                .collect::<IptResult<Vec<_>>>()?;
            let dest = table.chain_mut(&chain.name)?;
            dest.flush();
            for rule in rules {
                dest.append_rule(rule);
            }
        }
        Ok(())
    }

    /// Describe every chain of `table`
    pub fn from_table(table: &Table) -> Self {
        Self {
            name: table.name(),
            chains: table.chains().iter().map(ChainSpec::from_chain).collect(),
        }
    }
}

impl ChainSpec {
    fn from_chain(chain: &Chain) -> Self {
        Self {
            name: chain.name().to_string(),
            policy: chain.policy().map(|policy| policy.to_string()),
            rules: chain.rules().iter().map(RuleSpec::from_rule).collect(),
        }
    }
}

fn address_spec(address: &Address) -> Option<String> {
    if address.is_any() {
        return None;
    }
    let bang = if address.invert { "!" } else { "" };
    Some(format!("{}{}", bang, address.to_save()))
}

/// Apply params in the extension's declared order, so prerequisites such
/// as CLUSTERIP's `new` land first
fn apply_params(ext: &mut Extension, params: &BTreeMap<String, String>) -> IptResult<()> {
    let mut pending: Vec<_> = params.iter().collect();
    for declared in ext.params() {
        if let Some(index) = pending
            .iter()
            .position(|(key, _)| Param::parse(key) == Some(*declared))
        {
            let (_, value) = pending.remove(index);
            ext.set_param(*declared, value)?;
        }
    }
    match pending.first() {
        Some((key, _)) => Err(Error::UnknownParameter {
            extension: ext.name().to_string(),
            param: key.to_string(),
        }),
        None => Ok(()),
    }
}

fn params_of(ext: &Extension) -> BTreeMap<String, String> {
    if ext.is_opaque() {
        warn!(
            extension = ext.name(),
            "opaque extension cannot be described; exporting its name only"
        );
    }
    ext.values()
        .into_iter()
        .map(|(param, value)| (param.to_string(), value))
        .collect()
}

impl RuleSpec {
    /// Build a rule. Target names resolve to a verdict, a chain of `table`,
    /// or a target extension, in that order.
    pub fn to_rule(&self, table: &Table) -> IptResult<Rule> {
        let mut rule = Rule::new();
        if let Some(src) = &self.src {
            rule.set_src(src)?;
        }
        if let Some(dst) = &self.dst {
            rule.set_dst(dst)?;
        }
        if let Some(iface) = &self.in_interface {
            rule.set_in_interface(iface)?;
        }
        if let Some(iface) = &self.out_interface {
            rule.set_out_interface(iface)?;
        }
        if let Some(protocol) = &self.protocol {
            rule.set_protocol(protocol)?;
        }
        rule.fragment = match self.fragment {
            None => Fragment::Any,
            Some(true) => Fragment::Only,
            Some(false) => Fragment::Not,
        };

        for spec in &self.matches {
            let mut m = Match::new(&spec.name)?;
            apply_params(&mut m, &spec.params)?;
            rule.add_match(m);
        }

        if let Some(spec) = &self.target {
            rule.target = Some(spec.to_target(table)?);
        }
        Ok(rule)
    }

    pub fn from_rule(rule: &Rule) -> Self {
        let interface = |iface: &Interface| {
            (!iface.is_any()).then(|| iface.to_string())
        };
        Self {
            src: address_spec(&rule.src),
            dst: address_spec(&rule.dst),
            in_interface: interface(&rule.in_interface),
            out_interface: interface(&rule.out_interface),
            protocol: (!rule.protocol.is_any()).then(|| rule.protocol.to_string()),
            fragment: match rule.fragment {
                Fragment::Any => None,
                Fragment::Only => Some(true),
                Fragment::Not => Some(false),
            },
            matches: rule
                .matches
                .iter()
                .map(|m| ExtensionSpec {
                    name: m.name().to_string(),
                    params: params_of(m),
                })
                .collect(),
            target: rule.target.as_ref().map(TargetSpec::from_target),
        }
    }
}

impl TargetSpec {
    fn to_target(&self, table: &Table) -> IptResult<Target> {
        if Verdict::parse(&self.name).is_none() && table.is_chain(&self.name) {
            return Ok(if self.goto {
                Target::goto(&self.name)
            } else {
                Target::jump(&self.name)
            });
        }
        let mut target = Target::new(&self.name)?;
        if let Some(ext) = target.extension_mut() {
            apply_params(ext, &self.params)?;
        } else if let Some((key, _)) = self.params.iter().next() {
            return Err(Error::UnknownParameter {
                extension: self.name.clone(),
                param: key.clone(),
            });
        }
        Ok(target)
    }

    fn from_target(target: &Target) -> Self {
        Self {
            name: target.name().to_string(),
            params: target.extension().map(params_of).unwrap_or_default(),
            goto: matches!(target, Target::Goto(_)),
        }
    }
}

/// Line diff between two tables in iptables-save form
#[derive(Debug, Clone)]
pub struct TableDiff {
    pub table: TableName,
    pub matches: bool,
    pub diff: Option<String>,
}

impl TableDiff {
    pub fn between(current: &Table, desired: &Table) -> Self {
        let current_text = current.to_string();
        let desired_text = desired.to_string();
        if current_text == desired_text {
            return Self {
                table: desired.name(),
                matches: true,
                diff: None,
            };
        }
        Self {
            table: desired.name(),
            matches: false,
            diff: Some(render_diff(&current_text, &desired_text)),
        }
    }
}

fn render_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}
