//! Lay a [`Table`] out as the entry blob `IPT_SO_SET_REPLACE` expects.
//!
//! Built-in chains are their rules followed by a policy entry. User chains
//! start with an error-target head carrying the chain name and end with a
//! RETURN foot. A final `ERROR` entry closes the table.

use crate::abi::*;
use ipt_core::{Chain, Error, Fragment, Hook, Result, Rule, Table, Target, Verdict};
use std::collections::HashMap;
use tracing::debug;
use zerocopy::{FromZeros, IntoBytes};

/// An encoded table: the replace header (without counters) and its entries
#[derive(Debug, Clone)]
pub struct EncodedTable {
    pub replace: IptReplace,
    pub entries: Vec<u8>,
}

impl EncodedTable {
    /// The full `ipt_replace` buffer. `counters` must point at room for
    /// `num_counters` `xt_counters` for as long as the kernel call runs.
    pub fn to_bytes(&self, num_counters: u32, counters: u64) -> Vec<u8> {
        let mut replace = self.replace;
        replace.num_counters = num_counters;
        replace.counters = counters;

        let mut buf = Vec::with_capacity(size_of::<IptReplace>() + self.entries.len());
        buf.extend_from_slice(replace.as_bytes());
        buf.extend_from_slice(&self.entries);
        buf
    }
}

fn entry_size(rule: &Rule) -> usize {
    let matches: usize = rule
        .matches
        .iter()
        .map(|m| XT_HEADER_SIZE + xt_align(m.data().len()))
        .sum();
    let target = match &rule.target {
        Some(Target::Extension(ext)) => XT_HEADER_SIZE + xt_align(ext.data().len()),
        _ => STANDARD_TARGET_SIZE,
    };
    IPT_ENTRY_SIZE + matches + target
}

fn chain_size(chain: &Chain) -> usize {
    let rules: usize = chain.rules().iter().map(entry_size).sum();
    let framing = if chain.is_builtin() {
        IPT_ENTRY_SIZE + STANDARD_TARGET_SIZE
    } else {
        2 * IPT_ENTRY_SIZE + ERROR_TARGET_SIZE + STANDARD_TARGET_SIZE
    };
    rules + framing
}

fn rule_ip(rule: &Rule) -> IptIp {
    let mut ip = IptIp::default();
    ip.src = rule.src.addr.octets();
    ip.smsk = rule.src.mask.octets();
    ip.dst = rule.dst.addr.octets();
    ip.dmsk = rule.dst.mask.octets();
    (ip.iniface, ip.iniface_mask) = rule.in_interface.to_kernel();
    (ip.outiface, ip.outiface_mask) = rule.out_interface.to_kernel();
    ip.proto = rule.protocol.number;

    let inverted = [
        (rule.src.invert, IPT_INV_SRCIP),
        (rule.dst.invert, IPT_INV_DSTIP),
        (rule.in_interface.invert, IPT_INV_VIA_IN),
        (rule.out_interface.invert, IPT_INV_VIA_OUT),
        (rule.protocol.invert, IPT_INV_PROTO),
    ];
    for (set, flag) in inverted {
        if set {
            ip.invflags |= flag;
        }
    }

    match rule.fragment {
        Fragment::Any => {}
        Fragment::Only => ip.flags |= IPT_F_FRAG,
        Fragment::Not => {
            ip.flags |= IPT_F_FRAG;
            ip.invflags |= IPT_INV_FRAG;
        }
    }
    if matches!(rule.target, Some(Target::Goto(_))) {
        ip.flags |= IPT_F_GOTO;
    }
    ip
}

struct Writer {
    buf: Vec<u8>,
    num_entries: u32,
}

impl Writer {
    fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Framing entries are fixed size; rules are bounded by [`Writer::rule`]
    fn entry(&mut self, ip: IptIp, target_offset: u16, next_offset: u16) {
        let entry = IptEntry {
            ip,
            target_offset,
            next_offset,
            ..IptEntry::default()
        };
        self.buf.extend_from_slice(entry.as_bytes());
        self.num_entries += 1;
    }

    fn extension(&mut self, name: &str, revision: u8, data: &[u8]) {
        let header = XtEntryHeader::new(name, revision, data.len());
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + xt_align(data.len()) - data.len(), 0);
    }

    fn standard(&mut self, verdict: i32) {
        let payload = VerdictWithPadding {
            verdict,
            _padding: [0; 4],
        };
        self.extension(XT_STANDARD_TARGET, 0, payload.as_bytes());
    }

    /// An entry whose only job is to carry a verdict
    fn verdict_entry(&mut self, verdict: i32) {
        self.entry(
            IptIp::default(),
            IPT_ENTRY_SIZE as u16,
            (IPT_ENTRY_SIZE + STANDARD_TARGET_SIZE) as u16,
        );
        self.standard(verdict);
    }

    fn error_entry(&mut self, name: &str) {
        self.entry(
            IptIp::default(),
            IPT_ENTRY_SIZE as u16,
            (IPT_ENTRY_SIZE + ERROR_TARGET_SIZE) as u16,
        );
        let mut payload = ErrorNameWithPadding::new_zeroed();
        write_name(&mut payload.errorname, name);
        self.extension(XT_ERROR_TARGET, 0, payload.as_bytes());
    }

    fn rule(&mut self, rule: &Rule, jumps: &HashMap<&str, u32>) -> Result<()> {
        let start = self.offset();
        let size = entry_size(rule);
        let target_offset = size
            - match &rule.target {
                Some(Target::Extension(ext)) => XT_HEADER_SIZE + xt_align(ext.data().len()),
                _ => STANDARD_TARGET_SIZE,
            };
        let too_large = || Error::RuleTooLarge {
            chain: String::new(),
            size,
        };
        let next_offset = u16::try_from(size).map_err(|_| too_large())?;
        let target_offset = u16::try_from(target_offset).map_err(|_| too_large())?;
        self.entry(rule_ip(rule), target_offset, next_offset);

        for m in &rule.matches {
            self.extension(m.name(), m.revision(), &m.data());
        }

        match &rule.target {
            None => self.standard((start as usize + size) as i32),
            Some(Target::Verdict(verdict)) => self.standard(verdict.code()),
            Some(Target::Jump(chain)) | Some(Target::Goto(chain)) => {
                let offset = jumps.get(chain.as_str()).ok_or_else(|| Error::ChainNotFound {
                    table: String::new(),
                    chain: chain.clone(),
                })?;
                self.standard(*offset as i32);
            }
            Some(Target::Extension(ext)) => self.extension(ext.name(), ext.revision(), &ext.data()),
        }
        Ok(())
    }
}

/// Encode the working copy of `table`. Counters are written as zero.
pub fn encode(table: &Table) -> Result<EncodedTable> {
    // a jump lands on the entry right after the target chain's head
    let mut jumps = HashMap::new();
    let mut offset = 0usize;
    for chain in table.chains() {
        if !chain.is_builtin() {
            jumps.insert(chain.name(), (offset + IPT_ENTRY_SIZE + ERROR_TARGET_SIZE) as u32);
        }
        offset += chain_size(chain);
    }

    let mut replace = IptReplace::new_zeroed();
    write_name(&mut replace.name, table.name().as_str());
    replace.valid_hooks = table.name().valid_hooks();

    let mut writer = Writer {
        buf: Vec::with_capacity(offset + IPT_ENTRY_SIZE + ERROR_TARGET_SIZE),
        num_entries: 0,
    };
    for chain in table.chains() {
        match (chain.policy(), Hook::from_chain_name(chain.name())) {
            (Some(policy), Some(hook)) => {
                replace.hook_entry[hook.index()] = writer.offset();
                write_rules(&mut writer, table, chain, &jumps)?;
                replace.underflow[hook.index()] = writer.offset();
                writer.verdict_entry(policy.code());
            }
            _ => {
                writer.error_entry(chain.name());
                write_rules(&mut writer, table, chain, &jumps)?;
                writer.verdict_entry(Verdict::Return.code());
            }
        }
    }
    writer.error_entry(XT_ERROR_TARGET);

    replace.num_entries = writer.num_entries;
    replace.size = writer.offset();
    debug!(
        table = %table.name(),
        entries = replace.num_entries,
        size = replace.size,
        "encoded table"
    );
    Ok(EncodedTable {
        replace,
        entries: writer.buf,
    })
}

fn write_rules(
    writer: &mut Writer,
    table: &Table,
    chain: &Chain,
    jumps: &HashMap<&str, u32>,
) -> Result<()> {
    for rule in chain.rules() {
        writer.rule(rule, jumps).map_err(|err| match err {
            Error::ChainNotFound { chain, .. } => Error::ChainNotFound {
                table: table.name().to_string(),
                chain,
            },
            Error::RuleTooLarge { size, .. } => Error::RuleTooLarge {
                chain: chain.name().to_string(),
                size,
            },
            other => other,
        })?;
    }
    Ok(())
}
