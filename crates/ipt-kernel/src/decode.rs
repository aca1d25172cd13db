//! Turn the entry blob returned by `IPT_SO_GET_ENTRIES` back into a
//! [`Table`].

use crate::abi::*;
use ipt_core::{
    Address, Chain, Counters, Error, Fragment, Hook, Interface, Match, Protocol, Rule, Table,
    TableName, Target, Verdict,
};
use std::any::type_name;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;
use zerocopy::FromBytes;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown table name {name:?}")]
    UnknownTable { name: String },

    #[error("entries size {entries_size} does not match specified size {specified_size}")]
    SizeMismatch {
        specified_size: usize,
        entries_size: usize,
    },

    #[error("reached end of buffer while parsing {type_name} at position {position}")]
    ParseEndOfBuffer {
        type_name: &'static str,
        position: usize,
    },

    #[error("reached end of buffer while advancing by {offset} at position {position}")]
    AdvanceEndOfBuffer { offset: usize, position: usize },

    #[error("target offset {offset} is too small")]
    TargetOffsetTooSmall { offset: usize },

    #[error("target offset {offset} does not land on the target")]
    InvalidTargetOffset { offset: usize },

    #[error("next offset {offset} is too small")]
    NextOffsetTooSmall { offset: usize },

    #[error("next offset {offset} does not land on the next entry")]
    InvalidNextOffset { offset: usize },

    #[error("match size {size} is too small")]
    MatchSizeTooSmall { size: usize },

    #[error("target size {size} is too small")]
    TargetSizeTooSmall { size: usize },

    #[error("{target_name} target of size {size} is too small for its payload")]
    TargetSizeMismatch {
        size: usize,
        target_name: &'static str,
    },

    #[error("specified {specified} entries but found {found}")]
    NumEntriesMismatch { specified: usize, found: usize },

    #[error("table does not end with an ERROR entry")]
    NoTrailingErrorTarget,

    #[error("entry at {position} is outside of any chain")]
    EntryOutsideChain { position: usize },

    #[error("built-in chain {chain} has no policy")]
    ChainHasNoPolicy { chain: String },

    #[error("user chain {chain} has no RETURN entry")]
    ChainHasNoReturn { chain: String },

    #[error("invalid verdict {verdict}")]
    InvalidVerdict { verdict: i32 },

    #[error("verdict {verdict} does not point at a user chain")]
    InvalidJumpTarget { verdict: i32 },

    #[error("invalid table: {0}")]
    Table(#[from] Error),
}

impl DecodeError {
    pub fn into_error(self, table: &str) -> Error {
        match self {
            DecodeError::Table(err) => err,
            other => Error::Kernel {
                table: table.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug)]
enum RawTarget {
    Standard(i32),
    Error(String),
    Extension {
        name: String,
        revision: u8,
        data: Vec<u8>,
    },
}

#[derive(Debug)]
struct RawEntry {
    offset: usize,
    entry: IptEntry,
    matches: Vec<Match>,
    target: RawTarget,
}

impl RawEntry {
    fn next(&self) -> usize {
        self.offset + usize::from(self.entry.next_offset)
    }
}

struct EntryParser<'a> {
    bytes: &'a [u8],
    parse_pos: usize,
}

impl<'a> EntryParser<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            parse_pos: 0,
        }
    }

    fn finished(&self) -> bool {
        self.parse_pos == self.bytes.len()
    }

    fn get_next_bytes(&self, offset: usize) -> Option<&'a [u8]> {
        let new_pos = self.parse_pos + offset;
        if new_pos > self.bytes.len() {
            None
        } else {
            Some(&self.bytes[self.parse_pos..new_pos])
        }
    }

    // Parse the bytes at `parse_pos` as T without advancing.
    fn view_next_bytes_as<T: FromBytes>(&self) -> Result<T, DecodeError> {
        self.get_next_bytes(size_of::<T>())
            .and_then(|bytes| T::read_from_bytes(bytes).ok())
            .ok_or(DecodeError::ParseEndOfBuffer {
                type_name: type_name::<T>(),
                position: self.parse_pos,
            })
    }

    fn advance_parse_pos(&mut self, offset: usize) -> Result<(), DecodeError> {
        if self.parse_pos + offset > self.bytes.len() {
            return Err(DecodeError::AdvanceEndOfBuffer {
                offset,
                position: self.parse_pos,
            });
        }
        self.parse_pos += offset;
        Ok(())
    }

    fn parse_next_bytes_as<T: FromBytes>(&mut self) -> Result<T, DecodeError> {
        let obj = self.view_next_bytes_as::<T>()?;
        self.advance_parse_pos(size_of::<T>())?;
        Ok(obj)
    }

    fn parse_entry(&mut self) -> Result<RawEntry, DecodeError> {
        let offset = self.parse_pos;
        let entry = self.parse_next_bytes_as::<IptEntry>()?;

        let target_offset = usize::from(entry.target_offset);
        if target_offset < IPT_ENTRY_SIZE {
            return Err(DecodeError::TargetOffsetTooSmall {
                offset: target_offset,
            });
        }
        let next_offset = usize::from(entry.next_offset);
        if next_offset < IPT_ENTRY_SIZE {
            return Err(DecodeError::NextOffsetTooSmall {
                offset: next_offset,
            });
        }

        let mut matches = Vec::new();
        while self.parse_pos < offset + target_offset {
            matches.push(self.parse_match()?);
        }
        if self.parse_pos != offset + target_offset {
            return Err(DecodeError::InvalidTargetOffset {
                offset: target_offset,
            });
        }

        let target = self.parse_target()?;
        if self.parse_pos != offset + next_offset {
            return Err(DecodeError::InvalidNextOffset {
                offset: next_offset,
            });
        }

        Ok(RawEntry {
            offset,
            entry,
            matches,
            target,
        })
    }

    /// The payload following a match or target header, padding included
    fn parse_payload(&mut self, size: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = size - XT_HEADER_SIZE;
        let data = self
            .get_next_bytes(remaining)
            .ok_or(DecodeError::AdvanceEndOfBuffer {
                offset: remaining,
                position: self.parse_pos,
            })?;
        self.advance_parse_pos(remaining)?;
        Ok(data)
    }

    fn parse_match(&mut self) -> Result<Match, DecodeError> {
        let header = self.parse_next_bytes_as::<XtEntryHeader>()?;
        let size = usize::from(header.size);
        if size < XT_HEADER_SIZE {
            return Err(DecodeError::MatchSizeTooSmall { size });
        }
        let data = self.parse_payload(size)?;
        Ok(Match::from_kernel(&header.name(), header.revision, data))
    }

    fn parse_target(&mut self) -> Result<RawTarget, DecodeError> {
        let header = self.parse_next_bytes_as::<XtEntryHeader>()?;
        let size = usize::from(header.size);
        if size < XT_HEADER_SIZE {
            return Err(DecodeError::TargetSizeTooSmall { size });
        }
        let name = header.name();

        let target = match name.as_str() {
            XT_STANDARD_TARGET => {
                if size < STANDARD_TARGET_SIZE {
                    return Err(DecodeError::TargetSizeMismatch {
                        size,
                        target_name: "standard",
                    });
                }
                let payload = self.view_next_bytes_as::<VerdictWithPadding>()?;
                RawTarget::Standard(payload.verdict)
            }
            XT_ERROR_TARGET => {
                if size < ERROR_TARGET_SIZE {
                    return Err(DecodeError::TargetSizeMismatch {
                        size,
                        target_name: "error",
                    });
                }
                let payload = self.view_next_bytes_as::<ErrorNameWithPadding>()?;
                RawTarget::Error(read_name(&payload.errorname))
            }
            _ => {
                let data = self
                    .get_next_bytes(size - XT_HEADER_SIZE)
                    .unwrap_or_default()
                    .to_vec();
                RawTarget::Extension {
                    name,
                    revision: header.revision,
                    data,
                }
            }
        };
        self.parse_payload(size)?;
        Ok(target)
    }
}

/// A chain whose closing entry has not been seen yet
enum Open {
    Builtin(Hook, Chain),
    User(Chain),
}

impl Open {
    fn chain_mut(&mut self) -> &mut Chain {
        match self {
            Open::Builtin(_, chain) | Open::User(chain) => chain,
        }
    }

    fn unterminated(self) -> DecodeError {
        match self {
            Open::Builtin(_, chain) => DecodeError::ChainHasNoPolicy {
                chain: chain.name().to_string(),
            },
            Open::User(chain) => DecodeError::ChainHasNoReturn {
                chain: chain.name().to_string(),
            },
        }
    }
}

fn rule_from_entry(entry: &IptEntry) -> Rule {
    let ip = &entry.ip;
    let inverted = |flag: u8| ip.invflags & flag != 0;

    let fragment = match (ip.flags & IPT_F_FRAG != 0, inverted(IPT_INV_FRAG)) {
        (false, _) => Fragment::Any,
        (true, false) => Fragment::Only,
        (true, true) => Fragment::Not,
    };

    Rule {
        src: Address {
            addr: Ipv4Addr::from(ip.src),
            mask: Ipv4Addr::from(ip.smsk),
            invert: inverted(IPT_INV_SRCIP),
        },
        dst: Address {
            addr: Ipv4Addr::from(ip.dst),
            mask: Ipv4Addr::from(ip.dmsk),
            invert: inverted(IPT_INV_DSTIP),
        },
        in_interface: Interface::from_kernel(&ip.iniface, inverted(IPT_INV_VIA_IN)),
        out_interface: Interface::from_kernel(&ip.outiface, inverted(IPT_INV_VIA_OUT)),
        protocol: Protocol {
            number: ip.proto,
            invert: inverted(IPT_INV_PROTO),
        },
        fragment,
        counters: Counters {
            packets: entry.counters.pcnt,
            bytes: entry.counters.bcnt,
        },
        ..Rule::default()
    }
}

fn standard_verdict(verdict: i32) -> Result<Verdict, DecodeError> {
    Verdict::from_code(verdict).ok_or(DecodeError::InvalidVerdict { verdict })
}

/// Decode the entries of a table described by `info`
pub fn decode(info: &IptGetinfo, entries: &[u8]) -> Result<Table, DecodeError> {
    let table_name = read_name(&info.name);
    let name: TableName = table_name
        .parse()
        .map_err(|_| DecodeError::UnknownTable { name: table_name })?;

    if info.size as usize != entries.len() {
        return Err(DecodeError::SizeMismatch {
            specified_size: info.size as usize,
            entries_size: entries.len(),
        });
    }

    let mut parser = EntryParser::new(entries);
    let mut raw = Vec::new();
    while !parser.finished() {
        raw.push(parser.parse_entry()?);
    }
    if raw.len() != info.num_entries as usize {
        return Err(DecodeError::NumEntriesMismatch {
            specified: info.num_entries as usize,
            found: raw.len(),
        });
    }
    match raw.last() {
        Some(RawEntry {
            target: RawTarget::Error(last),
            ..
        }) if last == XT_ERROR_TARGET => {}
        _ => return Err(DecodeError::NoTrailingErrorTarget),
    }
    let raw = &raw[..raw.len() - 1];

    // jumps land on the entry after a user chain's head
    let mut jump_targets: HashMap<usize, &str> = HashMap::new();
    for pair in raw.windows(2) {
        if let RawTarget::Error(chain) = &pair[0].target {
            jump_targets.insert(pair[1].offset, chain);
        }
    }

    let hook_at = |offset: usize| {
        name.hooks()
            .iter()
            .copied()
            .find(|hook| info.hook_entry[hook.index()] as usize == offset)
    };

    let mut chains = Vec::new();
    let mut current: Option<Open> = None;
    for (index, raw_entry) in raw.iter().enumerate() {
        let offset = raw_entry.offset;

        if let RawTarget::Error(chain) = &raw_entry.target {
            if let Some(open) = current.take() {
                return Err(open.unterminated());
            }
            current = Some(Open::User(Chain::user(chain)));
            continue;
        }

        if current.is_none() {
            let hook = hook_at(offset).ok_or(DecodeError::EntryOutsideChain { position: offset })?;
            current = Some(Open::Builtin(
                hook,
                Chain::builtin(hook.chain_name(), Verdict::Accept),
            ));
        }
        let Some(open) = current.as_mut() else {
            continue;
        };

        let chain_end = match open {
            Open::Builtin(hook, _) => info.underflow[hook.index()] as usize == offset,
            // the foot is the last entry before the next chain or the end
            Open::User(_) => raw.get(index + 1).is_none_or(|next| {
                matches!(next.target, RawTarget::Error(_)) || hook_at(next.offset).is_some()
            }),
        };

        if chain_end {
            let Some(open) = current.take() else {
                continue;
            };
            let verdict = match raw_entry.target {
                RawTarget::Standard(verdict) if verdict < 0 => standard_verdict(verdict)?,
                _ => return Err(open.unterminated()),
            };
            match open {
                Open::Builtin(_, mut chain) => {
                    chain.set_policy(verdict)?;
                    chain.counters = Counters {
                        packets: raw_entry.entry.counters.pcnt,
                        bytes: raw_entry.entry.counters.bcnt,
                    };
                    chains.push(chain);
                }
                Open::User(chain) if verdict == Verdict::Return => chains.push(chain),
                user => return Err(user.unterminated()),
            }
            continue;
        }

        let mut rule = rule_from_entry(&raw_entry.entry);
        rule.matches = raw_entry.matches.clone();
        let goto = raw_entry.entry.ip.flags & IPT_F_GOTO != 0;
        rule.target = match &raw_entry.target {
            RawTarget::Standard(verdict) if *verdict < 0 => {
                Some(Target::Verdict(standard_verdict(*verdict)?))
            }
            RawTarget::Standard(verdict) if !goto && *verdict as usize == raw_entry.next() => None,
            RawTarget::Standard(verdict) => {
                let chain = jump_targets
                    .get(&(*verdict as usize))
                    .ok_or(DecodeError::InvalidJumpTarget { verdict: *verdict })?;
                Some(if goto {
                    Target::goto(chain)
                } else {
                    Target::jump(chain)
                })
            }
            RawTarget::Extension {
                name,
                revision,
                data,
            } => Some(Target::from_kernel(name, *revision, data)),
            RawTarget::Error(_) => None,
        };
        open.chain_mut().append_rule(rule);
    }

    if let Some(open) = current {
        return Err(open.unterminated());
    }

    debug!(
        table = %name,
        entries = info.num_entries,
        size = info.size,
        chains = chains.len(),
        "decoded table"
    );
    Ok(Table::from_chains(name, chains)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;

    fn info_for(encoded: &crate::encode::EncodedTable) -> IptGetinfo {
        let r = &encoded.replace;
        IptGetinfo {
            name: r.name,
            valid_hooks: r.valid_hooks,
            hook_entry: r.hook_entry,
            underflow: r.underflow,
            num_entries: r.num_entries,
            size: r.size,
        }
    }

    #[test]
    fn empty_table_decodes_to_builtin_chains() {
        let table = Table::new(TableName::Nat);
        let encoded = encode(&table).unwrap();
        let decoded = decode(&info_for(&encoded), &encoded.entries).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.chains().len(), 4);
    }

    #[test]
    fn jumps_and_fallthrough_survive() {
        let mut table = Table::new(TableName::Filter);
        table.create_chain("empty").unwrap();
        table.create_chain("worker").unwrap();

        let mut count = Rule::new();
        count.set_src("10.0.0.0/8").unwrap();
        let mut jump = Rule::new();
        jump.set_target(Target::jump("worker"));
        let mut goto = Rule::new();
        goto.set_target(Target::goto("empty"));
        let input = table.chain_mut("INPUT").unwrap();
        input.append_rule(count);
        input.append_rule(jump);
        input.append_rule(goto);

        let mut ret = Rule::new();
        ret.set_target(Target::new("RETURN").unwrap());
        table.chain_mut("worker").unwrap().append_rule(ret);
        table.set_policy("FORWARD", "DROP").unwrap();

        let encoded = encode(&table).unwrap();
        let decoded = decode(&info_for(&encoded), &encoded.entries).unwrap();
        assert_eq!(decoded, table);

        let input = decoded.chain("INPUT").unwrap();
        assert_eq!(input.rules()[0].target, None);
        assert_eq!(input.rules()[1].target, Some(Target::jump("worker")));
        assert_eq!(input.rules()[2].target, Some(Target::goto("empty")));
        assert_eq!(decoded.policy("FORWARD").unwrap(), Some(Verdict::Drop));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let encoded = encode(&Table::new(TableName::Raw)).unwrap();
        let mut info = info_for(&encoded);
        info.size -= 8;
        let err = decode(&info, &encoded.entries[..encoded.entries.len() - 8]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidNextOffset { .. } | DecodeError::ParseEndOfBuffer { .. }));
    }

    #[test]
    fn entry_count_must_match() {
        let encoded = encode(&Table::new(TableName::Raw)).unwrap();
        let mut info = info_for(&encoded);
        info.num_entries += 1;
        assert_eq!(
            decode(&info, &encoded.entries).unwrap_err(),
            DecodeError::NumEntriesMismatch {
                specified: 4,
                found: 3
            }
        );
    }

    #[test]
    fn unknown_table_name_is_rejected() {
        let encoded = encode(&Table::new(TableName::Raw)).unwrap();
        let mut info = info_for(&encoded);
        write_name(&mut info.name, "broute");
        let err = decode(&info, &encoded.entries).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTable { .. }));
        assert!(matches!(err.into_error("broute"), Error::Kernel { .. }));
    }
}
