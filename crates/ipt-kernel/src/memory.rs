//! An in-process stand-in for the `ip_tables` sockopt interface.
//!
//! It keeps each table as the blob the kernel would hold and applies the
//! same checks the kernel applies to a replace: buffer sizes, hook
//! layout, entry framing, `num_counters` and jump loops. Tests and dry runs
//! drive [`crate::KernelStore`] against it.

use crate::abi::*;
use crate::decode::{DecodeError, decode};
use crate::encode::encode;
use crate::socket::Sockopt;
use ipt_core::{Error, Table, TableName};
use std::collections::BTreeMap;
use std::io;
use tracing::debug;
use zerocopy::{FromBytes, IntoBytes};

#[derive(Debug, Clone)]
struct LiveTable {
    info: IptGetinfo,
    entries: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MemoryKernel {
    tables: BTreeMap<String, LiveTable>,
    fail_next: Option<i32>,
    replaces: usize,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl MemoryKernel {
    /// Every built-in table, empty, with ACCEPT policies
    pub fn new() -> Self {
        let tables = TableName::ALL
            .into_iter()
            .filter_map(|name| encode(&Table::new(name)).ok())
            .map(|encoded| {
                let r = encoded.replace;
                let info = IptGetinfo {
                    name: r.name,
                    valid_hooks: r.valid_hooks,
                    hook_entry: r.hook_entry,
                    underflow: r.underflow,
                    num_entries: r.num_entries,
                    size: r.size,
                };
                (
                    read_name(&r.name),
                    LiveTable {
                        info,
                        entries: encoded.entries,
                    },
                )
            })
            .collect();
        Self {
            tables,
            fail_next: None,
            replaces: 0,
        }
    }

    /// Make the next replace fail with `errno` without touching any table
    pub fn fail_next_replace(&mut self, errno: i32) {
        self.fail_next = Some(errno);
    }

    /// Number of replaces accepted so far
    pub fn replace_count(&self) -> usize {
        self.replaces
    }

    /// Decode the live copy of a table
    pub fn snapshot(&self, name: TableName) -> Option<Table> {
        let live = self.tables.get(name.as_str())?;
        decode(&live.info, &live.entries).ok()
    }

    fn live(&self, name: &[u8]) -> io::Result<&LiveTable> {
        self.tables
            .get(&read_name(name))
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn get_info(&self, buf: &mut [u8]) -> io::Result<usize> {
        let request = IptGetinfo::read_from_bytes(buf).map_err(|_| errno(libc::EINVAL))?;
        let live = self.live(&request.name)?;
        buf.copy_from_slice(live.info.as_bytes());
        Ok(buf.len())
    }

    fn get_entries(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (request, _) =
            IptGetEntries::read_from_prefix(buf).map_err(|_| errno(libc::EINVAL))?;
        let header = size_of::<IptGetEntries>();
        if buf.len() != header + request.size as usize {
            return Err(errno(libc::EINVAL));
        }
        let live = self.live(&request.name)?;
        if request.size != live.info.size {
            return Err(errno(libc::EAGAIN));
        }
        buf[header..].copy_from_slice(&live.entries);
        Ok(buf.len())
    }

    fn replace(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Some(code) = self.fail_next.take() {
            return Err(errno(code));
        }

        let (replace, entries) =
            IptReplace::read_from_prefix(buf).map_err(|_| errno(libc::EINVAL))?;
        if entries.len() != replace.size as usize {
            return Err(errno(libc::EINVAL));
        }
        let live = self.live(&replace.name)?;
        if replace.valid_hooks != live.info.valid_hooks {
            return Err(errno(libc::EINVAL));
        }
        if replace.num_counters != live.info.num_entries {
            return Err(errno(libc::EAGAIN));
        }

        let info = IptGetinfo {
            name: replace.name,
            valid_hooks: replace.valid_hooks,
            hook_entry: replace.hook_entry,
            underflow: replace.underflow,
            num_entries: replace.num_entries,
            size: replace.size,
        };
        let table = decode(&info, entries).map_err(|err| {
            debug!(error = %err, "rejecting replace");
            match err {
                DecodeError::Table(Error::ChainLoop { .. }) => errno(libc::ELOOP),
                _ => errno(libc::EINVAL),
            }
        })?;
        match table.validate() {
            Ok(()) => {}
            Err(Error::ChainLoop { .. }) => return Err(errno(libc::ELOOP)),
            Err(err) => {
                debug!(error = %err, "rejecting replace");
                return Err(errno(libc::EINVAL));
            }
        }

        self.tables.insert(
            read_name(&replace.name),
            LiveTable {
                info,
                entries: entries.to_vec(),
            },
        );
        self.replaces += 1;
        Ok(())
    }
}

impl Sockopt for MemoryKernel {
    fn get(&mut self, optname: i32, buf: &mut [u8]) -> io::Result<usize> {
        match optname {
            IPT_SO_GET_INFO => self.get_info(buf),
            IPT_SO_GET_ENTRIES => self.get_entries(buf),
            _ => Err(errno(libc::ENOPROTOOPT)),
        }
    }

    fn set(&mut self, optname: i32, buf: &[u8]) -> io::Result<()> {
        match optname {
            IPT_SO_SET_REPLACE => self.replace(buf),
            _ => Err(errno(libc::ENOPROTOOPT)),
        }
    }
}
