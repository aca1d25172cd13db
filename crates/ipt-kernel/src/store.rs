//! [`TableStore`] backed by the `ip_tables` sockopt interface

use crate::abi::*;
use crate::config::KernelConfig;
use crate::decode::decode;
use crate::encode::encode;
use crate::lock::XtablesLock;
use crate::socket::{RawSocket, Sockopt};
use ipt_core::{Error, Result, Table, TableName, TableStore};
use std::io;
use tracing::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

/// Reads and atomically replaces tables through a [`Sockopt`] handle
pub struct KernelStore<S = RawSocket> {
    socket: S,
    config: KernelConfig,
}

impl KernelStore<RawSocket> {
    /// Open the raw socket. Fails without CAP_NET_RAW.
    pub fn open(config: KernelConfig) -> Result<Self> {
        let socket = RawSocket::new().map_err(|err| Error::Kernel {
            table: String::new(),
            reason: format!("cannot open raw socket: {}", describe(&err)),
        })?;
        Ok(Self::with_socket(socket, config))
    }
}

impl<S: Sockopt> KernelStore<S> {
    pub fn with_socket(socket: S, config: KernelConfig) -> Self {
        Self { socket, config }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    fn get_info(&mut self, name: TableName) -> io::Result<IptGetinfo> {
        let mut info = IptGetinfo::request(name.as_str());
        self.socket.get(IPT_SO_GET_INFO, info.as_mut_bytes())?;
        Ok(info)
    }

    fn get_entries(&mut self, name: TableName, size: u32) -> io::Result<Vec<u8>> {
        let header = IptGetEntries::request(name.as_str(), size);
        let mut buf = vec![0u8; size_of::<IptGetEntries>() + size as usize];
        buf[..size_of::<IptGetEntries>()].copy_from_slice(header.as_bytes());
        self.socket.get(IPT_SO_GET_ENTRIES, &mut buf)?;
        buf.drain(..size_of::<IptGetEntries>());
        Ok(buf)
    }

    fn lock(&self) -> io::Result<Option<XtablesLock>> {
        if !self.config.use_lock {
            return Ok(None);
        }
        XtablesLock::acquire(&self.config.lock_path, self.config.wait_for_lock).map(Some)
    }
}

impl<S: Sockopt> TableStore for KernelStore<S> {
    fn fetch(&mut self, name: TableName) -> Result<Table> {
        let kernel_error = |err: io::Error| Error::Kernel {
            table: name.to_string(),
            reason: describe(&err),
        };

        let info = self.get_info(name).map_err(kernel_error)?;
        let entries = self.get_entries(name, info.size).map_err(kernel_error)?;
        debug!(
            table = %name,
            entries = info.num_entries,
            size = info.size,
            "fetched table"
        );
        decode(&info, &entries).map_err(|err| err.into_error(name.as_str()))
    }

    fn replace(&mut self, table: &Table) -> Result<()> {
        let name = table.name();
        let commit_error = |err: io::Error| Error::CommitFailed {
            table: name.to_string(),
            reason: describe(&err),
        };

        let encoded = encode(table)?;
        let _lock = self.lock().map_err(|err| Error::CommitFailed {
            table: name.to_string(),
            reason: if err.kind() == io::ErrorKind::WouldBlock {
                "xtables lock is held by another process".to_string()
            } else {
                format!("cannot take xtables lock: {}", err)
            },
        })?;

        let current = self.get_info(name).map_err(commit_error)?;
        // the kernel writes the outgoing table's counters here
        let mut old_counters = vec![XtCounters::default(); current.num_entries as usize];
        let buf = encoded.to_bytes(
            current.num_entries,
            old_counters.as_mut_ptr() as u64,
        );
        self.socket
            .set(IPT_SO_SET_REPLACE, &buf)
            .map_err(commit_error)?;

        let (packets, bytes) = old_counters
            .iter()
            .fold((0u64, 0u64), |(p, b), c| (p + c.pcnt, b + c.bcnt));
        info!(
            table = %name,
            entries = encoded.replace.num_entries,
            size = encoded.replace.size,
            dropped_packets = packets,
            dropped_bytes = bytes,
            "replaced kernel table"
        );
        Ok(())
    }
}

/// Human-readable reason for a failed sockopt call
fn describe(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) if code == libc::EPERM || code == libc::EACCES => {
            "permission denied (CAP_NET_ADMIN required)".to_string()
        }
        Some(libc::EAGAIN) => "table changed underneath us, refresh and retry".to_string(),
        Some(libc::EINVAL) => "kernel rejected the table layout or an extension payload".to_string(),
        Some(libc::ENOENT) => "table or extension is not available in the kernel".to_string(),
        Some(libc::ELOOP) => "kernel detected a jump loop".to_string(),
        Some(libc::ENOPROTOOPT) => "ip_tables is not available".to_string(),
        Some(libc::ENOMEM) => "kernel ran out of memory".to_string(),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKernel;
    use ipt_core::Rule;

    fn store() -> KernelStore<MemoryKernel> {
        KernelStore::with_socket(
            MemoryKernel::new(),
            KernelConfig {
                use_lock: false,
                ..KernelConfig::default()
            },
        )
    }

    #[test]
    fn commit_then_fetch_round_trips() {
        let mut store = store();
        let mut table = Table::load(&mut store, TableName::Filter).unwrap();
        let mut rule = Rule::new();
        rule.set_in_interface("eth0").unwrap();
        rule.create_target("DROP").unwrap();
        table.chain_mut("INPUT").unwrap().append_rule(rule.clone());
        table.commit(&mut store).unwrap();

        let live = Table::load(&mut store, TableName::Filter).unwrap();
        assert_eq!(live.chain("INPUT").unwrap().rules(), &[rule]);
        assert_eq!(store.socket().replace_count(), 1);
    }

    #[test]
    fn errno_maps_to_commit_failed() {
        let mut store = store();
        let mut table = Table::load(&mut store, TableName::Nat).unwrap();
        table.create_chain("pending").unwrap();
        store.socket_mut().fail_next_replace(libc::EPERM);

        let err = table.commit(&mut store).unwrap_err();
        assert_eq!(
            err,
            Error::CommitFailed {
                table: "nat".into(),
                reason: "permission denied (CAP_NET_ADMIN required)".into(),
            }
        );
        assert!(table.is_dirty());
        assert!(!store.socket().snapshot(TableName::Nat).unwrap().is_chain("pending"));
    }

    #[test]
    fn busy_lock_fails_commit_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xtables.lock");
        let _held = XtablesLock::acquire(&path, false).unwrap();

        let mut store = KernelStore::with_socket(
            MemoryKernel::new(),
            KernelConfig {
                lock_path: path,
                use_lock: true,
                wait_for_lock: false,
            },
        );
        let mut table = Table::load(&mut store, TableName::Raw).unwrap();
        table.set_policy("OUTPUT", "DROP").unwrap();
        let err = table.commit(&mut store).unwrap_err();
        assert!(matches!(err, Error::CommitFailed { ref reason, .. } if reason.contains("lock")));
        assert_eq!(store.socket().replace_count(), 0);
    }

    #[test]
    fn unknown_errno_keeps_os_message() {
        let err = io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(describe(&err), err.to_string());
    }
}
