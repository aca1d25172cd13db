//! `ip_tables` sockopt structures, laid out exactly as the kernel expects
//! them on 64-bit targets.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const IPT_BASE_CTL: i32 = 64;
pub const IPT_SO_SET_REPLACE: i32 = IPT_BASE_CTL;
pub const IPT_SO_GET_INFO: i32 = IPT_BASE_CTL;
pub const IPT_SO_GET_ENTRIES: i32 = IPT_BASE_CTL + 1;

pub const XT_TABLE_MAXNAMELEN: usize = 32;
pub const XT_EXTENSION_MAXNAMELEN: usize = 29;
pub const XT_FUNCTION_MAXNAMELEN: usize = 30;
pub const NF_INET_NUMHOOKS: usize = 5;

/// `ipt_ip.flags`
pub const IPT_F_FRAG: u8 = 0x01;
pub const IPT_F_GOTO: u8 = 0x02;

/// `ipt_ip.invflags`
pub const IPT_INV_VIA_IN: u8 = 0x01;
pub const IPT_INV_VIA_OUT: u8 = 0x02;
pub const IPT_INV_SRCIP: u8 = 0x08;
pub const IPT_INV_DSTIP: u8 = 0x10;
pub const IPT_INV_FRAG: u8 = 0x20;
pub const IPT_INV_PROTO: u8 = 0x40;

/// Name of the standard (verdict) target
pub const XT_STANDARD_TARGET: &str = "";
/// Name of the target marking user chain heads and the end of the table
pub const XT_ERROR_TARGET: &str = "ERROR";

/// Payloads of matches and targets are padded to this boundary
pub const XT_ALIGN: usize = 8;

pub const fn xt_align(size: usize) -> usize {
    (size + XT_ALIGN - 1) & !(XT_ALIGN - 1)
}

/// `struct ipt_ip`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IptIp {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub smsk: [u8; 4],
    pub dmsk: [u8; 4],
    pub iniface: [u8; 16],
    pub outiface: [u8; 16],
    pub iniface_mask: [u8; 16],
    pub outiface_mask: [u8; 16],
    pub proto: u16,
    pub flags: u8,
    pub invflags: u8,
}

/// `struct xt_counters`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XtCounters {
    pub pcnt: u64,
    pub bcnt: u64,
}

/// `struct ipt_entry`, followed in the blob by its matches and target
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IptEntry {
    pub ip: IptIp,
    pub nfcache: u32,
    pub target_offset: u16,
    pub next_offset: u16,
    pub comefrom: u32,
    pub counters: XtCounters,
}

/// The user-visible header shared by `xt_entry_match` and `xt_entry_target`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XtEntryHeader {
    pub size: u16,
    pub name: [u8; XT_EXTENSION_MAXNAMELEN],
    pub revision: u8,
}

impl XtEntryHeader {
    pub fn new(name: &str, revision: u8, payload_len: usize) -> Self {
        let mut header = Self::new_zeroed();
        header.size = (size_of::<Self>() + xt_align(payload_len)) as u16;
        write_name(&mut header.name, name);
        header.revision = revision;
        header
    }

    pub fn name(&self) -> String {
        read_name(&self.name)
    }
}

/// Payload of the standard target
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VerdictWithPadding {
    pub verdict: i32,
    pub _padding: [u8; 4],
}

/// Payload of the error target
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ErrorNameWithPadding {
    pub errorname: [u8; XT_FUNCTION_MAXNAMELEN],
    pub _padding: [u8; 2],
}

/// `struct ipt_replace` without the trailing entries
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IptReplace {
    pub name: [u8; XT_TABLE_MAXNAMELEN],
    pub valid_hooks: u32,
    pub num_entries: u32,
    pub size: u32,
    pub hook_entry: [u32; NF_INET_NUMHOOKS],
    pub underflow: [u32; NF_INET_NUMHOOKS],
    pub num_counters: u32,
    /// User pointer to `num_counters` `xt_counters` the kernel fills with
    /// the old table's counters
    pub counters: u64,
}

/// `struct ipt_getinfo`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IptGetinfo {
    pub name: [u8; XT_TABLE_MAXNAMELEN],
    pub valid_hooks: u32,
    pub hook_entry: [u32; NF_INET_NUMHOOKS],
    pub underflow: [u32; NF_INET_NUMHOOKS],
    pub num_entries: u32,
    pub size: u32,
}

impl IptGetinfo {
    /// A request buffer naming the table to query
    pub fn request(table: &str) -> Self {
        let mut info = Self::new_zeroed();
        write_name(&mut info.name, table);
        info
    }
}

/// `struct ipt_get_entries` without the trailing entries
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IptGetEntries {
    pub name: [u8; XT_TABLE_MAXNAMELEN],
    pub size: u32,
    pub _padding: [u8; 4],
}

impl IptGetEntries {
    pub fn request(table: &str, size: u32) -> Self {
        let mut header = Self::new_zeroed();
        write_name(&mut header.name, table);
        header.size = size;
        header
    }
}

pub const IPT_ENTRY_SIZE: usize = size_of::<IptEntry>();
pub const XT_HEADER_SIZE: usize = size_of::<XtEntryHeader>();
pub const STANDARD_TARGET_SIZE: usize = XT_HEADER_SIZE + size_of::<VerdictWithPadding>();
pub const ERROR_TARGET_SIZE: usize = XT_HEADER_SIZE + size_of::<ErrorNameWithPadding>();

/// Copy `name` into a NUL-padded buffer, truncating so at least one NUL
/// remains
pub fn write_name(buf: &mut [u8], name: &str) {
    buf.fill(0);
    let bytes = name.as_bytes();
    let len = bytes.len().min(buf.len().saturating_sub(1));
    buf[..len].copy_from_slice(&bytes[..len]);
}

pub fn read_name(buf: &[u8]) -> String {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
