//! `CLUSTERIP` target
//!
//! Only a rule carrying `new` creates a cluster configuration, so every other
//! parameter is refused until `new` has been set.

use super::{Codec, Param};
use crate::error::{Error, Result};
use crate::parse::parse_uint;
use crate::rule::Rule;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const FLAG_NEW: u32 = 0x1;
const MAX_NODES: usize = 16;

/// Packet fields hashed to pick the owning node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    SourceIp,
    SourceIpSourcePort,
    SourceIpSourcePortDestPort,
}

impl HashMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sourceip" => Some(Self::SourceIp),
            "sourceip-sourceport" => Some(Self::SourceIpSourcePort),
            "sourceip-sourceport-destport" => Some(Self::SourceIpSourcePortDestPort),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceIp => "sourceip",
            Self::SourceIpSourcePort => "sourceip-sourceport",
            Self::SourceIpSourcePortDestPort => "sourceip-sourceport-destport",
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::SourceIp),
            1 => Some(Self::SourceIpSourcePort),
            2 => Some(Self::SourceIpSourcePortDestPort),
            _ => None,
        }
    }

    fn raw(self) -> u32 {
        match self {
            Self::SourceIp => 0,
            Self::SourceIpSourcePort => 1,
            Self::SourceIpSourcePortDestPort => 2,
        }
    }
}

/// `struct ipt_clusterip_tgt_info`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ClusterIpInfo {
    pub flags: u32,
    pub clustermac: [u8; 6],
    pub num_total_nodes: u16,
    pub num_local_nodes: u16,
    pub local_nodes: [u16; MAX_NODES],
    _pad: [u8; 2],
    pub hash_mode: u32,
    pub hash_initval: u32,
    /// Kernel-private pointer, never meaningful in userspace
    config: u64,
}

impl ClusterIpInfo {
    pub fn is_new(&self) -> bool {
        self.flags & FLAG_NEW != 0
    }

    pub fn hash_mode(&self) -> Option<HashMode> {
        HashMode::from_raw(self.hash_mode)
    }

    fn require_new(&self, param: Param) -> Result<()> {
        if self.is_new() {
            Ok(())
        } else {
            Err(Error::MissingPrerequisite {
                extension: Self::NAME.to_string(),
                param: param.to_string(),
                requires: Param::New.to_string(),
            })
        }
    }
}

fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut octets = value.split(':');
    for byte in mac.iter_mut() {
        let octet = octets.next()?;
        if octet.is_empty() || octet.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(octet, 16).ok()?;
    }
    octets.next().is_none().then_some(mac)
}

fn parse_node(param: Param, value: &str) -> Result<u16> {
    parse_uint(value, MAX_NODES as u64)
        .filter(|node| *node >= 1)
        .map(|node| node as u16)
        .ok_or_else(|| {
            Error::invalid(
                ClusterIpInfo::NAME,
                param.as_str(),
                value,
                format!("expected a node number between 1 and {}", MAX_NODES),
            )
        })
}

impl Codec for ClusterIpInfo {
    const NAME: &'static str = "CLUSTERIP";
    const REVISION: u8 = 0;
    const PARAMS: &'static [Param] = &[
        Param::New,
        Param::Hashmode,
        Param::Clustermac,
        Param::TotalNodes,
        Param::LocalNode,
        Param::HashInit,
    ];

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        if param != Param::New {
            self.require_new(param)?;
        }
        match param {
            Param::New => {
                if !value.is_empty() {
                    return Err(Error::invalid(
                        Self::NAME,
                        param.as_str(),
                        value,
                        "flag takes no value",
                    ));
                }
                self.flags |= FLAG_NEW;
            }
            Param::Hashmode => {
                let mode = HashMode::parse(value).ok_or_else(|| {
                    Error::invalid(Self::NAME, param.as_str(), value, "unknown hash mode")
                })?;
                self.hash_mode = mode.raw();
            }
            Param::Clustermac => {
                let mac = parse_mac(value).ok_or_else(|| {
                    Error::invalid(Self::NAME, param.as_str(), value, "not a MAC address")
                })?;
                if mac[0] & 0x01 == 0 {
                    return Err(Error::invalid(
                        Self::NAME,
                        param.as_str(),
                        value,
                        "MAC has to be a multicast ethernet address",
                    ));
                }
                self.clustermac = mac;
            }
            Param::TotalNodes => {
                self.num_total_nodes = parse_node(param, value)?;
            }
            Param::LocalNode => {
                let node = parse_node(param, value)?;
                self.local_nodes = [0; MAX_NODES];
                self.local_nodes[0] = node;
                self.num_local_nodes = 1;
            }
            Param::HashInit => {
                self.hash_initval = parse_uint(value, u64::from(u32::MAX))
                    .ok_or_else(|| {
                        Error::invalid(Self::NAME, param.as_str(), value, "expected a 32-bit value")
                    })? as u32;
            }
            other => {
                return Err(Error::UnknownParameter {
                    extension: Self::NAME.to_string(),
                    param: other.to_string(),
                });
            }
        }
        Ok(())
    }

    fn get(&self, param: Param) -> Option<String> {
        if !self.is_new() {
            return None;
        }
        match param {
            Param::New => Some(String::new()),
            Param::Hashmode => self.hash_mode().map(|mode| mode.as_str().to_string()),
            Param::Clustermac if self.clustermac != [0; 6] => Some(
                self.clustermac
                    .iter()
                    .map(|byte| format!("{:02X}", byte))
                    .collect::<Vec<_>>()
                    .join(":"),
            ),
            Param::TotalNodes if self.num_total_nodes > 0 => {
                Some(self.num_total_nodes.to_string())
            }
            Param::LocalNode if self.num_local_nodes > 0 => {
                let count = usize::from(self.num_local_nodes).min(MAX_NODES);
                Some(
                    self.local_nodes[..count]
                        .iter()
                        .map(u16::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            }
            Param::HashInit if self.hash_initval != 0 => Some(self.hash_initval.to_string()),
            _ => None,
        }
    }

    fn check(&self, rule: &Rule) -> Result<()> {
        if rule.dst.prefix_len() != Some(32) || rule.dst.addr.is_unspecified() || rule.dst.invert
        {
            return Err(Error::constraint(
                Self::NAME,
                "requires a single destination address",
            ));
        }
        if !self.is_new() {
            return Ok(());
        }
        if self.clustermac == [0; 6] || self.num_total_nodes == 0 || self.num_local_nodes == 0 {
            return Err(Error::constraint(
                Self::NAME,
                "new requires clustermac, total_nodes and local_node",
            ));
        }
        let count = usize::from(self.num_local_nodes).min(MAX_NODES);
        if self.local_nodes[..count]
            .iter()
            .any(|node| *node > self.num_total_nodes)
        {
            return Err(Error::constraint(
                Self::NAME,
                "local_node is greater than total_nodes",
            ));
        }
        if rule.in_interface.is_any() {
            return Err(Error::constraint(
                Self::NAME,
                "new requires an input interface",
            ));
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        self.config = 0;
    }
}
