//! `REDIRECT` and `MASQUERADE` targets
//!
//! Both carry `nf_nat_ipv4_multi_range_compat` with a single range; ports
//! are stored in network byte order.

use super::{Codec, Param};
use crate::error::{Error, Result};
use crate::parse::{atoi, parse_uint, parse_uint_prefix, service_to_port};
use crate::rule::Rule;
use crate::selector::{IPPROTO_DCCP, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const PROTO_SPECIFIED: u32 = 0x02;
const PROTO_RANDOM: u32 = 0x04;
const PROTO_RANDOM_FULLY: u32 = 0x10;

const PORT_PROTOCOLS: [u16; 4] = [IPPROTO_TCP, IPPROTO_UDP, IPPROTO_SCTP, IPPROTO_DCCP];

/// `struct nf_nat_ipv4_multi_range_compat` with `rangesize == 1`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NatRange {
    pub rangesize: u32,
    pub flags: u32,
    pub min_ip: [u8; 4],
    pub max_ip: [u8; 4],
    min_port: [u8; 2],
    max_port: [u8; 2],
}

impl NatRange {
    fn empty() -> Self {
        Self {
            rangesize: 1,
            flags: 0,
            min_ip: [0; 4],
            max_ip: [0; 4],
            min_port: [0; 2],
            max_port: [0; 2],
        }
    }

    /// Port range in host byte order, when one was given
    pub fn ports(&self) -> Option<(u16, u16)> {
        (self.flags & PROTO_SPECIFIED != 0).then(|| {
            (
                u16::from_be_bytes(self.min_port),
                u16::from_be_bytes(self.max_port),
            )
        })
    }

    fn set_ports(&mut self, min: u16, max: u16) {
        self.min_port = min.to_be_bytes();
        self.max_port = max.to_be_bytes();
        self.flags |= PROTO_SPECIFIED;
    }

    fn set_flag(&mut self, ext: &str, param: Param, value: &str, flag: u32) -> Result<()> {
        if !value.is_empty() {
            return Err(Error::invalid(ext, param.as_str(), value, "flag takes no value"));
        }
        self.flags |= flag;
        Ok(())
    }

    fn get(&self, param: Param) -> Option<String> {
        match param {
            Param::ToPorts => self.ports().map(|(min, max)| {
                if min == max {
                    min.to_string()
                } else {
                    format!("{}-{}", min, max)
                }
            }),
            Param::Random => (self.flags & PROTO_RANDOM != 0).then(String::new),
            Param::RandomFully => (self.flags & PROTO_RANDOM_FULLY != 0).then(String::new),
            _ => None,
        }
    }

    fn check(&self, ext: &str, rule: &Rule) -> Result<()> {
        if self.ports().is_none() {
            return Ok(());
        }
        if rule.protocol.invert || !PORT_PROTOCOLS.contains(&rule.protocol.number) {
            return Err(Error::constraint(
                ext,
                "need TCP, UDP, SCTP or DCCP with port specification",
            ));
        }
        Ok(())
    }
}

fn unknown(ext: &str, param: Param) -> Error {
    Error::UnknownParameter {
        extension: ext.to_string(),
        param: param.to_string(),
    }
}

/// Strict `port[-port]` as parsed by the MASQUERADE extension
fn parse_ports_strict(value: &str) -> Result<(u16, u16)> {
    let bad = |reason: &str| {
        Error::invalid(
            MasqueradeInfo::NAME,
            Param::ToPorts.as_str(),
            value,
            reason,
        )
    };
    let max = u64::from(u16::MAX);
    let (min, rest) = match parse_uint_prefix(value, max) {
        Some((port, rest)) => (port as u16, rest),
        None => (
            service_to_port(value).ok_or_else(|| bad("invalid port/service"))?,
            "",
        ),
    };

    match rest {
        "" => Ok((min, min)),
        _ => {
            let upper = rest.strip_prefix('-').ok_or_else(|| bad("invalid port/service"))?;
            let max = parse_uint(upper, max)
                .map(|port| port as u16)
                .or_else(|| service_to_port(upper))
                .ok_or_else(|| bad("invalid port/service"))?;
            if max < min {
                return Err(bad("range start is above range end"));
            }
            Ok((min, max))
        }
    }
}

/// `port[-port]` as parsed by the REDIRECT extension, which reads each bound
/// with `atoi`. Unresolvable names therefore slip through as port 65535.
fn parse_ports_legacy(value: &str) -> Result<(u16, u16)> {
    let bad = |reason: &str| {
        Error::invalid(RedirectInfo::NAME, Param::ToPorts.as_str(), value, reason)
    };
    if value.contains('.') {
        return Err(bad("IP address not permitted"));
    }

    let mut port = atoi(value);
    if port == 0 {
        port = service_to_port(value).map(i64::from).unwrap_or(-1);
    }
    if port == 0 || port > 65535 {
        return Err(bad("port out of range"));
    }

    match value.find('-') {
        None => Ok((port as u16, port as u16)),
        Some(dash) => {
            let max = atoi(&value[dash + 1..]);
            if max == 0 || max > 65535 {
                return Err(bad("port out of range"));
            }
            if max < port {
                return Err(bad("range start is above range end"));
            }
            Ok((port as u16, max as u16))
        }
    }
}

/// REDIRECT payload
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RedirectInfo(pub NatRange);

/// MASQUERADE payload
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MasqueradeInfo(pub NatRange);

impl Codec for RedirectInfo {
    const NAME: &'static str = "REDIRECT";
    const REVISION: u8 = 0;
    const PARAMS: &'static [Param] = &[Param::ToPorts, Param::Random];

    fn initial() -> Self {
        Self(NatRange::empty())
    }

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        match param {
            Param::ToPorts => {
                let (min, max) = parse_ports_legacy(value)?;
                self.0.set_ports(min, max);
                Ok(())
            }
            Param::Random => self.0.set_flag(Self::NAME, param, value, PROTO_RANDOM),
            other => Err(unknown(Self::NAME, other)),
        }
    }

    fn get(&self, param: Param) -> Option<String> {
        self.0.get(param)
    }

    fn check(&self, rule: &Rule) -> Result<()> {
        self.0.check(Self::NAME, rule)
    }
}

impl Codec for MasqueradeInfo {
    const NAME: &'static str = "MASQUERADE";
    const REVISION: u8 = 0;
    const PARAMS: &'static [Param] = &[Param::ToPorts, Param::Random, Param::RandomFully];

    fn initial() -> Self {
        Self(NatRange::empty())
    }

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        match param {
            Param::ToPorts => {
                let (min, max) = parse_ports_strict(value)?;
                self.0.set_ports(min, max);
                Ok(())
            }
            Param::Random => self.0.set_flag(Self::NAME, param, value, PROTO_RANDOM),
            Param::RandomFully => self.0.set_flag(Self::NAME, param, value, PROTO_RANDOM_FULLY),
            other => Err(unknown(Self::NAME, other)),
        }
    }

    fn get(&self, param: Param) -> Option<String> {
        self.0.get(param)
    }

    fn check(&self, rule: &Rule) -> Result<()> {
        self.0.check(Self::NAME, rule)
    }
}
