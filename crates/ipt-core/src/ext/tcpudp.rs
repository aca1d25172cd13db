//! `tcp` and `udp` port matches

use super::{Codec, Param};
use crate::error::{Error, Result};
use crate::parse::{parse_port, parse_uint, split_invert};
use crate::rule::Rule;
use crate::selector::{IPPROTO_TCP, IPPROTO_UDP};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const INV_SRCPT: u8 = 0x01;
const INV_DSTPT: u8 = 0x02;
const INV_FLAGS: u8 = 0x04;
const INV_OPTION: u8 = 0x08;

const ANY_PORT: [u16; 2] = [0, u16::MAX];

const TCP_FLAGS: &[(&str, u8)] = &[
    ("FIN", 0x01),
    ("SYN", 0x02),
    ("RST", 0x04),
    ("PSH", 0x08),
    ("ACK", 0x10),
    ("URG", 0x20),
];

/// `struct xt_tcp`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcpInfo {
    pub spts: [u16; 2],
    pub dpts: [u16; 2],
    pub option: u8,
    pub flg_mask: u8,
    pub flg_cmp: u8,
    pub invflags: u8,
}

/// `struct xt_udp`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UdpInfo {
    pub spts: [u16; 2],
    pub dpts: [u16; 2],
    pub invflags: u8,
    _pad: u8,
}

fn parse_range(ext: &str, param: Param, value: &str, spec: &str) -> Result<[u16; 2]> {
    let port = |part: &str, default: u16| -> Result<u16> {
        if part.is_empty() {
            return Ok(default);
        }
        parse_port(part)
            .ok_or_else(|| Error::invalid(ext, param.as_str(), value, "invalid port/service"))
    };

    let range = match spec.split_once(':') {
        None if spec.is_empty() => {
            return Err(Error::invalid(ext, param.as_str(), value, "missing port"));
        }
        None => {
            let p = port(spec, 0)?;
            [p, p]
        }
        Some((lo, hi)) => [port(lo, 0)?, port(hi, u16::MAX)?],
    };

    if range[0] > range[1] {
        return Err(Error::invalid(
            ext,
            param.as_str(),
            value,
            "range start is above range end",
        ));
    }
    Ok(range)
}

fn set_ports(
    ext: &str,
    param: Param,
    value: &str,
    ports: &mut [u16; 2],
    invflags: &mut u8,
    bit: u8,
) -> Result<()> {
    let (invert, spec) = split_invert(value);
    *ports = parse_range(ext, param, value, spec)?;
    set_bit(invflags, bit, invert);
    Ok(())
}

fn render_ports(ports: [u16; 2], invert: bool) -> Option<String> {
    if ports == ANY_PORT && !invert {
        return None;
    }
    let bang = if invert { "!" } else { "" };
    if ports[0] == ports[1] {
        Some(format!("{}{}", bang, ports[0]))
    } else {
        Some(format!("{}{}:{}", bang, ports[0], ports[1]))
    }
}

fn set_bit(flags: &mut u8, bit: u8, on: bool) {
    if on {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

fn parse_flag_list(list: &str) -> Option<u8> {
    let mut mask = 0;
    for name in list.split(',') {
        mask |= match name.to_ascii_uppercase().as_str() {
            "ALL" => 0x3f,
            "NONE" => 0,
            upper => {
                TCP_FLAGS
                    .iter()
                    .find(|(flag, _)| *flag == upper)?
                    .1
            }
        };
    }
    Some(mask)
}

fn render_flag_list(mask: u8) -> String {
    if mask == 0 {
        return "NONE".to_string();
    }
    TCP_FLAGS
        .iter()
        .filter(|(_, bit)| mask & bit != 0)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

fn require_protocol(rule: &Rule, ext: &str, number: u16) -> Result<()> {
    if rule.protocol.is(number) {
        Ok(())
    } else {
        Err(Error::constraint(
            ext,
            format!("only valid for protocol {}", ext),
        ))
    }
}

impl Codec for TcpInfo {
    const NAME: &'static str = "tcp";
    const REVISION: u8 = 0;
    const PARAMS: &'static [Param] = &[
        Param::Sport,
        Param::Dport,
        Param::TcpFlags,
        Param::Syn,
        Param::TcpOption,
    ];

    fn initial() -> Self {
        Self {
            spts: ANY_PORT,
            dpts: ANY_PORT,
            option: 0,
            flg_mask: 0,
            flg_cmp: 0,
            invflags: 0,
        }
    }

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        match param {
            Param::Sport => set_ports(
                Self::NAME,
                param,
                value,
                &mut self.spts,
                &mut self.invflags,
                INV_SRCPT,
            ),
            Param::Dport => set_ports(
                Self::NAME,
                param,
                value,
                &mut self.dpts,
                &mut self.invflags,
                INV_DSTPT,
            ),
            Param::TcpFlags => {
                let (invert, spec) = split_invert(value);
                let mut parts = spec.split_whitespace();
                let (Some(mask), Some(comp), None) = (parts.next(), parts.next(), parts.next())
                else {
                    return Err(Error::invalid(
                        Self::NAME,
                        param.as_str(),
                        value,
                        "expected \"MASK COMP\"",
                    ));
                };
                let unknown =
                    || Error::invalid(Self::NAME, param.as_str(), value, "unknown TCP flag");
                self.flg_mask = parse_flag_list(mask).ok_or_else(unknown)?;
                self.flg_cmp = parse_flag_list(comp).ok_or_else(unknown)?;
                set_bit(&mut self.invflags, INV_FLAGS, invert);
                Ok(())
            }
            Param::Syn => {
                let (invert, spec) = split_invert(value);
                if !spec.is_empty() {
                    return Err(Error::invalid(
                        Self::NAME,
                        param.as_str(),
                        value,
                        "flag takes no value",
                    ));
                }
                // FIN,SYN,RST,ACK SYN
                self.flg_mask = 0x17;
                self.flg_cmp = 0x02;
                set_bit(&mut self.invflags, INV_FLAGS, invert);
                Ok(())
            }
            Param::TcpOption => {
                let (invert, spec) = split_invert(value);
                let option = parse_uint(spec, 0xff)
                    .filter(|option| *option > 0)
                    .ok_or_else(|| {
                        Error::invalid(Self::NAME, param.as_str(), value, "expected 1-255")
                    })?;
                self.option = option as u8;
                set_bit(&mut self.invflags, INV_OPTION, invert);
                Ok(())
            }
            other => Err(Error::UnknownParameter {
                extension: Self::NAME.to_string(),
                param: other.to_string(),
            }),
        }
    }

    fn get(&self, param: Param) -> Option<String> {
        match param {
            Param::Sport => render_ports(self.spts, self.invflags & INV_SRCPT != 0),
            Param::Dport => render_ports(self.dpts, self.invflags & INV_DSTPT != 0),
            Param::TcpFlags => {
                let invert = self.invflags & INV_FLAGS != 0;
                if self.flg_mask == 0 && !invert {
                    return None;
                }
                Some(format!(
                    "{}{} {}",
                    if invert { "!" } else { "" },
                    render_flag_list(self.flg_mask),
                    render_flag_list(self.flg_cmp)
                ))
            }
            Param::TcpOption => {
                let invert = self.invflags & INV_OPTION != 0;
                (self.option != 0).then(|| {
                    format!("{}{}", if invert { "!" } else { "" }, self.option)
                })
            }
            // `syn` reads back through tcp_flags
            _ => None,
        }
    }

    fn check(&self, rule: &Rule) -> Result<()> {
        require_protocol(rule, Self::NAME, IPPROTO_TCP)
    }
}

impl Codec for UdpInfo {
    const NAME: &'static str = "udp";
    const REVISION: u8 = 0;
    const PARAMS: &'static [Param] = &[Param::Sport, Param::Dport];

    fn initial() -> Self {
        Self {
            spts: ANY_PORT,
            dpts: ANY_PORT,
            invflags: 0,
            _pad: 0,
        }
    }

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        match param {
            Param::Sport => set_ports(
                Self::NAME,
                param,
                value,
                &mut self.spts,
                &mut self.invflags,
                INV_SRCPT,
            ),
            Param::Dport => set_ports(
                Self::NAME,
                param,
                value,
                &mut self.dpts,
                &mut self.invflags,
                INV_DSTPT,
            ),
            other => Err(Error::UnknownParameter {
                extension: Self::NAME.to_string(),
                param: other.to_string(),
            }),
        }
    }

    fn get(&self, param: Param) -> Option<String> {
        match param {
            Param::Sport => render_ports(self.spts, self.invflags & INV_SRCPT != 0),
            Param::Dport => render_ports(self.dpts, self.invflags & INV_DSTPT != 0),
            _ => None,
        }
    }

    fn check(&self, rule: &Rule) -> Result<()> {
        require_protocol(rule, Self::NAME, IPPROTO_UDP)
    }
}
