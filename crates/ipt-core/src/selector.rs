//! Core rule selectors: addresses, interfaces, protocol and fragment flag.

use crate::error::{Error, Result};
use crate::parse::{parse_uint, split_invert};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const IFNAME_MAX: usize = 15;

/// An IPv4 address with mask, as carried in `ipt_ip`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub invert: bool,
}

impl Default for Address {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            invert: false,
        }
    }
}

impl Address {
    /// Parse `a.b.c.d`, `a.b.c.d/len` or `a.b.c.d/m.m.m.m`, optionally
    /// prefixed with `!`. The address is masked.
    pub fn parse(field: &'static str, value: &str) -> Result<Self> {
        let (invert, spec) = split_invert(value);

        let (addr, mask) = match spec.split_once('/') {
            None => {
                let addr: Ipv4Addr = spec
                    .parse()
                    .map_err(|_| Error::selector(field, value, "not an IPv4 address"))?;
                (addr, Ipv4Addr::BROADCAST)
            }
            Some((addr_part, mask_part)) if mask_part.contains('.') => {
                let addr: Ipv4Addr = addr_part
                    .parse()
                    .map_err(|_| Error::selector(field, value, "not an IPv4 address"))?;
                let mask: Ipv4Addr = mask_part
                    .parse()
                    .map_err(|_| Error::selector(field, value, "invalid netmask"))?;
                (addr, mask)
            }
            Some(_) => {
                let net: Ipv4Net = spec
                    .parse()
                    .map_err(|_| Error::selector(field, value, "invalid CIDR"))?;
                (net.addr(), net.netmask())
            }
        };

        let masked = Ipv4Addr::from(u32::from(addr) & u32::from(mask));
        Ok(Self {
            addr: masked,
            mask,
            invert,
        })
    }

    pub fn is_any(&self) -> bool {
        self.mask.is_unspecified() && !self.invert
    }

    /// Prefix length when the mask is contiguous
    pub fn prefix_len(&self) -> Option<u8> {
        let bits = u32::from(self.mask);
        let len = bits.leading_ones();
        (bits.checked_shl(len).unwrap_or(0) == 0).then_some(len as u8)
    }

    /// iptables-save form (`1.2.3.0/24`)
    pub fn to_save(&self) -> String {
        match self.prefix_len() {
            Some(len) => format!("{}/{}", self.addr, len),
            None => format!("{}/{}", self.addr, self.mask),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.invert {
            write!(f, "!")?;
        }
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

/// An interface selector. A trailing `+` matches every interface with that
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Interface {
    pub name: String,
    pub invert: bool,
}

impl Interface {
    pub fn parse(field: &'static str, value: &str) -> Result<Self> {
        let (invert, name) = split_invert(value);
        if invert && name.is_empty() {
            return Err(Error::selector(field, value, "negation needs an interface name"));
        }
        if name.len() > IFNAME_MAX {
            return Err(Error::selector(
                field,
                value,
                format!("interface names are at most {} bytes", IFNAME_MAX),
            ));
        }
        if name.bytes().any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace()) {
            return Err(Error::selector(field, value, "invalid character"));
        }
        Ok(Self {
            name: name.to_string(),
            invert,
        })
    }

    pub fn is_any(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.name.ends_with('+')
    }

    /// The name and comparison mask as laid out in `ipt_ip`
    pub fn to_kernel(&self) -> ([u8; 16], [u8; 16]) {
        let mut name = [0u8; 16];
        let mut mask = [0u8; 16];
        let bytes = self.name.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);

        if bytes.is_empty() {
            return (name, mask);
        }
        let significant = if self.is_wildcard() {
            bytes.len() - 1
        } else {
            // include the terminating NUL
            bytes.len() + 1
        };
        mask[..significant].fill(0xff);
        (name, mask)
    }

    /// Rebuild from the kernel name buffer. The `+` suffix is kept in the
    /// name itself, so only the NUL terminator matters here.
    pub fn from_kernel(name: &[u8; 16], invert: bool) -> Self {
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Self {
            name: String::from_utf8_lossy(&name[..len]).into_owned(),
            invert,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.invert {
            write!(f, "!")?;
        }
        write!(f, "{}", self.name)
    }
}

const PROTOCOLS: &[(&str, u16)] = &[
    ("all", 0),
    ("icmp", 1),
    ("igmp", 2),
    ("tcp", 6),
    ("udp", 17),
    ("gre", 47),
    ("esp", 50),
    ("ah", 51),
    ("sctp", 132),
    ("dccp", 33),
    ("udplite", 136),
];

pub const IPPROTO_TCP: u16 = 6;
pub const IPPROTO_UDP: u16 = 17;
pub const IPPROTO_SCTP: u16 = 132;
pub const IPPROTO_DCCP: u16 = 33;

/// Layer 4 protocol selector; 0 means any protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protocol {
    pub number: u16,
    pub invert: bool,
}

impl Protocol {
    pub fn parse(value: &str) -> Result<Self> {
        let (invert, spec) = split_invert(value);
        let lowered = spec.to_ascii_lowercase();

        let number = PROTOCOLS
            .iter()
            .find(|(name, _)| *name == lowered)
            .map(|(_, number)| *number)
            .or_else(|| parse_uint(spec, 255).map(|n| n as u16))
            .ok_or_else(|| Error::selector("protocol", value, "unknown protocol"))?;

        if invert && number == 0 {
            return Err(Error::selector(
                "protocol",
                value,
                "rule would never match a protocol",
            ));
        }

        Ok(Self { number, invert })
    }

    pub fn name(&self) -> String {
        PROTOCOLS
            .iter()
            .find(|(_, number)| *number == self.number)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| self.number.to_string())
    }

    pub fn is_any(&self) -> bool {
        self.number == 0 && !self.invert
    }

    /// Whether the rule positively selects exactly this protocol
    pub fn is(&self, number: u16) -> bool {
        self.number == number && !self.invert
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.invert {
            write!(f, "!")?;
        }
        write!(f, "{}", self.name())
    }
}

/// Fragment selector (`-f` / `! -f`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Fragment {
    #[default]
    Any,
    /// Second and further fragments only
    Only,
    /// Unfragmented packets and first fragments only
    Not,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_address_gets_full_mask() {
        let addr = Address::parse("dst", "127.0.0.2").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.2/255.255.255.255");
        assert_eq!(addr.prefix_len(), Some(32));
    }

    #[test]
    fn cidr_and_dotted_masks_are_equivalent() {
        let a = Address::parse("src", "10.1.2.3/24").unwrap();
        let b = Address::parse("src", "10.1.2.0/255.255.255.0").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_save(), "10.1.2.0/24");
    }

    #[test]
    fn inverted_address_renders_bang() {
        let addr = Address::parse("src", "! 192.168.0.0/16").unwrap();
        assert!(addr.invert);
        assert_eq!(addr.to_string(), "!192.168.0.0/255.255.0.0");
    }

    #[test]
    fn bad_addresses_fail() {
        assert!(Address::parse("dst", "300.1.1.1").is_err());
        assert!(Address::parse("dst", "10.0.0.0/33").is_err());
        assert!(Address::parse("dst", "asdf").is_err());
    }

    #[test]
    fn interface_masks_follow_iptables() {
        let exact = Interface::parse("in_interface", "eth0").unwrap();
        let (name, mask) = exact.to_kernel();
        assert_eq!(&name[..4], b"eth0");
        assert_eq!(&mask[..5], &[0xff; 5]);
        assert_eq!(mask[5], 0);

        let wildcard = Interface::parse("in_interface", "eth+").unwrap();
        let (name, mask) = wildcard.to_kernel();
        assert_eq!(&name[..4], b"eth+");
        assert_eq!(&mask[..3], &[0xff; 3]);
        assert_eq!(mask[3], 0);
    }

    #[test]
    fn long_interface_names_fail() {
        assert!(Interface::parse("out_interface", "a-very-long-interface").is_err());
    }

    #[test]
    fn bare_negation_is_not_an_interface() {
        assert!(Interface::parse("in_interface", "!").is_err());
        assert!(Interface::parse("in_interface", "! ").is_err());
        assert!(Interface::parse("in_interface", "").unwrap().is_any());
    }

    #[test]
    fn protocols_by_name_and_number() {
        assert_eq!(Protocol::parse("tcp").unwrap().number, 6);
        assert_eq!(Protocol::parse("TCP").unwrap().number, 6);
        assert_eq!(Protocol::parse("47").unwrap().name(), "gre");
        assert_eq!(Protocol::parse("253").unwrap().name(), "253");
        assert!(Protocol::parse("!udp").unwrap().invert);
        assert!(Protocol::parse("256").is_err());
        assert!(Protocol::parse("! all").is_err());
    }
}
