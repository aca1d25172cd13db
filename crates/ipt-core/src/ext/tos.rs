//! `TOS` target

use super::{Codec, Param};
use crate::error::{Error, Result};
use crate::parse::{parse_uint, parse_uint_prefix};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Mask used by the symbolic names; only the old TOS bits are touched
const SYMBOLIC_MASK: u8 = 0x3f;

const TOS_NAMES: &[(&str, u8)] = &[
    ("Minimize-Delay", 0x10),
    ("Maximize-Throughput", 0x08),
    ("Maximize-Reliability", 0x04),
    ("Minimize-Cost", 0x02),
    ("Normal-Service", 0x00),
];

/// `struct xt_tos_target_info`. The kernel computes
/// `tos = (tos & ~mask) ^ value`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TosTargetInfo {
    pub tos_value: u8,
    pub tos_mask: u8,
}

fn parse_byte(param: Param, value: &str) -> Result<u8> {
    parse_uint(value, 0xff)
        .map(|byte| byte as u8)
        .ok_or_else(|| {
            Error::invalid(
                TosTargetInfo::NAME,
                param.as_str(),
                value,
                "expected a value between 0 and 0xff",
            )
        })
}

fn parse_set_tos(value: &str) -> Result<(u8, u8)> {
    if let Some((_, tos)) = TOS_NAMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value))
    {
        return Ok((*tos, SYMBOLIC_MASK));
    }

    let bad = || {
        Error::invalid(
            TosTargetInfo::NAME,
            Param::SetTos.as_str(),
            value,
            "expected value[/mask] or a symbolic TOS name",
        )
    };
    let (tos, rest) = parse_uint_prefix(value, 0xff).ok_or_else(bad)?;
    let mask = match rest {
        "" => 0xff,
        _ => {
            let mask = rest.strip_prefix('/').ok_or_else(bad)?;
            parse_uint(mask, 0xff).ok_or_else(bad)?
        }
    };
    Ok((tos as u8, mask as u8))
}

impl Codec for TosTargetInfo {
    const NAME: &'static str = "TOS";
    const REVISION: u8 = 1;
    const PARAMS: &'static [Param] = &[Param::SetTos, Param::AndTos, Param::OrTos, Param::XorTos];

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        let (tos, mask) = match param {
            Param::SetTos => parse_set_tos(value)?,
            Param::AndTos => (0, !parse_byte(param, value)?),
            Param::OrTos => {
                let bits = parse_byte(param, value)?;
                (bits, bits)
            }
            Param::XorTos => (parse_byte(param, value)?, 0),
            other => {
                return Err(Error::UnknownParameter {
                    extension: Self::NAME.to_string(),
                    param: other.to_string(),
                });
            }
        };
        self.tos_value = tos;
        self.tos_mask = mask;
        Ok(())
    }

    fn get(&self, param: Param) -> Option<String> {
        (param == Param::SetTos).then(|| format!("{:#04x}/{:#04x}", self.tos_value, self.tos_mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_tos(value: &str) -> Result<TosTargetInfo> {
        let mut info = TosTargetInfo::initial();
        info.set(Param::SetTos, value)?;
        Ok(info)
    }

    #[test]
    fn symbolic_names_use_legacy_mask() {
        for (name, tos) in TOS_NAMES {
            let info = set_tos(name).unwrap();
            assert_eq!(
                info.get(Param::SetTos),
                Some(format!("{:#04x}/0x3f", tos)),
                "{}",
                name
            );
        }
        assert_eq!(
            set_tos("minimize-delay").unwrap().get(Param::SetTos).as_deref(),
            Some("0x10/0x3f")
        );
    }

    #[test]
    fn numeric_values_default_to_full_mask() {
        assert_eq!(
            set_tos("0x12").unwrap().get(Param::SetTos).as_deref(),
            Some("0x12/0xff")
        );
        assert_eq!(
            set_tos("0x12/0x0f").unwrap().get(Param::SetTos).as_deref(),
            Some("0x12/0x0f")
        );
    }

    #[test]
    fn out_of_range_values_fail() {
        for value in ["0x1234", "0x12/0xfff", "Foobar", "0x12/", "12x"] {
            assert!(set_tos(value).is_err(), "{} accepted", value);
        }
    }

    #[test]
    fn operators_mirror_mark() {
        let mut info = TosTargetInfo::initial();
        info.set(Param::AndTos, "0x12").unwrap();
        assert_eq!(info.get(Param::SetTos).as_deref(), Some("0x00/0xed"));

        info.set(Param::OrTos, "0x12").unwrap();
        assert_eq!(info.get(Param::SetTos).as_deref(), Some("0x12/0x12"));

        info.set(Param::XorTos, "0x12").unwrap();
        assert_eq!(info.get(Param::SetTos).as_deref(), Some("0x12/0x00"));

        assert!(info.set(Param::AndTos, "0x1234").is_err());
        assert!(info.set(Param::OrTos, "0x12/0x12").is_err());
        assert_eq!(info.get(Param::AndTos), None);
    }
}
