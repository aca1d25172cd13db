//! `mark` match and `MARK` target

use super::{Codec, Param};
use crate::error::{Error, Result};
use crate::parse::{parse_uint, split_invert};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `struct xt_mark_mtinfo1`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MarkMatchInfo {
    pub mark: u32,
    pub mask: u32,
    pub invert: u8,
    _pad: [u8; 3],
}

/// `struct xt_mark_tginfo2`. The kernel computes
/// `skb->mark = (skb->mark & ~mask) ^ mark`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MarkTargetInfo {
    pub mark: u32,
    pub mask: u32,
}

/// `value[/mask]`, mask defaulting to all ones
fn parse_mark(ext: &str, param: Param, value: &str) -> Result<(u32, Option<u32>)> {
    let max = u64::from(u32::MAX);
    let bad = || Error::invalid(ext, param.as_str(), value, "expected value[/mask]");
    match value.split_once('/') {
        None => Ok((parse_uint(value, max).ok_or_else(bad)? as u32, None)),
        Some((mark, mask)) => Ok((
            parse_uint(mark, max).ok_or_else(bad)? as u32,
            Some(parse_uint(mask, max).ok_or_else(bad)? as u32),
        )),
    }
}

fn parse_bits(ext: &str, param: Param, value: &str) -> Result<u32> {
    parse_uint(value, u64::from(u32::MAX))
        .map(|bits| bits as u32)
        .ok_or_else(|| Error::invalid(ext, param.as_str(), value, "expected a 32-bit value"))
}

impl Codec for MarkMatchInfo {
    const NAME: &'static str = "mark";
    const REVISION: u8 = 1;
    const PARAMS: &'static [Param] = &[Param::Mark];

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        if param != Param::Mark {
            return Err(Error::UnknownParameter {
                extension: Self::NAME.to_string(),
                param: param.to_string(),
            });
        }
        let (invert, spec) = split_invert(value);
        let (mark, mask) = parse_mark(Self::NAME, param, spec)?;
        self.mark = mark;
        self.mask = mask.unwrap_or(u32::MAX);
        self.invert = u8::from(invert);
        Ok(())
    }

    fn get(&self, param: Param) -> Option<String> {
        if param != Param::Mark || (self.mark == 0 && self.mask == 0 && self.invert == 0) {
            return None;
        }
        let bang = if self.invert != 0 { "!" } else { "" };
        if self.mask == u32::MAX {
            Some(format!("{}{:#x}", bang, self.mark))
        } else {
            Some(format!("{}{:#x}/{:#x}", bang, self.mark, self.mask))
        }
    }
}

impl Codec for MarkTargetInfo {
    const NAME: &'static str = "MARK";
    const REVISION: u8 = 2;
    const PARAMS: &'static [Param] = &[
        Param::SetXmark,
        Param::SetMark,
        Param::AndMark,
        Param::OrMark,
        Param::XorMark,
    ];

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        let (mark, mask) = match param {
            Param::SetXmark => {
                let (mark, mask) = parse_mark(Self::NAME, param, value)?;
                (mark, mask.unwrap_or(u32::MAX))
            }
            Param::SetMark => {
                let (mark, mask) = parse_mark(Self::NAME, param, value)?;
                (mark, mark | mask.unwrap_or(u32::MAX))
            }
            Param::AndMark => (0, !parse_bits(Self::NAME, param, value)?),
            Param::OrMark => {
                let bits = parse_bits(Self::NAME, param, value)?;
                (bits, bits)
            }
            Param::XorMark => (parse_bits(Self::NAME, param, value)?, 0),
            other => {
                return Err(Error::UnknownParameter {
                    extension: Self::NAME.to_string(),
                    param: other.to_string(),
                });
            }
        };
        self.mark = mark;
        self.mask = mask;
        Ok(())
    }

    fn get(&self, param: Param) -> Option<String> {
        match param {
            Param::SetXmark if self.mark != 0 || self.mask != 0 => {
                Some(format!("{:#x}/{:#x}", self.mark, self.mask))
            }
            // the operator forms are write-only views of set_xmark
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_sizes_match_kernel() {
        assert_eq!(std::mem::size_of::<MarkMatchInfo>(), 12);
        assert_eq!(std::mem::size_of::<MarkTargetInfo>(), 8);
    }

    #[test]
    fn set_mark_ors_value_into_mask() {
        let mut target = MarkTargetInfo::initial();
        target.set(Param::SetMark, "0x123").unwrap();
        assert_eq!((target.mark, target.mask), (0x123, u32::MAX));

        target.set(Param::SetMark, "0x10/0x0f").unwrap();
        assert_eq!((target.mark, target.mask), (0x10, 0x1f));
        assert_eq!(target.get(Param::SetMark), None);
        assert_eq!(target.get(Param::SetXmark).as_deref(), Some("0x10/0x1f"));
    }

    #[test]
    fn operators_rewrite_xmark() {
        let mut target = MarkTargetInfo::initial();
        target.set(Param::AndMark, "0xff").unwrap();
        assert_eq!((target.mark, target.mask), (0, 0xffff_ff00));

        target.set(Param::OrMark, "0x4").unwrap();
        assert_eq!((target.mark, target.mask), (4, 4));

        target.set(Param::XorMark, "0x4").unwrap();
        assert_eq!((target.mark, target.mask), (4, 0));
        assert_eq!(target.get(Param::SetXmark).as_deref(), Some("0x4/0x0"));
    }

    #[test]
    fn marks_are_32_bit() {
        let mut target = MarkTargetInfo::initial();
        assert!(target.set(Param::SetXmark, "0x100000000").is_err());
        assert!(target.set(Param::AndMark, "1/2").is_err());
        assert!(target.set(Param::SetXmark, "nope").is_err());
    }

    #[test]
    fn mark_match_inverts() {
        let mut info = MarkMatchInfo::initial();
        assert_eq!(info.get(Param::Mark), None);
        info.set(Param::Mark, "!0x1/0xf").unwrap();
        assert_eq!(info.invert, 1);
        assert_eq!(info.get(Param::Mark).as_deref(), Some("!0x1/0xf"));

        info.set(Param::Mark, "7").unwrap();
        assert_eq!(info.get(Param::Mark).as_deref(), Some("0x7"));
    }
}
