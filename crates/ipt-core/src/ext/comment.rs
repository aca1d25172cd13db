use super::{Codec, Param};
use crate::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const COMMENT_LEN: usize = 256;

/// `struct xt_comment_info`: a NUL-terminated string
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CommentInfo {
    pub comment: [u8; COMMENT_LEN],
}

impl Codec for CommentInfo {
    const NAME: &'static str = "comment";
    const REVISION: u8 = 0;
    const PARAMS: &'static [Param] = &[Param::Comment];

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        if param != Param::Comment {
            return Err(Error::UnknownParameter {
                extension: Self::NAME.to_string(),
                param: param.to_string(),
            });
        }
        if value.len() >= COMMENT_LEN {
            return Err(Error::invalid(
                Self::NAME,
                param.as_str(),
                value,
                "comment is longer than 255 bytes",
            ));
        }
        if value.contains('\0') {
            return Err(Error::invalid(
                Self::NAME,
                param.as_str(),
                value,
                "comment contains NUL",
            ));
        }
        self.comment = [0; COMMENT_LEN];
        self.comment[..value.len()].copy_from_slice(value.as_bytes());
        Ok(())
    }

    fn get(&self, param: Param) -> Option<String> {
        let len = self.comment.iter().position(|&b| b == 0).unwrap_or(COMMENT_LEN);
        (param == Param::Comment && len > 0)
            .then(|| String::from_utf8_lossy(&self.comment[..len]).into_owned())
    }

    fn sanitize(&mut self) {
        // bytes after the terminator do not take part in matching
        if let Some(end) = self.comment.iter().position(|&b| b == 0) {
            self.comment[end..].fill(0);
        }
    }
}
