//! Match and target extensions.
//!
//! Every modelled extension keeps its state in the exact payload struct the
//! kernel receives, so parameters that interact (TOS `and_tos` versus
//! `set_tos`, MARK `or_mark` versus `set_xmark`) are views over one value
//! rather than independent fields. Names the registry does not know are
//! rejected on construction; payloads read back from the kernel with an
//! unknown name are carried as opaque bytes.

mod clusterip;
mod comment;
mod mark;
mod nat;
mod tcpudp;
mod tos;

pub use clusterip::{ClusterIpInfo, HashMode};
pub use comment::CommentInfo;
pub use mark::{MarkMatchInfo, MarkTargetInfo};
pub use nat::{MasqueradeInfo, NatRange, RedirectInfo};
pub use tcpudp::{TcpInfo, UdpInfo};
pub use tos::TosTargetInfo;

use crate::error::{Error, Result};
use crate::rule::Rule;
use std::fmt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Every parameter name understood by some extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Param {
    Sport,
    Dport,
    TcpFlags,
    Syn,
    TcpOption,
    Mark,
    Comment,
    SetXmark,
    SetMark,
    AndMark,
    OrMark,
    XorMark,
    SetTos,
    AndTos,
    OrTos,
    XorTos,
    New,
    Hashmode,
    Clustermac,
    TotalNodes,
    LocalNode,
    HashInit,
    ToPorts,
    Random,
    RandomFully,
}

const ALL_PARAMS: &[Param] = &[
    Param::Sport,
    Param::Dport,
    Param::TcpFlags,
    Param::Syn,
    Param::TcpOption,
    Param::Mark,
    Param::Comment,
    Param::SetXmark,
    Param::SetMark,
    Param::AndMark,
    Param::OrMark,
    Param::XorMark,
    Param::SetTos,
    Param::AndTos,
    Param::OrTos,
    Param::XorTos,
    Param::New,
    Param::Hashmode,
    Param::Clustermac,
    Param::TotalNodes,
    Param::LocalNode,
    Param::HashInit,
    Param::ToPorts,
    Param::Random,
    Param::RandomFully,
];

impl Param {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sport => "sport",
            Self::Dport => "dport",
            Self::TcpFlags => "tcp_flags",
            Self::Syn => "syn",
            Self::TcpOption => "tcp_option",
            Self::Mark => "mark",
            Self::Comment => "comment",
            Self::SetXmark => "set_xmark",
            Self::SetMark => "set_mark",
            Self::AndMark => "and_mark",
            Self::OrMark => "or_mark",
            Self::XorMark => "xor_mark",
            Self::SetTos => "set_tos",
            Self::AndTos => "and_tos",
            Self::OrTos => "or_tos",
            Self::XorTos => "xor_tos",
            Self::New => "new",
            Self::Hashmode => "hashmode",
            Self::Clustermac => "clustermac",
            Self::TotalNodes => "total_nodes",
            Self::LocalNode => "local_node",
            Self::HashInit => "hash_init",
            Self::ToPorts => "to_ports",
            Self::Random => "random",
            Self::RandomFully => "random_fully",
        }
    }

    /// Accepts `to_ports`, `to-ports` and `--to-ports`
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim_start_matches("--").replace('-', "_");
        ALL_PARAMS
            .iter()
            .copied()
            .find(|param| param.as_str() == normalized)
    }

    /// The iptables command-line option name
    pub fn option(self) -> String {
        self.as_str().replace('_', "-")
    }

    /// Whether a leading `!` in the canonical value means a negated test
    pub fn is_invertible(self) -> bool {
        matches!(
            self,
            Self::Sport | Self::Dport | Self::TcpFlags | Self::TcpOption | Self::Mark
        )
    }

    /// Flags carry no value; they are set with an empty string
    pub fn is_flag(self) -> bool {
        matches!(
            self,
            Self::Syn | Self::New | Self::Random | Self::RandomFully
        )
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed extension payload and its parameter grammar
pub(crate) trait Codec:
    Clone + PartialEq + fmt::Debug + FromBytes + IntoBytes + Immutable + KnownLayout
{
    const NAME: &'static str;
    const REVISION: u8;
    /// Declared parameters, in the order documents apply them
    const PARAMS: &'static [Param];

    fn initial() -> Self {
        Self::new_zeroed()
    }

    fn set(&mut self, param: Param, value: &str) -> Result<()>;

    /// Canonical value, or `None` when unset or write-only
    fn get(&self, param: Param) -> Option<String>;

    /// Constraints against the rule the extension is attached to
    fn check(&self, _rule: &Rule) -> Result<()> {
        Ok(())
    }

    /// Clear kernel-private fields after reading a payload back
    fn sanitize(&mut self) {}
}

/// Object-safe view over any `Codec`
trait DynCodec: fmt::Debug {
    fn name(&self) -> &'static str;
    fn revision(&self) -> u8;
    fn params(&self) -> &'static [Param];
    fn set(&mut self, param: Param, value: &str) -> Result<()>;
    fn get(&self, param: Param) -> Option<String>;
    fn check(&self, rule: &Rule) -> Result<()>;
    fn reset(&mut self);
    fn bytes(&self) -> Vec<u8>;
}

impl<C: Codec> DynCodec for C {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn revision(&self) -> u8 {
        C::REVISION
    }

    fn params(&self) -> &'static [Param] {
        C::PARAMS
    }

    fn set(&mut self, param: Param, value: &str) -> Result<()> {
        Codec::set(self, param, value)
    }

    fn get(&self, param: Param) -> Option<String> {
        Codec::get(self, param)
    }

    fn check(&self, rule: &Rule) -> Result<()> {
        Codec::check(self, rule)
    }

    fn reset(&mut self) {
        *self = C::initial();
    }

    fn bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

fn decode<C: Codec>(data: &[u8], revision: u8) -> Option<C> {
    if revision != C::REVISION {
        return None;
    }
    let (mut payload, _) = C::read_from_prefix(data).ok()?;
    payload.sanitize();
    Some(payload)
}

/// Whether an extension is a match or a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Match,
    Target,
}

#[derive(Debug, Clone, PartialEq)]
enum Payload {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    MarkMatch(MarkMatchInfo),
    Comment(CommentInfo),
    Mark(MarkTargetInfo),
    Tos(TosTargetInfo),
    ClusterIp(ClusterIpInfo),
    Redirect(RedirectInfo),
    Masquerade(MasqueradeInfo),
    Opaque {
        name: String,
        revision: u8,
        data: Vec<u8>,
    },
}

const MATCHES: &[&str] = &["tcp", "udp", "mark", "comment"];
const TARGETS: &[&str] = &["MARK", "TOS", "CLUSTERIP", "REDIRECT", "MASQUERADE"];

/// Names of the match extensions this crate can configure
pub fn available_matches() -> &'static [&'static str] {
    MATCHES
}

/// Names of the target extensions this crate can configure
pub fn available_targets() -> &'static [&'static str] {
    TARGETS
}

impl Payload {
    fn create(family: Family, name: &str) -> Option<Self> {
        let payload = match (family, name) {
            (Family::Match, TcpInfo::NAME) => Self::Tcp(TcpInfo::initial()),
            (Family::Match, UdpInfo::NAME) => Self::Udp(UdpInfo::initial()),
            (Family::Match, MarkMatchInfo::NAME) => Self::MarkMatch(MarkMatchInfo::initial()),
            (Family::Match, CommentInfo::NAME) => Self::Comment(CommentInfo::initial()),
            (Family::Target, MarkTargetInfo::NAME) => Self::Mark(MarkTargetInfo::initial()),
            (Family::Target, TosTargetInfo::NAME) => Self::Tos(TosTargetInfo::initial()),
            (Family::Target, ClusterIpInfo::NAME) => Self::ClusterIp(ClusterIpInfo::initial()),
            (Family::Target, RedirectInfo::NAME) => Self::Redirect(RedirectInfo::initial()),
            (Family::Target, MasqueradeInfo::NAME) => {
                Self::Masquerade(MasqueradeInfo::initial())
            }
            _ => return None,
        };
        Some(payload)
    }

    fn decode(family: Family, name: &str, revision: u8, data: &[u8]) -> Option<Self> {
        let payload = match (family, name) {
            (Family::Match, TcpInfo::NAME) => Self::Tcp(decode(data, revision)?),
            (Family::Match, UdpInfo::NAME) => Self::Udp(decode(data, revision)?),
            (Family::Match, MarkMatchInfo::NAME) => Self::MarkMatch(decode(data, revision)?),
            (Family::Match, CommentInfo::NAME) => Self::Comment(decode(data, revision)?),
            (Family::Target, MarkTargetInfo::NAME) => Self::Mark(decode(data, revision)?),
            (Family::Target, TosTargetInfo::NAME) => Self::Tos(decode(data, revision)?),
            (Family::Target, ClusterIpInfo::NAME) => Self::ClusterIp(decode(data, revision)?),
            (Family::Target, RedirectInfo::NAME) => Self::Redirect(decode(data, revision)?),
            (Family::Target, MasqueradeInfo::NAME) => Self::Masquerade(decode(data, revision)?),
            _ => return None,
        };
        Some(payload)
    }

    fn codec(&self) -> Option<&dyn DynCodec> {
        let codec: &dyn DynCodec = match self {
            Self::Tcp(info) => info,
            Self::Udp(info) => info,
            Self::MarkMatch(info) => info,
            Self::Comment(info) => info,
            Self::Mark(info) => info,
            Self::Tos(info) => info,
            Self::ClusterIp(info) => info,
            Self::Redirect(info) => info,
            Self::Masquerade(info) => info,
            Self::Opaque { .. } => return None,
        };
        Some(codec)
    }

    fn codec_mut(&mut self) -> Option<&mut dyn DynCodec> {
        let codec: &mut dyn DynCodec = match self {
            Self::Tcp(info) => info,
            Self::Udp(info) => info,
            Self::MarkMatch(info) => info,
            Self::Comment(info) => info,
            Self::Mark(info) => info,
            Self::Tos(info) => info,
            Self::ClusterIp(info) => info,
            Self::Redirect(info) => info,
            Self::Masquerade(info) => info,
            Self::Opaque { .. } => return None,
        };
        Some(codec)
    }
}

/// A named, parameterised match or target extension
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    family: Family,
    payload: Payload,
}

impl Extension {
    /// Build a fresh extension, failing when no extension has this name
    pub fn new(family: Family, name: &str) -> Result<Self> {
        let payload = Payload::create(family, name).ok_or_else(|| Error::ExtensionNotFound {
            name: name.to_string(),
        })?;
        Ok(Self { family, payload })
    }

    /// Rebuild an extension from a kernel payload. Unknown names or
    /// revisions are kept verbatim.
    pub fn from_kernel(family: Family, name: &str, revision: u8, data: &[u8]) -> Self {
        let payload = Payload::decode(family, name, revision, data).unwrap_or_else(|| {
            tracing::warn!(
                name,
                revision,
                size = data.len(),
                "keeping unsupported extension as opaque payload"
            );
            Payload::Opaque {
                name: name.to_string(),
                revision,
                data: data.to_vec(),
            }
        });
        Self { family, payload }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn name(&self) -> &str {
        match &self.payload {
            Payload::Opaque { name, .. } => name.as_str(),
            other => other.codec().map(|codec| codec.name()).unwrap_or_default(),
        }
    }

    pub fn revision(&self) -> u8 {
        match &self.payload {
            Payload::Opaque { revision, .. } => *revision,
            other => other.codec().map(|codec| codec.revision()).unwrap_or_default(),
        }
    }

    /// Whether the payload was carried through without being understood
    pub fn is_opaque(&self) -> bool {
        matches!(self.payload, Payload::Opaque { .. })
    }

    /// Parameters this extension accepts, in application order
    pub fn params(&self) -> &'static [Param] {
        self.payload
            .codec()
            .map(|codec| codec.params())
            .unwrap_or_default()
    }

    fn resolve(&self, param: &str) -> Result<Param> {
        Param::parse(param)
            .filter(|p| self.params().contains(p))
            .ok_or_else(|| Error::UnknownParameter {
                extension: self.name().to_string(),
                param: param.to_string(),
            })
    }

    /// Assign a parameter by name, validating the value immediately
    pub fn set(&mut self, param: &str, value: &str) -> Result<()> {
        let param = self.resolve(param)?;
        self.set_param(param, value)
    }

    pub fn set_param(&mut self, param: Param, value: &str) -> Result<()> {
        let name = self.name().to_string();
        let codec = self
            .payload
            .codec_mut()
            .filter(|codec| codec.params().contains(&param))
            .ok_or(Error::UnknownParameter {
                extension: name,
                param: param.to_string(),
            })?;
        codec.set(param, value)
    }

    /// Read a parameter by name. `Ok(None)` means unset or write-only.
    pub fn get(&self, param: &str) -> Result<Option<String>> {
        let param = self.resolve(param)?;
        Ok(self.get_param(param))
    }

    pub fn get_param(&self, param: Param) -> Option<String> {
        self.payload.codec().and_then(|codec| codec.get(param))
    }

    /// Every readable parameter that currently has a value
    pub fn values(&self) -> Vec<(Param, String)> {
        self.params()
            .iter()
            .filter_map(|param| self.get_param(*param).map(|value| (*param, value)))
            .collect()
    }

    /// Back to the state of a freshly constructed extension
    pub fn reset(&mut self) {
        if let Some(codec) = self.payload.codec_mut() {
            codec.reset();
        }
    }

    /// The payload handed to the kernel, without alignment padding
    pub fn data(&self) -> Vec<u8> {
        match &self.payload {
            Payload::Opaque { data, .. } => data.clone(),
            other => other.codec().map(|codec| codec.bytes()).unwrap_or_default(),
        }
    }

    pub(crate) fn check(&self, rule: &Rule) -> Result<()> {
        match self.payload.codec() {
            Some(codec) => codec.check(rule),
            None => Ok(()),
        }
    }

    /// iptables-save style option list (` --to-ports 1234`)
    pub fn save_args(&self) -> String {
        let mut out = String::new();
        for (param, value) in self.values() {
            let (invert, value) = match value.strip_prefix('!') {
                Some(rest) if param.is_invertible() => (true, rest),
                _ => (false, value.as_str()),
            };
            if invert {
                out.push_str(" !");
            }
            out.push_str(" --");
            out.push_str(&param.option());
            if value.is_empty() {
                continue;
            }
            out.push(' ');
            // mask and comparison are separate arguments
            if param == Param::TcpFlags {
                out.push_str(value);
            } else {
                out.push_str(&quote(value));
            }
        }
        out
    }
}

/// Quote a value the way iptables-save does: only when it contains
/// whitespace or a quote, escaping `"` and `\`
fn quote(value: &str) -> String {
    if !value.contains(|c: char| c.is_whitespace() || c == '"') {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// A match extension attached to a rule
#[derive(Debug, Clone, PartialEq)]
pub struct Match(Extension);

impl Match {
    pub fn new(name: &str) -> Result<Self> {
        Extension::new(Family::Match, name).map(Self)
    }

    pub fn from_kernel(name: &str, revision: u8, data: &[u8]) -> Self {
        Self(Extension::from_kernel(Family::Match, name, revision, data))
    }

    /// Builder-style parameter assignment
    pub fn with(mut self, param: &str, value: &str) -> Result<Self> {
        self.0.set(param, value)?;
        Ok(self)
    }
}

impl std::ops::Deref for Match {
    type Target = Extension;

    fn deref(&self) -> &Extension {
        &self.0
    }
}

impl std::ops::DerefMut for Match {
    fn deref_mut(&mut self) -> &mut Extension {
        &mut self.0
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-m {}{}", self.name(), self.save_args())
    }
}

/// Built-in verdicts carried by the standard target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
    Queue,
    Return,
}

impl Verdict {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ACCEPT" => Some(Self::Accept),
            "DROP" => Some(Self::Drop),
            "QUEUE" => Some(Self::Queue),
            "RETURN" => Some(Self::Return),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Queue => "QUEUE",
            Self::Return => "RETURN",
        }
    }

    /// The negative verdict the standard target stores (`-NF_x - 1`)
    pub fn code(self) -> i32 {
        match self {
            Self::Drop => -1,
            Self::Accept => -2,
            Self::Queue => -4,
            Self::Return => -5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Drop),
            -2 => Some(Self::Accept),
            -4 => Some(Self::Queue),
            -5 => Some(Self::Return),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action of a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Verdict(Verdict),
    /// Continue in a user chain, returning afterwards
    Jump(String),
    /// Continue in a user chain without returning
    Goto(String),
    Extension(Extension),
}

impl Target {
    /// Resolve a verdict name or target extension name
    pub fn new(name: &str) -> Result<Self> {
        if let Some(verdict) = Verdict::parse(name) {
            return Ok(Self::Verdict(verdict));
        }
        Extension::new(Family::Target, name).map(Self::Extension)
    }

    pub fn jump(chain: &str) -> Self {
        Self::Jump(chain.to_string())
    }

    pub fn goto(chain: &str) -> Self {
        Self::Goto(chain.to_string())
    }

    pub fn from_kernel(name: &str, revision: u8, data: &[u8]) -> Self {
        Self::Extension(Extension::from_kernel(Family::Target, name, revision, data))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Verdict(verdict) => verdict.as_str(),
            Self::Jump(chain) | Self::Goto(chain) => chain,
            Self::Extension(ext) => ext.name(),
        }
    }

    pub fn extension(&self) -> Option<&Extension> {
        match self {
            Self::Extension(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn extension_mut(&mut self) -> Option<&mut Extension> {
        match self {
            Self::Extension(ext) => Some(ext),
            _ => None,
        }
    }

    /// The user chain this target continues in, if any
    pub fn chain(&self) -> Option<&str> {
        match self {
            Self::Jump(chain) | Self::Goto(chain) => Some(chain),
            _ => None,
        }
    }

    /// Point a jump or goto at a renamed chain
    pub(crate) fn rename_chain(&mut self, old: &str, new: &str) {
        if let Self::Jump(chain) | Self::Goto(chain) = self {
            if chain == old {
                *chain = new.to_string();
            }
        }
    }

    fn no_params(&self, param: &str) -> Error {
        Error::UnknownParameter {
            extension: self.name().to_string(),
            param: param.to_string(),
        }
    }

    pub fn set(&mut self, param: &str, value: &str) -> Result<()> {
        match self {
            Self::Extension(ext) => ext.set(param, value),
            other => Err(other.no_params(param)),
        }
    }

    pub fn get(&self, param: &str) -> Result<Option<String>> {
        match self {
            Self::Extension(ext) => ext.get(param),
            other => Err(other.no_params(param)),
        }
    }

    /// Builder-style parameter assignment
    pub fn with(mut self, param: &str, value: &str) -> Result<Self> {
        self.set(param, value)?;
        Ok(self)
    }

    pub fn reset(&mut self) {
        if let Self::Extension(ext) = self {
            ext.reset();
        }
    }

    pub(crate) fn check(&self, rule: &Rule) -> Result<()> {
        match self {
            Self::Extension(ext) => ext.check(rule),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verdict(verdict) => write!(f, "-j {}", verdict),
            Self::Jump(chain) => write!(f, "-j {}", chain),
            Self::Goto(chain) => write!(f, "-g {}", chain),
            Self::Extension(ext) => write!(f, "-j {}{}", ext.name(), ext.save_args()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_names_accept_dashes() {
        assert_eq!(Param::parse("to_ports"), Some(Param::ToPorts));
        assert_eq!(Param::parse("to-ports"), Some(Param::ToPorts));
        assert_eq!(Param::parse("--set-xmark"), Some(Param::SetXmark));
        assert_eq!(Param::parse("bogus"), None);
        assert_eq!(Param::LocalNode.option(), "local-node");
    }

    #[test]
    fn unknown_extension_names_fail() {
        assert!(matches!(
            Match::new("nonexistent"),
            Err(Error::ExtensionNotFound { .. })
        ));
        assert!(matches!(
            Target::new("NOSUCHTARGET"),
            Err(Error::ExtensionNotFound { .. })
        ));
        // targets and matches live in separate namespaces
        assert!(Target::new("tcp").is_err());
        assert!(Match::new("MARK").is_err());
    }

    #[test]
    fn verdict_names_resolve_to_standard_targets() {
        let target = Target::new("DROP").unwrap();
        assert_eq!(target, Target::Verdict(Verdict::Drop));
        assert_eq!(target.name(), "DROP");
        assert!(target.get("anything").is_err());
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut target = Target::new("REDIRECT").unwrap();
        let err = target.set("hashmode", "sourceip").unwrap_err();
        assert!(matches!(err, Error::UnknownParameter { .. }));
        assert!(target.get("set_tos").is_err());
    }

    #[test]
    fn mark_targets_compare_by_payload() {
        let mut t1 = Target::new("MARK").unwrap();
        t1.set("set_mark", "0x123").unwrap();
        let mut t2 = Target::new("MARK").unwrap();
        t2.set("set_mark", "0x123").unwrap();
        assert_eq!(t1, t2);

        t2.reset();
        t2.set("set_mark", "0x124").unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn reset_matches_fresh_extension() {
        for name in available_targets() {
            let fresh = Target::new(name).unwrap();
            let mut used = Target::new(name).unwrap();
            let ext = used.extension_mut().unwrap();
            for param in ext.params() {
                let _ = ext.set_param(*param, "");
            }
            used.reset();
            assert_eq!(used, fresh, "{} did not reset", name);
        }
    }

    #[test]
    fn kernel_payload_round_trips_through_registry() {
        let mut target = Target::new("TOS").unwrap();
        target.set("set_tos", "0x12/0xff").unwrap();
        let ext = target.extension().unwrap();

        let decoded = Target::from_kernel(ext.name(), ext.revision(), &ext.data());
        assert_eq!(decoded, target);
    }

    #[test]
    fn unknown_kernel_payloads_stay_opaque() {
        let target = Target::from_kernel("LOG", 0, &[1, 2, 3, 4]);
        let ext = target.extension().unwrap();
        assert!(ext.is_opaque());
        assert_eq!(ext.name(), "LOG");
        assert_eq!(ext.data(), vec![1, 2, 3, 4]);
        assert!(ext.params().is_empty());
    }

    #[test]
    fn revision_mismatch_is_opaque() {
        let target = Target::from_kernel("MARK", 0, &[0; 8]);
        assert!(target.extension().unwrap().is_opaque());
    }

    #[test]
    fn save_args_render_like_iptables_save() {
        let target = Target::new("REDIRECT")
            .unwrap()
            .with("to_ports", "1234-2345")
            .unwrap()
            .with("random", "")
            .unwrap();
        assert_eq!(
            target.to_string(),
            "-j REDIRECT --to-ports 1234-2345 --random"
        );

        let m = Match::new("tcp").unwrap().with("dport", "!22").unwrap();
        assert_eq!(m.to_string(), "-m tcp ! --dport 22");

        let m = Match::new("tcp")
            .unwrap()
            .with("tcp_flags", "! SYN,ACK SYN")
            .unwrap();
        assert_eq!(m.to_string(), "-m tcp ! --tcp-flags SYN,ACK SYN");
    }

    #[test]
    fn leading_bang_in_comment_is_literal() {
        let m = Match::new("comment")
            .unwrap()
            .with("comment", "!important")
            .unwrap();
        assert_eq!(m.to_string(), "-m comment --comment !important");

        let m = Match::new("comment").unwrap().with("comment", "!x y").unwrap();
        assert_eq!(m.to_string(), "-m comment --comment \"!x y\"");
    }

    #[test]
    fn quoted_values_escape_like_iptables_save() {
        let m = Match::new("comment")
            .unwrap()
            .with("comment", "say \"hi\"\tnow\\")
            .unwrap();
        assert_eq!(
            m.to_string(),
            "-m comment --comment \"say \\\"hi\\\"\tnow\\\\\""
        );
        assert_eq!(quote("plain"), "plain");
    }
}
