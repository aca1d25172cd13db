use crate::error::Result;
use crate::ext::{Match, Target};
use crate::selector::{Address, Fragment, Interface, Protocol};
use std::fmt;

/// Packet and byte counters maintained by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

/// A single rule: core selectors, match extensions and an optional target.
///
/// Equality covers every selector, the match list (in order) and the target.
/// Counters are ignored so a rule read back from the kernel compares equal to
/// the rule that was inserted.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub src: Address,
    pub dst: Address,
    pub in_interface: Interface,
    pub out_interface: Interface,
    pub protocol: Protocol,
    pub fragment: Fragment,
    pub matches: Vec<Match>,
    /// `None` falls through to the next rule
    pub target: Option<Target>,
    pub counters: Counters,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.src == other.src
            && self.dst == other.dst
            && self.in_interface == other.in_interface
            && self.out_interface == other.out_interface
            && self.protocol == other.protocol
            && self.fragment == other.fragment
            && self.matches == other.matches
            && self.target == other.target
    }
}

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_src(&mut self, value: &str) -> Result<()> {
        self.src = Address::parse("src", value)?;
        Ok(())
    }

    pub fn set_dst(&mut self, value: &str) -> Result<()> {
        self.dst = Address::parse("dst", value)?;
        Ok(())
    }

    pub fn set_in_interface(&mut self, value: &str) -> Result<()> {
        self.in_interface = Interface::parse("in_interface", value)?;
        Ok(())
    }

    pub fn set_out_interface(&mut self, value: &str) -> Result<()> {
        self.out_interface = Interface::parse("out_interface", value)?;
        Ok(())
    }

    pub fn set_protocol(&mut self, value: &str) -> Result<()> {
        self.protocol = Protocol::parse(value)?;
        Ok(())
    }

    pub fn set_fragment(&mut self, fragment: Fragment) {
        self.fragment = fragment;
    }

    pub fn add_match(&mut self, m: Match) {
        self.matches.push(m);
    }

    /// Build a match by name, append it and hand it back for configuration
    pub fn create_match(&mut self, name: &str) -> Result<&mut Match> {
        let m = Match::new(name)?;
        self.matches.push(m);
        let last = self.matches.len() - 1;
        Ok(&mut self.matches[last])
    }

    /// Remove the first match equal to `m`
    pub fn remove_match(&mut self, m: &Match) -> bool {
        match self.matches.iter().position(|candidate| candidate == m) {
            Some(index) => {
                self.matches.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    /// Resolve a target by name, install it and hand it back
    pub fn create_target(&mut self, name: &str) -> Result<&mut Target> {
        let target = Target::new(name)?;
        Ok(self.target.insert(target))
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn target_mut(&mut self) -> Option<&mut Target> {
        self.target.as_mut()
    }

    /// Run every extension's constraints against this rule's selectors
    pub fn validate(&self) -> Result<()> {
        for m in &self.matches {
            m.check(self)?;
        }
        if let Some(target) = &self.target {
            target.check(self)?;
        }
        Ok(())
    }
}

fn selector(invert: bool, flag: &str, value: &str) -> String {
    if invert {
        format!("! {} {}", flag, value)
    } else {
        format!("{} {}", flag, value)
    }
}

/// iptables-save syntax, without the leading `-A CHAIN`
impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.src.is_any() {
            parts.push(selector(self.src.invert, "-s", &self.src.to_save()));
        }
        if !self.dst.is_any() {
            parts.push(selector(self.dst.invert, "-d", &self.dst.to_save()));
        }
        if !self.in_interface.is_any() {
            let iface = &self.in_interface;
            parts.push(selector(iface.invert, "-i", &iface.name));
        }
        if !self.out_interface.is_any() {
            let iface = &self.out_interface;
            parts.push(selector(iface.invert, "-o", &iface.name));
        }
        if !self.protocol.is_any() {
            parts.push(selector(self.protocol.invert, "-p", &self.protocol.name()));
        }
        match self.fragment {
            Fragment::Any => {}
            Fragment::Only => parts.push("-f".to_string()),
            Fragment::Not => parts.push("! -f".to_string()),
        }
        parts.extend(self.matches.iter().map(Match::to_string));
        if let Some(target) = &self.target {
            parts.push(target.to_string());
        }
        f.write_str(&parts.join(" "))
    }
}
