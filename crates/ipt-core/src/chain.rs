use crate::error::{Error, Result};
use crate::ext::Verdict;
use crate::rule::{Counters, Rule};

/// Longest chain name the kernel stores (XT_EXTENSION_MAXNAMELEN - 1)
pub const CHAIN_NAME_MAX: usize = 28;

/// An ordered list of rules. Built-in chains carry a policy; user chains
/// do not.
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    policy: Option<Verdict>,
    rules: Vec<Rule>,
    /// Counters of the policy entry (built-in chains only)
    pub counters: Counters,
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.policy == other.policy && self.rules == other.rules
    }
}

impl Chain {
    /// A built-in chain with the given policy and no rules
    pub fn builtin(name: &str, policy: Verdict) -> Self {
        Self {
            name: name.to_string(),
            policy: Some(policy),
            rules: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub fn user(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: None,
            rules: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn is_builtin(&self) -> bool {
        self.policy.is_some()
    }

    pub fn policy(&self) -> Option<Verdict> {
        self.policy
    }

    /// Only ACCEPT and DROP are valid policies, and only built-in chains
    /// have one
    pub fn set_policy(&mut self, policy: Verdict) -> Result<()> {
        if !self.is_builtin() || !matches!(policy, Verdict::Accept | Verdict::Drop) {
            return Err(Error::InvalidPolicy {
                chain: self.name.clone(),
                policy: policy.to_string(),
            });
        }
        self.policy = Some(policy);
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Insert before `position`; `position == len()` appends
    pub fn insert_rule(&mut self, rule: Rule, position: usize) -> Result<()> {
        if position > self.rules.len() {
            return Err(self.out_of_range(position));
        }
        self.rules.insert(position, rule);
        Ok(())
    }

    pub fn append_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Remove the first rule equal to `rule`
    pub fn delete_rule(&mut self, rule: &Rule) -> Result<Rule> {
        let index = self
            .rules
            .iter()
            .position(|candidate| candidate == rule)
            .ok_or_else(|| Error::RuleNotFound {
                chain: self.name.clone(),
            })?;
        Ok(self.rules.remove(index))
    }

    pub fn delete_rule_at(&mut self, index: usize) -> Result<Rule> {
        if index >= self.rules.len() {
            return Err(self.out_of_range(index));
        }
        Ok(self.rules.remove(index))
    }

    /// Swap the rule at `index`, returning the old one
    pub fn replace_rule(&mut self, index: usize, rule: Rule) -> Result<Rule> {
        match self.rules.get_mut(index) {
            Some(slot) => Ok(std::mem::replace(slot, rule)),
            None => Err(self.out_of_range(index)),
        }
    }

    /// Position of the first rule equal to `rule`
    pub fn find_rule(&self, rule: &Rule) -> Option<usize> {
        self.rules.iter().position(|candidate| candidate == rule)
    }

    pub fn flush(&mut self) {
        self.rules.clear();
    }

    /// Clear the packet and byte counters of every rule and the policy
    pub fn zero_counters(&mut self) {
        self.counters = Counters::default();
        for rule in &mut self.rules {
            rule.counters = Counters::default();
        }
    }

    /// Whether any rule jumps or goes to `chain`
    pub fn references(&self, chain: &str) -> bool {
        self.rules.iter().any(|rule| {
            rule.target
                .as_ref()
                .and_then(|target| target.chain())
                .is_some_and(|target| target == chain)
        })
    }

    pub(crate) fn rules_mut(&mut self) -> &mut Vec<Rule> {
        &mut self.rules
    }

    fn out_of_range(&self, index: usize) -> Error {
        Error::RuleIndexOutOfRange {
            chain: self.name.clone(),
            index,
            len: self.rules.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::Target;

    fn rule_to(port: &str) -> Rule {
        let mut rule = Rule::new();
        rule.set_protocol("tcp").unwrap();
        rule.create_match("tcp").unwrap().set("dport", port).unwrap();
        rule.set_target(Target::Verdict(Verdict::Accept));
        rule
    }

    #[test]
    fn insert_positions() {
        let mut chain = Chain::user("web");
        chain.insert_rule(rule_to("80"), 0).unwrap();
        chain.insert_rule(rule_to("443"), 0).unwrap();
        chain.insert_rule(rule_to("8080"), 2).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.rules()[0], rule_to("443"));
        assert_eq!(chain.rules()[2], rule_to("8080"));

        let err = chain.insert_rule(rule_to("22"), 4).unwrap_err();
        assert!(matches!(err, Error::RuleIndexOutOfRange { index: 4, len: 3, .. }));
    }

    #[test]
    fn delete_by_value_removes_first_match() {
        let mut chain = Chain::user("web");
        chain.append_rule(rule_to("80"));
        chain.append_rule(rule_to("443"));
        chain.append_rule(rule_to("80"));

        chain.delete_rule(&rule_to("80")).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.rules()[0], rule_to("443"));

        assert!(matches!(
            chain.delete_rule(&rule_to("22")),
            Err(Error::RuleNotFound { .. })
        ));
    }

    #[test]
    fn replace_and_delete_by_index() {
        let mut chain = Chain::user("web");
        chain.append_rule(rule_to("80"));
        let old = chain.replace_rule(0, rule_to("81")).unwrap();
        assert_eq!(old, rule_to("80"));
        assert!(chain.replace_rule(1, rule_to("82")).is_err());
        assert_eq!(chain.delete_rule_at(0).unwrap(), rule_to("81"));
        assert!(chain.delete_rule_at(0).is_err());
    }

    #[test]
    fn policies_only_on_builtin_chains() {
        let mut input = Chain::builtin("INPUT", Verdict::Accept);
        input.set_policy(Verdict::Drop).unwrap();
        assert_eq!(input.policy(), Some(Verdict::Drop));
        assert!(input.set_policy(Verdict::Return).is_err());

        let mut user = Chain::user("web");
        assert!(user.set_policy(Verdict::Drop).is_err());
    }

    #[test]
    fn references_follow_jumps() {
        let mut chain = Chain::builtin("INPUT", Verdict::Accept);
        let mut rule = Rule::new();
        rule.set_target(Target::jump("web"));
        chain.append_rule(rule);
        assert!(chain.references("web"));
        assert!(!chain.references("other"));
    }
}
