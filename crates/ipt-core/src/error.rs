use thiserror::Error;

/// Errors raised while building, validating or committing rule tables
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A parameter value failed the extension's grammar
    #[error("{extension}: invalid value {value:?} for {param}: {reason}")]
    InvalidValue {
        extension: String,
        param: String,
        value: String,
        reason: String,
    },

    /// The extension has no parameter with this name
    #[error("{extension}: unknown parameter {param:?}")]
    UnknownParameter { extension: String, param: String },

    /// The parameter can only be set once another one is present
    #[error("{extension}: {param} can only be set together with {requires}")]
    MissingPrerequisite {
        extension: String,
        param: String,
        requires: String,
    },

    /// No match or target extension with this name is available
    #[error("extension {name:?} not found")]
    ExtensionNotFound { name: String },

    /// A core rule selector (address, interface, protocol) is malformed
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidSelector {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// An extension cannot be used with the rule it is attached to
    #[error("{extension}: {reason}")]
    RuleConstraint { extension: String, reason: String },

    #[error("no matching rule in chain {chain}")]
    RuleNotFound { chain: String },

    #[error("rule index {index} out of range for chain {chain} ({len} rules)")]
    RuleIndexOutOfRange {
        chain: String,
        index: usize,
        len: usize,
    },

    #[error("unknown table {name:?}")]
    UnknownTable { name: String },

    #[error("chain {chain} already exists in table {table}")]
    ChainExists { table: String, chain: String },

    #[error("chain {chain} does not exist in table {table}")]
    ChainNotFound { table: String, chain: String },

    #[error("invalid chain name {name:?}: {reason}")]
    InvalidChainName { name: String, reason: String },

    /// Built-in chains cannot be created, deleted or renamed
    #[error("{chain} is a built-in chain")]
    BuiltinChain { chain: String },

    #[error("chain {chain} is not empty")]
    ChainNotEmpty { chain: String },

    #[error("chain {chain} is referenced by a rule in {referenced_by}")]
    ChainInUse {
        chain: String,
        referenced_by: String,
    },

    /// Following jumps from this chain leads back to it
    #[error("jump loop through chain {chain}")]
    ChainLoop { chain: String },

    /// The encoded rule does not fit the kernel's 16-bit entry offsets
    #[error("rule in chain {chain} encodes to {size} bytes, more than 65535")]
    RuleTooLarge { chain: String, size: usize },

    #[error("invalid policy {policy:?} for chain {chain}")]
    InvalidPolicy { chain: String, policy: String },

    /// Reading a table from the kernel failed
    #[error("failed to read table {table}: {reason}")]
    Kernel { table: String, reason: String },

    /// The kernel rejected or did not complete the atomic replace
    #[error("commit of table {table} failed: {reason}")]
    CommitFailed { table: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invalid(
        extension: &str,
        param: &str,
        value: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            extension: extension.to_string(),
            param: param.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn selector(field: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn constraint(extension: &str, reason: impl Into<String>) -> Self {
        Self::RuleConstraint {
            extension: extension.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error was raised while validating user input, before any
    /// kernel interaction
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidValue { .. }
                | Self::UnknownParameter { .. }
                | Self::MissingPrerequisite { .. }
                | Self::InvalidSelector { .. }
                | Self::RuleConstraint { .. }
                | Self::InvalidChainName { .. }
                | Self::ChainLoop { .. }
                | Self::InvalidPolicy { .. }
                | Self::RuleTooLarge { .. }
        )
    }
}
