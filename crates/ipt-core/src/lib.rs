pub mod chain;
pub mod error;
pub mod ext;
pub mod parse;
pub mod rule;
pub mod ruleset;
pub mod selector;
pub mod table;

pub use chain::*;
pub use error::{Error, Result};
pub use ext::{Extension, Family, Match, Param, Target, Verdict};
pub use rule::*;
pub use ruleset::*;
pub use selector::*;
pub use table::*;

// iptables rule-table model: extensions, rules, chains and tables
