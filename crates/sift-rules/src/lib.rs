mod book;
mod compile;
mod engine;
mod error;

pub use book::{RuleBook, RuleDocument};
pub use compile::{compile_rules, validate_rule, CompiledRule, MessageView};
pub use engine::{AutomationReport, DryRunMatch, DryRunReport, RuleEngine};
pub use error::RuleError;
