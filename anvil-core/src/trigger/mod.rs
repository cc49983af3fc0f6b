//! Stage trigger language
//!
//! A trigger expression is one or more condition groups joined by `and` or
//! `or`. Each group starts with a keyword and lists values joined by `||` or
//! `&&`:
//!
//! ```text
//! branch: master||develop and filepath: src/test && src/main
//! branch: master or text: force_build
//! text: schema_changed and filepath: deploy/schema||test/schema
//! ```
//!
//! Mixing `||` with `&&` inside one group, or `and` with `or` between groups,
//! is rejected. There is no grouping syntax to disambiguate them.

mod expr;
mod lexer;
mod parser;

pub use expr::{Condition, ConditionKind, Directive, Logical};
pub use parser::parse;

use thiserror::Error;

/// Errors produced while validating a trigger expression
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger expression is empty")]
    Empty,

    #[error("directive must start with one of: 'branch:', 'text:', 'filepath:'")]
    MustStartWithKeyword,

    #[error("|| and && cannot be combined in one condition group")]
    MixedSymbols,

    #[error("'and' and 'or' cannot be combined in one directive")]
    MixedJoins,

    #[error("condition groups must be joined by 'and' or 'or'")]
    MissingJoin,

    #[error("directive cannot end with '{0}'")]
    DanglingJoin(Logical),

    #[error("'{0}:' condition has no values")]
    EmptyCondition(ConditionKind),

    #[error("invalid branch pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
