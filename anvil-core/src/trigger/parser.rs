//! Parser from tokens to a [`Directive`]

use regex::Regex;

use super::TriggerError;
use super::expr::{Condition, ConditionKind, Directive, Logical};
use super::lexer::{Token, tokenize};

/// Condition group being accumulated
struct Group {
    kind: ConditionKind,
    values: Vec<String>,
    logical: Option<Logical>,
}

impl Group {
    fn new(kind: ConditionKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
            logical: None,
        }
    }

    fn set_logical(&mut self, logical: Logical) -> Result<(), TriggerError> {
        match self.logical {
            None => {
                self.logical = Some(logical);
                Ok(())
            }
            Some(existing) if existing == logical => Ok(()),
            Some(_) => Err(TriggerError::MixedSymbols),
        }
    }

    fn finish(self) -> Result<Condition, TriggerError> {
        if self.values.is_empty() {
            return Err(TriggerError::EmptyCondition(self.kind));
        }

        // A lone value carries no logical, whatever symbol trailed it
        let logical = if self.values.len() > 1 {
            self.logical
        } else {
            None
        };

        Ok(match self.kind {
            ConditionKind::Branch => {
                let patterns = self
                    .values
                    .into_iter()
                    .map(|pattern| {
                        Regex::new(&format!("^(?:{})$", pattern))
                            .map_err(|source| TriggerError::InvalidPattern { pattern, source })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Condition::Branch { patterns, logical }
            }
            ConditionKind::Text => Condition::Text {
                values: self.values,
                logical,
            },
            ConditionKind::Filepath => Condition::Filepath {
                values: self.values,
                logical,
            },
        })
    }
}

/// Parses a trigger expression
///
/// # Errors
/// Returns a [`TriggerError`] describing the first validation failure.
pub fn parse(src: &str) -> Result<Directive, TriggerError> {
    let tokens = tokenize(src);
    if tokens.is_empty() {
        return Err(TriggerError::Empty);
    }

    let mut conditions = Vec::new();
    let mut joined_by: Option<Logical> = None;
    let mut active: Option<Group> = None;
    let mut pending_join: Option<Logical> = None;

    for token in tokens {
        match token {
            Token::Keyword(kind) => {
                if let Some(group) = active.take() {
                    if pending_join.is_none() {
                        return Err(TriggerError::MissingJoin);
                    }
                    conditions.push(group.finish()?);
                }
                pending_join = None;
                active = Some(Group::new(kind));
            }
            Token::Join(logical) => {
                if active.is_none() {
                    return Err(TriggerError::MustStartWithKeyword);
                }
                match joined_by {
                    None => joined_by = Some(logical),
                    Some(existing) if existing == logical => {}
                    Some(_) => return Err(TriggerError::MixedJoins),
                }
                pending_join = Some(logical);
            }
            Token::Symbol(logical) => {
                let group = active.as_mut().ok_or(TriggerError::MustStartWithKeyword)?;
                if pending_join.is_some() {
                    return Err(TriggerError::MustStartWithKeyword);
                }
                group.set_logical(logical)?;
            }
            Token::Word(word) => {
                let group = active.as_mut().ok_or(TriggerError::MustStartWithKeyword)?;
                if pending_join.is_some() {
                    return Err(TriggerError::MustStartWithKeyword);
                }
                group.values.push(word);
            }
        }
    }

    if let Some(logical) = pending_join {
        return Err(TriggerError::DanglingJoin(logical));
    }
    if let Some(group) = active {
        conditions.push(group.finish()?);
    }

    Ok(Directive {
        conditions,
        logical: joined_by,
    })
}
