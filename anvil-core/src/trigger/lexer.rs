//! Tokenizer for trigger expressions

use super::expr::{ConditionKind, Logical};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// `branch:`, `text:` or `filepath:`
    Keyword(ConditionKind),
    /// `and` / `or` between condition groups
    Join(Logical),
    /// `&&` / `||` between values of one group
    Symbol(Logical),
    Word(String),
}

/// Splits an expression into tokens
///
/// Words are whitespace separated, but `&&` and `||` may be glued to the
/// values around them (`master||develop`).
pub(crate) fn tokenize(src: &str) -> Vec<Token> {
    let mut tokens = Vec::new();

    for piece in src.split_whitespace() {
        if let Some(kind) = keyword(piece) {
            tokens.push(Token::Keyword(kind));
            continue;
        }

        match piece.to_ascii_lowercase().as_str() {
            "and" => tokens.push(Token::Join(Logical::And)),
            "or" => tokens.push(Token::Join(Logical::Or)),
            _ => split_symbols(piece, &mut tokens),
        }
    }

    tokens
}

fn keyword(piece: &str) -> Option<ConditionKind> {
    match piece {
        "branch:" => Some(ConditionKind::Branch),
        "text:" => Some(ConditionKind::Text),
        "filepath:" => Some(ConditionKind::Filepath),
        _ => None,
    }
}

fn split_symbols(piece: &str, tokens: &mut Vec<Token>) {
    let mut rest = piece;

    loop {
        let next = [("&&", Logical::And), ("||", Logical::Or)]
            .into_iter()
            .filter_map(|(sym, logical)| rest.find(sym).map(|at| (at, logical)))
            .min_by_key(|(at, _)| *at);

        match next {
            Some((at, logical)) => {
                if at > 0 {
                    tokens.push(Token::Word(rest[..at].to_string()));
                }
                tokens.push(Token::Symbol(logical));
                rest = &rest[at + 2..];
            }
            None => {
                if !rest.is_empty() {
                    tokens.push(Token::Word(rest.to_string()));
                }
                return;
            }
        }
    }
}
