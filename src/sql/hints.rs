//! Optimizer hint extraction.
//!
//! The parser drops comments, so hints are read from the token stream: a
//! `/*+ ... */` comment directly after a `SELECT` keyword belongs to that
//! SELECT. Hints are returned by SELECT ordinal in textual order.

use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use super::ast::JoinOrderHint;
use super::error::{ParseError, ParseResult};

const JOIN_ORDER: &str = "JOIN_ORDER";

/// One entry per SELECT keyword in `sql`, holding its join order hint if any.
pub fn extract_hints(sql: &str) -> ParseResult<Vec<Option<JoinOrderHint>>> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize()?;

    let mut hints = Vec::new();
    let mut after_select = false;
    for token in &tokens {
        match token {
            Token::Word(w) if w.keyword == Keyword::SELECT => {
                hints.push(None);
                after_select = true;
            }
            Token::Whitespace(Whitespace::MultiLineComment(text)) if after_select => {
                if let Some(body) = text.trim_start().strip_prefix('+') {
                    if let (Some(hint), Some(slot)) = (parse_hint_body(body)?, hints.last_mut()) {
                        *slot = Some(hint);
                    }
                }
                after_select = false;
            }
            Token::Whitespace(_) => {}
            _ => after_select = false,
        }
    }
    Ok(hints)
}

/// Parse the text of a hint comment (after the `+`).
///
/// Unknown hints are ignored; a malformed `JOIN_ORDER` is an error.
pub fn parse_hint_body(body: &str) -> ParseResult<Option<JoinOrderHint>> {
    let upper = body.to_ascii_uppercase();
    let Some(start) = upper.find(JOIN_ORDER) else {
        return Ok(None);
    };

    let rest = body[start + JOIN_ORDER.len()..].trim_start();
    let rest = rest
        .strip_prefix('(')
        .ok_or_else(|| ParseError::InvalidHint(format!("expected '(' after {}", JOIN_ORDER)))?;
    let end = rest
        .find(')')
        .ok_or_else(|| ParseError::InvalidHint(format!("unterminated {}", JOIN_ORDER)))?;

    let relations: Vec<String> = rest[..end]
        .split(',')
        .map(|name| name.trim().trim_matches('`').to_string())
        .collect();
    if relations.iter().any(String::is_empty) {
        return Err(ParseError::InvalidHint(format!(
            "empty relation name in {}",
            JOIN_ORDER
        )));
    }
    Ok(Some(JoinOrderHint { relations }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_attaches_to_select_ordinal() {
        let sql = "select u from uv join (select /*+ JOIN_ORDER(ab, xy) */ * from ab join xy on y = a) r on u = r.a";
        let hints = extract_hints(sql).unwrap();
        assert_eq!(hints.len(), 2);
        assert!(hints[0].is_none());
        assert_eq!(
            hints[1].as_ref().unwrap().relations,
            vec!["ab".to_string(), "xy".to_string()]
        );
    }

    #[test]
    fn test_plain_comment_is_not_a_hint() {
        let hints = extract_hints("select /* JOIN_ORDER(a) */ 1").unwrap();
        assert_eq!(hints, vec![None]);
    }

    #[test]
    fn test_comment_elsewhere_is_ignored() {
        let hints = extract_hints("select 1 /*+ JOIN_ORDER(a) */").unwrap();
        assert_eq!(hints, vec![None]);
    }

    #[test]
    fn test_parse_hint_body() {
        let hint = parse_hint_body(" join_order(b,applySubq0, a) ").unwrap().unwrap();
        assert_eq!(hint.relations, vec!["b", "applySubq0", "a"]);
        assert_eq!(hint.to_string(), "JOIN_ORDER(b, applySubq0, a)");

        assert!(parse_hint_body(" LOOKUP_JOIN(a, b) ").unwrap().is_none());
        assert!(parse_hint_body(" JOIN_ORDER(a, ) ").is_err());
        assert!(parse_hint_body(" JOIN_ORDER a, b ").is_err());
        assert!(parse_hint_body(" JOIN_ORDER(a, b ").is_err());
    }
}
