//! Placeholder binding and driver-only query options.
//!
//! `$n` and `?` placeholders are replaced by JSON literals. Only placeholder
//! tokens are touched, so `$` and `?` inside strings and comments survive.

use crate::error::ParseError;
use crate::lexer::{tokenize, Placeholder, Token, TokenKind};
use cosmosql_common::models::ConsistencyLevel;
use cosmosql_error::closest_match;
use serde_json::Value;

/// Number of arguments a statement expects.
pub fn count_placeholders(tokens: &[Token]) -> Result<usize, ParseError> {
    let mut positional = 0;
    let mut highest = 0;
    for t in tokens {
        match t.kind {
            TokenKind::Placeholder(Placeholder::Positional) => positional += 1,
            TokenKind::Placeholder(Placeholder::Numbered(n)) => highest = highest.max(n),
            _ => {}
        }
    }
    if positional > 0 && highest > 0 {
        return Err(ParseError::Placeholder(
            "cannot mix '$n' and '?' placeholders in one statement".to_string(),
        ));
    }
    Ok(positional.max(highest))
}

/// Render a JSON value as a query literal.
pub fn sql_literal(value: &Value) -> String {
    // JSON string escapes are valid in the query language's double-quoted strings.
    value.to_string()
}

/// Substitute `args` for the placeholders of `sql`.
pub fn bind(sql: &str, args: &[Value]) -> Result<String, ParseError> {
    let tokens = tokenize(sql)?;
    bind_tokens(sql, &tokens, args)
}

pub fn bind_tokens(sql: &str, tokens: &[Token], args: &[Value]) -> Result<String, ParseError> {
    let expected = count_placeholders(tokens)?;
    if expected != args.len() {
        return Err(ParseError::Placeholder(format!(
            "statement expects {} argument(s), got {}",
            expected,
            args.len()
        )));
    }

    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    let mut next_positional = 0;
    for t in tokens {
        let index = match t.kind {
            TokenKind::Placeholder(Placeholder::Positional) => {
                next_positional += 1;
                next_positional - 1
            }
            TokenKind::Placeholder(Placeholder::Numbered(n)) => n - 1,
            _ => continue,
        };
        out.push_str(&sql[cursor..t.start]);
        out.push_str(&sql_literal(&args[index]));
        cursor = t.end;
    }
    out.push_str(&sql[cursor..]);
    Ok(out)
}

/// Per-query options given as `WITH k=v[, k=v] SELECT ...`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub database: Option<String>,
    pub collection: Option<String>,
    pub cross_partition: Option<bool>,
    pub max_item_count: Option<u32>,
    pub consistency: Option<ConsistencyLevel>,
    pub max_concurrency: Option<usize>,
}

const OPTION_NAMES: &[&str] = &[
    "database",
    "collection",
    "cross_partition",
    "max_item_count",
    "consistency",
    "max_concurrency",
];

impl QueryOptions {
    fn set(&mut self, key: &str, value: &Token) -> Result<(), ParseError> {
        let canonical = match key.to_ascii_lowercase().replace('_', "").as_str() {
            "database" | "db" => "database",
            "collection" | "coll" | "container" | "table" => "collection",
            "crosspartition" | "crosspartitionquery" => "cross_partition",
            "maxitemcount" | "pagesize" => "max_item_count",
            "consistency" | "consistencylevel" => "consistency",
            "maxconcurrency" | "parallelism" => "max_concurrency",
            _ => {
                return Err(ParseError::UnknownOption {
                    name: key.to_string(),
                    suggestion: closest_match(key, OPTION_NAMES.iter().copied())
                        .map(str::to_string),
                })
            }
        };

        let text = match &value.kind {
            TokenKind::Word(w) | TokenKind::Number(w) | TokenKind::Str(w) => w.as_str(),
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: format!("a value for option '{}'", key),
                    found: other.to_string(),
                    position: value.start,
                })
            }
        };
        let invalid = || ParseError::InvalidLiteral {
            literal: text.to_string(),
            position: value.start,
        };

        match canonical {
            "database" => self.database = Some(text.to_string()),
            "collection" => self.collection = Some(text.to_string()),
            "cross_partition" => self.cross_partition = Some(parse_bool(text).ok_or_else(invalid)?),
            "max_item_count" => self.max_item_count = Some(text.parse().map_err(|_| invalid())?),
            "consistency" => {
                self.consistency = Some(ConsistencyLevel::parse(text).ok_or_else(invalid)?)
            }
            _ => {
                let n: usize = text.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                self.max_concurrency = Some(n);
            }
        }
        Ok(())
    }
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split leading `WITH` options off a query. Returns the options and the
/// remaining text, which starts at `SELECT`.
pub fn extract_options(sql: &str) -> Result<(QueryOptions, &str), ParseError> {
    let tokens = tokenize(sql)?;
    let mut options = QueryOptions::default();
    let Some(first) = tokens.first() else {
        return Ok((options, sql));
    };
    if !first.is_keyword("WITH") {
        return Ok((options, sql));
    }

    let mut i = 1;
    loop {
        let key = match tokens.get(i) {
            Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) => w.clone(),
            Some(t) => {
                return Err(ParseError::UnexpectedToken {
                    expected: "an option name".to_string(),
                    found: t.kind.to_string(),
                    position: t.start,
                })
            }
            None => {
                return Err(ParseError::UnexpectedEnd {
                    expected: "an option name".to_string(),
                })
            }
        };
        match tokens.get(i + 1) {
            Some(t) if t.is_symbol("=") => {}
            Some(t) => {
                return Err(ParseError::UnexpectedToken {
                    expected: "'='".to_string(),
                    found: t.kind.to_string(),
                    position: t.start,
                })
            }
            None => {
                return Err(ParseError::UnexpectedEnd {
                    expected: "'='".to_string(),
                })
            }
        }
        let value = tokens.get(i + 2).ok_or_else(|| ParseError::UnexpectedEnd {
            expected: format!("a value for option '{}'", key),
        })?;
        options.set(&key, value)?;
        i += 3;

        match tokens.get(i) {
            Some(t) if t.is_symbol(",") => i += 1,
            Some(t) if t.is_keyword("WITH") => i += 1,
            Some(t) if t.is_keyword("SELECT") => return Ok((options, &sql[t.start..])),
            Some(t) => {
                return Err(ParseError::UnexpectedToken {
                    expected: "',' or SELECT".to_string(),
                    found: t.kind.to_string(),
                    position: t.start,
                })
            }
            None => {
                return Err(ParseError::UnexpectedEnd {
                    expected: "SELECT after WITH options".to_string(),
                })
            }
        }
    }
}
