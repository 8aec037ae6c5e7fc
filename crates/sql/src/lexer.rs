//! String- and comment-aware tokenizer for the document query language.
//!
//! Tokens keep their byte spans so placeholder binding can splice literal text
//! into the original statement without disturbing anything else.

use crate::error::ParseError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `$1`, `$2`, ...
    Numbered(usize),
    /// `?`
    Positional,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifiers and keywords, case preserved.
    Word(String),
    /// Numeric literal text.
    Number(String),
    /// String literal, unescaped.
    Str(String),
    /// `@name` query parameter.
    Parameter(String),
    Placeholder(Placeholder),
    Symbol(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// Case-insensitive keyword test.
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    pub fn is_symbol(&self, sym: &str) -> bool {
        matches!(&self.kind, TokenKind::Symbol(s) if *s == sym)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Word(w) => write!(f, "'{}'", w),
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Str(s) => write!(f, "string {:?}", s),
            TokenKind::Parameter(p) => write!(f, "parameter @{}", p),
            TokenKind::Placeholder(Placeholder::Numbered(n)) => write!(f, "placeholder ${}", n),
            TokenKind::Placeholder(Placeholder::Positional) => write!(f, "placeholder ?"),
            TokenKind::Symbol(s) => write!(f, "'{}'", s),
        }
    }
}

// Longest first.
const SYMBOLS: &[&str] = &[
    ">>>", "!=", "<>", "<=", ">=", "||", "??", "<<", ">>", "(", ")", "[", "]", "{", "}", ",", ".",
    ":", "*", "+", "-", "/", "%", "=", "<", ">", "&", "|", "^", "~", ";",
];

pub fn tokenize(sql: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Comments
        if sql[i..].starts_with("--") {
            i = sql[i..].find('\n').map_or(bytes.len(), |n| i + n + 1);
            continue;
        }
        if sql[i..].starts_with("/*") {
            let close = sql[i + 2..].find("*/").ok_or(ParseError::Unterminated {
                what: "comment",
                position: i,
            })?;
            i = i + 2 + close + 2;
            continue;
        }

        let start = i;
        let kind = match c {
            b'\'' | b'"' => {
                let (value, end) = lex_string(sql, i)?;
                i = end;
                TokenKind::Str(value)
            }
            b'0'..=b'9' => {
                i = lex_number(bytes, i);
                TokenKind::Number(sql[start..i].to_string())
            }
            b'@' => {
                i += 1;
                let end = scan_word(bytes, i);
                if end == i {
                    return Err(ParseError::InvalidLiteral {
                        literal: "@".to_string(),
                        position: start,
                    });
                }
                i = end;
                TokenKind::Parameter(sql[start + 1..i].to_string())
            }
            b'$' => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let n: usize = sql[start + 1..i].parse().unwrap_or(0);
                if n == 0 {
                    return Err(ParseError::Placeholder(format!(
                        "invalid placeholder '{}' at position {}",
                        &sql[start..i.max(start + 1)],
                        start
                    )));
                }
                TokenKind::Placeholder(Placeholder::Numbered(n))
            }
            b'?' if !sql[i..].starts_with("??") => {
                i += 1;
                TokenKind::Placeholder(Placeholder::Positional)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                i = scan_word(bytes, i);
                TokenKind::Word(sql[start..i].to_string())
            }
            _ => {
                let sym = SYMBOLS
                    .iter()
                    .find(|s| sql[i..].starts_with(**s))
                    .ok_or_else(|| ParseError::UnexpectedToken {
                        expected: "a token".to_string(),
                        found: format!("'{}'", sql[i..].chars().next().unwrap_or('?')),
                        position: i,
                    })?;
                i += sym.len();
                TokenKind::Symbol(sym)
            }
        };
        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }

    Ok(tokens)
}

fn scan_word(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    i
}

fn lex_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

/// Lex a quoted string starting at `start`; returns the unescaped value and the end offset.
fn lex_string(sql: &str, start: usize) -> Result<(String, usize), ParseError> {
    let quote = sql.as_bytes()[start] as char;
    let mut out = String::new();
    let mut chars = sql[start + 1..].char_indices();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => {
                let (_, esc) = chars.next().ok_or(ParseError::Unterminated {
                    what: "string",
                    position: start,
                })?;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'u' => {
                        let hex: String = chars.by_ref().take(4).map(|(_, c)| c).collect();
                        let code = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| ParseError::InvalidLiteral {
                                literal: format!("\\u{}", hex),
                                position: start + 1 + offset,
                            })?;
                        out.push(code);
                    }
                    other => out.push(other),
                }
            }
            c if c == quote => return Ok((out, start + 1 + offset + 1)),
            c => out.push(c),
        }
    }

    Err(ParseError::Unterminated {
        what: "string",
        position: start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_select() {
        let k = kinds("SELECT c.id FROM c WHERE c.grade >= 4.5");
        assert_eq!(k[0], TokenKind::Word("SELECT".into()));
        assert_eq!(k[2], TokenKind::Symbol("."));
        assert_eq!(k[10], TokenKind::Symbol(">="));
        assert_eq!(k[11], TokenKind::Number("4.5".into()));
    }

    #[test]
    fn test_placeholders_outside_strings_only() {
        let k = kinds(r#"SELECT * FROM c WHERE c.a = $1 AND c.b = '$2?' AND c.c = ?"#);
        let placeholders: Vec<_> = k
            .iter()
            .filter_map(|t| match t {
                TokenKind::Placeholder(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(
            placeholders,
            vec![Placeholder::Numbered(1), Placeholder::Positional]
        );
        assert!(k.contains(&TokenKind::Str("$2?".into())));
    }

    #[test]
    fn test_comments_are_skipped() {
        let k = kinds("SELECT -- what about $1?\n * /* or ? here */ FROM c");
        assert_eq!(
            k,
            vec![
                TokenKind::Word("SELECT".into()),
                TokenKind::Symbol("*"),
                TokenKind::Word("FROM".into()),
                TokenKind::Word("c".into()),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let k = kinds(r#"'it\'s' "a\"b" "A\n""#);
        assert_eq!(k[0], TokenKind::Str("it's".into()));
        assert_eq!(k[1], TokenKind::Str("a\"b".into()));
        assert_eq!(k[2], TokenKind::Str("A\n".into()));
    }

    #[test]
    fn test_coalesce_is_not_a_placeholder() {
        let k = kinds("c.a ?? c.b");
        assert_eq!(k[3], TokenKind::Symbol("??"));
    }

    #[test]
    fn test_spans() {
        let sql = "SELECT  $12";
        let t = tokenize(sql).unwrap();
        assert_eq!(&sql[t[1].start..t[1].end], "$12");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            tokenize("SELECT 'abc"),
            Err(ParseError::Unterminated { what: "string", .. })
        ));
        assert!(matches!(
            tokenize("SELECT /* abc"),
            Err(ParseError::Unterminated { what: "comment", .. })
        ));
        assert!(matches!(tokenize("SELECT $0"), Err(ParseError::Placeholder(_))));
        assert!(tokenize("SELECT #").is_err());
    }

    #[test]
    fn test_parameters_and_numbers() {
        let k = kinds("@grade 1e3 10 2.5E-2");
        assert_eq!(k[0], TokenKind::Parameter("grade".into()));
        assert_eq!(k[1], TokenKind::Number("1e3".into()));
        assert_eq!(k[2], TokenKind::Number("10".into()));
        assert_eq!(k[3], TokenKind::Number("2.5E-2".into()));
    }
}
