//! Recursive-descent parser for the supported SELECT surface.

use crate::ast::{
    is_reserved, AggregateKind, BinaryOp, Expr, FromClause, Projection, SelectItem, SelectQuery,
    SortItem, SortOrder, UnaryOp,
};
use crate::error::ParseError;
use crate::lexer::{tokenize, Token, TokenKind};
use serde_json::Value;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    len: usize,
}

impl Parser {
    pub fn new(sql: &str) -> Result<Self, ParseError> {
        Ok(Self::from_tokens(tokenize(sql)?, sql.len()))
    }

    pub fn from_tokens(tokens: Vec<Token>, len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            len,
        }
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    pub fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    pub fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Byte offset of the next token, or the input length at the end.
    pub fn position(&self) -> usize {
        self.peek().map_or(self.len, |t| t.start)
    }

    pub fn peek_keyword(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(kw))
    }

    pub fn peek_symbol(&self, sym: &str) -> bool {
        self.peek().is_some_and(|t| t.is_symbol(sym))
    }

    pub fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn eat_symbol(&mut self, sym: &str) -> bool {
        if self.peek_symbol(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(t) => ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: t.kind.to_string(),
                position: t.start,
            },
            None => ParseError::UnexpectedEnd {
                expected: expected.to_string(),
            },
        }
    }

    pub fn expect_keyword(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.expected(kw))
        }
    }

    pub fn expect_symbol(&mut self, sym: &str) -> Result<(), ParseError> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(self.expected(&format!("'{}'", sym)))
        }
    }

    /// Consume an optional `;` and require end of input.
    pub fn expect_end(&mut self) -> Result<(), ParseError> {
        self.eat_symbol(";");
        match self.peek() {
            None => Ok(()),
            Some(t) if t.is_keyword("JOIN") => Err(ParseError::unsupported("JOIN", t.start)),
            Some(_) => Err(self.expected("end of statement")),
        }
    }

    /// A non-reserved word.
    pub fn parse_identifier(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) if !is_reserved(w) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.expected("an identifier")),
        }
    }

    pub fn parse_unsigned(&mut self, what: &str) -> Result<u64, ParseError> {
        match self.peek().cloned() {
            Some(Token {
                kind: TokenKind::Number(n),
                start,
                ..
            }) => {
                self.pos += 1;
                n.parse().map_err(|_| ParseError::InvalidLiteral {
                    literal: n,
                    position: start,
                })
            }
            Some(Token {
                kind: TokenKind::Parameter(_),
                start,
                ..
            }) => Err(ParseError::unsupported(
                format!("parameterized {}", what),
                start,
            )),
            _ => Err(self.expected(what)),
        }
    }

    pub fn parse_select(&mut self) -> Result<SelectQuery, ParseError> {
        self.expect_keyword("SELECT")?;
        let distinct = self.eat_keyword("DISTINCT");
        let top = if self.eat_keyword("TOP") {
            Some(self.parse_unsigned("TOP count")?)
        } else {
            None
        };

        let projection = if self.eat_symbol("*") {
            Projection::Star
        } else if self.eat_keyword("VALUE") {
            Projection::Value(self.parse_expr()?)
        } else {
            let mut items = Vec::new();
            loop {
                let expr = self.parse_expr()?;
                let alias = self.parse_optional_alias()?;
                items.push(SelectItem { expr, alias });
                if !self.eat_symbol(",") {
                    break;
                }
            }
            Projection::Items(items)
        };

        self.expect_keyword("FROM")?;
        let from = self.parse_from()?;

        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        let mut order_by = Vec::new();
        loop {
            if self.peek_keyword("GROUP") && group_by.is_empty() {
                self.pos += 1;
                self.expect_keyword("BY")?;
                loop {
                    group_by.push(self.parse_expr()?);
                    if !self.eat_symbol(",") {
                        break;
                    }
                }
            } else if self.peek_keyword("ORDER") && order_by.is_empty() {
                self.pos += 1;
                self.expect_keyword("BY")?;
                loop {
                    let expr = self.parse_expr()?;
                    let order = if self.eat_keyword("DESC") {
                        SortOrder::Descending
                    } else {
                        self.eat_keyword("ASC");
                        SortOrder::Ascending
                    };
                    order_by.push(SortItem { expr, order });
                    if !self.eat_symbol(",") {
                        break;
                    }
                }
            } else {
                break;
            }
        }

        let offset_limit = if self.eat_keyword("OFFSET") {
            let offset = self.parse_unsigned("OFFSET count")?;
            if !self.peek_keyword("LIMIT") {
                return Err(ParseError::unsupported("OFFSET without LIMIT", self.position()));
            }
            self.pos += 1;
            let limit = self.parse_unsigned("LIMIT count")?;
            Some((offset, limit))
        } else if self.peek_keyword("LIMIT") {
            return Err(ParseError::unsupported("LIMIT without OFFSET", self.position()));
        } else {
            None
        };

        if top.is_some() && offset_limit.is_some() {
            return Err(ParseError::unsupported(
                "TOP combined with OFFSET/LIMIT",
                self.position(),
            ));
        }

        self.expect_end()?;

        Ok(SelectQuery {
            distinct,
            top,
            projection,
            from,
            where_clause,
            group_by,
            order_by,
            offset_limit,
        })
    }

    fn parse_optional_alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat_keyword("AS") {
            return self.parse_identifier().map(Some);
        }
        let bare = matches!(
            self.peek(),
            Some(Token { kind: TokenKind::Word(w), .. }) if !is_reserved(w)
        );
        if bare {
            self.parse_identifier().map(Some)
        } else {
            Ok(None)
        }
    }

    fn parse_from(&mut self) -> Result<FromClause, ParseError> {
        if self.peek_symbol("(") {
            return Err(ParseError::unsupported("subquery in FROM", self.position()));
        }
        let mut path = vec![self.parse_identifier()?];
        if self.eat_symbol(".") {
            path.push(self.parse_identifier()?);
        }
        if self.peek_keyword("IN") {
            return Err(ParseError::unsupported("FROM ... IN iteration", self.position()));
        }
        let alias = self.parse_optional_alias()?;
        if self.peek_keyword("JOIN") {
            return Err(ParseError::unsupported("JOIN", self.position()));
        }
        Ok(FromClause { path, alias })
    }

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    /// An operand of a comparison; stops before `AND`, `OR` and comparison operators.
    pub fn parse_operand(&mut self) -> Result<Expr, ParseError> {
        self.parse_coalesce()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("AND") {
            let right = self.parse_not()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat_keyword("NOT") {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_coalesce()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Symbol("=")) => Some(BinaryOp::Eq),
                Some(TokenKind::Symbol("!=")) | Some(TokenKind::Symbol("<>")) => {
                    Some(BinaryOp::NotEq)
                }
                Some(TokenKind::Symbol("<")) => Some(BinaryOp::Lt),
                Some(TokenKind::Symbol("<=")) => Some(BinaryOp::LtEq),
                Some(TokenKind::Symbol(">")) => Some(BinaryOp::Gt),
                Some(TokenKind::Symbol(">=")) => Some(BinaryOp::GtEq),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 1;
                let right = self.parse_coalesce()?;
                left = Expr::binary(op, left, right);
                continue;
            }

            let negated = self.peek_keyword("NOT")
                && self.peek_at(1).is_some_and(|t| {
                    t.is_keyword("BETWEEN") || t.is_keyword("IN") || t.is_keyword("LIKE")
                });
            if negated {
                self.pos += 1;
            }

            if self.eat_keyword("BETWEEN") {
                let low = self.parse_coalesce()?;
                self.expect_keyword("AND")?;
                let high = self.parse_coalesce()?;
                left = Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
            } else if self.eat_keyword("IN") {
                self.expect_symbol("(")?;
                if self.peek_keyword("SELECT") {
                    return Err(ParseError::unsupported("subquery", self.position()));
                }
                let mut list = Vec::new();
                if !self.peek_symbol(")") {
                    loop {
                        list.push(self.parse_expr()?);
                        if !self.eat_symbol(",") {
                            break;
                        }
                    }
                }
                self.expect_symbol(")")?;
                left = Expr::In {
                    expr: Box::new(left),
                    list,
                    negated,
                };
            } else if self.eat_keyword("LIKE") {
                let pattern = self.parse_coalesce()?;
                let escape = if self.eat_keyword("ESCAPE") {
                    Some(Box::new(self.parse_coalesce()?))
                } else {
                    None
                };
                left = Expr::Like {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    escape,
                    negated,
                };
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        'outer: loop {
            for (sym, op) in ops {
                if self.eat_symbol(sym) {
                    let right = next(self)?;
                    left = Expr::binary(*op, left, right);
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("??", BinaryOp::Coalesce)], Self::parse_concat)
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("||", BinaryOp::Concat)], Self::parse_bit_or)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("|", BinaryOp::BitOr)], Self::parse_bit_xor)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("^", BinaryOp::BitXor)], Self::parse_bit_and)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("&", BinaryOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            &[
                ("<<", BinaryOp::Shl),
                (">>>", BinaryOp::ShrZero),
                (">>", BinaryOp::Shr),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Mod),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_symbol("-") {
            let expr = self.parse_unary()?;
            return Ok(match expr {
                Expr::Literal(Value::Number(n)) => Expr::Literal(negate(&n)),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(other),
                },
            });
        }
        if self.eat_symbol("+") {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Plus,
                expr: Box::new(expr),
            });
        }
        if self.eat_symbol("~") {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::BitNot,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_symbol(".") {
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::Word(name),
                        ..
                    }) => expr = Expr::property(expr, name),
                    Some(t) => {
                        return Err(ParseError::UnexpectedToken {
                            expected: "a property name".to_string(),
                            found: t.kind.to_string(),
                            position: t.start,
                        })
                    }
                    None => {
                        return Err(ParseError::UnexpectedEnd {
                            expected: "a property name".to_string(),
                        })
                    }
                }
            } else if self.eat_symbol("[") {
                let index = self.parse_expr()?;
                self.expect_symbol("]")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.advance() else {
            return Err(ParseError::UnexpectedEnd {
                expected: "an expression".to_string(),
            });
        };

        match token.kind {
            TokenKind::Number(text) => serde_json::from_str::<Value>(&text)
                .map(Expr::Literal)
                .map_err(|_| ParseError::InvalidLiteral {
                    literal: text,
                    position: token.start,
                }),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Parameter(p) => Ok(Expr::Parameter(p)),
            TokenKind::Placeholder(_) => Err(ParseError::Placeholder(format!(
                "unbound placeholder at position {}",
                token.start
            ))),
            TokenKind::Symbol("(") => {
                if self.peek_keyword("SELECT") {
                    return Err(ParseError::unsupported("subquery", token.start));
                }
                let expr = self.parse_expr()?;
                self.expect_symbol(")")?;
                Ok(expr)
            }
            TokenKind::Symbol("[") => {
                let mut items = Vec::new();
                if !self.peek_symbol("]") {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat_symbol(",") {
                            break;
                        }
                    }
                }
                self.expect_symbol("]")?;
                Ok(Expr::Array(items))
            }
            TokenKind::Symbol("{") => {
                let mut fields = Vec::new();
                if !self.peek_symbol("}") {
                    loop {
                        let key = match self.advance() {
                            Some(Token {
                                kind: TokenKind::Str(k) | TokenKind::Word(k),
                                ..
                            }) => k,
                            _ => return Err(self.expected("an object property name")),
                        };
                        self.expect_symbol(":")?;
                        fields.push((key, self.parse_expr()?));
                        if !self.eat_symbol(",") {
                            break;
                        }
                    }
                }
                self.expect_symbol("}")?;
                Ok(Expr::Object(fields))
            }
            TokenKind::Word(word) => self.parse_word(word, token.start),
            TokenKind::Symbol(s) => Err(ParseError::UnexpectedToken {
                expected: "an expression".to_string(),
                found: format!("'{}'", s),
                position: token.start,
            }),
        }
    }

    fn parse_word(&mut self, word: String, start: usize) -> Result<Expr, ParseError> {
        match word.to_ascii_uppercase().as_str() {
            "TRUE" => return Ok(Expr::Literal(Value::Bool(true))),
            "FALSE" => return Ok(Expr::Literal(Value::Bool(false))),
            "NULL" => return Ok(Expr::Literal(Value::Null)),
            "UNDEFINED" => return Ok(Expr::Undefined),
            "SELECT" => return Err(ParseError::unsupported("subquery", start)),
            "EXISTS" | "ARRAY" if self.peek_symbol("(") => {
                return Err(ParseError::unsupported(
                    format!("{} subquery", word.to_ascii_uppercase()),
                    start,
                ))
            }
            _ => {}
        }
        if is_reserved(&word) {
            return Err(ParseError::UnexpectedToken {
                expected: "an expression".to_string(),
                found: format!("'{}'", word),
                position: start,
            });
        }

        let udf = word.eq_ignore_ascii_case("udf")
            && self.peek_symbol(".")
            && self.peek_at(2).is_some_and(|t| t.is_symbol("("));
        let name = if udf {
            self.pos += 1;
            match self.advance() {
                Some(Token {
                    kind: TokenKind::Word(n),
                    ..
                }) => n,
                _ => return Err(self.expected("a function name")),
            }
        } else {
            word
        };

        if !self.eat_symbol("(") {
            return Ok(Expr::Ident(name));
        }

        let aggregate = if udf {
            None
        } else {
            AggregateKind::from_name(&name)
        };
        if aggregate == Some(AggregateKind::Count) && self.peek_symbol("*") {
            self.pos += 1;
            self.expect_symbol(")")?;
            return Ok(Expr::Aggregate {
                kind: AggregateKind::Count,
                arg: Box::new(Expr::Literal(Value::from(1))),
            });
        }

        let mut args = Vec::new();
        if !self.peek_symbol(")") {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }
        self.expect_symbol(")")?;

        match aggregate {
            Some(kind) => {
                if args.len() != 1 {
                    return Err(ParseError::unsupported(
                        format!("{} with {} arguments", kind.as_str(), args.len()),
                        start,
                    ));
                }
                let arg = args.remove(0);
                if arg.contains_aggregate() {
                    return Err(ParseError::unsupported("nested aggregate", start));
                }
                Ok(Expr::Aggregate {
                    kind,
                    arg: Box::new(arg),
                })
            }
            None => Ok(Expr::Function { name, args, udf }),
        }
    }
}

fn negate(n: &serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::from(-i)
    } else {
        Value::from(-n.as_f64().unwrap_or(0.0))
    }
}

/// Parse a complete SELECT statement.
pub fn parse_select(sql: &str) -> Result<SelectQuery, ParseError> {
    Parser::new(sql)?.parse_select()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(sql: &str) -> String {
        parse_select(sql).unwrap().to_string()
    }

    #[test]
    fn test_simple_select() {
        let q = parse_select("SELECT * FROM c WHERE c.username = 'user1'").unwrap();
        assert_eq!(q.projection, Projection::Star);
        assert_eq!(q.from.alias(), "c");
        assert_eq!(
            q.to_string(),
            r#"SELECT * FROM c WHERE (c.username = "user1")"#
        );
    }

    #[test]
    fn test_items_and_aliases() {
        let q = parse_select("SELECT c.id, c.grade AS g, c.name n FROM c").unwrap();
        match q.projection {
            Projection::Items(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[1].alias.as_deref(), Some("g"));
                assert_eq!(items[2].alias.as_deref(), Some("n"));
            }
            other => panic!("unexpected projection {:?}", other),
        }
    }

    #[test]
    fn test_order_by_group_by_either_order() {
        let q = parse_select("SELECT c.app FROM c ORDER BY c.app DESC").unwrap();
        assert_eq!(q.order_by[0].order, SortOrder::Descending);

        let q = parse_select("SELECT c.app, COUNT(1) FROM c GROUP BY c.app").unwrap();
        assert_eq!(q.group_by.len(), 1);
        assert!(q.order_by.is_empty());

        let q = parse_select("SELECT c.a FROM c ORDER BY c.a GROUP BY c.a").unwrap();
        assert_eq!(q.group_by.len(), 1);
        assert_eq!(q.order_by.len(), 1);
    }

    #[test]
    fn test_offset_limit_and_top() {
        let q = parse_select("SELECT * FROM c ORDER BY c.grade OFFSET 10 LIMIT 5").unwrap();
        assert_eq!(q.offset_limit, Some((10, 5)));

        let q = parse_select("SELECT TOP 3 * FROM c").unwrap();
        assert_eq!(q.top, Some(3));

        assert!(matches!(
            parse_select("SELECT * FROM c LIMIT 5"),
            Err(ParseError::Unsupported { .. })
        ));
        assert!(matches!(
            parse_select("SELECT * FROM c OFFSET 5"),
            Err(ParseError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_aggregates() {
        let q = parse_select("SELECT VALUE AVG(c.grade) FROM c").unwrap();
        match q.projection {
            Projection::Value(Expr::Aggregate { kind, .. }) => assert_eq!(kind, AggregateKind::Avg),
            other => panic!("unexpected projection {:?}", other),
        }
        assert_eq!(roundtrip("SELECT VALUE count(*) FROM c"), "SELECT VALUE COUNT(1) FROM c");
        assert!(parse_select("SELECT SUM(MAX(c.a)) FROM c").is_err());
    }

    #[test]
    fn test_rejected_constructs() {
        for sql in [
            "SELECT * FROM c JOIN t IN c.tags",
            "SELECT * FROM t IN c.tags",
            "SELECT * FROM c WHERE EXISTS(SELECT VALUE t FROM t IN c.tags)",
            "SELECT * FROM c WHERE c.a IN (SELECT VALUE 1)",
            "SELECT ARRAY(SELECT VALUE t FROM t IN c.tags) FROM c",
            "SELECT * FROM (SELECT * FROM c)",
        ] {
            assert!(
                matches!(parse_select(sql), Err(ParseError::Unsupported { .. })),
                "{} should be unsupported",
                sql
            );
        }
        assert!(parse_select("SELECT * FROM c WHERE").is_err());
        assert!(parse_select("SELECT * FROM c extra tokens").is_err());
    }

    #[test]
    fn test_predicates() {
        assert_eq!(
            roundtrip("SELECT * FROM c WHERE c.a BETWEEN 1 AND 5 AND c.b NOT IN ('x', 'y')"),
            r#"SELECT * FROM c WHERE ((c.a BETWEEN 1 AND 5) AND (c.b NOT IN ("x", "y")))"#
        );
        assert_eq!(
            roundtrip("SELECT * FROM c WHERE c.name LIKE 'a%' OR NOT c.flag"),
            r#"SELECT * FROM c WHERE ((c.name LIKE "a%") OR (NOT c.flag))"#
        );
    }

    #[test]
    fn test_precedence() {
        let q = parse_select("SELECT VALUE 1 + 2 * 3 FROM c").unwrap();
        assert_eq!(q.to_string(), "SELECT VALUE (1 + (2 * 3)) FROM c");
        let q = parse_select("SELECT VALUE -5 FROM c").unwrap();
        assert_eq!(q.projection, Projection::Value(Expr::Literal(json!(-5))));
    }

    #[test]
    fn test_constructors_and_functions() {
        assert_eq!(
            roundtrip(r#"SELECT VALUE {"n": c.name, 'tags': [1, c.x]} FROM c WHERE IS_DEFINED(c.x) AND udf.f(c.y)"#),
            r#"SELECT VALUE {"n": c.name, "tags": [1, c.x]} FROM c WHERE (IS_DEFINED(c.x) AND udf.f(c.y))"#
        );
    }

    #[test]
    fn test_qualified_from() {
        let q = parse_select("SELECT * FROM db1.users u WHERE u.x = 1").unwrap();
        assert_eq!(q.from.database(), Some("db1"));
        assert_eq!(q.from.explicit_collection(), Some("users"));
        assert_eq!(q.to_string(), "SELECT * FROM u WHERE (u.x = 1)");
    }

    #[test]
    fn test_keywords_as_property_names() {
        assert_eq!(
            roundtrip("SELECT c.value, c.order FROM c"),
            r#"SELECT c["value"], c["order"] FROM c"#
        );
    }
}
