//! The driver's statement surface: document DDL/DML plus `[WITH ...] SELECT`.

use crate::ast::SelectQuery;
use crate::error::ParseError;
use crate::lexer::{Token, TokenKind};
use crate::parser::Parser;
use crate::placeholder::{bind, extract_options, QueryOptions};
use crate::sanitize::validate_resource_id;
use cosmosql_common::models::{PartitionKeyDefinition, Throughput};
use cosmosql_error::closest_match;
use serde_json::{Map, Value};

/// `[db.]name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateDatabase {
        name: String,
        if_not_exists: bool,
        throughput: Option<Throughput>,
    },
    AlterDatabase {
        name: String,
        throughput: Throughput,
    },
    DropDatabase {
        name: String,
        if_exists: bool,
    },
    ListDatabases,
    CreateCollection {
        target: TableRef,
        if_not_exists: bool,
        partition_key: PartitionKeyDefinition,
        throughput: Option<Throughput>,
        unique_keys: Vec<Vec<String>>,
    },
    AlterCollection {
        target: TableRef,
        throughput: Throughput,
    },
    DropCollection {
        target: TableRef,
        if_exists: bool,
    },
    ListCollections {
        database: Option<String>,
    },
    Insert {
        target: TableRef,
        upsert: bool,
        document: Map<String, Value>,
    },
    /// Read-modify-replace of one document.
    Update {
        target: TableRef,
        set: Vec<(String, Value)>,
        id: Value,
        /// Remaining `field = value` conditions, used as partition key values.
        keys: Vec<(String, Value)>,
    },
    Delete {
        target: TableRef,
        id: Value,
        keys: Vec<(String, Value)>,
    },
    Select {
        options: QueryOptions,
        query: SelectQuery,
    },
}

impl Statement {
    /// True for statements that produce rows.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Statement::Select { .. } | Statement::ListDatabases | Statement::ListCollections { .. }
        )
    }
}

/// Bind `args` into `sql` and parse the result.
pub fn parse_statement(sql: &str, args: &[Value]) -> Result<Statement, ParseError> {
    let text = bind(sql, args)?;
    parse_bound(&text)
}

fn parse_bound(text: &str) -> Result<Statement, ParseError> {
    let mut p = Parser::new(text)?;
    let Some(first) = p.peek().cloned() else {
        return Err(ParseError::UnexpectedEnd {
            expected: "a statement".to_string(),
        });
    };

    if first.is_keyword("WITH") || first.is_keyword("SELECT") {
        let (options, rest) = extract_options(text)?;
        let query = Parser::new(rest)?.parse_select()?;
        return Ok(Statement::Select { options, query });
    }

    p.advance();
    let verb = match &first.kind {
        TokenKind::Word(w) => w.to_ascii_uppercase(),
        _ => String::new(),
    };
    match verb.as_str() {
        "CREATE" => parse_create(&mut p, text),
        "ALTER" => parse_alter(&mut p, text),
        "DROP" => parse_drop(&mut p, text),
        "LIST" => parse_list(&mut p, text),
        "INSERT" => parse_insert(&mut p, text, false),
        "UPSERT" => parse_insert(&mut p, text, true),
        "UPDATE" => parse_update(&mut p, text),
        "DELETE" => parse_delete(&mut p, text),
        _ => Err(ParseError::unsupported(
            format!("statement starting with {}", first.kind),
            first.start,
        )),
    }
}

fn is_name_part(t: &Token) -> bool {
    matches!(
        t.kind,
        TokenKind::Word(_) | TokenKind::Number(_) | TokenKind::Symbol("-")
    )
}

/// A resource id: adjacent word, number and `-` tokens, so `my-db-01` is one name.
fn parse_name(p: &mut Parser, text: &str) -> Result<String, ParseError> {
    let first = match p.peek() {
        Some(t) if matches!(t.kind, TokenKind::Word(_) | TokenKind::Number(_)) => t.clone(),
        Some(Token {
            kind: TokenKind::Str(s),
            ..
        }) => {
            let s = s.clone();
            p.advance();
            validate_resource_id(&s)?;
            return Ok(s);
        }
        _ => return Err(p.expected("a name")),
    };
    p.advance();
    let mut end = first.end;
    while let Some(t) = p.peek() {
        if t.start != end || !is_name_part(t) {
            break;
        }
        end = t.end;
        p.advance();
    }
    let name = text[first.start..end].to_string();
    validate_resource_id(&name)?;
    Ok(name)
}

fn parse_table_ref(p: &mut Parser, text: &str) -> Result<TableRef, ParseError> {
    let first = parse_name(p, text)?;
    if p.eat_symbol(".") {
        let name = parse_name(p, text)?;
        Ok(TableRef {
            database: Some(first),
            name,
        })
    } else {
        Ok(TableRef {
            database: None,
            name: first,
        })
    }
}

fn eat_collection_keyword(p: &mut Parser) -> bool {
    ["COLLECTION", "COLL", "TABLE"]
        .iter()
        .any(|kw| p.eat_keyword(kw))
}

fn eat_if_not_exists(p: &mut Parser) -> Result<bool, ParseError> {
    if !p.eat_keyword("IF") {
        return Ok(false);
    }
    p.expect_keyword("NOT")?;
    p.expect_keyword("EXISTS")?;
    Ok(true)
}

fn eat_if_exists(p: &mut Parser) -> Result<bool, ParseError> {
    if !p.eat_keyword("IF") {
        return Ok(false);
    }
    p.expect_keyword("EXISTS")?;
    Ok(true)
}

struct WithOption {
    name: String,
    value: String,
    position: usize,
}

/// Trailing `WITH key=value` clauses of a DDL statement.
fn parse_with_options(
    p: &mut Parser,
    text: &str,
    allowed: &[&str],
) -> Result<Vec<WithOption>, ParseError> {
    let mut options = Vec::new();
    while p.eat_keyword("WITH") {
        let name = match p.advance() {
            Some(Token {
                kind: TokenKind::Word(w),
                ..
            }) => w.to_ascii_uppercase(),
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
        if !allowed.contains(&name.as_str()) {
            let suggestion = closest_match(&name, allowed.iter().copied()).map(str::to_string);
            return Err(ParseError::UnknownOption { name, suggestion });
        }
        p.expect_symbol("=")?;

        let position = p.position();
        let mut end = None;
        while let Some(t) = p.peek() {
            if t.is_keyword("WITH") || t.is_symbol(";") {
                break;
            }
            end = Some(t.end);
            p.advance();
        }
        let Some(end) = end else {
            return Err(ParseError::UnexpectedEnd {
                expected: format!("a value for {}", name),
            });
        };
        options.push(WithOption {
            name,
            value: text[position..end].trim().to_string(),
            position,
        });
    }
    p.expect_end()?;
    Ok(options)
}

fn parse_u32(option: &WithOption) -> Result<u32, ParseError> {
    option
        .value
        .parse()
        .map_err(|_| ParseError::InvalidLiteral {
            literal: option.value.clone(),
            position: option.position,
        })
}

fn throughput_of(options: &[WithOption]) -> Result<Option<Throughput>, ParseError> {
    let mut throughput = None;
    for o in options {
        let t = match o.name.as_str() {
            "RU" => Throughput::Manual(parse_u32(o)?),
            "MAXRU" => Throughput::Autoscale(parse_u32(o)?),
            _ => continue,
        };
        if throughput.replace(t).is_some() {
            return Err(ParseError::unsupported(
                "RU and MAXRU given together",
                o.position,
            ));
        }
    }
    Ok(throughput)
}

fn required_throughput(options: &[WithOption], p: &Parser) -> Result<Throughput, ParseError> {
    throughput_of(options)?.ok_or_else(|| ParseError::UnexpectedEnd {
        expected: format!("WITH RU=<n> or WITH MAXRU=<n> at position {}", p.position()),
    })
}

fn path_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_create(p: &mut Parser, text: &str) -> Result<Statement, ParseError> {
    if p.eat_keyword("DATABASE") {
        let if_not_exists = eat_if_not_exists(p)?;
        let name = parse_name(p, text)?;
        let options = parse_with_options(p, text, &["RU", "MAXRU"])?;
        return Ok(Statement::CreateDatabase {
            name,
            if_not_exists,
            throughput: throughput_of(&options)?,
        });
    }
    if !eat_collection_keyword(p) {
        return Err(p.expected("DATABASE or COLLECTION"));
    }
    let if_not_exists = eat_if_not_exists(p)?;
    let target = parse_table_ref(p, text)?;
    let options = parse_with_options(p, text, &["PK", "RU", "MAXRU", "UK"])?;

    let Some(pk) = options.iter().find(|o| o.name == "PK") else {
        return Err(ParseError::UnexpectedEnd {
            expected: "WITH PK=/<path>".to_string(),
        });
    };
    let paths = path_list(&pk.value);
    if paths.is_empty() || paths.iter().any(|path| !path.starts_with('/')) {
        return Err(ParseError::InvalidLiteral {
            literal: pk.value.clone(),
            position: pk.position,
        });
    }
    let unique_keys = options
        .iter()
        .filter(|o| o.name == "UK")
        .flat_map(|o| o.value.split(':').map(path_list).collect::<Vec<_>>())
        .filter(|set| !set.is_empty())
        .collect();

    Ok(Statement::CreateCollection {
        target,
        if_not_exists,
        partition_key: PartitionKeyDefinition::from_paths(paths),
        throughput: throughput_of(&options)?,
        unique_keys,
    })
}

fn parse_alter(p: &mut Parser, text: &str) -> Result<Statement, ParseError> {
    if p.eat_keyword("DATABASE") {
        let name = parse_name(p, text)?;
        let options = parse_with_options(p, text, &["RU", "MAXRU"])?;
        return Ok(Statement::AlterDatabase {
            name,
            throughput: required_throughput(&options, p)?,
        });
    }
    if !eat_collection_keyword(p) {
        return Err(p.expected("DATABASE or COLLECTION"));
    }
    let target = parse_table_ref(p, text)?;
    let options = parse_with_options(p, text, &["RU", "MAXRU"])?;
    Ok(Statement::AlterCollection {
        target,
        throughput: required_throughput(&options, p)?,
    })
}

fn parse_drop(p: &mut Parser, text: &str) -> Result<Statement, ParseError> {
    if p.eat_keyword("DATABASE") {
        let if_exists = eat_if_exists(p)?;
        let name = parse_name(p, text)?;
        p.expect_end()?;
        return Ok(Statement::DropDatabase { name, if_exists });
    }
    if !eat_collection_keyword(p) {
        return Err(p.expected("DATABASE or COLLECTION"));
    }
    let if_exists = eat_if_exists(p)?;
    let target = parse_table_ref(p, text)?;
    p.expect_end()?;
    Ok(Statement::DropCollection { target, if_exists })
}

fn parse_list(p: &mut Parser, text: &str) -> Result<Statement, ParseError> {
    if p.eat_keyword("DATABASES") || p.eat_keyword("DATABASE") {
        p.expect_end()?;
        return Ok(Statement::ListDatabases);
    }
    let collections = ["COLLECTIONS", "COLLECTION", "TABLES", "TABLE"]
        .iter()
        .any(|kw| p.eat_keyword(kw));
    if !collections {
        return Err(p.expected("DATABASES or COLLECTIONS"));
    }
    let database = if p.eat_keyword("FROM") {
        Some(parse_name(p, text)?)
    } else {
        None
    };
    p.expect_end()?;
    Ok(Statement::ListCollections { database })
}

fn parse_field_name(p: &mut Parser) -> Result<String, ParseError> {
    match p.advance() {
        Some(Token {
            kind: TokenKind::Word(w) | TokenKind::Str(w),
            ..
        }) => Ok(w),
        Some(t) => Err(ParseError::UnexpectedToken {
            expected: "a field name".to_string(),
            found: t.kind.to_string(),
            position: t.start,
        }),
        None => Err(ParseError::UnexpectedEnd {
            expected: "a field name".to_string(),
        }),
    }
}

fn parse_constant(p: &mut Parser, operand: bool) -> Result<Value, ParseError> {
    let position = p.position();
    let expr = if operand {
        p.parse_operand()?
    } else {
        p.parse_expr()?
    };
    expr.to_constant()
        .ok_or_else(|| ParseError::unsupported(format!("non-constant value {}", expr), position))
}

fn parse_insert(p: &mut Parser, text: &str, upsert: bool) -> Result<Statement, ParseError> {
    p.expect_keyword("INTO")?;
    let target = parse_table_ref(p, text)?;

    p.expect_symbol("(")?;
    let mut fields = Vec::new();
    loop {
        fields.push(parse_field_name(p)?);
        if !p.eat_symbol(",") {
            break;
        }
    }
    p.expect_symbol(")")?;

    p.expect_keyword("VALUES")?;
    let values_at = p.position();
    p.expect_symbol("(")?;
    let mut values = Vec::new();
    loop {
        values.push(parse_constant(p, false)?);
        if !p.eat_symbol(",") {
            break;
        }
    }
    p.expect_symbol(")")?;
    p.expect_end()?;

    if fields.len() != values.len() {
        return Err(ParseError::UnexpectedToken {
            expected: format!("{} value(s)", fields.len()),
            found: format!("{} value(s)", values.len()),
            position: values_at,
        });
    }
    Ok(Statement::Insert {
        target,
        upsert,
        document: fields.into_iter().zip(values).collect(),
    })
}

/// `WHERE id = v [AND field = v ...]`
fn parse_key_conditions(p: &mut Parser) -> Result<(Value, Vec<(String, Value)>), ParseError> {
    p.expect_keyword("WHERE")?;
    let where_at = p.position();
    let mut id = None;
    let mut keys = Vec::new();
    loop {
        let field = parse_field_name(p)?;
        p.expect_symbol("=")?;
        let value = parse_constant(p, true)?;
        if field == "id" && id.is_none() {
            id = Some(value);
        } else {
            keys.push((field, value));
        }
        if !p.eat_keyword("AND") {
            break;
        }
    }
    p.expect_end()?;
    let id = id.ok_or_else(|| ParseError::unsupported("WHERE without an id condition", where_at))?;
    Ok((id, keys))
}

fn parse_update(p: &mut Parser, text: &str) -> Result<Statement, ParseError> {
    let target = parse_table_ref(p, text)?;
    p.expect_keyword("SET")?;
    let mut set = Vec::new();
    loop {
        let field = parse_field_name(p)?;
        p.expect_symbol("=")?;
        set.push((field, parse_constant(p, true)?));
        if !p.eat_symbol(",") {
            break;
        }
    }
    let (id, keys) = parse_key_conditions(p)?;
    Ok(Statement::Update {
        target,
        set,
        id,
        keys,
    })
}

fn parse_delete(p: &mut Parser, text: &str) -> Result<Statement, ParseError> {
    p.expect_keyword("FROM")?;
    let target = parse_table_ref(p, text)?;
    let (id, keys) = parse_key_conditions(p)?;
    Ok(Statement::Delete { target, id, keys })
}
