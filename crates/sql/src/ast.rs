//! Query AST. `Display` renders text the service accepts; binary operations are
//! always parenthesized so rendering never depends on operator precedence.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Coalesce,
    Concat,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    ShrZero,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Or => "OR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Coalesce => "??",
            BinaryOp::Concat => "||",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::ShrZero => ">>>",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            "AVG" => Some(Self::Avg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Avg => "AVG",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// JSON scalar literal.
    Literal(Value),
    Undefined,
    Parameter(String),
    /// Bare identifier, normally the FROM alias.
    Ident(String),
    Property {
        base: Box<Expr>,
        name: String,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: Option<Box<Expr>>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        udf: bool,
    },
    Aggregate {
        kind: AggregateKind,
        arg: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn property(base: Expr, name: impl Into<String>) -> Self {
        Expr::Property {
            base: Box::new(base),
            name: name.into(),
        }
    }

    /// True when an aggregate call appears anywhere in the expression.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, Expr::Aggregate { .. }));
        found
    }

    /// Pre-order traversal.
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Property { base, .. } => base.walk(f),
            Expr::Index { base, index } => {
                base.walk(f);
                index.walk(f);
            }
            Expr::Array(items) | Expr::Function { args: items, .. } => {
                for e in items {
                    e.walk(f);
                }
            }
            Expr::Object(fields) => {
                for (_, e) in fields {
                    e.walk(f);
                }
            }
            Expr::Unary { expr, .. } => expr.walk(f),
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.walk(f);
                low.walk(f);
                high.walk(f);
            }
            Expr::In { expr, list, .. } => {
                expr.walk(f);
                for e in list {
                    e.walk(f);
                }
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                ..
            } => {
                expr.walk(f);
                pattern.walk(f);
                if let Some(e) = escape {
                    e.walk(f);
                }
            }
            Expr::Aggregate { arg, .. } => arg.walk(f),
            Expr::Literal(_) | Expr::Undefined | Expr::Parameter(_) | Expr::Ident(_) => {}
        }
    }

    /// Property chain rooted at `root`, e.g. `c.a["b"]` yields `["a", "b"]`.
    pub fn property_path(&self, root: &str) -> Option<Vec<String>> {
        match self {
            Expr::Ident(name) if name == root => Some(Vec::new()),
            Expr::Property { base, name } => {
                let mut path = base.property_path(root)?;
                path.push(name.clone());
                Some(path)
            }
            Expr::Index { base, index } => match index.as_ref() {
                Expr::Literal(Value::String(name)) => {
                    let mut path = base.property_path(root)?;
                    path.push(name.clone());
                    Some(path)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Last property name of a path expression, used to name projected columns.
    pub fn output_name(&self) -> Option<&str> {
        match self {
            Expr::Property { name, .. } => Some(name),
            Expr::Index { index, .. } => match index.as_ref() {
                Expr::Literal(Value::String(name)) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Evaluate literal-only expressions (used for VALUES lists and SET clauses).
    pub fn to_constant(&self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Array(items) => items
                .iter()
                .map(Expr::to_constant)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Expr::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (k, e) in fields {
                    map.insert(k.clone(), e.to_constant()?);
                }
                Some(Value::Object(map))
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => match expr.to_constant()? {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(Value::from(-i))
                    } else {
                        n.as_f64().map(|f| Value::from(-f))
                    }
                }
                _ => None,
            },
            Expr::Unary {
                op: UnaryOp::Plus,
                expr,
            } => expr.to_constant(),
            _ => None,
        }
    }
}

pub const RESERVED: &[&str] = &[
    "AND", "ARRAY", "AS", "ASC", "BETWEEN", "BY", "DESC", "DISTINCT", "ESCAPE", "EXISTS", "FALSE",
    "FROM", "GROUP", "IN", "JOIN", "LIKE", "LIMIT", "NOT", "NULL", "OFFSET", "OR", "ORDER",
    "SELECT", "TOP", "TRUE", "UNDEFINED", "VALUE", "WHERE",
];

pub fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !is_reserved(name)
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "{}", Value::String(s.to_string()))
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", e)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Undefined => write!(f, "undefined"),
            Expr::Parameter(p) => write!(f, "@{}", p),
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Property { base, name } => {
                if is_plain_identifier(name) {
                    write!(f, "{}.{}", base, name)
                } else {
                    write!(f, "{}[", base)?;
                    write_string(f, name)?;
                    write!(f, "]")
                }
            }
            Expr::Index { base, index } => write!(f, "{}[{}]", base, index),
            Expr::Array(items) => {
                write!(f, "[")?;
                write_list(f, items)?;
                write!(f, "]")
            }
            Expr::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, e)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_string(f, k)?;
                    write!(f, ": {}", e)?;
                }
                write!(f, "}}")
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "(NOT {})", expr),
                UnaryOp::Neg => write!(f, "(-{})", expr),
                UnaryOp::Plus => write!(f, "(+{})", expr),
                UnaryOp::BitNot => write!(f, "(~{})", expr),
            },
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.as_str(), right),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "({} {}BETWEEN {} AND {})",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::In {
                expr,
                list,
                negated,
            } => {
                write!(f, "({} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                write_list(f, list)?;
                write!(f, "))")
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => {
                write!(
                    f,
                    "({} {}LIKE {}",
                    expr,
                    if *negated { "NOT " } else { "" },
                    pattern
                )?;
                if let Some(e) = escape {
                    write!(f, " ESCAPE {}", e)?;
                }
                write!(f, ")")
            }
            Expr::Function { name, args, udf } => {
                if *udf {
                    write!(f, "udf.")?;
                }
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::Aggregate { kind, arg } => write!(f, "{}({})", kind.as_str(), arg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Star,
    Value(Expr),
    Items(Vec<SelectItem>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortItem {
    pub expr: Expr,
    pub order: SortOrder,
}

/// `FROM [db.]name [[AS] alias]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub path: Vec<String>,
    pub alias: Option<String>,
}

impl FromClause {
    /// Name expressions refer to the root document by.
    pub fn alias(&self) -> &str {
        self.alias
            .as_deref()
            .or_else(|| self.path.last().map(String::as_str))
            .unwrap_or("root")
    }

    pub fn database(&self) -> Option<&str> {
        (self.path.len() == 2).then(|| self.path[0].as_str())
    }

    /// Container named explicitly, as in `FROM db.coll` or `FROM coll c`.
    /// A lone `FROM c` names only an alias.
    pub fn explicit_collection(&self) -> Option<&str> {
        if self.path.len() == 2 || self.alias.is_some() {
            self.path.last().map(String::as_str)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub distinct: bool,
    pub top: Option<u64>,
    pub projection: Projection,
    pub from: FromClause,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<SortItem>,
    /// `(offset, limit)`
    pub offset_limit: Option<(u64, u64)>,
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        if let Some(top) = self.top {
            write!(f, "TOP {} ", top)?;
        }
        match &self.projection {
            Projection::Star => write!(f, "*")?,
            Projection::Value(e) => write!(f, "VALUE {}", e)?,
            Projection::Items(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.expr)?;
                    if let Some(alias) = &item.alias {
                        write!(f, " AS {}", alias)?;
                    }
                }
            }
        }
        write!(f, " FROM {}", self.from.alias())?;
        if let Some(w) = &self.where_clause {
            write!(f, " WHERE {}", w)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY ")?;
            write_list(f, &self.group_by)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY ")?;
            for (i, s) in self.order_by.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                let dir = match s.order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                write!(f, "{} {}", s.expr, dir)?;
            }
        }
        if let Some((offset, limit)) = self.offset_limit {
            write!(f, " OFFSET {} LIMIT {}", offset, limit)?;
        }
        Ok(())
    }
}
