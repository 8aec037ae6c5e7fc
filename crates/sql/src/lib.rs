//! Query language support for cosmosql.
//!
//! - **Lexing and binding**: `$n`/`?` placeholders and leading `WITH` options (`lexer`, `placeholder`).
//! - **Parsing**: the SELECT surface the driver can run across partitions (`parser`, `ast`).
//! - **Planning**: per-partition rewrites plus a merge-operator stack (`plan`).
//! - **Merging**: the interpreter that reassembles partition results (`merge`).
//! - **Statements**: the driver's DDL/DML surface (`statement`).
pub mod ast;
pub mod error;
pub mod json;
pub mod lexer;
pub mod merge;
pub mod parser;
pub mod placeholder;
pub mod plan;
pub mod sanitize;
pub mod statement;

pub use error::ParseError;
pub use merge::{MergeOp, MergeStep, Merger};
pub use parser::parse_select;
pub use placeholder::{bind, extract_options, QueryOptions};
pub use plan::{plan_query, plan_select, FanOut, QueryParameter, QueryPlan};
pub use statement::{parse_statement, Statement, TableRef};
