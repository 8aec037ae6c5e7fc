//! database/sql-style driver for cosmosql.
//!
//! A [`Driver`] opens a [`Conn`] from a connection string such as
//! `AccountEndpoint=https://localhost:8081/;AccountKey=<base64>;DefaultDb=app;`.
//! Connections run statements with `$n` or `?` placeholders:
//!
//! - `exec` for DDL and document writes, returning an [`ExecResult`];
//! - `query` for `[WITH k=v, ...] SELECT ...` and `LIST ...`, returning [`Rows`].
//!
//! Transactions are not supported.
pub mod conn;
pub mod connstr;
pub mod rows;

pub use conn::{Conn, Driver, ExecResult, Stmt};
pub use connstr::{ConnectionString, ConnectionStringError};
pub use rows::Rows;
