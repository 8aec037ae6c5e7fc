//! Row cursors returned by queries.

use cosmosql_client::QueryStream;
use cosmosql_error::{CosmosError, ErrorCode, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;

/// Column name given to rows that are not JSON objects, as in `SELECT VALUE ...`.
pub const VALUE_COLUMN: &str = "$1";

enum Source {
    Query(Box<QueryStream>),
    Buffered {
        rows: VecDeque<Value>,
        request_charge: f64,
    },
}

/// Results of a query, one row at a time.
///
/// Column names come from the projection when it fixes them, otherwise from
/// the first row.
pub struct Rows {
    source: Source,
    columns: Option<Vec<String>>,
    peeked: Option<Value>,
    current: Option<Value>,
    closed: bool,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("closed", &self.closed)
            .field("request_charge", &self.request_charge())
            .finish()
    }
}

fn discover_columns(row: &Value) -> Vec<String> {
    match row {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => vec![VALUE_COLUMN.to_string()],
    }
}

impl Rows {
    pub(crate) fn from_query(stream: QueryStream) -> Self {
        let columns = stream.columns().map(<[String]>::to_vec);
        Self {
            source: Source::Query(Box::new(stream)),
            columns,
            peeked: None,
            current: None,
            closed: false,
        }
    }

    pub(crate) fn buffered(rows: Vec<Value>, request_charge: f64) -> Self {
        Self {
            source: Source::Buffered {
                rows: rows.into(),
                request_charge,
            },
            columns: None,
            peeked: None,
            current: None,
            closed: false,
        }
    }

    async fn fetch(&mut self) -> Result<Option<Value>> {
        if let Some(row) = self.peeked.take() {
            return Ok(Some(row));
        }
        let row = match &mut self.source {
            Source::Query(stream) => stream.next_row().await?,
            Source::Buffered { rows, .. } => rows.pop_front(),
        };
        if self.columns.is_none() {
            if let Some(row) = &row {
                self.columns = Some(discover_columns(row));
            }
        }
        Ok(row)
    }

    /// Advance to the next row. Returns `false` once the results are drained.
    pub async fn next(&mut self) -> Result<bool> {
        if self.closed {
            self.current = None;
            return Ok(false);
        }
        self.current = self.fetch().await?;
        if self.current.is_none() {
            self.close();
        }
        Ok(self.current.is_some())
    }

    /// Column names. Reads ahead one row when the projection does not fix them.
    pub async fn columns(&mut self) -> Result<Vec<String>> {
        if self.columns.is_none() && self.current.is_none() && !self.closed {
            self.peeked = self.fetch().await?;
        }
        Ok(self.columns.clone().unwrap_or_default())
    }

    /// The current row as returned by the service.
    pub fn current(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    fn require_current(&self) -> Result<&Value> {
        self.current.as_ref().ok_or_else(|| {
            CosmosError::new(
                ErrorCode::InvalidArgument,
                "scan called without a current row",
            )
            .with_hint("Call next() and check that it returned true first")
        })
    }

    /// Values of the current row in column order. Missing fields scan as null.
    pub fn scan(&self) -> Result<Vec<Value>> {
        let row = self.require_current()?;
        let columns = self.columns.as_deref().unwrap_or_default();
        Ok(match row {
            Value::Object(map) => columns
                .iter()
                .map(|c| map.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
            other => vec![other.clone()],
        })
    }

    /// Deserialize the whole current row.
    pub fn scan_as<T: DeserializeOwned>(&self) -> Result<T> {
        let row = self.require_current()?;
        Ok(T::deserialize(row)?)
    }

    /// RU consumed so far by the query behind these rows.
    pub fn request_charge(&self) -> f64 {
        match &self.source {
            Source::Query(stream) => stream.request_charge(),
            Source::Buffered { request_charge, .. } => *request_charge,
        }
    }

    /// Stop reading. Outstanding page fetches are abandoned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.peeked = None;
        match &mut self.source {
            Source::Query(stream) => stream.cancel(),
            Source::Buffered { rows, .. } => rows.clear(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain the remaining rows.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while self.next().await? {
            if let Some(row) = self.current.take() {
                out.push(row);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[tokio::test]
    async fn test_columns_discovered_from_first_row() {
        let mut rows = Rows::buffered(vec![json!({"id": "1"}), json!({"grade": 3})], 2.5);
        assert_eq!(rows.columns().await.unwrap(), vec!["id"]);
        assert!(rows.next().await.unwrap());
        assert_eq!(rows.scan().unwrap(), vec![json!("1")]);
        assert!(rows.next().await.unwrap());
        assert_eq!(rows.scan().unwrap(), vec![Value::Null]);
        assert!(!rows.next().await.unwrap());
        assert!(rows.is_closed());
        assert_eq!(rows.request_charge(), 2.5);
    }

    #[tokio::test]
    async fn test_value_rows() {
        let mut rows = Rows::buffered(vec![json!(7)], 0.0);
        assert!(rows.next().await.unwrap());
        assert_eq!(rows.columns().await.unwrap(), vec![VALUE_COLUMN]);
        assert_eq!(rows.scan().unwrap(), vec![json!(7)]);
        assert_eq!(rows.scan_as::<i64>().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_scan_requires_a_row() {
        let mut rows = Rows::buffered(vec![], 0.0);
        assert_eq!(
            rows.scan().unwrap_err().code,
            ErrorCode::InvalidArgument
        );
        assert!(!rows.next().await.unwrap());
        assert!(rows.columns().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_as_struct_and_close() {
        #[derive(Deserialize)]
        struct Person {
            id: String,
        }
        let mut rows = Rows::buffered(vec![json!({"id": "a"}), json!({"id": "b"})], 0.0);
        assert!(rows.next().await.unwrap());
        assert_eq!(rows.scan_as::<Person>().unwrap().id, "a");
        rows.close();
        assert!(!rows.next().await.unwrap());
    }
}
