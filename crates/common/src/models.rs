//! Partition key definitions and values.

use cosmosql_error::{CosmosError, ErrorCode, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// `x-ms-consistency-level` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    Eventual,
}

impl ConsistencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strong => "Strong",
            Self::BoundedStaleness => "BoundedStaleness",
            Self::Session => "Session",
            Self::ConsistentPrefix => "ConsistentPrefix",
            Self::Eventual => "Eventual",
        }
    }

    /// Case-insensitive, underscores ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let norm: String = s
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "strong" => Some(Self::Strong),
            "boundedstaleness" => Some(Self::BoundedStaleness),
            "session" => Some(Self::Session),
            "consistentprefix" => Some(Self::ConsistentPrefix),
            "eventual" => Some(Self::Eventual),
            _ => None,
        }
    }
}

/// Provisioned throughput of a database or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throughput {
    /// Fixed RU/s.
    Manual(u32),
    /// Autoscale with the given maximum RU/s.
    Autoscale(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionKind {
    #[default]
    Hash,
    MultiHash,
}

/// The `partitionKey` property of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyDefinition {
    pub paths: Vec<String>,
    #[serde(default)]
    pub kind: PartitionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl PartitionKeyDefinition {
    /// Single-path hash partitioning, version 2.
    pub fn hash(path: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            kind: PartitionKind::Hash,
            version: Some(2),
        }
    }

    /// Hierarchical partitioning over `paths`, always version 2.
    pub fn multi_hash<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            kind: PartitionKind::MultiHash,
            version: Some(2),
        }
    }

    /// One path hashes, several paths multi-hash.
    pub fn from_paths(paths: Vec<String>) -> Self {
        if paths.len() > 1 {
            Self::multi_hash(paths)
        } else {
            Self {
                paths,
                kind: PartitionKind::Hash,
                version: Some(2),
            }
        }
    }

    /// Absent version means version 1.
    pub fn effective_version(&self) -> u32 {
        self.version.unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                "Partition key definition has no paths",
            ));
        }
        if let Some(bad) = self.paths.iter().find(|p| !p.starts_with('/') || p.len() < 2) {
            return Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                format!("Partition key path '{}' must start with '/'", bad),
            ));
        }
        match self.effective_version() {
            1 | 2 => {}
            v => {
                return Err(CosmosError::new(
                    ErrorCode::UnsupportedPartitionKeyVersion,
                    format!("Partition key version {} is not supported", v),
                ))
            }
        }
        match self.kind {
            PartitionKind::Hash if self.paths.len() != 1 => Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                "Hash partitioning takes exactly one path",
            )
            .with_hint("Use MultiHash for several partition key paths")),
            PartitionKind::MultiHash if self.effective_version() != 2 => Err(CosmosError::new(
                ErrorCode::UnsupportedPartitionKeyVersion,
                "MultiHash partitioning requires version 2",
            )),
            _ => Ok(()),
        }
    }

    /// Path segments of `paths[index]`, e.g. `/a/"b c"` yields `["a", "b c"]`.
    pub fn segments(&self, index: usize) -> Vec<String> {
        self.paths
            .get(index)
            .map(|p| path_segments(p))
            .unwrap_or_default()
    }

    /// Error for a tuple of the wrong length.
    pub fn arity_error(&self, supplied: usize) -> CosmosError {
        CosmosError::new(
            ErrorCode::PartitionKeyMismatch,
            format!(
                "Partition key has {} component(s) but the container is partitioned on {} path(s)",
                supplied,
                self.paths.len()
            ),
        )
        .with_context(ErrorContext::PartitionKey {
            expected_paths: self.paths.clone(),
            supplied,
        })
    }
}

/// Split a JSON-pointer-like partition key path into segments.
pub fn path_segments(path: &str) -> Vec<String> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_matches('"').to_string())
        .collect()
}

/// One component of a partition key tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionKeyValue {
    String(String),
    Number(Number),
    Bool(bool),
    Null,
    /// The document has no value at the path.
    Undefined,
}

impl PartitionKeyValue {
    /// Wire form: `Undefined` is the empty object.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Bool(b) => Value::Bool(*b),
            Self::Null => Value::Null,
            Self::Undefined => Value::Object(Map::new()),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Number(n) => Ok(Self::Number(n.clone())),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Null => Ok(Self::Null),
            Value::Object(m) if m.is_empty() => Ok(Self::Undefined),
            other => Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                format!("{} is not a valid partition key value", other),
            )),
        }
    }
}

impl From<&str> for PartitionKeyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PartitionKeyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PartitionKeyValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<bool> for PartitionKeyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A partition key tuple, in path order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionKey(Vec<PartitionKeyValue>);

impl PartitionKey {
    pub fn new(values: Vec<PartitionKeyValue>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<PartitionKeyValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn components(&self) -> &[PartitionKeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the `x-ms-documentdb-partitionkey` header.
    pub fn to_header(&self) -> String {
        Value::Array(self.0.iter().map(PartitionKeyValue::to_json).collect()).to_string()
    }

    /// Parse a JSON array (or a bare scalar) into a tuple.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(PartitionKeyValue::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Self),
            scalar => Ok(Self(vec![PartitionKeyValue::from_json(scalar)?])),
        }
    }

    /// Extract the tuple from `doc` by applying the definition's paths.
    pub fn from_document(def: &PartitionKeyDefinition, doc: &Value) -> Result<Self> {
        let mut values = Vec::with_capacity(def.paths.len());
        for path in &def.paths {
            let mut node = Some(doc);
            for seg in path_segments(path) {
                node = node.and_then(|n| n.get(&seg));
            }
            values.push(match node {
                Some(v) => PartitionKeyValue::from_json(v)?,
                None => PartitionKeyValue::Undefined,
            });
        }
        Ok(Self(values))
    }

    /// Point operations need the full tuple; prefix queries may supply fewer
    /// components of a MultiHash key.
    pub fn check_arity(&self, def: &PartitionKeyDefinition, allow_prefix: bool) -> Result<()> {
        let ok = match def.kind {
            PartitionKind::MultiHash if allow_prefix => {
                !self.is_empty() && self.len() <= def.paths.len()
            }
            _ => self.len() == def.paths.len(),
        };
        if ok {
            Ok(())
        } else {
            Err(def.arity_error(self.len()))
        }
    }

    /// True when this tuple names fewer components than the definition has paths.
    pub fn is_prefix_of(&self, def: &PartitionKeyDefinition) -> bool {
        self.len() < def.paths.len()
    }
}

impl<T: Into<PartitionKeyValue>> From<Vec<T>> for PartitionKey {
    fn from(values: Vec<T>) -> Self {
        Self(values.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_serde_matches_wire() {
        let def: PartitionKeyDefinition = serde_json::from_value(json!({
            "paths": ["/app", "/username"],
            "kind": "MultiHash",
            "version": 2
        }))
        .unwrap();
        assert_eq!(def, PartitionKeyDefinition::multi_hash(["/app", "/username"]));

        let legacy: PartitionKeyDefinition =
            serde_json::from_value(json!({"paths": ["/pk"], "kind": "Hash"})).unwrap();
        assert_eq!(legacy.effective_version(), 1);
        assert!(legacy.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(PartitionKeyDefinition::hash("/username").validate().is_ok());
        assert!(PartitionKeyDefinition::multi_hash(["/a", "/b"]).validate().is_ok());

        let mut v1_multi = PartitionKeyDefinition::multi_hash(["/a", "/b"]);
        v1_multi.version = Some(1);
        assert_eq!(
            v1_multi.validate().unwrap_err().code,
            ErrorCode::UnsupportedPartitionKeyVersion
        );

        let mut v3 = PartitionKeyDefinition::hash("/a");
        v3.version = Some(3);
        assert_eq!(
            v3.validate().unwrap_err().code,
            ErrorCode::UnsupportedPartitionKeyVersion
        );

        assert!(PartitionKeyDefinition::hash("a").validate().is_err());
        assert!(PartitionKeyDefinition::from_paths(vec![]).validate().is_err());
    }

    #[test]
    fn test_header_encoding() {
        let pk = PartitionKey::from(vec!["user1"]);
        assert_eq!(pk.to_header(), r#"["user1"]"#);

        let pk = PartitionKey::new(vec![
            PartitionKeyValue::from(42i64),
            PartitionKeyValue::Bool(true),
            PartitionKeyValue::Null,
            PartitionKeyValue::Undefined,
        ]);
        assert_eq!(pk.to_header(), r#"[42,true,null,{}]"#);
    }

    #[test]
    fn test_from_document() {
        let def = PartitionKeyDefinition::multi_hash(["/app", "/user/name"]);
        let doc = json!({"id": "1", "app": "app0", "user": {"name": "u"}});
        let pk = PartitionKey::from_document(&def, &doc).unwrap();
        assert_eq!(pk, PartitionKey::from(vec!["app0", "u"]));

        let doc = json!({"id": "1", "app": "app0"});
        let pk = PartitionKey::from_document(&def, &doc).unwrap();
        assert_eq!(pk.components()[1], PartitionKeyValue::Undefined);
    }

    #[test]
    fn test_arity() {
        let def = PartitionKeyDefinition::multi_hash(["/app", "/username"]);
        let prefix = PartitionKey::from(vec!["app0"]);
        assert!(prefix.check_arity(&def, true).is_ok());
        let err = prefix.check_arity(&def, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::PartitionKeyMismatch);
        assert!(matches!(
            err.context,
            Some(ErrorContext::PartitionKey { supplied: 1, .. })
        ));

        let def = PartitionKeyDefinition::hash("/username");
        assert!(PartitionKey::from(vec!["a", "b"])
            .check_arity(&def, true)
            .is_err());
    }

    #[test]
    fn test_consistency_parse() {
        assert_eq!(
            ConsistencyLevel::parse("bounded_staleness"),
            Some(ConsistencyLevel::BoundedStaleness)
        );
        assert_eq!(ConsistencyLevel::parse("EVENTUAL"), Some(ConsistencyLevel::Eventual));
        assert_eq!(ConsistencyLevel::parse("linearizable"), None);
        assert_eq!(ConsistencyLevel::Session.as_str(), "Session");
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("/a/b"), vec!["a", "b"]);
        assert_eq!(path_segments("/\"a b\""), vec!["a b"]);
    }
}
