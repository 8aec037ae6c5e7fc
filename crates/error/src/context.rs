//! # Error Contexts
//!
//! Structured metadata attached to errors for programmatic handling.

use serde::{Deserialize, Serialize};

/// Structured context for an error.
///
/// Each variant provides specific fields relevant to that error type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// The HTTP request a service or transport error originated from
    Http {
        method: String,
        resource_link: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pkrange_id: Option<String>,
    },

    /// Context for COSMOSQL-2001 (UnsupportedQuery)
    Query {
        position: usize,
        snippet: String,
    },

    /// Context for COSMOSQL-4001 (PartitionKeyMismatch)
    PartitionKey {
        expected_paths: Vec<String>,
        supplied: usize,
    },

    /// Context for COSMOSQL-3xxx (config errors)
    Config {
        field: Option<String>,
        file_path: Option<String>,
    },

    /// Retry budget that was spent before the error surfaced
    Retry {
        attempts: u32,
        waited_ms: u64,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}
