//! # cosmosql-error
//!
//! Unified error type for the cosmosql driver.
//!
//! Every error carries:
//! - A numeric error code (COSMOSQL-XXXX)
//! - The logical HTTP status and sub-status, when the service answered
//! - The activity id reported by the service
//! - The request-unit charge accumulated by the logical operation so far
//! - A fingerprint of the originating request

mod code;
mod context;
mod convert;

pub use code::{
    ErrorCategory, ErrorCode, SUBSTATUS_COMPLETING_PARTITION_MIGRATION,
    SUBSTATUS_COMPLETING_SPLIT, SUBSTATUS_NAME_CACHE_STALE, SUBSTATUS_PARTITION_KEY_RANGE_GONE,
};
pub use context::ErrorContext;
pub use convert::closest_match;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type for all cosmosql operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosmosError {
    /// Numeric error code (e.g., "COSMOSQL-1429")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for correcting the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// HTTP status of the last response, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// `x-ms-substatus` of the last response, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_status: Option<u32>,

    /// `x-ms-activity-id` of the last response, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,

    /// Server-advised delay before retrying (429 only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// RU consumed by the logical operation up to the failure
    #[serde(default)]
    pub request_charge: f64,

    /// `"<VERB> <resource-link>[ @pkrange <id>]"` of the originating request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl CosmosError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
            status: None,
            sub_status: None,
            activity_id: None,
            retry_after_ms: None,
            request_charge: 0.0,
            fingerprint: None,
        }
    }

    /// Build the error for a non-success service response.
    pub fn from_status(status: u16, sub_status: Option<u32>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCode::from_status(status, sub_status), message);
        err.status = Some(status);
        err.sub_status = sub_status;
        err
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_activity_id(mut self, activity_id: Option<String>) -> Self {
        self.activity_id = activity_id;
        self
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Replace the accumulated charge with `charge`.
    pub fn with_request_charge(mut self, charge: f64) -> Self {
        self.request_charge = charge;
        self
    }

    /// Add `charge` to the accumulated charge.
    pub fn add_request_charge(&mut self, charge: f64) {
        self.request_charge += charge;
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn unsupported_query(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedQuery, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// True for 410 sub-statuses that require a partition key range refresh.
    pub fn is_partition_topology_change(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::PartitionKeyRangeGone | ErrorCode::NameCacheStale
        )
    }

    /// Serialize to JSON for structured logs
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize CosmosError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }
}

impl fmt::Display for CosmosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(status) = self.status {
            match self.sub_status {
                Some(sub) => write!(f, " (status {}/{})", status, sub)?,
                None => write!(f, " (status {})", status)?,
            }
        }
        if let Some(fp) = &self.fingerprint {
            write!(f, " [{}]", fp)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for CosmosError {}

/// Result type alias for cosmosql operations
pub type Result<T> = std::result::Result<T, CosmosError>;
