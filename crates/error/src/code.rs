use serde::{Deserialize, Serialize};
use std::fmt;

/// Service sub-status: the name cache of the gateway is stale.
pub const SUBSTATUS_NAME_CACHE_STALE: u32 = 1000;
/// Service sub-status: the addressed partition key range no longer exists.
pub const SUBSTATUS_PARTITION_KEY_RANGE_GONE: u32 = 1002;
/// Service sub-status: a split of the addressed range is completing.
pub const SUBSTATUS_COMPLETING_SPLIT: u32 = 1007;
/// Service sub-status: a partition migration is completing.
pub const SUBSTATUS_COMPLETING_PARTITION_MIGRATION: u32 = 1008;

/// Numeric error codes following COSMOSQL-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Service errors, derived from HTTP status (1000 + status where possible)
/// - **2000-2999**: Query errors
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Client-side data errors
/// - **5000-5999**: Transport/runtime errors
///
/// Codes are stable across versions (semver contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Service Errors (1000-1999) ===
    /// COSMOSQL-1400: Malformed request rejected by the service
    BadRequest = 1400,
    /// COSMOSQL-1401: Signature rejected
    Unauthorized = 1401,
    /// COSMOSQL-1403: Operation forbidden for this key
    Forbidden = 1403,
    /// COSMOSQL-1404: Resource does not exist
    NotFound = 1404,
    /// COSMOSQL-1408: Service-side request timeout
    RequestTimeout = 1408,
    /// COSMOSQL-1409: Id or unique key clash
    Conflict = 1409,
    /// COSMOSQL-1410: Resource gone (unclassified sub-status)
    Gone = 1410,
    /// COSMOSQL-1412: ETag mismatch
    PreconditionFailed = 1412,
    /// COSMOSQL-1413: Request entity too large
    PayloadTooLarge = 1413,
    /// COSMOSQL-1429: Request rate too large
    Throttled = 1429,
    /// COSMOSQL-1449: Transient conflict, retry with
    RetryWith = 1449,
    /// COSMOSQL-1460: Partition key range split or merged (410 / 1002, 1007, 1008)
    PartitionKeyRangeGone = 1460,
    /// COSMOSQL-1461: Container name cache stale (410 / 1000)
    NameCacheStale = 1461,
    /// COSMOSQL-1503: 5xx from the service
    ServiceUnavailable = 1503,
    /// COSMOSQL-1999: Status code outside the known taxonomy
    UnexpectedStatus = 1999,

    // === Query Errors (2000-2999) ===
    /// COSMOSQL-2001: Construct outside the recognized query grammar
    UnsupportedQuery = 2001,
    /// COSMOSQL-2002: Placeholder/parameter binding failed
    InvalidParameter = 2002,
    /// COSMOSQL-2003: Driver feature intentionally not supported (transactions)
    NotSupported = 2003,

    // === Configuration Errors (3000-3999) ===
    /// COSMOSQL-3001: Malformed master key or missing endpoint
    AuthConfigError = 3001,
    /// COSMOSQL-3002: Connection string could not be parsed
    InvalidConnectionString = 3002,
    /// COSMOSQL-3003: Settings failed validation
    InvalidSettings = 3003,

    // === Client Errors (4000-4999) ===
    /// COSMOSQL-4001: Partition key arity does not match the container definition
    PartitionKeyMismatch = 4001,
    /// COSMOSQL-4002: Serialization/deserialization failed
    SerializationFailed = 4002,
    /// COSMOSQL-4003: Invalid argument supplied by the caller
    InvalidArgument = 4003,
    /// COSMOSQL-4004: Container partition key version not understood
    UnsupportedPartitionKeyVersion = 4004,

    // === Transport Errors (5000-5999) ===
    /// COSMOSQL-5001: Connection, TLS or I/O failure
    NetworkError = 5001,
    /// COSMOSQL-5002: Call canceled or deadline exceeded
    Canceled = 5002,
    /// COSMOSQL-5003: Unexpected internal state
    Internal = 5003,

    /// COSMOSQL-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "COSMOSQL-1429")
    pub fn as_str(&self) -> String {
        format!("COSMOSQL-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Service,
            2000..=2999 => ErrorCategory::Query,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Client,
            5000..=5999 => ErrorCategory::Transport,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Map an HTTP status and optional sub-status to a code.
    ///
    /// This is the only place service statuses are classified.
    pub fn from_status(status: u16, sub_status: Option<u32>) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            408 => Self::RequestTimeout,
            409 => Self::Conflict,
            410 => match sub_status {
                Some(SUBSTATUS_NAME_CACHE_STALE) => Self::NameCacheStale,
                Some(
                    SUBSTATUS_PARTITION_KEY_RANGE_GONE
                    | SUBSTATUS_COMPLETING_SPLIT
                    | SUBSTATUS_COMPLETING_PARTITION_MIGRATION,
                ) => Self::PartitionKeyRangeGone,
                _ => Self::Gone,
            },
            412 => Self::PreconditionFailed,
            413 => Self::PayloadTooLarge,
            429 => Self::Throttled,
            449 => Self::RetryWith,
            500..=599 => Self::ServiceUnavailable,
            _ => Self::UnexpectedStatus,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("COSMOSQL-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1400 => Ok(Self::BadRequest),
            1401 => Ok(Self::Unauthorized),
            1403 => Ok(Self::Forbidden),
            1404 => Ok(Self::NotFound),
            1408 => Ok(Self::RequestTimeout),
            1409 => Ok(Self::Conflict),
            1410 => Ok(Self::Gone),
            1412 => Ok(Self::PreconditionFailed),
            1413 => Ok(Self::PayloadTooLarge),
            1429 => Ok(Self::Throttled),
            1449 => Ok(Self::RetryWith),
            1460 => Ok(Self::PartitionKeyRangeGone),
            1461 => Ok(Self::NameCacheStale),
            1503 => Ok(Self::ServiceUnavailable),
            1999 => Ok(Self::UnexpectedStatus),
            2001 => Ok(Self::UnsupportedQuery),
            2002 => Ok(Self::InvalidParameter),
            2003 => Ok(Self::NotSupported),
            3001 => Ok(Self::AuthConfigError),
            3002 => Ok(Self::InvalidConnectionString),
            3003 => Ok(Self::InvalidSettings),
            4001 => Ok(Self::PartitionKeyMismatch),
            4002 => Ok(Self::SerializationFailed),
            4003 => Ok(Self::InvalidArgument),
            4004 => Ok(Self::UnsupportedPartitionKeyVersion),
            5001 => Ok(Self::NetworkError),
            5002 => Ok(Self::Canceled),
            5003 => Ok(Self::Internal),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Service,
    Query,
    Config,
    Client,
    Transport,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::Throttled.as_str(), "COSMOSQL-1429");
        assert_eq!(ErrorCode::UnsupportedQuery.as_str(), "COSMOSQL-2001");
        assert_eq!(ErrorCode::Unknown.as_str(), "COSMOSQL-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("COSMOSQL-1404".to_string()).unwrap(),
            ErrorCode::NotFound
        );
        assert!(ErrorCode::try_from("COSMOSQL-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("SQLSTATE-1404".to_string()).is_err());
        assert!(ErrorCode::try_from("COSMOSQL-ABC".to_string()).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::from_status(429, None), ErrorCode::Throttled);
        assert_eq!(ErrorCode::from_status(449, Some(0)), ErrorCode::RetryWith);
        assert_eq!(ErrorCode::from_status(412, None), ErrorCode::PreconditionFailed);
        assert_eq!(ErrorCode::from_status(503, None), ErrorCode::ServiceUnavailable);
        assert_eq!(ErrorCode::from_status(502, None), ErrorCode::ServiceUnavailable);
        assert_eq!(ErrorCode::from_status(418, None), ErrorCode::UnexpectedStatus);
    }

    #[test]
    fn test_gone_sub_status_mapping() {
        assert_eq!(
            ErrorCode::from_status(410, Some(1002)),
            ErrorCode::PartitionKeyRangeGone
        );
        assert_eq!(
            ErrorCode::from_status(410, Some(1007)),
            ErrorCode::PartitionKeyRangeGone
        );
        assert_eq!(
            ErrorCode::from_status(410, Some(1000)),
            ErrorCode::NameCacheStale
        );
        assert_eq!(ErrorCode::from_status(410, None), ErrorCode::Gone);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::Conflict.category(), ErrorCategory::Service);
        assert_eq!(ErrorCode::UnsupportedQuery.category(), ErrorCategory::Query);
        assert_eq!(ErrorCode::AuthConfigError.category(), ErrorCategory::Config);
        assert_eq!(
            ErrorCode::PartitionKeyMismatch.category(),
            ErrorCategory::Client
        );
        assert_eq!(ErrorCode::Canceled.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Unknown);
    }
}
