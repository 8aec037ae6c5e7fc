//! `AccountEndpoint=...;AccountKey=...;[Key=Value;]...` connection strings.

use cosmosql_common::config::DriverSettings;
use cosmosql_error::{closest_match, CosmosError, ErrorCode, ErrorContext};
use secrecy::SecretString;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

const KNOWN_KEYS: &[&str] = &[
    "AccountEndpoint",
    "AccountKey",
    "DefaultDb",
    "AutoId",
    "InsecureSkipVerify",
    "Version",
    "TimeoutMs",
    "MaxRetryAttempts",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionStringError {
    #[error("Connection string is missing {0}")]
    Missing(&'static str),

    #[error("Malformed segment '{0}', expected Key=Value")]
    Malformed(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} is given more than once")]
    Duplicate(&'static str),
}

impl ConnectionStringError {
    fn field(&self) -> Option<&str> {
        match self {
            Self::Missing(key) | Self::Duplicate(key) => Some(key),
            Self::InvalidValue { key, .. } => Some(key),
            Self::Malformed(_) => None,
        }
    }
}

impl From<ConnectionStringError> for CosmosError {
    fn from(err: ConnectionStringError) -> Self {
        let field = err.field().map(str::to_string);
        CosmosError::new(ErrorCode::InvalidConnectionString, err.to_string())
            .with_context(ErrorContext::Config {
                field,
                file_path: None,
            })
            .with_hint("Expected AccountEndpoint=<url>;AccountKey=<base64>;[DefaultDb=<name>;]...")
    }
}

/// A parsed connection string. The account key stays wrapped so it never
/// reaches logs or `Debug` output.
#[derive(Debug)]
pub struct ConnectionString {
    pub endpoint: String,
    pub key: SecretString,
    pub default_db: Option<String>,
    /// Generate an `id` for inserted documents that lack one.
    pub auto_id: bool,
    pub insecure_skip_verify: bool,
    pub api_version: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retry_attempts: Option<u32>,
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConnectionStringError> {
    cosmosql_sql::placeholder::parse_bool(value).ok_or_else(|| ConnectionStringError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConnectionStringError> {
    value
        .parse()
        .map_err(|_| ConnectionStringError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

fn set_once<T>(
    slot: &mut Option<T>,
    key: &'static str,
    value: T,
) -> Result<(), ConnectionStringError> {
    if slot.is_some() {
        return Err(ConnectionStringError::Duplicate(key));
    }
    *slot = Some(value);
    Ok(())
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoint = None;
        let mut key = None;
        let mut default_db = None;
        let mut auto_id = None;
        let mut insecure_skip_verify = None;
        let mut api_version = None;
        let mut timeout_ms = None;
        let mut max_retry_attempts = None;

        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            // Base64 keys end in '=', so only the first one separates.
            let Some((name, value)) = segment.split_once('=') else {
                return Err(ConnectionStringError::Malformed(segment.to_string()));
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "accountendpoint" => set_once(&mut endpoint, "AccountEndpoint", value.to_string())?,
                "accountkey" => set_once(&mut key, "AccountKey", value.to_string())?,
                "defaultdb" | "db" => set_once(&mut default_db, "DefaultDb", value.to_string())?,
                "autoid" => set_once(&mut auto_id, "AutoId", parse_flag("AutoId", value)?)?,
                "insecureskipverify" => set_once(
                    &mut insecure_skip_verify,
                    "InsecureSkipVerify",
                    parse_flag("InsecureSkipVerify", value)?,
                )?,
                "version" => set_once(&mut api_version, "Version", value.to_string())?,
                "timeoutms" => set_once(
                    &mut timeout_ms,
                    "TimeoutMs",
                    parse_number("TimeoutMs", value)?,
                )?,
                "maxretryattempts" => set_once(
                    &mut max_retry_attempts,
                    "MaxRetryAttempts",
                    parse_number("MaxRetryAttempts", value)?,
                )?,
                _ => {
                    let suggestion = closest_match(name.trim(), KNOWN_KEYS.iter().copied());
                    warn!(
                        key = name.trim(),
                        suggestion = suggestion.unwrap_or(""),
                        "Ignoring unknown connection string key"
                    );
                }
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or(ConnectionStringError::Missing("AccountEndpoint"))?;
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or(ConnectionStringError::Missing("AccountKey"))?;
        Ok(Self {
            endpoint,
            key: SecretString::from(key),
            default_db: default_db.filter(|d| !d.is_empty()),
            auto_id: auto_id.unwrap_or(false),
            insecure_skip_verify: insecure_skip_verify.unwrap_or(false),
            api_version,
            timeout_ms,
            max_retry_attempts,
        })
    }
}

impl ConnectionString {
    /// Overlay the per-connection keys on `settings`.
    pub fn apply(&self, settings: &mut DriverSettings) {
        if self.insecure_skip_verify {
            settings.transport.insecure_skip_verify = true;
        }
        if let Some(version) = &self.api_version {
            settings.transport.api_version = version.clone();
        }
        if let Some(ms) = self.timeout_ms {
            settings.transport.request_timeout_ms = ms;
        }
        if let Some(n) = self.max_retry_attempts {
            settings.retry.max_attempts = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parses_all_keys() {
        let cs: ConnectionString = "AccountEndpoint=https://localhost:8081/;AccountKey=a2V5==;\
             DefaultDb=mydb;AutoId=true;InsecureSkipVerify=yes;Version=2021-04-30;\
             TimeoutMs=5000;MaxRetryAttempts=2;"
            .parse()
            .unwrap();
        assert_eq!(cs.endpoint, "https://localhost:8081/");
        assert_eq!(cs.key.expose_secret(), "a2V5==");
        assert_eq!(cs.default_db.as_deref(), Some("mydb"));
        assert!(cs.auto_id);
        assert!(cs.insecure_skip_verify);

        let mut settings = DriverSettings::default();
        cs.apply(&mut settings);
        assert_eq!(settings.transport.api_version, "2021-04-30");
        assert_eq!(settings.transport.request_timeout_ms, 5000);
        assert_eq!(settings.retry.max_attempts, 2);
        assert!(settings.transport.insecure_skip_verify);
    }

    #[test]
    fn test_keys_are_case_insensitive_and_optional() {
        let cs: ConnectionString = "accountendpoint=https://x/ ; ACCOUNTKEY=k".parse().unwrap();
        assert_eq!(cs.endpoint, "https://x/");
        assert!(cs.default_db.is_none());
        assert!(!cs.auto_id);
        assert!(cs.timeout_ms.is_none());
    }

    #[test]
    fn test_rejects_bad_strings() {
        assert_eq!(
            "AccountKey=k".parse::<ConnectionString>().unwrap_err(),
            ConnectionStringError::Missing("AccountEndpoint")
        );
        assert_eq!(
            "AccountEndpoint=https://x/;AccountKey=".parse::<ConnectionString>().unwrap_err(),
            ConnectionStringError::Missing("AccountKey")
        );
        assert!(matches!(
            "AccountEndpoint=https://x/;AccountKey=k;AutoId=maybe".parse::<ConnectionString>(),
            Err(ConnectionStringError::InvalidValue { key: "AutoId", .. })
        ));
        assert!(matches!(
            "AccountEndpoint=https://x/;AccountKey=k;garbage".parse::<ConnectionString>(),
            Err(ConnectionStringError::Malformed(_))
        ));
        assert_eq!(
            "AccountEndpoint=https://x/;AccountEndpoint=https://y/;AccountKey=k"
                .parse::<ConnectionString>()
                .unwrap_err(),
            ConnectionStringError::Duplicate("AccountEndpoint")
        );
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let cs: ConnectionString = "AccountEndpoint=https://x/;AccountKey=k;DefaultDbb=oops"
            .parse()
            .unwrap();
        assert!(cs.default_db.is_none());
    }

    #[test]
    fn test_converts_to_cosmos_error() {
        let err: CosmosError = ConnectionStringError::Missing("AccountKey").into();
        assert_eq!(err.code, ErrorCode::InvalidConnectionString);
        assert_eq!(
            err.context,
            Some(ErrorContext::Config {
                field: Some("AccountKey".to_string()),
                file_path: None,
            })
        );
    }
}
