//! Master-key request signing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use cosmosql_error::{CosmosError, ErrorCode, Result};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// `x-ms-date` format.
pub fn rfc1123_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Signs requests with the decoded account key.
#[derive(Clone)]
pub struct MasterKeySigner {
    key: Vec<u8>,
}

impl fmt::Debug for MasterKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeySigner")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKeySigner {
    pub fn new(key: &SecretString) -> Result<Self> {
        let encoded = key.expose_secret().trim();
        if encoded.is_empty() {
            return Err(CosmosError::new(ErrorCode::AuthConfigError, "Account key is empty"));
        }
        let key = STANDARD.decode(encoded).map_err(|e| {
            CosmosError::new(
                ErrorCode::AuthConfigError,
                format!("Account key is not valid base64: {}", e),
            )
            .with_hint("Copy the primary or secondary key from the account's Keys page")
        })?;
        Ok(Self { key })
    }

    /// Base64 HMAC-SHA256 over the canonical string-to-sign.
    pub fn signature(
        &self,
        verb: &str,
        resource_type: &str,
        resource_link: &str,
        date: &str,
    ) -> String {
        let payload = format!(
            "{}\n{}\n{}\n{}\n\n",
            verb.to_lowercase(),
            resource_type.to_lowercase(),
            resource_link,
            date.to_lowercase()
        );
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(payload.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// `type=master&ver=1.0&sig=<base64>`, before URL encoding.
    pub fn token(&self, verb: &str, resource_type: &str, resource_link: &str, date: &str) -> String {
        format!(
            "type=master&ver=1.0&sig={}",
            self.signature(verb, resource_type, resource_link, date)
        )
    }

    /// Value of the `Authorization` header.
    pub fn authorization(
        &self,
        verb: &str,
        resource_type: &str,
        resource_link: &str,
        date: &str,
    ) -> String {
        url::form_urlencoded::byte_serialize(
            self.token(verb, resource_type, resource_link, date).as_bytes(),
        )
        .collect()
    }
}

/// Recover the raw token from an `Authorization` header value.
pub fn decode_authorization(header: &str) -> String {
    url::form_urlencoded::parse(header.as_bytes())
        .map(|(k, v)| {
            if v.is_empty() {
                k.into_owned()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer() -> MasterKeySigner {
        MasterKeySigner::new(&SecretString::from(STANDARD.encode(b"test-account-key"))).unwrap()
    }

    #[test]
    fn test_rfc1123_date() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(rfc1123_date(t), "Tue, 05 Mar 2024 07:08:09 GMT");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let s = signer();
        let date = "Tue, 05 Mar 2024 07:08:09 GMT";
        let a = s.authorization("GET", "docs", "dbs/db1/colls/c1/docs/00001", date);
        let b = s.authorization("GET", "docs", "dbs/db1/colls/c1/docs/00001", date);
        assert_eq!(a, b);
        assert!(a.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));

        let other = s.authorization("GET", "docs", "dbs/db1/colls/c1/docs/00002", date);
        assert_ne!(a, other);
    }

    #[test]
    fn test_verb_and_date_are_case_insensitive() {
        let s = signer();
        assert_eq!(
            s.signature("GET", "DOCS", "dbs/a", "Tue, 05 Mar 2024 07:08:09 GMT"),
            s.signature("get", "docs", "dbs/a", "tue, 05 mar 2024 07:08:09 gmt"),
        );
        // The resource link is signed verbatim.
        assert_ne!(
            s.signature("GET", "dbs", "dbs/A", "d"),
            s.signature("GET", "dbs", "dbs/a", "d"),
        );
    }

    #[test]
    fn test_authorization_round_trips() {
        let s = signer();
        let header = s.authorization("POST", "docs", "dbs/db1/colls/c1", "d");
        assert_eq!(decode_authorization(&header), s.token("POST", "docs", "dbs/db1/colls/c1", "d"));
    }

    #[test]
    fn test_malformed_key_is_config_error() {
        let err = MasterKeySigner::new(&SecretString::from("not base64 !!".to_string())).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthConfigError);
        let err = MasterKeySigner::new(&SecretString::from(String::new())).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthConfigError);
    }

    #[test]
    fn test_debug_redacts_key() {
        assert!(!format!("{:?}", signer()).contains("test-account-key"));
    }
}
