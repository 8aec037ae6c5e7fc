use crate::error::ParseError;

/// Longest id the service accepts for databases, containers and documents.
pub const MAX_RESOURCE_ID_LEN: usize = 255;

/// Check a database, container or document id before it is placed in a resource link.
pub fn validate_resource_id(id: &str) -> Result<(), ParseError> {
    if id.is_empty() {
        return Err(ParseError::InvalidIdentifier("empty".to_string()));
    }
    if id.chars().count() > MAX_RESOURCE_ID_LEN {
        return Err(ParseError::InvalidIdentifier(format!(
            "too long: {}",
            id.chars().count()
        )));
    }
    if id.contains(['/', '\\', '?', '#']) || id.chars().any(char::is_control) {
        return Err(ParseError::InvalidIdentifier(format!(
            "forbidden characters in: {}",
            id
        )));
    }
    if id.ends_with(' ') {
        return Err(ParseError::InvalidIdentifier(format!(
            "trailing space in: {:?}",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resource_id() {
        assert!(validate_resource_id("users").is_ok());
        assert!(validate_resource_id("user-01_x.y").is_ok());

        assert!(validate_resource_id("").is_err());
        assert!(validate_resource_id("a/b").is_err());
        assert!(validate_resource_id("what?").is_err());
        assert!(validate_resource_id("null\0byte").is_err());
        assert!(validate_resource_id("pad ").is_err());
        assert!(validate_resource_id(&"x".repeat(256)).is_err());
    }
}
