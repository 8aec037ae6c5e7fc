use crate::{CosmosError, ErrorCode};

impl From<serde_json::Error> for CosmosError {
    fn from(err: serde_json::Error) -> Self {
        CosmosError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<std::io::Error> for CosmosError {
    fn from(err: std::io::Error) -> Self {
        CosmosError::new(ErrorCode::NetworkError, err.to_string())
    }
}

impl From<url::ParseError> for CosmosError {
    fn from(err: url::ParseError) -> Self {
        CosmosError::new(ErrorCode::InvalidArgument, format!("Invalid URL: {}", err))
    }
}

/// Suggest the closest of `options` to `target` (case-insensitive, edit distance <= 3).
pub fn closest_match<'a, I>(target: &str, options: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let target = target.to_ascii_lowercase();
    let mut best_match: Option<&str> = None;
    let mut min_distance = usize::MAX;

    for option in options {
        let distance = levenshtein(&target, &option.to_ascii_lowercase());
        if distance < min_distance && distance <= 3 {
            min_distance = distance;
            best_match = Some(option);
        }
    }

    best_match
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("book", "back"), 2);
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_closest_match() {
        let options = ["AccountEndpoint", "AccountKey", "DefaultDb", "AutoId"];

        assert_eq!(closest_match("accountkey", options), Some("AccountKey"));
        assert_eq!(closest_match("DefaultDB", options), Some("DefaultDb"));
        assert_eq!(closest_match("AccntKey", options), Some("AccountKey"));
        assert_eq!(closest_match("completely_different", options), None);
    }

    #[test]
    fn test_json_error_mapping() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CosmosError = err.into();
        assert_eq!(err.code, ErrorCode::SerializationFailed);
    }

    #[test]
    fn test_io_error_mapping() {
        let io_err = std::io::Error::other("connection reset");
        let err: CosmosError = io_err.into();
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.message.contains("connection reset"));
    }
}
