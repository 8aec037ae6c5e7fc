//! Per-container session tokens.
//!
//! A container token is a comma-separated list of `<pkrange>:<version>#<lsn>[#…]`
//! segments. Observed tokens are merged segment by segment, keeping the newer
//! one, so the token attached to a read never goes backwards.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    version: i64,
    lsn: i64,
    raw: String,
}

impl Segment {
    fn parse(raw: &str) -> Option<(String, Self)> {
        let (range, rest) = raw.split_once(':')?;
        if range.is_empty() || rest.is_empty() {
            return None;
        }
        let mut parts = rest.split('#');
        let first: i64 = parts.next()?.parse().ok()?;
        let (version, lsn) = match parts.next() {
            Some(lsn) => (first, lsn.parse().ok()?),
            // Legacy `<pkrange>:<lsn>` form.
            None => (0, first),
        };
        Some((
            range.to_string(),
            Self {
                version,
                lsn,
                raw: rest.to_string(),
            },
        ))
    }

    fn newer_than(&self, other: &Self) -> bool {
        (self.version, self.lsn).cmp(&(other.version, other.lsn)) == Ordering::Greater
    }
}

fn parse_token(token: &str) -> Option<BTreeMap<String, Segment>> {
    let mut segments = BTreeMap::new();
    for raw in token.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (range, seg) = Segment::parse(raw)?;
        match segments.get(&range) {
            Some(existing) if !seg.newer_than(existing) => {}
            _ => {
                segments.insert(range, seg);
            }
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

fn render(segments: &BTreeMap<String, Segment>) -> String {
    segments
        .iter()
        .map(|(range, seg)| format!("{}:{}", range, seg.raw))
        .collect::<Vec<_>>()
        .join(",")
}

/// Merge `incoming` into `current`. Unparseable tokens replace what was stored.
pub fn merge_tokens(current: Option<&str>, incoming: &str) -> String {
    let Some(incoming_segments) = parse_token(incoming) else {
        return incoming.to_string();
    };
    let Some(mut merged) = current.and_then(parse_token) else {
        return render(&incoming_segments);
    };
    for (range, seg) in incoming_segments {
        match merged.get(&range) {
            Some(existing) if !seg.newer_than(existing) => {}
            _ => {
                merged.insert(range, seg);
            }
        }
    }
    render(&merged)
}

/// Session tokens keyed by container link, shared by every call on a connection.
#[derive(Debug, Default)]
pub struct SessionContainer {
    tokens: RwLock<HashMap<String, String>>,
}

impl SessionContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, container: &str) -> Option<String> {
        self.tokens.read().await.get(container).cloned()
    }

    pub async fn observe(&self, container: &str, token: &str) {
        if token.is_empty() {
            return;
        }
        let mut tokens = self.tokens.write().await;
        let merged = merge_tokens(tokens.get(container).map(String::as_str), token);
        tokens.insert(container.to_string(), merged);
    }

    pub async fn clear(&self, container: &str) {
        self.tokens.write().await.remove(container);
    }

    pub async fn clear_all(&self) {
        self.tokens.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_highest_lsn_per_range() {
        let merged = merge_tokens(Some("0:1#10,1:1#20"), "0:1#12,2:1#5");
        assert_eq!(merged, "0:1#12,1:1#20,2:1#5");

        let merged = merge_tokens(Some("0:1#12"), "0:1#9");
        assert_eq!(merged, "0:1#12");
    }

    #[test]
    fn test_version_dominates_lsn() {
        let merged = merge_tokens(Some("0:1#100"), "0:2#3");
        assert_eq!(merged, "0:2#3");
    }

    #[test]
    fn test_regional_suffix_is_preserved() {
        let merged = merge_tokens(None, "0:-1#42#1=40");
        assert_eq!(merged, "0:-1#42#1=40");
        let merged = merge_tokens(Some(&merged), "0:-1#41#1=41");
        assert_eq!(merged, "0:-1#42#1=40");
    }

    #[test]
    fn test_legacy_and_unparseable_tokens() {
        assert_eq!(merge_tokens(Some("0:5"), "0:7"), "0:7");
        assert_eq!(merge_tokens(Some("0:1#10"), "opaque"), "opaque");
        assert_eq!(merge_tokens(Some("opaque"), "0:1#10"), "0:1#10");
    }

    #[tokio::test]
    async fn test_container_scoping() {
        let sessions = SessionContainer::new();
        sessions.observe("dbs/db/colls/a", "0:1#5").await;
        sessions.observe("dbs/db/colls/a", "0:1#3").await;
        sessions.observe("dbs/db/colls/b", "0:1#9").await;
        assert_eq!(sessions.get("dbs/db/colls/a").await.as_deref(), Some("0:1#5"));
        assert_eq!(sessions.get("dbs/db/colls/b").await.as_deref(), Some("0:1#9"));

        sessions.clear("dbs/db/colls/a").await;
        assert_eq!(sessions.get("dbs/db/colls/a").await, None);
        sessions.clear_all().await;
        assert_eq!(sessions.get("dbs/db/colls/b").await, None);
    }
}
