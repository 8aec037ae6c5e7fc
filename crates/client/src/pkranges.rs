//! Partition key range resolution.
//!
//! Each container's ranges are fetched once and cached until invalidated. Every
//! refresh stamps the map with a new generation so a request routed against an
//! old map can tell whether its invalidation is already stale.

use crate::epk::MAX_EPK;
use async_trait::async_trait;
use cosmosql_common::CallContext;
use cosmosql_error::{CosmosError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(id: impl Into<String>, min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min.into(),
            max_exclusive: max.into(),
            parents: Vec::new(),
        }
    }

    pub fn contains(&self, epk: &str) -> bool {
        self.min_inclusive.as_str() <= epk
            && (epk < self.max_exclusive.as_str() || self.max_exclusive == MAX_EPK)
    }

    /// True when the range intersects the inclusive interval `[min, max]`.
    pub fn overlaps(&self, min: &str, max: &str) -> bool {
        self.min_inclusive.as_str() <= max && min < self.max_exclusive.as_str()
    }
}

/// Ranges of one container, ordered by `min_inclusive`.
#[derive(Debug, Clone)]
pub struct RoutingMap {
    ranges: Vec<PartitionKeyRange>,
    generation: u64,
}

impl RoutingMap {
    pub fn new(mut ranges: Vec<PartitionKeyRange>, generation: u64) -> Self {
        ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        Self { ranges, generation }
    }

    pub fn ranges(&self) -> &[PartitionKeyRange] {
        &self.ranges
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn range_of(&self, epk: &str) -> Option<&PartitionKeyRange> {
        let idx = self
            .ranges
            .partition_point(|r| r.min_inclusive.as_str() <= epk);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        candidate.contains(epk).then_some(candidate)
    }

    pub fn overlapping(&self, min: &str, max: &str) -> Vec<PartitionKeyRange> {
        self.ranges
            .iter()
            .filter(|r| r.overlaps(min, max))
            .cloned()
            .collect()
    }
}

/// Loads the current ranges of a container from the service.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch_ranges(
        &self,
        ctx: &CallContext,
        container: &str,
    ) -> Result<Vec<PartitionKeyRange>>;
}

/// Per-connection cache of routing maps, keyed by container link.
#[derive(Debug, Default)]
pub struct PartitionKeyRangeCache {
    maps: RwLock<HashMap<String, Arc<RoutingMap>>>,
    refresh: Mutex<()>,
    generation: AtomicU64,
}

impl PartitionKeyRangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cached(&self, container: &str) -> Option<Arc<RoutingMap>> {
        self.maps.read().await.get(container).cloned()
    }

    /// The container's routing map, fetched on first use or after invalidation.
    pub async fn ranges_for(
        &self,
        ctx: &CallContext,
        container: &str,
        fetcher: &dyn RangeFetcher,
    ) -> Result<Arc<RoutingMap>> {
        if let Some(map) = self.cached(container).await {
            return Ok(map);
        }

        // Single writer: concurrent misses wait for one fetch.
        let _guard = self.refresh.lock().await;
        if let Some(map) = self.cached(container).await {
            return Ok(map);
        }

        let ranges = fetcher.fetch_ranges(ctx, container).await?;
        if ranges.is_empty() {
            return Err(CosmosError::internal(format!(
                "Service returned no partition key ranges for {}",
                container
            )));
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let map = Arc::new(RoutingMap::new(ranges, generation));
        info!(
            container,
            generation,
            ranges = map.ranges().len(),
            "Refreshed partition key ranges"
        );
        self.maps
            .write()
            .await
            .insert(container.to_string(), map.clone());
        Ok(map)
    }

    pub async fn range_of(
        &self,
        ctx: &CallContext,
        container: &str,
        epk: &str,
        fetcher: &dyn RangeFetcher,
    ) -> Result<(PartitionKeyRange, u64)> {
        let map = self.ranges_for(ctx, container, fetcher).await?;
        match map.range_of(epk) {
            Some(range) => Ok((range.clone(), map.generation())),
            None => Err(CosmosError::internal(format!(
                "No partition key range of {} covers {}",
                container, epk
            ))),
        }
    }

    pub async fn overlapping(
        &self,
        ctx: &CallContext,
        container: &str,
        min: &str,
        max: &str,
        fetcher: &dyn RangeFetcher,
    ) -> Result<(Vec<PartitionKeyRange>, u64)> {
        let map = self.ranges_for(ctx, container, fetcher).await?;
        Ok((map.overlapping(min, max), map.generation()))
    }

    /// Drop the map if it is not newer than `generation`. Returns whether it was dropped.
    pub async fn invalidate(&self, container: &str, generation: u64) -> bool {
        let mut maps = self.maps.write().await;
        match maps.get(container) {
            Some(map) if map.generation() > generation => false,
            Some(_) => {
                maps.remove(container);
                info!(container, generation, "Invalidated partition key ranges");
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, container: &str) {
        if self.maps.write().await.remove(container).is_some() {
            info!(container, "Invalidated partition key ranges");
        }
    }

    pub async fn clear(&self) {
        self.maps.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingFetcher {
        calls: AtomicUsize,
        ranges: Vec<PartitionKeyRange>,
    }

    #[async_trait]
    impl RangeFetcher for CountingFetcher {
        async fn fetch_ranges(
            &self,
            _ctx: &CallContext,
            _container: &str,
        ) -> Result<Vec<PartitionKeyRange>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.ranges.clone())
        }
    }

    fn four_ranges() -> Vec<PartitionKeyRange> {
        vec![
            PartitionKeyRange::new("2", "20", "30"),
            PartitionKeyRange::new("0", "", "10"),
            PartitionKeyRange::new("3", "30", "FF"),
            PartitionKeyRange::new("1", "10", "20"),
        ]
    }

    #[test]
    fn test_range_of_binary_search() {
        let map = RoutingMap::new(four_ranges(), 1);
        assert_eq!(map.ranges()[0].id, "0");
        assert_eq!(map.range_of("").unwrap().id, "0");
        assert_eq!(map.range_of("0FFFFF").unwrap().id, "0");
        assert_eq!(map.range_of("10").unwrap().id, "1");
        assert_eq!(map.range_of("2A").unwrap().id, "2");
        assert_eq!(map.range_of("3F0000").unwrap().id, "3");
    }

    #[test]
    fn test_overlapping() {
        let map = RoutingMap::new(four_ranges(), 1);
        let ids: Vec<_> = map
            .overlapping("15", "25")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(map.overlapping("", "FF").len(), 4);
        assert_eq!(map.overlapping("20", "20").len(), 1);
    }

    #[tokio::test]
    async fn test_single_fetch_under_concurrency() {
        let cache = Arc::new(PartitionKeyRangeCache::new());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            ranges: four_ranges(),
        });
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .ranges_for(&CallContext::background(), "dbs/db/colls/c", fetcher.as_ref())
                    .await
                    .map(|m| m.generation())
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 1);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_invalidation_is_ignored() {
        let cache = PartitionKeyRangeCache::new();
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            ranges: four_ranges(),
        };
        let ctx = CallContext::background();
        let first = cache.ranges_for(&ctx, "c", &fetcher).await.unwrap();
        assert!(cache.invalidate("c", first.generation()).await);
        let second = cache.ranges_for(&ctx, "c", &fetcher).await.unwrap();
        assert!(second.generation() > first.generation());

        // A request routed with the old map must not discard the new one.
        assert!(!cache.invalidate("c", first.generation()).await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        let (range, generation) = cache.range_of(&ctx, "c", "25", &fetcher).await.unwrap();
        assert_eq!(range.id, "2");
        assert_eq!(generation, second.generation());
    }
}
