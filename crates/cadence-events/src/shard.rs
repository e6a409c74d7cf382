//! Shard ownership: splits the key space `0..=max` across cooperating workers.

use cadence_core::config::ClusterConfig;
use cadence_core::error::{CadenceError, Result};
use serde::Serialize;

/// Inclusive shard key range owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardRange {
    pub lower: u32,
    pub upper: u32,
}

impl ShardRange {
    pub fn full() -> Self {
        Self {
            lower: 0,
            upper: u32::MAX,
        }
    }

    pub fn contains(&self, key: u32) -> bool {
        key >= self.lower && key <= self.upper
    }
}

/// Even split of `0..=max` into `count` contiguous ranges. The remainder is
/// spread one key at a time over the leading ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMap {
    ranges: Vec<ShardRange>,
}

impl ShardMap {
    pub fn new(count: usize, max: u32) -> Self {
        if count == 0 {
            return Self { ranges: Vec::new() };
        }
        let total = max as u64 + 1;
        let base = total / count as u64;
        let mut rest = total % count as u64;
        let mut ranges = Vec::with_capacity(count);
        let mut lower = 0u64;

        for _ in 0..count {
            let size = if rest > 0 {
                rest -= 1;
                base + 1
            } else {
                base
            };
            if size == 0 || lower > max as u64 {
                break;
            }
            let upper = (lower + size - 1).min(max as u64);
            ranges.push(ShardRange {
                lower: lower as u32,
                upper: upper as u32,
            });
            lower = upper + 1;
        }
        Self { ranges }
    }

    pub fn ranges(&self) -> &[ShardRange] {
        &self.ranges
    }

    pub fn range(&self, index: usize) -> Option<ShardRange> {
        self.ranges.get(index).copied()
    }

    pub fn index_of(&self, key: u32) -> Option<usize> {
        self.ranges.iter().position(|r| r.contains(key))
    }
}

/// Random shard key for a new document.
pub fn generate_shard_key(max: u32) -> u32 {
    match max.checked_add(1) {
        Some(span) => rand::random::<u32>() % span,
        None => rand::random(),
    }
}

/// This worker's view of the cluster.
#[derive(Debug, Clone)]
pub struct ClusterView {
    self_name: String,
    self_index: Option<usize>,
    endpoints: Vec<String>,
    map: ShardMap,
}

impl ClusterView {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            self_name: config.self_name.clone(),
            self_index: config.self_index(),
            endpoints: config.endpoints.clone(),
            map: ShardMap::new(config.endpoints.len(), config.max_shard_key),
        })
    }

    /// A single worker owning every key.
    pub fn standalone(name: &str) -> Self {
        Self {
            self_name: name.to_string(),
            self_index: Some(0),
            endpoints: vec![name.to_string()],
            map: ShardMap::new(1, u32::MAX),
        }
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn own_range(&self) -> Result<ShardRange> {
        self.self_index
            .and_then(|i| self.map.range(i))
            .ok_or_else(|| {
                CadenceError::Config(format!("no shard range for endpoint '{}'", self.self_name))
            })
    }

    /// Endpoint owning `key`, if any.
    pub fn endpoint_for(&self, key: u32) -> Option<&str> {
        self.map
            .index_of(key)
            .and_then(|i| self.endpoints.get(i))
            .map(String::as_str)
    }

    pub fn owns(&self, key: u32) -> bool {
        self.endpoint_for(key) == Some(self.self_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_covers_space_without_gaps() {
        for count in [1usize, 2, 3, 7, 10] {
            let map = ShardMap::new(count, 100);
            let ranges = map.ranges();
            assert_eq!(ranges.len(), count);
            assert_eq!(ranges[0].lower, 0);
            assert_eq!(ranges[count - 1].upper, 100);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].upper + 1, pair[1].lower);
            }
        }
    }

    #[test]
    fn test_remainder_goes_to_leading_ranges() {
        // 101 keys over 3 ranges: 34, 34, 33.
        let map = ShardMap::new(3, 100);
        assert_eq!(map.range(0), Some(ShardRange { lower: 0, upper: 33 }));
        assert_eq!(map.range(1), Some(ShardRange { lower: 34, upper: 67 }));
        assert_eq!(map.range(2), Some(ShardRange { lower: 68, upper: 100 }));
        assert_eq!(map.index_of(67), Some(1));
    }

    #[test]
    fn test_full_u32_space() {
        let map = ShardMap::new(4, u32::MAX);
        assert_eq!(map.ranges().len(), 4);
        assert_eq!(map.range(3).unwrap().upper, u32::MAX);
        assert_eq!(map.index_of(u32::MAX), Some(3));
        assert_eq!(map.index_of(0), Some(0));
    }

    #[test]
    fn test_more_shards_than_keys() {
        let map = ShardMap::new(5, 2);
        assert_eq!(map.ranges().len(), 3);
        assert_eq!(ShardMap::new(0, 10).ranges().len(), 0);
    }

    #[test]
    fn test_cluster_routing() {
        let config = ClusterConfig {
            self_name: "b".into(),
            endpoints: vec!["a".into(), "b".into()],
            max_shard_key: 99,
        };
        let view = ClusterView::new(&config).unwrap();
        assert_eq!(view.own_range().unwrap(), ShardRange { lower: 50, upper: 99 });
        assert_eq!(view.endpoint_for(10), Some("a"));
        assert!(view.owns(75));
        assert!(!view.owns(3));

        let solo = ClusterView::standalone("solo");
        assert_eq!(solo.own_range().unwrap(), ShardRange::full());
        assert!(solo.owns(u32::MAX));
    }

    #[test]
    fn test_generated_keys_in_range() {
        for _ in 0..100 {
            assert!(generate_shard_key(9) <= 9);
        }
        assert_eq!(generate_shard_key(0), 0);
    }
}
