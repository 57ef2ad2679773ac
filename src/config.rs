#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
/// Configuration options for one cache shard.
pub struct CacheConfig {
    /// How many successor blocks to speculatively load on a cache miss while
    /// read-ahead is permitted. `0` disables read-ahead for the shard.
    pub read_ahead_blocks: u64,
    /// Local accesses accumulated before the shard raises its balancer wake
    /// flag.
    pub rebalance_access_count_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_ahead_blocks: 1,
            rebalance_access_count_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
/// Configuration options for the cache balancer control loop.
pub struct BalancerConfig {
    /// The total memory budget distributed across all registered shards.
    pub total_cache_size: u64,
    /// Floor below which no shard's limit is ever pushed, so idle shards are
    /// not starved to zero.
    pub base_mem_per_store: u64,
    /// Interval at which the check timer fires.
    pub rebalance_check_interval_ms: u64,
    /// Wall-clock staleness after which a rebalance runs even without any
    /// shard raising its wake flag.
    pub rebalance_timeout_ms: u64,
    /// Read-ahead stays enabled until the process has loaded
    /// `numerator / denominator` of the total cache size.
    pub read_ahead_ratio_numerator: u64,
    pub read_ahead_ratio_denominator: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            total_cache_size: 256 << 20,
            base_mem_per_store: 4 << 20,
            rebalance_check_interval_ms: 100,
            rebalance_timeout_ms: 500,
            read_ahead_ratio_numerator: 1,
            read_ahead_ratio_denominator: 2,
        }
    }
}
