//! A sharded, balanced page cache for block-addressed storage.
//!
//! Each shard is a single task that owns its pages outright; callers reach
//! it through a [ShardHandle] and pin pages inside a [CacheTransaction].
//! Under memory pressure the shard evicts pages in plain insertion order,
//! flushing dirty ones to the backing [BlockStore] first. A process-wide
//! [CacheBalancer] periodically re-divides the total cache budget across
//! shards in proportion to their recent activity.

mod account;
mod bag;
mod balancer;
mod cache;
mod config;
mod evicter;
mod page;
mod shard;
mod storage;

pub use self::account::{CacheAccount, IoPriority};
pub use self::balancer::{
    BalancedShard,
    CacheBalance,
    CacheBalancer,
    DummyCacheBalancer,
    RebalanceTimerState,
};
pub use self::cache::AcquireError;
pub use self::config::{BalancerConfig, CacheConfig};
pub use self::evicter::{LimitUpdate, ShardStats};
pub use self::page::{BlockId, PageData};
pub use self::shard::{CacheTransaction, ShardHandle, spawn_shard};
pub use self::storage::{BlockStore, MemoryStore};
