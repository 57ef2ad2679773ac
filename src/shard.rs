use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::account::{CacheAccount, IoPriority};
use crate::balancer::{BalancedShard, CacheBalance};
use crate::cache::{PageCache, PinToken, ShardJob};
use crate::config::CacheConfig;
use crate::evicter::{LimitUpdate, ShardStats};
use crate::page::{BlockId, PageData};
use crate::storage::BlockStore;

/// Spawn a cache shard and return the handle used to talk to it.
///
/// The shard is a task that owns its [PageCache] outright and executes
/// queued jobs serially, so cache state never needs a lock. The balancer
/// seeds the initial memory limit and learns about the shard through
/// registration; dropping every handle shuts the task down and deregisters
/// the shard on its next rebalance.
pub fn spawn_shard<S: BlockStore>(
    config: CacheConfig,
    store: Arc<S>,
    balancer: &dyn CacheBalance,
) -> Arc<ShardHandle<S>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ShardJob<S>>();
    let wake = Arc::new(AtomicBool::new(false));

    let mut cache = PageCache::new(
        config,
        balancer.base_mem_per_store(),
        balancer.read_ahead_ok_at_start(),
        store.clone(),
        tx.downgrade(),
        wake.clone(),
    );
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job(&mut cache);
        }
        tracing::debug!("cache shard stopped");
    });

    let handle = Arc::new(ShardHandle { jobs: tx, wake, store });
    balancer.register_shard(Arc::downgrade(&handle) as _);
    handle
}

/// A clonable handle onto one cache shard.
pub struct ShardHandle<S: BlockStore> {
    jobs: mpsc::UnboundedSender<ShardJob<S>>,
    wake: Arc<AtomicBool>,
    store: Arc<S>,
}

impl<S: BlockStore> ShardHandle<S> {
    /// Open a transaction carrying the account's I/O priority.
    ///
    /// The account is a per-task capability, so the transaction inherits its
    /// priority without the account ever crossing threads.
    pub fn begin(self: &Arc<Self>, account: &CacheAccount) -> CacheTransaction<S> {
        CacheTransaction {
            shard: self.clone(),
            priority: account.priority(),
            pinned: Vec::new(),
        }
    }

    /// A point-in-time snapshot of the shard's counters.
    pub async fn stats(&self) -> Result<ShardStats, crate::AcquireError> {
        let (tx, rx) = oneshot::channel();
        self.send(Box::new(move |cache| {
            let _ = tx.send(cache.stats());
        }))?;
        rx.await.map_err(|_| crate::AcquireError::ShardClosed)
    }

    /// Whether `block` is currently pinned or mid-I/O on this shard.
    pub async fn is_unevictable(&self, block: BlockId) -> Result<bool, crate::AcquireError> {
        let (tx, rx) = oneshot::channel();
        self.send(Box::new(move |cache| {
            let _ = tx.send(cache.page_is_in_unevictable_bag(block));
        }))?;
        rx.await.map_err(|_| crate::AcquireError::ShardClosed)
    }

    fn send(&self, job: ShardJob<S>) -> Result<(), crate::AcquireError> {
        self.jobs
            .send(job)
            .map_err(|_| crate::AcquireError::ShardClosed)
    }
}

impl<S: BlockStore> BalancedShard for ShardHandle<S> {
    fn request_stats(&self, reply: oneshot::Sender<ShardStats>) {
        // A send failure means the shard already stopped; the balancer sees
        // the dropped reply and skips it.
        let _ = self.jobs.send(Box::new(move |cache| {
            let _ = reply.send(cache.stats());
        }));
    }

    fn apply_limit(&self, update: LimitUpdate) {
        let _ = self
            .jobs
            .send(Box::new(move |cache| cache.apply_limit(update)));
    }

    fn take_wake_flag(&self) -> bool {
        self.wake.swap(false, Ordering::Relaxed)
    }
}

/// A scope of pinned pages belonging to one logical operation.
///
/// Every page the transaction touches stays pinned (and therefore
/// unevictable) until the transaction is dropped. Pins are held as tokens
/// naming the exact page instance, so a block deleted and recreated by
/// another transaction is never affected by this one's releases.
pub struct CacheTransaction<S: BlockStore> {
    shard: Arc<ShardHandle<S>>,
    priority: IoPriority,
    pinned: Vec<PinToken>,
}

impl<S: BlockStore> CacheTransaction<S> {
    /// Fetch `block`, loading it from the store on a miss, and pin it.
    pub async fn acquire(&mut self, block: BlockId) -> Result<PageData, crate::AcquireError> {
        let (tx, rx) = oneshot::channel();
        let priority = self.priority;
        self.shard
            .send(Box::new(move |cache| cache.acquire(block, priority, tx)))?;
        let (data, pin) = Self::wait(rx).await?;
        self.pinned.push(pin);
        Ok(data)
    }

    /// Replace the contents of `block`, creating it if needed, and pin it.
    pub async fn write(
        &mut self,
        block: BlockId,
        data: impl Into<PageData>,
    ) -> Result<(), crate::AcquireError> {
        let data = data.into();
        let (tx, rx) = oneshot::channel();
        self.shard
            .send(Box::new(move |cache| cache.write(block, data, tx)))?;
        let pin = Self::wait(rx).await?;
        self.pinned.push(pin);
        Ok(())
    }

    /// Drop `block` from the cache without writing it back.
    pub async fn delete(&mut self, block: BlockId) -> Result<(), crate::AcquireError> {
        let (tx, rx) = oneshot::channel();
        self.shard
            .send(Box::new(move |cache| cache.delete(block, tx)))?;
        Self::wait(rx).await
    }

    /// Reserve a fresh block id in the backing store.
    pub async fn allocate(&self) -> io::Result<BlockId> {
        self.shard.store.allocate_block(self.priority).await
    }

    async fn wait<T>(rx: oneshot::Receiver<Result<T, crate::AcquireError>>) -> Result<T, crate::AcquireError> {
        rx.await.map_err(|_| crate::AcquireError::ShardClosed)?
    }
}

impl<S: BlockStore> Drop for CacheTransaction<S> {
    fn drop(&mut self) {
        for pin in self.pinned.drain(..) {
            // Unpins during shard shutdown have nowhere to go; the shard's
            // state dies with it.
            let _ = self.shard.send(Box::new(move |cache| cache.unpin(pin)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::DummyCacheBalancer;
    use crate::storage::MemoryStore;

    fn shard(limit: u64) -> (Arc<ShardHandle<MemoryStore>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let balancer = DummyCacheBalancer::new(limit);
        let config = CacheConfig {
            read_ahead_blocks: 0,
            ..CacheConfig::default()
        };
        let handle = spawn_shard(config, store.clone(), &balancer);
        (handle, store)
    }

    #[tokio::test]
    async fn test_transaction_reads_what_it_wrote() {
        let (shard, store) = shard(1 << 20);
        let account = CacheAccount::new(IoPriority::DEFAULT);

        let mut txn = shard.begin(&account);
        let block = txn.allocate().await.unwrap();
        txn.write(block, vec![7u8; 128]).await.unwrap();
        let data = txn.acquire(block).await.unwrap();
        assert_eq!(&data[..], &[7u8; 128]);
        // Writes only hit the store under memory pressure.
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_pins() {
        let (shard, store) = shard(1 << 20);
        store.insert_block(BlockId(0), vec![1u8; 64]);
        let account = CacheAccount::new(IoPriority::DEFAULT);

        let mut txn = shard.begin(&account);
        txn.acquire(BlockId(0)).await.unwrap();
        assert!(shard.is_unevictable(BlockId(0)).await.unwrap());

        drop(txn);
        // The unpin travels through the shard; a stats round trip after it
        // observes the page already released.
        shard.stats().await.unwrap();
        assert!(!shard.is_unevictable(BlockId(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_recreated_block_keeps_foreign_pins_intact() {
        let (shard, _store) = shard(1 << 20);
        let account = CacheAccount::new(IoPriority::DEFAULT);

        let mut txn_a = shard.begin(&account);
        txn_a.write(BlockId(0), vec![1u8; 64]).await.unwrap();

        // Another transaction retires the block and writes a fresh one under
        // the same id. Its pin belongs to the new page instance.
        let mut txn_b = shard.begin(&account);
        txn_b.delete(BlockId(0)).await.unwrap();
        txn_b.write(BlockId(0), vec![2u8; 64]).await.unwrap();

        // Releasing the stale pin must not unpin the page txn_b holds.
        drop(txn_a);
        shard.stats().await.unwrap();
        assert!(shard.is_unevictable(BlockId(0)).await.unwrap());

        drop(txn_b);
        shard.stats().await.unwrap();
        assert!(!shard.is_unevictable(BlockId(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_shard_stops_once_handles_drop() {
        let (shard, store) = shard(1 << 20);
        store.insert_block(BlockId(0), vec![1u8; 64]);
        let account = CacheAccount::new(IoPriority::DEFAULT);

        let mut txn = shard.begin(&account);
        txn.acquire(BlockId(0)).await.unwrap();
        drop(txn);
        drop(shard);

        // No handle remains, so a fresh shard on the same store is the only
        // way back in; the old task has exited and freed its pages.
        let balancer = DummyCacheBalancer::new(1 << 20);
        let revived = spawn_shard(CacheConfig::default(), store.clone(), &balancer);
        assert_eq!(revived.stats().await.unwrap().in_memory_size, 0);
    }

    #[tokio::test]
    async fn test_stats_report_activity() {
        let (shard, _store) = shard(1 << 20);
        let account = CacheAccount::new(IoPriority::DEFAULT);

        let mut txn = shard.begin(&account);
        txn.write(BlockId(0), vec![0u8; 300]).await.unwrap();
        txn.write(BlockId(1), vec![0u8; 100]).await.unwrap();
        drop(txn);

        let stats = shard.stats().await.unwrap();
        assert_eq!(stats.bytes_loaded, 400);
        assert_eq!(stats.in_memory_size, 400);
        assert_eq!(stats.access_count, 2);
    }
}
