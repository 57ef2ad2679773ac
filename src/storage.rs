use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::account::IoPriority;
use crate::page::{BlockId, PageData};

type BlockMap = hashbrown::HashMap<BlockId, PageData, foldhash::fast::RandomState>;

/// The storage seam the cache loads from and flushes to.
///
/// Implemented by the serializer / storage engine that owns the on-disk
/// format; the cache never issues raw I/O itself. Every operation carries the
/// [IoPriority] of the transaction it is performed for.
pub trait BlockStore: Send + Sync + 'static {
    /// Read the current contents of a block.
    fn read_block(
        &self,
        block: BlockId,
        priority: IoPriority,
    ) -> impl Future<Output = io::Result<PageData>> + Send;

    /// Persist new contents for a block.
    fn write_block(
        &self,
        block: BlockId,
        data: PageData,
        priority: IoPriority,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Reserve a fresh, unused block id.
    fn allocate_block(
        &self,
        priority: IoPriority,
    ) -> impl Future<Output = io::Result<BlockId>> + Send;
}

/// In-memory [BlockStore] used by tests and examples.
///
/// Optional artificial latency makes load/writeback interleavings
/// reproducible in tests without a real disk underneath.
pub struct MemoryStore {
    blocks: Mutex<BlockMap>,
    next_block: AtomicU64,
    latency: Option<Duration>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_latency(None)
    }

    pub fn with_latency(latency: Option<Duration>) -> Self {
        Self {
            blocks: Mutex::new(BlockMap::default()),
            next_block: AtomicU64::new(0),
            latency,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Seed a block with contents, bypassing the I/O counters.
    pub fn insert_block(&self, block: BlockId, data: impl Into<PageData>) {
        let mut blocks = self.blocks.lock();
        blocks.insert(block, data.into());
        let floor = block.0 + 1;
        self.next_block.fetch_max(floor, Ordering::Relaxed);
    }

    pub fn block(&self, block: BlockId) -> Option<PageData> {
        self.blocks.lock().get(&block).cloned()
    }

    #[inline]
    /// Total reads served, including failed lookups.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStore {
    async fn read_block(&self, block: BlockId, _priority: IoPriority) -> io::Result<PageData> {
        self.simulate_latency().await;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().get(&block).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("block {} does not exist", block.0),
            )
        })
    }

    async fn write_block(
        &self,
        block: BlockId,
        data: PageData,
        _priority: IoPriority,
    ) -> io::Result<()> {
        self.simulate_latency().await;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert(block, data);
        Ok(())
    }

    async fn allocate_block(&self, _priority: IoPriority) -> io::Result<BlockId> {
        Ok(BlockId(self.next_block.fetch_add(1, Ordering::Relaxed)))
    }
}
