use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use slab::Slab;
use tokio::sync::{mpsc, oneshot};

use crate::account::IoPriority;
use crate::config::CacheConfig;
use crate::evicter::{Evicter, LimitUpdate, ShardStats};
use crate::page::{AccessTime, BlockId, LoadState, Page, PageData, PageId};
use crate::storage::BlockStore;

/// A unit of work executed on the shard that owns the cache.
pub(crate) type ShardJob<S> = Box<dyn FnOnce(&mut PageCache<S>) + Send>;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, AcquireError>>;

/// Proof of one pin on one specific page instance.
///
/// A block id alone cannot identify a pin: deleting a block and recreating
/// it makes a new page under the same id, and a stale release by block id
/// would consume a pin belonging to the new page. The access stamp is handed
/// out once per page by the countdown clock and never reused, so a token
/// whose stamp no longer matches the slot is recognized as stale and
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PinToken {
    page: PageId,
    stamp: AccessTime,
}

type BlockIndex = hashbrown::HashMap<BlockId, PageId, foldhash::fast::RandomState>;
type Waiters =
    hashbrown::HashMap<PageId, Vec<Reply<(PageData, PinToken)>>, foldhash::fast::RandomState>;

#[derive(Debug, Clone, thiserror::Error)]
/// Errors surfaced to the transaction layer when acquiring a page.
pub enum AcquireError {
    #[error("block i/o failed: {0}")]
    Io(Arc<io::Error>),
    #[error("block was deleted while the acquisition was in flight")]
    BlockDeleted,
    #[error("cache shard is shut down")]
    ShardClosed,
}

/// The page cache: the exclusive owner of all [Page] objects for one shard.
///
/// The cache runs inside its shard's single task, so every method executes
/// serially on that task; the evicter's bookkeeping is never observed in an
/// inconsistent state by same-shard code. I/O is started on separate tasks
/// and re-enters the shard through its job channel.
pub(crate) struct PageCache<S> {
    store: Arc<S>,
    config: CacheConfig,
    jobs: mpsc::WeakUnboundedSender<ShardJob<S>>,
    wake: Arc<AtomicBool>,
    evicter: Evicter,
    pages: Slab<Page>,
    index: BlockIndex,
    waiters: Waiters,
    activity_since_wake: u64,
}

impl<S: BlockStore> PageCache<S> {
    pub(crate) fn new(
        config: CacheConfig,
        initial_memory_limit: u64,
        read_ahead_ok: bool,
        store: Arc<S>,
        jobs: mpsc::WeakUnboundedSender<ShardJob<S>>,
        wake: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            config,
            jobs,
            wake,
            evicter: Evicter::new(initial_memory_limit, read_ahead_ok),
            pages: Slab::new(),
            index: BlockIndex::default(),
            waiters: Waiters::default(),
            activity_since_wake: 0,
        }
    }

    /// Pin `block` and deliver its contents and pin token to `reply`.
    ///
    /// Creates and loads the page on a miss; joins the in-flight load on a
    /// concurrent miss. The caller owns one pin either way and must release
    /// its token with [Self::unpin] exactly once.
    pub(crate) fn acquire(
        &mut self,
        block: BlockId,
        priority: IoPriority,
        reply: Reply<(PageData, PinToken)>,
    ) {
        self.note_activity();

        let Some(&id) = self.index.get(&block) else {
            let id = self.pages.insert(Page::new(block));
            self.index.insert(block, id);
            self.evicter.add_not_yet_loaded(&mut self.pages, id);
            self.pages[id].pin();
            self.start_load(id, priority);
            self.waiters.entry(id).or_default().push(reply);
            self.maybe_read_ahead(block, priority);
            return;
        };

        self.evicter.record_access();
        self.pages[id].pin();
        self.evicter.change_to_correct_eviction_bag(&mut self.pages, id);

        match self.pages[id].state() {
            LoadState::Loaded => {
                let data = self.pages[id].data().cloned();
                debug_assert!(data.is_some(), "loaded page without a buffer");
                if let Some(data) = data {
                    let token = self.pin_token(id);
                    let _ = reply.send(Ok((data, token)));
                }
            },
            LoadState::Loading => {
                self.waiters.entry(id).or_default().push(reply);
            },
            LoadState::NotLoaded => {
                // Evicted earlier; re-fetch from the store.
                self.start_load(id, priority);
                self.waiters.entry(id).or_default().push(reply);
            },
        }
    }

    /// Release the pin behind `token`.
    ///
    /// Tolerates stale tokens: a failed load or a delete may have dropped
    /// the page (or recycled its slot for another block) before the holder
    /// got around to releasing, in which case the pin died with the page.
    pub(crate) fn unpin(&mut self, token: PinToken) {
        let Some(page) = self.pages.get_mut(token.page) else {
            return;
        };
        if page.access_time != token.stamp {
            return;
        }
        if page.unpin() {
            self.evicter.move_unevictable_to_evictable(&mut self.pages, token.page);
        }
    }

    /// Replace the contents of `block`, creating the page if needed.
    ///
    /// The written page is pinned for the caller and becomes dirty; a write
    /// supersedes any load in flight for the same block.
    pub(crate) fn write(&mut self, block: BlockId, data: PageData, reply: Reply<PinToken>) {
        self.note_activity();

        let id = match self.index.get(&block) {
            Some(&id) => {
                // Registration already counts the first access, so only
                // touches of a tracked page are counted here.
                self.evicter.record_access();
                id
            },
            None => {
                let id = self.pages.insert(Page::new(block));
                self.index.insert(block, id);
                self.evicter.add_not_yet_loaded(&mut self.pages, id);
                id
            },
        };

        let page = &mut self.pages[id];
        page.pin();
        let old_bytes = page.size();
        let was_loading = page.state() == LoadState::Loading;
        page.write(data.clone());
        let token = self.pin_token(id);

        self.evicter.change_to_correct_eviction_bag(&mut self.pages, id);
        let writeback = self.evicter.note_resized(&mut self.pages, id, old_bytes);
        self.start_writeback_if(writeback);

        if was_loading {
            // Readers waiting on the superseded load get the new contents.
            self.wake_waiters(id, Ok((data, token)));
        }

        let _ = reply.send(Ok(token));
    }

    /// Logically delete `block`, dropping its page entirely.
    pub(crate) fn delete(&mut self, block: BlockId, reply: Reply<()>) {
        self.note_activity();

        if let Some(id) = self.index.remove(&block) {
            self.evicter.remove_page(&self.pages, id);
            self.wake_waiters(id, Err(AcquireError::BlockDeleted));
            self.pages.remove(id);
        }

        let _ = reply.send(Ok(()));
    }

    /// Whether `block` currently sits in the unevictable bag.
    pub(crate) fn page_is_in_unevictable_bag(&self, block: BlockId) -> bool {
        self.index
            .get(&block)
            .is_some_and(|&id| self.evicter.page_is_in_unevictable_bag(&self.pages[id]))
    }

    pub(crate) fn stats(&self) -> ShardStats {
        self.evicter.stats()
    }

    /// Install a new memory budget pushed down by the balancer.
    pub(crate) fn apply_limit(&mut self, update: LimitUpdate) {
        let writeback = self.evicter.update_memory_limit(&mut self.pages, update);
        self.start_writeback_if(writeback);
    }

    fn start_load(&mut self, id: PageId, priority: IoPriority) {
        let page = &mut self.pages[id];
        page.begin_load();
        let block = page.block();

        let store = self.store.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let result = store.read_block(block, priority).await;
            // A failed upgrade means the shard shut down mid-read; the
            // completion is dropped silently.
            let Some(jobs) = jobs.upgrade() else {
                return;
            };
            let _ = jobs.send(Box::new(move |cache| cache.load_complete(id, block, result)));
        });
    }

    fn load_complete(&mut self, id: PageId, block: BlockId, result: io::Result<PageData>) {
        // Stale completion: the page may have been deleted (and its arena
        // slot reused) or superseded by a write while the read ran.
        if self.index.get(&block) != Some(&id) {
            return;
        }
        if self.pages[id].state() != LoadState::Loading {
            return;
        }

        match result {
            Ok(data) => {
                self.pages[id].complete_load(data.clone());
                let token = self.pin_token(id);
                let writeback = self.evicter.add_now_loaded(&mut self.pages, id);
                self.start_writeback_if(writeback);
                self.wake_waiters(id, Ok((data, token)));
            },
            Err(error) => {
                tracing::warn!(block = block.0, error = %error, "page load failed");
                self.wake_waiters(id, Err(AcquireError::Io(Arc::new(error))));
                // Drop the page; outstanding pins release through the
                // tolerant unpin path.
                self.index.remove(&block);
                self.evicter.remove_page(&self.pages, id);
                self.pages.remove(id);
            },
        }
    }

    fn start_writeback_if(&mut self, id: Option<PageId>) {
        let Some(id) = id else {
            return;
        };
        let page = &self.pages[id];
        let block = page.block();
        let Some(data) = page.data().cloned() else {
            debug_assert!(false, "writeback selected for a page with no buffer");
            return;
        };

        let store = self.store.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let result = store
                .write_block(block, data.clone(), IoPriority::DEFAULT)
                .await;
            let Some(jobs) = jobs.upgrade() else {
                return;
            };
            let _ = jobs.send(Box::new(move |cache| {
                cache.writeback_complete(id, block, data, result)
            }));
        });
    }

    fn writeback_complete(
        &mut self,
        id: PageId,
        block: BlockId,
        flushed: PageData,
        result: io::Result<()>,
    ) {
        if self.index.get(&block) != Some(&id) {
            return;
        }

        match result {
            Ok(()) => {
                self.pages[id].complete_writeback(&flushed);
                let writeback = self.evicter.writeback_complete(&mut self.pages, id);
                self.start_writeback_if(writeback);
            },
            Err(error) => {
                tracing::error!(block = block.0, error = %error, "writeback failed, page stays dirty");
                self.pages[id].set_writeback_pending(false);
            },
        }
    }

    /// Speculatively load the blocks following a missed one.
    ///
    /// Read-ahead pages are never pinned, so they land straight in an
    /// evictable bag once loaded and are the first to go under pressure.
    fn maybe_read_ahead(&mut self, block: BlockId, priority: IoPriority) {
        if self.config.read_ahead_blocks == 0 || !self.evicter.read_ahead_ok() {
            return;
        }
        if self.evicter.in_memory_size() >= self.evicter.memory_limit() {
            return;
        }

        for offset in 1..=self.config.read_ahead_blocks {
            let Some(next) = block.0.checked_add(offset) else {
                break;
            };
            let next = BlockId(next);
            if self.index.contains_key(&next) {
                continue;
            }
            let id = self.pages.insert(Page::new(next));
            self.index.insert(next, id);
            self.evicter.add_not_yet_loaded(&mut self.pages, id);
            self.start_load(id, priority);
        }
    }

    fn wake_waiters(&mut self, id: PageId, result: Result<(PageData, PinToken), AcquireError>) {
        let Some(waiters) = self.waiters.remove(&id) else {
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn pin_token(&self, id: PageId) -> PinToken {
        PinToken {
            page: id,
            stamp: self.pages[id].access_time,
        }
    }

    /// Count one access toward the shard's balancer wake flag.
    ///
    /// The flag is a plain relaxed store: the balancer's read/clear may race
    /// it, which only ever delays a wake-up by one timer tick.
    fn note_activity(&mut self) {
        self.activity_since_wake += 1;
        if self.activity_since_wake >= self.config.rebalance_access_count_threshold {
            self.activity_since_wake = 0;
            self.wake.store(true, Ordering::Relaxed);
        }
    }
}
