use slab::Slab;

use crate::bag::{BagKind, EvictionBag};
use crate::page::{AccessTime, LoadState, Page, PageId};

/// Countdown clock start value, one below the [AccessTime::UNSET] marker.
const ACCESS_CLOCK_START: u64 = u64::MAX - 1;
/// A clock that drains this far has handed out an implausible number of
/// tokens; treated as rollover.
const ACCESS_CLOCK_LOW_WATERMARK: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Activity snapshot reported to the balancer.
pub struct ShardStats {
    /// Signed byte delta brought into memory since the last report. May go
    /// negative when a report races a shrinking rewrite.
    pub bytes_loaded: i64,
    /// Page accesses since the last report.
    pub access_count: u64,
    /// Bytes currently resident across the live bags.
    pub in_memory_size: u64,
    /// The memory limit currently in force.
    pub memory_limit: u64,
}

#[derive(Debug, Clone, Copy)]
/// A new memory budget pushed down by the balancer.
pub struct LimitUpdate {
    /// The replacement memory limit in bytes.
    pub memory_limit: u64,
    /// Bytes-loaded activity the balancer has accounted for; subtracted so
    /// the next report only carries new activity.
    pub bytes_loaded_accounted: i64,
    /// Accesses the balancer has accounted for.
    pub accesses_accounted: u64,
    /// Whether speculative read-ahead is still permitted.
    pub read_ahead_ok: bool,
}

/// Per-shard eviction bookkeeping.
///
/// The evicter owns the four eviction bags and the memory limit, and runs the
/// "evict until under budget" sweep after every load and every limit change.
/// It never owns pages: the arena does, and the evicter refers to members by
/// their stable id only.
///
/// The limit is soft. When nothing safe to evict remains the evicter simply
/// runs over budget and returns; callers must tolerate transient overage.
pub(crate) struct Evicter {
    memory_limit: u64,
    access_clock: u64,
    bytes_loaded: i64,
    access_count: u64,
    read_ahead_ok: bool,
    evict_in_progress: bool,
    unevictable: EvictionBag,
    evictable_disk_backed: EvictionBag,
    evictable_unbacked: EvictionBag,
    evicted: EvictionBag,
}

impl Evicter {
    pub(crate) fn new(memory_limit: u64, read_ahead_ok: bool) -> Self {
        Self {
            memory_limit,
            access_clock: ACCESS_CLOCK_START,
            bytes_loaded: 0,
            access_count: 0,
            read_ahead_ok,
            evict_in_progress: false,
            unevictable: EvictionBag::new(BagKind::Unevictable),
            evictable_disk_backed: EvictionBag::new(BagKind::EvictableDiskBacked),
            evictable_unbacked: EvictionBag::new(BagKind::EvictableUnbacked),
            evicted: EvictionBag::new(BagKind::Evicted),
        }
    }

    /// Hand out the next access-order token.
    pub(crate) fn next_access_time(&mut self) -> AccessTime {
        debug_assert!(
            self.access_clock > ACCESS_CLOCK_LOW_WATERMARK,
            "access clock rollover"
        );
        self.access_count += 1;
        let token = AccessTime(self.access_clock);
        self.access_clock -= 1;
        token
    }

    /// Count an access to an already-tracked page.
    ///
    /// Accesses never re-stamp the page's token: candidate ordering stays
    /// plain insertion order without recency promotion.
    pub(crate) fn record_access(&mut self) {
        self.access_count += 1;
    }

    #[inline]
    pub(crate) fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    #[inline]
    pub(crate) fn read_ahead_ok(&self) -> bool {
        self.read_ahead_ok
    }

    #[inline]
    /// Bytes resident in memory: everything outside the evicted bag.
    pub(crate) fn in_memory_size(&self) -> u64 {
        self.unevictable.total_bytes()
            + self.evictable_disk_backed.total_bytes()
            + self.evictable_unbacked.total_bytes()
    }

    pub(crate) fn stats(&self) -> ShardStats {
        ShardStats {
            bytes_loaded: self.bytes_loaded,
            access_count: self.access_count,
            in_memory_size: self.in_memory_size(),
            memory_limit: self.memory_limit,
        }
    }

    pub(crate) fn page_is_in_unevictable_bag(&self, page: &Page) -> bool {
        page.bag == BagKind::Unevictable && self.unevictable.contains(page.access_time)
    }

    /// Register a freshly created page.
    ///
    /// The page is pinned by its creator, so it starts in the unevictable bag
    /// with no memory accounted yet (size unknown until the load finishes).
    pub(crate) fn add_not_yet_loaded(&mut self, pages: &mut Slab<Page>, id: PageId) {
        let page = &mut pages[id];
        debug_assert_eq!(page.access_time, AccessTime::UNSET, "page already tracked");
        let token = self.next_access_time();
        let bytes = page.size();
        page.access_time = token;
        page.bag = BagKind::Unevictable;
        self.unevictable.insert(token, id, bytes);
    }

    /// Record a completed load and run the eviction sweep.
    ///
    /// Together with [Self::update_memory_limit] this is the only trigger for
    /// `evict_if_necessary`: every load is a potential overage event.
    ///
    /// Returns a page that needs a writeback before eviction can continue, if
    /// the sweep ran out of disk-backed candidates.
    pub(crate) fn add_now_loaded(
        &mut self,
        pages: &mut Slab<Page>,
        id: PageId,
    ) -> Option<PageId> {
        let page = &pages[id];
        let bytes = page.size();
        let token = page.access_time;
        let bag = page.bag;
        self.bytes_loaded += bytes as i64;
        self.bag_mut(bag).update_size(token, bytes);
        self.change_to_correct_eviction_bag(pages, id);
        self.evict_if_necessary(pages)
    }

    /// Re-account a page whose buffer was replaced, e.g. by a write.
    pub(crate) fn note_resized(
        &mut self,
        pages: &mut Slab<Page>,
        id: PageId,
        old_bytes: u64,
    ) -> Option<PageId> {
        let page = &pages[id];
        let bytes = page.size();
        let token = page.access_time;
        let bag = page.bag;
        self.bytes_loaded += bytes as i64 - old_bytes as i64;
        self.bag_mut(bag).update_size(token, bytes);
        self.change_to_correct_eviction_bag(pages, id);
        self.evict_if_necessary(pages)
    }

    /// Reclassify a page whose last pin was just released.
    pub(crate) fn move_unevictable_to_evictable(
        &mut self,
        pages: &mut Slab<Page>,
        id: PageId,
    ) {
        debug_assert_eq!(pages[id].bag, BagKind::Unevictable);
        self.change_to_correct_eviction_bag(pages, id);
    }

    /// Move a page into the bag matching its pin, load, and backing state.
    pub(crate) fn change_to_correct_eviction_bag(
        &mut self,
        pages: &mut Slab<Page>,
        id: PageId,
    ) {
        let page = &pages[id];
        let target = Self::correct_bag(page);
        if target == page.bag {
            return;
        }

        let token = page.access_time;
        let bytes = page.size();
        let current = page.bag;
        let erased = self.bag_mut(current).erase(token);
        debug_assert!(erased.is_some(), "page missing from its {} bag", current.name());
        self.bag_mut(target).insert(token, id, bytes);
        pages[id].bag = target;
    }

    /// Unconditionally remove a page from whichever bag holds it.
    ///
    /// Safe to call mid-eviction: the sweep's reentrancy flag downgrades a
    /// missing membership from a contract violation to a no-op.
    pub(crate) fn remove_page(&mut self, pages: &Slab<Page>, id: PageId) {
        let page = &pages[id];
        let erased = self.bag_mut(page.bag).erase(page.access_time);
        debug_assert!(
            erased.is_some() || self.evict_in_progress,
            "removing a page that is not tracked"
        );
    }

    /// A writeback for `id` finished; reclassify and resume the sweep.
    pub(crate) fn writeback_complete(
        &mut self,
        pages: &mut Slab<Page>,
        id: PageId,
    ) -> Option<PageId> {
        self.change_to_correct_eviction_bag(pages, id);
        self.evict_if_necessary(pages)
    }

    /// Install a new memory budget pushed down by the balancer and run the
    /// eviction sweep against it.
    pub(crate) fn update_memory_limit(
        &mut self,
        pages: &mut Slab<Page>,
        update: LimitUpdate,
    ) -> Option<PageId> {
        self.memory_limit = update.memory_limit;
        self.bytes_loaded -= update.bytes_loaded_accounted;
        self.access_count = self.access_count.saturating_sub(update.accesses_accounted);
        self.read_ahead_ok = update.read_ahead_ok;
        self.evict_if_necessary(pages)
    }

    /// Evict disk-backed pages, oldest first, until under budget.
    ///
    /// When only unbacked pages remain the oldest one is selected for
    /// writeback and the sweep stops; [Self::writeback_complete] resumes it.
    /// When nothing reclaimable remains the overage is tolerated.
    fn evict_if_necessary(&mut self, pages: &mut Slab<Page>) -> Option<PageId> {
        if self.evict_in_progress {
            return None;
        }
        self.evict_in_progress = true;

        let mut writeback = None;
        while self.in_memory_size() > self.memory_limit {
            if let Some(id) = self.evictable_disk_backed.pick_oldest() {
                self.evict_page(pages, id);
                continue;
            }

            if let Some(id) = self.evictable_unbacked.pick_oldest() {
                let page = &mut pages[id];
                if !page.writeback_pending() {
                    page.set_writeback_pending(true);
                    writeback = Some(id);
                }
                // Eviction resumes once the flush completes.
                break;
            }

            tracing::debug!(
                in_memory = self.in_memory_size(),
                limit = self.memory_limit,
                "memory limit exceeded with nothing evictable"
            );
            break;
        }

        self.evict_in_progress = false;
        writeback
    }

    /// Unload one evictable disk-backed page in place.
    fn evict_page(&mut self, pages: &mut Slab<Page>, id: PageId) {
        let page = &mut pages[id];
        debug_assert_eq!(page.bag, BagKind::EvictableDiskBacked);
        debug_assert_eq!(page.state(), LoadState::Loaded);

        let token = page.access_time;
        let erased = self.evictable_disk_backed.erase(token);
        debug_assert!(erased.is_some());

        page.unload();
        page.bag = BagKind::Evicted;
        self.evicted.insert(token, id, 0);
    }

    fn correct_bag(page: &Page) -> BagKind {
        if page.is_pinned() {
            return BagKind::Unevictable;
        }
        match page.state() {
            LoadState::Loading => BagKind::Unevictable,
            LoadState::NotLoaded => BagKind::Evicted,
            LoadState::Loaded => {
                if page.is_dirty() || !page.is_ever_backed() {
                    BagKind::EvictableUnbacked
                } else {
                    BagKind::EvictableDiskBacked
                }
            },
        }
    }

    fn bag_mut(&mut self, kind: BagKind) -> &mut EvictionBag {
        match kind {
            BagKind::Unevictable => &mut self.unevictable,
            BagKind::EvictableDiskBacked => &mut self.evictable_disk_backed,
            BagKind::EvictableUnbacked => &mut self.evictable_unbacked,
            BagKind::Evicted => &mut self.evicted,
        }
    }

    #[cfg(test)]
    pub(crate) fn bag_len(&self, kind: BagKind) -> usize {
        match kind {
            BagKind::Unevictable => self.unevictable.len(),
            BagKind::EvictableDiskBacked => self.evictable_disk_backed.len(),
            BagKind::EvictableUnbacked => self.evictable_unbacked.len(),
            BagKind::Evicted => self.evicted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::page::BlockId;

    /// Mirrors the cache's load path: create, pin, load, account.
    fn add_loaded(
        evicter: &mut Evicter,
        pages: &mut Slab<Page>,
        block: u64,
        bytes: usize,
    ) -> (PageId, Option<PageId>) {
        let id = pages.insert(Page::new(BlockId(block)));
        evicter.add_not_yet_loaded(pages, id);
        pages[id].pin();
        pages[id].begin_load();
        pages[id].complete_load(Arc::from(vec![0u8; bytes]));
        let writeback = evicter.add_now_loaded(pages, id);
        (id, writeback)
    }

    fn release(evicter: &mut Evicter, pages: &mut Slab<Page>, id: PageId) {
        if pages[id].unpin() {
            evicter.move_unevictable_to_evictable(pages, id);
        }
    }

    #[test]
    fn test_oldest_disk_backed_page_is_evicted_first() {
        let mut pages = Slab::new();
        let mut evicter = Evicter::new(1000, true);

        let (first, _) = add_loaded(&mut evicter, &mut pages, 0, 400);
        release(&mut evicter, &mut pages, first);
        let (second, _) = add_loaded(&mut evicter, &mut pages, 1, 400);
        release(&mut evicter, &mut pages, second);
        assert_eq!(evicter.in_memory_size(), 800);

        let (third, writeback) = add_loaded(&mut evicter, &mut pages, 2, 400);
        assert!(writeback.is_none());
        release(&mut evicter, &mut pages, third);

        // The third load pushed the shard to 1200 bytes; only the
        // first-inserted page should have been reclaimed.
        assert_eq!(evicter.in_memory_size(), 800);
        assert_eq!(pages[first].bag, BagKind::Evicted);
        assert_eq!(pages[first].state(), LoadState::NotLoaded);
        assert_eq!(pages[second].bag, BagKind::EvictableDiskBacked);
        assert_eq!(pages[third].bag, BagKind::EvictableDiskBacked);
    }

    #[test]
    fn test_pinned_pages_are_never_reclaimed() {
        let mut pages = Slab::new();
        let mut evicter = Evicter::new(500, true);

        let (first, _) = add_loaded(&mut evicter, &mut pages, 0, 400);
        let (second, _) = add_loaded(&mut evicter, &mut pages, 1, 400);

        // Both pages pinned: over budget with nothing evictable.
        assert_eq!(evicter.in_memory_size(), 800);
        assert!(evicter.page_is_in_unevictable_bag(&pages[first]));
        assert!(evicter.page_is_in_unevictable_bag(&pages[second]));

        release(&mut evicter, &mut pages, first);
        let update = LimitUpdate {
            memory_limit: 500,
            bytes_loaded_accounted: 0,
            accesses_accounted: 0,
            read_ahead_ok: true,
        };
        assert!(evicter.update_memory_limit(&mut pages, update).is_none());
        assert_eq!(evicter.in_memory_size(), 400);
        assert_eq!(pages[first].bag, BagKind::Evicted);
    }

    #[test]
    fn test_eviction_is_monotonic_until_under_limit() {
        let mut pages = Slab::new();
        let mut evicter = Evicter::new(u64::MAX, true);

        let mut ids = Vec::new();
        for block in 0..32 {
            let (id, _) = add_loaded(&mut evicter, &mut pages, block, 100);
            release(&mut evicter, &mut pages, id);
            ids.push(id);
        }
        assert_eq!(evicter.in_memory_size(), 3200);

        let mut previous = evicter.in_memory_size();
        for limit in [2500, 1200, 700, 0] {
            let update = LimitUpdate {
                memory_limit: limit,
                bytes_loaded_accounted: 0,
                accesses_accounted: 0,
                read_ahead_ok: true,
            };
            evicter.update_memory_limit(&mut pages, update);
            let size = evicter.in_memory_size();
            assert!(size <= previous);
            assert!(size <= limit);
            previous = size;
        }
        assert_eq!(evicter.bag_len(BagKind::Evicted), 32);
    }

    #[test]
    fn test_unbacked_pages_need_writeback_before_eviction() {
        let mut pages = Slab::new();
        let mut evicter = Evicter::new(1000, true);

        let id = pages.insert(Page::new(BlockId(9)));
        evicter.add_not_yet_loaded(&mut pages, id);
        pages[id].pin();
        let old = pages[id].size();
        pages[id].write(Arc::from(vec![1u8; 600]));
        assert!(evicter.note_resized(&mut pages, id, old).is_none());
        release(&mut evicter, &mut pages, id);
        assert_eq!(pages[id].bag, BagKind::EvictableUnbacked);

        // Shrinking the budget selects the dirty page for writeback instead
        // of evicting it outright.
        let update = LimitUpdate {
            memory_limit: 100,
            bytes_loaded_accounted: 0,
            accesses_accounted: 0,
            read_ahead_ok: true,
        };
        let writeback = evicter.update_memory_limit(&mut pages, update);
        assert_eq!(writeback, Some(id));
        assert!(pages[id].writeback_pending());
        assert_eq!(evicter.in_memory_size(), 600);

        let flushed = pages[id].data().unwrap().clone();
        pages[id].complete_writeback(&flushed);
        assert!(evicter.writeback_complete(&mut pages, id).is_none());
        assert_eq!(pages[id].bag, BagKind::Evicted);
        assert_eq!(evicter.in_memory_size(), 0);
    }

    #[test]
    fn test_evicted_pages_leave_no_orphans() {
        let mut pages = Slab::new();
        let mut evicter = Evicter::new(0, true);

        let (id, _) = add_loaded(&mut evicter, &mut pages, 0, 256);
        release(&mut evicter, &mut pages, id);

        let update = LimitUpdate {
            memory_limit: 0,
            bytes_loaded_accounted: 0,
            accesses_accounted: 0,
            read_ahead_ok: true,
        };
        evicter.update_memory_limit(&mut pages, update);

        assert!(!evicter.page_is_in_unevictable_bag(&pages[id]));
        assert_eq!(evicter.bag_len(BagKind::Unevictable), 0);
        assert_eq!(evicter.bag_len(BagKind::EvictableDiskBacked), 0);
        assert_eq!(evicter.bag_len(BagKind::EvictableUnbacked), 0);
        assert_eq!(evicter.in_memory_size(), 0);
    }

    #[test]
    fn test_limit_update_consumes_accounted_activity() {
        let mut pages = Slab::new();
        let mut evicter = Evicter::new(10_000, true);

        let (id, _) = add_loaded(&mut evicter, &mut pages, 0, 500);
        release(&mut evicter, &mut pages, id);

        let before = evicter.stats();
        assert_eq!(before.bytes_loaded, 500);
        assert!(before.access_count > 0);

        let update = LimitUpdate {
            memory_limit: 10_000,
            bytes_loaded_accounted: before.bytes_loaded,
            accesses_accounted: before.access_count,
            read_ahead_ok: false,
        };
        evicter.update_memory_limit(&mut pages, update);

        let after = evicter.stats();
        assert_eq!(after.bytes_loaded, 0);
        assert_eq!(after.access_count, 0);
        assert!(!evicter.read_ahead_ok());
    }
}
