use std::sync::Arc;

use crate::bag::BagKind;

/// Identifier of one on-disk block within the backing store.
///
/// The cache treats this as an opaque token; allocation and layout of blocks
/// belong to the storage engine behind the [crate::storage::BlockStore] seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

/// Stable arena index of a [Page], valid until the page is deleted.
pub(crate) type PageId = usize;

/// Shared, immutable snapshot of a page's contents.
pub type PageData = Arc<[u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Load progress of a page's data buffer.
pub enum LoadState {
    /// No data buffer is attached, either because the page was just created
    /// or because it has been evicted and unloaded.
    NotLoaded,
    /// A read from the block store is in flight.
    Loading,
    /// The data buffer is resident in memory.
    Loaded,
}

/// Access-order token handed out by the evicter's countdown clock.
///
/// The clock starts just below `u64::MAX` and decrements, so older pages carry
/// numerically *larger* raw tokens, and a clock that drains down to the low
/// watermark is detected instead of silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessTime(pub(crate) u64);

impl AccessTime {
    /// Marker for a page that has not been stamped by the clock yet.
    pub(crate) const UNSET: AccessTime = AccessTime(u64::MAX);
}

/// The in-memory representation of one on-disk block.
///
/// Pages are owned exclusively by the page arena inside the cache; the
/// evicter only ever refers to them by their stable [PageId] and drives all
/// bag-membership transitions.
pub(crate) struct Page {
    block: BlockId,
    state: LoadState,
    data: Option<PageData>,
    dirty: bool,
    ever_backed: bool,
    pin_count: u32,
    writeback_pending: bool,
    pub(crate) bag: BagKind,
    pub(crate) access_time: AccessTime,
}

impl Page {
    /// Create a fresh, empty page for `block`.
    ///
    /// The page starts `NotLoaded` with no data attached; the evicter stamps
    /// its access token when the page is registered.
    pub(crate) fn new(block: BlockId) -> Self {
        Self {
            block,
            state: LoadState::NotLoaded,
            data: None,
            dirty: false,
            ever_backed: false,
            pin_count: 0,
            writeback_pending: false,
            bag: BagKind::Unevictable,
            access_time: AccessTime::UNSET,
        }
    }

    #[inline]
    pub(crate) fn block(&self) -> BlockId {
        self.block
    }

    #[inline]
    pub(crate) fn state(&self) -> LoadState {
        self.state
    }

    #[inline]
    /// Current byte size of the page, `0` while no buffer is attached.
    pub(crate) fn size(&self) -> u64 {
        self.data.as_ref().map(|data| data.len() as u64).unwrap_or(0)
    }

    #[inline]
    pub(crate) fn data(&self) -> Option<&PageData> {
        self.data.as_ref()
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    /// Whether the page's contents have ever been durably persisted.
    ///
    /// A clean, ever-backed page is cheap to evict; a page that was never
    /// flushed needs a writeback first.
    pub(crate) fn is_ever_backed(&self) -> bool {
        self.ever_backed
    }

    #[inline]
    pub(crate) fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    #[inline]
    pub(crate) fn writeback_pending(&self) -> bool {
        self.writeback_pending
    }

    pub(crate) fn set_writeback_pending(&mut self, pending: bool) {
        self.writeback_pending = pending;
    }

    pub(crate) fn begin_load(&mut self) {
        debug_assert_eq!(self.state, LoadState::NotLoaded, "page already loading or loaded");
        self.state = LoadState::Loading;
    }

    /// Attach a buffer that arrived from the block store.
    pub(crate) fn complete_load(&mut self, data: PageData) {
        debug_assert_eq!(self.state, LoadState::Loading, "load completion for idle page");
        self.state = LoadState::Loaded;
        self.data = Some(data);
        self.dirty = false;
        self.ever_backed = true;
    }

    /// Replace the page's contents with freshly written data.
    ///
    /// Valid in any load state: writing to a not-yet-loaded or evicted page
    /// simply supersedes whatever is on disk.
    pub(crate) fn write(&mut self, data: PageData) {
        self.state = LoadState::Loaded;
        self.data = Some(data);
        self.dirty = true;
    }

    /// Record that the current contents were flushed to stable storage.
    ///
    /// `flushed` is the buffer that was handed to the store; if the page was
    /// re-written while the flush was in flight the dirty flag stays set.
    pub(crate) fn complete_writeback(&mut self, flushed: &PageData) {
        self.ever_backed = true;
        self.writeback_pending = false;
        if let Some(current) = &self.data
            && Arc::ptr_eq(current, flushed)
        {
            self.dirty = false;
        }
    }

    /// Drop the data buffer as part of an eviction.
    pub(crate) fn unload(&mut self) {
        debug_assert!(!self.is_pinned(), "unload of a pinned page");
        self.state = LoadState::NotLoaded;
        self.data = None;
        self.dirty = false;
    }

    pub(crate) fn pin(&mut self) {
        self.pin_count += 1;
    }

    /// Release one pin. Returns `true` if this was the last holder.
    pub(crate) fn unpin(&mut self) -> bool {
        debug_assert!(self.pin_count > 0, "unpin of an unpinned page");
        self.pin_count = self.pin_count.saturating_sub(1);
        self.pin_count == 0
    }
}
