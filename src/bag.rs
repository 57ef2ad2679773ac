use std::collections::BTreeMap;

use crate::page::{AccessTime, PageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The eviction category a page currently belongs to.
///
/// Every page is a member of exactly one bag at any time; the evicter drives
/// all transitions between them.
pub enum BagKind {
    /// Pinned by an active transaction, or still waiting on a load; must not
    /// be reclaimed.
    Unevictable,
    /// Unpinned and durably persisted; cheapest to reclaim, no writeback
    /// needed.
    EvictableDiskBacked,
    /// Unpinned but holding not-yet-flushed data; needs a writeback before it
    /// can be reclaimed.
    EvictableUnbacked,
    /// Unloaded; the page object remains so the block can be re-fetched.
    Evicted,
}

impl BagKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            BagKind::Unevictable => "unevictable",
            BagKind::EvictableDiskBacked => "evictable_disk_backed",
            BagKind::EvictableUnbacked => "evictable_unbacked",
            BagKind::Evicted => "evicted",
        }
    }
}

/// An ordered bucket of pages sharing one eviction category.
///
/// Members are ordered by their access token, which is handed out once per
/// page by the evicter's countdown clock and never re-stamped on access, so
/// the ordering is plain insertion order. The byte total is maintained
/// incrementally on every mutation and never recomputed by scanning.
pub(crate) struct EvictionBag {
    kind: BagKind,
    members: BTreeMap<AccessTime, (PageId, u64)>,
    total_bytes: u64,
}

impl EvictionBag {
    pub(crate) fn new(kind: BagKind) -> Self {
        Self {
            kind,
            members: BTreeMap::new(),
            total_bytes: 0,
        }
    }

    /// Add a page to the bag.
    ///
    /// The access token must be unique across all bags, which the countdown
    /// clock guarantees: a page carries one token and sits in one bag.
    pub(crate) fn insert(&mut self, token: AccessTime, page: PageId, bytes: u64) {
        let previous = self.members.insert(token, (page, bytes));
        debug_assert!(
            previous.is_none(),
            "page double-registered in {} bag",
            self.kind.name(),
        );
        self.total_bytes += bytes;
    }

    /// Remove a page from the bag, returning its id and accounted size.
    pub(crate) fn erase(&mut self, token: AccessTime) -> Option<(PageId, u64)> {
        let (page, bytes) = self.members.remove(&token)?;
        self.total_bytes -= bytes;
        Some((page, bytes))
    }

    /// Re-account a member whose buffer changed size.
    pub(crate) fn update_size(&mut self, token: AccessTime, bytes: u64) {
        let Some((_, accounted)) = self.members.get_mut(&token) else {
            debug_assert!(false, "size update for page not in {} bag", self.kind.name());
            return;
        };
        self.total_bytes -= *accounted;
        self.total_bytes += bytes;
        *accounted = bytes;
    }

    #[inline]
    /// The member with the earliest access order, or `None` if empty.
    ///
    /// Tokens count down, so the oldest member carries the largest raw value.
    pub(crate) fn pick_oldest(&self) -> Option<PageId> {
        self.members.last_key_value().map(|(_, (page, _))| *page)
    }

    #[inline]
    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub(crate) fn contains(&self, token: AccessTime) -> bool {
        self.members.contains_key(&token)
    }
}
