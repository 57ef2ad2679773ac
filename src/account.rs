use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Priority class under which a piece of I/O is scheduled by the block store.
pub struct IoPriority(pub i32);

impl IoPriority {
    pub const DEFAULT: IoPriority = IoPriority(0);
}

impl Default for IoPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Handle scoping a transaction's I/O to a priority class.
///
/// The account belongs to the executor it was created on: it is deliberately
/// neither `Send` nor `Sync`, so constructing it on one task and dropping it
/// on another is a compile error rather than a runtime contract check. It
/// carries no behavior beyond its priority tag.
pub struct CacheAccount {
    priority: IoPriority,
    _home: PhantomData<*const ()>,
}

impl CacheAccount {
    pub fn new(priority: IoPriority) -> Self {
        Self {
            priority,
            _home: PhantomData,
        }
    }

    #[inline]
    pub fn priority(&self) -> IoPriority {
        self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_carries_priority() {
        let account = CacheAccount::new(IoPriority(7));
        assert_eq!(account.priority(), IoPriority(7));
    }
}
