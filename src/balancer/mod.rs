mod rebalance;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use humansize::DECIMAL;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::BalancerConfig;
use crate::evicter::{LimitUpdate, ShardStats};

/// The balancer-facing side of a cache shard.
///
/// [crate::ShardHandle] implements this over its job channel; the balancer
/// only ever holds shards as `Weak<dyn BalancedShard>`, so dropping the last
/// strong handle is how a shard deregisters.
pub trait BalancedShard: Send + Sync + 'static {
    /// Ask the shard for its current counters, delivered via `reply`.
    ///
    /// A shard that shut down drops the reply instead of answering.
    fn request_stats(&self, reply: oneshot::Sender<ShardStats>);

    /// Push a new memory budget down to the shard.
    fn apply_limit(&self, update: LimitUpdate);

    /// Read and clear the shard's activity flag.
    fn take_wake_flag(&self) -> bool;
}

/// What shards need from whatever governs their memory.
pub trait CacheBalance: Send + Sync {
    /// The smallest budget any shard is ever given.
    fn base_mem_per_store(&self) -> u64;

    /// Whether a newly spawned shard may start with read-ahead enabled.
    fn read_ahead_ok_at_start(&self) -> bool;

    /// Hint that cache activity warrants an early rebalance.
    fn wake_up_activity_happened(&self);

    /// Make the shard visible to future rebalances.
    fn register_shard(&self, shard: Weak<dyn BalancedShard>);
}

/// A balancer that never rebalances: every shard keeps a fixed limit.
/// Useful for tests and single-shard deployments.
#[derive(Debug, Clone)]
pub struct DummyCacheBalancer {
    memory_limit: u64,
}

impl DummyCacheBalancer {
    pub fn new(memory_limit: u64) -> Self {
        Self { memory_limit }
    }
}

impl CacheBalance for DummyCacheBalancer {
    fn base_mem_per_store(&self) -> u64 {
        self.memory_limit
    }

    fn read_ahead_ok_at_start(&self) -> bool {
        true
    }

    fn wake_up_activity_happened(&self) {}

    fn register_shard(&self, _shard: Weak<dyn BalancedShard>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceTimerState {
    /// Waiting for activity or the periodic timeout.
    Normal,
    /// A rebalance is queued or collecting stats from the shards.
    ExaminingOtherThreads,
    /// Shutting down; no further rebalances are scheduled.
    Deactivated,
}

/// The process-wide cache balancer.
///
/// A timer task watches the registered shards' wake flags and a periodic
/// timeout; when either fires it pushes a token into a single-slot queue
/// drained by one worker task. The slot coalesces bursts: however many
/// wake-ups land while a rebalance runs, at most one more follows it.
pub struct CacheBalancer {
    inner: Arc<BalancerInner>,
    timer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

struct BalancerInner {
    config: BalancerConfig,
    shards: Mutex<Vec<Weak<dyn BalancedShard>>>,
    state: Mutex<RebalanceTimerState>,
    last_rebalance: Mutex<Instant>,
    /// Feeds the worker; capacity 1. Taken on shutdown to close the queue.
    queue: Mutex<Option<mpsc::Sender<()>>>,
    shutdown: Notify,
    rebalance_runs: AtomicU64,
    /// Positive bytes-loaded deltas accumulated across all rebalances, used
    /// to retire read-ahead once the working set clearly exceeds the cache.
    lifetime_bytes_loaded: AtomicU64,
    read_ahead_ok: AtomicBool,
    overcommit_warned: AtomicBool,
}

impl CacheBalancer {
    /// Start the balancer's timer and worker tasks. Must be called from
    /// within a tokio runtime.
    pub fn new(config: BalancerConfig) -> Self {
        tracing::info!(
            total_cache_size = %humansize::format_size(config.total_cache_size, DECIMAL),
            base_mem_per_store = %humansize::format_size(config.base_mem_per_store, DECIMAL),
            check_interval_ms = config.rebalance_check_interval_ms,
            "cache balancer started",
        );

        let (tx, mut rx) = mpsc::channel(1);
        let inner = Arc::new(BalancerInner {
            config,
            shards: Mutex::new(Vec::new()),
            state: Mutex::new(RebalanceTimerState::Normal),
            last_rebalance: Mutex::new(Instant::now()),
            queue: Mutex::new(Some(tx)),
            shutdown: Notify::new(),
            rebalance_runs: AtomicU64::new(0),
            lifetime_bytes_loaded: AtomicU64::new(0),
            read_ahead_ok: AtomicBool::new(true),
            overcommit_warned: AtomicBool::new(false),
        });

        let worker = tokio::spawn({
            let inner = inner.clone();
            async move {
                while rx.recv().await.is_some() {
                    inner.run_rebalance().await;
                }
            }
        });

        let timer = tokio::spawn({
            let inner = inner.clone();
            async move {
                let period = Duration::from_millis(inner.config.rebalance_check_interval_ms);
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = inner.shutdown.notified() => break,
                        _ = interval.tick() => inner.timer_fired(),
                    }
                }
            }
        });

        Self { inner, timer, worker }
    }

    /// How many rebalances have completed.
    pub fn rebalance_count(&self) -> u64 {
        self.inner.rebalance_runs.load(Ordering::Acquire)
    }

    pub fn timer_state(&self) -> RebalanceTimerState {
        *self.inner.state.lock()
    }

    /// Stop both tasks. A rebalance already queued still runs to completion
    /// before the worker exits.
    pub async fn shutdown(self) {
        *self.inner.state.lock() = RebalanceTimerState::Deactivated;
        self.inner.shutdown.notify_one();
        let _ = self.timer.await;
        self.inner.queue.lock().take();
        let _ = self.worker.await;
        tracing::info!("cache balancer stopped");
    }
}

impl CacheBalance for CacheBalancer {
    fn base_mem_per_store(&self) -> u64 {
        self.inner.config.base_mem_per_store
    }

    fn read_ahead_ok_at_start(&self) -> bool {
        self.inner.read_ahead_ok.load(Ordering::Acquire)
    }

    fn wake_up_activity_happened(&self) {
        if *self.inner.state.lock() == RebalanceTimerState::Deactivated {
            return;
        }
        self.inner.schedule_rebalance();
    }

    fn register_shard(&self, shard: Weak<dyn BalancedShard>) {
        self.inner.shards.lock().push(shard);
        tracing::debug!("cache shard registered with the balancer");
    }
}

impl BalancerInner {
    fn timer_fired(&self) {
        if *self.state.lock() != RebalanceTimerState::Normal {
            return;
        }

        // Take every raised flag even after the first hit: this rebalance
        // services all of them.
        let mut woke = false;
        for shard in self.shards.lock().iter() {
            if let Some(shard) = shard.upgrade() {
                woke |= shard.take_wake_flag();
            }
        }

        let timeout = Duration::from_millis(self.config.rebalance_timeout_ms);
        if woke || self.last_rebalance.lock().elapsed() >= timeout {
            self.schedule_rebalance();
        }
    }

    fn schedule_rebalance(&self) {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return;
        };
        match tx.try_send(()) {
            Ok(()) => {
                *self.state.lock() = RebalanceTimerState::ExaminingOtherThreads;
            },
            // The slot is taken: this wake-up rides along with the one
            // already queued.
            Err(TrySendError::Full(())) => {},
            Err(TrySendError::Closed(())) => {},
        }
    }

    #[tracing::instrument("rebalance", skip_all)]
    async fn run_rebalance(&self) {
        let shards: Vec<Arc<dyn BalancedShard>> = {
            let mut registry = self.shards.lock();
            registry.retain(|shard| shard.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };

        let replies: Vec<_> = shards
            .iter()
            .map(|shard| {
                let (tx, rx) = oneshot::channel();
                shard.request_stats(tx);
                rx
            })
            .collect();

        // A shard that shuts down mid-collection drops its reply and is
        // skipped; its slice of the budget returns on the next run.
        let mut live = Vec::with_capacity(shards.len());
        for (shard, reply) in shards.into_iter().zip(replies) {
            if let Ok(stats) = reply.await {
                live.push((shard, stats));
            }
        }

        if !live.is_empty() {
            self.balance(&live);
        }

        self.rebalance_runs.fetch_add(1, Ordering::Release);
        *self.last_rebalance.lock() = Instant::now();
        // Settle back to Normal only with the queue slot observed empty
        // under the queue lock; a wake-up queued while this run finished
        // keeps the state raised until the worker drains it. The queue lock
        // is always taken before the state lock.
        let queue = self.queue.lock();
        let another_queued = queue.as_ref().is_some_and(|tx| tx.capacity() == 0);
        let mut state = self.state.lock();
        if *state != RebalanceTimerState::Deactivated && !another_queued {
            *state = RebalanceTimerState::Normal;
        }
    }

    fn balance(&self, live: &[(Arc<dyn BalancedShard>, ShardStats)]) {
        let stats: Vec<ShardStats> = live.iter().map(|(_, stats)| *stats).collect();
        let weights = rebalance::activity_weights(&stats);
        let (limits, overcommitted) = rebalance::compute_limits(
            self.config.total_cache_size,
            self.config.base_mem_per_store,
            &weights,
        );
        if overcommitted && !self.overcommit_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                num_shards = live.len(),
                total_cache_size = self.config.total_cache_size,
                base_mem_per_store = self.config.base_mem_per_store,
                "per-shard floors exceed the cache budget, limits degraded to floors",
            );
        }

        let read_ahead_ok = self.note_bytes_loaded(&stats);

        for ((shard, stats), limit) in live.iter().zip(limits) {
            shard.apply_limit(LimitUpdate {
                memory_limit: limit,
                bytes_loaded_accounted: stats.bytes_loaded,
                accesses_accounted: stats.access_count,
                read_ahead_ok,
            });
        }

        tracing::debug!(
            num_shards = live.len(),
            read_ahead_ok,
            "cache limits rebalanced",
        );
    }

    /// Fold this round's activity into the lifetime total and decide whether
    /// read-ahead stays on. The decision is one-way: once the total clears
    /// the configured fraction of the budget, read-ahead stays off.
    fn note_bytes_loaded(&self, stats: &[ShardStats]) -> bool {
        let loaded: u64 = stats.iter().map(|s| s.bytes_loaded.max(0) as u64).sum();
        let lifetime = self
            .lifetime_bytes_loaded
            .fetch_add(loaded, Ordering::AcqRel)
            + loaded;

        let over = lifetime.saturating_mul(self.config.read_ahead_ratio_denominator)
            > self
                .config
                .total_cache_size
                .saturating_mul(self.config.read_ahead_ratio_numerator);
        if over && self.read_ahead_ok.swap(false, Ordering::AcqRel) {
            tracing::info!(
                lifetime_bytes_loaded = %humansize::format_size(lifetime, DECIMAL),
                "cache working set exceeds the budget, disabling read-ahead",
            );
        }
        self.read_ahead_ok.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockShard {
        pending: Mutex<Vec<oneshot::Sender<ShardStats>>>,
        requested: mpsc::UnboundedSender<()>,
        applied: Mutex<Vec<LimitUpdate>>,
        stats: Mutex<ShardStats>,
        autoreply: bool,
    }

    impl MockShard {
        fn new(autoreply: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let shard = Arc::new(Self {
                pending: Mutex::new(Vec::new()),
                requested: tx,
                applied: Mutex::new(Vec::new()),
                stats: Mutex::new(ShardStats::default()),
                autoreply,
            });
            (shard, rx)
        }

        fn reply_pending(&self) {
            for reply in self.pending.lock().drain(..) {
                let _ = reply.send(*self.stats.lock());
            }
        }

        fn last_limit(&self) -> Option<u64> {
            self.applied.lock().last().map(|u| u.memory_limit)
        }
    }

    impl BalancedShard for MockShard {
        fn request_stats(&self, reply: oneshot::Sender<ShardStats>) {
            if self.autoreply {
                let _ = reply.send(*self.stats.lock());
            } else {
                self.pending.lock().push(reply);
            }
            let _ = self.requested.send(());
        }

        fn apply_limit(&self, update: LimitUpdate) {
            self.applied.lock().push(update);
        }

        fn take_wake_flag(&self) -> bool {
            false
        }
    }

    fn quiet_config() -> BalancerConfig {
        // A check interval long enough that the timer never fires during a
        // test; rebalances only happen through explicit wake-ups.
        BalancerConfig {
            total_cache_size: 3000,
            base_mem_per_store: 500,
            rebalance_check_interval_ms: 60_000,
            rebalance_timeout_ms: 120_000,
            ..BalancerConfig::default()
        }
    }

    async fn wait_for(mut poll: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !poll() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_rebalance_splits_by_activity() {
        let balancer = CacheBalancer::new(quiet_config());
        let (hot, _) = MockShard::new(true);
        let (cold, _) = MockShard::new(true);
        hot.stats.lock().bytes_loaded = 300;
        cold.stats.lock().bytes_loaded = 100;
        balancer.register_shard(Arc::downgrade(&hot) as _);
        balancer.register_shard(Arc::downgrade(&cold) as _);

        balancer.wake_up_activity_happened();
        wait_for(|| balancer.rebalance_count() >= 1).await;

        assert_eq!(hot.last_limit(), Some(2250));
        assert_eq!(cold.last_limit(), Some(750));
        assert_eq!(balancer.timer_state(), RebalanceTimerState::Normal);
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_wake_up_bursts_coalesce_into_one_extra_run() {
        let balancer = CacheBalancer::new(quiet_config());
        let (shard, mut requested) = MockShard::new(false);
        balancer.register_shard(Arc::downgrade(&shard) as _);

        // First wake-up: the worker blocks waiting on the shard's reply.
        balancer.wake_up_activity_happened();
        requested.recv().await.unwrap();

        // A burst while the rebalance is stalled fills the single queue
        // slot exactly once.
        for _ in 0..10 {
            balancer.wake_up_activity_happened();
        }

        shard.reply_pending();
        requested.recv().await.unwrap();
        shard.reply_pending();

        wait_for(|| balancer.rebalance_count() >= 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(balancer.rebalance_count(), 2);
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_timer_state_settles_after_back_to_back_runs() {
        let balancer = CacheBalancer::new(quiet_config());
        let (shard, mut requested) = MockShard::new(false);
        balancer.register_shard(Arc::downgrade(&shard) as _);

        // The first run stalls on the shard's reply; a second wake-up lands
        // in the queue slot while it is in flight.
        balancer.wake_up_activity_happened();
        requested.recv().await.unwrap();
        balancer.wake_up_activity_happened();

        // Finishing the first run with another queued must keep the state
        // raised; dropping to Normal here would leave an ExaminingOtherThreads
        // store from the queued wake-up dangling with nothing left to clear
        // it, and the timer would skip scheduling forever.
        shard.reply_pending();
        requested.recv().await.unwrap();
        assert_eq!(
            balancer.timer_state(),
            RebalanceTimerState::ExaminingOtherThreads,
        );

        shard.reply_pending();
        wait_for(|| balancer.rebalance_count() >= 2).await;
        wait_for(|| balancer.timer_state() == RebalanceTimerState::Normal).await;
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_shards_are_pruned() {
        let balancer = CacheBalancer::new(quiet_config());
        let (keep, _) = MockShard::new(true);
        let (gone, _) = MockShard::new(true);
        balancer.register_shard(Arc::downgrade(&keep) as _);
        balancer.register_shard(Arc::downgrade(&gone) as _);
        drop(gone);

        balancer.wake_up_activity_happened();
        wait_for(|| balancer.rebalance_count() >= 1).await;

        // A lone idle shard receives the whole budget.
        assert_eq!(keep.last_limit(), Some(3000));
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_ahead_retires_permanently() {
        let balancer = CacheBalancer::new(quiet_config());
        let (shard, _) = MockShard::new(true);
        shard.stats.lock().bytes_loaded = 2000; // > 3000 / 2
        balancer.register_shard(Arc::downgrade(&shard) as _);
        assert!(balancer.read_ahead_ok_at_start());

        balancer.wake_up_activity_happened();
        wait_for(|| balancer.rebalance_count() >= 1).await;

        assert!(!balancer.read_ahead_ok_at_start());
        assert!(!shard.applied.lock().last().unwrap().read_ahead_ok);

        // Quiet rounds never turn it back on.
        shard.stats.lock().bytes_loaded = 0;
        balancer.wake_up_activity_happened();
        wait_for(|| balancer.rebalance_count() >= 2).await;
        assert!(!balancer.read_ahead_ok_at_start());
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_overcommitted_floors_still_apply() {
        let config = BalancerConfig {
            total_cache_size: 800,
            base_mem_per_store: 500,
            ..quiet_config()
        };
        let balancer = CacheBalancer::new(config);
        let (a, _) = MockShard::new(true);
        let (b, _) = MockShard::new(true);
        balancer.register_shard(Arc::downgrade(&a) as _);
        balancer.register_shard(Arc::downgrade(&b) as _);

        balancer.wake_up_activity_happened();
        wait_for(|| balancer.rebalance_count() >= 1).await;

        assert_eq!(a.last_limit(), Some(500));
        assert_eq!(b.last_limit(), Some(500));
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_deactivates_the_timer() {
        let balancer = CacheBalancer::new(quiet_config());
        balancer.wake_up_activity_happened();
        wait_for(|| balancer.rebalance_count() >= 1).await;
        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_timeout_triggers_rebalances() {
        let config = BalancerConfig {
            rebalance_check_interval_ms: 5,
            rebalance_timeout_ms: 10,
            ..quiet_config()
        };
        let balancer = CacheBalancer::new(config);
        let (shard, _) = MockShard::new(true);
        balancer.register_shard(Arc::downgrade(&shard) as _);

        wait_for(|| balancer.rebalance_count() >= 3).await;
        assert_eq!(shard.last_limit(), Some(3000));
        balancer.shutdown().await;
    }
}
