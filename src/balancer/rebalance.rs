//! Pure allocation math for dividing the cache budget across shards.

use crate::evicter::ShardStats;

/// Derive one relative weight per shard from its activity counters.
///
/// Bytes loaded since the last rebalance is the primary signal. When no
/// shard loaded anything, access counts stand in; when those are also all
/// zero the budget is split evenly.
pub(super) fn activity_weights(stats: &[ShardStats]) -> Vec<u64> {
    let by_bytes: Vec<u64> = stats
        .iter()
        .map(|s| s.bytes_loaded.max(0) as u64)
        .collect();
    if by_bytes.iter().any(|&w| w > 0) {
        return by_bytes;
    }

    let by_accesses: Vec<u64> = stats.iter().map(|s| s.access_count).collect();
    if by_accesses.iter().any(|&w| w > 0) {
        return by_accesses;
    }

    vec![1; stats.len()]
}

/// Split `total` bytes across shards in proportion to `weights`, giving
/// every shard at least `floor` bytes.
///
/// Shards whose proportional share falls below the floor are clamped to it
/// and the remaining budget is re-split across the rest, so the limits sum
/// to `total` exactly whenever the floors fit. When they do not fit, every
/// shard gets its floor and the second return value reports the overcommit.
pub(super) fn compute_limits(total: u64, floor: u64, weights: &[u64]) -> (Vec<u64>, bool) {
    let n = weights.len();
    debug_assert!(n > 0);

    if floor.saturating_mul(n as u64) > total {
        return (vec![floor; n], true);
    }

    let mut clamped = vec![false; n];
    let mut limits = vec![0u64; n];
    loop {
        let pool: u64 = total
            - floor * clamped.iter().filter(|&&c| c).count() as u64;
        let weight_sum: u128 = weights
            .iter()
            .zip(&clamped)
            .filter(|&(_, &c)| !c)
            .map(|(&w, _)| w as u128)
            .sum();

        for (i, &weight) in weights.iter().enumerate() {
            if clamped[i] {
                limits[i] = floor;
            } else if weight_sum == 0 {
                // All remaining weights are zero; fall back to an even split.
                let free = clamped.iter().filter(|&&c| !c).count() as u64;
                limits[i] = pool / free;
            } else {
                limits[i] = (pool as u128 * weight as u128 / weight_sum) as u64;
            }
        }

        let mut changed = false;
        for (i, &limit) in limits.iter().enumerate() {
            if !clamped[i] && limit < floor {
                clamped[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Integer division leaves a few bytes on the table; hand them to the
    // heaviest unclamped shards so the limits sum to the budget.
    let mut remainder = total - limits.iter().sum::<u64>();
    while remainder > 0 {
        let heaviest = (0..n)
            .filter(|&i| !clamped[i])
            .max_by_key(|&i| (weights[i], std::cmp::Reverse(i)));
        let Some(i) = heaviest else {
            break;
        };
        limits[i] += 1;
        remainder -= 1;
    }

    (limits, false)
}
