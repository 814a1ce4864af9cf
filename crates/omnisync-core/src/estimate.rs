//! Self-tuning window estimators for block ranges and event time windows.

/// Smallest block window the backfill driver requests.
pub const MIN_BLOCK_RANGE: u64 = 25;
/// Largest block window the backfill driver requests.
pub const MAX_BLOCK_RANGE: u64 = 100_000;

/// Next backfill window size, in blocks.
///
/// Aims at windows that take about one second, never shrinking below
/// [`MIN_BLOCK_RANGE`], never more than doubling, never above
/// [`MAX_BLOCK_RANGE`]. `span` is `end - start` of the window just synced.
pub fn next_block_range(span: u64, duration_ms: u64, prev: u64) -> u64 {
    let per_second = (1_000.0 * span as f64 / duration_ms.max(1) as f64).round() as u64;
    per_second
        .max(MIN_BLOCK_RANGE)
        .min(prev.saturating_mul(2))
        .min(MAX_BLOCK_RANGE)
}

/// Parameters of the event time-window estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateParams {
    /// Target number of results per query.
    pub target: u64,
    pub min: u64,
    pub max: u64,
    /// Largest growth factor between two consecutive estimates.
    pub max_increase: f64,
}

/// Next window size given how many results the last `[from, to]` window held.
///
/// `min ≤ next ≤ min(prev * max_increase, max)` unless `min` exceeds the cap.
pub fn estimate(from: u64, to: u64, result: u64, prev: u64, params: EstimateParams) -> u64 {
    let density = to.saturating_sub(from) as f64 / result.max(1) as f64;
    let wanted = (params.target as f64 * density).round() as u64;
    let cap = (prev as f64 * params.max_increase).round() as u64;
    wanted.max(params.min).min(cap).min(params.max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_grows_at_most_twice() {
        // 1000 blocks in 10ms would be 100k/s, capped at 2x the previous window.
        assert_eq!(next_block_range(1_000, 10, 25), 50);
        assert_eq!(next_block_range(1_000, 10, 50), 100);
    }

    #[test]
    fn block_range_floor_and_ceiling() {
        assert_eq!(next_block_range(25, 60_000, 1_000), MIN_BLOCK_RANGE);
        assert_eq!(next_block_range(1_000_000, 1, 90_000), MAX_BLOCK_RANGE);
    }

    #[test]
    fn block_range_tracks_one_second() {
        // 400 blocks took 2s → 200 blocks/s.
        assert_eq!(next_block_range(400, 2_000, 1_000), 200);
    }

    #[test]
    fn block_range_survives_zero_duration() {
        assert_eq!(next_block_range(10, 0, 25), 50);
    }

    fn params() -> EstimateParams {
        EstimateParams {
            target: 1_000,
            min: 10,
            max: 86_400,
            max_increase: 1.08,
        }
    }

    #[test]
    fn estimate_shrinks_on_dense_ranges() {
        // 100 seconds held 10_000 results → 0.01 s/result → 10 s for 1000.
        assert_eq!(estimate(0, 100, 10_000, 1_000, params()), 10);
    }

    #[test]
    fn estimate_growth_is_capped() {
        // Sparse range wants much more, but growth is limited to 8%.
        assert_eq!(estimate(0, 1_000, 1, 1_000, params()), 1_080);
    }

    #[test]
    fn estimate_respects_max() {
        assert_eq!(estimate(0, 1_000_000, 0, 86_400, params()), 86_400);
    }
}
