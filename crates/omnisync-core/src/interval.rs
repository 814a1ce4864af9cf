//! Interval algebra over closed block ranges.
//!
//! An [`Interval`] is `(start, end)` with both ends inclusive. Every function
//! returns a *minimal* set: sorted by start, no two members overlapping or
//! touching. Inputs may be unsorted, overlapping, or empty.

/// Closed block range `[start, end]`.
pub type Interval = (u64, u64);

/// Sort intervals by start, then end.
pub fn sort(intervals: &[Interval]) -> Vec<Interval> {
    let mut sorted = intervals.to_vec();
    sorted.sort_unstable();
    sorted
}

/// Merge overlapping and adjacent intervals.
pub fn union(intervals: &[Interval]) -> Vec<Interval> {
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for (start, end) in sort(intervals) {
        if start > end {
            continue;
        }
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => {
                last.1 = last.1.max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Ranges covered by both `a` and `b`.
pub fn intersection(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let a = union(a);
    let b = union(b);
    let (mut i, mut j) = (0, 0);
    let mut result = Vec::new();

    while i < a.len() && j < b.len() {
        let lo = a[i].0.max(b[j].0);
        let hi = a[i].1.min(b[j].1);
        if lo <= hi {
            result.push((lo, hi));
        }
        if a[i].1 < b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }

    union(&result)
}

/// Ranges covered by every set in `sets`. An empty list covers nothing.
pub fn intersection_many(sets: &[Vec<Interval>]) -> Vec<Interval> {
    let Some((first, rest)) = sets.split_first() else {
        return Vec::new();
    };
    rest.iter()
        .fold(union(first), |acc, set| intersection(&acc, set))
}

/// Ranges of `a` not covered by `b`.
pub fn difference(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let b = union(b);
    let mut result = Vec::new();

    for (start, end) in union(a) {
        let mut cursor = Some(start);
        for &(b_start, b_end) in &b {
            let Some(from) = cursor else { break };
            if b_end < from {
                continue;
            }
            if b_start > end {
                break;
            }
            if b_start > from {
                result.push((from, b_start - 1));
            }
            cursor = b_end.checked_add(1);
        }
        if let Some(from) = cursor {
            if from <= end {
                result.push((from, end));
            }
        }
    }

    result
}

/// Total number of blocks covered. Overlaps are counted once per member, so
/// pass a minimal set for an exact count.
pub fn sum(intervals: &[Interval]) -> u64 {
    intervals
        .iter()
        .filter(|(start, end)| start <= end)
        .fold(0u64, |acc, (start, end)| {
            acc.saturating_add((end - start).saturating_add(1))
        })
}
