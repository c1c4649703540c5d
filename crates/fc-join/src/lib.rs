#![forbid(unsafe_code)]

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    hash::{Hash, Hasher},
    mem::size_of,
};

use bumpalo::{Bump, collections::Vec as BumpVec};
use thiserror::Error;
use tracing::debug;

/// A finite `f64` usable as an ordered, hashable join key.
///
/// `-0.0` is folded into `0.0` so both land on the same axis slot.
#[derive(Debug, Clone, Copy)]
pub struct AxisKey(f64);

impl AxisKey {
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Some(Self(if value == 0.0 { 0.0 } else { value }))
    }

    #[must_use]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for AxisKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for AxisKey {}

impl Hash for AxisKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for AxisKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AxisKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One sparse input series: `values[i]` sits at `keys[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedSeries<T> {
    keys: Vec<f64>,
    values: Vec<T>,
}

impl<T> KeyedSeries<T> {
    pub fn new(keys: Vec<f64>, values: Vec<T>) -> Result<Self, AlignError> {
        if keys.len() != values.len() {
            return Err(AlignError::KeyValueMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        Ok(Self { keys, values })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, T)>) -> Self {
        let (keys, values) = pairs.into_iter().unzip();
        Self { keys, values }
    }

    #[must_use]
    pub fn keys(&self) -> &[f64] {
        &self.keys
    }

    #[must_use]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Result of an outer join: one shared ascending axis plus one column per
/// input series, `None` where that series has no entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFrame<T> {
    pub axis: Vec<f64>,
    pub aligned: Vec<Vec<Option<T>>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlignError {
    #[error("keyed series has {keys} keys but {values} values")]
    KeyValueMismatch { keys: usize, values: usize },
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for AlignExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AlignExecutionTrace {
    used_arena: bool,
    axis_len: usize,
    estimated_bytes: usize,
}

/// Sorted, deduplicated union of every series' keys.
///
/// K-way merge over the individually sorted key lists; non-finite keys never
/// reach the axis.
#[must_use]
pub fn axis_union(key_sets: &[&[f64]]) -> Vec<f64> {
    let sorted: Vec<Vec<AxisKey>> = key_sets
        .iter()
        .map(|keys| {
            let mut out: Vec<AxisKey> = keys.iter().copied().filter_map(AxisKey::new).collect();
            out.sort();
            out.dedup();
            out
        })
        .collect();

    let mut heap = BinaryHeap::new();
    for (i, keys) in sorted.iter().enumerate() {
        if let Some(first) = keys.first() {
            heap.push(Reverse((*first, i, 0_usize)));
        }
    }

    let total: usize = sorted.iter().map(Vec::len).sum();
    let mut axis: Vec<AxisKey> = Vec::with_capacity(total);

    while let Some(Reverse((key, list, pos))) = heap.pop() {
        if axis.last() != Some(&key) {
            axis.push(key);
        }
        if let Some(next) = sorted[list].get(pos + 1) {
            heap.push(Reverse((*next, list, pos + 1)));
        }
    }

    axis.into_iter().map(AxisKey::get).collect()
}

#[must_use]
pub fn outer_join<T: Clone>(series: &[KeyedSeries<T>]) -> AlignedFrame<T> {
    outer_join_with_options(series, AlignExecutionOptions::default())
}

#[must_use]
pub fn outer_join_with_options<T: Clone>(
    series: &[KeyedSeries<T>],
    options: AlignExecutionOptions,
) -> AlignedFrame<T> {
    let (frame, _) = outer_join_with_trace(series, options);
    frame
}

fn outer_join_with_trace<T: Clone>(
    series: &[KeyedSeries<T>],
    options: AlignExecutionOptions,
) -> (AlignedFrame<T>, AlignExecutionTrace) {
    let key_sets: Vec<&[f64]> = series.iter().map(|s| s.keys.as_slice()).collect();
    let axis = axis_union(&key_sets);

    let estimated_bytes = estimate_intermediate_bytes(axis.len(), series.len());
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;
    debug!(
        series = series.len(),
        axis_len = axis.len(),
        estimated_bytes,
        use_arena,
        "outer join"
    );

    let aligned = if use_arena {
        align_with_arena(series, &axis)
    } else {
        align_with_global_allocator(series, &axis)
    };

    let trace = AlignExecutionTrace {
        used_arena: use_arena,
        axis_len: axis.len(),
        estimated_bytes,
    };
    (AlignedFrame { axis, aligned }, trace)
}

fn estimate_intermediate_bytes(axis_len: usize, series: usize) -> usize {
    axis_len
        .saturating_mul(series)
        .saturating_mul(size_of::<Option<usize>>())
}

/// First position of every key in one series; later duplicates are ignored.
fn position_map_first(keys: &[f64]) -> HashMap<AxisKey, usize> {
    let mut map = HashMap::with_capacity(keys.len());
    for (pos, key) in keys.iter().enumerate() {
        if let Some(key) = AxisKey::new(*key) {
            map.entry(key).or_insert(pos);
        }
    }
    map
}

fn axis_positions(axis: &[f64], map: &HashMap<AxisKey, usize>) -> impl Iterator<Item = Option<usize>> {
    axis.iter()
        .map(move |key| AxisKey::new(*key).and_then(|k| map.get(&k).copied()))
}

fn materialize<T: Clone>(values: &[T], positions: &[Option<usize>]) -> Vec<Option<T>> {
    positions
        .iter()
        .map(|slot| slot.and_then(|idx| values.get(idx).cloned()))
        .collect()
}

fn align_with_global_allocator<T: Clone>(
    series: &[KeyedSeries<T>],
    axis: &[f64],
) -> Vec<Vec<Option<T>>> {
    series
        .iter()
        .map(|s| {
            let map = position_map_first(&s.keys);
            let positions: Vec<Option<usize>> = axis_positions(axis, &map).collect();
            materialize(&s.values, &positions)
        })
        .collect()
}

fn align_with_arena<T: Clone>(series: &[KeyedSeries<T>], axis: &[f64]) -> Vec<Vec<Option<T>>> {
    let arena = Bump::new();
    let mut out = Vec::with_capacity(series.len());
    for s in series {
        let map = position_map_first(&s.keys);
        let mut positions = BumpVec::<Option<usize>>::with_capacity_in(axis.len(), &arena);
        positions.extend(axis_positions(axis, &map));
        out.push(materialize(&s.values, positions.as_slice()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        AlignError, AlignExecutionOptions, AxisKey, KeyedSeries, axis_union, outer_join,
        outer_join_with_options, outer_join_with_trace,
    };

    fn series<T>(keys: Vec<f64>, values: Vec<T>) -> KeyedSeries<T> {
        KeyedSeries::new(keys, values).expect("keys and values pair up")
    }

    #[test]
    fn axis_union_sorts_and_dedups_across_series() {
        let axis = axis_union(&[&[3.0, 1.0, 3.0][..], &[2.0, 1.0][..], &[][..]]);
        assert_eq!(axis, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn axis_union_drops_non_finite_keys_and_folds_negative_zero() {
        let axis = axis_union(&[&[f64::NAN, -0.0, 1.0][..], &[0.0, f64::INFINITY][..]]);
        assert_eq!(axis, vec![0.0, 1.0]);
        assert!(AxisKey::new(f64::NAN).is_none());
    }

    #[test]
    fn outer_join_marks_absent_positions() {
        let out = outer_join(&[
            series(vec![1.0, 3.0], vec![10, 30]),
            series(vec![2.0, 3.0], vec![20, 31]),
        ]);
        assert_eq!(out.axis, vec![1.0, 2.0, 3.0]);
        assert_eq!(out.aligned[0], vec![Some(10), None, Some(30)]);
        assert_eq!(out.aligned[1], vec![None, Some(20), Some(31)]);
    }

    #[test]
    fn duplicate_keys_collapse_to_first_occurrence() {
        let out = outer_join(&[series(vec![5.0, 5.0, 1.0], vec!["a", "b", "c"])]);
        assert_eq!(out.axis, vec![1.0, 5.0]);
        assert_eq!(out.aligned[0], vec![Some("c"), Some("a")]);
    }

    #[test]
    fn mismatched_series_is_rejected() {
        let err = KeyedSeries::new(vec![1.0, 2.0], vec![1]).expect_err("mismatch");
        assert_eq!(err, AlignError::KeyValueMismatch { keys: 2, values: 1 });
    }

    #[test]
    fn from_pairs_splits_keys_and_values() {
        let s = KeyedSeries::from_pairs([(2.0, 'b'), (1.0, 'a')]);
        assert_eq!(s.keys(), &[2.0, 1.0]);
        assert_eq!(s.values(), &['b', 'a']);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn empty_input_yields_empty_frame() {
        let out = outer_join::<u32>(&[]);
        assert!(out.axis.is_empty());
        assert!(out.aligned.is_empty());
    }

    #[test]
    fn arena_alignment_matches_global_allocator_behavior() {
        let input = vec![
            series(vec![0.5, 1.5, 2.5], vec![1_u64, 2, 3]),
            series(vec![2.5, 3.5], vec![7, 8]),
        ];
        let global = outer_join_with_options(
            &input,
            AlignExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
        );
        let arena = outer_join_with_options(&input, AlignExecutionOptions::default());
        assert_eq!(arena, global);
    }

    #[test]
    fn arena_alignment_falls_back_when_budget_is_too_small() {
        let input = vec![series(vec![1.0, 2.0], vec![1, 2])];
        let options = AlignExecutionOptions {
            use_arena: true,
            arena_budget_bytes: 1,
        };
        let (out, trace) = outer_join_with_trace(&input, options);
        assert!(!trace.used_arena);
        assert_eq!(trace.axis_len, 2);
        assert!(trace.estimated_bytes > options.arena_budget_bytes);
        assert_eq!(out.aligned[0], vec![Some(1), Some(2)]);
    }

    #[test]
    fn identical_inputs_align_identically() {
        let input = vec![
            series(vec![9.0, 1.0, 4.0, 1.0], vec![1, 2, 3, 4]),
            series(vec![4.0, 16.0], vec![5, 6]),
        ];
        let first = outer_join(&input);
        for _ in 0..100 {
            assert_eq!(outer_join(&input), first);
        }
    }
}
