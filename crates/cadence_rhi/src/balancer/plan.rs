//! Translate group planning.
//!
//! Pure functions over workload estimates. No contexts are touched here; the caller
//! acquires one context per planned group afterwards.
//!
//! ```text
//! workloads:  [ 5 ][ 3 ][ 2 ][ ? ][ 40 ][ 40 ]      threshold = 64
//! groups:     [ 5   3   2 ][ ? ][ 40 ][ 40 ]       (unknown never merges)
//! ```

use crate::config::Tunables;
use std::ops::Range;

/// Estimated translate cost of one list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    /// Known number of draws.
    Known(u32),
    /// No estimate. Never merged, and makes the whole call parallel-worthy.
    Unknown,
}

impl Workload {
    /// Maps a signed draw count, where negative means unknown.
    #[must_use]
    pub fn from_draws(draws: i64) -> Self {
        u32::try_from(draws).map_or(Self::Unknown, Self::Known)
    }

    /// The known count, if any.
    #[inline]
    #[must_use]
    pub const fn known(self) -> Option<u32> {
        match self {
            Self::Known(draws) => Some(draws),
            Self::Unknown => None,
        }
    }
}

/// Thresholds read once at the start of a balance call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceThresholds {
    /// Budget of one merged group. Zero disables merging.
    pub merge_threshold: u64,
    /// Fewer merged groups than this translate serially.
    pub min_lists_for_parallel: usize,
    /// Whether adjacent lists may share a group at all.
    pub merge_small_lists: bool,
    /// Upper bound on groups, i.e. on deferred contexts.
    pub max_contexts: usize,
}

impl BalanceThresholds {
    /// Draw-count thresholds for a submission-time balance.
    #[must_use]
    pub fn from_tunables(tunables: &Tunables) -> Self {
        Self {
            merge_threshold: u64::from(tunables.min_draws_per_translate),
            min_lists_for_parallel: tunables.min_lists_for_parallel_translate,
            merge_small_lists: tunables.merge_small_deferred_contexts,
            max_contexts: tunables.worker_width.max(1),
        }
    }

    /// Memory thresholds for a balance deferred until the recording tasks finished.
    #[must_use]
    pub fn by_memory(tunables: &Tunables) -> Self {
        Self {
            merge_threshold: tunables.min_list_size_for_parallel_translate_kb as u64 * 1024,
            min_lists_for_parallel: tunables.min_lists_for_parallel_translate,
            merge_small_lists: true,
            max_contexts: tunables.worker_width.max(1),
        }
    }
}

/// Outcome of planning one balance call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslatePlan {
    /// Contiguous, non-empty, in-order ranges of list indices covering every list.
    pub groups: Vec<Range<usize>>,
    /// Whether translating the groups in parallel is worthwhile.
    pub parallel: bool,
    /// Group count of the merge scan, before capping to the available contexts.
    pub merged_groups: usize,
}

impl TranslatePlan {
    /// Number of groups.
    #[inline]
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Plans groups from draw-count workloads.
#[must_use]
pub fn plan_translate_groups(workloads: &[Workload], thresholds: &BalanceThresholds) -> TranslatePlan {
    let weights: Vec<Option<u64>> = workloads
        .iter()
        .map(|workload| workload.known().map(u64::from))
        .collect();
    plan(&weights, thresholds, true)
}

/// Plans groups from list memory sizes, in bytes.
///
/// Every size is known, so parallelism is decided by group count alone.
#[must_use]
pub fn plan_by_memory(sizes: &[usize], thresholds: &BalanceThresholds) -> TranslatePlan {
    let weights: Vec<Option<u64>> = sizes.iter().map(|&size| Some(size as u64)).collect();
    plan(&weights, thresholds, false)
}

fn plan(weights: &[Option<u64>], thresholds: &BalanceThresholds, gate_on_total: bool) -> TranslatePlan {
    if weights.is_empty() {
        return TranslatePlan {
            groups: Vec::new(),
            parallel: false,
            merged_groups: 0,
        };
    }

    let merge = thresholds.merge_small_lists && thresholds.merge_threshold > 0;

    let mut groups = Vec::with_capacity(weights.len());
    scan(weights, thresholds.merge_threshold, merge, |range| groups.push(range));
    let merged_groups = groups.len();

    let any_unknown = weights.iter().any(Option::is_none);
    let known_total: u64 = weights.iter().flatten().sum();
    let parallel = any_unknown
        || ((!gate_on_total || known_total >= thresholds.merge_threshold)
            && merged_groups >= thresholds.min_lists_for_parallel);

    let max_contexts = thresholds.max_contexts.max(1);
    if groups.len() > max_contexts {
        groups = coalesce(&groups, max_contexts);
    }

    TranslatePlan {
        groups,
        parallel,
        merged_groups,
    }
}

/// Greedy left-to-right grouping. A group keeps growing while every member is known
/// and the running total stays within `threshold`.
fn scan<F>(weights: &[Option<u64>], threshold: u64, merge: bool, mut emit: F)
where
    F: FnMut(Range<usize>),
{
    let mut start = 0;
    while start < weights.len() {
        let mut end = start + 1;
        if let (true, Some(mut total)) = (merge, weights[start]) {
            while let Some(Some(weight)) = weights.get(end) {
                if total + weight > threshold {
                    break;
                }
                total += weight;
                end += 1;
            }
        }
        emit(start..end);
        start = end;
    }
}

/// Joins consecutive groups into `target` contiguous groups of near-equal size.
fn coalesce(groups: &[Range<usize>], target: usize) -> Vec<Range<usize>> {
    let per_group = groups.len() / target;
    let extra = groups.len() % target;
    let mut out = Vec::with_capacity(target);
    let mut next = 0;
    for index in 0..target {
        let take = per_group + usize::from(index < extra);
        let first = &groups[next];
        let last = &groups[next + take - 1];
        out.push(first.start..last.end);
        next += take;
    }
    out
}
