//! Virtual batching: splitting a logical batch into physical sub-batches.
//!
//! The logical batch size `B` drives privacy (sample rate and noise scale);
//! the physical cap `P` only bounds how many examples are processed at once.
//! Splitting never changes `B`.
//!
//! Under Poisson sampling a logical batch holds a random number of examples;
//! it is still split by `P`, and its mean and noise still use `B`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{DpError, Result};
use crate::sampling::Sampling;

/// How a trailing logical batch with fewer than `B` examples is treated
/// under [`Sampling::Shuffle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialBatchPolicy {
    /// Process it, using its true example count as `B` for that step.
    #[default]
    Shrink,
    /// Never process it; it consumes no privacy budget.
    Drop,
}

/// Number of physical batches needed for `logical` examples with cap `max_physical`.
pub fn num_physical_batches(logical: usize, max_physical: usize) -> usize {
    if max_physical == 0 {
        return 0;
    }
    (logical + max_physical - 1) / max_physical
}

/// Split `0..len` into contiguous ranges of at most `max_physical` items.
pub fn split_logical_batch(len: usize, max_physical: usize) -> Result<Vec<Range<usize>>> {
    if max_physical == 0 {
        return Err(DpError::invalid("max_physical_batch_size must be positive"));
    }
    let mut out = Vec::with_capacity(num_physical_batches(len, max_physical));
    let mut start = 0usize;
    while start < len {
        let end = (start + max_physical).min(len);
        out.push(start..end);
        start = end;
    }
    Ok(out)
}

/// Number of logical steps one pass over `dataset_size` examples yields.
pub fn logical_batches_per_epoch(
    dataset_size: usize,
    logical_batch_size: usize,
    policy: PartialBatchPolicy,
) -> usize {
    if logical_batch_size == 0 {
        return 0;
    }
    match policy {
        PartialBatchPolicy::Shrink => (dataset_size + logical_batch_size - 1) / logical_batch_size,
        PartialBatchPolicy::Drop => dataset_size / logical_batch_size,
    }
}

/// Validated logical/physical batch geometry for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBatchPlan {
    logical_batch_size: usize,
    max_physical_batch_size: usize,
    policy: PartialBatchPolicy,
    sampling: Sampling,
}

impl VirtualBatchPlan {
    /// Create a Poisson-sampled plan; requires `0 < P <= B`.
    pub fn new(
        logical_batch_size: usize,
        max_physical_batch_size: usize,
        policy: PartialBatchPolicy,
    ) -> Result<Self> {
        if logical_batch_size == 0 {
            return Err(DpError::invalid("logical batch size must be positive"));
        }
        if max_physical_batch_size == 0 {
            return Err(DpError::invalid("max_physical_batch_size must be positive"));
        }
        if max_physical_batch_size > logical_batch_size {
            return Err(DpError::invalid(format!(
                "max_physical_batch_size ({max_physical_batch_size}) exceeds \
                 logical batch size ({logical_batch_size})"
            )));
        }
        Ok(Self {
            logical_batch_size,
            max_physical_batch_size,
            policy,
            sampling: Sampling::default(),
        })
    }

    /// Same geometry with another sampling scheme.
    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Sampling scheme.
    pub fn sampling(&self) -> Sampling {
        self.sampling
    }

    /// Logical batch size `B`.
    pub fn logical_batch_size(&self) -> usize {
        self.logical_batch_size
    }

    /// Physical cap `P`.
    pub fn max_physical_batch_size(&self) -> usize {
        self.max_physical_batch_size
    }

    /// Policy for trailing partial batches.
    pub fn policy(&self) -> PartialBatchPolicy {
        self.policy
    }

    /// Logical steps per pass over `dataset_size` examples.
    ///
    /// Poisson sampling draws `ceil(N / B)` batches whatever the policy.
    pub fn batches_per_epoch(&self, dataset_size: usize) -> usize {
        let policy = match self.sampling {
            Sampling::Poisson => PartialBatchPolicy::Shrink,
            Sampling::Shuffle => self.policy,
        };
        logical_batches_per_epoch(dataset_size, self.logical_batch_size, policy)
    }

    /// Batch size used for noise scale and averaging of a logical batch
    /// holding `actual` examples, or `None` if the batch must be skipped.
    pub fn effective_batch_size(&self, actual: usize) -> Result<Option<usize>> {
        if self.sampling == Sampling::Poisson {
            return Ok(Some(self.logical_batch_size));
        }
        if actual > self.logical_batch_size {
            return Err(DpError::invalid(format!(
                "loader produced {actual} examples for logical batch size {}",
                self.logical_batch_size
            )));
        }
        if actual == 0 {
            return Ok(None);
        }
        if actual == self.logical_batch_size {
            return Ok(Some(actual));
        }
        Ok(match self.policy {
            PartialBatchPolicy::Shrink => Some(actual),
            PartialBatchPolicy::Drop => None,
        })
    }

    /// Physical ranges for a logical batch of `len` examples.
    ///
    /// An empty Poisson batch still yields one empty range, so its
    /// noise-only step is taken and accounted.
    pub fn split(&self, len: usize) -> Result<Vec<Range<usize>>> {
        if len == 0 && self.sampling == Sampling::Poisson {
            return Ok(vec![0..0]);
        }
        split_logical_batch(len, self.max_physical_batch_size)
    }
}

/// Position of a physical batch within its logical batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalBatchMeta {
    /// Index of the logical batch within the epoch.
    pub logical_index: usize,
    /// Index of this physical batch within its logical batch.
    pub physical_index: usize,
    /// Number of physical batches in the logical batch.
    pub num_physical: usize,
    /// `B` to use for the logical batch's noise scale and mean.
    pub logical_size: usize,
    /// Examples actually drawn for the logical batch.
    pub examples: usize,
}

impl PhysicalBatchMeta {
    /// Whether this physical batch completes its logical batch.
    pub fn closes_logical(&self) -> bool {
        self.physical_index + 1 == self.num_physical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_range_with_partial_tail() {
        let ranges = split_logical_batch(10, 4).expect("valid");
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        assert_eq!(num_physical_batches(10, 4), 3);
        assert_eq!(num_physical_batches(200, 128), 2);
    }

    #[test]
    fn split_of_exact_multiple() {
        let ranges = split_logical_batch(200, 50).expect("valid");
        assert_eq!(ranges.len(), 4);
        assert!(ranges.iter().all(|r| r.len() == 50));
    }

    #[test]
    fn plan_rejects_physical_above_logical() {
        assert!(VirtualBatchPlan::new(64, 128, PartialBatchPolicy::Shrink).is_err());
        assert!(VirtualBatchPlan::new(0, 1, PartialBatchPolicy::Shrink).is_err());
        assert!(VirtualBatchPlan::new(8, 0, PartialBatchPolicy::Shrink).is_err());
        assert!(VirtualBatchPlan::new(128, 128, PartialBatchPolicy::Drop).is_ok());
    }

    #[test]
    fn partial_policy_controls_effective_size() {
        let shrink = VirtualBatchPlan::new(200, 128, PartialBatchPolicy::Shrink)
            .expect("plan")
            .with_sampling(Sampling::Shuffle);
        assert_eq!(shrink.effective_batch_size(200).expect("ok"), Some(200));
        assert_eq!(shrink.effective_batch_size(37).expect("ok"), Some(37));
        assert!(shrink.effective_batch_size(201).is_err());

        let drop = VirtualBatchPlan::new(200, 128, PartialBatchPolicy::Drop)
            .expect("plan")
            .with_sampling(Sampling::Shuffle);
        assert_eq!(drop.effective_batch_size(37).expect("ok"), None);
        assert_eq!(drop.effective_batch_size(200).expect("ok"), Some(200));
    }

    #[test]
    fn poisson_batches_use_expected_size() {
        let plan = VirtualBatchPlan::new(200, 128, PartialBatchPolicy::Drop).expect("plan");
        assert_eq!(plan.sampling(), Sampling::Poisson);
        assert_eq!(plan.effective_batch_size(231).expect("ok"), Some(200));
        assert_eq!(plan.effective_batch_size(0).expect("ok"), Some(200));
        assert_eq!(plan.split(231).expect("ok"), vec![0..128, 128..231]);
        assert_eq!(plan.split(0).expect("ok"), vec![0..0]);
        assert_eq!(plan.batches_per_epoch(1_001), 6);
    }

    #[test]
    fn batches_per_epoch_matches_policy() {
        assert_eq!(logical_batches_per_epoch(50_000, 200, PartialBatchPolicy::Shrink), 250);
        assert_eq!(logical_batches_per_epoch(1_001, 100, PartialBatchPolicy::Shrink), 11);
        assert_eq!(logical_batches_per_epoch(1_001, 100, PartialBatchPolicy::Drop), 10);
    }

    #[test]
    fn meta_closes_on_last_physical() {
        let meta = PhysicalBatchMeta {
            logical_index: 0,
            physical_index: 1,
            num_physical: 2,
            logical_size: 200,
            examples: 187,
        };
        assert!(meta.closes_logical());
    }
}
