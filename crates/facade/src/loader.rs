//! Memory-bounded iteration over logical batches.

use tracing::debug;

use dp_train_core::{
    DpError, NoiseSource, PhysicalBatchMeta, PoissonSampler, Result, Sampling, VirtualBatchPlan,
};

use crate::data::{DataLoader, IndexedDataset};

/// A physical sub-batch and its position in the logical batch.
#[derive(Clone, Debug, PartialEq)]
pub struct PhysicalBatch<T> {
    /// Examples in this sub-batch; at most `P` of them.
    pub items: Vec<T>,
    /// Where this sub-batch sits in its logical batch.
    pub meta: PhysicalBatchMeta,
}

/// Loader wrapper that splits every logical batch into physical batches.
///
/// The wrapped loader's batch size stays the logical batch size `B`; only
/// the number of examples handed out at once is capped at `P`. Under
/// Poisson sampling `B` is the expected size and logical batches are drawn
/// from `source`; under shuffle sampling the wrapped loader cuts them.
#[derive(Clone, Debug)]
pub struct VirtualBatchLoader<D> {
    inner: DataLoader<D>,
    plan: VirtualBatchPlan,
    sampler: Option<PoissonSampler>,
}

impl<D: IndexedDataset> VirtualBatchLoader<D> {
    /// Wrap `inner` with a plan whose logical size matches its batch size.
    pub fn new(
        inner: DataLoader<D>,
        plan: VirtualBatchPlan,
        source: NoiseSource,
    ) -> Result<Self> {
        if plan.logical_batch_size() != inner.batch_size() {
            return Err(DpError::invalid(format!(
                "plan logical batch size {} differs from loader batch size {}",
                plan.logical_batch_size(),
                inner.batch_size()
            )));
        }
        let sampler = match plan.sampling() {
            Sampling::Poisson => Some(PoissonSampler::new(
                inner.dataset_len(),
                inner.batch_size(),
                source,
            )?),
            Sampling::Shuffle => None,
        };
        Ok(Self {
            inner,
            plan,
            sampler,
        })
    }

    /// The batching plan.
    pub fn plan(&self) -> &VirtualBatchPlan {
        &self.plan
    }

    /// The wrapped loader.
    pub fn inner(&self) -> &DataLoader<D> {
        &self.inner
    }

    /// Logical steps one epoch yields.
    pub fn logical_batches_per_epoch(&self) -> usize {
        self.plan.batches_per_epoch(self.inner.dataset_len())
    }

    /// Physical batches for the next epoch, in order.
    ///
    /// Logical batches the partial-batch policy skips are left out entirely.
    /// An empty Poisson draw still yields one empty physical batch, so the
    /// noise-only step is taken and accounted.
    pub fn epoch(&mut self) -> Result<VirtualEpoch<'_, D>> {
        let logical = match self.sampler.as_mut() {
            Some(sampler) => sampler.epoch(),
            None => self.inner.epoch_indices(),
        };
        let mut pending = Vec::new();
        let mut logical_index = 0usize;
        let mut skipped = 0usize;
        for indices in logical {
            let Some(logical_size) = self.plan.effective_batch_size(indices.len())? else {
                skipped += indices.len();
                continue;
            };
            let ranges = self.plan.split(indices.len())?;
            let num_physical = ranges.len();
            for (physical_index, range) in ranges.into_iter().enumerate() {
                pending.push((
                    indices[range].to_vec(),
                    PhysicalBatchMeta {
                        logical_index,
                        physical_index,
                        num_physical,
                        examples: indices.len(),
                        logical_size,
                    },
                ));
            }
            logical_index += 1;
        }
        if skipped > 0 {
            debug!(skipped, "dropped trailing partial logical batch");
        }
        Ok(VirtualEpoch {
            dataset: self.inner.dataset(),
            pending: pending.into_iter(),
        })
    }
}

/// Iterator over one epoch's physical batches.
#[derive(Debug)]
pub struct VirtualEpoch<'a, D> {
    dataset: &'a D,
    pending: std::vec::IntoIter<(Vec<usize>, PhysicalBatchMeta)>,
}

impl<'a, D: IndexedDataset> Iterator for VirtualEpoch<'a, D> {
    type Item = PhysicalBatch<D::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let (indices, meta) = self.pending.next()?;
        let items = indices.into_iter().map(|i| self.dataset.get(i)).collect();
        Some(PhysicalBatch { items, meta })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pending.size_hint()
    }
}

impl<'a, D: IndexedDataset> ExactSizeIterator for VirtualEpoch<'a, D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_train_core::PartialBatchPolicy;

    fn loader(
        n: usize,
        b: usize,
        p: usize,
        policy: PartialBatchPolicy,
    ) -> VirtualBatchLoader<Vec<usize>> {
        let inner = DataLoader::new((0..n).collect(), b).expect("loader");
        let plan = VirtualBatchPlan::new(b, p, policy)
            .expect("plan")
            .with_sampling(Sampling::Shuffle);
        VirtualBatchLoader::new(inner, plan, NoiseSource::seeded(0)).expect("matching sizes")
    }

    #[test]
    fn splits_logical_batches_into_capped_physical_batches() {
        let mut l = loader(400, 200, 128, PartialBatchPolicy::Shrink);
        let batches: Vec<_> = l.epoch().expect("epoch").collect();
        let sizes: Vec<usize> = batches.iter().map(|b| b.items.len()).collect();
        assert_eq!(sizes, vec![128, 72, 128, 72]);
        assert!(batches.iter().all(|b| b.meta.logical_size == 200 && b.meta.examples == 200));
        let closes: Vec<bool> = batches.iter().map(|b| b.meta.closes_logical()).collect();
        assert_eq!(closes, vec![false, true, false, true]);
        assert_eq!(batches[3].meta.logical_index, 1);
    }

    #[test]
    fn shrink_policy_keeps_partial_batch_with_true_size() {
        let mut l = loader(250, 100, 40, PartialBatchPolicy::Shrink);
        let batches: Vec<_> = l.epoch().expect("epoch").collect();
        let last = batches.last().expect("non-empty");
        assert_eq!(last.meta.logical_size, 50);
        assert_eq!(last.meta.logical_index, 2);
        assert_eq!(l.logical_batches_per_epoch(), 3);
    }

    #[test]
    fn drop_policy_skips_partial_batch() {
        let mut l = loader(250, 100, 40, PartialBatchPolicy::Drop);
        let batches: Vec<_> = l.epoch().expect("epoch").collect();
        assert_eq!(batches.len(), 6);
        assert!(batches.iter().all(|b| b.meta.logical_size == 100));
        assert_eq!(l.logical_batches_per_epoch(), 2);
    }

    #[test]
    fn mismatched_plan_is_rejected() {
        let inner = DataLoader::new((0..10).collect::<Vec<usize>>(), 5).expect("loader");
        let plan = VirtualBatchPlan::new(4, 2, PartialBatchPolicy::Shrink).expect("plan");
        assert!(VirtualBatchLoader::new(inner, plan, NoiseSource::seeded(0)).is_err());
    }

    #[test]
    fn poisson_epoch_splits_variable_batches() {
        let inner = DataLoader::new((0..1000).collect::<Vec<usize>>(), 100).expect("loader");
        let plan = VirtualBatchPlan::new(100, 32, PartialBatchPolicy::Drop).expect("plan");
        let mut l = VirtualBatchLoader::new(inner, plan, NoiseSource::seeded(3)).expect("loader");
        assert_eq!(l.logical_batches_per_epoch(), 10);

        let batches: Vec<_> = l.epoch().expect("epoch").collect();
        assert!(batches.iter().all(|b| b.items.len() <= 32));
        assert!(batches.iter().all(|b| b.meta.logical_size == 100));
        let closing: Vec<_> = batches.iter().filter(|b| b.meta.closes_logical()).collect();
        assert_eq!(closing.len(), 10);

        let mut sizes = vec![0usize; 10];
        for b in &batches {
            sizes[b.meta.logical_index] += b.items.len();
            assert_eq!(b.meta.num_physical, (b.meta.examples.max(1) + 31) / 32);
        }
        for b in &closing {
            assert_eq!(sizes[b.meta.logical_index], b.meta.examples);
        }
        assert!(sizes.iter().any(|&s| s != 100));
    }
}
