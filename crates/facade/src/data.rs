//! Datasets and the plain, epoch-restartable data loader.

use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use dp_train_core::{DpError, Result, Scalar};

/// Dataset supporting indexed access.
pub trait IndexedDataset {
    /// Item type returned by the dataset.
    type Item: Clone;

    /// Number of items in the dataset.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch an item by index.
    fn get(&self, index: usize) -> Self::Item;
}

impl<T: Clone> IndexedDataset for Vec<T> {
    type Item = T;

    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> Self::Item {
        self[index].clone()
    }
}

/// One labelled training example.
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    /// Input features.
    pub features: Array1<Scalar>,
    /// Class label.
    pub label: usize,
}

impl Example {
    /// Create an example.
    pub fn new(features: Array1<Scalar>, label: usize) -> Self {
        Self { features, label }
    }
}

/// Loader yielding logical batches of `batch_size` indices per epoch.
///
/// Indices are reshuffled at the start of every epoch when shuffling is on.
/// The last batch of an epoch holds the remainder and may be short.
#[derive(Clone, Debug)]
pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    rng: ChaCha8Rng,
}

impl<D: IndexedDataset> DataLoader<D> {
    /// Create a loader over `dataset`.
    pub fn new(dataset: D, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(DpError::invalid("batch_size must be positive"));
        }
        if dataset.is_empty() {
            return Err(DpError::invalid("dataset must not be empty"));
        }
        if batch_size > dataset.len() {
            return Err(DpError::invalid(format!(
                "batch_size {batch_size} exceeds dataset size {}",
                dataset.len()
            )));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            rng: ChaCha8Rng::seed_from_u64(0),
        })
    }

    /// Shuffle every epoch with a seeded generator.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// The wrapped dataset.
    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Logical batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of examples.
    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Index batches for the next epoch.
    pub fn epoch_indices(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }

    /// Materialized batches for the next epoch.
    pub fn epoch(&mut self) -> Vec<Vec<D::Item>> {
        self.epoch_indices()
            .into_iter()
            .map(|batch| batch.into_iter().map(|i| self.dataset.get(i)).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_dataset_once() {
        let mut loader = DataLoader::new((0..10).collect::<Vec<usize>>(), 4)
            .expect("valid")
            .shuffled(3);
        let batches = loader.epoch();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_is_reproducible_and_changes_per_epoch() {
        let data: Vec<usize> = (0..64).collect();
        let mut a = DataLoader::new(data.clone(), 8).expect("valid").shuffled(11);
        let mut b = DataLoader::new(data, 8).expect("valid").shuffled(11);
        let first = a.epoch_indices();
        assert_eq!(first, b.epoch_indices());
        assert_ne!(first, a.epoch_indices());
    }

    #[test]
    fn unshuffled_loader_is_sequential() {
        let mut loader = DataLoader::new(vec!['a', 'b', 'c'], 2).expect("valid");
        assert_eq!(loader.epoch(), vec![vec!['a', 'b'], vec!['c']]);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(DataLoader::new(vec![1, 2, 3], 0).is_err());
        assert!(DataLoader::new(vec![1, 2, 3], 4).is_err());
        assert!(DataLoader::new(Vec::<u8>::new(), 1).is_err());
    }
}
