//! # Epoch/Batch Iteration
//!
//! Yields fixed-size batches over a split for a fixed number of epochs.
//! The trailing `len % batch_size` samples of every epoch are dropped.
//! Shuffling draws one permutation per epoch and applies it to all four
//! parallel arrays through a single index tensor.

use candle_core::Tensor;
use oorandom::Rand64;

use crate::data::split::DatasetSplit;
use crate::error::{Result, YomiteError};

/// One batch of parallel slices.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based epoch this batch belongs to.
    pub epoch: usize,
    /// Zero-based position of the batch within its epoch.
    pub index: usize,
    /// `[batch, tokens]` document ids.
    pub documents: Tensor,
    /// `[batch, question_tokens]` question ids.
    pub questions: Tensor,
    /// `[batch, max_entities]` candidate entity ids, zero-padded.
    pub choices: Tensor,
    /// `[batch]` raw gold answer ids.
    pub answers: Tensor,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.answers.dims()[0]
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forward-only, finite batch sequence over a [`DatasetSplit`].
pub struct BatchIterator<'a> {
    split: &'a DatasetSplit,
    batch_size: usize,
    num_epochs: usize,
    shuffle: bool,
    rng: Rand64,
    batches_per_epoch: usize,
    epoch: usize,
    batch: usize,
    epoch_view: Option<DatasetSplit>,
    failed: bool,
}

impl<'a> BatchIterator<'a> {
    /// Create an iterator over `split`.
    ///
    /// # Arguments
    /// * `split` - The samples to batch
    /// * `batch_size` - Samples per batch, at most `split.len()`
    /// * `num_epochs` - Passes over the split
    /// * `shuffle` - Draw a fresh permutation at the start of every epoch
    /// * `seed` - Seed for the permutation RNG
    pub fn new(
        split: &'a DatasetSplit,
        batch_size: usize,
        num_epochs: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 || batch_size > split.len() {
            return Err(YomiteError::InvalidConfig(format!(
                "batch size {batch_size} must be between 1 and the split size {}",
                split.len()
            )));
        }

        Ok(Self {
            split,
            batch_size,
            num_epochs,
            shuffle,
            rng: Rand64::new(u128::from(seed)),
            batches_per_epoch: split.len() / batch_size,
            epoch: 0,
            batch: 0,
            epoch_view: None,
            failed: false,
        })
    }

    /// Full batches per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    /// Total batches the iterator yields from a fresh start.
    pub fn total_batches(&self) -> usize {
        self.num_epochs * self.batches_per_epoch
    }

    fn permutation(&mut self) -> Vec<u32> {
        let mut indices: Vec<u32> = (0..self.split.len() as u32).collect();
        for i in (1..indices.len()).rev() {
            let j = self.rng.rand_range(0..(i as u64 + 1)) as usize;
            indices.swap(i, j);
        }
        indices
    }

    fn start_epoch(&mut self) -> Result<DatasetSplit> {
        if !self.shuffle {
            return Ok(self.split.clone());
        }
        let indices = self.permutation();
        let indices = Tensor::from_vec(indices, self.split.len(), self.split.answers().device())?;
        self.split.select(&indices)
    }

    fn next_batch(&mut self) -> Result<Batch> {
        let view = match self.epoch_view.take() {
            Some(view) => view,
            None => {
                tracing::debug!("Starting epoch {}/{}", self.epoch + 1, self.num_epochs);
                self.start_epoch()?
            }
        };

        let start = self.batch * self.batch_size;
        let batch = Batch {
            epoch: self.epoch,
            index: self.batch,
            ..view.slice(start, self.batch_size)?.as_batch()
        };

        self.batch += 1;
        if self.batch == self.batches_per_epoch {
            self.batch = 0;
            self.epoch += 1;
        } else {
            self.epoch_view = Some(view);
        }
        Ok(batch)
    }

    fn remaining(&self) -> usize {
        if self.failed || self.epoch >= self.num_epochs {
            return 0;
        }
        (self.num_epochs - self.epoch) * self.batches_per_epoch - self.batch
    }
}

impl Iterator for BatchIterator<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining() == 0 {
            return None;
        }
        let batch = self.next_batch();
        if batch.is_err() {
            self.failed = true;
        }
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchIterator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Split whose every array encodes the sample index, so rows can be
    /// matched back to their origin after shuffling.
    fn indexed_split(samples: u32) -> DatasetSplit {
        let dev = Device::Cpu;
        let documents: Vec<u32> = (0..samples).flat_map(|i| [i, i + 1000, i + 2000]).collect();
        let questions: Vec<u32> = (0..samples).flat_map(|i| [i + 3000, i + 4000]).collect();
        let choices: Vec<u32> = (0..samples).flat_map(|i| [i + 5000, 0]).collect();
        let answers: Vec<u32> = (0..samples).map(|i| i + 6000).collect();
        let n = samples as usize;
        DatasetSplit::new(
            "train",
            Tensor::from_vec(documents, (n, 3), &dev).unwrap(),
            Tensor::from_vec(questions, (n, 2), &dev).unwrap(),
            Tensor::from_vec(choices, (n, 2), &dev).unwrap(),
            Tensor::from_vec(answers, n, &dev).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn hundred_samples_batch_32_drops_four() {
        let split = indexed_split(100);
        let iter = BatchIterator::new(&split, 32, 1, false, 0).unwrap();
        assert_eq!(iter.len(), 3);

        let batches: Vec<Batch> = iter.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 32));

        let seen: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.answers.to_vec1::<u32>().unwrap())
            .collect();
        let expected: Vec<u32> = (0..96).map(|i| i + 6000).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn yields_epochs_times_batches() {
        let split = indexed_split(10);
        let iter = BatchIterator::new(&split, 3, 4, true, 42).unwrap();
        assert_eq!(iter.batches_per_epoch(), 3);
        assert_eq!(iter.total_batches(), 12);

        let batches: Vec<Batch> = iter.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 12);
        assert_eq!(batches[3].epoch, 1);
        assert_eq!(batches[3].index, 0);
        assert_eq!(batches[11].epoch, 3);
        assert_eq!(batches[11].index, 2);
    }

    #[test]
    fn shuffle_keeps_rows_aligned() {
        let split = indexed_split(50);
        for batch in BatchIterator::new(&split, 7, 3, true, 1234).unwrap() {
            let batch = batch.unwrap();
            let answers = batch.answers.to_vec1::<u32>().unwrap();
            let documents = batch.documents.to_vec2::<u32>().unwrap();
            let questions = batch.questions.to_vec2::<u32>().unwrap();
            let choices = batch.choices.to_vec2::<u32>().unwrap();
            for (row, &answer) in answers.iter().enumerate() {
                let origin = answer - 6000;
                assert_eq!(documents[row], vec![origin, origin + 1000, origin + 2000]);
                assert_eq!(questions[row], vec![origin + 3000, origin + 4000]);
                assert_eq!(choices[row], vec![origin + 5000, 0]);
            }
        }
    }

    #[test]
    fn shuffled_epoch_is_a_permutation() {
        let split = indexed_split(20);
        let mut seen: Vec<u32> = BatchIterator::new(&split, 5, 1, true, 9)
            .unwrap()
            .flat_map(|b| b.unwrap().answers.to_vec1::<u32>().unwrap())
            .collect();
        let in_order: Vec<u32> = (0..20).map(|i| i + 6000).collect();
        assert_ne!(seen, in_order);
        seen.sort_unstable();
        assert_eq!(seen, in_order);
    }

    #[test]
    fn epochs_draw_independent_permutations() {
        let split = indexed_split(30);
        let answers: Vec<Vec<u32>> = BatchIterator::new(&split, 30, 2, true, 5)
            .unwrap()
            .map(|b| b.unwrap().answers.to_vec1::<u32>().unwrap())
            .collect();
        assert_ne!(answers[0], answers[1]);
    }

    #[test]
    fn shuffles_a_truncated_split() {
        let split = indexed_split(12).truncate_tokens(2).unwrap();
        assert_eq!(split.token_axis_length(), 2);

        let mut seen = Vec::new();
        for batch in BatchIterator::new(&split, 4, 2, true, 77).unwrap() {
            let batch = batch.unwrap();
            let answers = batch.answers.to_vec1::<u32>().unwrap();
            let documents = batch.documents.to_vec2::<u32>().unwrap();
            for (row, &answer) in answers.iter().enumerate() {
                let origin = answer - 6000;
                assert_eq!(documents[row], vec![origin, origin + 1000]);
            }
            seen.extend(answers);
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn invalid_batch_sizes() {
        let split = indexed_split(10);
        assert!(BatchIterator::new(&split, 0, 1, false, 0).is_err());
        assert!(BatchIterator::new(&split, 11, 1, false, 0).is_err());
    }
}
