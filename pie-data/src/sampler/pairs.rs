use super::PairBatch;
use crate::{common::*, dataset::Dataset, error::PieError};
use rand::seq::index;

/// Samples balanced positive and negative image pairs for siamese training.
#[derive(Debug, Clone)]
pub struct PairSampler {
    batch_size: usize,
    groups: Vec<Vec<usize>>,
    /// Groups with at least two images, usable for positive pairs.
    positive_groups: Vec<usize>,
    rng: StdRng,
}

impl PairSampler {
    pub fn new(dataset: &Dataset, batch_size: usize, seed: Option<u64>) -> Result<Self> {
        if batch_size == 0 {
            return Err(PieError::config("batch_size must be positive").into());
        }

        let groups: Vec<Vec<usize>> = dataset.indexes_by_label().into_values().collect();
        if groups.len() < 2 {
            return Err(PieError::data("pair sampling needs at least two classes").into());
        }

        let positive_groups: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, indexes)| indexes.len() >= 2)
            .map(|(pos, _)| pos)
            .collect();
        if positive_groups.is_empty() {
            return Err(
                PieError::data("pair sampling needs a class with at least two images").into(),
            );
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            batch_size,
            groups,
            positive_groups,
            rng,
        })
    }

    /// Draws `batch_size` pairs, the first half positive, the rest negative.
    pub fn sample(&mut self) -> PairBatch {
        let Self {
            batch_size,
            ref groups,
            ref positive_groups,
            ref mut rng,
        } = *self;

        let num_positive = batch_size / 2;
        let mut batch = PairBatch::default();

        for _ in 0..num_positive {
            let group = &groups[positive_groups[rng.gen_range(0..positive_groups.len())]];
            let picked = index::sample(rng, group.len(), 2);
            batch.left.push(group[picked.index(0)]);
            batch.right.push(group[picked.index(1)]);
            batch.targets.push(1.0);
        }

        // groups are never empty
        for _ in num_positive..batch_size {
            let picked = index::sample(rng, groups.len(), 2);
            let (lhs, rhs) = (&groups[picked.index(0)], &groups[picked.index(1)]);
            batch.left.push(lhs[rng.gen_range(0..lhs.len())]);
            batch.right.push(rhs[rng.gen_range(0..rhs.len())]);
            batch.targets.push(0.0);
        }

        batch
    }
}
