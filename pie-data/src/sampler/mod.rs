//! Batch samplers for the training objectives.
//!
//! Samplers only produce record indexes and class ids. Pixels are attached by
//! [crate::loader::BatchLoader].

mod balanced;
mod pairs;
mod pool;
mod shuffle;

pub use balanced::*;
pub use pairs::*;
pub use pool::*;
pub use shuffle::*;

use crate::{
    common::*,
    config::{Config, ModelKind},
    dataset::Dataset,
    label_index::LabelIndex,
};

/// An ordered batch of labeled records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    /// Record indexes into the sampled dataset.
    pub indexes: Vec<usize>,
    /// Class ids from the label index.
    pub classes: Vec<usize>,
    /// Pose bucket ids, if the records carry poses.
    pub poses: Vec<Option<usize>>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indexes: Vec::with_capacity(capacity),
            classes: Vec::with_capacity(capacity),
            poses: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, index: usize, class: usize, pose: Option<usize>) {
        self.indexes.push(index);
        self.classes.push(class);
        self.poses.push(pose);
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// A batch of image pairs with same-identity targets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PairBatch {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    /// 1.0 for pairs of the same class, 0.0 otherwise.
    pub targets: Vec<f32>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// The output of a [Sampler].
#[derive(Debug, Clone, PartialEq)]
pub enum SampledBatch {
    Labeled(Batch),
    Pairs(PairBatch),
}

/// The sampler matching a training objective.
#[derive(Debug, Clone)]
pub enum Sampler {
    Balanced(BalancedBatchSampler),
    Pairs(PairSampler),
    Shuffle(ShuffleSampler),
}

impl Sampler {
    /// Builds the sampler for the configured objective.
    pub fn from_config(
        config: &Config,
        dataset: &Dataset,
        label_index: &LabelIndex,
        seed: Option<u64>,
    ) -> Result<Self> {
        let sampler = match config.model.kind {
            ModelKind::TripletLoss | ModelKind::TripletPose => {
                let sampler = BalancedBatchSamplerInit {
                    classes_per_batch: config.train.cl_per_batch,
                    samples_per_class: config.train.sampl_per_class,
                    equal_k: config.train.equal_k,
                    rotate_poses: config.model.kind == ModelKind::TripletPose
                        && config.model.rotate_poses,
                    seed,
                }
                .build(dataset, label_index)?;
                Self::Balanced(sampler)
            }
            ModelKind::Siamese => {
                Self::Pairs(PairSampler::new(dataset, config.train.batch_size, seed)?)
            }
            ModelKind::Classification => Self::Shuffle(ShuffleSampler::new(
                dataset,
                label_index,
                config.train.batch_size,
                seed,
            )?),
        };
        Ok(sampler)
    }
}

impl Iterator for Sampler {
    type Item = SampledBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = match self {
            Self::Balanced(sampler) => SampledBatch::Labeled(sampler.sample()),
            Self::Pairs(sampler) => SampledBatch::Pairs(sampler.sample()),
            Self::Shuffle(sampler) => SampledBatch::Labeled(sampler.sample()),
        };
        Some(batch)
    }
}
