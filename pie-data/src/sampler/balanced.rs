//! The P×K batch sampler for triplet training.

use super::{pool::IndexPool, Batch};
use crate::{common::*, dataset::Dataset, error::PieError, label_index::LabelIndex};

/// Options of [BalancedBatchSampler].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancedBatchSamplerInit {
    /// Number of distinct classes per batch (P).
    pub classes_per_batch: usize,
    /// Number of samples per class (K).
    pub samples_per_class: usize,
    /// Fill classes with fewer than K images by sampling with replacement.
    /// Otherwise such a class contributes each of its images once.
    pub equal_k: bool,
    /// Take the K samples of a class from distinct pose buckets before
    /// repeating a bucket.
    pub rotate_poses: bool,
    pub seed: Option<u64>,
}

impl BalancedBatchSamplerInit {
    pub fn build(self, dataset: &Dataset, label_index: &LabelIndex) -> Result<BalancedBatchSampler> {
        let Self {
            classes_per_batch,
            samples_per_class,
            equal_k,
            rotate_poses,
            seed,
        } = self;

        if classes_per_batch == 0 || samples_per_class == 0 {
            return Err(PieError::config("P and K must be positive").into());
        }

        let pose_index = LabelIndex::new(
            dataset
                .records
                .iter()
                .filter_map(|record| record.pose.as_deref()),
        );

        let classes: Vec<ClassPool> = dataset
            .indexes_by_label()
            .into_iter()
            .map(|(label, indexes)| -> Result<_> {
                let class = label_index.class_of(label).ok_or_else(|| {
                    PieError::data(format!("label '{}' is missing in the label index", label))
                })?;

                let buckets: Vec<IndexPool> = if rotate_poses && !pose_index.is_empty() {
                    indexes
                        .iter()
                        .copied()
                        .into_group_map_by(|&index| dataset.records[index].pose.clone())
                        .into_iter()
                        .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
                        .map(|(_, indexes)| IndexPool::new(indexes))
                        .collect()
                } else {
                    vec![IndexPool::new(indexes.clone())]
                };

                Ok(ClassPool {
                    class,
                    indexes,
                    buckets,
                })
            })
            .try_collect()?;

        if classes_per_batch > classes.len() {
            return Err(PieError::config(format!(
                "{} classes per batch requested, but the dataset has only {} classes",
                classes_per_batch,
                classes.len()
            ))
            .into());
        }

        if !equal_k {
            let num_short = classes
                .iter()
                .filter(|class| class.indexes.len() < samples_per_class)
                .count();
            if num_short > 0 {
                warn!(
                    "{} classes have fewer than {} images and yield short groups",
                    num_short, samples_per_class
                );
            }
        }

        let pose_of = dataset
            .records
            .iter()
            .map(|record| {
                record
                    .pose
                    .as_deref()
                    .and_then(|pose| pose_index.class_of(pose))
            })
            .collect();

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(BalancedBatchSampler {
            classes_per_batch,
            samples_per_class,
            equal_k,
            class_pool: IndexPool::new((0..classes.len()).collect()),
            classes,
            pose_of,
            rng,
        })
    }
}

#[derive(Debug, Clone)]
struct ClassPool {
    class: usize,
    indexes: Vec<usize>,
    buckets: Vec<IndexPool>,
}

/// Produces an endless sequence of batches with P classes and K samples each.
///
/// Classes are drawn without replacement from a pool that is reshuffled when
/// exhausted. Samples of a class are drawn the same way from per-class pools.
#[derive(Debug, Clone)]
pub struct BalancedBatchSampler {
    classes_per_batch: usize,
    samples_per_class: usize,
    equal_k: bool,
    class_pool: IndexPool,
    classes: Vec<ClassPool>,
    pose_of: Vec<Option<usize>>,
    rng: StdRng,
}

impl BalancedBatchSampler {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Draws the next batch.
    pub fn sample(&mut self) -> Batch {
        let Self {
            classes_per_batch,
            samples_per_class,
            equal_k,
            ref mut class_pool,
            ref mut classes,
            ref pose_of,
            ref mut rng,
        } = *self;

        let picked = class_pool.draw_distinct(classes_per_batch, rng);
        let mut batch = Batch::with_capacity(classes_per_batch * samples_per_class);

        for class_pos in picked {
            let ClassPool {
                class,
                ref indexes,
                ref mut buckets,
            } = classes[class_pos];

            let target = cmp::min(samples_per_class, indexes.len());
            let mut chosen: Vec<usize> = Vec::with_capacity(samples_per_class);

            // visit pose buckets round-robin in random order
            buckets.shuffle(rng);
            while chosen.len() < target {
                let mut progress = false;
                for bucket in buckets.iter_mut() {
                    if chosen.len() >= target {
                        break;
                    }
                    if let Some(index) = bucket.draw_excluding(&chosen, rng) {
                        chosen.push(index);
                        progress = true;
                    }
                }
                if !progress {
                    break;
                }
            }

            if equal_k {
                while chosen.len() < samples_per_class {
                    let index = indexes[rng.gen_range(0..indexes.len())];
                    chosen.push(index);
                }
            }

            for index in chosen {
                batch.push(index, class, pose_of[index]);
            }
        }

        batch
    }
}

impl Iterator for BalancedBatchSampler {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.sample())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::is_configuration_error, record::ImageRecord};

    fn dataset(counts: &[usize], poses: Option<usize>) -> Dataset {
        let records = counts
            .iter()
            .enumerate()
            .flat_map(|(label, &count)| {
                (0..count).map(move |index| ImageRecord {
                    path: PathBuf::from(format!("id-{:02}/{}.png", label, index)),
                    label: format!("id-{:02}", label),
                    pose: poses.map(|n_poses| format!("pose-{}", index % n_poses)),
                })
            })
            .collect();
        Dataset::from_records(records)
    }

    fn init(p: usize, k: usize, equal_k: bool) -> BalancedBatchSamplerInit {
        BalancedBatchSamplerInit {
            classes_per_batch: p,
            samples_per_class: k,
            equal_k,
            rotate_poses: false,
            seed: Some(42),
        }
    }

    fn class_counts(batch: &Batch) -> HashMap<usize, usize> {
        batch.classes.iter().copied().counts()
    }

    #[test]
    fn every_batch_has_p_classes_and_k_samples() {
        let dataset = dataset(&[5; 10], None);
        let index = dataset.label_index();
        let sampler = init(4, 3, true).build(&dataset, &index).unwrap();

        for batch in sampler.take(100) {
            assert_eq!(batch.len(), 12);
            let counts = class_counts(&batch);
            assert_eq!(counts.len(), 4);
            assert!(counts.values().all(|&count| count == 3));

            // K distinct images per class when the class is large enough
            for class in counts.keys() {
                let images: HashSet<_> = izip!(&batch.indexes, &batch.classes)
                    .filter(|(_, c)| *c == class)
                    .map(|(index, _)| *index)
                    .collect();
                assert_eq!(images.len(), 3);
            }
        }
    }

    #[test]
    fn short_classes_are_padded_with_equal_k() {
        let dataset = dataset(&[1, 2, 5, 6], None);
        let index = dataset.label_index();
        let sampler = init(4, 4, true).build(&dataset, &index).unwrap();

        for batch in sampler.take(20) {
            assert_eq!(batch.len(), 16);
            assert!(class_counts(&batch).values().all(|&count| count == 4));
        }
    }

    #[test]
    fn short_classes_are_truncated_without_equal_k() {
        let dataset = dataset(&[1, 2, 5, 6], None);
        let index = dataset.label_index();
        let sampler = init(4, 4, false).build(&dataset, &index).unwrap();

        for batch in sampler.take(20) {
            let counts = class_counts(&batch);
            assert_eq!(counts.len(), 4);
            assert_eq!(counts[&0], 1);
            assert_eq!(counts[&1], 2);
            assert_eq!(counts[&2], 4);
            assert_eq!(counts[&3], 4);
            assert_eq!(batch.indexes.iter().unique().count(), batch.len());
        }
    }

    #[test]
    fn classes_rotate_through_the_epoch() {
        let dataset = dataset(&[3; 6], None);
        let index = dataset.label_index();
        let mut sampler = init(3, 2, true).build(&dataset, &index).unwrap();

        // two consecutive batches cover all six classes
        let first = class_counts(&sampler.sample());
        let second = class_counts(&sampler.sample());
        let covered: HashSet<_> = first.keys().chain(second.keys()).collect();
        assert_eq!(covered.len(), 6);
    }

    #[test]
    fn same_seed_same_batches() {
        let dataset = dataset(&[4, 7, 3, 9, 5], None);
        let index = dataset.label_index();
        let lhs: Vec<_> = init(3, 3, true)
            .build(&dataset, &index)
            .unwrap()
            .take(30)
            .collect();
        let rhs: Vec<_> = init(3, 3, true)
            .build(&dataset, &index)
            .unwrap()
            .take(30)
            .collect();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn poses_are_rotated_before_repeating() {
        let dataset = dataset(&[6; 4], Some(3));
        let index = dataset.label_index();
        let sampler = BalancedBatchSamplerInit {
            rotate_poses: true,
            ..init(2, 3, true)
        }
        .build(&dataset, &index)
        .unwrap();

        for batch in sampler.take(20) {
            for class in batch.classes.iter().unique() {
                let poses: HashSet<_> = izip!(&batch.classes, &batch.poses)
                    .filter(|(c, _)| *c == class)
                    .map(|(_, pose)| pose.unwrap())
                    .collect();
                assert_eq!(poses.len(), 3);
            }
        }
    }

    #[test]
    fn too_many_classes_per_batch() {
        let dataset = dataset(&[3, 3], None);
        let index = dataset.label_index();
        let err = init(3, 2, true).build(&dataset, &index).unwrap_err();
        assert!(is_configuration_error(&err));
    }
}
