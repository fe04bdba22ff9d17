//! Train/validation partitioning.

use crate::{
    common::*,
    config::{Config, ModelKind},
    dataset::Dataset,
    error::PieError,
    record::ImageRecord,
};

/// The policy that partitions a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitPolicy {
    /// Labels are partitioned, no identity appears on both sides.
    ClassDisjoint {
        seed: u64,
        fold: Option<usize>,
        n_folds: usize,
        valid_fraction: f64,
    },
    /// Each label with at least `min_imgs` images gives a share of its images
    /// to validation.
    MinimumCount {
        seed: u64,
        min_imgs: usize,
        valid_fraction: f64,
    },
}

impl SplitPolicy {
    /// Picks the policy matching the training objective.
    pub fn from_config(config: &Config, fold: Option<usize>) -> Result<Self> {
        let policy = match config.model.kind {
            ModelKind::TripletLoss | ModelKind::TripletPose | ModelKind::Siamese => {
                Self::ClassDisjoint {
                    seed: config.data.split_seed,
                    fold,
                    n_folds: config.data.n_folds,
                    valid_fraction: config.data.valid_fraction.raw(),
                }
            }
            ModelKind::Classification => Self::MinimumCount {
                seed: config.data.split_seed,
                min_imgs: config.evaluate.move_to_dataset,
                valid_fraction: config.data.valid_fraction.raw(),
            },
        };
        Ok(policy)
    }

    pub fn split(&self, dataset: &Dataset) -> Result<Split> {
        let valid_indexes: HashSet<usize> = match *self {
            Self::ClassDisjoint {
                seed,
                fold,
                n_folds,
                valid_fraction,
            } => {
                let valid_labels = class_disjoint_labels(dataset, seed, fold, n_folds, valid_fraction)?;
                dataset
                    .records
                    .iter()
                    .enumerate()
                    .filter(|(_, record)| valid_labels.contains(record.label.as_str()))
                    .map(|(index, _)| index)
                    .collect()
            }
            Self::MinimumCount {
                seed,
                min_imgs,
                valid_fraction,
            } => minimum_count_indexes(dataset, seed, min_imgs, valid_fraction),
        };

        let (valid, train): (Vec<_>, Vec<_>) = dataset
            .records
            .iter()
            .enumerate()
            .partition(|(index, _)| valid_indexes.contains(index));
        let split = Split {
            train_indexes: train.iter().map(|(index, _)| *index).collect(),
            valid_indexes: valid.iter().map(|(index, _)| *index).collect(),
            train: Dataset::from_records(train.into_iter().map(|(_, r)| r.clone()).collect()),
            valid: Dataset::from_records(valid.into_iter().map(|(_, r)| r.clone()).collect()),
        };

        if split.train.is_empty() {
            return Err(PieError::data("the training partition is empty").into());
        }
        if split.valid.is_empty() {
            return Err(PieError::data("the validation partition is empty").into());
        }

        Ok(split)
    }
}

/// Selects the held-out labels of a class-disjoint split.
fn class_disjoint_labels<'a>(
    dataset: &'a Dataset,
    seed: u64,
    fold: Option<usize>,
    n_folds: usize,
    valid_fraction: f64,
) -> Result<HashSet<&'a str>> {
    let mut labels: Vec<&str> = dataset.indexes_by_label().into_keys().collect();
    let mut rng = StdRng::seed_from_u64(seed);
    labels.shuffle(&mut rng);
    let num_labels = labels.len();

    let range = match fold {
        Some(fold) => {
            if fold >= n_folds {
                return Err(PieError::config(format!(
                    "fold index {} is out of range for {} folds",
                    fold, n_folds
                ))
                .into());
            }
            // contiguous folds, the first `num_labels % n_folds` folds get one extra label
            let base = num_labels / n_folds;
            let extra = num_labels % n_folds;
            let start = fold * base + cmp::min(fold, extra);
            let len = base + usize::from(fold < extra);
            start..(start + len)
        }
        None => {
            let len = (num_labels as f64 * valid_fraction).ceil() as usize;
            0..cmp::min(len, num_labels)
        }
    };

    Ok(labels[range].iter().copied().collect())
}

/// Selects the held-out images of a minimum-count split.
fn minimum_count_indexes(
    dataset: &Dataset,
    seed: u64,
    min_imgs: usize,
    valid_fraction: f64,
) -> HashSet<usize> {
    let mut rng = StdRng::seed_from_u64(seed);

    dataset
        .indexes_by_label()
        .into_values()
        .filter(|indexes| indexes.len() >= min_imgs && indexes.len() > 1)
        .flat_map(|mut indexes| {
            let count = indexes.len();
            let num_valid = cmp::max(1, (count as f64 * valid_fraction).floor() as usize);
            let num_valid = cmp::min(num_valid, count - 1);
            indexes.shuffle(&mut rng);
            indexes.truncate(num_valid);
            indexes
        })
        .collect()
}

/// A train/validation partition of a dataset.
///
/// Every input record appears in exactly one of the two partitions.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Dataset,
    pub valid: Dataset,
    /// Positions of the training records in the source dataset.
    pub train_indexes: Vec<usize>,
    /// Positions of the validation records in the source dataset.
    pub valid_indexes: Vec<usize>,
}

impl Split {
    /// Writes the partition as a `file,label,partition` CSV.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        writer.write_record(&["file", "label", "partition"])?;

        let rows = self
            .train
            .records
            .iter()
            .map(|record| (record, "train"))
            .chain(self.valid.records.iter().map(|record| (record, "valid")));
        for (ImageRecord { path, label, .. }, partition) in rows {
            writer.write_record(&[&*path.to_string_lossy(), label.as_str(), partition])?;
        }
        writer.flush()?;
        Ok(())
    }
}
