use super::Batch;
use crate::{common::*, dataset::Dataset, error::PieError, label_index::LabelIndex};

/// Yields shuffled batches over the whole dataset, epoch after epoch.
///
/// The last batch of an epoch may be shorter than `batch_size`.
#[derive(Debug, Clone)]
pub struct ShuffleSampler {
    batch_size: usize,
    order: Vec<usize>,
    classes: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ShuffleSampler {
    pub fn new(
        dataset: &Dataset,
        label_index: &LabelIndex,
        batch_size: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(PieError::config("batch_size must be positive").into());
        }
        if dataset.is_empty() {
            return Err(PieError::data("cannot sample from an empty dataset").into());
        }

        let classes: Vec<usize> = dataset
            .records
            .iter()
            .map(|record| {
                label_index.class_of(&record.label).ok_or_else(|| {
                    PieError::data(format!(
                        "label '{}' is missing in the label index",
                        record.label
                    ))
                })
            })
            .try_collect()?;

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            batch_size,
            order: (0..dataset.len()).collect(),
            cursor: dataset.len(),
            classes,
            rng,
        })
    }

    /// Number of batches in one pass over the dataset.
    pub fn batches_per_epoch(&self) -> usize {
        (self.order.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn sample(&mut self) -> Batch {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }

        let end = cmp::min(self.cursor + self.batch_size, self.order.len());
        let mut batch = Batch::with_capacity(end - self.cursor);
        for &index in &self.order[self.cursor..end] {
            batch.push(index, self.classes[index], None);
        }
        self.cursor = end;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ImageRecord;

    #[test]
    fn epoch_covers_dataset_once() {
        let records: Vec<_> = (0..10)
            .map(|index| ImageRecord {
                path: PathBuf::from(format!("{}.png", index)),
                label: format!("class-{}", index % 3),
                pose: None,
            })
            .collect();
        let dataset = Dataset::from_records(records);
        let index = dataset.label_index();
        let mut sampler = ShuffleSampler::new(&dataset, &index, 4, Some(1)).unwrap();
        assert_eq!(sampler.batches_per_epoch(), 3);

        let batches: Vec<_> = (0..3).map(|_| sampler.sample()).collect();
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );

        let mut seen: Vec<_> = batches
            .iter()
            .flat_map(|batch| batch.indexes.iter().copied())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        for batch in &batches {
            for (&record, &class) in izip!(&batch.indexes, &batch.classes) {
                assert_eq!(index.class_of(&dataset.records[record].label), Some(class));
            }
        }
    }
}
