//! Human-readable views of sampler output.

use crate::common::*;

/// The composition of one sampled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchComposition {
    /// Image count per label, in order of first appearance.
    Labeled(Vec<(String, usize)>),
    Pairs { positive: usize, negative: usize },
}

impl BatchComposition {
    pub fn new(batch: &SampledBatch, label_index: &LabelIndex) -> Self {
        match batch {
            SampledBatch::Labeled(batch) => {
                let counts = batch
                    .classes
                    .iter()
                    .map(|&class| {
                        label_index
                            .label_of(class)
                            .map(|label| label.to_owned())
                            .unwrap_or_else(|| format!("#{}", class))
                    })
                    .fold(vec![], |mut counts: Vec<(String, usize)>, label| {
                        match counts.iter_mut().find(|(prev, _)| *prev == label) {
                            Some((_, count)) => *count += 1,
                            None => counts.push((label, 1)),
                        }
                        counts
                    });
                Self::Labeled(counts)
            }
            SampledBatch::Pairs(batch) => {
                let positive = batch.targets.iter().filter(|&&target| target > 0.5).count();
                Self::Pairs {
                    positive,
                    negative: batch.targets.len() - positive,
                }
            }
        }
    }
}

impl fmt::Display for BatchComposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Labeled(counts) => {
                let text = counts
                    .iter()
                    .map(|(label, count)| format!("{} x{}", label, count))
                    .join(", ");
                f.write_str(&text)
            }
            Self::Pairs { positive, negative } => {
                write!(f, "{} positive and {} negative pairs", positive, negative)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pie_data::sampler::{Batch, PairBatch};

    #[test]
    fn labeled_composition() {
        let label_index = LabelIndex::new(["amy", "bob", "cat"]);
        let mut batch = Batch::with_capacity(4);
        batch.push(0, 2, None);
        batch.push(1, 0, None);
        batch.push(2, 2, None);
        batch.push(3, 0, None);

        let composition = BatchComposition::new(&SampledBatch::Labeled(batch), &label_index);
        assert_eq!(
            composition,
            BatchComposition::Labeled(vec![("cat".into(), 2), ("amy".into(), 2)])
        );
        assert_eq!(composition.to_string(), "cat x2, amy x2");
    }

    #[test]
    fn pair_composition() {
        let batch = PairBatch {
            left: vec![0, 1, 2],
            right: vec![3, 4, 5],
            targets: vec![1.0, 0.0, 0.0],
        };
        let composition =
            BatchComposition::new(&SampledBatch::Pairs(batch), &LabelIndex::new(["a"]));
        assert_eq!(
            composition,
            BatchComposition::Pairs {
                positive: 1,
                negative: 2
            }
        );
    }
}
