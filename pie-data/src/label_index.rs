//! Mapping from label strings to zero-based class ids.

use crate::{common::*, error::PieError};

/// The label index of a dataset snapshot.
///
/// It is derived from the sorted label set, so the same set always yields the
/// same ids within and across runs. A stored index is only trusted after
/// [LabelIndex::load_validated] confirms it matches the current labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelIndex {
    labels: IndexSet<String>,
}

impl LabelIndex {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let labels: IndexSet<String> = labels
            .into_iter()
            .map(|label| label.as_ref().to_owned())
            .sorted()
            .dedup()
            .collect();
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn class_of(&self, label: &str) -> Option<usize> {
        self.labels.get_index_of(label)
    }

    pub fn label_of(&self, class: usize) -> Option<&str> {
        self.labels.get_index(class).map(|label| label.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|label| label.as_str())
    }

    /// Saves the index as a `class,label` CSV.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        writer.write_record(&["class", "label"])?;
        for (class, label) in self.labels.iter().enumerate() {
            writer.write_record(&[class.to_string(), label.clone()])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads a saved index and checks it against the labels of the current
    /// dataset. Any difference in the label set or ids is a data error.
    pub fn load_validated<I, S>(path: impl AsRef<Path>, current: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        #[derive(Deserialize)]
        struct Row {
            class: usize,
            label: String,
        }

        let path = path.as_ref();
        let rows: Vec<Row> = csv::Reader::from_path(path)
            .with_context(|| format!("unable to open '{}'", path.display()))?
            .deserialize()
            .try_collect()
            .map_err(|err| PieError::data(format!("malformed label index: {}", err)))?;

        let expected = Self::new(current);
        let matches = rows.len() == expected.len()
            && rows
                .iter()
                .all(|Row { class, label }| expected.class_of(label) == Some(*class));

        if !matches {
            return Err(PieError::data(format!(
                "label index '{}' does not match the current dataset",
                path.display()
            ))
            .into());
        }

        Ok(expected)
    }
}
