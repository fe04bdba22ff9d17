//! Append-only CSV logs of a training experiment.

use crate::common::*;
use std::fs::OpenOptions;

pub const HISTORY_FILE: &str = "history.csv";
pub const EXPERIMENTS_FILE: &str = "experiments_all.csv";

/// A CSV file that only grows. The header is written when the file is created.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
    header: Vec<String>,
}

impl CsvLog {
    pub fn open(path: impl AsRef<Path>, header: Vec<String>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let is_new = fs::metadata(&path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);

        if is_new {
            let mut writer = csv::Writer::from_path(&path)
                .with_context(|| format!("unable to create log '{}'", path.display()))?;
            writer.write_record(&header)?;
            writer.flush()?;
        } else {
            let mut reader = csv::Reader::from_path(&path)
                .with_context(|| format!("unable to read log '{}'", path.display()))?;
            let existing = reader.headers()?;
            if existing.iter().ne(header.iter().map(|name| name.as_str())) {
                warn!(
                    "the header of '{}' differs from the current columns, rows are appended anyway",
                    path.display()
                );
            }
        }

        Ok(Self { path, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Appends one row.
    pub fn append<I, S>(&self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("unable to append to '{}'", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(row)?;
        writer.flush()?;
        Ok(())
    }
}

/// The training phase an epoch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Warmup,
    Train,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warmup => f.write_str("warmup"),
            Self::Train => f.write_str("train"),
        }
    }
}

/// One epoch in `history.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub epoch: usize,
    pub phase: Phase,
    pub learning_rate: f64,
    pub loss: f64,
    pub val_loss: f64,
}

/// The per-epoch loss history.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    log: CsvLog,
}

impl HistoryLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let header = ["epoch", "phase", "learning_rate", "loss", "val_loss"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        Ok(Self {
            log: CsvLog::open(path, header)?,
        })
    }

    pub fn append(&self, row: &HistoryRow) -> Result<()> {
        let HistoryRow {
            epoch,
            phase,
            learning_rate,
            loss,
            val_loss,
        } = *row;
        self.log.append([
            epoch.to_string(),
            phase.to_string(),
            learning_rate.to_string(),
            loss.to_string(),
            val_loss.to_string(),
        ])
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

/// Reads back a history file.
pub fn read_history(path: impl AsRef<Path>) -> Result<Vec<HistoryRow>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("unable to read history '{}'", path.display()))?;
    let rows: Vec<HistoryRow> = reader.deserialize().try_collect()?;
    Ok(rows)
}

/// One row of `experiments_all.csv`, written after each iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub date: DateTime<Local>,
    pub exp_id: String,
    pub split: Option<usize>,
    pub model_type: ModelKind,
    pub iteration: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub loss: f64,
    pub val_loss: f64,
    pub train_time: Duration,
    /// Empty for objectives that are not evaluated by accuracy-at-k.
    pub accuracies: Vec<AccuracyAtK>,
    /// Compact JSON of the effective configuration.
    pub config: String,
}

/// The experiment log shared by all runs in an experiment folder.
#[derive(Debug, Clone)]
pub struct ExperimentLog {
    log: CsvLog,
    k_list: Vec<usize>,
}

impl ExperimentLog {
    pub fn open(path: impl AsRef<Path>, k_list: &[usize]) -> Result<Self> {
        let header = [
            "date",
            "exp_id",
            "split",
            "model_type",
            "iteration",
            "epoch",
            "learning_rate",
            "loss",
            "val_loss",
            "train_secs",
        ]
        .iter()
        .map(|name| name.to_string())
        .chain(
            k_list
                .iter()
                .flat_map(|k| [format!("acc@{}", k), format!("std@{}", k)]),
        )
        .chain(iter::once("config".to_string()))
        .collect();

        Ok(Self {
            log: CsvLog::open(path, header)?,
            k_list: k_list.to_vec(),
        })
    }

    pub fn append(&self, record: &ExperimentRecord) -> Result<()> {
        let ExperimentRecord {
            ref date,
            ref exp_id,
            split,
            model_type,
            iteration,
            epoch,
            learning_rate,
            loss,
            val_loss,
            train_time,
            ref accuracies,
            ref config,
        } = *record;

        let accuracy_cells = self.k_list.iter().flat_map(|k| {
            match accuracies.iter().find(|accuracy| accuracy.k == *k) {
                Some(accuracy) => [format!("{:.2}", accuracy.mean), format!("{:.2}", accuracy.std)],
                None => [String::new(), String::new()],
            }
        });

        let row: Vec<String> = [
            date.to_rfc3339(),
            exp_id.clone(),
            split.map(|split| split.to_string()).unwrap_or_default(),
            model_type.to_string(),
            iteration.to_string(),
            epoch.to_string(),
            learning_rate.to_string(),
            loss.to_string(),
            val_loss.to_string(),
            format!("{:.3}", train_time.as_secs_f64()),
        ]
        .into_iter()
        .chain(accuracy_cells)
        .chain(iter::once(config.clone()))
        .collect();

        self.log.append(row)
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}
