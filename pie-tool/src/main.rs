use anyhow::{ensure, Context, Result};
use clap::Parser;
use pie_data::{config::Config, error::PieError};
use pie_embedding::{
    artifact::{read_embeddings, read_labels},
    compare_answers, predict_light, Answer, Distance,
};
use prettytable::{cell, row, Table};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

const DEFAULT_K: usize = 5;

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Rank gallery identities for each query embedding
    Rank {
        /// configuration file providing prod.embeddings and prod.prediction_k
        #[clap(short = 'c', long)]
        conf: Option<PathBuf>,
        /// gallery embedding table, defaults to prod.embeddings
        #[clap(long)]
        db: Option<PathBuf>,
        /// labels table aligned with the gallery
        #[clap(long)]
        labels: PathBuf,
        /// query embedding table, one query per row
        #[clap(long)]
        query: PathBuf,
        /// number of identities to report, defaults to prod.prediction_k
        #[clap(short = 'k', long)]
        k: Option<usize>,
        #[clap(long, default_value = "l2")]
        distance: Distance,
        /// write the answers as JSON
        #[clap(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Check two JSON answer files for agreement
    Compare {
        lhs: PathBuf,
        rhs: PathBuf,
        #[clap(long, default_value = "1e-5")]
        tolerance: f64,
    },
}

/// Answers of one query, or of several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum AnswerFile {
    Single(Vec<Answer>),
    Many(Vec<Vec<Answer>>),
}

impl AnswerFile {
    fn open(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read '{}'", path.display()))?;
        let file = serde_json::from_str(&text).map_err(|err| {
            PieError::data(format!("invalid answer file '{}': {}", path.display(), err))
        })?;
        Ok(file)
    }

    fn into_queries(self) -> Vec<Vec<Answer>> {
        match self {
            Self::Single(answers) => vec![answers],
            Self::Many(queries) => queries,
        }
    }
}

fn main() -> Result<()> {
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    match Opts::parse() {
        Opts::Rank {
            conf,
            db,
            labels,
            query,
            k,
            distance,
            output,
        } => {
            let config = conf
                .map(|path| {
                    Config::open(&path).with_context(|| {
                        format!("failed to load config file '{}'", path.display())
                    })
                })
                .transpose()?;
            let (db, k) = rank_inputs(config.as_ref(), db, k)?;
            let queries = rank(&db, &labels, &query, k, distance)?;
            queries.iter().enumerate().for_each(|(index, answers)| {
                println!("query {}", index);
                answers_table(answers).printstd();
            });

            if let Some(output) = output {
                let file = match queries.len() {
                    1 => AnswerFile::Single(queries.into_iter().flatten().collect()),
                    _ => AnswerFile::Many(queries),
                };
                fs::write(&output, serde_json::to_string_pretty(&file)?)
                    .with_context(|| format!("unable to write '{}'", output.display()))?;
                info!("saved answers to '{}'", output.display());
            }
        }
        Opts::Compare {
            lhs,
            rhs,
            tolerance,
        } => {
            compare(&lhs, &rhs, tolerance)?;
            println!("rankings agree within tolerance of {}", tolerance);
        }
    }

    Ok(())
}

/// Fills the gallery and `k` from the configuration when not given.
fn rank_inputs(
    config: Option<&Config>,
    db: Option<PathBuf>,
    k: Option<usize>,
) -> Result<(PathBuf, usize)> {
    let prod = config.map(|config| &config.prod);
    let db = db
        .or_else(|| prod.and_then(|prod| prod.embeddings.clone()))
        .ok_or_else(|| PieError::config("no gallery table, pass --db or set prod.embeddings"))?;
    let k = k.or_else(|| prod.map(|prod| prod.prediction_k)).unwrap_or(DEFAULT_K);
    Ok((db, k))
}

fn rank(
    db: &Path,
    labels: &Path,
    query: &Path,
    k: usize,
    distance: Distance,
) -> Result<Vec<Vec<Answer>>> {
    let gallery = read_embeddings(db)?;
    let names: Vec<String> = read_labels(labels)?
        .into_iter()
        .map(|record| record.name)
        .collect();
    let queries = read_embeddings(query)?;
    info!(
        "ranking {} queries against {} gallery embeddings",
        queries.nrows(),
        gallery.nrows()
    );

    queries
        .outer_iter()
        .map(|query| predict_light(query, gallery.view(), &names, k, distance))
        .collect()
}

fn compare(lhs: &Path, rhs: &Path, tolerance: f64) -> Result<()> {
    let lhs = AnswerFile::open(lhs)?.into_queries();
    let rhs = AnswerFile::open(rhs)?.into_queries();
    ensure!(
        lhs.len() == rhs.len(),
        "answer files hold {} and {} queries",
        lhs.len(),
        rhs.len()
    );

    for (index, (lhs, rhs)) in lhs.iter().zip(&rhs).enumerate() {
        compare_answers(lhs, rhs, tolerance).with_context(|| format!("in query {}", index))?;
    }
    Ok(())
}

fn answers_table(answers: &[Answer]) -> Table {
    let mut table = Table::new();
    table.add_row(row!["rank", "label", "distance"]);
    answers.iter().enumerate().for_each(|(rank, answer)| {
        table.add_row(row![rank, answer.label, format!("{:.6}", answer.distance)]);
    });
    table
}
