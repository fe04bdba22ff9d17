use anyhow::{Context, Result};
use pie_data::{config::Config, sampler::Sampler};
use pie_train::{inspect::BatchComposition, train::experiment_dir, Partition};
use std::{
    env,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Mutex,
};
use structopt::StructOpt;
use tracing::{info, info_span};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Prepare and inspect training data of identification models
enum Args {
    /// Write the train/valid partition as CSV
    Split {
        #[structopt(short = "c", long, default_value = "configs/manta.json")]
        /// configuration file
        conf: PathBuf,
        #[structopt(long)]
        /// fold held out by the class-disjoint split
        split_num: Option<usize>,
        #[structopt(short = "o", long)]
        /// output CSV, defaults to split.csv in the experiment folder
        output: Option<PathBuf>,
    },
    /// Print dataset statistics and the composition of sampled batches
    Inspect {
        #[structopt(short = "c", long, default_value = "configs/manta.json")]
        /// configuration file
        conf: PathBuf,
        #[structopt(long)]
        split_num: Option<usize>,
        #[structopt(short = "n", long, default_value = "5")]
        /// number of batches to print
        num_batches: usize,
        #[structopt(long)]
        /// sampler seed
        seed: Option<u64>,
    },
}

/// Log file written into the experiment folder when `stdout-file` is set.
const LOG_FILE: &str = "log.txt";

impl Args {
    fn conf(&self) -> &Path {
        match self {
            Self::Split { conf, .. } | Self::Inspect { conf, .. } => conf,
        }
    }

    fn split_num(&self) -> Option<usize> {
        match *self {
            Self::Split { split_num, .. } | Self::Inspect { split_num, .. } => split_num,
        }
    }
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::from_args();
    let config = open_config(args.conf())?;

    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let file_layer = if config.general.stdout_file {
        let dir = experiment_dir(&config, args.split_num());
        fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create '{}'", dir.display()))?;
        let path = dir.join(LOG_FILE);
        let file = File::create(&path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(Mutex::new(file));
        Some(layer)
    } else {
        None
    };
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
        .with(fmt_layer)
        .with(file_layer)
        .init();

    match args {
        Args::Split {
            split_num, output, ..
        } => {
            let _span = info_span!("split").entered();
            let Partition { split, .. } = Partition::load(&config, split_num)?;
            split.train.stats().report("train");
            split.valid.stats().report("valid");

            let output = match output {
                Some(output) => output,
                None => {
                    let dir = experiment_dir(&config, split_num);
                    fs::create_dir_all(&dir)
                        .with_context(|| format!("unable to create '{}'", dir.display()))?;
                    dir.join("split.csv")
                }
            };
            split.export_csv(&output)?;
            info!("saved the partition to '{}'", output.display());
        }
        Args::Inspect {
            split_num,
            num_batches,
            seed,
            ..
        } => {
            let _span = info_span!("inspect").entered();
            let Partition { split, label_index } = Partition::load(&config, split_num)?;
            split.train.stats().report("train");
            split.valid.stats().report("valid");

            let sampler = Sampler::from_config(&config, &split.train, &label_index, seed)?;
            sampler
                .take(num_batches)
                .enumerate()
                .for_each(|(index, batch)| {
                    let composition = BatchComposition::new(&batch, &label_index);
                    info!("batch {}: {}", index, composition);
                });
        }
    }

    Ok(())
}

fn open_config(path: &Path) -> Result<Config> {
    Config::open(path).with_context(|| format!("failed to load config file '{}'", path.display()))
}
