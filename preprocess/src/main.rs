use anyhow::{bail, Context, Result};
use pie_data::{config::Config, error::PieError};
use pie_preprocess::{
    PreprocessSummary, PreprocessorInit, StoredMaskSession, TerminalMaskSession,
};
use std::{env, io, path::PathBuf, str::FromStr};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Crop, resize and convert images before training or embedding
struct Args {
    #[structopt(short = "i", long)]
    /// image file or folder with images to process (not nested)
    pub impath: PathBuf,
    #[structopt(short = "d", long, default_value = "yes")]
    /// yes/no, prompt for a mask outlining the pattern of interest
    pub draw: YesNo,
    #[structopt(short = "c", long, default_value = "configs/manta.json")]
    /// configuration file
    pub conf: PathBuf,
    #[structopt(short = "o", long)]
    /// output folder, defaults to prod.output in the configuration
    pub output: Option<PathBuf>,
    #[structopt(short = "l", long)]
    /// csv file with a file,label header listing the files to process
    pub lfile: Option<PathBuf>,
    #[structopt(short = "x", long, default_value = "0")]
    /// zero-based index of the file to resume from
    pub start_index: usize,
    #[structopt(long)]
    /// folder where masks are saved and reused
    pub mask_dir: Option<PathBuf>,
    #[structopt(long, default_value = "0")]
    /// pixels added around the mask bounding box
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YesNo {
    Yes,
    No,
}

impl FromStr for YesNo {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let value = match text.to_ascii_lowercase().as_str() {
            "yes" | "true" | "t" | "y" | "1" => Self::Yes,
            "no" | "false" | "f" | "n" | "0" => Self::No,
            _ => bail!("expect yes or no, but get '{}'", text),
        };
        Ok(value)
    }
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
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
        .init();

    // parse arguments
    let Args {
        impath,
        draw,
        conf,
        output,
        lfile,
        start_index,
        mask_dir,
        padding,
    } = Args::from_args();
    let config = Config::open(&conf)
        .with_context(|| format!("failed to load config file '{}'", conf.display()))?;

    let preprocessor = PreprocessorInit {
        start_index,
        padding,
        ..PreprocessorInit::from_config(&config, impath, output, lfile)
    }
    .build()?;
    info!("output files will be stored in '{}'", preprocessor.output_dir().display());

    let summary = if draw == YesNo::Yes {
        info!("outline the pattern with 's x,y x,y ...', keep the whole image with 's', skip with 'q', exit with 'esc'");
        let session =
            TerminalMaskSession::new(io::BufReader::new(io::stdin()), io::stderr(), mask_dir);
        preprocessor.run(session).await?
    } else {
        preprocessor.run(StoredMaskSession::new(mask_dir)).await?
    };

    let PreprocessSummary {
        output_dir,
        processed,
        skipped,
        aborted,
        rearranged,
    } = summary;
    info!("total processed {} images, skipped {}", processed, skipped);
    if let Some(rearranged) = rearranged {
        info!("moved {} files into label folders", rearranged.moved);
        if !rearranged.unlabeled.is_empty() {
            warn!("{} files have no label", rearranged.unlabeled.len());
        }
    }
    info!("saved preprocessed images to '{}'", output_dir.display());

    if aborted {
        let err = PieError::UserAbort {
            processed,
            output_dir,
        };
        warn!("{}, partial output is kept", err);
        std::process::exit(2);
    }

    Ok(())
}
