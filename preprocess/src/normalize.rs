//! The image normalizer: crop by mask, resize to the network input and store
//! as PNG.

use crate::{
    common::*,
    crop::crop_by_mask,
    mask::{Mask, MaskDecision, MaskSession},
    rearrange::{rearrange_by_label, RearrangeSummary},
};

/// Options of [Preprocessor].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessorInit {
    /// An image file or a folder of images. Subdirectories are ignored.
    pub input: PathBuf,
    /// Output root. Files are written to `<output>/<input name>`.
    pub output: PathBuf,
    /// A `file,label` CSV restricting the processed files of a folder. The
    /// outputs are moved into per-label folders afterwards.
    pub label_file: Option<PathBuf>,
    /// Zero-based index of the first file to process in the sorted listing.
    pub start_index: usize,
    pub width: u32,
    pub height: u32,
    /// Expand crops to squares.
    pub square: bool,
    /// Pixels added around the mask bounding box.
    pub padding: u32,
}

impl PreprocessorInit {
    /// Fills sizes from the model input and paths from the `prod` section.
    pub fn from_config(
        config: &Config,
        input: PathBuf,
        output: Option<PathBuf>,
        label_file: Option<PathBuf>,
    ) -> Self {
        Self {
            input,
            output: output.unwrap_or_else(|| config.prod.output.clone()),
            label_file: label_file.or_else(|| config.prod.lfile.clone()),
            start_index: 0,
            width: config.model.input_width,
            height: config.model.input_height,
            square: config.square_input(),
            padding: 0,
        }
    }

    /// Resolves and validates the input file list.
    pub fn build(self) -> Result<Preprocessor> {
        let Self {
            input,
            output,
            label_file,
            start_index,
            width,
            height,
            square,
            padding,
        } = self;

        if width == 0 || height == 0 {
            return Err(PieError::config("target width and height must be positive").into());
        }
        if !input.exists() {
            return Err(PieError::data(format!(
                "image file or folder '{}' does not exist",
                input.display()
            ))
            .into());
        }

        let (files, labels) = if input.is_dir() {
            match &label_file {
                Some(path) => {
                    let labels = LabelFile::open(path)?;
                    info!(
                        "reading only the {} files listed in '{}'",
                        labels.len(),
                        path.display()
                    );
                    let files: Vec<PathBuf> = labels
                        .files()
                        .map(|file| {
                            let path = input.join(file);
                            if path.is_file() {
                                Ok(path)
                            } else {
                                Err(PieError::data(format!(
                                    "'{}' is listed in the label file but does not exist",
                                    path.display()
                                )))
                            }
                        })
                        .try_collect()?;
                    (files, Some(labels))
                }
                None => {
                    let files: Vec<PathBuf> = fs::read_dir(&input)
                        .with_context(|| format!("unable to list '{}'", input.display()))?
                        .map(|entry| -> Result<_> { Ok(entry?.path()) })
                        .filter_ok(|path| path.is_file())
                        .try_collect()?;
                    let (images, others): (Vec<_>, Vec<_>) =
                        files.into_iter().partition(|path| is_image_file(path));
                    for path in others {
                        debug!("ignore non-image file '{}'", path.display());
                    }
                    info!(
                        "found {} files in '{}', subdirectories are ignored",
                        images.len(),
                        input.display()
                    );
                    (images, None)
                }
            }
        } else {
            if label_file.is_some() {
                warn!("the label file only applies to folder inputs and is ignored");
            }
            (vec![input.clone()], None)
        };

        let files: Vec<_> = files.into_iter().sorted().skip(start_index).collect();

        // outputs are named by stem
        let mut stems = HashMap::new();
        for path in &files {
            if let Some(other) = stems.insert(file_stem(path)?, path) {
                return Err(PieError::data(format!(
                    "'{}' and '{}' share a file name and would overwrite each other",
                    other.display(),
                    path.display()
                ))
                .into());
            }
        }

        let folder_name = if input.is_dir() {
            input.file_name().map(|name| name.to_owned())
        } else {
            input.file_stem().map(|name| name.to_owned())
        }
        .ok_or_else(|| PieError::data(format!("invalid input path '{}'", input.display())))?;
        let output_dir = output.join(folder_name);

        Ok(Preprocessor {
            files,
            labels,
            output_dir,
            params: Arc::new(WorkerParams {
                width,
                height,
                square,
                padding,
            }),
        })
    }
}

#[derive(Debug, Clone)]
struct WorkerParams {
    width: u32,
    height: u32,
    square: bool,
    padding: u32,
}

/// A job sent from the masking coordinator to the workers.
#[derive(Debug, Clone)]
struct Job {
    path: PathBuf,
    mask: Option<Mask>,
}

/// Counts reported after a preprocessing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub output_dir: PathBuf,
    /// Files written to the output directory.
    pub processed: usize,
    /// Files excluded by the user.
    pub skipped: usize,
    /// Whether the user stopped the job early.
    pub aborted: bool,
    /// Set when outputs were moved into per-label folders.
    pub rearranged: Option<RearrangeSummary>,
}

/// A resolved preprocessing job.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    files: Vec<PathBuf>,
    labels: Option<LabelFile>,
    output_dir: PathBuf,
    params: Arc<WorkerParams>,
}

impl Preprocessor {
    /// Input files in processing order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs the job.
    ///
    /// The session is asked about each file in order on a blocking thread.
    /// Accepted files are handed to a worker pool that crops, resizes and
    /// writes them. Rearrangement by label starts after every worker finished.
    pub async fn run<S>(&self, session: S) -> Result<PreprocessSummary>
    where
        S: MaskSession + 'static,
    {
        let output_dir = self.output_dir.clone();
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("unable to create '{}'", output_dir.display()))?;
        info!(
            "processing {} files into '{}'",
            self.files.len(),
            output_dir.display()
        );

        let (job_tx, job_rx) = flume::bounded::<Job>(1);

        // sequential masking on a single coordinating thread
        let coordinator_future = {
            let files = self.files.clone();
            let mut session = session;

            tokio::task::spawn_blocking(move || -> Result<_> {
                let mut skipped = 0;

                for path in files {
                    match session.decide(&path)? {
                        MaskDecision::Save(mask) => {
                            if job_tx.send(Job { path, mask }).is_err() {
                                break;
                            }
                        }
                        MaskDecision::Skip => {
                            info!("skipped '{}'", path.display());
                            skipped += 1;
                        }
                        MaskDecision::Abort => {
                            warn!("aborted by user before '{}'", path.display());
                            return Ok((skipped, true));
                        }
                    }
                }

                Ok((skipped, false))
            })
            .map(|result| Fallible::Ok(result??))
        };

        // parallel crop, resize and store
        let worker_future = {
            let params = self.params.clone();
            let output_dir = output_dir.clone();

            job_rx
                .into_stream()
                .par_map(None, move |job| {
                    let params = params.clone();
                    let output_dir = output_dir.clone();
                    move || normalize_one(&job, &params, &output_dir)
                })
                .try_collect::<Vec<PathBuf>>()
                .instrument(info_span!("normalize"))
        };

        let ((skipped, aborted), outputs) = futures::try_join!(coordinator_future, worker_future)?;
        let processed = outputs.len();
        info!("processed {} images, skipped {}", processed, skipped);

        let rearranged = match &self.labels {
            Some(labels) => {
                info!("rearranging files into per-label folders");
                Some(rearrange_by_label(&output_dir, labels)?)
            }
            None => None,
        };

        Ok(PreprocessSummary {
            output_dir,
            processed,
            skipped,
            aborted,
            rearranged,
        })
    }
}

fn normalize_one(job: &Job, params: &WorkerParams, output_dir: &Path) -> Result<PathBuf> {
    let Job { path, mask } = job;
    let WorkerParams {
        width,
        height,
        square,
        padding,
    } = *params;
    debug!("processing '{}'", path.display());

    let image = image::open(path)
        .with_context(|| format!("unable to decode image '{}'", path.display()))?
        .to_rgb8();
    let cropped = crop_by_mask(image, mask.as_ref(), padding, square);
    let resized = image::imageops::resize(&cropped, width, height, FilterType::Triangle);

    let output_path = output_dir.join(format!("{}.png", file_stem(path)?));
    resized
        .save_with_format(&output_path, ImageFormat::Png)
        .with_context(|| format!("unable to write '{}'", output_path.display()))?;
    Ok(output_path)
}
