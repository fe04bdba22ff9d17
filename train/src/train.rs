//! The training loop orchestrator.

use crate::{
    common::*,
    inspect::BatchComposition,
    logging::{
        read_history, ExperimentLog, ExperimentRecord, HistoryLog, HistoryRow, Phase,
        EXPERIMENTS_FILE, HISTORY_FILE,
    },
    model::EmbeddingModel,
    utils::{self, CheckpointTag, RateCounter, BEST_WEIGHTS_FILE},
};

pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";
pub const LABEL_INDEX_FILE: &str = "label_index.csv";

/// Training and validation data of an experiment.
#[derive(Debug, Clone)]
pub struct Partition {
    pub split: Split,
    pub label_index: LabelIndex,
}

impl Partition {
    /// Uses `evaluate.test_set` as the validation set when it is configured,
    /// otherwise splits the training folder with the policy of the objective.
    pub fn load(config: &Config, split_num: Option<usize>) -> Result<Self> {
        let train_dir = &config.data.train_image_folder;
        let pose_file = config.data.pose_file.as_deref();

        match &config.evaluate.test_set {
            Some(test_dir) => {
                info!("loading test set from '{}'", test_dir.display());
                let train = Dataset::load(train_dir, pose_file)?;
                let valid = Dataset::load(test_dir, pose_file)?;

                let train_index = train.label_index();
                let num_shared = valid
                    .label_index()
                    .labels()
                    .filter(|label| train_index.class_of(label).is_some())
                    .count();
                info!(
                    "{} identities appear in both the training and the test set",
                    num_shared
                );

                // classes cover both sets
                let label_index = LabelIndex::new(
                    train
                        .records
                        .iter()
                        .chain(&valid.records)
                        .map(|record| &record.label),
                );
                let num_train = train.len();
                let num_valid = valid.len();
                let split = Split {
                    train,
                    valid,
                    train_indexes: (0..num_train).collect(),
                    valid_indexes: (num_train..(num_train + num_valid)).collect(),
                };

                Ok(Self { split, label_index })
            }
            None => {
                info!("no test set, splitting '{}'", train_dir.display());
                let dataset = Dataset::load(train_dir, pose_file)?;
                let split = SplitPolicy::from_config(config, split_num)?.split(&dataset)?;
                Ok(Self {
                    split,
                    label_index: dataset.label_index(),
                })
            }
        }
    }
}

/// Where the initial weights came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    BestWeights(PathBuf),
    Checkpoint(PathBuf),
    Pretrained(PathBuf),
    /// Nothing usable was found. Training starts with a warm-up.
    Scratch,
}

/// The state of a [Trainer].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrainingState {
    /// Trains fresh weights with a raised learning rate.
    Warmup,
    /// The next iteration to run. It equals the iteration count once all
    /// iterations are done.
    Iterating { iteration: usize },
    Done,
}

/// The outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub exp_dir: PathBuf,
    pub weight_source: WeightSource,
    /// Epochs recorded in the history, including earlier runs.
    pub epochs: usize,
    pub best_val_loss: Option<f64>,
    /// Accuracies of the last iteration.
    pub accuracies: Vec<AccuracyAtK>,
    pub last_checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct EpochLosses {
    loss: f64,
    val_loss: f64,
}

/// Builds a [Trainer].
#[derive(Debug, Clone)]
pub struct TrainerInit {
    pub config: Arc<Config>,
    /// The fold held out by a class-disjoint split.
    pub split_num: Option<usize>,
    /// Seeds batch sampling, augmentation and evaluation draws.
    pub seed: Option<u64>,
}

impl TrainerInit {
    /// Prepares the experiment folder, the data and the initial weights.
    pub async fn build<M>(self, mut model: M) -> Result<Trainer<M>>
    where
        M: EmbeddingModel,
    {
        let Self {
            config,
            split_num,
            seed,
        } = self;
        check_objective(&config)?;

        // create the experiment folder and save config
        let exp_dir = experiment_dir(&config, split_num);
        tokio::fs::create_dir_all(&exp_dir)
            .await
            .with_context(|| format!("unable to create '{}'", exp_dir.display()))?;
        {
            let text = serde_json::to_string_pretty(&*config)?;
            tokio::fs::write(exp_dir.join(CONFIG_SNAPSHOT_FILE), text).await?;
        }
        info!("experiment folder '{}'", exp_dir.display());

        // load and split data
        let Partition { split, label_index } = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || Partition::load(&config, split_num)).await??
        };
        split.train.stats().report("train");
        split.valid.stats().report("valid");
        if config.model.kind == ModelKind::TripletPose {
            let poses = split
                .train
                .records
                .iter()
                .chain(&split.valid.records)
                .filter_map(|record| record.pose.as_deref());
            check_poses(poses, config.model.n_poses)?;
        }

        let label_index_path = exp_dir.join(LABEL_INDEX_FILE);
        let label_index = if label_index_path.is_file() {
            LabelIndex::load_validated(&label_index_path, label_index.labels())?
        } else {
            label_index.save(&label_index_path)?;
            label_index
        };

        let train_classes = classes_of(&split.train, &label_index)?;
        let valid_classes = classes_of(&split.valid, &label_index)?;
        if config.model.kind.is_metric_learning() {
            check_queries(&valid_classes, config.evaluate.move_to_dataset)?;
        }

        // samplers
        let sampler = Sampler::from_config(&config, &split.train, &label_index, seed)?;
        let valid_sampler = validation_sampler(
            &config,
            &split.valid,
            &label_index,
            seed.map(|seed| seed.wrapping_add(1)),
        )?;

        // decode images
        let (width, height) = (config.model.input_width, config.model.input_height);
        let (train_images, valid_images) = futures::try_join!(
            split.train.load_images(width, height),
            split.valid.load_images(width, height)
        )?;

        let augmentation =
            AugmentationInit::from_profile(config.train.aug_rate, config.model.backend).build()?;
        let normalizer =
            AugmentationInit::identity(Normalization::for_backend(config.model.backend)).build()?;
        let train_loader = BatchLoader::new(train_images, augmentation, seed);
        let valid_loader = BatchLoader::new(valid_images, normalizer.clone(), seed);

        // load initial weights
        let weight_source = resolve_weights(
            &mut model,
            &exp_dir,
            config.train.pretrained_weights.as_deref(),
        )?;

        // restore progress of earlier runs
        let history = HistoryLog::open(exp_dir.join(HISTORY_FILE))?;
        let previous = read_history(history.path())?;
        let epoch = previous.last().map(|row| row.epoch).unwrap_or(0);
        let best_val_loss = match weight_source {
            WeightSource::BestWeights(_) => previous
                .iter()
                .map(|row| row.val_loss)
                .filter(|loss| !loss.is_nan())
                .fold(None, |best: Option<f64>, loss| {
                    Some(best.map_or(loss, |best| best.min(loss)))
                }),
            _ => None,
        };
        let experiments =
            ExperimentLog::open(exp_dir.join(EXPERIMENTS_FILE), &config.evaluate.accuracy_at_k)?;

        let batch_size = config.batch_size();
        let steps_per_epoch = split.train.len() / batch_size + 1;
        let valid_steps = split.valid.len() / batch_size + 1;
        let num_iterations = (config.train.nb_epochs + config.train.log_step - 1) / config.train.log_step;
        info!(
            "{} steps per epoch, {} iterations of {} epochs",
            steps_per_epoch, num_iterations, config.train.log_step
        );

        let state = if weight_source == WeightSource::Scratch && config.train.warm_up_epochs > 0 {
            TrainingState::Warmup
        } else {
            TrainingState::Iterating { iteration: 0 }
        };
        let config_json = serde_json::to_string(&*config)?;

        Ok(Trainer {
            config,
            split_num,
            seed,
            exp_dir,
            model,
            state,
            weight_source,
            sampler,
            valid_sampler,
            train_loader,
            valid_loader,
            normalizer,
            label_index,
            train_classes,
            valid_classes,
            steps_per_epoch,
            valid_steps,
            num_iterations,
            epoch,
            best_val_loss,
            last_accuracies: vec![],
            last_checkpoint: None,
            history,
            experiments,
            config_json,
        })
    }
}

/// Drives a model through warm-up, training iterations and final checkpointing.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Trainer<M> {
    config: Arc<Config>,
    split_num: Option<usize>,
    seed: Option<u64>,
    exp_dir: PathBuf,
    #[derivative(Debug = "ignore")]
    model: M,
    state: TrainingState,
    weight_source: WeightSource,
    sampler: Sampler,
    valid_sampler: Sampler,
    train_loader: BatchLoader,
    valid_loader: BatchLoader,
    normalizer: Augmentation,
    label_index: LabelIndex,
    train_classes: Vec<usize>,
    valid_classes: Vec<usize>,
    steps_per_epoch: usize,
    valid_steps: usize,
    num_iterations: usize,
    epoch: usize,
    best_val_loss: Option<f64>,
    last_accuracies: Vec<AccuracyAtK>,
    last_checkpoint: Option<PathBuf>,
    history: HistoryLog,
    experiments: ExperimentLog,
    config_json: String,
}

impl<M> Trainer<M>
where
    M: EmbeddingModel,
{
    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn exp_dir(&self) -> &Path {
        &self.exp_dir
    }

    pub fn weight_source(&self) -> &WeightSource {
        &self.weight_source
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn num_iterations(&self) -> usize {
        self.num_iterations
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn summary(&self) -> TrainSummary {
        TrainSummary {
            exp_dir: self.exp_dir.clone(),
            weight_source: self.weight_source.clone(),
            epochs: self.epoch,
            best_val_loss: self.best_val_loss,
            accuracies: self.last_accuracies.clone(),
            last_checkpoint: self.last_checkpoint.clone(),
        }
    }

    /// Runs until [TrainingState::Done].
    pub fn run(&mut self) -> Result<TrainSummary> {
        while self.step()? != TrainingState::Done {}
        Ok(self.summary())
    }

    /// Performs the work of the current state and moves to the next one.
    pub fn step(&mut self) -> Result<TrainingState> {
        let next = match self.state {
            TrainingState::Warmup => {
                self.warm_up()?;
                TrainingState::Iterating { iteration: 0 }
            }
            TrainingState::Iterating { iteration } if iteration < self.num_iterations => {
                self.iterate(iteration)?;
                TrainingState::Iterating {
                    iteration: iteration + 1,
                }
            }
            TrainingState::Iterating { .. } => {
                self.finish()?;
                TrainingState::Done
            }
            TrainingState::Done => TrainingState::Done,
        };
        self.state = next;
        Ok(next)
    }

    fn warm_up(&mut self) -> Result<()> {
        let span = info_span!("warmup");
        let _enter = span.enter();

        let num_epochs = self.config.train.warm_up_epochs;
        let learning_rate =
            (self.config.train.learning_rate * self.config.train.warm_up_lr_factor).raw();
        info!(
            "first training, warming up random weights for {} epochs at learning rate {}",
            num_epochs, learning_rate
        );
        self.run_epochs(num_epochs, learning_rate, Phase::Warmup)?;
        Ok(())
    }

    fn iterate(&mut self, iteration: usize) -> Result<()> {
        let span = info_span!("iteration", iteration = iteration + 1);
        let _enter = span.enter();
        info!(
            "starting iteration {}/{}",
            iteration + 1,
            self.num_iterations
        );

        let learning_rate = self.config.train.learning_rate.raw();
        let since = Instant::now();
        let EpochLosses { loss, val_loss } = self
            .run_epochs(self.config.train.log_step, learning_rate, Phase::Train)?
            .ok_or_else(|| format_err!("an iteration must run at least one epoch"))?;
        let train_time = since.elapsed();

        let accuracies = if self.config.model.kind.is_metric_learning() {
            info!("evaluating");
            self.evaluate()?
        } else {
            vec![]
        };
        accuracies.iter().for_each(|accuracy| {
            info!(
                "accuracy@{}: {:.2}% (std {:.2})",
                accuracy.k, accuracy.mean, accuracy.std
            );
        });

        self.experiments.append(&ExperimentRecord {
            date: Local::now(),
            exp_id: self.config.train.exp_id.clone(),
            split: self.split_num,
            model_type: self.config.model.kind,
            iteration: iteration + 1,
            epoch: self.epoch,
            learning_rate,
            loss,
            val_loss,
            train_time,
            accuracies: accuracies.clone(),
            config: self.config_json.clone(),
        })?;
        self.last_accuracies = accuracies;

        if (iteration + 1) % self.config.train.checkpoint_every == 0 {
            let path = utils::save_checkpoint(
                &self.model,
                &self.exp_dir,
                CheckpointTag::Iteration(iteration + 1),
            )?;
            self.last_checkpoint = Some(path);
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let path = utils::save_checkpoint(&self.model, &self.exp_dir, CheckpointTag::Last)?;
        self.last_checkpoint = Some(path);
        info!(
            "training is done after {} epochs, best val_loss {:?}",
            self.epoch, self.best_val_loss
        );
        Ok(())
    }

    /// Runs epochs, logs their losses and keeps the best weights.
    fn run_epochs(
        &mut self,
        num_epochs: usize,
        learning_rate: f64,
        phase: Phase,
    ) -> Result<Option<EpochLosses>> {
        let mut last = None;

        for _ in 0..num_epochs {
            let epoch = self.epoch + 1;
            let loss = self.train_epoch(learning_rate)?;
            let val_loss = self.validate()?;
            info!(
                "{} epoch {}\tloss {:.5}\tval_loss {:.5}",
                phase, epoch, loss, val_loss
            );

            self.history.append(&HistoryRow {
                epoch,
                phase,
                learning_rate,
                loss,
                val_loss,
            })?;

            let improved = self.best_val_loss.map_or(true, |best| val_loss < best);
            if improved {
                let path = self.exp_dir.join(BEST_WEIGHTS_FILE);
                self.model
                    .save_weights(&path)
                    .with_context(|| format!("unable to save '{}'", path.display()))?;
                debug!("val_loss improved to {:.5}, saved best weights", val_loss);
                self.best_val_loss = Some(val_loss);
            }

            self.epoch = epoch;
            last = Some(EpochLosses { loss, val_loss });
        }

        Ok(last)
    }

    fn train_epoch(&mut self, learning_rate: f64) -> Result<f64> {
        let mut rate_counter = RateCounter::with_second_interval();
        let mut total = 0.0;

        for step in 0..self.steps_per_epoch {
            let batch = self
                .sampler
                .next()
                .ok_or_else(|| format_err!("the training sampler is exhausted"))?;
            if self.config.train.debug {
                info!(
                    "batch {}: {}",
                    step,
                    BatchComposition::new(&batch, &self.label_index)
                );
            }
            let batch = self.train_loader.load(&batch)?;
            let loss = self
                .model
                .train_step(&batch, learning_rate)
                .with_context(|| format!("training step {} failed", step))?;
            total += loss;
            rate_counter.step(batch.len());

            if let Some(throughput) = rate_counter.poll() {
                debug!(
                    "step {}/{}\tloss {:.5}\t{:.2} batches/s\t{:.1} samples/s",
                    step + 1,
                    self.steps_per_epoch,
                    loss,
                    throughput.steps_per_sec,
                    throughput.samples_per_sec
                );
            }
        }

        Ok(total / self.steps_per_epoch as f64)
    }

    fn validate(&mut self) -> Result<f64> {
        let mut total = 0.0;

        for _ in 0..self.valid_steps {
            let batch = self
                .valid_sampler
                .next()
                .ok_or_else(|| format_err!("the validation sampler is exhausted"))?;
            let batch = self.valid_loader.load(&batch)?;
            total += self.model.eval_step(&batch)?;
        }

        Ok(total / self.valid_steps as f64)
    }

    fn evaluate(&mut self) -> Result<Vec<AccuracyAtK>> {
        let batch_size = self.config.batch_size();
        let embedding_size = self.config.model.embedding_size;
        let train_emb = embed_images(
            &mut self.model,
            self.train_loader.images(),
            &self.normalizer,
            batch_size,
            embedding_size,
        )?;
        let valid_emb = embed_images(
            &mut self.model,
            self.valid_loader.images(),
            &self.normalizer,
            batch_size,
            embedding_size,
        )?;
        debug!(
            "computed {} training and {} validation embeddings",
            train_emb.nrows(),
            valid_emb.nrows()
        );

        let evaluate = &self.config.evaluate;
        pie_embedding::evaluate_one_vs_all(
            train_emb.view(),
            &self.train_classes,
            valid_emb.view(),
            &self.valid_classes,
            &EvaluationInit {
                n_eval_runs: evaluate.n_eval_epochs,
                move_to_db: evaluate.move_to_dataset,
                k_list: evaluate.accuracy_at_k.clone(),
                distance: self.config.train.distance.into(),
                seed: self.seed,
            },
        )
    }
}

/// Returns `exp_dir/exp_id`, or `exp_dir/exp_id-split-N` for a fold.
pub fn experiment_dir(config: &Config, split_num: Option<usize>) -> PathBuf {
    let name = match split_num {
        Some(split_num) => format!("{}-split-{}", config.train.exp_id, split_num),
        None => config.train.exp_id.clone(),
    };
    config.train.exp_dir.join(name)
}

/// Rejects option combinations no objective can train with.
fn check_objective(config: &Config) -> Result<()> {
    let model = &config.model;
    match model.kind {
        ModelKind::TripletPose => {
            if (model.rotate_poses || model.n_poses > 1) && config.data.pose_file.is_none() {
                return Err(PieError::config(
                    "TripletPose with poses requires data.pose_file",
                )
                .into());
            }
        }
        _ => {
            if model.rotate_poses {
                warn!("rotate_poses is ignored by {}", model.kind);
            }
        }
    }
    Ok(())
}

/// Loads the first usable weights: the best weights of the experiment, its
/// newest checkpoint, then the configured pretrained weights.
fn resolve_weights<M>(model: &mut M, exp_dir: &Path, pretrained: Option<&Path>) -> Result<WeightSource>
where
    M: EmbeddingModel,
{
    let best = exp_dir.join(BEST_WEIGHTS_FILE);
    if best.is_file() {
        info!("loading saved weights '{}'", best.display());
        model.load_weights(&best)?;
        return Ok(WeightSource::BestWeights(best));
    }

    if let Some(checkpoint) = utils::find_latest_checkpoint(exp_dir)? {
        info!("loading checkpoint '{}'", checkpoint.display());
        model.load_weights(&checkpoint)?;
        return Ok(WeightSource::Checkpoint(checkpoint));
    }

    if let Some(pretrained) = pretrained {
        if pretrained.is_file() {
            info!("loading pretrained weights '{}'", pretrained.display());
            model.load_weights(pretrained)?;
            return Ok(WeightSource::Pretrained(pretrained.to_owned()));
        }
        warn!("pretrained weights '{}' are not found", pretrained.display());
    }

    info!("no pre-trained weights are found");
    Ok(WeightSource::Scratch)
}

fn classes_of(dataset: &Dataset, label_index: &LabelIndex) -> Result<Vec<usize>> {
    dataset
        .records
        .iter()
        .map(|record| -> Result<usize> {
            let class = label_index.class_of(&record.label).ok_or_else(|| {
                PieError::data(format!("label '{}' is missing in the label index", record.label))
            })?;
            Ok(class)
        })
        .try_collect()
}

/// The pose tags of the data must fit in the configured pose buckets.
fn check_poses<'a>(poses: impl IntoIterator<Item = &'a str>, n_poses: usize) -> Result<()> {
    let distinct: Vec<&str> = poses.into_iter().unique().sorted().collect();
    if distinct.len() > n_poses {
        return Err(PieError::config(format!(
            "found {} pose tags ({}) but n_poses is {}",
            distinct.len(),
            distinct.join(", "),
            n_poses
        ))
        .into());
    }
    Ok(())
}

/// Accuracy evaluation needs a validation class with images left to query
/// after `move_to_dataset` of them join the gallery.
fn check_queries(valid_classes: &[usize], move_to_dataset: usize) -> Result<()> {
    let num_queryable = valid_classes
        .iter()
        .counts()
        .values()
        .filter(|&&count| count > move_to_dataset)
        .count();
    if num_queryable == 0 {
        return Err(PieError::data(format!(
            "no validation class has more than {} images to query",
            move_to_dataset
        ))
        .into());
    }
    debug!("{} validation classes can be queried", num_queryable);
    Ok(())
}

/// The validation set may hold fewer identities than a training batch.
fn validation_sampler(
    config: &Config,
    valid: &Dataset,
    label_index: &LabelIndex,
    seed: Option<u64>,
) -> Result<Sampler> {
    let num_classes = valid.stats().num_classes();
    let mut config = config.clone();
    if config.model.kind.is_metric_learning() && config.train.cl_per_batch > num_classes {
        debug!(
            "validation batches use {} classes instead of {}",
            num_classes, config.train.cl_per_batch
        );
        config.train.cl_per_batch = num_classes;
    }
    Sampler::from_config(&config, valid, label_index, seed)
        .context("unable to sample the validation set")
}

/// Embeds all images in batches without random transforms.
fn embed_images<M>(
    model: &mut M,
    images: &ImageSet,
    normalizer: &Augmentation,
    batch_size: usize,
    embedding_size: usize,
) -> Result<Array2<f32>>
where
    M: EmbeddingModel,
{
    let indexes: Vec<usize> = (0..images.len()).collect();
    let chunks: Vec<Array2<f32>> = indexes
        .chunks(batch_size)
        .map(|chunk| -> Result<_> {
            let batch = stack_normalized(images, chunk, normalizer)?;
            let embeddings = model.embed(batch.view())?;
            ensure!(
                embeddings.nrows() == chunk.len(),
                "the model returns {} embeddings for {} images",
                embeddings.nrows(),
                chunk.len()
            );
            Ok(embeddings)
        })
        .try_collect()?;

    if chunks.is_empty() {
        return Ok(Array2::zeros((0, embedding_size)));
    }
    let views: Vec<_> = chunks.iter().map(|chunk| chunk.view()).collect();
    let embeddings = concatenate(Axis(0), &views)?;
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(text: &str) -> Config {
        Config::from_str(text).unwrap()
    }

    const CONFIG: &str = r#"{
        model: { type: "TripletPose", backend: "ResNet50", input_width: 8, input_height: 8, n_poses: 2 },
        train: {
            exp_dir: "runs", exp_id: "orca",
            aug_rate: "orca", cl_per_batch: 2, sampl_per_class: 2,
            nb_epochs: 5, log_step: 2, learning_rate: 0.01,
        },
        data: { train_image_folder: "unused" },
    }"#;

    #[test]
    fn experiment_folder_names() {
        let config = config(CONFIG);
        assert_eq!(experiment_dir(&config, None), Path::new("runs/orca"));
        assert_eq!(
            experiment_dir(&config, Some(3)),
            Path::new("runs/orca-split-3")
        );
    }

    #[test]
    fn poses_require_a_pose_file() {
        let err = check_objective(&config(CONFIG)).unwrap_err();
        assert!(pie_data::error::is_configuration_error(&err));

        let text = CONFIG.replace("n_poses: 2", "n_poses: 1");
        assert!(check_objective(&config(&text)).is_ok());
    }

    #[test]
    fn pose_tags_fit_in_buckets() {
        assert!(check_poses(vec!["left", "right", "left"], 2).is_ok());
        assert!(check_poses(vec![], 1).is_ok());
        let err = check_poses(vec!["left", "right", "top"], 2).unwrap_err();
        assert!(pie_data::error::is_configuration_error(&err));
    }

    #[test]
    fn queries_need_images_beyond_the_gallery() {
        assert!(check_queries(&[0, 0, 1], 1).is_ok());
        let err = check_queries(&[0, 1, 2], 1).unwrap_err();
        assert!(pie_data::error::is_data_error(&err));
        assert!(check_queries(&[], 0).is_err());
    }
}
