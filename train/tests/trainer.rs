use anyhow::Result;
use approx::assert_abs_diff_eq;
use image::{Rgb, RgbImage};
use ndarray::{s, Array2, ArrayView4};
use pie_data::{
    config::Config,
    error::{is_configuration_error, is_data_error},
    loader::TrainingBatch,
};
use pie_train::{
    logging::{read_history, Phase, EXPERIMENTS_FILE, HISTORY_FILE},
    utils::{find_latest_checkpoint, BEST_WEIGHTS_FILE},
    EmbeddingModel, TrainerInit, TrainingState, WeightSource,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

#[derive(Debug, Default)]
struct Calls {
    learning_rates: Vec<f64>,
    eval_steps: usize,
    embedded: usize,
    loaded: Vec<PathBuf>,
}

/// Counts optimization steps. Losses shrink as the count grows.
struct CountingModel {
    calls: Arc<Mutex<Calls>>,
    embedding_size: usize,
    steps: usize,
}

impl CountingModel {
    fn new(embedding_size: usize) -> (Self, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let model = Self {
            calls: calls.clone(),
            embedding_size,
            steps: 0,
        };
        (model, calls)
    }
}

impl EmbeddingModel for CountingModel {
    fn train_step(&mut self, batch: &TrainingBatch, learning_rate: f64) -> Result<f64> {
        assert!(!batch.is_empty());
        self.calls.lock().unwrap().learning_rates.push(learning_rate);
        self.steps += 1;
        Ok(1.0 / self.steps as f64)
    }

    fn eval_step(&mut self, batch: &TrainingBatch) -> Result<f64> {
        assert!(!batch.is_empty());
        self.calls.lock().unwrap().eval_steps += 1;
        Ok(1.0 / (self.steps as f64 + 1.0))
    }

    fn embed(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let num_images = images.shape()[0];
        self.calls.lock().unwrap().embedded += num_images;

        // channel means
        let mut embeddings = Array2::zeros((num_images, self.embedding_size));
        for (row, image) in images.outer_iter().enumerate() {
            for channel in 0..3 {
                embeddings[[row, channel]] = image.slice(s![.., .., channel]).mean().unwrap_or(0.0);
            }
        }
        Ok(embeddings)
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        fs::write(path, self.steps.to_string())?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.steps = fs::read_to_string(path)?.trim().parse()?;
        self.calls.lock().unwrap().loaded.push(path.to_owned());
        Ok(())
    }
}

fn write_dataset(root: &Path, num_labels: usize, per_label: usize) {
    for label in 0..num_labels {
        let dir = root.join(format!("manta-{}", label));
        fs::create_dir_all(&dir).unwrap();
        for index in 0..per_label {
            let color = Rgb([label as u8 * 40, 255 - label as u8 * 40, index as u8 * 10]);
            RgbImage::from_pixel(10, 10, color)
                .save(dir.join(format!("{}.png", index)))
                .unwrap();
        }
    }
}

fn quoted(path: &Path) -> String {
    serde_json::to_string(path).unwrap()
}

fn metric_config(root: &Path) -> Config {
    let text = format!(
        r#"{{
            model: {{
                type: "TripletLoss",
                backend: "MobileNetV2",
                input_width: 8,
                input_height: 8,
                embedding_size: 4,
            }},
            train: {{
                exp_dir: {exp_dir},
                exp_id: "mantas",
                aug_rate: "manta",
                cl_per_batch: 2,
                sampl_per_class: 2,
                nb_epochs: 3,
                log_step: 2,
                learning_rate: 0.001,
                warm_up_epochs: 1,
                checkpoint_every: 1,
            }},
            data: {{
                train_image_folder: {data},
                split_seed: 1,
                valid_fraction: 0.3,
            }},
            evaluate: {{
                accuracy_at_k: [1, 2],
                move_to_dataset: 1,
                n_eval_epochs: 2,
            }},
        }}"#,
        exp_dir = quoted(&root.join("runs")),
        data = quoted(&root.join("data")),
    );
    Config::from_str(&text).unwrap()
}

fn count_rows(path: &Path) -> usize {
    csv::Reader::from_path(path).unwrap().records().count()
}

#[tokio::test]
async fn warm_up_train_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 6, 4);
    let config = Arc::new(metric_config(dir.path()));
    let init = TrainerInit {
        config: config.clone(),
        split_num: None,
        seed: Some(5),
    };

    // first run starts from scratch
    let (model, calls) = CountingModel::new(4);
    let summary = pie_train::start(init.clone(), model).await.unwrap();
    let exp_dir = dir.path().join("runs").join("mantas");
    assert_eq!(summary.exp_dir, exp_dir);
    assert_eq!(summary.weight_source, WeightSource::Scratch);

    // one warm-up epoch, then 2 iterations of 2 epochs
    assert_eq!(summary.epochs, 5);
    let history = read_history(exp_dir.join(HISTORY_FILE)).unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].phase, Phase::Warmup);
    assert_abs_diff_eq!(history[0].learning_rate, 0.01, epsilon = 1e-12);
    assert!(history[1..]
        .iter()
        .all(|row| row.phase == Phase::Train && (row.learning_rate - 0.001).abs() < 1e-12));
    assert_eq!(
        history.iter().map(|row| row.epoch).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );

    // 16 training images in batches of 4 give 5 steps per epoch
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.learning_rates.len(), 25);
        assert!(calls.eval_steps > 0);
        assert_eq!(calls.embedded, 2 * 24);
        assert!(calls.loaded.is_empty());
    }

    // losses fall every epoch, so the best weights are the final ones
    assert_eq!(
        fs::read_to_string(exp_dir.join(BEST_WEIGHTS_FILE)).unwrap(),
        "25"
    );
    assert_eq!(summary.best_val_loss, Some(history[4].val_loss));

    assert_eq!(summary.accuracies.len(), 2);
    for accuracy in &summary.accuracies {
        assert!((0.0..=100.0).contains(&accuracy.mean));
    }
    assert_eq!(count_rows(&exp_dir.join(EXPERIMENTS_FILE)), 2);
    assert!(exp_dir.join("config.json").is_file());
    assert!(exp_dir.join("label_index.csv").is_file());

    let last = summary.last_checkpoint.unwrap();
    assert!(last.to_str().unwrap().ends_with("_last.bin"));
    assert_eq!(find_latest_checkpoint(&exp_dir).unwrap(), Some(last));
    let num_checkpoints = fs::read_dir(&exp_dir)
        .unwrap()
        .filter(|entry| {
            let name = entry.as_ref().unwrap().file_name();
            name.to_str().unwrap().starts_with("weights_at_")
        })
        .count();
    assert_eq!(num_checkpoints, 3);

    // second run resumes from the best weights without warm-up
    let (model, calls) = CountingModel::new(4);
    let summary = pie_train::start(init, model).await.unwrap();
    assert_eq!(
        summary.weight_source,
        WeightSource::BestWeights(exp_dir.join(BEST_WEIGHTS_FILE))
    );
    assert_eq!(summary.epochs, 9);
    assert_eq!(calls.lock().unwrap().learning_rates.len(), 20);

    let history = read_history(exp_dir.join(HISTORY_FILE)).unwrap();
    assert_eq!(history.len(), 9);
    assert!(history[5..].iter().all(|row| row.phase == Phase::Train));
    assert_eq!(count_rows(&exp_dir.join(EXPERIMENTS_FILE)), 4);
    assert_eq!(
        fs::read_to_string(exp_dir.join(BEST_WEIGHTS_FILE)).unwrap(),
        "45"
    );
}

#[tokio::test]
async fn classification_steps_through_states() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 6, 4);

    let mut config = metric_config(dir.path());
    config.model.kind = pie_data::config::ModelKind::Classification;
    config.train.batch_size = 4;
    config.train.nb_epochs = 2;
    config.train.log_step = 1;
    config.train.warm_up_epochs = 0;
    config.train.checkpoint_every = 50;
    config.train.debug = true;

    let (model, calls) = CountingModel::new(4);
    let mut trainer = TrainerInit {
        config: Arc::new(config),
        split_num: Some(0),
        seed: Some(1),
    }
    .build(model)
    .await
    .unwrap();

    assert!(trainer.exp_dir().ends_with("mantas-split-0"));
    assert_eq!(trainer.weight_source(), &WeightSource::Scratch);
    assert_eq!(trainer.num_iterations(), 2);
    assert_eq!(trainer.state(), TrainingState::Iterating { iteration: 0 });

    assert_eq!(
        trainer.step().unwrap(),
        TrainingState::Iterating { iteration: 1 }
    );
    assert_eq!(
        trainer.step().unwrap(),
        TrainingState::Iterating { iteration: 2 }
    );
    assert_eq!(trainer.step().unwrap(), TrainingState::Done);
    assert_eq!(trainer.step().unwrap(), TrainingState::Done);

    let summary = trainer.summary();
    assert!(summary.accuracies.is_empty());
    assert_eq!(calls.lock().unwrap().embedded, 0);

    // only the final checkpoint
    assert_eq!(
        find_latest_checkpoint(&summary.exp_dir).unwrap(),
        summary.last_checkpoint
    );
    let mut reader = csv::Reader::from_path(summary.exp_dir.join(EXPERIMENTS_FILE)).unwrap();
    let acc_column = reader
        .headers()
        .unwrap()
        .iter()
        .position(|name| name == "acc@1")
        .unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| &row[acc_column] == ""));
    assert_eq!(&rows[0][3], "Classification");
}

#[tokio::test]
async fn pretrained_weights_skip_warm_up() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 6, 4);
    let pretrained = dir.path().join("imagenet.bin");
    fs::write(&pretrained, "7").unwrap();

    let mut config = metric_config(dir.path());
    config.train.pretrained_weights = Some(pretrained.clone());

    let (model, calls) = CountingModel::new(4);
    let trainer = TrainerInit {
        config: Arc::new(config),
        split_num: None,
        seed: Some(2),
    }
    .build(model)
    .await
    .unwrap();

    assert_eq!(
        trainer.weight_source(),
        &WeightSource::Pretrained(pretrained.clone())
    );
    assert_eq!(trainer.state(), TrainingState::Iterating { iteration: 0 });
    assert_eq!(calls.lock().unwrap().loaded, vec![pretrained]);
}

#[tokio::test]
async fn invalid_objective_fails_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 6, 4);

    let mut config = metric_config(dir.path());
    config.model.kind = pie_data::config::ModelKind::TripletPose;
    config.model.rotate_poses = true;

    let (model, calls) = CountingModel::new(4);
    let err = TrainerInit {
        config: Arc::new(config),
        split_num: None,
        seed: None,
    }
    .build(model)
    .await
    .unwrap_err();

    assert!(is_configuration_error(&err));
    assert!(!dir.path().join("runs").exists());
    assert!(calls.lock().unwrap().loaded.is_empty());
}

#[tokio::test]
async fn single_image_identities_fail_before_training() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 6, 1);
    let config = Arc::new(metric_config(dir.path()));

    let (model, calls) = CountingModel::new(4);
    let err = pie_train::start(
        TrainerInit {
            config,
            split_num: None,
            seed: Some(3),
        },
        model,
    )
    .await
    .unwrap_err();

    assert!(is_data_error(&err));
    let calls = calls.lock().unwrap();
    assert!(calls.learning_rates.is_empty());
    assert_eq!(calls.eval_steps, 0);
    assert_eq!(calls.embedded, 0);
}
