//! The configuration document shared by the preprocessing and training programs.

use crate::{common::*, error::PieError};

pub use evaluate::*;
pub use model::*;
pub use prod::*;
pub use training::*;

/// The main configuration.
///
/// Every recognized key is enumerated here. Names that select behavior are
/// enums, so a misspelled model type or augmentation profile is rejected when
/// the document is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub evaluate: EvaluateConfig,
    #[serde(default)]
    pub prod: ProdConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            PieError::config(format!(
                "unable to read config file '{}': {}",
                path.display(),
                err
            ))
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)
            .map_err(|err| PieError::config(format!("invalid config document: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks constraints that span several keys.
    pub fn validate(&self) -> Result<()> {
        let Self {
            model, train, data, evaluate, ..
        } = self;

        if model.input_width == 0 || model.input_height == 0 {
            return Err(PieError::config("model input size must be positive").into());
        }
        if model.embedding_size == 0 {
            return Err(PieError::config("embedding_size must be positive").into());
        }
        if model.kind == ModelKind::TripletPose && model.n_poses == 0 {
            return Err(PieError::config("TripletPose requires n_poses >= 1").into());
        }
        if train.log_step == 0 {
            return Err(PieError::config("log_step must be positive").into());
        }
        if train.checkpoint_every == 0 {
            return Err(PieError::config("checkpoint_every must be positive").into());
        }
        if train.learning_rate <= 0.0 {
            return Err(PieError::config("learning_rate must be positive").into());
        }
        match model.kind {
            ModelKind::TripletLoss | ModelKind::TripletPose => {
                if train.cl_per_batch == 0 || train.sampl_per_class == 0 {
                    return Err(PieError::config(
                        "cl_per_batch and sampl_per_class must be positive",
                    )
                    .into());
                }
            }
            ModelKind::Siamese | ModelKind::Classification => {
                if train.batch_size == 0 {
                    return Err(PieError::config("batch_size must be positive").into());
                }
            }
        }
        if data.n_folds < 2 {
            return Err(PieError::config("n_folds must be at least 2").into());
        }
        if !(data.valid_fraction > 0.0 && data.valid_fraction < 1.0) {
            return Err(PieError::config("valid_fraction must lie in (0, 1)").into());
        }
        if evaluate.accuracy_at_k.is_empty() || evaluate.accuracy_at_k.contains(&0) {
            return Err(
                PieError::config("accuracy_at_k must be a non-empty list of positive k").into(),
            );
        }

        Ok(())
    }

    /// The number of images the model consumes per gradient step.
    pub fn batch_size(&self) -> usize {
        match self.model.kind {
            ModelKind::TripletLoss | ModelKind::TripletPose => {
                self.train.cl_per_batch * self.train.sampl_per_class
            }
            ModelKind::Siamese | ModelKind::Classification => self.train.batch_size,
        }
    }

    /// Square crops are requested when the network input is square.
    pub fn square_input(&self) -> bool {
        self.model.input_width == self.model.input_height
    }
}

mod model {
    use super::*;

    /// The model configuration.
    ///
    /// The network keys (`frontend`, `connect_layer`, `train_from_layer`,
    /// `loss`, `optimizer`, `use_dropout`, `perspective`) are not read by these
    /// tools. They are kept in the experiment snapshot for whoever builds the
    /// embedding model.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        #[serde(rename = "type")]
        pub kind: ModelKind,
        pub backend: Backend,
        #[serde(default = "default_frontend")]
        pub frontend: String,
        pub input_width: u32,
        pub input_height: u32,
        #[serde(default = "default_embedding_size")]
        pub embedding_size: usize,
        #[serde(default = "default_connect_layer")]
        pub connect_layer: i64,
        #[serde(default)]
        pub train_from_layer: i64,
        #[serde(default = "default_loss")]
        pub loss: String,
        #[serde(default = "default_optimizer")]
        pub optimizer: String,
        #[serde(default)]
        pub use_dropout: bool,
        /// Number of pose buckets, used by [ModelKind::TripletPose]. The pose
        /// file may not carry more distinct tags.
        #[serde(default = "default_n_poses")]
        pub n_poses: usize,
        /// Draw the K samples of a class from distinct pose buckets first.
        #[serde(default)]
        pub rotate_poses: bool,
        #[serde(default)]
        pub perspective: bool,
    }

    /// The training objective.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ModelKind {
        TripletLoss,
        TripletPose,
        Siamese,
        Classification,
    }

    impl ModelKind {
        /// Metric-learning objectives are evaluated by accuracy-at-k.
        pub fn is_metric_learning(&self) -> bool {
            !matches!(self, Self::Classification)
        }
    }

    impl fmt::Display for ModelKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let text = match self {
                Self::TripletLoss => "TripletLoss",
                Self::TripletPose => "TripletPose",
                Self::Siamese => "Siamese",
                Self::Classification => "Classification",
            };
            f.write_str(text)
        }
    }

    /// The convolutional backbone. It decides the input normalization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Backend {
        InceptionV3,
        MobileNet,
        MobileNetV2,
        ResNet50,
        DenseNet121,
        Vgg16,
    }

    fn default_frontend() -> String {
        "glob_pool".into()
    }

    fn default_embedding_size() -> usize {
        256
    }

    fn default_connect_layer() -> i64 {
        -1
    }

    fn default_loss() -> String {
        "semi_hard_triplet".into()
    }

    fn default_optimizer() -> String {
        "adam".into()
    }

    fn default_n_poses() -> usize {
        1
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainConfig {
        #[serde(default = "default_exp_dir")]
        pub exp_dir: PathBuf,
        #[serde(default = "default_exp_id")]
        pub exp_id: String,
        /// Weights to start from when the experiment folder has none.
        #[serde(default)]
        pub pretrained_weights: Option<PathBuf>,
        /// The augmentation profile.
        pub aug_rate: AugmentationProfile,
        /// Number of classes per batch (P).
        #[serde(default)]
        pub cl_per_batch: usize,
        /// Number of samples per class (K).
        #[serde(default)]
        pub sampl_per_class: usize,
        /// Fill classes with fewer than K images by sampling with replacement.
        #[serde(default = "default_true")]
        pub equal_k: bool,
        /// Batch size of the pair and classification objectives.
        #[serde(default = "default_batch_size")]
        pub batch_size: usize,
        pub nb_epochs: usize,
        /// Number of epochs per iteration.
        pub log_step: usize,
        pub learning_rate: R64,
        #[serde(default = "default_warm_up_epochs")]
        pub warm_up_epochs: usize,
        #[serde(default = "default_warm_up_lr_factor")]
        pub warm_up_lr_factor: R64,
        /// Save a checkpoint every this many iterations.
        #[serde(default = "default_checkpoint_every")]
        pub checkpoint_every: usize,
        #[serde(default)]
        pub distance: DistanceKind,
        /// Log the label composition of every training batch.
        #[serde(default)]
        pub debug: bool,
    }

    /// Named augmentation profiles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum AugmentationProfile {
        Manta,
        Whale,
        RightWhale,
        Orca,
    }

    /// The embedding distance used by losses and ranking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DistanceKind {
        L2,
        Cosine,
    }

    impl Default for DistanceKind {
        fn default() -> Self {
            Self::L2
        }
    }

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DataConfig {
        pub train_image_folder: PathBuf,
        #[serde(default)]
        pub split_seed: u64,
        #[serde(default = "default_n_folds")]
        pub n_folds: usize,
        /// Share of labels (class-disjoint) or images (minimum-count) held out
        /// when no fold index is given.
        #[serde(default = "default_valid_fraction")]
        pub valid_fraction: R64,
        /// Optional `file,pose` CSV assigning pose tags to images.
        #[serde(default)]
        pub pose_file: Option<PathBuf>,
    }

    fn default_exp_dir() -> PathBuf {
        "experiments".into()
    }

    fn default_exp_id() -> String {
        "default".into()
    }

    fn default_true() -> bool {
        true
    }

    fn default_batch_size() -> usize {
        32
    }

    fn default_warm_up_epochs() -> usize {
        10
    }

    fn default_warm_up_lr_factor() -> R64 {
        r64(10.0)
    }

    fn default_checkpoint_every() -> usize {
        50
    }

    fn default_n_folds() -> usize {
        5
    }

    fn default_valid_fraction() -> R64 {
        r64(0.2)
    }
}

mod evaluate {
    use super::*;

    /// Evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluateConfig {
        /// A held-out folder used as validation set instead of splitting.
        #[serde(default)]
        pub test_set: Option<PathBuf>,
        #[serde(default = "default_accuracy_at_k")]
        pub accuracy_at_k: Vec<usize>,
        /// Images per validation class moved into the gallery. It is also the
        /// minimum class size kept by the minimum-count split.
        #[serde(default = "default_move_to_dataset")]
        pub move_to_dataset: usize,
        #[serde(default = "default_n_eval_epochs")]
        pub n_eval_epochs: usize,
    }

    impl Default for EvaluateConfig {
        fn default() -> Self {
            Self {
                test_set: None,
                accuracy_at_k: default_accuracy_at_k(),
                move_to_dataset: default_move_to_dataset(),
                n_eval_epochs: default_n_eval_epochs(),
            }
        }
    }

    fn default_accuracy_at_k() -> Vec<usize> {
        vec![1, 5, 10]
    }

    fn default_move_to_dataset() -> usize {
        1
    }

    fn default_n_eval_epochs() -> usize {
        1
    }
}

mod prod {
    use super::*;

    /// Deployment paths.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProdConfig {
        #[serde(default = "default_output")]
        pub output: PathBuf,
        #[serde(default)]
        pub lfile: Option<PathBuf>,
        /// Gallery embedding table used by `pie-tool rank` when `--db` is absent.
        #[serde(default)]
        pub embeddings: Option<PathBuf>,
        /// Identities reported by `pie-tool rank` when `-k` is absent.
        #[serde(default = "default_prediction_k")]
        pub prediction_k: usize,
    }

    impl Default for ProdConfig {
        fn default() -> Self {
            Self {
                output: default_output(),
                lfile: None,
                embeddings: None,
                prediction_k: default_prediction_k(),
            }
        }
    }

    /// Miscellaneous options.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct GeneralConfig {
        /// Also write the log of `pie-train` into `log.txt` in the
        /// experiment folder.
        #[serde(rename = "stdout-file", default)]
        pub stdout_file: bool,
    }

    fn default_output() -> PathBuf {
        "output".into()
    }

    fn default_prediction_k() -> usize {
        5
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::is_configuration_error;

    pub(crate) const MANTA_CONFIG: &str = r#"{
        "model": {
            "type": "TripletLoss",
            "backend": "InceptionV3",
            "input_width": 300,
            "input_height": 300,
            "embedding_size": 256
        },
        "train": {
            "aug_rate": "manta",
            "cl_per_batch": 4,
            "sampl_per_class": 3,
            "nb_epochs": 10,
            "log_step": 5,
            "learning_rate": 0.00005
        },
        "data": {
            "train_image_folder": "data/manta",
            "split_seed": 7
        }
    }"#;

    #[test]
    fn load_with_defaults() {
        let config = Config::from_str(MANTA_CONFIG).unwrap();
        assert_eq!(config.model.kind, ModelKind::TripletLoss);
        assert_eq!(config.train.aug_rate, AugmentationProfile::Manta);
        assert!(config.train.equal_k);
        assert_eq!(config.evaluate.accuracy_at_k, vec![1, 5, 10]);
        assert_eq!(config.data.n_folds, 5);
        assert_eq!(config.batch_size(), 12);
        assert!(config.square_input());
    }

    #[test]
    fn reject_unknown_profile() {
        let text = MANTA_CONFIG.replace("\"manta\"", "\"dolphin\"");
        let err = Config::from_str(&text).unwrap_err();
        assert!(is_configuration_error(&err));
    }

    #[test]
    fn reject_unknown_model_type() {
        let text = MANTA_CONFIG.replace("TripletLoss", "Contrastive");
        let err = Config::from_str(&text).unwrap_err();
        assert!(is_configuration_error(&err));
    }

    #[test]
    fn reject_zero_samples_per_class() {
        let text = MANTA_CONFIG.replace("\"sampl_per_class\": 3", "\"sampl_per_class\": 0");
        let err = Config::from_str(&text).unwrap_err();
        assert!(is_configuration_error(&err));
    }
}
