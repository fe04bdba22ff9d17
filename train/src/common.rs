//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use chrono::{DateTime, Local, NaiveDateTime};
pub use derivative::Derivative;
pub use futures::future::FutureExt as _;
pub use itertools::Itertools as _;
pub use ndarray::{concatenate, Array2, ArrayView2, ArrayView4, Axis};
pub use noisy_float::prelude::*;
pub use pie_data::{
    augment::{Augmentation, AugmentationInit, Normalization},
    config::{Config, ModelKind},
    dataset::{Dataset, ImageSet},
    error::PieError,
    label_index::LabelIndex,
    loader::{stack_normalized, BatchLoader, TrainingBatch},
    sampler::{SampledBatch, Sampler},
    split::{Split, SplitPolicy},
};
pub use pie_embedding::{AccuracyAtK, Distance, EvaluationInit};
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    cmp,
    collections::BTreeMap,
    fmt,
    fmt::Debug,
    fs,
    io::Write as _,
    iter,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tracing::{debug, info, info_span, warn, Instrument as _};

pub type Fallible<T> = Result<T, Error>;
