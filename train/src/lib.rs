//! The training program for pattern identification models.

pub mod common;
pub mod inspect;
pub mod logging;
pub mod model;
pub mod train;
pub mod utils;

pub use model::EmbeddingModel;
pub use train::{Partition, TrainSummary, Trainer, TrainerInit, TrainingState, WeightSource};

use crate::common::*;

/// The entry of training program.
///
/// Data loading runs on the async runtime. The training loop runs on a
/// blocking thread.
pub async fn start<M>(init: TrainerInit, model: M) -> Result<TrainSummary>
where
    M: EmbeddingModel + 'static,
{
    let mut trainer = init
        .build(model)
        .instrument(info_span!("prepare"))
        .await?;

    let summary = tokio::task::spawn_blocking(move || trainer.run())
        .map(|result| Fallible::Ok(result??))
        .await?;
    Ok(summary)
}
