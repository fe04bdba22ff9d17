//! The seam between the training orchestrator and a deep-learning backend.

use crate::common::*;

/// A trainable network that maps images to embeddings.
///
/// Images are NHWC batches already normalized for the backbone. Losses are
/// the mean loss over the batch.
pub trait EmbeddingModel: Send {
    /// Runs one optimization step and returns the training loss.
    fn train_step(&mut self, batch: &TrainingBatch, learning_rate: f64) -> Result<f64>;

    /// Computes the loss without updating weights.
    fn eval_step(&mut self, batch: &TrainingBatch) -> Result<f64>;

    /// Computes one embedding row per image.
    fn embed(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>>;

    fn save_weights(&self, path: &Path) -> Result<()>;

    fn load_weights(&mut self, path: &Path) -> Result<()>;
}

impl<M> EmbeddingModel for Box<M>
where
    M: EmbeddingModel + ?Sized,
{
    fn train_step(&mut self, batch: &TrainingBatch, learning_rate: f64) -> Result<f64> {
        (**self).train_step(batch, learning_rate)
    }

    fn eval_step(&mut self, batch: &TrainingBatch) -> Result<f64> {
        (**self).eval_step(batch)
    }

    fn embed(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        (**self).embed(images)
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        (**self).save_weights(path)
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        (**self).load_weights(path)
    }
}
