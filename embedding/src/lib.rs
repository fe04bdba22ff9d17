//! Embedding artifacts, distance ranking and accuracy-at-k evaluation.

pub mod artifact;
pub mod common;
pub mod evaluate;
pub mod rank;

pub use artifact::{LabelRecord, QuantizedEmbedding, Quantizer};
pub use evaluate::{evaluate_one_vs_all, AccuracyAtK, EvaluationInit};
pub use rank::{compare_answers, predict_light, Answer, Distance};
