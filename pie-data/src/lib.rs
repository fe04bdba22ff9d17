//! Shared data handling of the PIE re-identification tools: the configuration
//! document, labeled image datasets, splitting, batch sampling and
//! augmentation.

pub mod augment;
pub mod common;
pub mod config;
pub mod dataset;
pub mod error;
pub mod label_index;
pub mod loader;
pub mod record;
pub mod sampler;
pub mod split;

pub use config::Config;
pub use error::PieError;
