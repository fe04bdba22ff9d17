//! Failure classes shared by the preprocessing and training programs.
//!
//! Functions return [anyhow::Result] and raise these variants through it, so
//! callers that care about the class can `downcast_ref::<PieError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PieError {
    /// Unknown model type, objective, augmentation profile or an invalid
    /// combination of options. Fatal before any heavy work starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Missing or empty inputs, malformed label files, empty split partitions.
    #[error("data error: {0}")]
    Data(String),
    /// The user cancelled an interactive session.
    #[error("aborted by user after {processed} processed files")]
    UserAbort { processed: usize, output_dir: PathBuf },
}

impl PieError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

/// Tells if an [anyhow::Error] carries a [PieError::Configuration].
pub fn is_configuration_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<PieError>(), Some(PieError::Configuration(_)))
}

/// Tells if an [anyhow::Error] carries a [PieError::Data].
pub fn is_data_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<PieError>(), Some(PieError::Data(_)))
}
