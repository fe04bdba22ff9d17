//! Preparation of annotation images for the re-identification network.
//!
//! Each image is optionally cropped by a mask outlining the pattern of
//! interest, resized to the network input size and stored as PNG. When a
//! label file is given, the outputs are finally sorted into per-label folders.

pub mod common;
pub mod crop;
pub mod mask;
pub mod normalize;
pub mod rearrange;

pub use mask::{Mask, MaskDecision, MaskSession, StoredMaskSession, TerminalMaskSession};
pub use normalize::{PreprocessSummary, Preprocessor, PreprocessorInit};
pub use rearrange::{rearrange_by_label, RearrangeSummary};
