//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use futures::{
    future::FutureExt as _,
    stream::{self, StreamExt as _, TryStreamExt as _},
};
pub use image::{imageops::FilterType, ImageFormat, RgbImage};
pub use itertools::Itertools as _;
pub use par_stream::prelude::*;
pub use pie_data::{
    config::Config,
    error::PieError,
    record::{file_stem, is_image_file, LabelFile},
};
pub use serde::{Deserialize, Serialize};
pub use std::{
    cmp,
    collections::HashMap,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tracing::{debug, info, info_span, warn, Instrument as _};

pub type Fallible<T> = Result<T, Error>;
