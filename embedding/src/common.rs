//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
pub use noisy_float::prelude::*;
pub use pie_data::{config::DistanceKind, error::PieError};
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use tracing::{debug, info, warn};
