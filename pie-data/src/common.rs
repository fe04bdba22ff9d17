pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use futures::stream::{self, Stream, StreamExt as _, TryStreamExt as _};
pub use image::{imageops::FilterType, DynamicImage, ImageFormat, Rgb, RgbImage};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools as _};
pub use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis};
pub use noisy_float::prelude::*;
pub use par_stream::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Cow,
    cmp::{self, Ordering},
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    fmt::Debug,
    fs,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
pub use tracing::{debug, info, info_span, warn, Instrument as _};

pub type Fallible<T> = Result<T, Error>;
