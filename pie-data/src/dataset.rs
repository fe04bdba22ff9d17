//! Labeled image folders and their in-memory image sets.

use crate::{
    common::*,
    error::PieError,
    label_index::LabelIndex,
    record::{file_stem, is_image_file, load_pose_file, ImageRecord},
};

/// A labeled dataset read from a folder with one subdirectory per label.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub records: Vec<ImageRecord>,
}

impl Dataset {
    /// Reads `<root>/<label>/<image>` entries. Files placed directly under the
    /// root are ignored. An optional `file,pose` CSV tags images with poses.
    pub fn load(root: impl AsRef<Path>, pose_file: Option<&Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(PieError::data(format!(
                "dataset folder '{}' does not exist",
                root.display()
            ))
            .into());
        }

        let poses = pose_file.map(load_pose_file).transpose()?;

        let label_dirs: Vec<PathBuf> = fs::read_dir(root)
            .with_context(|| format!("unable to list '{}'", root.display()))?
            .map(|entry| -> Result<_> { Ok(entry?.path()) })
            .filter_ok(|path| path.is_dir())
            .try_collect()?;

        let mut records = vec![];
        for label_dir in label_dirs.into_iter().sorted() {
            let label = match label_dir.file_name().and_then(|name| name.to_str()) {
                Some(label) => label.to_owned(),
                None => {
                    warn!("ignore non-unicode directory '{}'", label_dir.display());
                    continue;
                }
            };

            let files: Vec<PathBuf> = fs::read_dir(&label_dir)
                .with_context(|| format!("unable to list '{}'", label_dir.display()))?
                .map(|entry| -> Result<_> { Ok(entry?.path()) })
                .filter_ok(|path| path.is_file() && is_image_file(path))
                .try_collect()?;

            for path in files.into_iter().sorted() {
                let pose = match &poses {
                    Some(poses) => poses.get(&file_stem(&path)?).cloned(),
                    None => None,
                };
                records.push(ImageRecord {
                    path,
                    label: label.clone(),
                    pose,
                });
            }
        }

        if records.is_empty() {
            return Err(PieError::data(format!(
                "no labeled images found in '{}'",
                root.display()
            ))
            .into());
        }

        Ok(Self { records })
    }

    pub fn from_records(records: Vec<ImageRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn label_index(&self) -> LabelIndex {
        LabelIndex::new(self.records.iter().map(|record| &record.label))
    }

    /// Groups record indexes by label, labels in sorted order.
    pub fn indexes_by_label(&self) -> BTreeMap<&str, Vec<usize>> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        self.records.iter().enumerate().for_each(|(index, record)| {
            groups.entry(record.label.as_str()).or_default().push(index);
        });
        groups
    }

    pub fn stats(&self) -> DatasetStats {
        let counts = self
            .indexes_by_label()
            .into_iter()
            .map(|(label, indexes)| (label.to_owned(), indexes.len()))
            .collect();
        DatasetStats { counts }
    }

    /// Decodes every image, resized to the given size, using a worker pool.
    pub async fn load_images(&self, width: u32, height: u32) -> Result<ImageSet> {
        let paths: Vec<_> = self
            .records
            .iter()
            .map(|record| record.path.clone())
            .enumerate()
            .collect();

        let mut images: Vec<(usize, RgbImage)> = stream::iter(paths)
            .par_map(None, move |(index, path)| {
                move || -> Result<_> {
                    let image = load_rgb(&path, width, height)?;
                    Ok((index, image))
                }
            })
            .try_collect()
            .instrument(info_span!("load_images"))
            .await?;
        images.sort_by_key(|(index, _)| *index);

        let images = images.into_iter().map(|(_, image)| Arc::new(image)).collect();
        Ok(ImageSet {
            images,
            width,
            height,
        })
    }
}

/// Decodes an image as RGB and resizes it to exactly the given size.
pub fn load_rgb(path: &Path, width: u32, height: u32) -> Result<RgbImage> {
    let image = image::open(path)
        .with_context(|| format!("unable to decode image '{}'", path.display()))?
        .to_rgb8();
    let image = if image.dimensions() == (width, height) {
        image
    } else {
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    };
    Ok(image)
}

/// Decoded images aligned with the records of a [Dataset].
#[derive(Debug, Clone)]
pub struct ImageSet {
    pub images: Vec<Arc<RgbImage>>,
    pub width: u32,
    pub height: u32,
}

impl ImageSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RgbImage> {
        self.images.get(index).map(|image| &**image)
    }

    /// Picks the images at the given indexes.
    pub fn select(&self, indexes: &[usize]) -> Self {
        Self {
            images: indexes
                .iter()
                .map(|&index| self.images[index].clone())
                .collect(),
            width: self.width,
            height: self.height,
        }
    }
}

/// Per-label image counts of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStats {
    pub counts: BTreeMap<String, usize>,
}

impl DatasetStats {
    pub fn num_images(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn min_per_class(&self) -> usize {
        self.counts.values().copied().min().unwrap_or(0)
    }

    pub fn max_per_class(&self) -> usize {
        self.counts.values().copied().max().unwrap_or(0)
    }

    pub fn mean_per_class(&self) -> f64 {
        if self.counts.is_empty() {
            0.0
        } else {
            self.num_images() as f64 / self.num_classes() as f64
        }
    }

    /// Logs a summary under the given name.
    pub fn report(&self, name: &str) {
        info!(
            "{} set: {} images, {} classes, images per class min {} max {} mean {:.2}",
            name,
            self.num_images(),
            self.num_classes(),
            self.min_per_class(),
            self.max_per_class(),
            self.mean_per_class()
        );
    }
}
