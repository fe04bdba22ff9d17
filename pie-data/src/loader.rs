//! Turns sampled record indexes into image tensors.

use crate::{
    augment::Augmentation,
    common::*,
    dataset::ImageSet,
    sampler::{Batch, PairBatch, SampledBatch},
};

/// A batch ready to be fed to a model. Images are NHWC.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingBatch {
    Labeled {
        images: Array4<f32>,
        classes: Vec<usize>,
        poses: Vec<Option<usize>>,
    },
    Pairs {
        left: Array4<f32>,
        right: Array4<f32>,
        targets: Vec<f32>,
    },
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        match self {
            Self::Labeled { classes, .. } => classes.len(),
            Self::Pairs { targets, .. } => targets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Attaches augmented pixels to sampler output.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    images: ImageSet,
    augmentation: Augmentation,
    rng: StdRng,
}

impl BatchLoader {
    pub fn new(images: ImageSet, augmentation: Augmentation, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            images,
            augmentation,
            rng,
        }
    }

    pub fn images(&self) -> &ImageSet {
        &self.images
    }

    pub fn load(&mut self, batch: &SampledBatch) -> Result<TrainingBatch> {
        let batch = match batch {
            SampledBatch::Labeled(Batch {
                indexes,
                classes,
                poses,
            }) => TrainingBatch::Labeled {
                images: self.stack(indexes)?,
                classes: classes.clone(),
                poses: poses.clone(),
            },
            SampledBatch::Pairs(PairBatch {
                left,
                right,
                targets,
            }) => TrainingBatch::Pairs {
                left: self.stack(left)?,
                right: self.stack(right)?,
                targets: targets.clone(),
            },
        };
        Ok(batch)
    }

    fn stack(&mut self, indexes: &[usize]) -> Result<Array4<f32>> {
        let Self {
            ref images,
            ref augmentation,
            ref mut rng,
        } = *self;
        let (width, height) = (images.width as usize, images.height as usize);
        let mut output = Array4::zeros((indexes.len(), height, width, 3));

        for (mut slot, &index) in output.outer_iter_mut().zip(indexes) {
            let image = images
                .get(index)
                .ok_or_else(|| format_err!("image index {} is out of range", index))?;
            slot.assign(&augmentation.forward(image, rng));
        }

        Ok(output)
    }
}

/// Stacks normalized images without random transforms, for embedding and
/// validation.
pub fn stack_normalized(
    images: &ImageSet,
    indexes: &[usize],
    augmentation: &Augmentation,
) -> Result<Array4<f32>> {
    let (width, height) = (images.width as usize, images.height as usize);
    let mut output = Array4::zeros((indexes.len(), height, width, 3));

    for (mut slot, &index) in output.outer_iter_mut().zip(indexes) {
        let image = images
            .get(index)
            .ok_or_else(|| format_err!("image index {} is out of range", index))?;
        slot.assign(&augmentation.normalize_only(image));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::{AugmentationInit, Normalization};

    fn image_set() -> ImageSet {
        let images = (0..4)
            .map(|value| Arc::new(RgbImage::from_pixel(3, 2, Rgb([value * 50, 0, 255]))))
            .collect();
        ImageSet {
            images,
            width: 3,
            height: 2,
        }
    }

    #[test]
    fn labeled_batch_is_nhwc() {
        let augmentation = AugmentationInit::identity(Normalization::Tf).build().unwrap();
        let mut loader = BatchLoader::new(image_set(), augmentation, Some(0));

        let mut batch = Batch::with_capacity(2);
        batch.push(3, 1, None);
        batch.push(0, 0, None);
        let loaded = loader.load(&SampledBatch::Labeled(batch)).unwrap();

        match loaded {
            TrainingBatch::Labeled {
                images, classes, ..
            } => {
                assert_eq!(images.shape(), &[2, 2, 3, 3]);
                assert_eq!(classes, vec![1, 0]);
                assert!((images[[0, 0, 0, 0]] - (150.0 / 127.5 - 1.0)).abs() < 1e-5);
                assert!((images[[1, 1, 2, 0]] + 1.0).abs() < 1e-5);
            }
            _ => panic!("expect a labeled batch"),
        }
    }

    #[test]
    fn out_of_range_index_fails() {
        let augmentation = AugmentationInit::identity(Normalization::Tf).build().unwrap();
        let mut loader = BatchLoader::new(image_set(), augmentation, Some(0));
        let batch = PairBatch {
            left: vec![0],
            right: vec![9],
            targets: vec![0.0],
        };
        assert!(loader.load(&SampledBatch::Pairs(batch)).is_err());
    }

    #[test]
    fn normalized_stack_matches_images() {
        let augmentation = AugmentationInit::identity(Normalization::Tf).build().unwrap();
        let images = image_set();
        let stacked = stack_normalized(&images, &[2, 1], &augmentation).unwrap();
        assert_eq!(stacked.shape(), &[2, 2, 3, 3]);
        assert!((stacked[[0, 1, 1, 0]] - (100.0 / 127.5 - 1.0)).abs() < 1e-5);
        assert!((stacked[[1, 0, 0, 2]] - 1.0).abs() < 1e-5);
    }
}
