//! Random image augmentation and backend normalization.

use crate::{
    common::*,
    config::{AugmentationProfile, Backend},
};

/// The way pixels outside the source image are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// Repeat the closest edge pixel.
    Nearest,
    /// Mirror the image at its borders.
    Reflect,
    /// Fill with zeros.
    Constant,
    /// Tile the image.
    Wrap,
}

impl FillMode {
    /// Maps a possibly out-of-range pixel coordinate into `0..len`.
    ///
    /// It returns `None` when the pixel takes the constant fill value.
    pub fn resolve(&self, coord: i64, len: i64) -> Option<i64> {
        if (0..len).contains(&coord) {
            return Some(coord);
        }

        match self {
            Self::Nearest => Some(coord.clamp(0, len - 1)),
            Self::Reflect => {
                let period = len * 2;
                let pos = coord.rem_euclid(period);
                Some(if pos >= len { period - 1 - pos } else { pos })
            }
            Self::Wrap => Some(coord.rem_euclid(len)),
            Self::Constant => None,
        }
    }
}

/// The input normalization a backbone was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Normalization {
    /// Scale to `[-1, 1]`.
    Tf,
    /// Convert to BGR and subtract the ImageNet channel means.
    Caffe,
    /// Scale to `[0, 1]` and standardize with the ImageNet mean and std.
    Torch,
}

impl Normalization {
    const CAFFE_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];
    const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
    const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];

    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::InceptionV3 | Backend::MobileNet | Backend::MobileNetV2 => Self::Tf,
            Backend::ResNet50 | Backend::Vgg16 => Self::Caffe,
            Backend::DenseNet121 => Self::Torch,
        }
    }

    /// Normalizes an HWC array of RGB values in `[0, 255]`.
    pub fn apply(&self, pixels: &mut Array3<f32>) {
        match self {
            Self::Tf => {
                pixels.mapv_inplace(|value| value / 127.5 - 1.0);
            }
            Self::Caffe => {
                for mut pixel in pixels.lanes_mut(Axis(2)) {
                    let (r, g, b) = (pixel[0], pixel[1], pixel[2]);
                    let [mean_b, mean_g, mean_r] = Self::CAFFE_BGR_MEAN;
                    pixel[0] = b - mean_b;
                    pixel[1] = g - mean_g;
                    pixel[2] = r - mean_r;
                }
            }
            Self::Torch => {
                for mut pixel in pixels.lanes_mut(Axis(2)) {
                    for channel in 0..3 {
                        pixel[channel] = (pixel[channel] / 255.0 - Self::TORCH_MEAN[channel])
                            / Self::TORCH_STD[channel];
                    }
                }
            }
        }
    }
}

/// Converts an RGB image to an HWC array of values in `[0, 255]`.
pub fn image_to_array(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32
    })
}

/// Options of [Augmentation].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AugmentationInit {
    /// Maximum rotation in degrees, drawn from `[-r, r]`.
    pub rotation_degrees: Option<R64>,
    /// Maximum horizontal shift as a fraction of the width.
    pub width_shift: Option<R64>,
    /// Maximum vertical shift as a fraction of the height.
    pub height_shift: Option<R64>,
    /// Zoom factors are drawn from `[1 - z, 1 + z]` per axis.
    pub zoom: Option<R64>,
    /// Maximum shear angle in degrees.
    pub shear_degrees: Option<R64>,
    /// Maximum intensity shift added to every channel.
    pub channel_shift: Option<R64>,
    pub fill_mode: FillMode,
    pub normalization: Normalization,
}

impl AugmentationInit {
    /// Parameters of a named augmentation profile.
    pub fn from_profile(profile: AugmentationProfile, backend: Backend) -> Self {
        let normalization = Normalization::for_backend(backend);

        match profile {
            AugmentationProfile::Manta => Self {
                rotation_degrees: Some(r64(360.0)),
                width_shift: Some(r64(0.1)),
                height_shift: Some(r64(0.1)),
                zoom: Some(r64(0.2)),
                shear_degrees: None,
                channel_shift: None,
                fill_mode: FillMode::Nearest,
                normalization,
            },
            AugmentationProfile::Whale => Self {
                rotation_degrees: Some(r64(15.0)),
                width_shift: Some(r64(0.1)),
                height_shift: Some(r64(0.1)),
                zoom: Some(r64(0.2)),
                shear_degrees: None,
                channel_shift: None,
                fill_mode: FillMode::Nearest,
                normalization,
            },
            AugmentationProfile::RightWhale | AugmentationProfile::Orca => Self {
                rotation_degrees: Some(r64(30.0)),
                width_shift: Some(r64(0.15)),
                height_shift: Some(r64(0.15)),
                zoom: Some(r64(0.15)),
                shear_degrees: Some(r64(0.1)),
                channel_shift: Some(r64(0.15)),
                fill_mode: FillMode::Reflect,
                normalization,
            },
        }
    }

    /// No random transform, normalization only.
    pub fn identity(normalization: Normalization) -> Self {
        Self {
            rotation_degrees: None,
            width_shift: None,
            height_shift: None,
            zoom: None,
            shear_degrees: None,
            channel_shift: None,
            fill_mode: FillMode::Nearest,
            normalization,
        }
    }

    pub fn build(self) -> Result<Augmentation> {
        let Self {
            rotation_degrees,
            width_shift,
            height_shift,
            zoom,
            shear_degrees,
            channel_shift,
            fill_mode,
            normalization,
        } = self;

        let non_negative = |name: &str, value: Option<R64>| -> Result<Option<f64>> {
            value
                .map(|value| {
                    ensure!(value >= 0.0, "{} must be non-negative", name);
                    Ok(value.raw())
                })
                .transpose()
        };

        let rotate_radians =
            non_negative("rotation_degrees", rotation_degrees)?.map(f64::to_radians);
        let width_shift = non_negative("width_shift", width_shift)?;
        let height_shift = non_negative("height_shift", height_shift)?;
        let zoom = non_negative("zoom", zoom)?;
        if let Some(zoom) = zoom {
            ensure!(zoom < 1.0, "zoom must be less than 1, but get {}", zoom);
        }
        let shear_radians = non_negative("shear_degrees", shear_degrees)?.map(f64::to_radians);
        let channel_shift = non_negative("channel_shift", channel_shift)?;

        Ok(Augmentation {
            rotate_radians,
            width_shift,
            height_shift,
            zoom,
            shear_radians,
            channel_shift,
            fill_mode,
            normalization,
        })
    }
}

/// A stateless random transform applied independently to each image.
#[derive(Debug, Clone)]
pub struct Augmentation {
    rotate_radians: Option<f64>,
    width_shift: Option<f64>,
    height_shift: Option<f64>,
    zoom: Option<f64>,
    shear_radians: Option<f64>,
    channel_shift: Option<f64>,
    fill_mode: FillMode,
    normalization: Normalization,
}

impl Augmentation {
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Normalizes an image without any random transform.
    pub fn normalize_only(&self, image: &RgbImage) -> Array3<f32> {
        let mut pixels = image_to_array(image);
        self.normalization.apply(&mut pixels);
        pixels
    }

    /// Applies a random transform followed by the normalization.
    ///
    /// The output is an HWC array of the same size as the input.
    pub fn forward<R>(&self, image: &RgbImage, rng: &mut R) -> Array3<f32>
    where
        R: Rng + ?Sized,
    {
        let (width, height) = image.dimensions();
        let matrix = self.sample_matrix(width as f64, height as f64, rng);
        let mut pixels = self.warp(image, &matrix);

        if let Some(max_shift) = self.channel_shift {
            if max_shift > 0.0 {
                let shift = rng.gen_range(-max_shift..=max_shift) as f32;
                let (min, max) = pixels
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &value| {
                        (min.min(value), max.max(value))
                    });
                pixels.mapv_inplace(|value| (value + shift).clamp(min, max));
            }
        }

        self.normalization.apply(&mut pixels);
        pixels
    }

    /// Samples the affine matrix mapping output pixel positions to source
    /// positions, centered at the image center.
    fn sample_matrix<R>(&self, width: f64, height: f64, rng: &mut R) -> [[f64; 3]; 3]
    where
        R: Rng + ?Sized,
    {
        let mut uniform = |max: Option<f64>| match max {
            Some(max) if max > 0.0 => rng.gen_range(-max..=max),
            _ => 0.0,
        };

        let angle = uniform(self.rotate_radians);
        let tx = uniform(self.height_shift) * height;
        let ty = uniform(self.width_shift) * width;
        let shear = uniform(self.shear_radians);
        let (zx, zy) = match self.zoom {
            Some(zoom) if zoom > 0.0 => (1.0 + uniform(Some(zoom)), 1.0 + uniform(Some(zoom))),
            _ => (1.0, 1.0),
        };

        let (sin, cos) = angle.sin_cos();
        let rotation = [[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]];
        let shift = [[1.0, 0.0, tx], [0.0, 1.0, ty], [0.0, 0.0, 1.0]];
        let shearing = [[1.0, -shear.sin(), 0.0], [0.0, shear.cos(), 0.0], [0.0, 0.0, 1.0]];
        let zooming = [[zx, 0.0, 0.0], [0.0, zy, 0.0], [0.0, 0.0, 1.0]];

        // rows and columns, matching the (row, col) pixel indexing
        let (center_r, center_c) = (height / 2.0 - 0.5, width / 2.0 - 0.5);
        let offset = [[1.0, 0.0, center_r], [0.0, 1.0, center_c], [0.0, 0.0, 1.0]];
        let reset = [[1.0, 0.0, -center_r], [0.0, 1.0, -center_c], [0.0, 0.0, 1.0]];

        [offset, rotation, shift, shearing, zooming, reset]
            .iter()
            .fold(IDENTITY, |acc, matrix| matmul(&acc, matrix))
    }

    /// Resamples the image bilinearly through the matrix.
    fn warp(&self, image: &RgbImage, matrix: &[[f64; 3]; 3]) -> Array3<f32> {
        let (width, height) = image.dimensions();
        let (width, height) = (width as i64, height as i64);
        let fill_mode = self.fill_mode;

        let fetch = |row: i64, col: i64, channel: usize| -> f64 {
            match (
                fill_mode.resolve(row, height),
                fill_mode.resolve(col, width),
            ) {
                (Some(row), Some(col)) => image.get_pixel(col as u32, row as u32)[channel] as f64,
                _ => 0.0,
            }
        };

        Array3::from_shape_fn((height as usize, width as usize, 3), |(r, c, channel)| {
            let (r, c) = (r as f64, c as f64);
            let src_r = matrix[0][0] * r + matrix[0][1] * c + matrix[0][2];
            let src_c = matrix[1][0] * r + matrix[1][1] * c + matrix[1][2];

            let (r0, c0) = (src_r.floor(), src_c.floor());
            let (dr, dc) = (src_r - r0, src_c - c0);
            let (r0, c0) = (r0 as i64, c0 as i64);

            let value = fetch(r0, c0, channel) * (1.0 - dr) * (1.0 - dc)
                + fetch(r0, c0 + 1, channel) * (1.0 - dr) * dc
                + fetch(r0 + 1, c0, channel) * dr * (1.0 - dc)
                + fetch(r0 + 1, c0 + 1, channel) * dr * dc;
            value as f32
        })
    }
}

const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn matmul(lhs: &[[f64; 3]; 3], rhs: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = (0..3).map(|k| lhs[i][k] * rhs[k][j]).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 20) as u8, (y * 20) as u8, 100])
        })
    }

    #[test]
    fn fill_mode_resolves_out_of_range() {
        assert_eq!(FillMode::Nearest.resolve(-3, 5), Some(0));
        assert_eq!(FillMode::Nearest.resolve(7, 5), Some(4));
        assert_eq!(FillMode::Reflect.resolve(-1, 5), Some(0));
        assert_eq!(FillMode::Reflect.resolve(5, 5), Some(4));
        assert_eq!(FillMode::Reflect.resolve(6, 5), Some(3));
        assert_eq!(FillMode::Wrap.resolve(-1, 5), Some(4));
        assert_eq!(FillMode::Wrap.resolve(5, 5), Some(0));
        assert_eq!(FillMode::Constant.resolve(5, 5), None);
        assert_eq!(FillMode::Constant.resolve(2, 5), Some(2));
    }

    #[test]
    fn tf_normalization_range() {
        let image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let augmentation = AugmentationInit::identity(Normalization::Tf).build().unwrap();
        let pixels = augmentation.normalize_only(&image);
        assert_eq!(pixels.shape(), &[1, 2, 3]);
        assert_abs_diff_eq!(pixels[[0, 0, 0]], -1.0);
        assert_abs_diff_eq!(pixels[[0, 1, 2]], 1.0);
    }

    #[test]
    fn caffe_normalization_swaps_channels() {
        let image = RgbImage::from_pixel(1, 1, Rgb([200, 100, 50]));
        let augmentation = AugmentationInit::identity(Normalization::Caffe)
            .build()
            .unwrap();
        let pixels = augmentation.normalize_only(&image);
        assert_abs_diff_eq!(pixels[[0, 0, 0]], 50.0 - 103.939, epsilon = 1e-4);
        assert_abs_diff_eq!(pixels[[0, 0, 1]], 100.0 - 116.779, epsilon = 1e-4);
        assert_abs_diff_eq!(pixels[[0, 0, 2]], 200.0 - 123.68, epsilon = 1e-4);
    }

    #[test]
    fn identity_transform_keeps_pixels() {
        let image = gradient(8, 6);
        let augmentation = AugmentationInit::identity(Normalization::Tf).build().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let augmented = augmentation.forward(&image, &mut rng);
        let expected = augmentation.normalize_only(&image);
        assert_eq!(augmented.shape(), expected.shape());
        for (lhs, rhs) in augmented.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-5);
        }
    }

    #[test]
    fn profiles_are_reproducible_with_a_seed() {
        let image = gradient(10, 10);
        for profile in [
            AugmentationProfile::Manta,
            AugmentationProfile::Whale,
            AugmentationProfile::RightWhale,
            AugmentationProfile::Orca,
        ] {
            let augmentation = AugmentationInit::from_profile(profile, Backend::InceptionV3)
                .build()
                .unwrap();
            let lhs = augmentation.forward(&image, &mut StdRng::seed_from_u64(5));
            let rhs = augmentation.forward(&image, &mut StdRng::seed_from_u64(5));
            assert_eq!(lhs, rhs);
            assert_eq!(lhs.shape(), &[10, 10, 3]);
            assert!(lhs.iter().all(|&value| (-1.0001..=1.0001).contains(&value)));
        }
    }

    #[test]
    fn negative_parameter_is_rejected() {
        let init = AugmentationInit {
            zoom: Some(r64(-0.1)),
            ..AugmentationInit::identity(Normalization::Tf)
        };
        assert!(init.build().is_err());
    }
}
