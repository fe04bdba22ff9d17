//! Crop regions derived from masks.

use crate::{common::*, mask::Mask};

/// A pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Computes the crop region of a mask.
///
/// The bounding box of the mask points is grown by `padding` pixels on each
/// side. When `square` is set, the shorter side is extended around the box
/// center to match the longer one and the box is shifted back into the image
/// if needed. The region is clamped into the image in any case, so a square
/// region is only guaranteed when it fits. It returns `None` for an empty
/// region.
pub fn crop_region(
    mask: &Mask,
    image_width: u32,
    image_height: u32,
    padding: u32,
    square: bool,
) -> Option<CropRegion> {
    let (min_x, min_y, max_x, max_y) = mask.bounds()?;
    let padding = padding as i64;
    let (image_w, image_h) = (image_width as i64, image_height as i64);

    let mut left = min_x.floor() as i64 - padding;
    let mut top = min_y.floor() as i64 - padding;
    let mut right = max_x.ceil() as i64 + padding;
    let mut bottom = max_y.ceil() as i64 + padding;

    if square {
        let side = cmp::max(right - left, bottom - top);
        left = fit(left - (side - (right - left)) / 2, side, image_w);
        right = left + cmp::min(side, image_w);
        top = fit(top - (side - (bottom - top)) / 2, side, image_h);
        bottom = top + cmp::min(side, image_h);
    }

    let left = left.clamp(0, image_w);
    let top = top.clamp(0, image_h);
    let right = right.clamp(0, image_w);
    let bottom = bottom.clamp(0, image_h);

    if right <= left || bottom <= top {
        return None;
    }

    Some(CropRegion {
        x: left as u32,
        y: top as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

/// Shifts a window start so that the window lies in `0..limit` when it fits.
fn fit(start: i64, len: i64, limit: i64) -> i64 {
    if len >= limit {
        0
    } else {
        start.clamp(0, limit - len)
    }
}

/// Crops the image by the mask, or returns it whole without a usable mask.
pub fn crop_by_mask(image: RgbImage, mask: Option<&Mask>, padding: u32, square: bool) -> RgbImage {
    let (width, height) = image.dimensions();
    let region = mask.and_then(|mask| crop_region(mask, width, height, padding, square));

    match region {
        Some(CropRegion {
            x,
            y,
            width,
            height,
        }) => image::imageops::crop_imm(&image, x, y, width, height).to_image(),
        None => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(points: &[(f64, f64)]) -> Mask {
        Mask::new(points.to_vec())
    }

    #[test]
    fn bounding_box_with_padding() {
        let region = crop_region(&mask(&[(10.0, 20.0), (30.0, 25.0)]), 100, 100, 5, false);
        assert_eq!(
            region,
            Some(CropRegion {
                x: 5,
                y: 15,
                width: 30,
                height: 15
            })
        );
    }

    #[test]
    fn square_region_is_centered_on_the_box() {
        let region =
            crop_region(&mask(&[(40.0, 45.0), (60.0, 55.0)]), 100, 100, 0, true).unwrap();
        assert_eq!(region.width, 20);
        assert_eq!(region.height, 20);
        assert_eq!((region.x, region.y), (40, 40));
    }

    #[test]
    fn square_region_is_shifted_into_the_image() {
        let region = crop_region(&mask(&[(0.0, 2.0), (30.0, 8.0)]), 100, 50, 0, true).unwrap();
        assert_eq!((region.width, region.height), (30, 30));
        assert_eq!(region.y, 0);
    }

    #[test]
    fn region_is_clamped_to_the_image() {
        let region = crop_region(&mask(&[(-10.0, -5.0), (500.0, 20.0)]), 64, 48, 3, false).unwrap();
        assert_eq!(
            region,
            CropRegion {
                x: 0,
                y: 0,
                width: 64,
                height: 23
            }
        );

        assert_eq!(crop_region(&mask(&[(80.0, 80.0), (90.0, 90.0)]), 64, 48, 0, false), None);
    }

    #[test]
    fn crop_without_mask_keeps_image() {
        let image = RgbImage::new(12, 7);
        let cropped = crop_by_mask(image, None, 0, true);
        assert_eq!(cropped.dimensions(), (12, 7));

        let image = RgbImage::new(12, 7);
        let cropped = crop_by_mask(image, Some(&mask(&[(2.0, 1.0), (6.0, 5.0)])), 0, false);
        assert_eq!(cropped.dimensions(), (4, 4));
    }
}
