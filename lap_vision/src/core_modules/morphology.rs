//! Mask cleanup for foreground extraction.
//!
//! Masks are `GrayImage`s holding `0` (background) or `255` (foreground). The
//! erosion and dilation themselves come from `imageproc`; this module only
//! draws the elliptical structuring element they run with.

use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_open, Mask};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Largest element side `imageproc` accepts.
const MAX_SIDE: u32 = 511;

/// Filled ellipse inscribed in a `side` x `side` box, drawn as a mask image.
///
/// Row `dy` from the center spans `±round(c·sqrt(1 - dy²/r²))` columns, the
/// classic discrete ellipse used for mask cleanup.
pub fn ellipse_shape(side: u32) -> GrayImage {
    let side = side.clamp(1, MAX_SIDE);
    let r = (side / 2) as i32;
    let inv_r2 = if r > 0 { 1.0 / (r * r) as f64 } else { 0.0 };

    GrayImage::from_fn(side, side, |x, y| {
        let (dx, dy) = (x as i32 - r, y as i32 - r);
        let half = (r as f64 * (((r * r - dy * dy) as f64) * inv_r2).sqrt()).round() as i32;
        Luma([if dx.abs() <= half { FOREGROUND } else { BACKGROUND }])
    })
}

/// Elliptical structuring element of the given side, anchored at its center.
pub fn ellipse(side: u32) -> Mask {
    let shape = ellipse_shape(side);
    let center = (shape.width() / 2) as u8;
    Mask::from_image(&shape, center, center)
}

/// Erosion followed by dilation: drops specks smaller than the element.
pub fn open(mask: &GrayImage, element: &Mask) -> GrayImage {
    grayscale_open(mask, element)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, x0: u32, y0: u32, side: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let inside = x >= x0 && x < x0 + side && y >= y0 && y < y0 + side;
            Luma([if inside { FOREGROUND } else { BACKGROUND }])
        })
    }

    fn count(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] == FOREGROUND).count()
    }

    #[test]
    fn five_by_five_ellipse_matches_the_classic_shape() {
        let shape = ellipse_shape(5);
        // Rows 0 and 4 hold only the center column, rows 1..=3 are full.
        assert_eq!(count(&shape), 17);
        assert_eq!(shape.get_pixel(2, 0).0[0], FOREGROUND);
        assert_eq!(shape.get_pixel(1, 0).0[0], BACKGROUND);
        assert_eq!(shape.get_pixel(0, 1).0[0], FOREGROUND);
        assert_eq!(shape.get_pixel(4, 3).0[0], FOREGROUND);
        assert_eq!(shape.get_pixel(2, 4).0[0], FOREGROUND);
        assert_eq!(shape.get_pixel(4, 4).0[0], BACKGROUND);
    }

    #[test]
    fn degenerate_sides_are_clamped() {
        assert_eq!(ellipse_shape(0).dimensions(), (1, 1));
        assert_eq!(count(&ellipse_shape(1)), 1);
        assert_eq!(ellipse_shape(4096).width(), MAX_SIDE);
    }

    #[test]
    fn opening_removes_specks_and_keeps_blocks() {
        let mut mask = square_mask(32, 10, 10, 10);
        mask.put_pixel(2, 2, Luma([FOREGROUND]));
        mask.put_pixel(28, 3, Luma([FOREGROUND]));
        mask.put_pixel(29, 3, Luma([FOREGROUND]));

        let opened = open(&mask, &ellipse(5));
        assert_eq!(opened.get_pixel(2, 2).0[0], BACKGROUND);
        assert_eq!(opened.get_pixel(28, 3).0[0], BACKGROUND);
        assert_eq!(opened.get_pixel(15, 15).0[0], FOREGROUND);
        // Only the block corners are lost.
        assert!(count(&opened) >= 90 && count(&opened) <= 100);
    }

    #[test]
    fn uniform_masks_survive_opening() {
        let full = GrayImage::from_pixel(6, 6, Luma([FOREGROUND]));
        assert_eq!(open(&full, &ellipse(5)), full);
        let empty = GrayImage::new(6, 6);
        assert_eq!(open(&empty, &ellipse(5)), empty);
    }
}
