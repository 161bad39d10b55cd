//! Crop preprocessing and binarization helpers.
//!
//! The tracker smooths and histogram-equalizes the crop region before any
//! thresholding so the adaptive thresholds see a stable intensity
//! distribution across exposure changes.

use image::{GrayImage, Luma};

use crate::geometry::Rect;

/// Gaussian-blur a grayscale image through an f32 round trip.
pub fn blur_gray(img: &GrayImage, sigma: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut f = image::ImageBuffer::<Luma<f32>, Vec<f32>>::new(w, h);
    for y in 0..h {
        for x in 0..w {
            f.put_pixel(x, y, Luma([img.get_pixel(x, y)[0] as f32 / 255.0]));
        }
    }
    let blurred = imageproc::filter::gaussian_blur_f32(&f, sigma);
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = blurred.get_pixel(x, y)[0].clamp(0.0, 1.0);
            out.put_pixel(x, y, Luma([(v * 255.0).round() as u8]));
        }
    }
    out
}

/// Gaussian-smooth `region` of `img` in place.
///
/// `region` must already be clamped into the image bounds. No-op when
/// `sigma` is not positive.
pub fn smooth_region(img: &mut GrayImage, region: Rect, sigma: f32) {
    if sigma <= 0.0 {
        return;
    }
    let sub = crop_to_image(img, region);
    let smoothed = blur_gray(&sub, sigma);
    paste(img, &smoothed, region);
}

/// Histogram-equalize `region` of `img` in place.
pub fn equalize_region(img: &mut GrayImage, region: Rect) {
    let sub = crop_to_image(img, region);
    let equalized = imageproc::contrast::equalize_histogram(&sub);
    paste(img, &equalized, region);
}

fn crop_to_image(img: &GrayImage, region: Rect) -> GrayImage {
    image::imageops::crop_imm(
        img,
        region.x as u32,
        region.y as u32,
        region.width as u32,
        region.height as u32,
    )
    .to_image()
}

fn paste(img: &mut GrayImage, sub: &GrayImage, region: Rect) {
    for y in 0..sub.height() {
        for x in 0..sub.width() {
            img.put_pixel(region.x as u32 + x, region.y as u32 + y, *sub.get_pixel(x, y));
        }
    }
}

/// Rebuild the frame-sized inverse-threshold buffer.
///
/// Pixels inside `roi` at or below `threshold` become foreground (255),
/// everything else (including all pixels outside the ROI) becomes 0. The
/// destination is reallocated only when the frame dimensions changed.
pub fn inverse_threshold_into(src: &GrayImage, dst: &mut GrayImage, roi: Rect, threshold: u8) {
    if dst.dimensions() != src.dimensions() {
        *dst = GrayImage::new(src.width(), src.height());
    }
    for p in dst.pixels_mut() {
        p.0[0] = 0;
    }
    let (w, h) = src.dimensions();
    let x0 = roi.x.max(0) as u32;
    let y0 = roi.y.max(0) as u32;
    let x1 = (roi.right().max(0) as u32).min(w);
    let y1 = (roi.bottom().max(0) as u32).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            if src.get_pixel(x, y)[0] <= threshold {
                dst.put_pixel(x, y, Luma([255]));
            }
        }
    }
}

/// Binarize `region` of `src` with bright pixels as foreground.
///
/// Returns a region-sized buffer: 255 where the source is at or above
/// `threshold`, 0 elsewhere. Used for glint extraction.
pub fn threshold_above(src: &GrayImage, region: Rect, threshold: u8) -> GrayImage {
    let mut out = GrayImage::new(region.width as u32, region.height as u32);
    let (w, h) = src.dimensions();
    for y in 0..region.height {
        for x in 0..region.width {
            let sx = region.x + x;
            let sy = region.y + y;
            if sx < 0 || sy < 0 || sx >= w as i32 || sy >= h as i32 {
                continue;
            }
            if src.get_pixel(sx as u32, sy as u32)[0] >= threshold {
                out.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
    out
}
