//! Synthetic disk templates for glint scoring.
//!
//! Glints are small, round, near-saturated highlights. Instead of learned
//! templates the matcher rasterizes an ideal filled disk once and scores
//! image patches by normalized squared difference. Out-of-bounds footprints
//! score the sentinel maximum rather than erroring (callers gate on the
//! score, not on a Result).

use image::{GrayImage, Luma};

/// Score returned when the template footprint leaves the image.
pub const MAX_MATCH_ERROR: f32 = 1.0;

/// Square raster holding a filled disk on a zero background.
#[derive(Debug, Clone)]
pub struct DiskTemplate {
    raster: GrayImage,
}

impl DiskTemplate {
    /// Build a template with side = next odd number ≥ `size` and a filled
    /// disk of `radius` pixels centered on the middle pixel.
    pub fn new(size: u32, radius: u32) -> Self {
        let side = if size % 2 == 0 { size + 1 } else { size }.max(1);
        let mut raster = GrayImage::new(side, side);
        let c = (side / 2) as i32;
        let r_sq = (radius * radius) as i32;
        for y in 0..side {
            for x in 0..side {
                let dx = x as i32 - c;
                let dy = y as i32 - c;
                if dx * dx + dy * dy <= r_sq {
                    raster.put_pixel(x, y, Luma([255]));
                }
            }
        }
        Self { raster }
    }

    /// Template side length (always odd).
    pub fn side(&self) -> u32 {
        self.raster.width()
    }

    pub fn raster(&self) -> &GrayImage {
        &self.raster
    }

    /// Mean normalized squared difference between the template centered at
    /// `(cx, cy)` and the image patch under it.
    ///
    /// Returns [`MAX_MATCH_ERROR`] when the footprint is not fully contained
    /// in the image; otherwise a value in [0, 1] where 0 is a perfect match.
    pub fn match_error(&self, gray: &GrayImage, cx: i32, cy: i32) -> f32 {
        let side = self.side() as i32;
        let half = side / 2;
        let (w, h) = gray.dimensions();
        let x0 = cx - half;
        let y0 = cy - half;
        if x0 < 0 || y0 < 0 || x0 + side > w as i32 || y0 + side > h as i32 {
            return MAX_MATCH_ERROR;
        }

        let mut sum = 0.0f32;
        for ty in 0..side {
            for tx in 0..side {
                let img = gray.get_pixel((x0 + tx) as u32, (y0 + ty) as u32)[0] as f32;
                let tpl = self.raster.get_pixel(tx as u32, ty as u32)[0] as f32;
                let d = (img - tpl) / 255.0;
                sum += d * d;
            }
        }
        sum / (side * side) as f32
    }
}

/// Elongation of a binary blob through its center of mass.
///
/// Walks contiguous foreground runs left/right and up/down from `(cx, cy)`
/// and compares the horizontal and vertical extents: 0 means the extents are
/// equal (circular), values toward 1 mean an elongated blob. Returns 1.0
/// when the center pixel itself is background.
pub fn circularity_error(binary: &GrayImage, cx: i32, cy: i32) -> f32 {
    let (w, h) = binary.dimensions();
    if cx < 0 || cy < 0 || cx >= w as i32 || cy >= h as i32 {
        return 1.0;
    }
    let fg = |x: i32, y: i32| -> bool {
        x >= 0 && y >= 0 && x < w as i32 && y < h as i32 && binary.get_pixel(x as u32, y as u32)[0] > 0
    };
    if !fg(cx, cy) {
        return 1.0;
    }

    let run = |dx: i32, dy: i32| -> i32 {
        let mut n = 0;
        let (mut x, mut y) = (cx + dx, cy + dy);
        while fg(x, y) {
            n += 1;
            x += dx;
            y += dy;
        }
        n
    };

    let h_extent = (run(-1, 0) + run(1, 0) + 1) as f32;
    let v_extent = (run(0, -1) + run(0, 1) + 1) as f32;
    1.0 - h_extent.min(v_extent) / h_extent.max(v_extent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_side_is_odd_and_at_least_size() {
        for size in 1..20u32 {
            let t = DiskTemplate::new(size, 2);
            assert!(t.side() % 2 == 1, "side {} not odd", t.side());
            assert!(t.side() >= size);
            assert_eq!(t.raster().width(), t.raster().height());
        }
    }

    #[test]
    fn match_error_sentinel_exactly_at_bounds() {
        let t = DiskTemplate::new(5, 2);
        let img = GrayImage::new(20, 20);
        let half = (t.side() / 2) as i32;
        // Fully inside: real score.
        assert!(t.match_error(&img, 10, 10) < MAX_MATCH_ERROR);
        assert!(t.match_error(&img, half, half) < MAX_MATCH_ERROR);
        // One pixel past any edge: sentinel.
        assert_eq!(t.match_error(&img, half - 1, 10), MAX_MATCH_ERROR);
        assert_eq!(t.match_error(&img, 10, half - 1), MAX_MATCH_ERROR);
        assert_eq!(t.match_error(&img, 20 - half, 10), MAX_MATCH_ERROR);
        assert_eq!(t.match_error(&img, 10, 20 - half), MAX_MATCH_ERROR);
    }

    #[test]
    fn match_error_zero_on_exact_patch() {
        let t = DiskTemplate::new(7, 3);
        let side = t.side();
        let mut img = GrayImage::new(31, 31);
        let ox = 12u32;
        let oy = 12u32;
        for y in 0..side {
            for x in 0..side {
                img.put_pixel(ox + x, oy + y, *t.raster().get_pixel(x, y));
            }
        }
        let c = (side / 2) as i32;
        let err = t.match_error(&img, ox as i32 + c, oy as i32 + c);
        assert!(err.abs() < 1e-6, "exact patch should score 0, got {}", err);
    }

    #[test]
    fn match_error_in_unit_range() {
        let t = DiskTemplate::new(9, 4);
        let mut img = GrayImage::new(40, 40);
        for p in img.pixels_mut() {
            p.0[0] = 255;
        }
        let err = t.match_error(&img, 20, 20);
        assert!((0.0..=1.0).contains(&err), "err = {}", err);
    }

    #[test]
    fn circularity_of_square_blob_is_zero() {
        let mut img = GrayImage::new(21, 21);
        for y in 8..13 {
            for x in 8..13 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        assert!(circularity_error(&img, 10, 10).abs() < 1e-6);
    }

    #[test]
    fn circularity_of_bar_approaches_one() {
        let mut img = GrayImage::new(41, 41);
        for x in 0..41 {
            img.put_pixel(x, 20, Luma([255]));
        }
        let e = circularity_error(&img, 20, 20);
        assert!(e > 0.9, "bar should be strongly elongated, got {}", e);
    }

    #[test]
    fn circularity_on_background_is_worst_case() {
        let img = GrayImage::new(10, 10);
        assert_eq!(circularity_error(&img, 5, 5), 1.0);
    }
}
