//! Connected-component clustering seam.
//!
//! The core consumes ordered contour clusters from a binary image but does
//! not own the segmentation algorithm: callers may plug in their own
//! [`Clusterer`]. The default implementation delegates to
//! `imageproc::contours`, which reports the outer/hole border hierarchy the
//! pupil pipeline needs for hole filling.

use image::{GrayImage, Luma};
use imageproc::contours::BorderType;
use imageproc::point::Point;

use crate::geometry::Rect;

/// One connected contour: an ordered closed point sequence in frame
/// coordinates.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Cluster {
    pub points: Vec<[i32; 2]>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether first and last points are within 1 pixel on both axes.
    pub fn is_closed(&self) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => (a[0] - b[0]).abs() <= 1 && (a[1] - b[1]).abs() <= 1,
            _ => false,
        }
    }

    /// Mean of the contour points.
    pub fn point_mean(&self) -> Option<[f32; 2]> {
        if self.points.is_empty() {
            return None;
        }
        let n = self.points.len() as f32;
        let sx: i64 = self.points.iter().map(|p| p[0] as i64).sum();
        let sy: i64 = self.points.iter().map(|p| p[1] as i64).sum();
        Some([sx as f32 / n, sy as f32 / n])
    }

    /// Enclosed area via the shoelace formula.
    pub fn area(&self) -> f64 {
        if self.points.len() < 3 {
            return 0.0;
        }
        let mut acc: i64 = 0;
        for i in 0..self.points.len() {
            let [x0, y0] = self.points[i];
            let [x1, y1] = self.points[(i + 1) % self.points.len()];
            acc += x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64;
        }
        (acc.abs() as f64) / 2.0
    }
}

/// Clustering output: all contours plus the outer/hole partition.
#[derive(Debug, Clone, Default)]
pub struct Clusters {
    pub clusters: Vec<Cluster>,
    /// Indices of outer-border clusters.
    pub outer: Vec<usize>,
    /// Indices of hole-border clusters.
    pub holes: Vec<usize>,
}

impl Clusters {
    /// Iterate outer clusters with their indices into `clusters`.
    pub fn outer_clusters(&self) -> impl Iterator<Item = (usize, &Cluster)> {
        self.outer.iter().map(move |&i| (i, &self.clusters[i]))
    }
}

/// Binary-image segmentation contract consumed by the tracker.
pub trait Clusterer {
    /// Extract contours from `binary` restricted to `roi`.
    ///
    /// Returned point coordinates are in `binary`'s coordinate frame.
    fn clusterise(&self, binary: &GrayImage, roi: Rect) -> Clusters;
}

/// Default clusterer backed by `imageproc`'s border-following contours.
#[derive(Debug, Clone, Default)]
pub struct ContourClusterer;

impl Clusterer for ContourClusterer {
    fn clusterise(&self, binary: &GrayImage, roi: Rect) -> Clusters {
        let frame = Rect::from_dims(binary.width(), binary.height());
        let Some(region) = roi.intersect(&frame) else {
            return Clusters::default();
        };
        let sub = image::imageops::crop_imm(
            binary,
            region.x as u32,
            region.y as u32,
            region.width as u32,
            region.height as u32,
        )
        .to_image();

        let mut out = Clusters::default();
        for contour in imageproc::contours::find_contours::<i32>(&sub) {
            let cluster = Cluster {
                points: contour
                    .points
                    .iter()
                    .map(|p| [p.x + region.x, p.y + region.y])
                    .collect(),
            };
            let idx = out.clusters.len();
            match contour.border_type {
                BorderType::Outer => out.outer.push(idx),
                BorderType::Hole => out.holes.push(idx),
            }
            out.clusters.push(cluster);
        }
        out
    }
}

/// Fill hole contours of `clusters` with foreground in `binary`.
///
/// Glints inside the pupil punch holes into the inverse-thresholded blob;
/// filling them keeps the pupil cluster solid for downstream consumers.
pub fn fill_holes(binary: &mut GrayImage, clusters: &Clusters) {
    for &i in &clusters.holes {
        let cluster = &clusters.clusters[i];
        let mut poly: Vec<Point<i32>> = cluster
            .points
            .iter()
            .map(|&[x, y]| Point::new(x, y))
            .collect();
        // draw_polygon_mut rejects a closed polygon with equal endpoints.
        if poly.len() > 1 && poly.first() == poly.last() {
            poly.pop();
        }
        if poly.len() < 3 {
            for p in &poly {
                if p.x >= 0
                    && p.y >= 0
                    && (p.x as u32) < binary.width()
                    && (p.y as u32) < binary.height()
                {
                    binary.put_pixel(p.x as u32, p.y as u32, Luma([255]));
                }
            }
            continue;
        }
        imageproc::drawing::draw_polygon_mut(binary, &poly, Luma([255]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_rect_image(w: u32, h: u32, r: Rect) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        for y in r.y..r.bottom() {
            for x in r.x..r.right() {
                img.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
        img
    }

    #[test]
    fn single_blob_yields_one_outer_cluster() {
        let img = filled_rect_image(20, 20, Rect::new(5, 5, 6, 6));
        let clusters = ContourClusterer.clusterise(&img, Rect::new(0, 0, 20, 20));
        assert_eq!(clusters.outer.len(), 1);
        assert!(clusters.holes.is_empty());

        let c = &clusters.clusters[clusters.outer[0]];
        assert!(c.is_closed(), "contour should close on itself");
        let [mx, my] = c.point_mean().unwrap();
        assert!((mx - 7.5).abs() < 1.0, "mx = {}", mx);
        assert!((my - 7.5).abs() < 1.0, "my = {}", my);
    }

    #[test]
    fn roi_offset_is_applied_to_points() {
        let img = filled_rect_image(30, 30, Rect::new(10, 10, 5, 5));
        let clusters = ContourClusterer.clusterise(&img, Rect::new(8, 8, 20, 20));
        assert_eq!(clusters.outer.len(), 1);
        let c = &clusters.clusters[clusters.outer[0]];
        assert!(
            c.points.iter().all(|&[x, y]| (10..15).contains(&x) && (10..15).contains(&y)),
            "points must be reported in frame coordinates"
        );
    }

    #[test]
    fn blob_with_hole_reports_both_borders() {
        let mut img = filled_rect_image(30, 30, Rect::new(5, 5, 14, 14));
        // Punch a hole.
        for y in 10..14 {
            for x in 10..14 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let clusters = ContourClusterer.clusterise(&img, Rect::new(0, 0, 30, 30));
        assert_eq!(clusters.outer.len(), 1);
        assert_eq!(clusters.holes.len(), 1);

        fill_holes(&mut img, &clusters);
        assert_eq!(
            img.get_pixel(11, 11)[0],
            255,
            "hole interior should be filled"
        );
    }

    #[test]
    fn shoelace_area_of_square() {
        let c = Cluster {
            points: vec![[0, 0], [10, 0], [10, 10], [0, 10]],
        };
        assert!((c.area() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn cluster_outside_roi_is_ignored() {
        let img = filled_rect_image(40, 40, Rect::new(30, 30, 5, 5));
        let clusters = ContourClusterer.clusterise(&img, Rect::new(0, 0, 20, 20));
        assert!(clusters.clusters.is_empty());
    }
}
