//! Corneal-reflection (glint) detection.
//!
//! Bright contours inside the eyelid search ellipse are scored against a
//! synthetic disk template and accepted greedily in score order, subject to
//! a minimum pairwise distance. Accepted centers are refined with a
//! stack-based flood fill over the thresholded sub-region.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::cluster::Clusterer;
use crate::conic::Ellipse;
use crate::geometry::Rect;
use crate::preprocess::threshold_above;
use crate::template::DiskTemplate;

/// Tunables for glint detection and selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlintConfig {
    /// Maximum number of accepted glints (clamped to 1..=20).
    pub max_glints: usize,
    /// Binarization threshold for the glint sub-region.
    pub threshold: u8,
    /// Template side length hint (forced odd by the template builder).
    pub mask_length: u32,
    /// Template disk radius, pixels.
    pub mask_radius: u32,
    /// Relative error cutoff divisor in (0, 1]; the cutoff is
    /// `best_score / divisor`.
    pub max_err_divisor: f32,
    /// Expected maximum glint width, pixels. Accepted centers must be at
    /// least 1.5× this far apart.
    pub max_glint_width: f32,
    /// Flood-fill threshold as a fraction of the seed intensity.
    pub fill_intensity_frac: f32,
}

impl Default for GlintConfig {
    fn default() -> Self {
        Self {
            max_glints: 2,
            threshold: 200,
            mask_length: 11,
            mask_radius: 3,
            max_err_divisor: 0.5,
            max_glint_width: 5.0,
            fill_intensity_frac: 0.8,
        }
    }
}

/// Accepted glint centers, ordered by ascending x.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlintSet {
    pub centers: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, Copy)]
struct GlintCandidate {
    point: [f32; 2],
    score: f32,
}

/// Detect up to `cfg.max_glints` glints inside the search ellipse.
pub fn find_glints(
    gray: &GrayImage,
    search: &Ellipse,
    roi: Rect,
    clusterer: &dyn Clusterer,
    cfg: &GlintConfig,
) -> GlintSet {
    if search.is_zero() {
        return GlintSet::default();
    }
    let Some(region) = search.bounding_rect().intersect(&roi) else {
        return GlintSet::default();
    };

    let binary = threshold_above(gray, region, cfg.threshold);
    let clusters = clusterer.clusterise(&binary, Rect::from_dims(binary.width(), binary.height()));

    let template = DiskTemplate::new(cfg.mask_length, cfg.mask_radius);
    let mut candidates = Vec::new();
    for (_, cluster) in clusters.outer_clusters() {
        let Some([mx, my]) = cluster.point_mean() else {
            continue;
        };
        let point = [mx + region.x as f32, my + region.y as f32];
        if !search.contains_point(point[0] as f64, point[1] as f64) {
            continue;
        }
        let score = template.match_error(gray, point[0].round() as i32, point[1].round() as i32);
        candidates.push(GlintCandidate { point, score });
    }

    select_glints(gray, region, candidates, cfg)
}

/// Greedy selection over score-sorted candidates with flood-fill refinement.
fn select_glints(
    gray: &GrayImage,
    region: Rect,
    mut candidates: Vec<GlintCandidate>,
    cfg: &GlintConfig,
) -> GlintSet {
    if candidates.is_empty() {
        return GlintSet::default();
    }
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score));

    let divisor = cfg.max_err_divisor.clamp(f32::EPSILON, 1.0);
    let max_acceptable = candidates[0].score / divisor;
    let min_dist = 1.5 * cfg.max_glint_width;
    let min_dist_sq = min_dist * min_dist;
    let max_glints = cfg.max_glints.clamp(1, 20);

    // Working copy the flood fill is allowed to consume.
    let mut work = crop_region(gray, region);

    let mut accepted: Vec<[f32; 2]> = Vec::new();
    for cand in &candidates {
        if accepted.len() >= max_glints {
            break;
        }
        // Sorted ascending, so everything after the cutoff is out too.
        if cand.score > max_acceptable {
            break;
        }
        let too_close = accepted.iter().any(|a| {
            let dx = a[0] - cand.point[0];
            let dy = a[1] - cand.point[1];
            dx * dx + dy * dy < min_dist_sq
        });
        if too_close {
            continue;
        }

        let local = [
            cand.point[0] - region.x as f32,
            cand.point[1] - region.y as f32,
        ];
        let refined = refine_center(&mut work, local, cfg);
        accepted.push([
            refined[0] + region.x as f32,
            refined[1] + region.y as f32,
        ]);
    }

    accepted.sort_by(|a, b| a[0].total_cmp(&b[0]));
    tracing::debug!(n = accepted.len(), "glint selection finished");
    GlintSet { centers: accepted }
}

fn crop_region(gray: &GrayImage, region: Rect) -> GrayImage {
    image::imageops::crop_imm(
        gray,
        region.x as u32,
        region.y as u32,
        region.width as u32,
        region.height as u32,
    )
    .to_image()
}

/// Flood-fill centroid refinement around an accepted candidate.
///
/// The fill is confined to a square window of the configured glint width
/// around the seed and consumes pixels strictly above
/// `fill_intensity_frac × seed intensity` by zeroing them.
fn refine_center(work: &mut GrayImage, seed: [f32; 2], cfg: &GlintConfig) -> [f32; 2] {
    let (w, h) = work.dimensions();
    let sx = seed[0].round() as i32;
    let sy = seed[1].round() as i32;
    if sx < 0 || sy < 0 || sx >= w as i32 || sy >= h as i32 {
        return seed;
    }
    let half = cfg.max_glint_width.ceil() as i32;
    let window = Rect::new(sx - half, sy - half, 2 * half + 1, 2 * half + 1);
    let threshold = cfg.fill_intensity_frac * work.get_pixel(sx as u32, sy as u32)[0] as f32;

    flood_fill_centroid(work, [sx, sy], window, threshold).unwrap_or(seed)
}

/// Non-recursive flood fill; returns the centroid of consumed pixels or
/// `None` when no pixel exceeded the threshold.
fn flood_fill_centroid(
    work: &mut GrayImage,
    seed: [i32; 2],
    window: Rect,
    threshold: f32,
) -> Option<[f32; 2]> {
    let (w, h) = work.dimensions();
    let mut stack = vec![seed];
    let (mut sum_x, mut sum_y, mut count) = (0f64, 0f64, 0u32);

    while let Some([x, y]) = stack.pop() {
        if x < 0 || y < 0 || x >= w as i32 || y >= h as i32 {
            continue;
        }
        if !window.contains_point(x as f32, y as f32) {
            continue;
        }
        let value = work.get_pixel(x as u32, y as u32)[0] as f32;
        // Zeroed pixels double as the visited mask.
        if value <= threshold {
            continue;
        }
        work.put_pixel(x as u32, y as u32, image::Luma([0]));
        sum_x += x as f64;
        sum_y += y as f64;
        count += 1;
        stack.push([x + 1, y]);
        stack.push([x - 1, y]);
        stack.push([x, y + 1]);
        stack.push([x, y - 1]);
    }

    (count > 0).then(|| [(sum_x / count as f64) as f32, (sum_y / count as f64) as f32])
}
