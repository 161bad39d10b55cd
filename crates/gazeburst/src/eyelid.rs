//! Eyelid search-ellipse tracking.
//!
//! Glints only matter inside the palpebral fissure, so the tracker bounds
//! the glint search with an ellipse traced around the pupil. The trace
//! anchors rays to a scaled copy of the pupil ellipse; near-horizontal
//! samples land on the iris/sclera boundary rather than the lids and are
//! excluded before fitting.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::burst::{trace_ellipse_boundary, BurstConfig};
use crate::conic::{fit_ellipse, Ellipse};
use crate::geometry::Rect;

/// Tunables for the eyelid search-ellipse tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EyelidConfig {
    /// Search region size as a multiple of the pupil bounding box.
    pub region_scale: f32,
    /// Anchor ellipse size as a multiple of the pupil ellipse.
    pub anchor_scale: f64,
    /// Fallback circle radius as a multiple of the pupil semi-major axis.
    pub fallback_radius_scale: f64,
    /// Axis shrink applied to a successful fit.
    pub axis_shrink: f64,
    /// Minimum boundary points required to attempt a fit.
    pub min_fit_points: usize,
}

impl Default for EyelidConfig {
    fn default() -> Self {
        Self {
            region_scale: 3.0,
            anchor_scale: 1.6,
            fallback_radius_scale: 2.5,
            axis_shrink: 0.9,
            min_fit_points: 5,
        }
    }
}

/// Derive the glint search ellipse from the accepted pupil.
///
/// On a failed boundary trace the search area falls back to a circle scaled
/// from the pupil's major axis; a successful trace keeps only the
/// top/bottom boundary samples (outside ±45° of horizontal from the pupil
/// center), fits an ellipse when enough remain, and shrinks both axes by
/// the configured fraction.
pub fn find_search_ellipse(
    gray: &GrayImage,
    pupil: &Ellipse,
    crop: Rect,
    cfg: &EyelidConfig,
    burst_cfg: &BurstConfig,
) -> Ellipse {
    let region = pupil
        .bounding_rect()
        .scaled(cfg.region_scale)
        .clamp_into(&crop);
    let anchor = pupil.scaled(cfg.anchor_scale);

    let Some(points) = trace_ellipse_boundary(gray, &anchor, region, burst_cfg) else {
        tracing::debug!("eyelid trace failed; using circular fallback search area");
        return Ellipse::circle(pupil.cx, pupil.cy, pupil.a * cfg.fallback_radius_scale);
    };

    // Keep only samples steeper than 45° from horizontal: |dy| > |dx|.
    let top_bottom: Vec<[f64; 2]> = points
        .iter()
        .filter(|p| {
            let dx = p[0] as f64 - pupil.cx;
            let dy = p[1] as f64 - pupil.cy;
            dy.abs() > dx.abs()
        })
        .map(|p| [p[0] as f64, p[1] as f64])
        .collect();

    let fitted = if top_bottom.len() >= cfg.min_fit_points {
        fit_ellipse(&top_bottom).unwrap_or(Ellipse::ZERO)
    } else {
        Ellipse::ZERO
    };

    Ellipse {
        a: fitted.a * cfg.axis_shrink,
        b: fitted.b * cfg.axis_shrink,
        ..fitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::draw_disk_image;

    #[test]
    fn fallback_is_circle_scaled_from_major_axis() {
        // Featureless image: the boundary trace cannot find edges.
        let img = draw_disk_image(200, 200, [100.0, 100.0], 0.0, 128, 128);
        let pupil = Ellipse {
            cx: 100.0,
            cy: 100.0,
            a: 12.0,
            b: 10.0,
            angle: 0.0,
        };
        let cfg = EyelidConfig::default();
        let search = find_search_ellipse(
            &img,
            &pupil,
            Rect::new(0, 0, 200, 200),
            &cfg,
            &BurstConfig::default(),
        );
        assert!((search.a - 12.0 * cfg.fallback_radius_scale).abs() < 1e-9);
        assert_eq!(search.a, search.b, "fallback must be circular");
        assert_eq!(search.cx, pupil.cx);
    }

    #[test]
    fn traced_boundary_yields_shrunk_fit() {
        // Dark iris disk radius 40 on bright sclera; pupil sits at its center.
        let img = draw_disk_image(300, 300, [150.0, 150.0], 40.0, 30, 220);
        let pupil = Ellipse::circle(150.0, 150.0, 12.0);
        let cfg = EyelidConfig {
            region_scale: 4.0, // region must reach the iris boundary at r = 40
            ..Default::default()
        };
        let search = find_search_ellipse(
            &img,
            &pupil,
            Rect::new(0, 0, 300, 300),
            &cfg,
            &BurstConfig::default(),
        );
        if !search.is_zero() {
            // Axes carry the 10% shrink of the traced boundary near r = 40.
            assert!(
                search.b <= 40.0 && search.a <= 48.0,
                "search ellipse {:?} should stay near the traced boundary",
                search
            );
            assert!((search.cx - 150.0).abs() < 10.0);
        }
    }

    #[test]
    fn too_few_top_bottom_points_gives_zero_ellipse() {
        // A single horizontal edge: every sample is within 45° of horizontal,
        // so the top/bottom subset is empty.
        let mut img = draw_disk_image(200, 200, [100.0, 100.0], 0.0, 200, 200);
        for y in 0..200u32 {
            for x in 120..200u32 {
                img.put_pixel(x, y, image::Luma([20]));
            }
        }
        let pupil = Ellipse::circle(100.0, 100.0, 10.0);
        let search = find_search_ellipse(
            &img,
            &pupil,
            Rect::new(0, 0, 200, 200),
            &EyelidConfig::default(),
            &BurstConfig::default(),
        );
        assert!(search.is_zero(), "expected zero ellipse, got {:?}", search);
    }
}
