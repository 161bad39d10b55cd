//! Pupil candidate evaluation.
//!
//! Clusters from the binary segmentation are filtered, double-fitted with
//! ray-sampled edge points, validated against a rendered filled-ellipse
//! raster, and scored. A bounded history of recently accepted major-axis
//! lengths ranks temporally coherent candidates; the returned candidate is
//! always the smallest-error one, the coherence test only decides which
//! acceptance path is reported.

use std::collections::VecDeque;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::burst::{cast_ray, spread_metric, BurstConfig};
use crate::cluster::{Cluster, Clusters};
use crate::conic::{fit_ellipse, Ellipse};
use crate::geometry::{dist_sq, point_mean, Rect};

/// Tunables for cluster filtering, fitting and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PupilConfig {
    /// Minimum contour point count.
    pub min_cluster_size: usize,
    /// Maximum contour point count.
    pub max_cluster_size: usize,
    /// Minimum pupil semi-axis, pixels.
    pub min_pupil_radius: f32,
    /// Minimum enclosed contour area, square pixels.
    pub min_pupil_area: f64,
    /// Edge rays per fit pass (forced even; half per horizontal side).
    pub fit_ray_count: usize,
    /// Minimum edge samples surviving the outlier trim.
    pub min_radius_samples: usize,
    /// Coherence window length (accepted major axes remembered).
    pub coherence_frames: usize,
    /// History entries a coherent candidate may disagree with.
    pub max_axis_mismatches: usize,
}

impl Default for PupilConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 30,
            max_cluster_size: 800,
            min_pupil_radius: 3.0,
            min_pupil_area: 300.0,
            fit_ray_count: 16,
            min_radius_samples: 6,
            coherence_frames: 5,
            max_axis_mismatches: 1,
        }
    }
}

/// Per-cluster evaluation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterVerdict {
    /// Rejected by the size/closure/area filter (or a hole border).
    Filtered,
    /// The ray sampler did not yield enough edge points.
    InsufficientEdges,
    /// The fitted ellipse failed a validation gate.
    FailedValidation,
    /// Became candidate with the given index.
    Accepted(usize),
}

/// An accepted pupil fit with its source cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PupilEstimate {
    pub ellipse: Ellipse,
    pub cluster: Cluster,
    /// Validation residual (lower is better).
    pub error: f32,
}

/// Result of evaluating one frame's clusters.
#[derive(Debug, Clone, Default)]
pub struct PupilEvaluation {
    /// Smallest-error validated candidate, if any.
    pub best: Option<PupilEstimate>,
    /// Whether a coherent candidate existed this frame.
    pub coherent: bool,
    /// One verdict per input cluster.
    pub verdicts: Vec<ClusterVerdict>,
}

/// Bounded FIFO of recently accepted major-axis lengths.
#[derive(Debug, Clone)]
pub struct CoherenceHistory {
    entries: VecDeque<f32>,
    capacity: usize,
}

impl CoherenceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append an accepted major axis, evicting the oldest entry when full.
    pub fn push(&mut self, major_axis: f32) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(major_axis);
    }

    /// Drop the oldest entry (failed-frame policy).
    pub fn pop_oldest(&mut self) {
        self.entries.pop_front();
    }

    pub fn iter(&self) -> impl Iterator<Item = &f32> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Evaluates clusters into pupil candidates; owns the cached fit-ray table.
#[derive(Debug, Default)]
pub struct PupilEvaluator {
    fan_angles: Vec<f32>,
    fan_count: usize,
}

impl PupilEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ray angles restricted to ±45° around horizontal on both sides,
    /// recomputed when the configured count changes.
    fn fan(&mut self, ray_count: usize) -> &[f32] {
        let count = (ray_count.max(2) + 1) & !1; // force even
        if count != self.fan_count {
            let half = count / 2;
            let spread = std::f32::consts::FRAC_PI_2;
            let step = spread / half as f32;
            let mut angles = Vec::with_capacity(count);
            for &side in &[0.0f32, std::f32::consts::PI] {
                for k in 0..half {
                    angles.push(side - spread / 2.0 + (k as f32 + 0.5) * step);
                }
            }
            self.fan_angles = angles;
            self.fan_count = count;
        }
        &self.fan_angles
    }

    /// Evaluate all clusters of a frame against the current ROI and history.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &mut self,
        gray: &GrayImage,
        frame: Rect,
        roi: Rect,
        clusters: &Clusters,
        history: &CoherenceHistory,
        edge_threshold: i16,
        cfg: &PupilConfig,
        burst_cfg: &BurstConfig,
    ) -> PupilEvaluation {
        let coherence_tol = frame.width as f32 / 120.0;
        let mut verdicts = vec![ClusterVerdict::Filtered; clusters.clusters.len()];
        let mut best: Option<PupilEstimate> = None;
        let mut best_coherent: Option<f32> = None;
        let mut candidate_index = 0usize;

        for (idx, cluster) in clusters.outer_clusters() {
            if !passes_filter(cluster, cfg) {
                verdicts[idx] = ClusterVerdict::Filtered;
                continue;
            }

            let (verdict, fitted) =
                self.double_fit(gray, frame, roi, cluster, edge_threshold, cfg, burst_cfg);
            let Some((ellipse, n_edges)) = fitted else {
                verdicts[idx] = verdict;
                continue;
            };

            if ellipse.a < cfg.min_pupil_radius as f64 || ellipse.b < cfg.min_pupil_radius as f64 {
                verdicts[idx] = ClusterVerdict::FailedValidation;
                continue;
            }
            let bbox = ellipse.bounding_rect();
            if !roi.contains_rect(&bbox) {
                verdicts[idx] = ClusterVerdict::FailedValidation;
                continue;
            }

            let error = candidate_error(gray, &ellipse, bbox)
                * (cfg.fit_ray_count as f32 / n_edges.max(1) as f32);
            verdicts[idx] = ClusterVerdict::Accepted(candidate_index);
            candidate_index += 1;

            let major = ellipse.major_axis() as f32;
            let coherent =
                axis_mismatches(major, history, coherence_tol) <= cfg.max_axis_mismatches;
            if coherent && best_coherent.map_or(true, |e| error < e) {
                best_coherent = Some(error);
            }
            if best.as_ref().map_or(true, |b| error < b.error) {
                best = Some(PupilEstimate {
                    ellipse,
                    cluster: cluster.clone(),
                    error,
                });
            }
        }

        if let Some(b) = &best {
            if best_coherent.is_some() {
                tracing::debug!(
                    error = b.error,
                    major_axis = b.ellipse.major_axis(),
                    "accepted pupil candidate (coherent with recent frames)"
                );
            } else {
                tracing::debug!(
                    error = b.error,
                    major_axis = b.ellipse.major_axis(),
                    "no coherent candidate; accepting smallest error"
                );
            }
        }

        PupilEvaluation {
            coherent: best_coherent.is_some(),
            best,
            verdicts,
        }
    }

    /// Two ray-sample/fit passes, recentering on the fit between them.
    #[allow(clippy::too_many_arguments)]
    fn double_fit(
        &mut self,
        gray: &GrayImage,
        frame: Rect,
        roi: Rect,
        cluster: &Cluster,
        edge_threshold: i16,
        cfg: &PupilConfig,
        burst_cfg: &BurstConfig,
    ) -> (ClusterVerdict, Option<(Ellipse, usize)>) {
        let Some(mut center) = cluster.point_mean() else {
            return (ClusterVerdict::InsufficientEdges, None);
        };
        let max_len = ((roi.width * roi.width + roi.height * roi.height) as f32).sqrt();
        let mut result = None;

        for _pass in 0..2 {
            let mut points = Vec::new();
            for &angle in self.fan(cfg.fit_ray_count) {
                if let Some(hit) = cast_ray(
                    gray,
                    roi,
                    center,
                    angle,
                    edge_threshold,
                    burst_cfg.start_offset,
                    max_len,
                ) {
                    points.push(hit.point);
                }
            }
            let spread = spread_metric(&points);
            if spread < 0.0 {
                return (ClusterVerdict::InsufficientEdges, None);
            }
            let Some(mean) = point_mean(&points) else {
                return (ClusterVerdict::InsufficientEdges, None);
            };
            let limit = 1.5 * spread.max(0.0).sqrt();
            let limit_sq = limit * limit;
            let kept: Vec<[f32; 2]> = points
                .into_iter()
                .filter(|&p| dist_sq(p, mean) <= limit_sq)
                .collect();
            if kept.len() < cfg.min_radius_samples {
                return (ClusterVerdict::InsufficientEdges, None);
            }

            let pts64: Vec<[f64; 2]> = kept.iter().map(|p| [p[0] as f64, p[1] as f64]).collect();
            let Some(ellipse) = fit_ellipse(&pts64) else {
                return (ClusterVerdict::FailedValidation, None);
            };
            if !frame.contains_rect(&ellipse.bounding_rect()) {
                return (ClusterVerdict::FailedValidation, None);
            }
            center = ellipse.center();
            result = Some((ellipse, kept.len()));
        }

        (ClusterVerdict::FailedValidation, result)
    }
}

fn passes_filter(cluster: &Cluster, cfg: &PupilConfig) -> bool {
    cluster.len() >= cfg.min_cluster_size
        && cluster.len() <= cfg.max_cluster_size
        && cluster.is_closed()
        && cluster.area() > cfg.min_pupil_area
}

/// Count history entries whose major axis disagrees with `major`.
fn axis_mismatches(major: f32, history: &CoherenceHistory, tol: f32) -> usize {
    history.iter().filter(|&&h| (h - major).abs() > tol).count()
}

/// Mean absolute difference between the real sub-image and an ideal
/// dark-pupil raster over the ellipse bounding box.
///
/// The subtraction runs around a fixed midpoint bias of 128 so dark-side and
/// bright-side mismatches weigh equally.
fn candidate_error(gray: &GrayImage, ellipse: &Ellipse, bbox: Rect) -> f32 {
    let (w, h) = gray.dimensions();
    let mut sum = 0u64;
    let mut n = 0u64;
    for y in bbox.y..bbox.bottom() {
        for x in bbox.x..bbox.right() {
            if x < 0 || y < 0 || x >= w as i32 || y >= h as i32 {
                continue;
            }
            let img = gray.get_pixel(x as u32, y as u32)[0] as i32;
            let tpl = if ellipse.contains_point(x as f64 + 0.5, y as f64 + 0.5) {
                0
            } else {
                255
            };
            let biased = (img - tpl + 128).clamp(0, 255);
            sum += (biased - 128).unsigned_abs() as u64;
            n += 1;
        }
    }
    if n == 0 {
        return f32::MAX;
    }
    (sum as f32 / n as f32) / 255.0
}
