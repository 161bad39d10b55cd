//! Adaptive boundary ray search ("burst").
//!
//! The locator casts radial rays from a seed point, records the first
//! intensity jump along each ray as a boundary sample, casts return-ray
//! bundles from each sample back toward the seed, and recenters on the
//! centroid of the merged cloud until it converges. A persisted
//! [`BurstSearch`] additionally remembers the discovered edge threshold and
//! a baseline dispersion so that a sudden spread change is classified as a
//! retryable failure rather than silently accepted.
//!
//! A stateless specialization anchors rays to an ellipse perimeter instead
//! of a point; the eyelid tracker uses it to trace the boundary around an
//! already-fitted pupil.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::conic::Ellipse;
use crate::geometry::{dist_sq, point_mean, Rect};

/// Sentinel returned by [`spread_metric`] for an empty point set.
pub const SPREAD_UNDEFINED: f32 = -1.0;

/// Tunables for the boundary ray search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Number of primary rays per sweep.
    pub ray_count: usize,
    /// Angular spread covered by a sweep, radians.
    pub angular_spread: f32,
    /// Radial offset at which each ray starts sampling, pixels.
    pub start_offset: f32,
    /// Maximum ray length, pixels.
    pub max_ray_length: f32,
    /// Minimum boundary samples for a sweep to count.
    pub min_seed_points: usize,
    /// L1 centroid displacement below which the loop has converged, pixels.
    pub convergence_dist: f32,
    /// Maximum recentering iterations per sweep.
    pub max_iterations: usize,
    /// Discovery grid side K (up to K×K candidate seeds).
    pub discovery_grid: usize,
    /// Lowest edge threshold scanned during discovery.
    pub threshold_min: i16,
    /// Highest edge threshold scanned during point-seeded discovery.
    pub threshold_max: i16,
    /// Highest edge threshold scanned by the ellipse-anchored variant.
    pub ellipse_threshold_max: i16,
    /// Outlier cutoff as a multiple of sqrt(spread).
    pub outlier_distance_mult: f32,
    /// Maximum relative deviation of sqrt(spread) from the baseline.
    pub max_spread_deviation: f32,
    /// Relative spread window treated as a tie during discovery.
    pub spread_tie_frac: f32,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            ray_count: 18,
            angular_spread: std::f32::consts::TAU,
            start_offset: 3.0,
            max_ray_length: 150.0,
            min_seed_points: 5,
            convergence_dist: 2.0,
            max_iterations: 10,
            discovery_grid: 4,
            threshold_min: 1,
            threshold_max: 10,
            ellipse_threshold_max: 20,
            outlier_distance_mult: 2.0,
            max_spread_deviation: 0.3,
            spread_tie_frac: 0.1,
        }
    }
}

/// Accepted boundary fit produced by a successful search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BurstFit {
    /// Centroid of the inlier boundary samples; the next frame's seed.
    pub center: [f32; 2],
    /// Boundary samples that survived the outlier trim.
    pub inliers: Vec<[f32; 2]>,
    /// Samples removed by the outlier trim (kept for visualization).
    pub outliers: Vec<[f32; 2]>,
    /// Combined dispersion of the inlier set.
    pub spread: f32,
    /// Mean source intensity under the inlier samples.
    pub brightness: u8,
    /// Edge threshold the fit was produced with.
    pub edge_threshold: i16,
}

/// Three-outcome result of one `process` call.
#[derive(Debug, Clone)]
pub enum BurstOutcome {
    Success(BurstFit),
    /// Spread deviated from the baseline; retried once inside `process`.
    Retryable,
    /// No usable boundary this frame.
    Fatal,
}

impl BurstOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// One boundary sample: sub-pixel position plus the intensity jump that
/// produced it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EdgeHit {
    pub point: [f32; 2],
    pub jump: f32,
}

/// Persistent state of the point-seeded boundary search.
#[derive(Debug, Clone)]
pub struct BurstSearch {
    seed: [f32; 2],
    edge_threshold: i16,
    needs_rediscovery: bool,
    center: [f32; 2],
    baseline_spread_sqrt: f32,
}

impl Default for BurstSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl BurstSearch {
    pub fn new() -> Self {
        Self {
            seed: [0.0, 0.0],
            edge_threshold: 0,
            needs_rediscovery: true,
            center: [0.0, 0.0],
            baseline_spread_sqrt: 0.0,
        }
    }

    /// Force a full threshold/seed rediscovery on the next `process` call.
    pub fn force_rediscovery(&mut self) {
        self.needs_rediscovery = true;
    }

    pub fn needs_rediscovery(&self) -> bool {
        self.needs_rediscovery
    }

    /// Edge threshold selected by the last discovery pass.
    pub fn edge_threshold(&self) -> i16 {
        self.edge_threshold
    }

    /// Last accepted boundary centroid.
    pub fn center(&self) -> [f32; 2] {
        self.center
    }

    /// Run the search over `region`, retrying once on a retryable failure.
    ///
    /// `seed_hint` collapses the discovery grid to a single candidate seed.
    pub fn process(
        &mut self,
        gray: &GrayImage,
        region: Rect,
        seed_hint: Option<[f32; 2]>,
        cfg: &BurstConfig,
    ) -> BurstOutcome {
        let mut outcome = self.run_once(gray, region, seed_hint, cfg);
        if matches!(outcome, BurstOutcome::Retryable) {
            tracing::debug!("burst spread deviated from baseline; retrying with rediscovery");
            outcome = self.run_once(gray, region, seed_hint, cfg);
        }
        outcome
    }

    fn run_once(
        &mut self,
        gray: &GrayImage,
        region: Rect,
        seed_hint: Option<[f32; 2]>,
        cfg: &BurstConfig,
    ) -> BurstOutcome {
        let discovery = self.needs_rediscovery;
        if discovery {
            let Some(found) = discover(gray, region, seed_hint, cfg) else {
                return BurstOutcome::Fatal;
            };
            tracing::debug!(
                threshold = found.threshold,
                spread = found.spread,
                n_points = found.n_points,
                "burst discovery selected seed ({:.1}, {:.1})",
                found.seed[0],
                found.seed[1],
            );
            self.seed = found.seed;
            self.edge_threshold = found.threshold;
            self.baseline_spread_sqrt = found.spread.max(0.0).sqrt();
        }

        let trace = converge(gray, region, self.seed, self.edge_threshold, cfg);
        let points = trace.points;
        let spread = spread_metric(&points);
        if points.is_empty() || spread < 0.0 {
            return BurstOutcome::Fatal;
        }

        // Trim samples far from the mean, then re-derive the statistics.
        let Some(mean) = point_mean(&points) else {
            return BurstOutcome::Fatal;
        };
        let limit = cfg.outlier_distance_mult * spread.max(0.0).sqrt();
        let limit_sq = limit * limit;
        let (inliers, outliers): (Vec<[f32; 2]>, Vec<[f32; 2]>) =
            points.into_iter().partition(|&p| dist_sq(p, mean) <= limit_sq);
        let spread = spread_metric(&inliers);
        if inliers.is_empty() || spread < 0.0 {
            return BurstOutcome::Fatal;
        }

        let spread_sqrt = spread.max(0.0).sqrt();
        if self.baseline_spread_sqrt > f32::EPSILON {
            let deviation =
                (spread_sqrt - self.baseline_spread_sqrt).abs() / self.baseline_spread_sqrt;
            if deviation > cfg.max_spread_deviation {
                if discovery {
                    return BurstOutcome::Fatal;
                }
                self.needs_rediscovery = true;
                return BurstOutcome::Retryable;
            }
        }

        let center = point_mean(&inliers).unwrap_or(mean);
        self.center = center;
        self.seed = center;
        self.needs_rediscovery = false;
        let brightness = mean_intensity(gray, &inliers);
        BurstOutcome::Success(BurstFit {
            center,
            inliers,
            outliers,
            spread,
            brightness,
            edge_threshold: self.edge_threshold,
        })
    }
}

/// Trace a boundary anchored to an ellipse perimeter.
///
/// Rays start on the perimeter and run outward along their own angle. A
/// single discovery pass scans the wider ellipse threshold range; there is
/// no seed grid and no persistent state. Returns the point set of the best
/// threshold (smallest spread, fewer points among near-ties), or `None`
/// when no threshold yields enough samples.
pub fn trace_ellipse_boundary(
    gray: &GrayImage,
    ellipse: &Ellipse,
    region: Rect,
    cfg: &BurstConfig,
) -> Option<Vec<[f32; 2]>> {
    if !ellipse.is_valid() {
        return None;
    }
    let mut best: Option<(Vec<[f32; 2]>, f32)> = None;
    for threshold in cfg.threshold_min..=cfg.ellipse_threshold_max {
        let mut points = Vec::new();
        for k in 0..cfg.ray_count {
            let theta = std::f64::consts::TAU * k as f64 / cfg.ray_count.max(1) as f64;
            let start = ellipse.point_at_angle(theta);
            if let Some(hit) = cast_ray(
                gray,
                region,
                start,
                theta as f32,
                threshold,
                1.0,
                cfg.max_ray_length,
            ) {
                points.push(hit.point);
            }
        }
        if points.len() < cfg.min_seed_points {
            continue;
        }
        let spread = spread_metric(&points);
        if spread < 0.0 {
            continue;
        }
        let replace = match &best {
            None => true,
            Some((bp, bs)) => {
                spread < bs * (1.0 - cfg.spread_tie_frac)
                    || (spread <= bs * (1.0 + cfg.spread_tie_frac) && points.len() < bp.len())
            }
        };
        if replace {
            best = Some((points, spread));
        }
    }
    best.map(|(points, _)| points)
}

// ── Discovery ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Discovery {
    seed: [f32; 2],
    threshold: i16,
    spread: f32,
    n_points: usize,
}

/// Scan candidate (seed, threshold) pairs and keep the tightest point cloud.
fn discover(
    gray: &GrayImage,
    region: Rect,
    seed_hint: Option<[f32; 2]>,
    cfg: &BurstConfig,
) -> Option<Discovery> {
    let seeds: Vec<[f32; 2]> = match seed_hint {
        Some(hint) => vec![hint],
        None => {
            let k = cfg.discovery_grid.max(1) as i32;
            let mut grid = Vec::with_capacity((k * k) as usize);
            for j in 1..=k {
                for i in 1..=k {
                    grid.push([
                        region.x as f32 + region.width as f32 * i as f32 / (k + 1) as f32,
                        region.y as f32 + region.height as f32 * j as f32 / (k + 1) as f32,
                    ]);
                }
            }
            grid
        }
    };

    let mut best: Option<Discovery> = None;
    for &seed in &seeds {
        for threshold in cfg.threshold_min..=cfg.threshold_max {
            let trace = converge(gray, region, seed, threshold, cfg);
            if trace.points.len() < cfg.min_seed_points {
                continue;
            }
            let spread = spread_metric(&trace.points);
            if spread < 0.0 {
                continue;
            }
            let candidate = Discovery {
                seed,
                threshold,
                spread,
                n_points: trace.points.len(),
            };
            let replace = match &best {
                None => true,
                Some(b) => {
                    spread < b.spread * (1.0 - cfg.spread_tie_frac)
                        || (spread <= b.spread * (1.0 + cfg.spread_tie_frac)
                            && candidate.n_points < b.n_points)
                }
            };
            if replace {
                best = Some(candidate);
            }
        }
    }
    best
}

// ── Inner loop ─────────────────────────────────────────────────────────────

pub(crate) struct RayTrace {
    pub points: Vec<[f32; 2]>,
    pub converged: bool,
}

/// Iteratively recenter on the centroid of the merged seed + return-ray
/// boundary samples.
pub(crate) fn converge(
    gray: &GrayImage,
    region: Rect,
    start: [f32; 2],
    threshold: i16,
    cfg: &BurstConfig,
) -> RayTrace {
    let ray_count = cfg.ray_count.max(1);
    let base_step = cfg.angular_spread / ray_count as f32;
    let mut center = start;
    let mut last = Vec::new();

    for _ in 0..cfg.max_iterations.max(1) {
        let seeds = cast_fan(
            gray,
            region,
            center,
            0.0,
            cfg.angular_spread,
            base_step,
            threshold,
            cfg.start_offset,
            cfg.max_ray_length,
        );
        if seeds.len() < cfg.min_seed_points {
            return RayTrace {
                points: seeds.iter().map(|h| h.point).collect(),
                converged: false,
            };
        }

        let mut merged: Vec<[f32; 2]> = seeds.iter().map(|h| h.point).collect();
        for hit in &seeds {
            let back = (center[1] - hit.point[1]).atan2(center[0] - hit.point[0]);
            // Strong edges earn a finer return bundle.
            let step =
                (base_step * threshold.max(1) as f32 / hit.jump.max(1.0)).max(base_step / 8.0);
            let reach = (2.0 * dist_sq(hit.point, center).sqrt()).min(cfg.max_ray_length);
            let returns = cast_fan(
                gray,
                region,
                hit.point,
                back,
                cfg.angular_spread,
                step,
                threshold,
                1.0,
                reach,
            );
            merged.extend(returns.iter().map(|h| h.point));
        }

        let Some(centroid) = point_mean(&merged) else {
            return RayTrace {
                points: merged,
                converged: false,
            };
        };
        let l1 = (centroid[0] - center[0]).abs() + (centroid[1] - center[1]).abs();
        last = merged;
        if l1 < cfg.convergence_dist {
            return RayTrace {
                points: last,
                converged: true,
            };
        }
        center = centroid;
    }

    RayTrace {
        points: last,
        converged: false,
    }
}

/// Cast a fan of rays centered on `fan_center` covering `spread` radians.
pub(crate) fn cast_fan(
    gray: &GrayImage,
    region: Rect,
    origin: [f32; 2],
    fan_center: f32,
    spread: f32,
    step: f32,
    threshold: i16,
    start_offset: f32,
    max_len: f32,
) -> Vec<EdgeHit> {
    let n = ((spread / step.max(1e-3)).round() as usize).clamp(1, 512);
    let mut hits = Vec::new();
    for k in 0..n {
        let angle = fan_center - spread / 2.0 + (k as f32 + 0.5) * step;
        if let Some(hit) = cast_ray(gray, region, origin, angle, threshold, start_offset, max_len) {
            hits.push(hit);
        }
    }
    hits
}

/// Walk one ray outward and report the first intensity jump above
/// `threshold`, positioned at the midpoint of the step that produced it.
pub(crate) fn cast_ray(
    gray: &GrayImage,
    region: Rect,
    origin: [f32; 2],
    angle: f32,
    threshold: i16,
    start_offset: f32,
    max_len: f32,
) -> Option<EdgeHit> {
    let (dy, dx) = angle.sin_cos();
    let mut r = start_offset.max(0.0);
    let mut prev = {
        let x = origin[0] + dx * r;
        let y = origin[1] + dy * r;
        if !region.contains_point(x, y) {
            return None;
        }
        sample_bilinear(gray, x, y)?
    };

    while r < max_len {
        r += 1.0;
        let x = origin[0] + dx * r;
        let y = origin[1] + dy * r;
        if !region.contains_point(x, y) {
            return None;
        }
        let cur = sample_bilinear(gray, x, y)?;
        let jump = (cur - prev).abs();
        if jump > threshold as f32 {
            let mid = r - 0.5;
            return Some(EdgeHit {
                point: [origin[0] + dx * mid, origin[1] + dy * mid],
                jump,
            });
        }
        prev = cur;
    }
    None
}

/// Bilinear intensity sample in [0, 255], `None` outside the image.
#[inline]
pub(crate) fn sample_bilinear(img: &GrayImage, x: f32, y: f32) -> Option<f32> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    if x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let p00 = img.get_pixel(x0, y0)[0] as f32;
    let p10 = img.get_pixel(x0 + 1, y0)[0] as f32;
    let p01 = img.get_pixel(x0, y0 + 1)[0] as f32;
    let p11 = img.get_pixel(x0 + 1, y0 + 1)[0] as f32;
    Some((1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11)
}

/// Combined per-axis dispersion of a point set.
///
/// Computes sample variance per axis and returns `sqrt(varX² + varY²)` —
/// the historical combined score the baseline and outlier thresholds were
/// tuned against, not a true 2-D variance. Returns [`SPREAD_UNDEFINED`] for
/// an empty set.
pub fn spread_metric(points: &[[f32; 2]]) -> f32 {
    if points.is_empty() {
        return SPREAD_UNDEFINED;
    }
    let n = points.len() as f64;
    let (mut sx, mut sy, mut sxx, mut syy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for p in points {
        let x = p[0] as f64;
        let y = p[1] as f64;
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
    }
    let var_x = (sxx / n - (sx / n).powi(2)).max(0.0);
    let var_y = (syy / n - (sy / n).powi(2)).max(0.0);
    ((var_x * var_x + var_y * var_y) as f32).sqrt()
}

/// Mean nearest-pixel intensity under a point set, rounded to a byte.
fn mean_intensity(gray: &GrayImage, points: &[[f32; 2]]) -> u8 {
    let (w, h) = gray.dimensions();
    let mut sum = 0u32;
    let mut n = 0u32;
    for p in points {
        let x = p[0].round() as i64;
        let y = p[1].round() as i64;
        if x >= 0 && y >= 0 && (x as u32) < w && (y as u32) < h {
            sum += gray.get_pixel(x as u32, y as u32)[0] as u32;
            n += 1;
        }
    }
    if n == 0 {
        0
    } else {
        ((sum as f32 / n as f32).round() as u32).min(255) as u8
    }
}
