//! Ellipse geometry and direct least-squares fitting.
//!
//! The pupil and eyelid estimators both reduce boundary point clouds to
//! geometric ellipses via the direct conic fit of Fitzgibbon et al. (1999).
//! The geometric helpers (`point_at_angle`, `contains_point`) are the seams
//! the ray search and glint finder use to anchor rays to a contour and to
//! gate candidates to the search area.

use nalgebra::{DMatrix, Matrix3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

/// Errors that can occur during ellipse fitting.
#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    /// Too few points for a conic fit.
    TooFewPoints {
        /// Required minimum number of points.
        needed: usize,
        /// Provided number of points.
        got: usize,
    },
    /// The solver produced no valid ellipse (degenerate or non-elliptic input).
    Degenerate,
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewPoints { needed, got } => {
                write!(f, "too few points: need {}, got {}", needed, got)
            }
            Self::Degenerate => write!(f, "points do not determine an ellipse"),
        }
    }
}

impl std::error::Error for FitError {}

/// Geometric ellipse parameters in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    /// Center x.
    pub cx: f64,
    /// Center y.
    pub cy: f64,
    /// Semi-major axis length.
    pub a: f64,
    /// Semi-minor axis length.
    pub b: f64,
    /// Rotation angle of the major axis from +x, in radians (−π/2, π/2].
    pub angle: f64,
}

impl Ellipse {
    /// The all-zero ellipse, used as the "no estimate" value.
    pub const ZERO: Ellipse = Ellipse {
        cx: 0.0,
        cy: 0.0,
        a: 0.0,
        b: 0.0,
        angle: 0.0,
    };

    /// Axis-aligned circle constructor.
    pub fn circle(cx: f64, cy: f64, radius: f64) -> Self {
        Self {
            cx,
            cy,
            a: radius,
            b: radius,
            angle: 0.0,
        }
    }

    /// Basic validity: positive semi-axes, finite values.
    pub fn is_valid(&self) -> bool {
        self.a > 0.0
            && self.b > 0.0
            && self.a.is_finite()
            && self.b.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.angle.is_finite()
    }

    pub fn is_zero(&self) -> bool {
        self.a == 0.0 && self.b == 0.0
    }

    pub fn center(&self) -> [f32; 2] {
        [self.cx as f32, self.cy as f32]
    }

    /// Full major axis length (2a).
    pub fn major_axis(&self) -> f64 {
        2.0 * self.a
    }

    /// Full minor axis length (2b).
    pub fn minor_axis(&self) -> f64 {
        2.0 * self.b
    }

    /// Point on the perimeter at the given image-space ray angle.
    ///
    /// The angle is measured from +x in image coordinates; the ellipse's own
    /// rotation is compensated so that `theta = 0` always points along +x.
    pub fn point_at_angle(&self, theta: f64) -> [f32; 2] {
        let t = theta - self.angle;
        let (sin_r, cos_r) = self.angle.sin_cos();
        let px = self.a * t.cos();
        let py = self.b * t.sin();
        [
            (self.cx + cos_r * px - sin_r * py) as f32,
            (self.cy + sin_r * px + cos_r * py) as f32,
        ]
    }

    /// Whether a point lies inside or on the ellipse.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        if !self.is_valid() {
            return false;
        }
        let (sin_r, cos_r) = self.angle.sin_cos();
        let dx = x - self.cx;
        let dy = y - self.cy;
        let u = cos_r * dx + sin_r * dy;
        let v = -sin_r * dx + cos_r * dy;
        (u / self.a).powi(2) + (v / self.b).powi(2) <= 1.0
    }

    /// Axis-aligned bounding rectangle of the (rotated) ellipse.
    pub fn bounding_rect(&self) -> Rect {
        let (sin_r, cos_r) = self.angle.sin_cos();
        let half_w = ((self.a * cos_r).powi(2) + (self.b * sin_r).powi(2)).sqrt();
        let half_h = ((self.a * sin_r).powi(2) + (self.b * cos_r).powi(2)).sqrt();
        Rect::new(
            (self.cx - half_w).floor() as i32,
            (self.cy - half_h).floor() as i32,
            (2.0 * half_w).ceil() as i32,
            (2.0 * half_h).ceil() as i32,
        )
    }

    /// Copy with both semi-axes scaled by `factor`, same center and rotation.
    pub fn scaled(&self, factor: f64) -> Ellipse {
        Ellipse {
            a: self.a * factor,
            b: self.b * factor,
            ..*self
        }
    }

    /// Sample `n` points on the boundary (test/visualization helper).
    pub fn sample_points(&self, n: usize) -> Vec<[f64; 2]> {
        let (sin_r, cos_r) = self.angle.sin_cos();
        (0..n)
            .map(|i| {
                let t = 2.0 * std::f64::consts::PI * (i as f64) / (n as f64);
                let px = self.a * t.cos();
                let py = self.b * t.sin();
                [
                    self.cx + cos_r * px - sin_r * py,
                    self.cy + sin_r * px + cos_r * py,
                ]
            })
            .collect()
    }
}

// ── Direct least-squares fit ───────────────────────────────────────────────

/// Fit an ellipse to 2D points (direct least-squares, Fitzgibbon et al. 1999).
///
/// Solves a constrained eigenvalue problem enforcing the ellipse constraint
/// (B² − 4AC < 0). Requires at least 6 points; returns `None` when the input
/// is degenerate or the best conic is not an ellipse.
pub fn fit_ellipse(points: &[[f64; 2]]) -> Option<Ellipse> {
    let n = points.len();
    if n < 6 {
        return None;
    }

    // Normalize for numerical stability: shift to centroid, scale so the mean
    // distance from the centroid is √2.
    let (mean_x, mean_y, scale) = normalization_params(points);

    // Design matrix D = [x², xy, y², x, y, 1] over normalized coordinates.
    let mut d = DMatrix::<f64>::zeros(n, 6);
    for (i, &[px, py]) in points.iter().enumerate() {
        let x = (px - mean_x) * scale;
        let y = (py - mean_y) * scale;
        d[(i, 0)] = x * x;
        d[(i, 1)] = x * y;
        d[(i, 2)] = y * y;
        d[(i, 3)] = x;
        d[(i, 4)] = y;
        d[(i, 5)] = 1.0;
    }

    // Scatter matrix S = DᵀD partitioned into 3×3 blocks.
    let s = d.transpose() * &d;
    let s11 = s.fixed_view::<3, 3>(0, 0).into_owned();
    let s12 = s.fixed_view::<3, 3>(0, 3).into_owned();
    let s22 = s.fixed_view::<3, 3>(3, 3).into_owned();

    // Ellipse constraint matrix: 4AC − B² > 0.
    let c1 = Matrix3::new(0.0, 0.0, 2.0, 0.0, -1.0, 0.0, 2.0, 0.0, 0.0);

    let s22_inv = s22.try_inverse()?;
    let m = s11 - s12 * s22_inv * s12.transpose();

    // Reduced system C1⁻¹ M a1 = λ a1. C1⁻¹M is not symmetric, so the
    // eigensystem is solved explicitly via the characteristic cubic.
    let c1_inv = c1.try_inverse()?;
    let a1 = constrained_eigenvector(&(c1_inv * m))?;
    let a2 = -s22_inv * s12.transpose() * a1;

    let coeffs = denormalize_conic(
        &Vector6::new(a1[0], a1[1], a1[2], a2[0], a2[1], a2[2]),
        mean_x,
        mean_y,
        scale,
    );

    let e = conic_to_ellipse(&coeffs)?;
    e.is_valid().then_some(e)
}

/// Fit an ellipse, reporting the failure cause.
pub fn try_fit_ellipse(points: &[[f64; 2]]) -> Result<Ellipse, FitError> {
    if points.len() < 6 {
        return Err(FitError::TooFewPoints {
            needed: 6,
            got: points.len(),
        });
    }
    fit_ellipse(points).ok_or(FitError::Degenerate)
}

fn normalization_params(points: &[[f64; 2]]) -> (f64, f64, f64) {
    let n = points.len() as f64;
    let mean_x: f64 = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let mean_y: f64 = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist: f64 = points
        .iter()
        .map(|p| ((p[0] - mean_x).powi(2) + (p[1] - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    (mean_x, mean_y, scale)
}

/// Undo the normalization substitution x' = s(x − mx), y' = s(y − my).
fn denormalize_conic(c: &Vector6<f64>, mx: f64, my: f64, s: f64) -> [f64; 6] {
    let [a_, b_, c_, d_, e_, f_] = [c[0], c[1], c[2], c[3], c[4], c[5]];
    let s2 = s * s;
    let a = a_ * s2;
    let b = b_ * s2;
    let c = c_ * s2;
    let d = -2.0 * a_ * s2 * mx - b_ * s2 * my + d_ * s;
    let e = -b_ * s2 * mx - 2.0 * c_ * s2 * my + e_ * s;
    let f =
        a_ * s2 * mx * mx + b_ * s2 * mx * my + c_ * s2 * my * my - d_ * s * mx - e_ * s * my + f_;
    [a, b, c, d, e, f]
}

/// Eigenvector of the reduced 3×3 system satisfying the ellipse constraint.
///
/// Eigenvalues come from the characteristic cubic; eigenvectors from the
/// adjugate of the shifted matrix. Exactly one eigenpair should satisfy
/// aᵀC1a > 0 (i.e. 4·v₀v₂ − v₁² > 0) for valid input.
fn constrained_eigenvector(system: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let a = system;
    let tr = a[(0, 0)] + a[(1, 1)] + a[(2, 2)];
    let minor_sum = a[(0, 0)] * a[(1, 1)] - a[(0, 1)] * a[(1, 0)] + a[(0, 0)] * a[(2, 2)]
        - a[(0, 2)] * a[(2, 0)]
        + a[(1, 1)] * a[(2, 2)]
        - a[(1, 2)] * a[(2, 1)];
    let det = a.determinant();

    // λ³ − tr·λ² + minor_sum·λ − det = 0
    let eigenvalues = solve_cubic_real(1.0, -tr, minor_sum, -det);

    let mut best: Option<Vector3<f64>> = None;
    let mut best_ev = f64::MAX;
    for &ev in &eigenvalues {
        let shifted = system - Matrix3::identity() * ev;
        let Some(v) = null_vector(&shifted) else {
            continue;
        };
        let constraint = 4.0 * v[0] * v[2] - v[1] * v[1];
        if constraint > 0.0 && ev.abs() < best_ev {
            best_ev = ev.abs();
            best = Some(v);
        }
    }
    best
}

/// Null vector of a near-singular 3×3 matrix via its adjugate rows.
fn null_vector(m: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let rows = [
        Vector3::new(
            m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)],
            -(m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)]),
            m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)],
        ),
        Vector3::new(
            -(m[(0, 1)] * m[(2, 2)] - m[(0, 2)] * m[(2, 1)]),
            m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)],
            -(m[(0, 0)] * m[(2, 1)] - m[(0, 1)] * m[(2, 0)]),
        ),
        Vector3::new(
            m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
            -(m[(0, 0)] * m[(1, 2)] - m[(0, 2)] * m[(1, 0)]),
            m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
        ),
    ];

    let mut best = &rows[0];
    let mut best_norm = best.norm_squared();
    for r in &rows[1..] {
        let n = r.norm_squared();
        if n > best_norm {
            best = r;
            best_norm = n;
        }
    }
    if best_norm < 1e-30 {
        return None;
    }
    Some(best / best_norm.sqrt())
}

/// Real roots of a·x³ + b·x² + c·x + d = 0 (1 or 3 roots).
fn solve_cubic_real(a: f64, b: f64, c: f64, d: f64) -> Vec<f64> {
    let a_inv = 1.0 / a;
    let b_ = b * a_inv;
    let c_ = c * a_inv;
    let d_ = d * a_inv;

    // Depressed cubic t³ + pt + q = 0 with x = t − b/(3a).
    let p = c_ - b_ * b_ / 3.0;
    let q = 2.0 * b_ * b_ * b_ / 27.0 - b_ * c_ / 3.0 + d_;
    let disc = -4.0 * p * p * p - 27.0 * q * q;
    let shift = -b_ / 3.0;

    if disc >= 0.0 {
        let r = (-p / 3.0).sqrt();
        let cos_arg = if r.abs() < 1e-15 {
            0.0
        } else {
            (-q / (2.0 * r * r * r)).clamp(-1.0, 1.0)
        };
        let theta = cos_arg.acos();
        let two_r = 2.0 * r;
        vec![
            two_r * (theta / 3.0).cos() + shift,
            two_r * ((theta + 2.0 * std::f64::consts::PI) / 3.0).cos() + shift,
            two_r * ((theta + 4.0 * std::f64::consts::PI) / 3.0).cos() + shift,
        ]
    } else {
        let sqrt_disc = (q * q / 4.0 + p * p * p / 27.0).sqrt();
        let u = (-q / 2.0 + sqrt_disc).cbrt();
        let v = (-q / 2.0 - sqrt_disc).cbrt();
        vec![u + v + shift]
    }
}

/// Convert general conic coefficients [A, B, C, D, E, F] to geometric form.
fn conic_to_ellipse(coeffs: &[f64; 6]) -> Option<Ellipse> {
    let [a, b, c, d, e, f] = *coeffs;

    let disc = b * b - 4.0 * a * c;
    if disc >= 0.0 {
        return None;
    }

    // Center from the gradient zero of the quadratic form.
    let denom = 4.0 * a * c - b * b; // = −disc > 0
    let cx = (b * e - 2.0 * c * d) / denom;
    let cy = (b * d - 2.0 * a * e) / denom;

    let angle = if (a - c).abs() < 1e-15 {
        if b > 0.0 {
            std::f64::consts::FRAC_PI_4
        } else if b < 0.0 {
            -std::f64::consts::FRAC_PI_4
        } else {
            0.0
        }
    } else {
        0.5 * b.atan2(a - c)
    };

    // Semi-axes from the eigenvalues of the quadratic part.
    let sum = a + c;
    let diff = ((a - c).powi(2) + b * b).sqrt();
    let lambda1 = (sum + diff) / 2.0;
    let lambda2 = (sum - diff) / 2.0;

    let f_center = a * cx * cx + b * cx * cy + c * cy * cy + d * cx + e * cy + f;
    if f_center.abs() < 1e-15 {
        return None;
    }

    let a_sq = -f_center / lambda1;
    let b_sq = -f_center / lambda2;
    if a_sq <= 0.0 || b_sq <= 0.0 {
        return None;
    }

    let semi_a = a_sq.sqrt();
    let semi_b = b_sq.sqrt();
    let (semi_a, semi_b, angle) = if semi_a >= semi_b {
        (semi_a, semi_b, angle)
    } else {
        (semi_b, semi_a, angle + std::f64::consts::FRAC_PI_2)
    };

    Some(Ellipse {
        cx,
        cy,
        a: semi_a,
        b: semi_b,
        angle: normalize_angle(angle),
    })
}

/// Normalize angle to (−π/2, π/2].
fn normalize_angle(mut angle: f64) -> f64 {
    let pi = std::f64::consts::PI;
    while angle > pi / 2.0 {
        angle -= pi;
    }
    while angle <= -pi / 2.0 {
        angle += pi;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn make_test_ellipse() -> Ellipse {
        Ellipse {
            cx: 100.0,
            cy: 80.0,
            a: 30.0,
            b: 15.0,
            angle: 0.3,
        }
    }

    #[test]
    fn fit_exact_points() {
        let e = make_test_ellipse();
        let pts = e.sample_points(60);
        let fitted = fit_ellipse(&pts).expect("fit should succeed");
        assert_relative_eq!(fitted.cx, e.cx, epsilon = 1e-6);
        assert_relative_eq!(fitted.cy, e.cy, epsilon = 1e-6);
        assert_relative_eq!(fitted.a, e.a, epsilon = 1e-6);
        assert_relative_eq!(fitted.b, e.b, epsilon = 1e-6);
        assert_relative_eq!(fitted.angle, e.angle, epsilon = 1e-6);
    }

    #[test]
    fn fit_circle() {
        let e = Ellipse::circle(50.0, 50.0, 20.0);
        let pts = e.sample_points(100);
        let fitted = fit_ellipse(&pts).expect("circle fit should succeed");
        assert_relative_eq!(fitted.cx, 50.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.a, 20.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.b, 20.0, epsilon = 1e-6);
    }

    #[test]
    fn fit_rejects_degenerate_inputs() {
        assert!(fit_ellipse(&[]).is_none());
        assert!(fit_ellipse(&[[1.0, 2.0], [3.0, 4.0]]).is_none());
        let line: Vec<[f64; 2]> = (0..8).map(|i| [i as f64, 2.0 * i as f64]).collect();
        assert!(fit_ellipse(&line).is_none());
        let dup = vec![[5.0, 5.0]; 12];
        assert!(fit_ellipse(&dup).is_none());
    }

    #[test]
    fn try_fit_reports_too_few_points() {
        let err = try_fit_ellipse(&[[0.0, 0.0]; 4]).unwrap_err();
        assert_eq!(err, FitError::TooFewPoints { needed: 6, got: 4 });
    }

    #[test]
    fn point_at_angle_lies_on_boundary() {
        let e = make_test_ellipse();
        for k in 0..16 {
            let theta = 2.0 * std::f64::consts::PI * k as f64 / 16.0;
            let [x, y] = e.point_at_angle(theta);
            // The boundary point must be inside the slightly grown ellipse and
            // outside the slightly shrunk one.
            assert!(e.scaled(1.01).contains_point(x as f64, y as f64));
            assert!(!e.scaled(0.99).contains_point(x as f64, y as f64));
        }
    }

    #[test]
    fn contains_point_center_and_far() {
        let e = make_test_ellipse();
        assert!(e.contains_point(e.cx, e.cy));
        assert!(!e.contains_point(e.cx + 100.0, e.cy));
        assert!(!Ellipse::ZERO.contains_point(0.0, 0.0));
    }

    #[test]
    fn bounding_rect_covers_samples() {
        let e = make_test_ellipse();
        let bbox = e.bounding_rect();
        for &[x, y] in &e.sample_points(64) {
            assert!(
                bbox.contains_point(x as f32, y as f32),
                "({}, {}) outside {:?}",
                x,
                y,
                bbox
            );
        }
    }

    #[test]
    fn fit_partial_arc() {
        let e = make_test_ellipse();
        let arc: Vec<[f64; 2]> = e
            .sample_points(200)
            .into_iter()
            .filter(|&[x, y]| x > e.cx && y > e.cy)
            .collect();
        assert!(arc.len() >= 20);
        let fitted = fit_ellipse(&arc).expect("partial arc fit should succeed");
        assert_relative_eq!(fitted.cx, e.cx, epsilon = 5.0);
        assert_relative_eq!(fitted.cy, e.cy, epsilon = 5.0);
    }
}
