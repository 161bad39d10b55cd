//! Per-frame tracking orchestration.
//!
//! [`EyeTracker`] owns everything that persists across frames — crop/ROI
//! rectangles, thresholds, the boundary search state, the coherence history
//! and the failure counter — and sequences the per-frame stages: clone and
//! preprocess, define the ROI via the boundary search, threshold, cluster,
//! evaluate pupil candidates, then trace the eyelid search area and pick
//! glints. Sustained failures trigger a cold restart: the boundary search
//! rediscovers from scratch and the last seed is forgotten.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::avg::{ByteRunningMean, RunningMean};
use crate::burst::{BurstFit, BurstOutcome, BurstSearch};
use crate::cluster::{fill_holes, Clusterer, ContourClusterer};
use crate::config::TrackConfig;
use crate::conic::Ellipse;
use crate::eyelid::find_search_ellipse;
use crate::geometry::Rect;
use crate::glint::{find_glints, GlintSet};
use crate::preprocess::{equalize_region, inverse_threshold_into, smooth_region};
use crate::pupil::{ClusterVerdict, CoherenceHistory, PupilEstimate, PupilEvaluator};

/// Tracker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    /// No recent lock; next success starts a fresh track.
    Idle,
    /// The previous frame produced a pupil.
    Stable,
    /// Recent frames failed but the failure limit has not been reached.
    Degraded,
}

/// Everything one `track` call exposes to callers and visualizers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResult {
    /// Whether this frame produced a pupil estimate.
    pub success: bool,
    /// Accepted pupil with its source cluster, if any.
    pub pupil: Option<PupilEstimate>,
    /// Accepted glint centers, ordered by ascending x.
    pub glints: GlintSet,
    /// Eyelid search ellipse the glints were gated by.
    pub search_ellipse: Option<Ellipse>,
    /// Crop rectangle after clamping against the frame.
    pub crop: Rect,
    /// ROI used for thresholding and clustering.
    pub roi: Rect,
    /// One verdict per cluster the segmentation produced.
    pub verdicts: Vec<ClusterVerdict>,
    /// Boundary search fit (discovered threshold, inlier/outlier sets).
    pub boundary: Option<BurstFit>,
}

/// Per-camera pupil and glint tracker.
pub struct EyeTracker {
    config: TrackConfig,
    clusterer: Box<dyn Clusterer>,
    frame: GrayImage,
    binary: GrayImage,
    crop: Rect,
    roi: Rect,
    burst: BurstSearch,
    evaluator: PupilEvaluator,
    history: CoherenceHistory,
    spread_avg: RunningMean,
    threshold_avg: ByteRunningMean,
    failed_frames: u32,
    last_seed: Option<[f32; 2]>,
    last_pupil: Option<Ellipse>,
    state: TrackerState,
}

impl EyeTracker {
    /// Build a tracker with the default contour clusterer.
    pub fn new(config: TrackConfig) -> Self {
        Self::with_clusterer(config, Box::new(ContourClusterer))
    }

    /// Build a tracker with a caller-supplied segmentation backend.
    pub fn with_clusterer(config: TrackConfig, clusterer: Box<dyn Clusterer>) -> Self {
        let crop = config.crop;
        Self {
            history: CoherenceHistory::new(config.pupil.coherence_frames),
            spread_avg: RunningMean::new(config.spread_window),
            threshold_avg: ByteRunningMean::new(config.threshold_window),
            clusterer,
            frame: GrayImage::new(1, 1),
            binary: GrayImage::new(1, 1),
            crop,
            roi: crop,
            burst: BurstSearch::new(),
            evaluator: PupilEvaluator::new(),
            failed_frames: 0,
            last_seed: None,
            last_pupil: None,
            state: TrackerState::Idle,
            config,
        }
    }

    /// Replace the configuration snapshot.
    ///
    /// Window-capacity changes reset the corresponding running state, same
    /// as a fresh init.
    pub fn reconfigure(&mut self, config: TrackConfig) {
        if config.pupil.coherence_frames != self.history.capacity() {
            self.history = CoherenceHistory::new(config.pupil.coherence_frames);
        }
        if config.spread_window != self.spread_avg.capacity() {
            self.spread_avg.reset(config.spread_window);
        }
        if config.threshold_window != self.config.threshold_window {
            self.threshold_avg.reset(config.threshold_window);
        }
        self.config = config;
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn crop(&self) -> Rect {
        self.crop
    }

    pub fn roi(&self) -> Rect {
        self.roi
    }

    /// Discovered boundary-search edge threshold.
    pub fn boundary_threshold(&self) -> i16 {
        self.burst.edge_threshold()
    }

    /// Process one grayscale frame.
    ///
    /// `seed_hint` biases the boundary search toward a known pupil position
    /// (e.g. from a paired camera); otherwise the previous frame's seed is
    /// used when available.
    pub fn track(&mut self, gray: &GrayImage, seed_hint: Option<[f32; 2]>) -> TrackResult {
        let frame_rect = Rect::from_dims(gray.width(), gray.height());
        self.frame = gray.clone();
        self.crop = self.config.crop.clamp_into(&frame_rect);
        if self.last_seed.is_none() {
            self.roi = self.crop;
        }

        smooth_region(&mut self.frame, self.crop, self.config.blur_sigma);
        if self.config.equalize {
            equalize_region(&mut self.frame, self.crop);
        }

        // ── ROI definition ────────────────────────────────────────────────
        let search_region = if self.last_seed.is_some() {
            self.roi.clamp_into(&self.crop)
        } else {
            self.crop
        };
        let hint = seed_hint.or(self.last_seed);
        let fit = match self
            .burst
            .process(&self.frame, search_region, hint, &self.config.burst)
        {
            BurstOutcome::Success(fit) => fit,
            _ => {
                tracing::debug!("boundary search failed; frame dropped");
                return self.fail_frame(Vec::new(), None);
            }
        };

        let mean_spread = self.spread_avg.mean();
        if !self.spread_avg.is_empty()
            && mean_spread > 0.0
            && fit.spread > self.config.max_spread_spike * mean_spread
        {
            tracing::warn!(
                spread = fit.spread,
                mean_spread,
                "boundary spread spike; frame dropped"
            );
            return self.fail_frame(Vec::new(), Some(fit));
        }
        self.spread_avg.push(fit.spread);

        let roi_size = match &self.last_pupil {
            Some(e) => ((e.major_axis() as f32) * self.config.roi_size_mult).round() as i32,
            None => self.config.default_roi_size,
        };
        self.roi = Rect::centered(fit.center[0], fit.center[1], roi_size, roi_size)
            .clamp_into(&self.crop);

        // ── Threshold, cluster, evaluate ──────────────────────────────────
        let threshold = if self.config.auto_pupil_threshold {
            self.threshold_avg.push(fit.brightness);
            self.threshold_avg.mean()
        } else {
            self.config.pupil_threshold
        };
        inverse_threshold_into(&self.frame, &mut self.binary, self.roi, threshold);

        let clusters = self.clusterer.clusterise(&self.binary, self.roi);
        fill_holes(&mut self.binary, &clusters);

        let eval = self.evaluator.evaluate(
            &self.frame,
            frame_rect,
            self.roi,
            &clusters,
            &self.history,
            self.burst.edge_threshold(),
            &self.config.pupil,
            &self.config.burst,
        );

        let Some(pupil) = eval.best else {
            return self.fail_frame(eval.verdicts, Some(fit));
        };

        // ── Success path ──────────────────────────────────────────────────
        self.history.push(pupil.ellipse.major_axis() as f32);
        self.failed_frames = 0;
        self.state = TrackerState::Stable;
        self.last_seed = Some(pupil.ellipse.center());
        self.last_pupil = Some(pupil.ellipse);

        let search_ellipse = find_search_ellipse(
            &self.frame,
            &pupil.ellipse,
            self.crop,
            &self.config.eyelid,
            &self.config.burst,
        );
        let glints = find_glints(
            &self.frame,
            &search_ellipse,
            self.roi,
            self.clusterer.as_ref(),
            &self.config.glint,
        );

        tracing::info!(
            cx = pupil.ellipse.cx,
            cy = pupil.ellipse.cy,
            major = pupil.ellipse.major_axis(),
            n_glints = glints.centers.len(),
            "frame tracked"
        );

        TrackResult {
            success: true,
            pupil: Some(pupil),
            glints,
            search_ellipse: Some(search_ellipse),
            crop: self.crop,
            roi: self.roi,
            verdicts: eval.verdicts,
            boundary: Some(fit),
        }
    }

    /// Failure path: clear outputs, advance the failure counter, and force a
    /// cold restart once the configured limit is exceeded.
    fn fail_frame(&mut self, verdicts: Vec<ClusterVerdict>, boundary: Option<BurstFit>) -> TrackResult {
        self.history.pop_oldest();
        self.failed_frames += 1;
        self.state = TrackerState::Degraded;
        if self.failed_frames > self.config.max_failed_frames {
            tracing::warn!(
                limit = self.config.max_failed_frames,
                "sustained tracking failure; restarting cold"
            );
            self.burst.force_rediscovery();
            self.failed_frames = 0;
            self.last_seed = None;
            self.last_pupil = None;
            self.state = TrackerState::Idle;
        }
        TrackResult {
            success: false,
            pupil: None,
            glints: GlintSet::default(),
            search_ellipse: None,
            crop: self.crop,
            roi: self.roi,
            verdicts,
            boundary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::draw_eye_image;

    fn test_config() -> TrackConfig {
        TrackConfig {
            // Synthetic frames are already high-contrast; equalization would
            // saturate their near-binary histograms.
            equalize: false,
            ..Default::default()
        }
    }

    #[test]
    fn tracks_pupil_and_glints_on_synthetic_eye() {
        let img = draw_eye_image(
            320,
            240,
            [160.0, 120.0],
            14.0,
            &[[150.0, 112.0], [172.0, 115.0]],
        );
        let mut tracker = EyeTracker::new(test_config());
        let result = tracker.track(&img, Some([158.0, 122.0]));

        assert!(result.success, "verdicts: {:?}", result.verdicts);
        let pupil = result.pupil.expect("pupil estimate");
        assert!(
            (pupil.ellipse.cx - 160.0).abs() <= 2.0 && (pupil.ellipse.cy - 120.0).abs() <= 2.0,
            "pupil center ({}, {})",
            pupil.ellipse.cx,
            pupil.ellipse.cy
        );
        assert_eq!(tracker.state(), TrackerState::Stable);
        assert!(
            result.crop.contains_rect(&result.roi),
            "ROI {:?} must stay inside crop {:?}",
            result.roi,
            result.crop
        );
        assert_eq!(result.glints.centers.len(), 2, "glints: {:?}", result.glints);
        assert!(result.glints.centers[0][0] < result.glints.centers[1][0]);
        assert!(result.boundary.is_some());
    }

    #[test]
    fn second_frame_reuses_seed_without_hint() {
        let img = draw_eye_image(320, 240, [160.0, 120.0], 14.0, &[]);
        let mut tracker = EyeTracker::new(test_config());
        assert!(tracker.track(&img, Some([158.0, 122.0])).success);

        // Slightly moved pupil, no hint: the previous seed must carry over.
        let img2 = draw_eye_image(320, 240, [163.0, 118.0], 14.0, &[]);
        let result = tracker.track(&img2, None);
        assert!(result.success);
        let pupil = result.pupil.unwrap();
        assert!((pupil.ellipse.cx - 163.0).abs() <= 2.0);
    }

    #[test]
    fn failures_accumulate_then_trigger_cold_restart() {
        let blank = draw_eye_image(160, 120, [80.0, 60.0], 0.0, &[]);
        let mut tracker = EyeTracker::new(TrackConfig {
            max_failed_frames: 2,
            ..test_config()
        });

        for _ in 0..2 {
            let r = tracker.track(&blank, None);
            assert!(!r.success);
            assert_eq!(tracker.state(), TrackerState::Degraded);
        }
        // Third failure exceeds the limit and resets.
        let r = tracker.track(&blank, None);
        assert!(!r.success);
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[test]
    fn recovers_after_reset() {
        let blank = draw_eye_image(320, 240, [0.0, 0.0], 0.0, &[]);
        let eye = draw_eye_image(320, 240, [160.0, 120.0], 14.0, &[]);
        let mut tracker = EyeTracker::new(TrackConfig {
            max_failed_frames: 1,
            ..test_config()
        });
        for _ in 0..3 {
            tracker.track(&blank, None);
        }
        let result = tracker.track(&eye, Some([158.0, 120.0]));
        assert!(result.success, "tracker should reacquire after a cold restart");
        assert_eq!(tracker.state(), TrackerState::Stable);
    }

    #[test]
    fn coherence_history_follows_success_and_failure() {
        let eye = draw_eye_image(320, 240, [160.0, 120.0], 14.0, &[]);
        let blank = draw_eye_image(320, 240, [0.0, 0.0], 0.0, &[]);
        let mut tracker = EyeTracker::new(test_config());

        assert!(tracker.track(&eye, Some([158.0, 122.0])).success);
        assert_eq!(tracker.history.len(), 1);
        tracker.track(&blank, None);
        assert_eq!(tracker.history.len(), 0, "failed frame pops the history");
    }

    #[test]
    fn reconfigure_resets_resized_windows() {
        let mut tracker = EyeTracker::new(test_config());
        let mut cfg = test_config();
        cfg.pupil.coherence_frames = 9;
        cfg.spread_window = 3;
        tracker.reconfigure(cfg);
        assert_eq!(tracker.history.capacity(), 9);
        assert_eq!(tracker.spread_avg.capacity(), 3);
        assert_eq!(tracker.config().spread_window, 3);
    }
}
