//! Top-level tracker configuration.
//!
//! All tunables live in one value struct the tracker stores by snapshot;
//! there is no process-global configuration. Callers update it through
//! [`crate::tracker::EyeTracker::reconfigure`] under their own
//! synchronization.

use serde::{Deserialize, Serialize};

use crate::burst::BurstConfig;
use crate::eyelid::EyelidConfig;
use crate::geometry::Rect;
use crate::glint::GlintConfig;
use crate::pupil::PupilConfig;

/// Complete tracker configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Crop rectangle; clamped against the frame bounds every frame.
    pub crop: Rect,
    /// Gaussian sigma for crop smoothing (0 disables smoothing).
    pub blur_sigma: f32,
    /// Histogram-equalize the crop after smoothing.
    pub equalize: bool,
    /// Derive the pupil threshold from the boundary search's brightness,
    /// smoothed by a running mean.
    pub auto_pupil_threshold: bool,
    /// Fixed pupil threshold used when `auto_pupil_threshold` is off.
    pub pupil_threshold: u8,
    /// Capacity of the pupil-threshold running mean.
    pub threshold_window: usize,
    /// ROI side length before a pupil has been accepted, pixels.
    pub default_roi_size: i32,
    /// ROI side length as a multiple of the previous pupil major axis.
    pub roi_size_mult: f32,
    /// Capacity of the boundary-spread running mean.
    pub spread_window: usize,
    /// Reject a frame whose boundary spread exceeds this multiple of the
    /// running mean.
    pub max_spread_spike: f32,
    /// Consecutive failed frames tolerated before a cold restart.
    pub max_failed_frames: u32,
    /// Boundary ray search tunables.
    pub burst: BurstConfig,
    /// Pupil candidate evaluation tunables.
    pub pupil: PupilConfig,
    /// Eyelid search-ellipse tunables.
    pub eyelid: EyelidConfig,
    /// Glint detection tunables.
    pub glint: GlintConfig,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            crop: Rect::new(0, 0, 4096, 4096),
            blur_sigma: 1.0,
            equalize: true,
            auto_pupil_threshold: true,
            pupil_threshold: 60,
            threshold_window: 10,
            default_roi_size: 120,
            roi_size_mult: 3.0,
            spread_window: 10,
            max_spread_spike: 3.0,
            max_failed_frames: 10,
            burst: BurstConfig::default(),
            pupil: PupilConfig::default(),
            eyelid: EyelidConfig::default(),
            glint: GlintConfig::default(),
        }
    }
}
