//! gazeburst — adaptive pupil and corneal-reflection tracker.
//!
//! Estimates the pupil ellipse and glint centers of an eye frame by frame
//! from grayscale video. The per-frame stages are:
//!
//! 1. **Preprocess** – crop smoothing + histogram equalization.
//! 2. **Burst** – adaptive boundary ray search that seeds the ROI and
//!    discovers the edge and brightness thresholds.
//! 3. **Cluster** – inverse thresholding + connected-contour segmentation
//!    with hole filling (pluggable backend).
//! 4. **Pupil** – double ellipse fit over ray-sampled edge points with
//!    temporal-coherence scoring.
//! 5. **Eyelid** – search-ellipse trace bounding the glint area.
//! 6. **Glint** – template-scored candidates, greedy selection, flood-fill
//!    center refinement.
//!
//! # Public API
//! [`EyeTracker`] with [`TrackConfig`] is the primary entry point; one
//! tracker instance owns all cross-frame state for one camera and is not
//! synchronized internally. The algorithmic modules are exported for
//! callers that assemble their own pipeline.

pub mod avg;
pub mod burst;
pub mod cluster;
pub mod config;
pub mod conic;
pub mod eyelid;
pub mod geometry;
pub mod glint;
pub mod preprocess;
pub mod pupil;
pub mod template;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use burst::{BurstConfig, BurstFit, BurstOutcome, BurstSearch};
pub use cluster::{Cluster, Clusterer, Clusters, ContourClusterer};
pub use config::TrackConfig;
pub use conic::{fit_ellipse, Ellipse, FitError};
pub use eyelid::EyelidConfig;
pub use geometry::Rect;
pub use glint::{GlintConfig, GlintSet};
pub use pupil::{ClusterVerdict, CoherenceHistory, PupilConfig, PupilEstimate};
pub use template::DiskTemplate;
pub use tracker::{EyeTracker, TrackResult, TrackerState};
