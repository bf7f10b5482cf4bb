//! Face detection.
//!
//! [`FaceDetector`] is the seam the rest of the pipeline depends on;
//! [`CascadeDetector`] implements it with a pretrained OpenCV Haar cascade
//! (`haarcascade_frontalface_default.xml` and friends).

use crate::cascade::CascadeDefinition;
use crate::cascade_file;
use crate::types::DetectionBox;
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DEFAULT_SCALE_FACTOR: f64 = 1.2;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("corrupt cascade {path}: {reason}")]
    CorruptCascade { path: String, reason: String },
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Locates face regions in a grayscale image.
///
/// Finding nothing is a normal outcome and yields an empty vector.
pub trait FaceDetector {
    fn detect(&self, image: &GrayImage) -> Vec<DetectionBox>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for &D {
    fn detect(&self, image: &GrayImage) -> Vec<DetectionBox> {
        (**self).detect(image)
    }
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&self, image: &GrayImage) -> Vec<DetectionBox> {
        (**self).detect(image)
    }
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Pyramid step between scales; must be greater than 1.
    pub scale_factor: f64,
    /// Hits a grouped rectangle needs beyond itself to be kept.
    pub min_neighbors: u32,
    /// Smallest face side in pixels; 0 means the cascade window size.
    pub min_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: 0,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be greater than 1.0, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Haar cascade face detector.
#[derive(Debug, Clone)]
pub struct CascadeDetector {
    cascade: CascadeDefinition,
    params: DetectorParams,
}

impl CascadeDetector {
    /// Load an OpenCV HAAR cascade file.
    pub fn load(path: impl AsRef<Path>, params: DetectorParams) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(DetectorError::CascadeNotFound(shown));
        }
        let corrupt = |reason: String| DetectorError::CorruptCascade {
            path: shown.clone(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| corrupt(e.to_string()))?;
        let cascade = cascade_file::parse(&text).map_err(corrupt)?;
        params.validate()?;

        tracing::info!(
            path = %shown,
            window = ?(cascade.window.width, cascade.window.height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded face cascade"
        );

        Ok(Self { cascade, params })
    }

    /// Build a detector from an in-memory definition.
    pub fn from_definition(cascade: CascadeDefinition, params: DetectorParams) -> Result<Self, DetectorError> {
        cascade.validate().map_err(|reason| DetectorError::CorruptCascade {
            path: "<memory>".into(),
            reason,
        })?;
        params.validate()?;
        Ok(Self { cascade, params })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    pub fn cascade(&self) -> &CascadeDefinition {
        &self.cascade
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, image: &GrayImage) -> Vec<DetectionBox> {
        let boxes = self.cascade.detect_multi_scale(image, &self.params);
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            faces = boxes.len(),
            "cascade detection finished"
        );
        boxes
    }
}
