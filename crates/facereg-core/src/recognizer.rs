//! Single-image recognition: detect, crop, predict, threshold.

use crate::detector::FaceDetector;
use crate::identity::IdentityRegistry;
use crate::lbph::LbphModel;
use crate::types::{Prediction, RecognitionResult};
use image::{DynamicImage, GrayImage};
use std::path::Path;

/// Largest LBPH distance still accepted as a match (exclusive).
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 100.0;

/// Turn a prediction into a result: accepted only when `distance < threshold`.
pub fn classify(prediction: Prediction, threshold: f64, registry: &IdentityRegistry) -> RecognitionResult {
    if prediction.distance < threshold {
        RecognitionResult::Recognized {
            identity_id: prediction.label,
            name: registry.display_name(prediction.label),
            distance: prediction.distance,
        }
    } else {
        tracing::debug!(
            label = prediction.label,
            distance = prediction.distance,
            threshold,
            "prediction above threshold"
        );
        RecognitionResult::unknown()
    }
}

/// Recognize the first face found in a grayscale frame.
///
/// Only the first detection is used; frames are assumed to hold one face.
pub fn recognize_gray<D: FaceDetector + ?Sized>(
    gray: &GrayImage,
    detector: &D,
    model: &LbphModel,
    registry: &IdentityRegistry,
    threshold: f64,
) -> RecognitionResult {
    let faces = detector.detect(gray);
    let Some(face) = faces.first() else {
        tracing::debug!("no face detected");
        return RecognitionResult::unknown();
    };

    let region = face.crop(gray);
    match model.predict(&region) {
        Ok(prediction) => classify(prediction, threshold, registry),
        Err(e) => {
            tracing::warn!(error = %e, face = ?face, "prediction failed");
            RecognitionResult::unknown()
        }
    }
}

/// Owns a detector, model and registry and answers recognition requests.
pub struct RecognitionService<D> {
    detector: D,
    model: LbphModel,
    registry: IdentityRegistry,
    threshold: f64,
}

impl<D: FaceDetector> RecognitionService<D> {
    pub fn new(detector: D, model: LbphModel, registry: IdentityRegistry) -> Self {
        Self {
            detector,
            model,
            registry,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Recognize an image file. Unreadable files are reported as not recognized.
    pub fn recognize_path(&self, path: impl AsRef<Path>) -> RecognitionResult {
        let path = path.as_ref();
        match image::open(path) {
            Ok(img) => self.recognize_image(&img),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to decode image");
                RecognitionResult::unknown()
            }
        }
    }

    /// Recognize an encoded image held in memory.
    pub fn recognize_bytes(&self, bytes: &[u8]) -> RecognitionResult {
        match image::load_from_memory(bytes) {
            Ok(img) => self.recognize_image(&img),
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "failed to decode image");
                RecognitionResult::unknown()
            }
        }
    }

    pub fn recognize_image(&self, image: &DynamicImage) -> RecognitionResult {
        self.recognize_gray(&image.to_luma8())
    }

    pub fn recognize_gray(&self, gray: &GrayImage) -> RecognitionResult {
        recognize_gray(gray, &self.detector, &self.model, &self.registry, self.threshold)
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn model(&self) -> &LbphModel {
        &self.model
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}
