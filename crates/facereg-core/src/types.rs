use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Integer identity label, as encoded in corpus filenames.
pub type IdentityId = i32;

/// Axis-aligned rectangle of a detected face, in source-image pixels.
///
/// Boxes handed out by a detector always have non-zero size and lie
/// entirely inside the image they were detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DetectionBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Build a box from signed coordinates, clipped to a `img_width` × `img_height` image.
    ///
    /// Returns `None` when nothing of the rectangle remains inside the image.
    pub fn clipped(x: i64, y: i64, width: i64, height: i64, img_width: u32, img_height: u32) -> Option<Self> {
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = (x + width).min(img_width as i64);
        let y1 = (y + height).min(img_height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Whether the pixel `(px, py)` falls inside the box.
    pub fn contains(&self, px: u32, py: u32) -> bool {
        let (px, py) = (px as u64, py as u64);
        let (x, y) = (self.x as u64, self.y as u64);
        px >= x && px < x + self.width as u64 && py >= y && py < y + self.height as u64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Copy the boxed region out of `image`.
    ///
    /// The box is clipped to the image first, so a box from a different
    /// (larger) frame never panics; it just yields a smaller crop.
    pub fn crop(&self, image: &GrayImage) -> GrayImage {
        let (w, h) = image.dimensions();
        let x = self.x.min(w);
        let y = self.y.min(h);
        let width = self.width.min(w - x);
        let height = self.height.min(h - y);
        image::imageops::crop_imm(image, x, y, width, height).to_image()
    }
}

/// A grayscale face crop paired with the identity it belongs to.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub region: GrayImage,
    pub label: IdentityId,
}

/// Output of a model prediction: nearest label and its distance (lower = closer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: IdentityId,
    pub distance: f64,
}

/// Outcome of recognizing a single image.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    NotRecognized {
        reason: String,
    },
    Recognized {
        identity_id: IdentityId,
        name: String,
        /// Model distance of the accepted match.
        distance: f64,
    },
}

impl RecognitionResult {
    /// Reason reported for every non-match.
    pub const UNKNOWN: &'static str = "unknown";

    pub fn unknown() -> Self {
        Self::NotRecognized {
            reason: Self::UNKNOWN.to_string(),
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, Self::Recognized { .. })
    }

    /// Identity of the match, if any.
    pub fn identity_id(&self) -> Option<IdentityId> {
        match self {
            Self::Recognized { identity_id, .. } => Some(*identity_id),
            Self::NotRecognized { .. } => None,
        }
    }

    /// Wire representation printed by the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::NotRecognized { reason } => serde_json::json!({
                "recognized": false,
                "message": reason,
            }),
            Self::Recognized {
                identity_id,
                name,
                distance,
            } => serde_json::json!({
                "recognized": true,
                "userId": identity_id,
                "userName": name,
                "distance": distance,
            }),
        }
    }
}
