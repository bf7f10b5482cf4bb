//! Face enrollment and recognition engine.
//!
//! Faces are located with a Haar cascade and identified with a Local
//! Binary Patterns Histogram (LBPH) classifier. Identity names come from
//! corpus filenames of the form `<name>.<id>.<sequence>.<ext>`.

pub mod cascade;
pub mod cascade_file;
pub mod corpus;
pub mod detector;
pub mod identity;
pub mod lbph;
pub mod recognizer;
pub mod samples;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use corpus::ExtensionFilter;
pub use detector::{CascadeDetector, DetectorParams, FaceDetector};
pub use identity::IdentityRegistry;
pub use lbph::{LbphModel, LbphParams};
pub use recognizer::RecognitionService;
pub use samples::{MultiFacePolicy, SampleBuilder};
pub use types::{DetectionBox, FaceSample, Prediction, RecognitionResult};
