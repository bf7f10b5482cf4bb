//! Training-sample extraction from a corpus directory.

use crate::corpus::{self, ExtensionFilter};
use crate::detector::FaceDetector;
use crate::identity::{self, IdentityError, IdentityRegistry};
use crate::types::FaceSample;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("failed to list corpus {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    MalformedFilename(#[from] IdentityError),
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// What to do with a corpus image that contains more than one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiFacePolicy {
    /// Drop the image with a warning.
    #[default]
    Skip,
    /// Keep every detected face under the image's label.
    KeepAll,
}

impl FromStr for MultiFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "keep" | "keep-all" | "keep_all" => Ok(Self::KeepAll),
            other => Err(format!("unknown multi-face policy {other:?} (expected \"skip\" or \"keep\")")),
        }
    }
}

/// Counters for one corpus pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub images: usize,
    pub samples: usize,
    pub no_face: usize,
    pub multi_face_skipped: usize,
    pub multi_face_kept: usize,
}

/// Labeled samples plus the registry derived from the same corpus.
#[derive(Debug, Clone)]
pub struct SampleSet {
    pub samples: Vec<FaceSample>,
    pub registry: IdentityRegistry,
    pub report: BuildReport,
}

impl SampleSet {
    /// Number of distinct labels among the samples.
    pub fn distinct_labels(&self) -> usize {
        self.samples.iter().map(|s| s.label).collect::<BTreeSet<_>>().len()
    }
}

/// Walks a corpus and turns each detected face into a labeled sample.
pub struct SampleBuilder<'a> {
    detector: &'a dyn FaceDetector,
    filter: ExtensionFilter,
    policy: MultiFacePolicy,
}

impl<'a> SampleBuilder<'a> {
    pub fn new(detector: &'a dyn FaceDetector) -> Self {
        Self {
            detector,
            filter: ExtensionFilter::default(),
            policy: MultiFacePolicy::default(),
        }
    }

    pub fn with_filter(mut self, filter: ExtensionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_policy(mut self, policy: MultiFacePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build samples and the identity registry from `dir`.
    ///
    /// A malformed filename or an undecodable image aborts the build.
    pub fn build(&self, dir: &Path) -> Result<SampleSet, SampleError> {
        let paths = corpus::list_images(dir, &self.filter).map_err(|source| SampleError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let registry = IdentityRegistry::from_file_names(
            paths
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str())),
        );

        let mut samples = Vec::new();
        let mut report = BuildReport::default();

        for path in &paths {
            report.images += 1;
            self.extract(path, &mut samples, &mut report)?;
        }
        report.samples = samples.len();

        tracing::info!(
            dir = %dir.display(),
            images = report.images,
            samples = report.samples,
            no_face = report.no_face,
            multi_face_skipped = report.multi_face_skipped,
            multi_face_kept = report.multi_face_kept,
            identities = registry.len(),
            "corpus scan complete"
        );

        Ok(SampleSet {
            samples,
            registry,
            report,
        })
    }

    fn extract(
        &self,
        path: &Path,
        samples: &mut Vec<FaceSample>,
        report: &mut BuildReport,
    ) -> Result<(), SampleError> {
        let label = identity::parse_path(path)?.id;
        let gray = image::open(path)
            .map_err(|source| SampleError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .to_luma8();

        let faces = self.detector.detect(&gray);
        let file = path.display();

        match faces.len() {
            0 => {
                tracing::info!(path = %file, "no face detected, skipping");
                report.no_face += 1;
            }
            1 => {
                tracing::debug!(path = %file, label, face = ?faces[0], "face detected");
                samples.push(FaceSample {
                    region: faces[0].crop(&gray),
                    label,
                });
            }
            n => match self.policy {
                MultiFacePolicy::Skip => {
                    tracing::warn!(path = %file, faces = n, "multiple faces detected, skipping image");
                    report.multi_face_skipped += 1;
                }
                MultiFacePolicy::KeepAll => {
                    tracing::warn!(path = %file, faces = n, label, "multiple faces detected, keeping all under one label");
                    report.multi_face_kept += 1;
                    samples.extend(faces.iter().map(|face| FaceSample {
                        region: face.crop(&gray),
                        label,
                    }));
                }
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{textured_face, write_png, MockDetector};
    use crate::types::DetectionBox;

    #[test]
    fn test_policy_from_str() {
        assert_eq!("skip".parse::<MultiFacePolicy>().unwrap(), MultiFacePolicy::Skip);
        assert_eq!("KEEP".parse::<MultiFacePolicy>().unwrap(), MultiFacePolicy::KeepAll);
        assert_eq!("keep-all".parse::<MultiFacePolicy>().unwrap(), MultiFacePolicy::KeepAll);
        assert!("maybe".parse::<MultiFacePolicy>().is_err());
    }

    #[test]
    fn test_build_labels_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "zhangsan.101.1.png", &textured_face(1, 48));
        write_png(dir.path(), "zhangsan.101.2.png", &textured_face(2, 48));
        write_png(dir.path(), "lisi.102.1.png", &textured_face(3, 48));

        let detector = MockDetector::centered();
        let set = SampleBuilder::new(&detector).build(dir.path()).unwrap();

        let labels: Vec<i32> = set.samples.iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![102, 101, 101]);
        assert_eq!(set.distinct_labels(), 2);
        assert_eq!(set.registry.get(101), Some("zhangsan"));
        assert_eq!(set.registry.get(102), Some("lisi"));
        assert_eq!(set.report.images, 3);
        assert_eq!(set.report.samples, 3);
        assert_eq!(set.samples[0].region.dimensions(), (32, 32));
    }

    #[test]
    fn test_blank_images_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.1.1.png", &textured_face(1, 48));
        write_png(dir.path(), "a.1.2.png", &image::GrayImage::from_pixel(48, 48, image::Luma([255])));

        let detector = MockDetector::centered();
        let set = SampleBuilder::new(&detector).build(dir.path()).unwrap();
        assert_eq!(set.samples.len(), 1);
        assert_eq!(set.report.no_face, 1);
    }

    #[test]
    fn test_malformed_filename_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.1.1.png", &textured_face(1, 48));
        write_png(dir.path(), "noise.png", &textured_face(2, 48));

        let detector = MockDetector::centered();
        let err = SampleBuilder::new(&detector).build(dir.path()).unwrap_err();
        assert!(
            matches!(&err, SampleError::MalformedFilename(IdentityError::MalformedFilename(n)) if n == "noise.png"),
            "got {err:?}"
        );
    }

    #[test]
    fn test_filter_excludes_files_from_both_stages() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.1.1.png", &textured_face(1, 48));
        // Not an image and badly named, but filtered out before either stage sees it.
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let detector = MockDetector::centered();
        let set = SampleBuilder::new(&detector).build(dir.path()).unwrap();
        assert_eq!(set.report.images, 1);
        assert_eq!(set.registry.len(), 1);
    }

    #[test]
    fn test_undecodable_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.1.1.png"), b"definitely not a png").unwrap();

        let detector = MockDetector::centered();
        let err = SampleBuilder::new(&detector).build(dir.path()).unwrap_err();
        assert!(matches!(err, SampleError::Decode { .. }));
    }

    #[test]
    fn test_missing_corpus_dir() {
        let detector = MockDetector::centered();
        let err = SampleBuilder::new(&detector)
            .build(Path::new("/nonexistent/corpus"))
            .unwrap_err();
        assert!(matches!(err, SampleError::Io { .. }));
    }

    #[test]
    fn test_multi_face_policies() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.1.1.png", &textured_face(1, 48));

        let detector = MockDetector::fixed(vec![
            DetectionBox::new(0, 0, 20, 20),
            DetectionBox::new(24, 24, 20, 20),
        ]);

        let skipped = SampleBuilder::new(&detector).build(dir.path()).unwrap();
        assert!(skipped.samples.is_empty());
        assert_eq!(skipped.report.multi_face_skipped, 1);

        let kept = SampleBuilder::new(&detector)
            .with_policy(MultiFacePolicy::KeepAll)
            .build(dir.path())
            .unwrap();
        assert_eq!(kept.samples.len(), 2);
        assert!(kept.samples.iter().all(|s| s.label == 1));
        assert_eq!(kept.report.multi_face_kept, 1);
    }

    #[test]
    fn test_color_images_are_converted_to_gray() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = image::RgbImage::from_fn(48, 48, |x, y| image::Rgb([(x * 5) as u8, (y * 5) as u8, 128]));
        rgb.save(dir.path().join("c.3.1.png")).unwrap();

        let detector = MockDetector::centered();
        let set = SampleBuilder::new(&detector).build(dir.path()).unwrap();
        assert_eq!(set.samples.len(), 1);
        let expected = image::DynamicImage::ImageRgb8(rgb).to_luma8();
        assert_eq!(set.samples[0].region.get_pixel(0, 0), expected.get_pixel(8, 8));
    }
}
