//! Fixtures shared by the unit tests.

use crate::cascade::{CascadeDefinition, HaarFeature, Stage, WeakClassifier, WeightedRect, WindowSize};
use crate::detector::FaceDetector;
use crate::types::DetectionBox;
use image::{GrayImage, Luma};
use std::path::Path;

/// One-stage cascade that fires when the centre of a 20×20 window is
/// brighter than its surround.
pub fn square_cascade() -> CascadeDefinition {
    CascadeDefinition {
        window: WindowSize { width: 20, height: 20 },
        features: vec![HaarFeature {
            rects: vec![
                WeightedRect { x: 0, y: 0, width: 20, height: 20, weight: -1.0 },
                WeightedRect { x: 5, y: 5, width: 10, height: 10, weight: 4.0 },
            ],
        }],
        stages: vec![Stage {
            threshold: 0.0,
            classifiers: vec![WeakClassifier::stump(0, 0.05, -1.0, 1.0)],
        }],
    }
}

/// [`square_cascade`] in OpenCV's cascade XML layout.
pub fn square_cascade_opencv() -> String {
    square_cascade_xml("0 -1 0 0.05", "-1. 1.")
}

/// Square-cascade XML with the given single weak classifier.
pub fn square_cascade_xml(internal_nodes: &str, leaf_values: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>20</height>
  <width>20</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            {internal_nodes}</internalNodes>
          <leafValues>
            {leaf_values}</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 20 20 -1.</_>
        <_>
          5 5 10 10 4.</_></rects></_></features></cascade>
</opencv_storage>
"#
    )
}

/// Black `size`×`size` image with a white square of side `side` at (`offset`, `offset`).
pub fn bright_square_image(size: u32, offset: u32, side: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| {
        let inside = (offset..offset + side).contains(&x) && (offset..offset + side).contains(&y);
        Luma([if inside { 255 } else { 0 }])
    })
}

/// Deterministic pseudo-random texture; different seeds give different textures.
pub fn textured_face(seed: u32, size: u32) -> GrayImage {
    let mut state = seed.wrapping_mul(0x9E37_79B9).wrapping_add(0x7F4A_7C15) | 1;
    GrayImage::from_fn(size, size, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        Luma([(state % 216 + 40) as u8])
    })
}

pub fn write_png(dir: &Path, name: &str, image: &GrayImage) {
    image.save(dir.join(name)).unwrap();
}

/// Detector with scripted output.
pub struct MockDetector {
    fixed: Option<Vec<DetectionBox>>,
}

impl MockDetector {
    /// One box covering the central two thirds of any non-uniform image.
    pub fn centered() -> Self {
        Self { fixed: None }
    }

    /// The same boxes for every image.
    pub fn fixed(boxes: Vec<DetectionBox>) -> Self {
        Self { fixed: Some(boxes) }
    }
}

impl FaceDetector for MockDetector {
    fn detect(&self, image: &GrayImage) -> Vec<DetectionBox> {
        if let Some(boxes) = &self.fixed {
            return boxes.clone();
        }
        let first = image.get_pixel(0, 0)[0];
        if image.pixels().all(|p| p[0] == first) {
            return Vec::new();
        }
        let (w, h) = image.dimensions();
        let (mx, my) = (w / 6, h / 6);
        vec![DetectionBox::new(mx, my, w - 2 * mx, h - 2 * my)]
    }
}
