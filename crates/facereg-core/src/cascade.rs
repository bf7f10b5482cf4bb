//! Haar cascade evaluation.
//!
//! Runs a boosted cascade of Haar-like features over an image pyramid with
//! variance-normalised feature responses, then merges overlapping window hits
//! into face rectangles. Cascades are read from OpenCV's `<opencv_storage>`
//! HAAR files by [`crate::cascade_file`].

use crate::detector::DetectorParams;
use crate::types::DetectionBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array2;
use std::borrow::Cow;

/// Similarity tolerance used when grouping raw window hits.
const GROUP_EPS: f64 = 0.2;
/// Inset of the variance-normalisation rectangle inside the detection window.
const NORM_INSET: u32 = 1;
/// Scale factor above which the window slides one pixel at a time.
const FINE_STEP_FACTOR: f64 = 2.0;

/// A pretrained boosted cascade.
#[derive(Debug, Clone)]
pub struct CascadeDefinition {
    /// Base detection window the features are defined in.
    pub window: WindowSize,
    pub features: Vec<HaarFeature>,
    /// Stages in evaluation order. A window must pass all of them.
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Weighted sum of rectangle intensities.
#[derive(Debug, Clone)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Small decision tree over Haar features. Evaluation starts at node 0.
#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    /// Index into [`CascadeDefinition::features`].
    pub feature: usize,
    pub threshold: f32,
    /// Followed when the normalised response is below `threshold`.
    pub left: Branch,
    pub right: Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Node(usize),
    Leaf(usize),
}

impl WeakClassifier {
    /// One split: `left` below `threshold`, `right` otherwise.
    pub fn stump(feature: usize, threshold: f32, left: f32, right: f32) -> Self {
        Self {
            nodes: vec![TreeNode {
                feature,
                threshold,
                left: Branch::Leaf(0),
                right: Branch::Leaf(1),
            }],
            leaves: vec![left, right],
        }
    }

    fn check(&self, features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("classifier has no nodes".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.feature >= features {
                return Err(format!(
                    "references feature {} but only {features} are defined",
                    node.feature
                ));
            }
            for branch in [node.left, node.right] {
                match branch {
                    // Children come after their parent, so evaluation always terminates.
                    Branch::Node(j) if j <= i || j >= self.nodes.len() => {
                        return Err(format!("node {i} has invalid child {j}"));
                    }
                    Branch::Leaf(l) if l >= self.leaves.len() => {
                        return Err(format!("node {i} has invalid leaf {l}"));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, features: &[HaarFeature], integral: &IntegralImage, x: u32, y: u32, norm: f64) -> f64 {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            let response = features[node.feature].response(integral, x, y) / norm;
            let branch = if response < node.threshold as f64 {
                node.left
            } else {
                node.right
            };
            match branch {
                Branch::Node(next) => idx = next,
                Branch::Leaf(leaf) => return self.leaves[leaf] as f64,
            }
        }
    }
}

impl CascadeDefinition {
    /// Check structural consistency; the error string names the offending part.
    pub fn validate(&self) -> Result<(), String> {
        let WindowSize { width, height } = self.window;
        if width == 0 || height == 0 {
            return Err(format!("detection window has zero size ({width}x{height})"));
        }
        if self.stages.is_empty() {
            return Err("cascade has no stages".into());
        }

        for (i, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(format!("feature {i} has no rectangles"));
            }
            for r in &feature.rects {
                let fits = r.width > 0
                    && r.height > 0
                    && r.x as u64 + r.width as u64 <= width as u64
                    && r.y as u64 + r.height as u64 <= height as u64;
                if !fits {
                    return Err(format!(
                        "feature {i}: rectangle {r:?} lies outside the {width}x{height} window"
                    ));
                }
            }
        }

        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(format!("stage {s} has no classifiers"));
            }
            for (c, classifier) in stage.classifiers.iter().enumerate() {
                classifier
                    .check(self.features.len())
                    .map_err(|e| format!("stage {s} classifier {c} {e}"))?;
            }
        }

        Ok(())
    }

    /// Detect objects at every scale, returning grouped boxes in source coordinates.
    ///
    /// The definition must have passed [`validate`](Self::validate). Images
    /// smaller than the detection window simply yield no boxes.
    pub(crate) fn detect_multi_scale(&self, image: &GrayImage, params: &DetectorParams) -> Vec<DetectionBox> {
        let (img_w, img_h) = image.dimensions();
        let win = self.window;
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let level_w = (img_w as f64 / factor).round() as u32;
            let level_h = (img_h as f64 / factor).round() as u32;
            if level_w < win.width || level_h < win.height {
                break;
            }

            let face_w = (win.width as f64 * factor).round() as u32;
            let face_h = (win.height as f64 * factor).round() as u32;

            if face_w >= params.min_size && face_h >= params.min_size {
                let level: Cow<'_, GrayImage> = if level_w == img_w && level_h == img_h {
                    Cow::Borrowed(image)
                } else {
                    Cow::Owned(imageops::resize(image, level_w, level_h, FilterType::Triangle))
                };
                let integral = IntegralImage::new(&level);
                let step = if factor > FINE_STEP_FACTOR { 1 } else { 2 };

                for y in (0..=level_h - win.height).step_by(step) {
                    for x in (0..=level_w - win.width).step_by(step) {
                        if self.window_passes(&integral, x, y) {
                            hits.push(Rect {
                                x: (x as f64 * factor).round() as i64,
                                y: (y as f64 * factor).round() as i64,
                                width: face_w as i64,
                                height: face_h as i64,
                            });
                        }
                    }
                }
            }

            factor *= params.scale_factor;
        }

        tracing::trace!(hits = hits.len(), "cascade raw window hits");

        group_rectangles(hits, params.min_neighbors, GROUP_EPS)
            .into_iter()
            .filter_map(|r| DetectionBox::clipped(r.x, r.y, r.width, r.height, img_w, img_h))
            .collect()
    }

    /// Region used for variance normalisation, relative to the window origin.
    fn norm_rect(&self) -> (u32, u32, u32, u32) {
        let WindowSize { width, height } = self.window;
        if width > 2 * NORM_INSET && height > 2 * NORM_INSET {
            (NORM_INSET, NORM_INSET, width - 2 * NORM_INSET, height - 2 * NORM_INSET)
        } else {
            (0, 0, width, height)
        }
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    fn window_passes(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let (nx, ny, nw, nh) = self.norm_rect();
        let area = (nw as u64 * nh as u64) as f64;
        let sum = integral.sum(x + nx, y + ny, nw, nh) as f64;
        let sqsum = integral.sqsum(x + nx, y + ny, nw, nh) as f64;
        let variance = area * sqsum - sum * sum;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let total: f64 = stage
                .classifiers
                .iter()
                .map(|c| c.evaluate(&self.features, integral, x, y, norm))
                .sum();
            if total < stage.threshold as f64 {
                return false;
            }
        }
        true
    }
}

impl HaarFeature {
    fn response(&self, integral: &IntegralImage, ox: u32, oy: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| integral.sum(ox + r.x, oy + r.y, r.width, r.height) as f64 * r.weight as f64)
            .sum()
    }
}

/// Summed-area tables of intensities and squared intensities.
///
/// Both tables are `(height + 1) × (width + 1)` with a zero first row and column.
struct IntegralImage {
    sum: Array2<u64>,
    sqsum: Array2<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = image.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut sum = Array2::<u64>::zeros((h + 1, w + 1));
        let mut sqsum = Array2::<u64>::zeros((h + 1, w + 1));

        for (y, row) in image.rows().enumerate() {
            let mut row_sum = 0u64;
            let mut row_sqsum = 0u64;
            for (x, pixel) in row.enumerate() {
                let p = pixel[0] as u64;
                row_sum += p;
                row_sqsum += p * p;
                sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row_sum;
                sqsum[[y + 1, x + 1]] = sqsum[[y, x + 1]] + row_sqsum;
            }
        }

        Self { sum, sqsum }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, x, y, w, h)
    }

    fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sqsum, x, y, w, h)
    }

    fn rect(table: &Array2<u64>, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        // a + b - c - d never underflows for a summed-area table.
        table[[y1, x1]] + table[[y0, x0]] - table[[y0, x1]] - table[[y1, x0]]
    }
}

/// Signed rectangle used while grouping, before clipping to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i64,
    y: i64,
    width: i64,
    height: i64,
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
        && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

/// Label each rectangle with its similarity cluster (transitive closure).
///
/// Cluster labels are dense and numbered in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> Vec<usize> {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let a = find(&mut parent, i);
                let b = find(&mut parent, j);
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut next = 0;
    let mut labels = vec![0; n];
    for (i, label) in labels.iter_mut().enumerate() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = next;
            next += 1;
        }
        *label = class_of_root[root];
    }
    labels
}

/// Merge raw hits into averaged rectangles.
///
/// Clusters with `min_neighbors` or fewer members are dropped, as are
/// averaged rectangles lying inside a better-supported neighbour.
/// `min_neighbors == 0` returns the hits untouched.
fn group_rectangles(rects: Vec<Rect>, min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let labels = partition(&rects, eps);
    let n_classes = labels.iter().max().map_or(0, |&m| m + 1);

    let mut sums = vec![[0i64; 4]; n_classes];
    let mut counts = vec![0usize; n_classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x;
        s[1] += r.y;
        s[2] += r.width;
        s[3] += r.height;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            Rect {
                x: (s[0] as f64 * inv).round() as i64,
                y: (s[1] as f64 * inv).round() as i64,
                width: (s[2] as f64 * inv).round() as i64,
                height: (s[3] as f64 * inv).round() as i64,
            }
        })
        .collect();

    let threshold = min_neighbors as usize;
    let mut grouped = Vec::new();

    for i in 0..n_classes {
        let n1 = counts[i];
        if n1 <= threshold {
            continue;
        }
        let r1 = averaged[i];

        let swallowed = (0..n_classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;

            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !swallowed {
            grouped.push(r1);
        }
    }

    grouped
}
