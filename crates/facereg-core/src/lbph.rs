//! LBPH (local binary pattern histogram) face classifier.
//!
//! Each training region is reduced to a grid of circular-LBP histograms.
//! Prediction returns the label of the nearest training histogram under
//! chi-square distance, so regions of any size can be compared.

use crate::types::{FaceSample, IdentityId, Prediction};
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f32::consts::PI;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const MODEL_FORMAT: &str = "facereg-lbph";
const MODEL_VERSION: u32 = 1;
/// Upper bound on sampling points; histograms have `2^neighbors` bins per cell.
const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("cannot train on an empty corpus")]
    EmptyCorpus,
    #[error("face region {width}x{height} is too small, need at least {min_width}x{min_height}")]
    RegionTooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("corrupt model {path}: {reason}")]
    CorruptModel { path: String, reason: String },
    #[error("failed to write model {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize model: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// LBP operator and grid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    /// Radius of the sampling circle, in pixels.
    pub radius: u32,
    /// Sampling points on the circle.
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.radius == 0 {
            return Err(ModelError::InvalidParams("radius must be at least 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(ModelError::InvalidParams(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(ModelError::InvalidParams(format!(
                "grid must be at least 1x1, got {}x{}",
                self.grid_x, self.grid_y
            )));
        }
        Ok(())
    }

    /// Histogram bins per grid cell.
    pub fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of one spatial histogram.
    pub fn histogram_len(&self) -> usize {
        self.bins() * self.grid_x as usize * self.grid_y as usize
    }

    /// Smallest region giving every grid cell at least one LBP code.
    pub fn min_region(&self) -> (u32, u32) {
        (2 * self.radius + self.grid_x, 2 * self.radius + self.grid_y)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LabeledHistogram {
    label: IdentityId,
    values: Vec<f32>,
}

/// Trained LBPH model; also the on-disk representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    format: String,
    version: u32,
    params: LbphParams,
    trained_at: DateTime<Utc>,
    histograms: Vec<LabeledHistogram>,
}

impl LbphModel {
    /// Train on `samples`. Regions may differ in size.
    pub fn train(samples: &[FaceSample], params: LbphParams) -> Result<Self, ModelError> {
        params.validate()?;
        if samples.is_empty() {
            return Err(ModelError::EmptyCorpus);
        }

        let model = Self {
            format: MODEL_FORMAT.to_string(),
            version: MODEL_VERSION,
            params,
            trained_at: Utc::now(),
            histograms: histograms_for(samples, &params)?,
        };

        let labels = model.labels();
        if labels.len() < 2 {
            tracing::warn!(
                labels = ?labels,
                "model trained on fewer than two identities; predictions cannot discriminate"
            );
        }
        tracing::info!(
            samples = model.histograms.len(),
            identities = labels.len(),
            ?params,
            "trained LBPH model"
        );

        Ok(model)
    }

    /// Add more samples without recomputing the existing histograms.
    pub fn update(&mut self, samples: &[FaceSample]) -> Result<(), ModelError> {
        if samples.is_empty() {
            return Err(ModelError::EmptyCorpus);
        }
        let added = histograms_for(samples, &self.params)?;
        self.histograms.extend(added);
        self.trained_at = Utc::now();
        tracing::info!(added = samples.len(), total = self.histograms.len(), "updated LBPH model");
        Ok(())
    }

    /// Nearest training label for `region`; ties go to the earliest sample.
    pub fn predict(&self, region: &GrayImage) -> Result<Prediction, ModelError> {
        let query = spatial_histogram(region, &self.params)?;

        let best = self
            .histograms
            .iter()
            .map(|h| Prediction {
                label: h.label,
                distance: chi_square(&query, &h.values),
            })
            .fold(None, |best: Option<Prediction>, candidate| match best {
                Some(b) if b.distance <= candidate.distance => Some(b),
                _ => Some(candidate),
            })
            .ok_or(ModelError::EmptyCorpus)?;

        tracing::debug!(label = best.label, distance = best.distance, "LBPH prediction");
        Ok(best)
    }

    /// Write the model to `path`, creating the parent directory if needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let write_err = |source: std::io::Error| ModelError::Write {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut writer = BufWriter::new(File::create(path).map_err(write_err)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush().map_err(write_err)?;

        tracing::info!(path = %path.display(), samples = self.histograms.len(), "saved LBPH model");
        Ok(())
    }

    /// Read a model previously written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ModelError::ModelNotFound(shown));
        }
        let corrupt = |reason: String| ModelError::CorruptModel {
            path: shown.clone(),
            reason,
        };

        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let model: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;
        model.check().map_err(corrupt)?;

        tracing::info!(
            path = %shown,
            samples = model.histograms.len(),
            identities = model.labels().len(),
            trained_at = %model.trained_at,
            "loaded LBPH model"
        );
        Ok(model)
    }

    fn check(&self) -> Result<(), String> {
        if self.format != MODEL_FORMAT {
            return Err(format!("unexpected format {:?}", self.format));
        }
        if self.version != MODEL_VERSION {
            return Err(format!("unsupported model version {}", self.version));
        }
        self.params.validate().map_err(|e| e.to_string())?;
        if self.histograms.is_empty() {
            return Err("model has no training histograms".into());
        }
        let expected = self.params.histogram_len();
        for (i, h) in self.histograms.iter().enumerate() {
            if h.values.len() != expected {
                return Err(format!(
                    "histogram {i} has {} values, expected {expected}",
                    h.values.len()
                ));
            }
            if h.values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(format!("histogram {i} contains invalid values"));
            }
        }
        Ok(())
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Number of training samples the model holds.
    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    /// Distinct labels the model can predict, ascending.
    pub fn labels(&self) -> Vec<IdentityId> {
        self.histograms
            .iter()
            .map(|h| h.label)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn histograms_for(samples: &[FaceSample], params: &LbphParams) -> Result<Vec<LabeledHistogram>, ModelError> {
    samples
        .iter()
        .map(|s| {
            Ok(LabeledHistogram {
                label: s.label,
                values: spatial_histogram(&s.region, params)?,
            })
        })
        .collect()
}

/// Circular LBP codes for every pixel at least `radius` away from the border.
///
/// Returns the codes in row-major order with their width and height.
fn lbp_codes(region: &GrayImage, params: &LbphParams) -> (Vec<u32>, usize, usize) {
    let (w, h) = region.dimensions();
    let r = params.radius as i64;
    let out_w = (w as i64 - 2 * r).max(0) as usize;
    let out_h = (h as i64 - 2 * r).max(0) as usize;
    let mut codes = vec![0u32; out_w * out_h];

    let px = |x: i64, y: i64| region.get_pixel(x as u32, y as u32)[0] as f32;

    for n in 0..params.neighbors {
        let angle = 2.0 * PI * n as f32 / params.neighbors as f32;
        let sx = r as f32 * angle.cos();
        let sy = -(r as f32) * angle.sin();

        let (fx, fy) = (sx.floor() as i64, sy.floor() as i64);
        let (cx, cy) = (sx.ceil() as i64, sy.ceil() as i64);
        let (tx, ty) = (sx - fx as f32, sy - fy as f32);

        // Bilinear weights of the four pixels around the sampling point.
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for y in r..(h as i64 - r) {
            for x in r..(w as i64 - r) {
                let t = w1 * px(x + fx, y + fy)
                    + w2 * px(x + cx, y + fy)
                    + w3 * px(x + fx, y + cy)
                    + w4 * px(x + cx, y + cy);
                let center = px(x, y);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[(y - r) as usize * out_w + (x - r) as usize] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Concatenated per-cell LBP histograms, each normalised to sum to 1.
fn spatial_histogram(region: &GrayImage, params: &LbphParams) -> Result<Vec<f32>, ModelError> {
    let (width, height) = region.dimensions();
    let (min_width, min_height) = params.min_region();
    if width < min_width || height < min_height {
        return Err(ModelError::RegionTooSmall {
            width,
            height,
            min_width,
            min_height,
        });
    }

    let (codes, out_w, out_h) = lbp_codes(region, params);
    let (grid_x, grid_y) = (params.grid_x as usize, params.grid_y as usize);
    let cell_w = out_w / grid_x;
    let cell_h = out_h / grid_y;
    let bins = params.bins();
    let norm = 1.0 / (cell_w * cell_h) as f32;

    let mut histogram = vec![0f32; params.histogram_len()];
    let mut counts = vec![0u32; bins];

    for gy in 0..grid_y {
        for gx in 0..grid_x {
            counts.fill(0);
            for y in gy * cell_h..(gy + 1) * cell_h {
                let row = &codes[y * out_w..(y + 1) * out_w];
                for &code in &row[gx * cell_w..(gx + 1) * cell_w] {
                    counts[code as usize] += 1;
                }
            }
            let base = (gy * grid_x + gx) * bins;
            for (dst, &count) in histogram[base..base + bins].iter_mut().zip(&counts) {
                *dst = count as f32 * norm;
            }
        }
    }

    Ok(histogram)
}

/// Symmetric chi-square distance `sum 2 (a - b)^2 / (a + b)`; empty bins are skipped.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let s = x + y;
            if s > f64::EPSILON {
                2.0 * (x - y) * (x - y) / s
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::textured_face;
    use image::Luma;

    fn sample(seed: u32, size: u32, label: IdentityId) -> FaceSample {
        FaceSample {
            region: textured_face(seed, size),
            label,
        }
    }

    #[test]
    fn test_default_params() {
        let p = LbphParams::default();
        assert_eq!((p.radius, p.neighbors, p.grid_x, p.grid_y), (1, 8, 8, 8));
        assert_eq!(p.bins(), 256);
        assert_eq!(p.histogram_len(), 256 * 64);
        assert_eq!(p.min_region(), (10, 10));
    }

    #[test]
    fn test_invalid_params() {
        for p in [
            LbphParams { radius: 0, ..LbphParams::default() },
            LbphParams { neighbors: 0, ..LbphParams::default() },
            LbphParams { neighbors: 17, ..LbphParams::default() },
            LbphParams { grid_x: 0, ..LbphParams::default() },
        ] {
            assert!(matches!(p.validate(), Err(ModelError::InvalidParams(_))), "{p:?}");
        }
    }

    #[test]
    fn test_lbp_single_bright_right_neighbour() {
        let mut region = GrayImage::from_pixel(3, 3, Luma([0]));
        region.put_pixel(1, 1, Luma([100]));
        region.put_pixel(2, 1, Luma([200]));
        let (codes, w, h) = lbp_codes(&region, &LbphParams::default());
        assert_eq!((w, h), (1, 1));
        assert_eq!(codes, vec![1]);
    }

    #[test]
    fn test_uniform_region_has_one_code() {
        let region = GrayImage::from_pixel(12, 12, Luma([77]));
        let (codes, w, h) = lbp_codes(&region, &LbphParams::default());
        assert_eq!((w, h), (10, 10));
        assert!(codes.iter().all(|&c| c == codes[0]));
    }

    #[test]
    fn test_histogram_cells_are_normalised() {
        let params = LbphParams::default();
        let hist = spatial_histogram(&textured_face(9, 50), &params).unwrap();
        assert_eq!(hist.len(), params.histogram_len());
        for cell in hist.chunks(params.bins()) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "cell sums to {total}");
        }
    }

    #[test]
    fn test_region_too_small() {
        let err = spatial_histogram(&GrayImage::new(9, 40), &LbphParams::default()).unwrap_err();
        assert!(matches!(
            err,
            ModelError::RegionTooSmall { width: 9, height: 40, min_width: 10, min_height: 10 }
        ));
    }

    #[test]
    fn test_chi_square_properties() {
        let a = [0.5f32, 0.5, 0.0];
        let b = [0.25f32, 0.75, 0.0];
        assert_eq!(chi_square(&a, &a), 0.0);
        assert!((chi_square(&a, &b) - chi_square(&b, &a)).abs() < 1e-12);
        // 2*(0.25^2)/0.75 + 2*(0.25^2)/1.25, the empty bin contributes nothing
        let expected = 2.0 * 0.0625 / 0.75 + 2.0 * 0.0625 / 1.25;
        assert!((chi_square(&a, &b) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_train_empty_corpus() {
        let err = LbphModel::train(&[], LbphParams::default()).unwrap_err();
        assert!(matches!(err, ModelError::EmptyCorpus));
    }

    #[test]
    fn test_predict_training_sample_returns_own_label() {
        let samples = vec![sample(1, 40, 101), sample(2, 40, 101), sample(3, 40, 102)];
        let model = LbphModel::train(&samples, LbphParams::default()).unwrap();

        for s in &samples {
            let p = model.predict(&s.region).unwrap();
            assert_eq!(p.label, s.label);
            assert_eq!(p.distance, 0.0);
        }
        assert_eq!(model.labels(), vec![101, 102]);
        assert_eq!(model.sample_count(), 3);
    }

    #[test]
    fn test_variable_region_sizes() {
        let samples = vec![sample(1, 24, 1), sample(2, 57, 2), sample(3, 33, 3)];
        let model = LbphModel::train(&samples, LbphParams::default()).unwrap();
        let p = model.predict(&textured_face(2, 57)).unwrap();
        assert_eq!(p.label, 2);
        let other = model.predict(&textured_face(42, 70)).unwrap();
        assert!(other.distance > 0.0);
    }

    #[test]
    fn test_training_is_deterministic() {
        let samples = vec![sample(1, 40, 1), sample(2, 40, 2)];
        let a = LbphModel::train(&samples, LbphParams::default()).unwrap();
        let b = LbphModel::train(&samples, LbphParams::default()).unwrap();
        let probe = textured_face(5, 40);
        assert_eq!(a.predict(&probe).unwrap(), b.predict(&probe).unwrap());
    }

    #[test]
    fn test_update_adds_label() {
        let mut model = LbphModel::train(&[sample(1, 40, 1)], LbphParams::default()).unwrap();
        assert!(matches!(model.update(&[]), Err(ModelError::EmptyCorpus)));
        model.update(&[sample(2, 40, 2)]).unwrap();
        assert_eq!(model.labels(), vec![1, 2]);
        assert_eq!(model.predict(&textured_face(2, 40)).unwrap().label, 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trainer.json");
        let samples = vec![sample(1, 40, 101), sample(3, 36, 102)];
        let model = LbphModel::train(&samples, LbphParams::default()).unwrap();
        model.save(&path).unwrap();

        let loaded = LbphModel::load(&path).unwrap();
        assert_eq!(loaded.labels(), model.labels());
        assert_eq!(loaded.params(), model.params());
        for s in &samples {
            let p = loaded.predict(&s.region).unwrap();
            assert_eq!(p.label, s.label);
            assert!(p.distance < 100.0);
        }
        let probe = textured_face(77, 44);
        assert_eq!(loaded.predict(&probe).unwrap(), model.predict(&probe).unwrap());
    }

    #[test]
    fn test_load_missing() {
        let err = LbphModel::load("/nonexistent/trainer.json").unwrap_err();
        assert!(matches!(err, ModelError::ModelNotFound(_)));
    }

    #[test]
    fn test_load_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        std::fs::write(&path, "%YAML:1.0\nopencv_lbphfaces: {}").unwrap();
        assert!(matches!(LbphModel::load(&path), Err(ModelError::CorruptModel { .. })));
    }

    #[test]
    fn test_load_rejects_inconsistent_histograms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        let model = LbphModel::train(&[sample(1, 30, 1)], LbphParams::default()).unwrap();

        let mut doc = serde_json::to_value(&model).unwrap();
        doc["histograms"][0]["values"] = serde_json::json!([0.5, 0.5]);
        std::fs::write(&path, doc.to_string()).unwrap();

        let err = LbphModel::load(&path).unwrap_err();
        assert!(err.to_string().contains("expected 16384"), "{err}");
    }

    #[test]
    fn test_load_rejects_other_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        let model = LbphModel::train(&[sample(1, 30, 1)], LbphParams::default()).unwrap();

        let mut doc = serde_json::to_value(&model).unwrap();
        doc["version"] = serde_json::json!(99);
        std::fs::write(&path, doc.to_string()).unwrap();

        assert!(matches!(LbphModel::load(&path), Err(ModelError::CorruptModel { .. })));
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        LbphModel::train(&[sample(1, 30, 1)], LbphParams::default())
            .unwrap()
            .save(&path)
            .unwrap();
        LbphModel::train(&[sample(2, 30, 7), sample(3, 30, 8)], LbphParams::default())
            .unwrap()
            .save(&path)
            .unwrap();
        assert_eq!(LbphModel::load(&path).unwrap().labels(), vec![7, 8]);
    }
}
