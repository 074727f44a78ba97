use std::{collections::HashMap, fs, path::{Path, PathBuf}};

use image::{imageops, imageops::FilterType, DynamicImage};
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    errors::{Result, WasteSortError},
    imageops::{to_nchw_tensor, to_nhwc_tensor},
    model::{build_session, input_dimensions, LazyModel},
    traits::{MaterialClassifier, ModelLoader},
};

pub const DEGRADED_LABEL: &str = "trash";
pub const DEGRADED_CONFIDENCE: f32 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    /// Label the classifier originally produced, set once a correction rule fired
    #[serde(skip)]
    pub corrected_from: Option<String>,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            corrected_from: None,
        }
    }

    pub fn degraded() -> Self {
        Self::new(DEGRADED_LABEL, DEGRADED_CONFIDENCE)
    }

    pub const fn is_corrected(&self) -> bool {
        self.corrected_from.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DegradeReason {
    /// Model artifact or label map missing, or the load threw
    ModelUnavailable,
    Inference(String),
}

/// Outcome of one classification.
///
/// Hard failures never reach this type; a `Degraded` value still carries a
/// usable result so callers can tell "processed with low confidence" from a
/// real prediction without handling an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Classified(ClassificationResult),
    Degraded {
        result: ClassificationResult,
        reason: DegradeReason,
    },
}

impl Prediction {
    pub fn degraded(reason: DegradeReason) -> Self {
        Self::Degraded {
            result: ClassificationResult::degraded(),
            reason,
        }
    }

    pub const fn result(&self) -> &ClassificationResult {
        match self {
            Self::Classified(result) | Self::Degraded { result, .. } => result,
        }
    }

    pub fn into_result(self) -> ClassificationResult {
        match self {
            Self::Classified(result) | Self::Degraded { result, .. } => result,
        }
    }

    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Load-once classification service with a permanent degraded mode.
///
/// `Uninitialized → Loaded` on the first successful load, or
/// `Uninitialized → LoadFailed`, after which every prediction is
/// `{trash, 0.3}`. `predict` never returns an error.
pub struct Classifier<L: ModelLoader>
where
    L::Model: MaterialClassifier,
{
    model: LazyModel<L>,
}

impl<L: ModelLoader> Classifier<L>
where
    L::Model: MaterialClassifier,
{
    pub const fn new(loader: L) -> Self {
        Self {
            model: LazyModel::new(loader),
        }
    }

    pub fn predict(&self, image: &DynamicImage) -> Prediction {
        let Some(model) = self.model.get() else {
            return Prediction::degraded(DegradeReason::ModelUnavailable);
        };

        match model.classify(image) {
            Ok(result) => {
                debug!(class = %result.label, confidence = result.confidence, "classified");
                Prediction::Classified(result)
            }
            Err(e) => {
                warn!(error = %e, "classification failed, using degraded result");
                Prediction::degraded(DegradeReason::Inference(e.to_string()))
            }
        }
    }

    /// Like `predict`, but an unreadable file also degrades.
    pub fn predict_path(&self, path: &Path) -> Prediction {
        match image::open(path) {
            Ok(image) => self.predict(&image),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "crop unreadable, using degraded result");
                Prediction::degraded(DegradeReason::Inference(e.to_string()))
            }
        }
    }

    /// `true` once loading has been attempted and failed
    pub fn is_degraded(&self) -> bool {
        self.model.is_loaded() == Some(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

impl TensorLayout {
    /// Reads layout and square resolution from `[N, C, H, W]` or `[N, H, W, C]`.
    pub fn from_dimensions(dims: &[i64], fallback_size: u32) -> Result<(Self, u32)> {
        let [_, a, b, c] = dims else {
            return Err(WasteSortError::model(
                "classifier input shape",
                format!("expected a rank-4 input, got {dims:?}"),
            ));
        };
        let size = |d: i64| if d > 0 { d as u32 } else { fallback_size };
        match (*a, *c) {
            (3, _) => Ok((Self::Nchw, size(*b))),
            (_, 3) => Ok((Self::Nhwc, size(*a))),
            _ => Err(WasteSortError::model(
                "classifier input shape",
                format!("no 3-channel axis in {dims:?}"),
            )),
        }
    }
}

/// Reads a `{label: index}` JSON object into an index-ordered label list.
pub fn load_label_map(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| WasteSortError::FileSystem {
        path: path.to_path_buf(),
        operation: "label map read".to_string(),
        source: e,
    })?;
    let indices: HashMap<String, usize> =
        serde_json::from_str(&text).map_err(|e| WasteSortError::Configuration {
            message: format!("invalid label map {}: {e}", path.display()),
        })?;

    let mut labels = vec![None; indices.len()];
    for (label, index) in indices {
        match labels.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(label),
            _ => {
                return Err(WasteSortError::Validation {
                    field: format!("label map entry `{label}`"),
                    reason: format!("index {index} is duplicated or out of range"),
                })
            }
        }
    }
    Ok(labels.into_iter().flatten().collect())
}

/// Turns raw scores into a probability distribution.
///
/// Models exported with a final softmax layer already produce one; anything
/// else is treated as logits.
pub fn to_probabilities(scores: &[f32]) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let is_distribution =
        scores.iter().all(|p| (0.0..=1.0).contains(p)) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        return scores.to_vec();
    }

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
    labels: Vec<String>,
    layout: TensorLayout,
    input_size: u32,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn new(session: Session, labels: Vec<String>, fallback_size: u32) -> Result<Self> {
        if labels.is_empty() {
            return Err(WasteSortError::Validation {
                field: "label map".to_string(),
                reason: "contains no labels".to_string(),
            });
        }
        let (layout, input_size) =
            TensorLayout::from_dimensions(&input_dimensions(&session)?, fallback_size)?;
        let input_name = session.inputs[0].name.clone();
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| WasteSortError::model("classifier output lookup", "model declares no outputs"))?;

        Ok(Self {
            session: Mutex::new(session),
            labels,
            layout,
            input_size,
            input_name,
            output_name,
        })
    }

    fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let resized = imageops::resize(
            &image.to_rgb8(),
            self.input_size,
            self.input_size,
            FilterType::Nearest,
        );
        match self.layout {
            TensorLayout::Nchw => to_nchw_tensor(&resized),
            TensorLayout::Nhwc => to_nhwc_tensor(&resized),
        }
    }

    fn run(&self, tensor: Array4<f32>) -> Result<Vec<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        let scores = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(scores.iter().copied().collect())
    }
}

impl MaterialClassifier for OnnxClassifier {
    fn classify(&self, image: &DynamicImage) -> Result<ClassificationResult> {
        let scores = self.run(self.preprocess(image))?;
        if scores.len() != self.labels.len() {
            return Err(WasteSortError::model(
                "classifier output decoding",
                format!(
                    "{} scores for {} labels",
                    scores.len(),
                    self.labels.len()
                ),
            ));
        }

        let probabilities = to_probabilities(&scores);
        let (index, confidence) = argmax(&probabilities)
            .filter(|(_, p)| p.is_finite())
            .ok_or_else(|| WasteSortError::model("classifier output decoding", "no finite score"))?;
        Ok(ClassificationResult::new(self.labels[index].clone(), confidence))
    }
}

/// Loads the ONNX classifier and its label map; both must exist.
#[derive(Debug, Clone)]
pub struct OnnxClassifierLoader {
    pub model_path: PathBuf,
    pub label_map_path: PathBuf,
    pub device_id: i32,
    pub fallback_input_size: u32,
}

impl ModelLoader for OnnxClassifierLoader {
    type Model = OnnxClassifier;

    fn describe(&self) -> String {
        self.model_path.display().to_string()
    }

    fn load(&self) -> Result<OnnxClassifier> {
        let labels = load_label_map(&self.label_map_path)?;
        let session = build_session(&self.model_path, self.device_id)?;
        OnnxClassifier::new(session, labels, self.fallback_input_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FailingLoader, MockLoader, ScriptedClassifier};
    use image::{Rgb, RgbImage};

    fn sample_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])))
    }

    #[test]
    fn test_load_failure_degrades_every_prediction() {
        let classifier: Classifier<FailingLoader<ScriptedClassifier>> =
            Classifier::new(FailingLoader::new());

        for _ in 0..3 {
            let prediction = classifier.predict(&sample_image());
            assert_eq!(prediction, Prediction::degraded(DegradeReason::ModelUnavailable));
            assert_eq!(prediction.result().label, "trash");
            assert_eq!(prediction.result().confidence, 0.3);
        }
        assert!(classifier.is_degraded());
    }

    #[test]
    fn test_inference_error_degrades() {
        let model = ScriptedClassifier::failing();
        let classifier = Classifier::new(MockLoader::new(model));

        let prediction = classifier.predict(&sample_image());
        assert!(prediction.is_degraded());
        assert_eq!(prediction.into_result(), ClassificationResult::degraded());
        assert!(!classifier.is_degraded());
    }

    #[test]
    fn test_unreadable_path_degrades() {
        let classifier = Classifier::new(MockLoader::new(ScriptedClassifier::constant("glass", 0.9)));
        let prediction = classifier.predict_path(Path::new("/nonexistent/crop.jpg"));
        assert!(prediction.is_degraded());
    }

    #[test]
    fn test_successful_prediction() {
        let classifier = Classifier::new(MockLoader::new(ScriptedClassifier::constant("glass", 0.9)));
        let prediction = classifier.predict(&sample_image());
        assert_eq!(
            prediction,
            Prediction::Classified(ClassificationResult::new("glass", 0.9))
        );
    }

    #[test]
    fn test_layout_detection() {
        assert_eq!(
            TensorLayout::from_dimensions(&[1, 224, 224, 3], 100).unwrap(),
            (TensorLayout::Nhwc, 224)
        );
        assert_eq!(
            TensorLayout::from_dimensions(&[-1, 3, -1, -1], 224).unwrap(),
            (TensorLayout::Nchw, 224)
        );
        assert!(TensorLayout::from_dimensions(&[1, 1000], 224).is_err());
    }

    #[test]
    fn test_probabilities_pass_through_or_softmax() {
        let distribution = [0.1, 0.7, 0.2];
        assert_eq!(to_probabilities(&distribution), distribution.to_vec());

        let softmaxed = to_probabilities(&[1.0, 1.0, 3.0]);
        let sum: f32 = softmaxed.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(argmax(&softmaxed).map(|(i, _)| i), Some(2));
    }

    #[test]
    fn test_argmax_prefers_first_on_tie() {
        assert_eq!(argmax(&[0.5, 0.5]), Some((0, 0.5)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_label_map() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("class_indices.json");

        fs::write(&path, r#"{"metal": 1, "cardboard": 0, "plastic": 2}"#)?;
        assert_eq!(load_label_map(&path)?, vec!["cardboard", "metal", "plastic"]);

        fs::write(&path, r#"{"metal": 1, "plastic": 1}"#)?;
        assert!(load_label_map(&path).is_err());

        fs::write(&path, r#"{"metal": 5}"#)?;
        assert!(load_label_map(&path).is_err());
        Ok(())
    }
}
