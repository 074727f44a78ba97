use clap::Args;
use std::path::PathBuf;

use crate::errors::{Result, WasteSortError};

pub const DEFAULT_URL_PREFIX: &str = "/uploads";
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
pub const DEFAULT_MAX_DETECTIONS: usize = 300;
pub const DEFAULT_DETECTOR_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CLASSIFIER_INPUT_SIZE: u32 = 224;
pub const DEFAULT_CROP_QUALITY: u8 = 95;

/// Tunable constants for the material signature and the plastic/metal rules.
///
/// The rule table only stays idempotent while the metal→plastic highlight
/// ceiling sits at or below the plastic→metal highlight floor; `validate`
/// enforces that.
#[derive(Args, Debug, Clone, PartialEq)]
#[command(next_help_heading = "Material heuristics")]
pub struct HeuristicThresholds {
    /// Grayscale level above which a pixel counts as a highlight
    #[arg(long, default_value_t = HeuristicThresholds::BRIGHTNESS_THRESHOLD)]
    pub brightness_threshold: u8,

    #[arg(long, default_value_t = HeuristicThresholds::CANNY_LOW)]
    pub canny_low: f32,

    #[arg(long, default_value_t = HeuristicThresholds::CANNY_HIGH)]
    pub canny_high: f32,

    /// plastic → metal when highlight_ratio is above this
    #[arg(long, default_value_t = HeuristicThresholds::METAL_MIN_HIGHLIGHT)]
    pub metal_min_highlight: f64,

    /// plastic → metal when std_dev is above this
    #[arg(long, default_value_t = HeuristicThresholds::METAL_MIN_STD_DEV)]
    pub metal_min_std_dev: f64,

    /// metal → plastic when saturation is above this
    #[arg(long, default_value_t = HeuristicThresholds::PLASTIC_MIN_SATURATION)]
    pub plastic_min_saturation: f64,

    /// metal → plastic when highlight_ratio is below this
    #[arg(long, default_value_t = HeuristicThresholds::PLASTIC_MAX_HIGHLIGHT)]
    pub plastic_max_highlight: f64,

    /// Upper bound on the confidence of a corrected prediction
    #[arg(long, default_value_t = HeuristicThresholds::CORRECTED_CONFIDENCE_CAP)]
    pub corrected_confidence_cap: f32,
}

impl HeuristicThresholds {
    pub const BRIGHTNESS_THRESHOLD: u8 = 200;
    pub const CANNY_LOW: f32 = 50.0;
    pub const CANNY_HIGH: f32 = 150.0;
    pub const METAL_MIN_HIGHLIGHT: f64 = 0.15;
    pub const METAL_MIN_STD_DEV: f64 = 40.0;
    pub const PLASTIC_MIN_SATURATION: f64 = 50.0;
    pub const PLASTIC_MAX_HIGHLIGHT: f64 = 0.08;
    pub const CORRECTED_CONFIDENCE_CAP: f32 = 0.85;

    pub fn validate(&self) -> Result<()> {
        if self.plastic_max_highlight > self.metal_min_highlight {
            return Err(WasteSortError::Validation {
                field: "plastic_max_highlight".to_string(),
                reason: format!(
                    "must not exceed metal_min_highlight ({} > {})",
                    self.plastic_max_highlight, self.metal_min_highlight
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.corrected_confidence_cap) {
            return Err(WasteSortError::Validation {
                field: "corrected_confidence_cap".to_string(),
                reason: "must lie in [0, 1]".to_string(),
            });
        }
        if self.canny_low > self.canny_high {
            return Err(WasteSortError::Validation {
                field: "canny_low".to_string(),
                reason: "must not exceed canny_high".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            brightness_threshold: Self::BRIGHTNESS_THRESHOLD,
            canny_low: Self::CANNY_LOW,
            canny_high: Self::CANNY_HIGH,
            metal_min_highlight: Self::METAL_MIN_HIGHLIGHT,
            metal_min_std_dev: Self::METAL_MIN_STD_DEV,
            plastic_min_saturation: Self::PLASTIC_MIN_SATURATION,
            plastic_max_highlight: Self::PLASTIC_MAX_HIGHLIGHT,
            corrected_confidence_cap: Self::CORRECTED_CONFIDENCE_CAP,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Object detection model (YOLO-style ONNX)
    #[arg(long, default_value = "yolov8n.onnx")]
    pub detector_model: PathBuf,

    /// Material classification model (ONNX)
    #[arg(long, default_value = "waste_classifier_model.onnx")]
    pub classifier_model: PathBuf,

    /// JSON object mapping class label to output index
    #[arg(long, default_value = "class_indices.json")]
    pub label_map: PathBuf,

    /// JSON-lines file receiving one summary record per request
    #[arg(long, default_value = "classifications.jsonl")]
    pub store_path: PathBuf,

    /// Prefix used when building image_url and crop_url
    #[arg(long, default_value = DEFAULT_URL_PREFIX)]
    pub url_prefix: String,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
    pub confidence_threshold: f32,

    #[arg(long, default_value_t = DEFAULT_IOU_THRESHOLD)]
    pub iou_threshold: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_DETECTIONS)]
    pub max_detections: usize,

    /// Used when the classifier declares a dynamic input resolution
    #[arg(long, default_value_t = DEFAULT_CLASSIFIER_INPUT_SIZE)]
    pub classifier_input_size: u32,

    #[arg(long, default_value_t = DEFAULT_CROP_QUALITY)]
    pub crop_quality: u8,

    #[command(flatten)]
    pub thresholds: HeuristicThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector_model: "yolov8n.onnx".into(),
            classifier_model: "waste_classifier_model.onnx".into(),
            label_map: "class_indices.json".into(),
            store_path: "classifications.jsonl".into(),
            url_prefix: DEFAULT_URL_PREFIX.to_string(),
            device_id: 0,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
            classifier_input_size: DEFAULT_CLASSIFIER_INPUT_SIZE,
            crop_quality: DEFAULT_CROP_QUALITY,
            thresholds: HeuristicThresholds::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("iou_threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(WasteSortError::Validation {
                    field: field.to_string(),
                    reason: format!("must lie in [0, 1], got {value}"),
                });
            }
        }
        if self.classifier_input_size == 0 {
            return Err(WasteSortError::Validation {
                field: "classifier_input_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_detections == 0 {
            return Err(WasteSortError::Validation {
                field: "max_detections".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(1..=100).contains(&self.crop_quality) {
            return Err(WasteSortError::Validation {
                field: "crop_quality".to_string(),
                reason: "must lie in 1..=100".to_string(),
            });
        }
        self.thresholds.validate()
    }

    /// `/uploads` + `a.jpg` → `/uploads/a.jpg`
    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_overlapping_highlight_thresholds_rejected() {
        let mut config = Config::default();
        config.thresholds.plastic_max_highlight = 0.2;
        config.thresholds.metal_min_highlight = 0.1;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("plastic_max_highlight"));
    }

    #[test]
    fn test_confidence_threshold_range() {
        let config = Config {
            confidence_threshold: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_public_url() {
        let mut config = Config::default();
        assert_eq!(config.public_url("a.jpg"), "/uploads/a.jpg");

        config.url_prefix = "https://cdn.example/u/".to_string();
        assert_eq!(config.public_url("b.jpg"), "https://cdn.example/u/b.jpg");
    }
}
