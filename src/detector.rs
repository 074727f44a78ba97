use std::path::PathBuf;

use image::{DynamicImage, GenericImageView};
use ndarray::{ArrayViewD, Axis, Ix2};
use ort::{session::Session, value::TensorRef};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::DEFAULT_DETECTOR_INPUT_SIZE,
    errors::{Result, WasteSortError},
    imageops::{letterbox, to_nchw_tensor, Letterbox},
    model::{build_session, input_dimensions, LazyModel},
    traits::{ModelLoader, ObjectDetector},
};

const LETTERBOX_FILL: u8 = 114;

/// Axis-aligned box in source-image pixels, `0 ≤ x1 < x2 ≤ w`, `0 ≤ y1 < y2 ≤ h`.
///
/// Serializes as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "[u32; 4]")]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BoundingBox {
    pub const fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x1: 0,
            y1: 0,
            x2: width,
            y2: height,
        }
    }

    /// Clamps a float box into a `width`×`height` frame, truncating toward zero.
    ///
    /// Returns `None` when clamping leaves no area.
    pub fn clipped(raw: [f32; 4], width: u32, height: u32) -> Option<Self> {
        let clamp = |v: f32, max: u32| {
            if v.is_nan() {
                0
            } else {
                v.clamp(0.0, max as f32) as u32
            }
        };
        let [x1, y1, x2, y2] = raw;
        let bbox = Self {
            x1: clamp(x1, width),
            y1: clamp(y1, height),
            x2: clamp(x2, width),
            y2: clamp(y2, height),
        };
        (bbox.x1 < bbox.x2 && bbox.y1 < bbox.y2).then_some(bbox)
    }

    pub const fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub const fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// One box as reported by a detection back-end, before clipping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// `[x1, y1, x2, y2]` in source-image pixels
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
}

impl RawDetection {
    pub const fn new(bbox: [f32; 4], confidence: f32, class_id: usize) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
        }
    }

    fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    fn iou(&self, other: &Self) -> f32 {
        let x1 = self.bbox[0].max(other.bbox[0]);
        let y1 = self.bbox[1].max(other.bbox[1]);
        let x2 = self.bbox[2].min(other.bbox[2]);
        let y2 = self.bbox[3].min(other.bbox[3]);
        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Per-class non-maximum suppression; output is sorted by confidence.
pub fn non_max_suppression(
    mut detections: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawDetection> = Vec::new();
    for candidate in detections {
        if keep.len() >= max_detections {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

/// Load-once localization service.
///
/// A back-end that failed to load, or that errors on an image, yields no
/// boxes; the caller then falls back to classifying the whole image.
pub struct Detector<L: ModelLoader>
where
    L::Model: ObjectDetector,
{
    model: LazyModel<L>,
}

impl<L: ModelLoader> Detector<L>
where
    L::Model: ObjectDetector,
{
    pub const fn new(loader: L) -> Self {
        Self {
            model: LazyModel::new(loader),
        }
    }

    /// Boxes clipped to the image, in back-end order.
    pub fn detect(&self, image: &DynamicImage) -> Vec<BoundingBox> {
        let Some(model) = self.model.get() else {
            warn!("detector unavailable, treating image as a single object");
            return Vec::new();
        };

        let raw = match model.detect(image) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "detection failed, treating image as a single object");
                return Vec::new();
            }
        };

        let (width, height) = image.dimensions();
        raw.into_iter()
            .filter_map(|d| {
                let clipped = BoundingBox::clipped(d.bbox, width, height);
                if clipped.is_none() {
                    debug!(bbox = ?d.bbox, "dropping box with no area inside the frame");
                }
                clipped
            })
            .collect()
    }
}

/// YOLOv8-family ONNX detector: `[1, 4 + classes, anchors]` output of
/// centre-x, centre-y, width, height followed by per-class scores.
pub struct YoloDetector {
    session: Mutex<Session>,
    input_size: u32,
    input_name: String,
    output_name: String,
    confidence_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl YoloDetector {
    pub fn new(
        session: Session,
        confidence_threshold: f32,
        iou_threshold: f32,
        max_detections: usize,
    ) -> Result<Self> {
        let dims = input_dimensions(&session)?;
        let input_size = match dims.get(2) {
            Some(&d) if d > 0 => d as u32,
            _ => DEFAULT_DETECTOR_INPUT_SIZE,
        };
        let input_name = session.inputs[0].name.clone();
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| WasteSortError::model("detector output lookup", "model declares no outputs"))?;

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            input_name,
            output_name,
            confidence_threshold,
            iou_threshold,
            max_detections,
        })
    }

    fn decode(&self, output: ArrayViewD<f32>, placement: &Letterbox) -> Result<Vec<RawDetection>> {
        let output = output.index_axis_move(Axis(0), 0).into_dimensionality::<Ix2>()?;
        // rows are attributes unless the export transposed them
        let output = if output.nrows() > output.ncols() {
            output.reversed_axes()
        } else {
            output
        };
        if output.nrows() <= 4 {
            return Err(WasteSortError::model(
                "detector output decoding",
                format!("expected at least 5 attributes, got {}", output.nrows()),
            ));
        }

        let mut candidates = Vec::new();
        for anchor in output.columns() {
            let Some((class_id, confidence)) = anchor
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if confidence < self.confidence_threshold {
                continue;
            }

            let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
            let (x1, y1) = placement.to_source(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = placement.to_source(cx + w / 2.0, cy + h / 2.0);
            candidates.push(RawDetection::new([x1, y1, x2, y2], confidence, class_id));
        }

        Ok(non_max_suppression(
            candidates,
            self.iou_threshold,
            self.max_detections,
        ))
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
        let (canvas, placement) = letterbox(&image.to_rgb8(), self.input_size, LETTERBOX_FILL);
        let tensor = to_nchw_tensor(&canvas);

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        let output = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        let detections = self.decode(output, &placement)?;
        debug!(count = detections.len(), "detector returned boxes");
        Ok(detections)
    }
}

#[derive(Debug, Clone)]
pub struct OnnxDetectorLoader {
    pub model_path: PathBuf,
    pub device_id: i32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl ModelLoader for OnnxDetectorLoader {
    type Model = YoloDetector;

    fn describe(&self) -> String {
        self.model_path.display().to_string()
    }

    fn load(&self) -> Result<YoloDetector> {
        let session = build_session(&self.model_path, self.device_id)?;
        YoloDetector::new(
            session,
            self.confidence_threshold,
            self.iou_threshold,
            self.max_detections,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FailingLoader, MockLoader, ScriptedDetector};
    use image::{Rgb, RgbImage};

    fn image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([0, 0, 0])))
    }

    #[test]
    fn test_clipping_truncates_instead_of_dropping() {
        assert_eq!(
            BoundingBox::clipped([-10.0, 5.7, 450.0, 299.9], 400, 300),
            Some(BoundingBox {
                x1: 0,
                y1: 5,
                x2: 400,
                y2: 299
            })
        );
    }

    #[test]
    fn test_clipping_collapsed_box_is_dropped() {
        assert_eq!(BoundingBox::clipped([410.0, 0.0, 500.0, 10.0], 400, 300), None);
        assert_eq!(BoundingBox::clipped([10.0, 10.0, 10.5, 20.0], 400, 300), None);
    }

    #[test]
    fn test_bbox_serializes_as_array() {
        let json = serde_json::to_string(&BoundingBox::full_frame(400, 300)).unwrap();
        assert_eq!(json, "[0,0,400,300]");
    }

    #[test]
    fn test_detector_clips_and_keeps_order() {
        let detector = Detector::new(MockLoader::new(ScriptedDetector::new(vec![
            RawDetection::new([100.0, 100.0, 500.0, 350.0], 0.9, 0),
            RawDetection::new([-5.0, -5.0, 50.0, 60.0], 0.5, 1),
            RawDetection::new([900.0, 0.0, 950.0, 10.0], 0.4, 1),
        ])));

        let boxes = detector.detect(&image(400, 300));
        assert_eq!(
            boxes,
            vec![
                BoundingBox {
                    x1: 100,
                    y1: 100,
                    x2: 400,
                    y2: 300
                },
                BoundingBox {
                    x1: 0,
                    y1: 0,
                    x2: 50,
                    y2: 60
                },
            ]
        );
    }

    #[test]
    fn test_unavailable_detector_yields_no_boxes() {
        let detector: Detector<FailingLoader<ScriptedDetector>> = Detector::new(FailingLoader::new());
        assert!(detector.detect(&image(10, 10)).is_empty());

        let detector = Detector::new(MockLoader::new(ScriptedDetector::failing()));
        assert!(detector.detect(&image(10, 10)).is_empty());
    }

    #[test]
    fn test_nms_is_per_class() {
        let detections = vec![
            RawDetection::new([0.0, 0.0, 10.0, 10.0], 0.6, 0),
            RawDetection::new([0.0, 0.0, 10.0, 10.0], 0.8, 1),
            RawDetection::new([1.0, 0.0, 11.0, 10.0], 0.9, 0),
            RawDetection::new([50.0, 50.0, 60.0, 60.0], 0.3, 0),
        ];

        let kept = non_max_suppression(detections, 0.7, 300);
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8, 0.3]);

        let kept = non_max_suppression(kept, 0.7, 2);
        assert_eq!(kept.len(), 2);
    }
}
