use std::{collections::VecDeque, marker::PhantomData, sync::Arc};

use image::DynamicImage;
use parking_lot::Mutex;

use crate::classifier::ClassificationResult;
use crate::detector::RawDetection;
use crate::errors::{Result, WasteSortError};
use crate::persist::SummaryRecord;
use crate::traits::{MaterialClassifier, ModelLoader, ObjectDetector, SummaryStore};

/// Loader handing out clones of a ready-made model
#[derive(Debug, Clone)]
pub struct MockLoader<M> {
    model: M,
}

impl<M> MockLoader<M> {
    pub const fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M: Clone + Send + Sync> ModelLoader for MockLoader<M> {
    type Model = M;

    fn describe(&self) -> String {
        "mock model".to_string()
    }

    fn load(&self) -> Result<M> {
        Ok(self.model.clone())
    }
}

/// Loader that always fails, as with a missing model artifact
pub struct FailingLoader<M> {
    _model: PhantomData<fn() -> M>,
}

impl<M> FailingLoader<M> {
    pub const fn new() -> Self {
        Self {
            _model: PhantomData,
        }
    }
}

impl<M> Default for FailingLoader<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + Sync> ModelLoader for FailingLoader<M> {
    type Model = M;

    fn describe(&self) -> String {
        "missing model".to_string()
    }

    fn load(&self) -> Result<M> {
        Err(WasteSortError::model("model load", "artifact not found"))
    }
}

/// Detector returning a fixed list of boxes for every image
#[derive(Debug, Clone)]
pub struct ScriptedDetector {
    detections: Option<Vec<RawDetection>>,
}

impl ScriptedDetector {
    pub const fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections: Some(detections),
        }
    }

    /// Boxes given as integer `[x1, y1, x2, y2]`
    pub fn boxes(boxes: &[[u32; 4]]) -> Self {
        Self::new(
            boxes
                .iter()
                .map(|b| RawDetection::new(b.map(|v| v as f32), 0.9, 0))
                .collect(),
        )
    }

    pub const fn failing() -> Self {
        Self { detections: None }
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
        self.detections
            .clone()
            .ok_or_else(|| WasteSortError::model("detection", "scripted failure"))
    }
}

#[derive(Debug, Clone)]
enum Script {
    Constant(ClassificationResult),
    Sequence(Arc<Mutex<VecDeque<Result<ClassificationResult>>>>),
    Fail,
}

/// Classifier answering from a script.
///
/// Clones share the same sequence, so a cloned instance handed out by a
/// loader keeps consuming the original queue.
#[derive(Debug, Clone)]
pub struct ScriptedClassifier {
    script: Script,
}

impl ScriptedClassifier {
    pub fn constant(label: &str, confidence: f32) -> Self {
        Self {
            script: Script::Constant(ClassificationResult::new(label, confidence)),
        }
    }

    /// Answers in order; once exhausted, every call fails
    pub fn sequence(results: Vec<(&str, f32)>) -> Self {
        let queue = results
            .into_iter()
            .map(|(label, confidence)| Ok(ClassificationResult::new(label, confidence)))
            .collect();
        Self {
            script: Script::Sequence(Arc::new(Mutex::new(queue))),
        }
    }

    /// Like `sequence`, with `None` entries failing
    pub fn sequence_with_failures(results: Vec<Option<(&str, f32)>>) -> Self {
        let queue = results
            .into_iter()
            .map(|entry| match entry {
                Some((label, confidence)) => Ok(ClassificationResult::new(label, confidence)),
                None => Err(WasteSortError::model("inference", "scripted failure")),
            })
            .collect();
        Self {
            script: Script::Sequence(Arc::new(Mutex::new(queue))),
        }
    }

    pub const fn failing() -> Self {
        Self {
            script: Script::Fail,
        }
    }
}

impl MaterialClassifier for ScriptedClassifier {
    fn classify(&self, _image: &DynamicImage) -> Result<ClassificationResult> {
        match &self.script {
            Script::Constant(result) => Ok(result.clone()),
            Script::Sequence(queue) => queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(WasteSortError::model("inference", "script exhausted"))),
            Script::Fail => Err(WasteSortError::model("inference", "scripted failure")),
        }
    }
}

/// In-memory summary store
#[derive(Debug, Default)]
pub struct MemorySummaryStore {
    records: Mutex<Vec<SummaryRecord>>,
}

impl MemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SummaryRecord> {
        self.records.lock().clone()
    }
}

impl SummaryStore for MemorySummaryStore {
    fn insert(&self, record: &SummaryRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn delete_by_filename(&self, filename: &str) -> Result<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.filename != filename);
        Ok(before - records.len())
    }

    fn recent(&self, limit: usize) -> Result<Vec<SummaryRecord>> {
        let mut records = self.records.lock().clone();
        records.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
        records.truncate(limit);
        Ok(records)
    }
}

/// Store that is always unreachable
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

impl SummaryStore for FailingStore {
    fn insert(&self, _record: &SummaryRecord) -> Result<()> {
        Err(WasteSortError::persistence("summary insert", "store unreachable"))
    }

    fn delete_by_filename(&self, _filename: &str) -> Result<usize> {
        Err(WasteSortError::persistence("summary delete", "store unreachable"))
    }

    fn recent(&self, _limit: usize) -> Result<Vec<SummaryRecord>> {
        Err(WasteSortError::persistence("summary query", "store unreachable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn blank() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
    }

    #[test]
    fn test_sequence_is_shared_between_clones() -> Result<()> {
        let classifier = ScriptedClassifier::sequence(vec![("plastic", 0.9), ("metal", 0.8)]);
        let clone = classifier.clone();

        assert_eq!(classifier.classify(&blank())?.label, "plastic");
        assert_eq!(clone.classify(&blank())?.label, "metal");
        assert!(classifier.classify(&blank()).is_err());
        Ok(())
    }

    #[test]
    fn test_scripted_detector_boxes() -> Result<()> {
        let detector = ScriptedDetector::boxes(&[[0, 0, 100, 100]]);
        let detections = detector.detect(&blank())?;
        assert_eq!(detections[0].bbox, [0.0, 0.0, 100.0, 100.0]);
        assert!(ScriptedDetector::failing().detect(&blank()).is_err());
        Ok(())
    }
}
