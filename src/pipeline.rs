use std::{fs, path::Path};

use image::GenericImageView;
use tracing::{debug, info, warn};

use crate::{
    aggregate::{aggregate, AggregatedResult, ObjectResult},
    classifier::{ClassificationResult, Classifier, OnnxClassifierLoader},
    config::Config,
    crop::{CropExtractor, TransientFiles},
    detector::{BoundingBox, Detector, OnnxDetectorLoader},
    disambiguator::Disambiguator,
    errors::{Result, WasteSortError},
    persist::{JsonlSummaryStore, PersistStatus, RecentEntry, ResultPersister, SummaryRecord},
    signature::MaterialSignatureExtractor,
    traits::{MaterialClassifier, ModelLoader, ObjectDetector, SummaryStore},
};

/// Detection needs at least this many boxes before objects are cropped;
/// below it the whole image is one object.
pub const MIN_BOXES_FOR_CROPPING: usize = 2;

/// Per-request detect → crop → classify → correct → aggregate pipeline.
///
/// Model services are shared by every request run through the same
/// pipeline and load on first use. Requests are independent and may run
/// concurrently; each one owns its crops and deletes them before returning.
pub struct WastePipeline<D, C, S>
where
    D: ModelLoader,
    D::Model: ObjectDetector,
    C: ModelLoader,
    C::Model: MaterialClassifier,
    S: SummaryStore,
{
    detector: Detector<D>,
    classifier: Classifier<C>,
    signatures: MaterialSignatureExtractor,
    disambiguator: Disambiguator,
    persister: ResultPersister<S>,
    config: Config,
}

pub type OnnxPipeline = WastePipeline<OnnxDetectorLoader, OnnxClassifierLoader, JsonlSummaryStore>;

impl OnnxPipeline {
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let detector = OnnxDetectorLoader {
            model_path: config.detector_model.clone(),
            device_id: config.device_id,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        };
        let classifier = OnnxClassifierLoader {
            model_path: config.classifier_model.clone(),
            label_map_path: config.label_map.clone(),
            device_id: config.device_id,
            fallback_input_size: config.classifier_input_size,
        };
        let store = JsonlSummaryStore::new(config.store_path.clone());
        Ok(Self::new(detector, classifier, store, config))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl<D, C, S> WastePipeline<D, C, S>
where
    D: ModelLoader,
    D::Model: ObjectDetector,
    C: ModelLoader,
    C::Model: MaterialClassifier,
    S: SummaryStore,
{
    pub fn new(detector: D, classifier: C, store: S, config: Config) -> Self {
        Self {
            detector: Detector::new(detector),
            classifier: Classifier::new(classifier),
            signatures: MaterialSignatureExtractor::new(&config.thresholds),
            disambiguator: Disambiguator::new(config.thresholds.clone()),
            persister: ResultPersister::new(store),
            config,
        }
    }

    /// `true` once the classifier failed to load and answers `trash` forever
    pub fn classifier_degraded(&self) -> bool {
        self.classifier.is_degraded()
    }

    /// Classifies the stored upload at `image_path`, writing crops under
    /// `transient_dir`.
    ///
    /// Fails only when the upload cannot be decoded; the caller owns
    /// discarding the upload in that case. A crop that cannot be written
    /// degrades its object to `{trash, 0.3}` with `crop_url` pointing at the
    /// upload. Crops are gone by the time this returns, on every path.
    pub fn classify(&self, image_path: &Path, transient_dir: &Path) -> Result<AggregatedResult> {
        let mut files = TransientFiles::new();
        let outcome = self.run(image_path, transient_dir, &mut files);
        let created = files.len();
        let removed = files.cleanup();
        debug!(created, removed, "transient crops cleaned up");

        let result = outcome?;
        let summary = SummaryRecord::from_result(&file_name(image_path), &result);
        if let PersistStatus::Failed(reason) = self.persister.persist(summary) {
            debug!(%reason, "continuing without a stored summary");
        }

        info!(
            image = %image_path.display(),
            objects = result.objects.len(),
            "classification finished"
        );
        Ok(result)
    }

    fn run(
        &self,
        image_path: &Path,
        transient_dir: &Path,
        files: &mut TransientFiles,
    ) -> Result<AggregatedResult> {
        let image = image::open(image_path).map_err(|e| WasteSortError::decode(image_path, e))?;
        let (width, height) = image.dimensions();
        let image_url = self.config.public_url(&file_name(image_path));

        let boxes = self.detector.detect(&image);
        debug!(boxes = boxes.len(), width, height, "detection done");

        let objects = if boxes.len() < MIN_BOXES_FOR_CROPPING {
            vec![ObjectResult::new(
                BoundingBox::full_frame(width, height),
                self.classify_file(image_path),
                image_url.clone(),
            )]
        } else {
            let extractor = CropExtractor::new(transient_dir, self.config.crop_quality);
            boxes
                .into_iter()
                .map(|bbox| match extractor.extract(&image, bbox, files) {
                    Ok(crop) => ObjectResult::new(
                        bbox,
                        self.classify_file(&crop.path),
                        self.config.public_url(&crop.file_name()),
                    ),
                    Err(e) => {
                        warn!(?bbox, error = %e, "crop not written, using degraded result");
                        ObjectResult::new(bbox, ClassificationResult::degraded(), image_url.clone())
                    }
                })
                .collect()
        };

        Ok(aggregate(objects, image_url))
    }

    fn classify_file(&self, path: &Path) -> ClassificationResult {
        let prediction = self.classifier.predict_path(path);
        if prediction.is_degraded() {
            return prediction.into_result();
        }
        match self.signatures.signature_of_file(path) {
            Ok(signature) => self.disambiguator.correct(prediction.into_result(), &signature),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "no material signature, keeping prediction");
                prediction.into_result()
            }
        }
    }

    /// Deletes an upload and, best-effort, its stored summaries.
    pub fn forget(&self, filename: &str, upload_dir: &Path) -> Result<usize> {
        let path = upload_dir.join(filename);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "upload already absent");
            }
            Err(e) => {
                return Err(WasteSortError::FileSystem {
                    path,
                    operation: "upload deletion".to_string(),
                    source: e,
                })
            }
        }
        Ok(self.persister.forget(filename))
    }

    /// Most recent summaries; an unreachable store yields an empty list.
    pub fn recent(&self, limit: usize) -> Vec<RecentEntry> {
        match self.persister.store().recent(limit) {
            Ok(records) => records
                .into_iter()
                .map(|record| RecentEntry {
                    image_url: self.config.public_url(&record.filename),
                    record,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "summary query failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FailingStore, MemorySummaryStore, MockLoader, ScriptedClassifier, ScriptedDetector};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_shiny_plastic_is_reported_as_metal() -> Result<()> {
        let dir = TempDir::new()?;
        let upload = dir.path().join("shiny.png");
        // alternating white/black stripes: bright and high-contrast
        RgbImage::from_fn(60, 60, |x, _| {
            if (x / 6) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
        .save(&upload)?;

        let pipeline = WastePipeline::new(
            MockLoader::new(ScriptedDetector::boxes(&[])),
            MockLoader::new(ScriptedClassifier::constant("plastic", 0.95)),
            MemorySummaryStore::new(),
            Config::default(),
        );

        let result = pipeline.classify(&upload, &dir.path().join("tmp"))?;
        assert_eq!(result.objects[0].label, "metal");
        assert_eq!(result.objects[0].confidence, 0.85);
        assert_eq!(result.percentages.get("metal"), Some(&100.0));
        Ok(())
    }

    #[test]
    fn test_written_crops_are_classified_and_corrected() -> Result<()> {
        let dir = TempDir::new()?;
        let upload = dir.path().join("cans.png");
        // left half flat grey, right half white/black stripes
        RgbImage::from_fn(120, 60, |x, _| {
            if x < 60 {
                Rgb([120, 120, 120])
            } else if (x / 6) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
        .save(&upload)?;
        let transient = dir.path().join("tmp");

        let pipeline = WastePipeline::new(
            MockLoader::new(ScriptedDetector::boxes(&[[0, 0, 60, 60], [60, 0, 120, 60]])),
            MockLoader::new(ScriptedClassifier::constant("plastic", 0.95)),
            MemorySummaryStore::new(),
            Config::default(),
        );

        let result = pipeline.classify(&upload, &transient)?;
        assert_eq!(result.objects[0].label, "plastic");
        assert_eq!(result.objects[0].confidence, 0.95);
        assert_eq!(result.objects[1].label, "metal");
        assert_eq!(result.objects[1].confidence, 0.85);
        assert_eq!(fs::read_dir(&transient)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_recent_with_unreachable_store_is_empty() {
        let pipeline = WastePipeline::new(
            MockLoader::new(ScriptedDetector::boxes(&[])),
            MockLoader::new(ScriptedClassifier::constant("glass", 0.9)),
            FailingStore,
            Config::default(),
        );
        assert!(pipeline.recent(50).is_empty());
    }

    #[test]
    fn test_forget_removes_upload_and_records() -> Result<()> {
        let dir = TempDir::new()?;
        let upload = dir.path().join("a.png");
        RgbImage::from_pixel(8, 8, Rgb([10, 200, 10])).save(&upload)?;

        let pipeline = WastePipeline::new(
            MockLoader::new(ScriptedDetector::boxes(&[])),
            MockLoader::new(ScriptedClassifier::constant("glass", 0.9)),
            MemorySummaryStore::new(),
            Config::default(),
        );
        pipeline.classify(&upload, dir.path())?;

        let recent = pipeline.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].image_url, "/uploads/a.png");

        assert_eq!(pipeline.forget("a.png", dir.path())?, 1);
        assert!(!upload.exists());
        assert!(pipeline.recent(10).is_empty());
        assert_eq!(pipeline.forget("a.png", dir.path())?, 0);
        Ok(())
    }
}
