use crate::classifier::ClassificationResult;
use crate::detector::RawDetection;
use crate::errors::Result;
use crate::persist::SummaryRecord;
use image::DynamicImage;

/// Object localization back-end.
///
/// Boxes come back in source-image pixel coordinates, unclipped, in the order
/// the back-end ranks them. Clipping and the whole-image policy belong to
/// `Detector`, not to implementations of this trait.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>>;
}

/// Material classification back-end.
pub trait MaterialClassifier: Send + Sync {
    fn classify(&self, image: &DynamicImage) -> Result<ClassificationResult>;
}

/// Builds a model back-end. Called at most once per `LazyModel`.
pub trait ModelLoader: Send + Sync {
    type Model: Send + Sync;

    /// Human-readable description for logs, usually the artifact path
    fn describe(&self) -> String;

    fn load(&self) -> Result<Self::Model>;
}

/// External store for per-request summary records.
pub trait SummaryStore: Send + Sync {
    fn insert(&self, record: &SummaryRecord) -> Result<()>;

    /// Returns how many records were removed
    fn delete_by_filename(&self, filename: &str) -> Result<usize>;

    /// Newest first
    fn recent(&self, limit: usize) -> Result<Vec<SummaryRecord>>;
}

impl<T: SummaryStore + ?Sized> SummaryStore for std::sync::Arc<T> {
    fn insert(&self, record: &SummaryRecord) -> Result<()> {
        (**self).insert(record)
    }

    fn delete_by_filename(&self, filename: &str) -> Result<usize> {
        (**self).delete_by_filename(filename)
    }

    fn recent(&self, limit: usize) -> Result<Vec<SummaryRecord>> {
        (**self).recent(limit)
    }
}
