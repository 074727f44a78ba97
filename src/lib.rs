pub mod aggregate;
pub mod classifier;
pub mod config;
pub mod crop;
pub mod detector;
pub mod disambiguator;
pub mod errors;
pub mod imageops;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod signature;
pub mod traits;

pub mod mocks;

pub use aggregate::{AggregatedResult, ObjectResult};
pub use classifier::{ClassificationResult, Classifier, DegradeReason, Prediction};
pub use config::{Config, HeuristicThresholds};
pub use crop::{CropArtifact, CropExtractor, TransientFiles};
pub use detector::{BoundingBox, Detector, RawDetection};
pub use disambiguator::Disambiguator;
pub use errors::{Result, WasteSortError};
pub use persist::{JsonlSummaryStore, PersistStatus, RecentEntry, ResultPersister, SummaryRecord};
pub use pipeline::{OnnxPipeline, WastePipeline};
pub use signature::{MaterialSignature, MaterialSignatureExtractor};
pub use traits::*;
