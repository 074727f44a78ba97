use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the waste classification pipeline.
///
/// # Which variants abort a request
///
/// Only `Decode` on the upload stops a request. Crop writes, model,
/// persistence and cleanup problems are absorbed by the services that own
/// them and surface as degraded values or log lines instead.
#[derive(Error, Debug)]
pub enum WasteSortError {
    #[error("Decode error: could not read image {path:?}")]
    Decode {
        path: PathBuf,
        #[source]
        source: BoxedSource,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Persistence error: {operation} failed")]
    Persistence {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WasteSortError>;

impl WasteSortError {
    pub fn decode(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Decode {
            path: path.into(),
            source: Box::new(source),
        }
    }

    pub fn model(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Model {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub fn persistence(operation: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

/// Convert anyhow errors to configuration errors.
///
/// # Why this conversion exists
///
/// Some helpers used while wiring the CLI return anyhow::Error. They only ever
/// fail while assembling configuration, so the message is kept and the chain
/// is flattened into a `Configuration` variant.
impl From<anyhow::Error> for WasteSortError {
    fn from(err: anyhow::Error) -> Self {
        WasteSortError::Configuration {
            message: format!("{err:#}"),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build `FileSystem` directly;
/// this is the fallback for the few places that don't.
impl From<std::io::Error> for WasteSortError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Image crate errors without a path are decode failures of an in-memory buffer.
impl From<image::ImageError> for WasteSortError {
    fn from(err: image::ImageError) -> Self {
        Self::decode("unknown", err)
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for WasteSortError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors only happen while reshaping model outputs.
impl From<ndarray::ShapeError> for WasteSortError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for WasteSortError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence {
            operation: "json serialization".to_string(),
            source: Box::new(err),
        }
    }
}
