use std::{path::Path, sync::OnceLock};

use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use tracing::{error, info};

use crate::{
    errors::{Result, WasteSortError},
    traits::ModelLoader,
};

/// Opens an ONNX session, preferring TensorRT then CUDA on `device_id` and
/// falling back to the CPU provider when neither is available.
pub fn build_session(model_path: &Path, device_id: i32) -> Result<Session> {
    if !model_path.exists() {
        return Err(WasteSortError::FileSystem {
            path: model_path.to_path_buf(),
            operation: "model artifact lookup".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "model file not found"),
        });
    }

    SessionBuilder::new()
        .map_err(|e| WasteSortError::Model {
            operation: "session builder initialization".to_string(),
            source: Box::new(e),
        })?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ])
        .map_err(|e| WasteSortError::Model {
            operation: "execution provider registration".to_string(),
            source: Box::new(e),
        })?
        .with_memory_pattern(true)
        .map_err(|e| WasteSortError::Model {
            operation: "memory pattern setup".to_string(),
            source: Box::new(e),
        })?
        .commit_from_file(model_path)
        .map_err(|e| WasteSortError::Model {
            operation: format!("model load: {}", model_path.display()),
            source: Box::new(e),
        })
}

/// Dimensions of the first model input; dynamic axes are reported as -1.
pub fn input_dimensions(session: &Session) -> Result<Vec<i64>> {
    let input = session
        .inputs
        .first()
        .ok_or_else(|| WasteSortError::model("model input lookup", "model declares no inputs"))?;
    let shape = input
        .input_type
        .tensor_shape()
        .ok_or_else(|| WasteSortError::model("model input shape lookup", "input is not a tensor"))?;
    Ok(shape.iter().copied().collect())
}

/// Process-wide model slot that runs its loader at most once.
///
/// Concurrent first callers block on the same initialization; a failed load
/// is remembered, so every later call sees `None` without retrying.
pub struct LazyModel<L: ModelLoader> {
    loader: L,
    slot: OnceLock<Option<L::Model>>,
}

impl<L: ModelLoader> LazyModel<L> {
    pub const fn new(loader: L) -> Self {
        Self {
            loader,
            slot: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Option<&L::Model> {
        self.slot
            .get_or_init(|| match self.loader.load() {
                Ok(model) => {
                    info!(model = %self.loader.describe(), "model loaded");
                    Some(model)
                }
                Err(e) => {
                    error!(model = %self.loader.describe(), error = %e, "model load failed");
                    None
                }
            })
            .as_ref()
    }

    /// `None` until the first `get`
    pub fn is_loaded(&self) -> Option<bool> {
        self.slot.get().map(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
        succeed: bool,
    }

    impl ModelLoader for CountingLoader {
        type Model = u32;

        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn load(&self) -> Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            if self.succeed {
                Ok(7)
            } else {
                Err(WasteSortError::model("load", "boom"))
            }
        }
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = Arc::new(LazyModel::new(CountingLoader {
            calls: Arc::clone(&calls),
            succeed: true,
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = Arc::clone(&lazy);
                std::thread::spawn(move || lazy.get().copied())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.is_loaded(), Some(true));
    }

    #[test]
    fn test_failed_load_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = LazyModel::new(CountingLoader {
            calls: Arc::clone(&calls),
            succeed: false,
        });

        assert_eq!(lazy.is_loaded(), None);
        for _ in 0..3 {
            assert!(lazy.get().is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.is_loaded(), Some(false));
    }

    #[test]
    fn test_missing_model_file() {
        let err = build_session(Path::new("/nonexistent/model.onnx"), 0).unwrap_err();
        assert!(matches!(err, WasteSortError::FileSystem { .. }));
    }
}
