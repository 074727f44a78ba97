use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
};

use image::{codecs::jpeg::JpegEncoder, DynamicImage};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    detector::BoundingBox,
    errors::{Result, WasteSortError},
};

/// Request-scoped set of transient files.
///
/// Every tracked path is removed exactly once: on `cleanup` or, failing
/// that, when the scope is dropped, whichever path the request exits by.
/// Removal failures are logged and otherwise ignored.
#[derive(Debug, Default)]
pub struct TransientFiles {
    paths: Vec<PathBuf>,
}

impl TransientFiles {
    pub const fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Deletes every tracked path; returns how many were actually removed.
    pub fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for path in self.paths.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed transient file");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "transient file already gone");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to delete transient file");
                }
            }
        }
        removed
    }
}

impl Drop for TransientFiles {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A crop written to transient storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CropArtifact {
    pub bbox: BoundingBox,
    pub path: PathBuf,
}

impl CropArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Materializes bounding boxes as uniquely named JPEG files.
#[derive(Debug, Clone)]
pub struct CropExtractor {
    directory: PathBuf,
    quality: u8,
}

impl CropExtractor {
    pub fn new(directory: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            directory: directory.into(),
            quality,
        }
    }

    fn unique_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}_crop.jpg", Uuid::new_v4().simple()))
    }

    /// Copies the `bbox` region of `image` to a new file tracked by `files`.
    ///
    /// `bbox` must already satisfy the clipping invariant for `image`.
    pub fn extract(
        &self,
        image: &DynamicImage,
        bbox: BoundingBox,
        files: &mut TransientFiles,
    ) -> Result<CropArtifact> {
        let crop = image.crop_imm(bbox.x1, bbox.y1, bbox.width(), bbox.height());

        fs::create_dir_all(&self.directory).map_err(|e| WasteSortError::FileSystem {
            path: self.directory.clone(),
            operation: "transient directory creation".to_string(),
            source: e,
        })?;

        let path = self.unique_path();
        // tracked before the write so a partial file is cleaned up too
        files.track(&path);

        let file = File::create(&path).map_err(|e| WasteSortError::FileSystem {
            path: path.clone(),
            operation: "crop file creation".to_string(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.quality)
            .encode_image(&crop.to_rgb8())
            .map_err(|e| WasteSortError::FileSystem {
                path: path.clone(),
                operation: "crop encoding".to_string(),
                source: std::io::Error::other(e),
            })?;
        writer.flush().map_err(|e| WasteSortError::FileSystem {
            path: path.clone(),
            operation: "crop flush".to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), ?bbox, "crop written");
        Ok(CropArtifact { bbox, path })
    }
}
