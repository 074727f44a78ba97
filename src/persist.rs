use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    aggregate::AggregatedResult,
    errors::{Result, WasteSortError},
    traits::SummaryStore,
};

/// One row of the external store, derived from the first object of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub filename: String,
    pub predicted_class: String,
    pub confidence: f32,
    pub upload_date: DateTime<Utc>,
}

impl SummaryRecord {
    /// `None` when the result has no objects.
    pub fn from_result(filename: &str, result: &AggregatedResult) -> Option<Self> {
        result.first().map(|first| Self {
            filename: filename.to_string(),
            predicted_class: first.label.clone(),
            confidence: first.confidence,
            upload_date: Utc::now(),
        })
    }
}

/// A stored record with the URL its upload is served from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEntry {
    #[serde(flatten)]
    pub record: SummaryRecord,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistStatus {
    Stored,
    /// Nothing to summarize
    Skipped,
    Failed(String),
}

/// Best-effort writer in front of a `SummaryStore`.
///
/// Store failures are logged and reported through `PersistStatus`; they never
/// reach the pipeline result.
pub struct ResultPersister<S: SummaryStore> {
    store: S,
}

impl<S: SummaryStore> ResultPersister<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub fn persist(&self, summary: Option<SummaryRecord>) -> PersistStatus {
        let Some(record) = summary else {
            return PersistStatus::Skipped;
        };

        match self.store.insert(&record) {
            Ok(()) => {
                info!(filename = %record.filename, class = %record.predicted_class, "summary stored");
                PersistStatus::Stored
            }
            Err(e) => {
                warn!(filename = %record.filename, error = %e, "summary insert failed");
                PersistStatus::Failed(e.to_string())
            }
        }
    }

    /// Removes the summaries of an upload; failures are logged, not returned.
    pub fn forget(&self, filename: &str) -> usize {
        match self.store.delete_by_filename(filename) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(filename, error = %e, "summary delete failed");
                0
            }
        }
    }
}

/// Summary store kept as one JSON object per line.
pub struct JsonlSummaryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSummaryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<Vec<SummaryRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WasteSortError::persistence("summary store open", e)),
        };

        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| WasteSortError::persistence("summary store read", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = number + 1, error = %e, "skipping malformed summary record"),
            }
        }
        Ok(records)
    }
}

impl SummaryStore for JsonlSummaryStore {
    fn insert(&self, record: &SummaryRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| WasteSortError::persistence("summary store directory creation", e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WasteSortError::persistence("summary store open", e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| WasteSortError::persistence("summary insert", e))
    }

    fn delete_by_filename(&self, filename: &str) -> Result<usize> {
        let _guard = self.lock.lock();
        let records = self.read_all()?;
        let before = records.len();
        let kept: Vec<_> = records
            .into_iter()
            .filter(|r| r.filename != filename)
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut contents = String::new();
        for record in &kept {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        let staging = self.path.with_extension("jsonl.tmp");
        fs::write(&staging, contents)
            .and_then(|()| fs::rename(&staging, &self.path))
            .map_err(|e| WasteSortError::persistence("summary delete", e))?;
        Ok(removed)
    }

    fn recent(&self, limit: usize) -> Result<Vec<SummaryRecord>> {
        let _guard = self.lock.lock();
        let mut records = self.read_all()?;
        records.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
        records.truncate(limit);
        Ok(records)
    }
}
