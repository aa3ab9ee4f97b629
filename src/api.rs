//! Remote export API boundary, plus a local replay implementation over saved export files.

use crate::error::ApiError;
use crate::util::open_with_backoff;
use ahash::AHashMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use walkdir::WalkDir;
use zstd::stream::read::Decoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Created | JobStatus::Running)
    }
}

/// One answer to a status check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub object_count: Option<u64>,
}

impl JobStatusReport {
    pub fn running() -> Self {
        Self { status: JobStatus::Running, url: None, error_code: None, object_count: None }
    }
    pub fn completed(url: impl Into<String>, object_count: u64) -> Self {
        Self { status: JobStatus::Completed, url: Some(url.into()), error_code: None, object_count: Some(object_count) }
    }
    /// Completed without a result file: the query matched nothing.
    pub fn completed_empty() -> Self {
        Self { status: JobStatus::Completed, url: None, error_code: None, object_count: Some(0) }
    }
    pub fn failed(status: JobStatus, error_code: impl Into<String>) -> Self {
        Self { status, url: None, error_code: Some(error_code.into()), object_count: None }
    }
}

/// Where a completed job's records can be read from. No URL means an empty result set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLocation {
    pub url: Option<String>,
    pub object_count: u64,
}

impl ResultLocation {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
    }
}

impl std::fmt::Display for ResultLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.url {
            Some(u) => f.write_str(u),
            None => f.write_str("<empty result>"),
        }
    }
}

/// The asynchronous bulk-export service. Implementations own transport and credentials.
pub trait ExportApi: Send + Sync {
    /// Start an export job; returns the remote job id.
    fn submit(&self, query: &str) -> Result<String, ApiError>;
    fn poll(&self, job_id: &str) -> Result<JobStatusReport, ApiError>;
    fn cancel(&self, job_id: &str) -> Result<(), ApiError>;
    /// Open the newline-delimited result of a completed job.
    fn open_result(&self, location: &ResultLocation) -> Result<Box<dyn BufRead + Send>, ApiError>;
}

fn export_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)\.jsonl(\.zst)?$").expect("static regex"))
}

/// Serves previously saved exports (`<name>.jsonl` or `<name>.jsonl.zst`) found under a directory.
/// The submitted query is the export's name; jobs complete immediately.
pub struct ReplayApi {
    exports: AHashMap<String, PathBuf>,
    jobs: Mutex<AHashMap<String, PathBuf>>,
    next_id: AtomicU64,
    read_buf_bytes: usize,
}

impl ReplayApi {
    pub fn open(dir: &Path) -> Self {
        let mut exports = AHashMap::new();
        if dir.exists() {
            for ent in WalkDir::new(dir).min_depth(1).into_iter().flatten() {
                if !ent.file_type().is_file() {
                    continue;
                }
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(caps) = export_file_re().captures(name) {
                        exports.insert(caps[1].to_string(), ent.path().to_path_buf());
                    }
                }
            }
        }
        tracing::info!("Replay source {} holds {} saved exports", dir.display(), exports.len());
        Self { exports, jobs: Mutex::new(AHashMap::new()), next_id: AtomicU64::new(1), read_buf_bytes: 256 * 1024 }
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buf_bytes = bytes.max(8 * 1024);
        self
    }

    pub fn export_names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.exports.keys().cloned().collect();
        v.sort();
        v
    }
}

impl ExportApi for ReplayApi {
    fn submit(&self, query: &str) -> Result<String, ApiError> {
        let name = query.trim();
        let path = self
            .exports
            .get(name)
            .ok_or_else(|| ApiError::Rejected(format!("no saved export named {name:?}")))?;
        let id = format!("replay-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.jobs.lock().insert(id.clone(), path.clone());
        Ok(id)
    }

    fn poll(&self, job_id: &str) -> Result<JobStatusReport, ApiError> {
        let jobs = self.jobs.lock();
        let path = jobs.get(job_id).ok_or_else(|| ApiError::Rejected(format!("unknown job {job_id}")))?;
        Ok(JobStatusReport {
            status: JobStatus::Completed,
            url: Some(path.display().to_string()),
            error_code: None,
            object_count: None,
        })
    }

    fn cancel(&self, _job_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn open_result(&self, location: &ResultLocation) -> Result<Box<dyn BufRead + Send>, ApiError> {
        let Some(url) = location.url.as_deref() else {
            return Ok(Box::new(std::io::empty()));
        };
        let path = Path::new(url);
        let file = open_with_backoff(path, 16, 50).map_err(|e| ApiError::Rejected(format!("open {url}: {e}")))?;
        if url.ends_with(".zst") {
            let mut decoder = Decoder::new(file).map_err(|e| ApiError::Rejected(format!("zstd {url}: {e}")))?;
            decoder.window_log_max(31).map_err(|e| ApiError::Rejected(format!("zstd {url}: {e}")))?;
            Ok(Box::new(BufReader::with_capacity(self.read_buf_bytes, decoder)))
        } else {
            Ok(Box::new(BufReader::with_capacity(self.read_buf_bytes, file)))
        }
    }
}
