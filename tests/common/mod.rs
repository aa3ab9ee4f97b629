#![allow(dead_code)]

use bulketl::{
    ApiError, BulkExtractor, ExportApi, JobStatus, JobStatusReport, PollSchedule, ResultLocation, RetryPolicy,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the fake remote does for one query.
#[derive(Clone, Debug)]
pub struct Script {
    /// Errors returned by the first submissions, in order.
    pub submit_errors: VecDeque<ApiError>,
    /// Answers to the first status checks, in order.
    pub statuses: VecDeque<Result<JobStatusReport, ApiError>>,
    /// Answer once `statuses` is drained.
    pub settle: JobStatusReport,
    pub lines: Vec<String>,
    /// Serve only this many lines, then fail the read like a dropped connection.
    pub interrupt_after: Option<usize>,
}

impl Script {
    /// Completes on the first poll with `lines` as the result file.
    pub fn completed(lines: Vec<String>) -> Self {
        let n = lines.len() as u64;
        Self {
            submit_errors: VecDeque::new(),
            statuses: VecDeque::new(),
            settle: JobStatusReport::completed("pending", n),
            lines,
            interrupt_after: None,
        }
    }

    /// Completes with no result file at all.
    pub fn completed_empty() -> Self {
        Self { settle: JobStatusReport::completed_empty(), ..Self::completed(Vec::new()) }
    }

    /// Never leaves RUNNING.
    pub fn running_forever() -> Self {
        Self { settle: JobStatusReport::running(), ..Self::completed(Vec::new()) }
    }

    pub fn ending_with(status: JobStatus, error_code: &str) -> Self {
        Self { settle: JobStatusReport::failed(status, error_code), ..Self::completed(Vec::new()) }
    }

    pub fn after_polls(mut self, statuses: Vec<Result<JobStatusReport, ApiError>>) -> Self {
        self.statuses = statuses.into();
        self
    }

    pub fn failing_submit(mut self, errors: Vec<ApiError>) -> Self {
        self.submit_errors = errors.into();
        self
    }

    pub fn interrupted_after(mut self, lines: usize) -> Self {
        self.interrupt_after = Some(lines);
        self
    }
}

/// Yields `data`, then fails every further read with a connection reset.
pub struct InterruptedReader {
    data: Cursor<Vec<u8>>,
}

impl InterruptedReader {
    pub fn new(lines: &[String]) -> Self {
        let mut body = lines.join("\n");
        if !lines.is_empty() {
            body.push('\n');
        }
        Self { data: Cursor::new(body.into_bytes()) }
    }
}

impl Read for InterruptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")),
            n => Ok(n),
        }
    }
}

/// In-memory `ExportApi` keyed by query text. Counts every remote call.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, Script>>,
    jobs: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    submits: AtomicU64,
    polls: AtomicU64,
    cancels: AtomicU64,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(self, query: &str, mut script: Script) -> Self {
        if script.settle.status == JobStatus::Completed && script.settle.url.is_some() {
            script.settle.url = Some(format!("mem://{query}"));
        }
        self.scripts.lock().unwrap().insert(query.to_string(), script);
        self
    }

    pub fn submits(&self) -> u64 {
        self.submits.load(Ordering::SeqCst)
    }
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
    pub fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl ExportApi for ScriptedApi {
    fn submit(&self, query: &str) -> Result<String, ApiError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(query)
            .ok_or_else(|| ApiError::Rejected(format!("unknown query {query}")))?;
        if let Some(err) = script.submit_errors.pop_front() {
            return Err(err);
        }
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.jobs.lock().unwrap().insert(id.clone(), query.to_string());
        Ok(id)
    }

    fn poll(&self, job_id: &str) -> Result<JobStatusReport, ApiError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let query = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ApiError::Rejected(format!("unknown job {job_id}")))?;
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(&query).unwrap();
        script.statuses.pop_front().unwrap_or_else(|| Ok(script.settle.clone()))
    }

    fn cancel(&self, _job_id: &str) -> Result<(), ApiError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_result(&self, location: &ResultLocation) -> Result<Box<dyn BufRead + Send>, ApiError> {
        let url = location.url.clone().unwrap_or_default();
        let query = url
            .strip_prefix("mem://")
            .ok_or_else(|| ApiError::Rejected(format!("bad location {url}")))?;
        let scripts = self.scripts.lock().unwrap();
        let script = scripts.get(query).ok_or_else(|| ApiError::Rejected(format!("nothing at {url}")))?;
        if let Some(n) = script.interrupt_after {
            let served = &script.lines[..n.min(script.lines.len())];
            return Ok(Box::new(BufReader::new(InterruptedReader::new(served))));
        }
        let mut body = script.lines.join("\n");
        body.push('\n');
        Ok(Box::new(Cursor::new(body.into_bytes())))
    }
}

/// Millisecond polling and retries so tests never sleep for long.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), 1.0, Duration::from_millis(1))
}

pub fn fast_extractor(work_dir: &Path) -> BulkExtractor {
    BulkExtractor::new()
        .poll(PollSchedule::fixed(Duration::from_millis(2)))
        .max_duration(Duration::from_secs(10))
        .retry(fast_retry())
        .work_dir(work_dir)
        .progress(false)
}

/// Two products, three variants. Variant 12 carries a float inventory literal, and
/// product 2 introduces a timestamp column the first product never had.
pub fn product_export() -> Vec<String> {
    vec![
        json!({"id": "gid://shop/Product/1", "title": "Shirt", "published": true, "price": "10"}).to_string(),
        json!({"id": "gid://shop/ProductVariant/11", "sku": "S-1", "inventory": 5,
               "__parentId": "gid://shop/Product/1"})
        .to_string(),
        json!({"id": "gid://shop/ProductVariant/12", "sku": "S-2", "inventory": "7.5",
               "__parentId": "gid://shop/Product/1"})
        .to_string(),
        json!({"id": "gid://shop/Product/2", "title": "Hat", "price": "12",
               "createdAt": "2024-01-05T10:00:00Z"})
        .to_string(),
        json!({"id": "gid://shop/ProductVariant/21", "sku": "H-1", "barcode": "007",
               "__parentId": "gid://shop/Product/2"})
        .to_string(),
    ]
}

/// Read a JSONL file into values (skips empty lines).
pub fn read_jsonl_values(path: &Path) -> Vec<serde_json::Value> {
    let f = File::open(path).unwrap();
    BufReader::new(f)
        .lines()
        .map(|l| l.unwrap())
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s).unwrap())
        .collect()
}

/// Write a plain `.jsonl` export file.
pub fn write_jsonl_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(path, body).unwrap();
}

/// Files left in `dir` (non-recursive), sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let Ok(rd) = fs::read_dir(dir) else { return Vec::new() };
    let mut v: Vec<String> = rd.flatten().map(|e| e.file_name().to_string_lossy().into_owned()).collect();
    v.sort();
    v
}
