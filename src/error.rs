//! Error taxonomy for the extraction core.
//!
//! Transport failures are classified by `ApiError` and absorbed by the retry loop up to its budget.
//! Everything else is surfaced per endpoint so one failing endpoint never corrupts its siblings.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by an `ExportApi` implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Network hiccup, throttling, 5xx: worth retrying.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// The remote refused the request (bad query, unknown job). Never retried.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("malformed export query: {0}")]
    Malformed(String),
    #[error("export query rejected by remote: {0}")]
    Rejected(String),
    #[error("export submission failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
    #[error("export submission canceled")]
    Canceled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("export job {job_id} failed: {message}")]
    Failed { job_id: String, message: String },
    #[error("export job {job_id} was canceled remotely: {message}")]
    RemoteCanceled { job_id: String, message: String },
    #[error("export job {job_id} still running after {elapsed:?}")]
    Timeout { job_id: String, elapsed: Duration },
    #[error("waiting for export job {job_id} was canceled")]
    Canceled { job_id: String },
    #[error("status checks for export job {job_id} failed after {attempts} attempts: {last}")]
    RetriesExhausted { job_id: String, attempts: usize, last: String },
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot open export result {location}: {message}")]
    Open { location: String, message: String },
    #[error("opening export result {location} failed after {attempts} attempts: {last}")]
    RetriesExhausted { location: String, attempts: usize, last: String },
    #[error("export result stream interrupted after line {line}: {source}")]
    Interrupted {
        line: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("reading export result was canceled")]
    Canceled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReconstructError {
    #[error("line {line}: not a JSON object record: {message}")]
    Decode { line: u64, message: String },
    #[error("line {line}: cannot determine record type")]
    Unclassified { line: u64 },
    #[error("orphan {table} record {id:?}: parent {parent_id} has not been seen")]
    Orphan { table: String, id: Option<String>, parent_id: String },
    #[error("{table} records reference parents in both {first} and {second}")]
    ParentConflict { table: String, first: String, second: String },
}

/// Which key a row was missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Primary,
    Foreign,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyKind::Primary => f.write_str("primary"),
            KeyKind::Foreign => f.write_str("foreign"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MaterializeError {
    #[error("table {table}: row {row} has no {key} key")]
    MissingKey { table: String, key: KeyKind, row: u64 },
    #[error("table {table}: spill file error: {message}")]
    Spill { table: String, message: String },
    #[error("no records were appended to table {0}")]
    UnknownTable(String),
}

/// Everything that can end one endpoint's pipeline.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),
    #[error("strict mode: {0}")]
    StrictTableFailure(MaterializeError),
    #[error("endpoint {0} canceled")]
    Canceled(String),
    #[error("sink rejected table {table}: {source:#}")]
    Sink {
        table: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("raw archive: {0:#}")]
    Archive(anyhow::Error),
    #[error("work directory {path}: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
