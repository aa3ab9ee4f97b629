//! Result stream reader: a lazy, single-pass sequence of raw record lines.

use crate::api::{ExportApi, ResultLocation};
use crate::cancel::CancelToken;
use crate::error::{ApiError, StreamError};
use crate::retry::{retry_transient, RetryError, RetryPolicy};
use std::io::BufRead;

/// Pulls one line at a time from an export result. Blank lines are skipped and `\r?\n` stripped.
/// After a read failure the error is yielded once and the stream ends.
pub struct RecordLines {
    rdr: Box<dyn BufRead + Send>,
    buf: String,
    lines: u64,
    bytes: u64,
    done: bool,
}

impl RecordLines {
    pub fn from_reader(rdr: Box<dyn BufRead + Send>) -> Self {
        Self { rdr, buf: String::with_capacity(16 * 1024), lines: 0, bytes: 0, done: false }
    }

    pub fn empty() -> Self {
        Self::from_reader(Box::new(std::io::empty()))
    }

    /// Non-blank lines yielded so far.
    pub fn lines_read(&self) -> u64 {
        self.lines
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl Iterator for RecordLines {
    type Item = Result<String, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.rdr.read_line(&mut self.buf) {
                Ok(0) => self.done = true,
                Ok(n) => {
                    self.bytes += n as u64;
                    let line = self.buf.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.lines += 1;
                    return Some(Ok(line.to_string()));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(StreamError::Interrupted { line: self.lines, source: e }));
                }
            }
        }
        None
    }
}

/// Open a completed job's result, retrying transient transport failures.
pub fn open_result_stream<A: ExportApi + ?Sized>(
    api: &A,
    location: &ResultLocation,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<RecordLines, StreamError> {
    if location.is_empty() {
        return Ok(RecordLines::empty());
    }
    let rdr = retry_transient(retry, cancel, "open export result", ApiError::is_transient, || {
        api.open_result(location)
    })
    .map_err(|e| match e {
        RetryError::Fatal(err) => StreamError::Open { location: location.to_string(), message: err.to_string() },
        RetryError::Exhausted { attempts, last } => {
            StreamError::RetriesExhausted { location: location.to_string(), attempts, last: last.to_string() }
        }
        RetryError::Canceled => StreamError::Canceled,
    })?;
    tracing::info!("Reading export result from {location}");
    Ok(RecordLines::from_reader(rdr))
}
