//! Export job lifecycle: submit, poll until terminal, cache the outcome on the handle.

use crate::api::{ExportApi, JobStatus, JobStatusReport, ResultLocation};
use crate::cancel::{sleep_cancellable, CancelToken};
use crate::config::PollSchedule;
use crate::error::{ApiError, JobError, SubmissionError};
use crate::retry::{retry_transient, RetryError, RetryPolicy};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportJob {
    pub id: String,
    pub query: String,
    pub status: JobStatus,
    pub result: Option<ResultLocation>,
}

/// Caller-held handle. Once the job is terminal the outcome is cached here and
/// `await_completion` returns it without touching the remote again.
#[derive(Clone, Debug)]
pub struct JobHandle {
    job: ExportJob,
    outcome: Option<Result<ResultLocation, JobError>>,
    submitted_at: Instant,
    polls: u64,
}

impl JobHandle {
    pub fn job(&self) -> &ExportJob {
        &self.job
    }
    pub fn id(&self) -> &str {
        &self.job.id
    }
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
    /// Status checks issued so far through this handle.
    pub fn polls(&self) -> u64 {
        self.polls
    }
    pub fn since_submit(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

pub struct JobOrchestrator<'a, A: ExportApi + ?Sized> {
    api: &'a A,
    retry: RetryPolicy,
    cancel_remote_on_timeout: bool,
}

impl<'a, A: ExportApi + ?Sized> JobOrchestrator<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api, retry: RetryPolicy::default(), cancel_remote_on_timeout: false }
    }
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
    pub fn cancel_remote_on_timeout(mut self, yes: bool) -> Self {
        self.cancel_remote_on_timeout = yes;
        self
    }

    pub fn submit(&self, query: &str, cancel: &CancelToken) -> Result<JobHandle, SubmissionError> {
        if query.trim().is_empty() {
            return Err(SubmissionError::Malformed("query is empty".into()));
        }
        let id = retry_transient(&self.retry, cancel, "submit export", ApiError::is_transient, || {
            self.api.submit(query)
        })
        .map_err(|e| match e {
            RetryError::Fatal(ApiError::Rejected(msg)) => SubmissionError::Rejected(msg),
            RetryError::Fatal(other) => SubmissionError::Rejected(other.to_string()),
            RetryError::Exhausted { attempts, last } => {
                SubmissionError::RetriesExhausted { attempts, last: last.to_string() }
            }
            RetryError::Canceled => SubmissionError::Canceled,
        })?;
        tracing::info!("Export job started: {id}");
        Ok(JobHandle {
            job: ExportJob { id, query: query.to_string(), status: JobStatus::Created, result: None },
            outcome: None,
            submitted_at: Instant::now(),
            polls: 0,
        })
    }

    /// Poll until the job is terminal, `max_duration` has elapsed, or `cancel` fires.
    pub fn await_completion(
        &self,
        handle: &mut JobHandle,
        poll: &PollSchedule,
        max_duration: Duration,
        cancel: &CancelToken,
    ) -> Result<ResultLocation, JobError> {
        if let Some(done) = &handle.outcome {
            return done.clone();
        }
        let job_id = handle.job.id.clone();
        let started = Instant::now();
        loop {
            if cancel.is_canceled() {
                return Err(JobError::Canceled { job_id });
            }
            let report = self.poll_once(handle, cancel)?;
            tracing::debug!("Export job {job_id} status: {:?}", report.status);

            if let Some(outcome) = self.apply_report(handle, report) {
                handle.outcome = Some(outcome.clone());
                return outcome;
            }

            let elapsed = started.elapsed();
            if elapsed >= max_duration {
                return Err(self.time_out(handle, elapsed));
            }
            let wait = poll.interval_at(elapsed).min(max_duration - elapsed);
            if !sleep_cancellable(wait, cancel) {
                return Err(JobError::Canceled { job_id });
            }
        }
    }

    fn poll_once(&self, handle: &mut JobHandle, cancel: &CancelToken) -> Result<JobStatusReport, JobError> {
        let job_id = handle.job.id.clone();
        let mut calls = 0u64;
        let res = retry_transient(&self.retry, cancel, "poll export job", ApiError::is_transient, || {
            calls += 1;
            self.api.poll(&job_id)
        });
        handle.polls += calls;
        res.map_err(|e| match e {
            RetryError::Fatal(err) => {
                let outcome = JobError::Failed { job_id: job_id.clone(), message: err.to_string() };
                handle.job.status = JobStatus::Failed;
                handle.outcome = Some(Err(outcome.clone()));
                outcome
            }
            RetryError::Exhausted { attempts, last } => {
                JobError::RetriesExhausted { job_id: job_id.clone(), attempts, last: last.to_string() }
            }
            RetryError::Canceled => JobError::Canceled { job_id: job_id.clone() },
        })
    }

    /// Fold one status report into the handle; returns the outcome once terminal.
    fn apply_report(&self, handle: &mut JobHandle, report: JobStatusReport) -> Option<Result<ResultLocation, JobError>> {
        let job_id = handle.job.id.clone();
        let message = || report.error_code.clone().unwrap_or_else(|| "Unknown error".to_string());
        match report.status {
            JobStatus::Created | JobStatus::Running => {
                handle.job.status = report.status;
                None
            }
            JobStatus::Completed => {
                let loc = ResultLocation { url: report.url.clone(), object_count: report.object_count.unwrap_or(0) };
                if loc.is_empty() {
                    tracing::info!("Export job {job_id} completed with no results (empty dataset)");
                } else {
                    tracing::info!("Export job {job_id} completed: {} objects", loc.object_count);
                }
                handle.job.status = JobStatus::Completed;
                handle.job.result = Some(loc.clone());
                Some(Ok(loc))
            }
            JobStatus::Failed | JobStatus::TimedOut => {
                handle.job.status = report.status;
                Some(Err(JobError::Failed { job_id, message: message() }))
            }
            JobStatus::Canceled => {
                handle.job.status = JobStatus::Canceled;
                Some(Err(JobError::RemoteCanceled { job_id, message: message() }))
            }
        }
    }

    fn time_out(&self, handle: &mut JobHandle, elapsed: Duration) -> JobError {
        let job_id = handle.job.id.clone();
        tracing::warn!("Export job {job_id} still running after {:?}; giving up", elapsed);
        if self.cancel_remote_on_timeout {
            if let Err(e) = self.api.cancel(&job_id) {
                tracing::warn!("Cancelling export job {job_id} failed: {e}");
            }
        }
        let err = JobError::Timeout { job_id, elapsed };
        handle.job.status = JobStatus::TimedOut;
        handle.outcome = Some(Err(err.clone()));
        err
    }
}
