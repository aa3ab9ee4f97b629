use crate::api::ExportApi;
use crate::archive::RawArchive;
use crate::cancel::CancelToken;
use crate::config::{validate_endpoints, EndpointSpec, ExtractOptions, OrphanPolicy, PollSchedule};
use crate::error::{EndpointError, JobError, MaterializeError, StreamError, SubmissionError};
use crate::job::JobOrchestrator;
use crate::materialize::{FinalizedTable, SpillConfig, TableMaterializer};
use crate::progress::RecordProgress;
use crate::reconstruct::{Reconstructor, RecordLayout};
use crate::retry::RetryPolicy;
use crate::sink::TableSink;
use crate::stream::open_result_stream;
use crate::util::init_tracing_once;
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// Lines consumed between cancellation checks and progress updates.
const CHECK_EVERY: u64 = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSummary {
    pub name: String,
    pub rows: u64,
    pub columns: usize,
}

/// Outcome of one endpoint pipeline that reached the sink.
#[derive(Debug)]
pub struct EndpointReport {
    pub endpoint: String,
    pub job_id: String,
    pub polls: u64,
    pub records: u64,
    pub bytes: u64,
    pub orphans_skipped: Vec<(String, u64)>,
    pub tables: Vec<TableSummary>,
    pub failed_tables: Vec<(String, MaterializeError)>,
    pub api_wait: Duration,
    pub processing: Duration,
}

impl EndpointReport {
    pub fn total(&self) -> Duration {
        self.api_wait + self.processing
    }

    pub fn table(&self, name: &str) -> Option<&TableSummary> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn total_orphans(&self) -> u64 {
        self.orphans_skipped.iter().map(|(_, n)| n).sum()
    }

    fn log(&self) {
        let total = self.total().as_secs_f64();
        let rate = if total > 0.0 { self.records as f64 / total } else { 0.0 };
        tracing::info!(
            "Endpoint {} done: API wait {:.2}s, download {:.2}s, total {:.2}s ({} items, {:.0} items/s)",
            self.endpoint,
            self.api_wait.as_secs_f64(),
            self.processing.as_secs_f64(),
            total,
            self.records,
            rate
        );
        for (table, n) in &self.orphans_skipped {
            tracing::warn!("Endpoint {}: skipped {n} orphan {table} records", self.endpoint);
        }
        for (table, err) in &self.failed_tables {
            tracing::warn!("Endpoint {}: table {table} not emitted: {err}", self.endpoint);
        }
    }
}

/// Runs export endpoints end to end: submit, wait, stream, rebuild tables, hand them to a sink.
#[derive(Clone, Debug, Default)]
pub struct BulkExtractor {
    pub(crate) opts: ExtractOptions,
}

impl BulkExtractor {
    pub fn new() -> Self {
        Self { opts: ExtractOptions::default() }
    }
    pub fn with_options(opts: ExtractOptions) -> Self { Self { opts } }
    pub fn options(&self) -> &ExtractOptions { &self.opts }

    // Builder methods delegating to ExtractOptions
    pub fn poll(mut self, poll: PollSchedule) -> Self { self.opts = self.opts.with_poll(poll); self }
    pub fn max_duration(mut self, d: Duration) -> Self { self.opts = self.opts.with_max_duration(d); self }
    pub fn retry(mut self, policy: RetryPolicy) -> Self { self.opts = self.opts.with_retry(policy); self }
    pub fn cancel_remote_on_timeout(mut self, yes: bool) -> Self { self.opts = self.opts.with_cancel_remote_on_timeout(yes); self }
    pub fn parallelism(mut self, n: usize) -> Self { self.opts = self.opts.with_parallelism(n); self }
    pub fn orphan_policy(mut self, p: OrphanPolicy) -> Self { self.opts = self.opts.with_orphan_policy(p); self }
    pub fn strict(mut self, yes: bool) -> Self { self.opts = self.opts.with_strict(yes); self }
    pub fn layout(mut self, layout: RecordLayout) -> Self { self.opts = self.opts.with_layout(layout); self }
    pub fn spill_threshold(mut self, rows: usize) -> Self { self.opts = self.opts.with_spill_threshold(rows); self }
    pub fn low_memory_fraction(mut self, frac: f64) -> Self { self.opts = self.opts.with_low_memory_fraction(frac); self }
    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self { self.opts = self.opts.with_work_dir(dir); self }
    pub fn raw_archive_dir(mut self, dir: impl AsRef<Path>) -> Self { self.opts = self.opts.with_raw_archive_dir(dir); self }
    pub fn io_buffers(mut self, read_bytes: usize, write_bytes: usize) -> Self { self.opts = self.opts.with_io_buffers(read_bytes, write_bytes); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }

    /// Run every endpoint on a pool of `parallelism` threads. Results come back in input order;
    /// one endpoint failing or being canceled never affects the others. `cancel` stops them all.
    pub fn run_all<A: ExportApi + ?Sized>(
        &self,
        api: &A,
        endpoints: &[EndpointSpec],
        sink: &dyn TableSink,
        cancel: &CancelToken,
    ) -> Vec<(String, Result<EndpointReport, EndpointError>)> {
        init_tracing_once();
        if let Err(e) = validate_endpoints(endpoints) {
            tracing::error!("{e:#}");
            return endpoints
                .iter()
                .map(|ep| (ep.name.clone(), Err(EndpointError::Config(format!("{e:#}")))))
                .collect();
        }

        let linked: Vec<EndpointSpec> = endpoints
            .iter()
            .map(|ep| ep.clone().with_cancel(ep.cancel.linked_with(cancel)))
            .collect();
        let run_one = |ep: &EndpointSpec| (ep.name.clone(), self.run_endpoint(api, ep, sink));

        let threads = self.opts.parallelism.max(1).min(linked.len().max(1));
        if threads <= 1 {
            return linked.iter().map(run_one).collect();
        }
        match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(|| linked.par_iter().map(run_one).collect()),
            Err(e) => {
                tracing::warn!("Could not build a {threads}-thread pool ({e}); running endpoints sequentially");
                linked.iter().map(run_one).collect()
            }
        }
    }

    /// One endpoint end to end. Tables reach `sink` only after the whole stream was consumed;
    /// a canceled endpoint emits none.
    pub fn run_endpoint<A: ExportApi + ?Sized>(
        &self,
        api: &A,
        endpoint: &EndpointSpec,
        sink: &dyn TableSink,
    ) -> Result<EndpointReport, EndpointError> {
        init_tracing_once();
        let opts = &self.opts;
        let name = endpoint.name.as_str();
        let cancel = &endpoint.cancel;
        if name.is_empty() {
            return Err(EndpointError::Config("endpoint name cannot be empty".into()));
        }
        let canceled = || EndpointError::Canceled(name.to_string());

        let started = Instant::now();
        let progress = RecordProgress::new(name, opts.progress);
        let orchestrator = JobOrchestrator::new(api)
            .retry(opts.retry.clone())
            .cancel_remote_on_timeout(opts.cancel_remote_on_timeout);

        let mut handle = orchestrator.submit(&endpoint.query, cancel).map_err(|e| match e {
            SubmissionError::Canceled => canceled(),
            other => other.into(),
        })?;
        progress.waiting(&format!("{name}: waiting for export job {}", handle.id()));
        let location = orchestrator
            .await_completion(&mut handle, &opts.poll, opts.max_duration, cancel)
            .map_err(|e| match e {
                JobError::Canceled { .. } => canceled(),
                other => other.into(),
            })?;
        let api_wait = started.elapsed();
        tracing::info!("Endpoint {name}: export job {} ready after {:.2}s", handle.id(), api_wait.as_secs_f64());

        let stream_started = Instant::now();
        let mut lines = open_result_stream(api, &location, &opts.retry, cancel).map_err(|e| match e {
            StreamError::Canceled => canceled(),
            other => other.into(),
        })?;
        progress.waiting(name);

        let mut archive = match &opts.raw_archive_dir {
            Some(dir) => Some(RawArchive::create(dir, name, opts.write_buffer_bytes).map_err(EndpointError::Archive)?),
            None => None,
        };
        // one directory per run: endpoints of other runs may share the work dir and the name
        let work_dir = opts.resolved_work_dir();
        let spill_dir = fs::create_dir_all(&work_dir)
            .and_then(|_| tempfile::Builder::new().prefix(&format!("{name}_")).tempdir_in(&work_dir))
            .map_err(|source| EndpointError::WorkDir { path: work_dir.display().to_string(), source })?;
        let mut spill = SpillConfig::new(spill_dir.path(), opts.spill_threshold)
            .with_low_memory_fraction(opts.low_memory_fraction);
        spill.read_buf_bytes = opts.read_buffer_bytes;
        spill.write_buf_bytes = opts.write_buffer_bytes;

        let mut reconstructor = Reconstructor::new(opts.layout.clone(), opts.orphan_policy);
        let mut materializer = TableMaterializer::new(opts.layout.clone(), spill);

        let mut consumed = 0u64;
        for line in lines.by_ref() {
            let line = line?;
            consumed += 1;
            if consumed % CHECK_EVERY == 0 {
                progress.inc(CHECK_EVERY);
                if cancel.is_canceled() {
                    progress.abandon(format!("{name}: canceled"));
                    return Err(canceled());
                }
            }
            if let Some(a) = archive.as_mut() {
                a.write_line(&line).map_err(EndpointError::Archive)?;
            }
            let Some(record) = reconstructor.route(&line)? else { continue };
            let table = record.type_tag.clone();
            if let Err(e) = materializer.append(&table, record) {
                if opts.strict {
                    return Err(EndpointError::StrictTableFailure(e));
                }
            }
        }
        progress.inc(consumed % CHECK_EVERY);
        if cancel.is_canceled() {
            progress.abandon(format!("{name}: canceled"));
            return Err(canceled());
        }
        if let Some(a) = archive.take() {
            a.commit().map_err(EndpointError::Archive)?;
        }

        let mut ready: Vec<FinalizedTable> = Vec::new();
        let mut failed_tables = Vec::new();
        for (table, res) in materializer.finalize_all() {
            match res {
                Ok(t) => ready.push(t),
                Err(e) if opts.strict => return Err(EndpointError::StrictTableFailure(e)),
                Err(e) => failed_tables.push((table, e)),
            }
        }

        let mut tables = Vec::with_capacity(ready.len());
        for t in &ready {
            sink.accept(name, t)
                .map_err(|source| EndpointError::Sink { table: t.name().to_string(), source })?;
            tables.push(TableSummary { name: t.name().to_string(), rows: t.row_count(), columns: t.columns().len() });
        }
        drop(ready);
        drop(spill_dir);
        progress.finish(format!("{name}: {} tables", tables.len()));

        let report = EndpointReport {
            endpoint: name.to_string(),
            job_id: handle.id().to_string(),
            polls: handle.polls(),
            records: consumed,
            bytes: lines.bytes_read(),
            orphans_skipped: reconstructor.orphans_skipped(),
            tables,
            failed_tables,
            api_wait,
            processing: stream_started.elapsed(),
        };
        report.log();
        Ok(report)
    }
}
