use crate::cancel::CancelToken;
use crate::reconstruct::RecordLayout;
use crate::retry::RetryPolicy;
use crate::util::normalize_name;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with a child record whose parent was never streamed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Drop the record, count it per table, keep going.
    SkipAndCount,
    /// Abort the endpoint.
    FailFast,
}

/// Status-check cadence: `interval` until `slow_after` has elapsed, then `slow_interval`.
#[derive(Clone, Debug, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub slow_after: Option<Duration>,
    pub slow_interval: Duration,
}

impl PollSchedule {
    pub fn fixed(interval: Duration) -> Self {
        Self { interval, slow_after: None, slow_interval: interval }
    }
    pub fn stepped(interval: Duration, slow_after: Duration, slow_interval: Duration) -> Self {
        Self { interval, slow_after: Some(slow_after), slow_interval }
    }
    pub fn interval_at(&self, elapsed: Duration) -> Duration {
        match self.slow_after {
            Some(after) if elapsed >= after => self.slow_interval,
            _ => self.interval,
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        // Bulk exports usually finish within a minute; back off afterwards.
        Self::stepped(Duration::from_secs(5), Duration::from_secs(60), Duration::from_secs(15))
    }
}

/// User-facing options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    pub poll: PollSchedule,
    pub max_duration: Duration,
    pub retry: RetryPolicy,
    pub cancel_remote_on_timeout: bool,
    pub parallelism: usize,          // endpoints processed concurrently
    pub orphan_policy: OrphanPolicy,
    pub strict: bool,                // any failed table aborts its endpoint
    pub layout: RecordLayout,

    // memory bound
    pub spill_threshold: usize,      // buffered rows per table before spilling to disk
    pub low_memory_fraction: f64,    // spill early when available RAM drops below this
    pub work_dir: Option<PathBuf>,   // if None, a bulketl directory under the system temp dir

    pub raw_archive_dir: Option<PathBuf>, // keep raw streams as <endpoint>.jsonl.zst
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub progress: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            poll: PollSchedule::default(),
            max_duration: Duration::from_secs(6 * 60 * 60),
            retry: RetryPolicy::default(),
            cancel_remote_on_timeout: false,
            parallelism: 1,
            orphan_policy: OrphanPolicy::SkipAndCount,
            strict: false,
            layout: RecordLayout::default(),
            spill_threshold: 50_000,
            low_memory_fraction: 0.10,
            work_dir: None,
            raw_archive_dir: None,
            read_buffer_bytes: 256 * 1024,
            write_buffer_bytes: 256 * 1024,
            progress: false,
        }
    }
}

impl ExtractOptions {
    /// Defaults overridden by `BULKETL_*` environment variables. Unparsable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(ms) = env_parse::<u64>("BULKETL_POLL_INTERVAL_MS") {
            o.poll = PollSchedule::fixed(Duration::from_millis(ms.max(1)));
        }
        if let Some(secs) = env_parse::<u64>("BULKETL_MAX_DURATION_SECS") {
            o.max_duration = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("BULKETL_PARALLELISM") {
            o = o.with_parallelism(n);
        }
        if let Some(n) = env_parse::<usize>("BULKETL_SPILL_THRESHOLD") {
            o = o.with_spill_threshold(n);
        }
        if let Ok(dir) = std::env::var("BULKETL_WORK_DIR") {
            if !dir.trim().is_empty() {
                o.work_dir = Some(PathBuf::from(dir.trim()));
            }
        }
        if let Some(strict) = env_parse::<bool>("BULKETL_STRICT") {
            o.strict = strict;
        }
        o
    }

    pub fn with_poll(mut self, poll: PollSchedule) -> Self {
        self.poll = poll;
        self
    }
    pub fn with_max_duration(mut self, d: Duration) -> Self {
        self.max_duration = d;
        self
    }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
    pub fn with_cancel_remote_on_timeout(mut self, yes: bool) -> Self {
        self.cancel_remote_on_timeout = yes;
        self
    }
    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }
    pub fn with_orphan_policy(mut self, p: OrphanPolicy) -> Self {
        self.orphan_policy = p;
        self
    }
    pub fn with_strict(mut self, yes: bool) -> Self {
        self.strict = yes;
        self
    }
    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }
    pub fn with_spill_threshold(mut self, rows: usize) -> Self {
        self.spill_threshold = rows.max(1);
        self
    }
    pub fn with_low_memory_fraction(mut self, frac: f64) -> Self {
        self.low_memory_fraction = frac.clamp(0.0, 1.0);
        self
    }
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }
    pub fn with_raw_archive_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.raw_archive_dir = Some(dir.as_ref().to_path_buf());
        self
    }
    pub fn with_io_buffers(mut self, read_bytes: usize, write_bytes: usize) -> Self {
        self.read_buffer_bytes = read_bytes.max(8 * 1024);
        self.write_buffer_bytes = write_bytes.max(8 * 1024);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }

    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("bulketl_work"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{key}={raw:?} is not valid; keeping the default");
            None
        }
    }
}

/// One export to run: a name (also used for output paths) and the opaque query to submit.
#[derive(Clone, Debug)]
pub struct EndpointSpec {
    pub name: String,
    pub query: String,
    pub cancel: CancelToken,
}

impl EndpointSpec {
    pub fn new(name: impl AsRef<str>, query: impl Into<String>) -> Self {
        Self { name: normalize_name(name.as_ref()), query: query.into(), cancel: CancelToken::new() }
    }

    /// Cancel this endpoint alone through `token`.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Reject empty names, duplicate names and blank queries before anything is submitted.
pub fn validate_endpoints(endpoints: &[EndpointSpec]) -> Result<()> {
    let mut seen: Vec<&str> = Vec::with_capacity(endpoints.len());
    for ep in endpoints {
        if ep.name.is_empty() {
            bail!("endpoint name cannot be empty");
        }
        if ep.query.trim().is_empty() {
            bail!("endpoint {}: query cannot be empty", ep.name);
        }
        if seen.contains(&ep.name.as_str()) {
            bail!("endpoint {} is listed more than once", ep.name);
        }
        seen.push(&ep.name);
    }
    Ok(())
}
