//! Progress reporting: one record-count spinner per endpoint, optionally grouped under a global
//! `MultiProgress` so concurrent endpoints render side by side.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static GLOBAL_MP: OnceLock<Arc<MultiProgress>> = OnceLock::new();

/// Install a global MultiProgress used by all subsequently created bars.
/// Safe to call once; additional calls are ignored.
pub fn set_global_multiprogress(mp: Arc<MultiProgress>) {
    let _ = GLOBAL_MP.set(mp);
}

fn new_spinner() -> ProgressBar {
    if let Some(mp) = GLOBAL_MP.get() {
        mp.add(ProgressBar::new_spinner())
    } else {
        ProgressBar::new_spinner()
    }
}

/// Spinner counting records consumed from one endpoint's result stream.
/// Hidden when progress is disabled so callers never branch on it.
pub struct RecordProgress {
    pb: ProgressBar,
}

impl RecordProgress {
    pub fn new(endpoint: &str, enabled: bool) -> Self {
        if !enabled {
            return Self { pb: ProgressBar::hidden() };
        }
        let pb = new_spinner();
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {msg} {pos} records  it/s: {per_sec}  elapsed: {elapsed_precise}",
        ) {
            pb.set_style(style);
        }
        pb.set_message(endpoint.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Status text shown while the export job is still running remotely.
    pub fn waiting(&self, status: &str) {
        self.pb.set_message(status.to_string());
    }

    #[inline]
    pub fn inc(&self, delta: u64) {
        self.pb.inc(delta);
    }

    pub fn finish<T: Into<String>>(&self, msg: T) {
        self.pb.finish_with_message(msg.into());
    }

    pub fn abandon<T: Into<String>>(&self, msg: T) {
        self.pb.abandon_with_message(msg.into());
    }
}
