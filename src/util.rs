use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

static INIT_ONCE: std::sync::Once = std::sync::Once::new();
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

/// Lowercase, trim, and collapse anything outside `[a-z0-9_-]` to `_`.
/// Used for endpoint names and for file stems derived from table names.
pub fn normalize_name(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' }
        })
        .collect()
}

// -------- file ops with backoff (AV scanners, network shares, sharing violations) --------

/// Transient OS errors worth retrying; codes are the usual Windows suspects
/// (access denied, sharing/lock violation, AV block, device not ready, stale handle).
fn is_retriable_io_error(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(5 | 21 | 32 | 33 | 225 | 433 | 1006 | 1117 | 1224))
}

fn with_backoff<T>(tries: usize, delay_ms: u64, what: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut last_err: Option<io::Error> = None;
    for i in 0..tries.max(1) {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_retriable_io_error(&e) => {
                last_err = Some(e);
                sleep(Duration::from_millis(delay_ms.saturating_mul((i + 1) as u64)));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, format!("{what} failed"))))
}

pub fn open_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    with_backoff(tries, delay_ms, "open", || File::open(path))
}

pub fn create_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    with_backoff(tries, delay_ms, "create", || File::create(path))
}

/// Remove a file; a file that is already gone counts as success.
pub fn remove_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> Result<()> {
    with_backoff(tries, delay_ms, "remove", || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
    .with_context(|| format!("remove {}", path.display()))
}

/// Move `tmp` over `dest`. Falls back to copy+remove when the rename keeps failing.
pub fn replace_file_atomic_backoff(tmp: &Path, dest: &Path) -> Result<()> {
    let (tries, delay_ms) = (20usize, 50u64);
    if dest.exists() {
        remove_with_backoff(dest, tries, delay_ms)?;
    }
    if with_backoff(tries, delay_ms, "rename", || fs::rename(tmp, dest)).is_ok() {
        return Ok(());
    }
    with_backoff(tries, delay_ms, "copy", || fs::copy(tmp, dest))
        .with_context(|| format!("copy {} -> {}", tmp.display(), dest.display()))?;
    remove_with_backoff(tmp, tries, delay_ms)
}
