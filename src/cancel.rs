//! Cooperative cancellation shared between a caller and a running pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slice length for cancellable sleeps; bounds how long a cancel can go unnoticed.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Cloneable cancel flag. A token may be linked to others; it then reports canceled when
/// any of them fires, while cancelling it only affects its own flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    linked: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.linked.iter().any(|f| f.load(Ordering::SeqCst))
    }

    /// A fresh token that also observes `self` and `other`.
    pub fn linked_with(&self, other: &CancelToken) -> CancelToken {
        let mut linked = Vec::with_capacity(2 + self.linked.len() + other.linked.len());
        linked.push(self.flag.clone());
        linked.extend(self.linked.iter().cloned());
        linked.push(other.flag.clone());
        linked.extend(other.linked.iter().cloned());
        CancelToken { flag: Arc::new(AtomicBool::new(false)), linked }
    }
}

/// Sleep for `total`, waking every slice to check `cancel`.
/// Returns false if the sleep was cut short by cancellation.
pub fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_canceled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
