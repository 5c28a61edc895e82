//! Shared progress state and cooperative cancellation.
//!
//! The pipeline runs on a single worker; a UI thread only reads snapshots
//! of the counters here and may set the cancellation flag. The item name is
//! published once per item and the byte counters only ever grow, so a read
//! racing an update observes nothing worse than a slightly stale total.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Point-in-time view of a download session.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Bytes pulled from the HTTP stream so far (across resumed sessions).
    pub bytes_downloaded: u64,
    /// Expected total, known once the HTTP stream reports its length.
    pub total_bytes: u64,
    /// Name of the item currently being written.
    pub item_name: String,
    /// Time since this session started.
    pub elapsed: Duration,
}

/// Counters shared between the pipeline worker and observers.
#[derive(Debug)]
pub struct ProgressState {
    bytes_downloaded: AtomicU64,
    total_bytes: AtomicU64,
    item_name: Mutex<String>,
    started: Instant,
}

impl ProgressState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes_downloaded: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            item_name: Mutex::new(String::new()),
            started: Instant::now(),
        })
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_bytes(&self, n: u64) {
        self.bytes_downloaded.store(n, Ordering::Relaxed);
    }

    pub fn set_total(&self, n: u64) {
        self.total_bytes.store(n, Ordering::Relaxed);
    }

    pub fn set_item_name(&self, name: &str) {
        if let Ok(mut current) = self.item_name.lock() {
            current.clear();
            current.push_str(name);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            item_name: self
                .item_name
                .lock()
                .map(|name| name.clone())
                .unwrap_or_default(),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Throttled observer invoked from the pipeline at HTTP read boundaries.
pub type ProgressCallback = Box<dyn FnMut(&ProgressSnapshot) + Send>;

/// Cooperative cancellation flag, polled at the top of every read.
///
/// Cancelling never discards staged files; the session unwinds cleanly and
/// can be resumed later.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token so a resumed session can run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
