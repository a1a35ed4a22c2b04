use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::proxy::RequestClass;

#[derive(Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub manifests: AtomicU64,
    pub segments: AtomicU64,
    pub passthrough: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_request(&self, class: RequestClass) {
        let counter = match class {
            RequestClass::Manifest => &self.manifests,
            RequestClass::Segment => &self.segments,
            RequestClass::Other => &self.passthrough,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Logs the counters along with the current session and ladder counts.
    pub fn print(&self, sessions: usize, ladders: usize) {
        info!(
            "📊 total={} active={} sessions={} ladders={} manifests={} segments={} passthrough={} failed={} in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            sessions,
            ladders,
            self.manifests.load(Ordering::Relaxed),
            self.segments.load(Ordering::Relaxed),
            self.passthrough.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}
