//! Process-wide counters, mirrored from the teacher's `cognitod::metrics`
//! atomic-struct style: one struct of plain atomics, updated from the hot
//! path with no locking. `spec.md` has no user-visible metrics surface of
//! its own, but the ambient stack carries this regardless — it's what
//! `commtest` prints a summary from at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub puts_total: AtomicU64,
    pub gets_total: AtomicU64,
    pub amos_total: AtomicU64,
    pub execute_on_total: AtomicU64,
    pub am_proxy_fallbacks_total: AtomicU64,
    pub barriers_total: AtomicU64,
    pub bytes_put_total: AtomicU64,
    pub bytes_get_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn record_put(&self, bytes: u64) {
        self.puts_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_put_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_get(&self, bytes: u64) {
        self.gets_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_get_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_amo(&self) {
        self.amos_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execute_on(&self) {
        self.execute_on_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_am_proxy_fallback(&self) {
        self.am_proxy_fallbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier(&self) {
        self.barriers_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let m = Metrics::new();
        assert_eq!(m.puts_total.load(Ordering::Relaxed), 0);
        m.record_put(16);
        m.record_put(8);
        assert_eq!(m.puts_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.bytes_put_total.load(Ordering::Relaxed), 24);
    }
}
