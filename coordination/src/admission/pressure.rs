//! Backpressure gate.
//!
//! A process is under pressure when its completion circuit is open, when its
//! request backlog reaches the configured depth, or when its resident memory
//! crosses the configured threshold.

use serde::Serialize;

use super::circuit_breaker::CircuitState;
use super::queue::RequestQueue;

/// Reads the resident set size of the current process, in bytes.
pub type MemoryProbe = fn() -> Option<u64>;

/// Snapshot of the inputs behind a pressure decision.
#[derive(Debug, Clone, Serialize)]
pub struct PressureReport {
    pub breaker: CircuitState,
    pub queue_depth: usize,
    pub rss_bytes: Option<u64>,
    pub under_pressure: bool,
}

/// Evaluates the backpressure condition.
#[derive(Debug, Clone)]
pub struct PressureGauge {
    depth_threshold: usize,
    memory_threshold_bytes: u64,
    probe: MemoryProbe,
}

impl PressureGauge {
    pub fn new(depth_threshold: usize, memory_threshold_mb: u64) -> Self {
        Self {
            depth_threshold,
            memory_threshold_bytes: memory_threshold_mb.saturating_mul(1024 * 1024),
            probe: resident_set_bytes,
        }
    }

    /// Replace the memory probe.
    pub fn with_probe(mut self, probe: MemoryProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Evaluate the gate against `queue`.
    ///
    /// Reads the breaker state without performing the half-open transition,
    /// so checking for pressure never consumes the recovery probe.
    pub fn evaluate(&self, queue: &RequestQueue) -> PressureReport {
        let breaker = queue.breaker_state();
        let queue_depth = queue.depth();
        let rss_bytes = (self.probe)();

        let under_pressure = breaker == CircuitState::Open
            || queue_depth >= self.depth_threshold
            || rss_bytes.is_some_and(|rss| rss >= self.memory_threshold_bytes);

        PressureReport {
            breaker,
            queue_depth,
            rss_bytes,
            under_pressure,
        }
    }
}

/// Resident set size from `/proc/self/status`. `None` where procfs is unavailable.
pub fn resident_set_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::CircuitBreaker;
    use std::time::Duration;

    fn low_memory() -> Option<u64> {
        Some(10 * 1024 * 1024)
    }

    fn high_memory() -> Option<u64> {
        Some(900 * 1024 * 1024)
    }

    fn no_procfs() -> Option<u64> {
        None
    }

    fn queue() -> RequestQueue {
        RequestQueue::new(1, 5, CircuitBreaker::new(1, Duration::from_secs(120)))
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\ttribunal\nVmPeak:\t  20000 kB\nVmRSS:\t   1234 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(1234 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn test_idle_process_not_under_pressure() {
        let gauge = PressureGauge::new(3, 512).with_probe(low_memory);
        let report = gauge.evaluate(&queue());
        assert!(!report.under_pressure);
        assert_eq!(report.queue_depth, 0);
    }

    #[test]
    fn test_memory_threshold() {
        let gauge = PressureGauge::new(3, 512).with_probe(high_memory);
        assert!(gauge.evaluate(&queue()).under_pressure);

        let gauge = PressureGauge::new(3, 512).with_probe(no_procfs);
        assert!(!gauge.evaluate(&queue()).under_pressure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_means_pressure_without_consuming_probe() {
        let q = queue();
        let _ = q.enqueue(async { Err::<(), _>("down") }).await;
        assert_eq!(q.breaker_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(121)).await;
        let gauge = PressureGauge::new(3, 512).with_probe(low_memory);
        assert!(gauge.evaluate(&q).under_pressure);
        assert_eq!(q.breaker_state(), CircuitState::Open);

        // The probe is still available to real work.
        assert!(q.enqueue(async { Ok::<_, &str>(()) }).await.is_ok());
        assert!(!gauge.evaluate(&q).under_pressure);
    }
}
