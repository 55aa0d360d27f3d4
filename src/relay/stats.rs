//! Relay statistics tracking.
//!
//! Tracks request counts, rollbacks, quota flow and latencies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Latencies kept for percentile calculation.
const LATENCY_WINDOW: usize = 1000;

/// Thread-safe relay statistics
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total requests processed
    requests: AtomicU64,
    /// Total streaming requests
    streaming_requests: AtomicU64,
    /// Total errors
    errors: AtomicU64,
    /// Reservations released after a failed call
    rollbacks: AtomicU64,
    /// Settlements that waited for queue room
    settlements_deferred: AtomicU64,
    /// Quota reserved before calls
    quota_reserved: AtomicI64,
    /// Quota billed after successful calls
    quota_billed: AtomicI64,
    /// Prompt tokens of successful calls
    prompt_tokens: AtomicI64,
    /// Completion tokens of successful calls
    completion_tokens: AtomicI64,
    /// Request latencies (for percentile calculation)
    latencies: RwLock<VecDeque<Duration>>,
    /// Start time
    started_at: RwLock<Option<Instant>>,
}

impl RelayStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self {
            started_at: RwLock::new(Some(Instant::now())),
            ..Default::default()
        }
    }

    /// Record an accepted request
    pub fn record_request(&self, is_stream: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if is_stream {
            self.streaming_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a reservation
    pub fn record_reserved(&self, quota: i64) {
        self.quota_reserved.fetch_add(quota, Ordering::Relaxed);
    }

    /// Record a successful call
    pub fn record_success(&self, prompt_tokens: i64, completion_tokens: i64, quota: i64, latency: Duration) {
        self.prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion_tokens, Ordering::Relaxed);
        self.quota_billed.fetch_add(quota, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Record a failed call; `rolled_back` when a reservation was released
    pub fn record_error(&self, rolled_back: bool) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if rolled_back {
            self.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a settlement that found the queue full
    pub fn record_settlement_deferred(&self) {
        self.settlements_deferred.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut latencies) = self.latencies.write() {
            latencies.push_back(latency);
            if latencies.len() > LATENCY_WINDOW {
                latencies.pop_front();
            }
        }
    }

    /// Get total requests
    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Get streaming requests count
    pub fn streaming_requests(&self) -> u64 {
        self.streaming_requests.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get total rollbacks
    pub fn total_rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Get settlements deferred by a full queue
    pub fn settlements_deferred(&self) -> u64 {
        self.settlements_deferred.load(Ordering::Relaxed)
    }

    /// Get quota reserved so far
    pub fn quota_reserved(&self) -> i64 {
        self.quota_reserved.load(Ordering::Relaxed)
    }

    /// Get quota billed so far
    pub fn quota_billed(&self) -> i64 {
        self.quota_billed.load(Ordering::Relaxed)
    }

    /// Get p50 latency
    pub fn p50_latency(&self) -> Option<Duration> {
        self.percentile_latency(50)
    }

    /// Get p95 latency
    pub fn p95_latency(&self) -> Option<Duration> {
        self.percentile_latency(95)
    }

    /// Get p99 latency
    pub fn p99_latency(&self) -> Option<Duration> {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> Option<Duration> {
        let latencies = self.latencies.read().ok()?;
        if latencies.is_empty() {
            return None;
        }

        let mut sorted: Vec<_> = latencies.iter().copied().collect();
        sorted.sort();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.started_at
            .read()
            .ok()
            .and_then(|s| s.map(|start| start.elapsed()))
            .unwrap_or_default()
    }

    /// Get requests per second
    pub fn requests_per_second(&self) -> f64 {
        let uptime = self.uptime().as_secs_f64();
        if uptime > 0.0 {
            self.total_requests() as f64 / uptime
        } else {
            0.0
        }
    }

    /// Get summary as JSON-compatible struct
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            total_requests: self.total_requests(),
            streaming_requests: self.streaming_requests(),
            total_errors: self.total_errors(),
            rollbacks: self.total_rollbacks(),
            settlements_deferred: self.settlements_deferred(),
            quota_reserved: self.quota_reserved(),
            quota_billed: self.quota_billed(),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            p50_latency_ms: self.p50_latency().map(|d| d.as_secs_f64() * 1000.0),
            p95_latency_ms: self.p95_latency().map(|d| d.as_secs_f64() * 1000.0),
            p99_latency_ms: self.p99_latency().map(|d| d.as_secs_f64() * 1000.0),
            uptime_secs: self.uptime().as_secs(),
            requests_per_second: self.requests_per_second(),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.streaming_requests.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.settlements_deferred.store(0, Ordering::Relaxed);
        self.quota_reserved.store(0, Ordering::Relaxed);
        self.quota_billed.store(0, Ordering::Relaxed);
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);

        if let Ok(mut latencies) = self.latencies.write() {
            latencies.clear();
        }

        if let Ok(mut started) = self.started_at.write() {
            *started = Some(Instant::now());
        }
    }
}

/// Statistics summary for serialization.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSummary {
    /// Total number of requests processed.
    pub total_requests: u64,
    /// Number of streaming requests.
    pub streaming_requests: u64,
    /// Total number of errors encountered.
    pub total_errors: u64,
    /// Reservations released after failures.
    pub rollbacks: u64,
    /// Settlements that waited for queue room.
    pub settlements_deferred: u64,
    /// Quota reserved before calls.
    pub quota_reserved: i64,
    /// Quota billed after successful calls.
    pub quota_billed: i64,
    /// Prompt tokens billed.
    pub prompt_tokens: i64,
    /// Completion tokens billed.
    pub completion_tokens: i64,
    /// 50th percentile latency in milliseconds.
    pub p50_latency_ms: Option<f64>,
    /// 95th percentile latency in milliseconds.
    pub p95_latency_ms: Option<f64>,
    /// 99th percentile latency in milliseconds.
    pub p99_latency_ms: Option<f64>,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Average requests per second.
    pub requests_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = RelayStats::new();

        stats.record_request(false);
        stats.record_request(true);
        stats.record_reserved(600);
        stats.record_success(10, 5, 15, Duration::from_millis(50));
        stats.record_error(true);
        stats.record_settlement_deferred();

        let summary = stats.summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.streaming_requests, 1);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.rollbacks, 1);
        assert_eq!(summary.settlements_deferred, 1);
        assert_eq!(summary.quota_reserved, 600);
        assert_eq!(summary.quota_billed, 15);
        assert_eq!(summary.prompt_tokens, 10);
    }

    #[test]
    fn test_latency_percentiles() {
        let stats = RelayStats::new();

        for i in 1..=100 {
            stats.record_success(1, 1, 2, Duration::from_millis(i));
        }

        let p50 = stats.p50_latency().unwrap();
        let p95 = stats.p95_latency().unwrap();
        let p99 = stats.p99_latency().unwrap();

        assert!(p50.as_millis() >= 49 && p50.as_millis() <= 51);
        assert!(p95.as_millis() >= 94 && p95.as_millis() <= 96);
        assert!(p99.as_millis() >= 98 && p99.as_millis() <= 100);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let stats = RelayStats::new();
        for i in 0..(LATENCY_WINDOW as u64 + 10) {
            stats.record_success(0, 0, 0, Duration::from_millis(i));
        }
        assert_eq!(stats.latencies.read().unwrap().len(), LATENCY_WINDOW);
    }

    #[test]
    fn test_reset() {
        let stats = RelayStats::new();
        stats.record_request(true);
        stats.record_error(false);
        stats.reset();

        assert_eq!(stats.total_requests(), 0);
        assert_eq!(stats.total_errors(), 0);
        assert!(stats.p50_latency().is_none());
    }
}
