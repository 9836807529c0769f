//! Performance recorder - per-transition and per-operation latency capture
//!
//! Every state transition and every timed venue operation lands here so a
//! finished instance can report whether it met its latency budget.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: &'static str,
    pub to: &'static str,
    pub reason: String,
    /// Offset from instance start
    pub at_us: u64,
    /// Time spent in the handler that produced this transition
    pub handler_us: u64,
    /// Time spent in `from`
    pub dwell_us: u64,
}

/// Latency distribution of one measurement series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<u64> = samples.iter().map(|d| d.as_micros() as u64).collect();
        sorted.sort_unstable();

        let count = sorted.len();
        let total: u64 = sorted.iter().sum();
        let percentile = |p: usize| -> u64 {
            let idx = ((count * p) / 100).min(count - 1);
            sorted[idx]
        };

        Self {
            count,
            mean_us: total / count as u64,
            p50_us: percentile(50),
            p95_us: percentile(95),
            p99_us: percentile(99),
            max_us: sorted[count - 1],
        }
    }
}

/// Summary attached to every strategy result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSummary {
    pub transitions: usize,
    pub handler_latency: LatencyStats,
    pub sla_target_us: u64,
    pub sla_breaches: usize,
    pub operations: BTreeMap<String, LatencyStats>,
}

impl PerformanceSummary {
    pub fn meets_sla(&self) -> bool {
        self.sla_breaches == 0
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceRecorder {
    started: Instant,
    last_transition: Instant,
    transition_sla: Duration,
    transitions: Vec<TransitionRecord>,
    handler_samples: Vec<Duration>,
    operations: HashMap<&'static str, Vec<Duration>>,
    sla_breaches: usize,
}

impl PerformanceRecorder {
    pub fn new(transition_sla: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_transition: now,
            transition_sla,
            transitions: Vec::new(),
            handler_samples: Vec::new(),
            operations: HashMap::new(),
            sla_breaches: 0,
        }
    }

    pub fn record_transition(
        &mut self,
        from: &'static str,
        to: &'static str,
        reason: impl Into<String>,
        handler_latency: Duration,
    ) {
        let now = Instant::now();
        if handler_latency > self.transition_sla {
            self.sla_breaches += 1;
        }
        self.handler_samples.push(handler_latency);
        self.transitions.push(TransitionRecord {
            from,
            to,
            reason: reason.into(),
            at_us: now.duration_since(self.started).as_micros() as u64,
            handler_us: handler_latency.as_micros() as u64,
            dwell_us: now.duration_since(self.last_transition).as_micros() as u64,
        });
        self.last_transition = now;
    }

    pub fn record_operation(&mut self, name: &'static str, elapsed: Duration) {
        self.operations.entry(name).or_default().push(elapsed);
    }

    /// Await `fut` and record how long it took under `name`.
    pub async fn time_async<F, T>(&mut self, name: &'static str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        self.record_operation(name, started.elapsed());
        out
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn operation_count(&self, name: &str) -> usize {
        self.operations.get(name).map(Vec::len).unwrap_or(0)
    }

    pub fn summary(&self) -> PerformanceSummary {
        PerformanceSummary {
            transitions: self.transitions.len(),
            handler_latency: LatencyStats::from_samples(&self.handler_samples),
            sla_target_us: self.transition_sla.as_micros() as u64,
            sla_breaches: self.sla_breaches,
            operations: self
                .operations
                .iter()
                .map(|(name, samples)| (name.to_string(), LatencyStats::from_samples(samples)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats_percentiles() {
        let samples: Vec<Duration> = (1..=100).map(Duration::from_micros).collect();
        let stats = LatencyStats::from_samples(&samples);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.max_us, 100);
        assert_eq!(stats.p50_us, 51);
        assert_eq!(stats.p99_us, 100);
        assert_eq!(stats.mean_us, 50);
    }

    #[test]
    fn test_empty_samples() {
        assert_eq!(LatencyStats::from_samples(&[]), LatencyStats::default());
    }

    #[test]
    fn test_sla_breaches_counted() {
        let mut rec = PerformanceRecorder::new(Duration::from_micros(500));
        rec.record_transition("A", "B", "fast", Duration::from_micros(100));
        rec.record_transition("B", "C", "slow", Duration::from_millis(3));
        let summary = rec.summary();
        assert_eq!(summary.transitions, 2);
        assert_eq!(summary.sla_breaches, 1);
        assert!(!summary.meets_sla());
        assert_eq!(rec.transitions()[1].from, "B");
    }

    #[tokio::test]
    async fn test_time_async_records_operation() {
        let mut rec = PerformanceRecorder::new(Duration::from_millis(1));
        let value = rec.time_async("quote", async { 7 }).await;
        assert_eq!(value, 7);
        assert_eq!(rec.operation_count("quote"), 1);
        assert!(rec.summary().operations.contains_key("quote"));
    }
}
