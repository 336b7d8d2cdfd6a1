//! Rolling latency window with percentile, queue depth and uptime reporting

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// p95 processing latency must stay below this
pub const LATENCY_TARGET: Duration = Duration::from_secs(2);
/// The pending queue must stay below this many entries
pub const QUEUE_DEPTH_TARGET: usize = 50;
/// Minimum availability in percent
pub const UPTIME_TARGET: f64 = 99.0;
/// Below this many samples a missed latency target is not reported as a
/// health issue
const HEALTH_MIN_SAMPLES: usize = 10;

/// Percentile summary of the latency window
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct ComplianceSnapshot {
    /// 95th percentile in seconds
    pub p95: f64,
    /// Arithmetic mean in seconds
    pub average: f64,
    pub sample_count: usize,
    /// Whether `p95` is below [`LATENCY_TARGET`]
    pub within_target: bool,
}

impl ComplianceSnapshot {
    /// Snapshot of an empty window: nothing measured counts as compliant
    pub const NEUTRAL: Self = Self {
        p95: 0.0,
        average: 0.0,
        sample_count: 0,
        within_target: true,
    };

    /// Compute the snapshot of an arbitrary sample set (in seconds)
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = samples.into_iter().collect();
        if sorted.is_empty() {
            return Self::NEUTRAL;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let index = ((0.95 * n as f64).floor() as usize).min(n - 1);
        let p95 = sorted[index];
        let average = sorted.iter().sum::<f64>() / n as f64;
        Self {
            p95,
            average,
            sample_count: n,
            within_target: p95 < LATENCY_TARGET.as_secs_f64(),
        }
    }
}

/// Everything the SLA read surface exposes
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct SlaStatus {
    pub p95: f64,
    pub average: f64,
    pub total_processed: usize,
    pub sla_met: bool,
    pub queue_depth: usize,
    pub uptime_percentage: f64,
}

impl SlaStatus {
    pub fn queue_within_target(&self) -> bool {
        self.queue_depth < QUEUE_DEPTH_TARGET
    }

    pub fn uptime_within_target(&self) -> bool {
        self.uptime_percentage >= UPTIME_TARGET
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
}

/// Health verdict derived from the SLA numbers
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

struct SlaInner {
    samples: VecDeque<f64>,
    capacity: usize,
    queue_depth: usize,
    downtime: Duration,
}

/// Tracker of processing latencies, queue depth and uptime
pub struct SlaTracker {
    inner: Mutex<SlaInner>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl SlaTracker {
    /// Create a new [`SlaTracker`] keeping the last `window` samples
    pub fn new(window: usize) -> Self {
        let capacity = window.max(1);
        Self {
            inner: Mutex::new(SlaInner {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                queue_depth: 0,
                downtime: Duration::ZERO,
            }),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Add one processing duration, dropping the oldest sample when full
    pub fn record_sample(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        if inner.samples.len() == inner.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(duration.as_secs_f64());
    }

    /// Percentile summary of the current window
    ///
    /// Sorts a copy of the window, so it is much more expensive than
    /// [`Self::record_sample()`].
    pub fn compliance_snapshot(&self) -> ComplianceSnapshot {
        let samples: Vec<f64> = self.inner.lock().samples.iter().copied().collect();
        ComplianceSnapshot::from_samples(samples)
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.lock().queue_depth = depth;
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue_depth
    }

    /// Account for a period the service was unavailable
    ///
    /// Nothing inside the process detects downtime; an external monitor may
    /// report it here.
    pub fn record_downtime(&self, duration: Duration) {
        self.inner.lock().downtime += duration;
    }

    /// Wall-clock time since the tracker was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Share of the elapsed time not covered by reported downtime
    pub fn uptime_percentage(&self) -> f64 {
        let elapsed = self.started.elapsed();
        let downtime = self.inner.lock().downtime;
        if downtime.is_zero() || elapsed.is_zero() {
            return 100.0;
        }
        100.0 - 100.0 * downtime.min(elapsed).as_secs_f64() / elapsed.as_secs_f64()
    }

    pub fn status(&self) -> SlaStatus {
        let snapshot = self.compliance_snapshot();
        SlaStatus {
            p95: snapshot.p95,
            average: snapshot.average,
            total_processed: snapshot.sample_count,
            sla_met: snapshot.within_target,
            queue_depth: self.queue_depth(),
            uptime_percentage: self.uptime_percentage(),
        }
    }

    /// `warning` when the queue is too deep, or when the latency target is
    /// missed over a meaningful number of samples
    pub fn health(&self) -> Health {
        let snapshot = self.compliance_snapshot();
        let depth = self.queue_depth();
        let mut issues = Vec::new();
        if depth > QUEUE_DEPTH_TARGET {
            issues.push(format!("High queue depth: {depth}"));
        }
        if !snapshot.within_target && snapshot.sample_count > HEALTH_MIN_SAMPLES {
            issues.push(format!(
                "SLA not met: 95th percentile {:.2}s",
                snapshot.p95
            ));
        }
        Health {
            status: if issues.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Warning
            },
            issues,
        }
    }
}
