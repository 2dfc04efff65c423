//! Statistics aggregation over the stream of sample results.
//!
//! The collector stores compact, mergeable raw data (counts, sums, extremes);
//! derived values such as the mean are computed on read so nothing is lost to
//! premature rounding.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ListenerError;
use crate::listener::Listener;
use crate::sample::SampleResult;

/// Raw accumulator for one label (or for the whole run).
///
/// `consume` folds in one result; `merge` combines two accumulators and is
/// associative and commutative, so partial summaries can be combined in any
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    samples_count: u64,
    error_count: u64,
    total_time: Duration,
    min_time: Duration,
    max_time: Duration,
}

impl Default for StatsSummary {
    fn default() -> Self {
        Self {
            samples_count: 0,
            error_count: 0,
            total_time: Duration::ZERO,
            min_time: Duration::MAX,
            max_time: Duration::ZERO,
        }
    }
}

impl StatsSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn consume(&mut self, result: &SampleResult) {
        self.samples_count += 1;
        if !result.success {
            self.error_count += 1;
        }
        self.total_time += result.elapsed;
        self.min_time = self.min_time.min(result.elapsed);
        self.max_time = self.max_time.max(result.elapsed);
    }

    pub(crate) fn merge(&mut self, other: &StatsSummary) {
        self.samples_count += other.samples_count;
        self.error_count += other.error_count;
        self.total_time += other.total_time;
        self.min_time = self.min_time.min(other.min_time);
        self.max_time = self.max_time.max(other.max_time);
    }

    pub fn samples_count(&self) -> u64 {
        self.samples_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn min_time(&self) -> Duration {
        if self.samples_count == 0 {
            Duration::ZERO
        } else {
            self.min_time
        }
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    pub fn mean_time(&self) -> Duration {
        if self.samples_count == 0 {
            Duration::ZERO
        } else {
            self.total_time.div_f64(self.samples_count as f64)
        }
    }
}

/// A listener failure that was reported instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    /// Name of the listener that failed.
    pub listener: String,
    pub message: String,
}

/// Finalized, read-only view of a run's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlanStats {
    overall: StatsSummary,
    by_label: BTreeMap<String, StatsSummary>,
    warnings: Vec<RunWarning>,
    duration: Duration,
}

impl TestPlanStats {
    /// Combined summary across every label observed during the run.
    pub fn overall(&self) -> &StatsSummary {
        &self.overall
    }

    /// Distinct labels observed, in sorted order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.by_label.keys().map(String::as_str)
    }

    pub fn by_label(&self, label: &str) -> Option<&StatsSummary> {
        self.by_label.get(label)
    }

    /// Listener failures collected under the report-and-continue policy.
    pub fn warnings(&self) -> &[RunWarning] {
        &self.warnings
    }

    /// Wall-clock duration of the whole run.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    overall: StatsSummary,
    by_label: BTreeMap<String, StatsSummary>,
}

/// Built-in listener that feeds [`TestPlanStats`].
///
/// Shared by every virtual user in the run; updates are serialized through a
/// short-held lock so concurrent delivery never loses or double-counts a
/// result.
#[derive(Debug, Default)]
pub struct StatsCollector {
    inner: Mutex<CollectorState>,
}

impl StatsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, result: &SampleResult) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.overall.consume(result);
        state
            .by_label
            .entry(result.label.clone())
            .or_default()
            .consume(result);
    }

    pub(crate) fn snapshot(&self, warnings: Vec<RunWarning>, duration: Duration) -> TestPlanStats {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        TestPlanStats {
            overall: state.overall.clone(),
            by_label: state.by_label.clone(),
            warnings,
            duration,
        }
    }
}

#[async_trait]
impl Listener for StatsCollector {
    fn name(&self) -> &str {
        "stats"
    }

    async fn handle(&self, result: &SampleResult) -> Result<(), ListenerError> {
        self.record(result);
        Ok(())
    }
}
