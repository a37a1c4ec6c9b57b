//! Result aggregation.
//!
//! One task consumes iteration results from a channel and is the only
//! writer of the [`Summary`]. Readers (progress logging, the success
//! criteria watcher, the final report) take snapshots through the shared
//! lock.

use crate::error::ErrorKind;
use crate::expression::{self, nearest_rank, Scope};
use crate::model::{FailedAssertion, IterationResult, Phases, StepResult, TestAssertion};
use crate::value::Value;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default reservoir size for duration percentiles.
pub const RESERVOIR_SIZE: usize = 10_000;

/// Received-value samples kept per failing assertion.
const ASSERTION_SAMPLES: usize = 5;

pub type SharedSummary = Arc<RwLock<Summary>>;

/// Fixed-size uniform sample of an unbounded stream.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<f64>,
    rng: StdRng,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: 0,
            samples: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn add(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.samples[slot as usize] = value;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Nearest-rank percentile of the sample, `pct` in `0..=100`.
    pub fn percentile(&self, pct: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        Some(sorted[nearest_rank(pct, sorted.len())])
    }
}

/// Running means of the request phases, in seconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Durations {
    pub dns: f64,
    pub connection: f64,
    pub tls: f64,
    pub request_write: f64,
    pub server_processing: f64,
    pub response_read: f64,
    pub total: f64,
    #[serde(skip)]
    count: u64,
}

impl Durations {
    fn record(&mut self, phases: &Phases, total: Duration) {
        self.count += 1;
        let n = self.count as f64;
        let update = |mean: &mut f64, d: Duration| *mean += (d.as_secs_f64() - *mean) / n;
        update(&mut self.dns, phases.dns);
        update(&mut self.connection, phases.connect);
        update(&mut self.tls, phases.tls);
        update(&mut self.request_write, phases.write);
        update(&mut self.server_processing, phases.server_processing);
        update(&mut self.response_read, phases.read);
        update(&mut self.total, total);
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssertionStat {
    pub count: u64,
    pub received: Vec<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub status_code_dist: BTreeMap<u16, u64>,
    pub error_dist: BTreeMap<String, u64>,
    pub assertion_dist: BTreeMap<String, AssertionStat>,
    pub success_count: u64,
    pub fail_count: u64,
    pub durations: Durations,
    #[serde(skip)]
    pub reservoir: Reservoir,
}

impl StepSummary {
    fn new(name: &str, reservoir: usize) -> Self {
        Self {
            name: name.to_string(),
            status_code_dist: BTreeMap::new(),
            error_dist: BTreeMap::new(),
            assertion_dist: BTreeMap::new(),
            success_count: 0,
            fail_count: 0,
            durations: Durations::default(),
            reservoir: Reservoir::new(reservoir),
        }
    }

    fn record(&mut self, step: &StepResult) {
        if let Some(code) = step.status_code {
            *self.status_code_dist.entry(code).or_default() += 1;
            self.durations.record(&step.phases, step.duration);
            self.reservoir.add(step.duration.as_secs_f64());
        }
        if let Some(err) = &step.error {
            *self.error_dist.entry(err.reason().to_string()).or_default() += 1;
        }
        for failed in &step.failed_assertions {
            self.record_assertion(failed);
        }
        if step.is_success() {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
    }

    fn record_assertion(&mut self, failed: &FailedAssertion) {
        let stat = self.assertion_dist.entry(failed.rule.clone()).or_default();
        stat.count += 1;
        if stat.received.len() < ASSERTION_SAMPLES {
            stat.received.push(failed.received.clone());
        }
    }

    pub fn total(&self) -> u64 {
        self.success_count + self.fail_count
    }
}

/// The live test summary.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub success_count: u64,
    pub server_failed_count: u64,
    pub assertion_failed_count: u64,
    /// Mean duration of successful iterations, in seconds.
    pub avg_duration: f64,
    pub steps: BTreeMap<u32, StepSummary>,
    #[serde(skip)]
    pub iteration_durations: Reservoir,
    #[serde(skip)]
    reservoir_size: usize,
}

impl Summary {
    /// An empty summary with one entry per `(id, name)` step.
    pub fn new<'a>(steps: impl IntoIterator<Item = (u32, &'a str)>, reservoir_size: usize) -> Self {
        Self {
            success_count: 0,
            server_failed_count: 0,
            assertion_failed_count: 0,
            avg_duration: 0.0,
            steps: steps
                .into_iter()
                .map(|(id, name)| (id, StepSummary::new(name, reservoir_size)))
                .collect(),
            iteration_durations: Reservoir::new(reservoir_size),
            reservoir_size,
        }
    }

    pub fn fail_count(&self) -> u64 {
        self.server_failed_count + self.assertion_failed_count
    }

    pub fn total(&self) -> u64 {
        self.success_count + self.fail_count()
    }

    /// Failed share of finished iterations, `0.0..=1.0`.
    pub fn fail_perc(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.fail_count() as f64 / total as f64,
        }
    }

    /// Fold one iteration in. Cancelled iterations are ignored so shutdown
    /// does not show up as failures.
    pub fn record(&mut self, result: &IterationResult) {
        if result.is_cancelled() {
            return;
        }

        let mut server_failed = false;
        let mut assertion_failed = false;
        for step in &result.steps {
            if step.error.as_ref().is_some_and(|e| e.kind == ErrorKind::Skipped) {
                continue;
            }
            if step.error.is_some() {
                server_failed = true;
            } else if !step.failed_assertions.is_empty() {
                assertion_failed = true;
            }
            let reservoir_size = self.reservoir_size;
            self.steps
                .entry(step.step_id)
                .or_insert_with(|| StepSummary::new(&step.step_name, reservoir_size))
                .record(step);
        }

        let duration = result.duration();
        self.iteration_durations.add(duration.as_secs_f64() * 1000.0);
        if server_failed {
            self.server_failed_count += 1;
        } else if assertion_failed {
            self.assertion_failed_count += 1;
        } else {
            self.success_count += 1;
            self.avg_duration +=
                (duration.as_secs_f64() - self.avg_duration) / self.success_count as f64;
        }
    }

    /// Scope for test-wide assertions.
    pub fn totals(&self) -> Totals {
        Totals {
            fail_count: self.fail_count(),
            fail_count_perc: self.fail_perc(),
            iteration_duration: self
                .iteration_durations
                .samples()
                .iter()
                .map(|&ms| Value::Float(ms))
                .collect(),
        }
    }
}

/// Running totals exposed to success criteria.
#[derive(Debug, Clone)]
pub struct Totals {
    pub fail_count: u64,
    pub fail_count_perc: f64,
    /// Iteration durations in milliseconds.
    pub iteration_duration: Vec<Value>,
}

impl Scope for Totals {
    fn lookup(&self, ident: &str) -> Option<Value> {
        match ident {
            "fail_count" => Some(Value::Int(self.fail_count as i64)),
            "fail_count_perc" => Some(Value::Float(self.fail_count_perc)),
            "iteration_duration" => Some(Value::List(self.iteration_duration.clone())),
            _ => None,
        }
    }
}

/// Consume iteration results until every sender is gone.
pub async fn consume(mut rx: mpsc::Receiver<IterationResult>, summary: SharedSummary) {
    let mut received = 0u64;
    while let Some(result) = rx.recv().await {
        received += 1;
        summary.write().record(&result);
    }
    debug!("Aggregator drained after {} iterations", received);
}

/// Outcome of one success criterion against the final summary.
#[derive(Debug, Clone, Serialize)]
pub struct CriteriaResult {
    pub rule: String,
    pub passed: bool,
    pub received: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Check every criterion against `summary`.
pub fn evaluate(criteria: &[TestAssertion], summary: &Summary) -> Vec<CriteriaResult> {
    let totals = summary.totals();
    criteria
        .iter()
        .map(|c| {
            let check = expression::check(&c.program, &totals);
            CriteriaResult {
                rule: c.rule.clone(),
                passed: check.passed,
                received: check.received,
                reason: check.error.map(|e| e.to_string()),
            }
        })
        .collect()
}

/// Re-check the aborting success criteria every second. A failing rule
/// with no delay cancels the test at once; otherwise it is checked again
/// once its delay has passed and cancels the test if it still fails.
///
/// Returns the rule that aborted the test, or `None` when `stop` fires
/// first.
pub async fn watch(
    criteria: Vec<TestAssertion>,
    summary: SharedSummary,
    cancel: CancellationToken,
    stop: CancellationToken,
) -> Option<String> {
    let aborting: Vec<TestAssertion> = criteria.into_iter().filter(|c| c.abort).collect();
    if aborting.is_empty() {
        return None;
    }

    let mut pending: BTreeMap<usize, Instant> = BTreeMap::new();
    let mut ticker = interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        let totals = summary.read().totals();
        let now = Instant::now();
        for (i, criterion) in aborting.iter().enumerate() {
            let failing = !expression::check(&criterion.program, &totals).passed;
            match pending.get(&i) {
                Some(&deadline) if now >= deadline => {
                    if failing {
                        warn!("Success criteria '{}' still failing, aborting test", criterion.rule);
                        cancel.cancel();
                        return Some(criterion.rule.clone());
                    }
                    pending.remove(&i);
                }
                Some(_) => {}
                None if failing && criterion.delay.is_zero() => {
                    warn!("Success criteria '{}' failed, aborting test", criterion.rule);
                    cancel.cancel();
                    return Some(criterion.rule.clone());
                }
                None if failing => {
                    info!(
                        "Success criteria '{}' failing, re-checking in {:?}",
                        criterion.rule, criterion.delay
                    );
                    pending.insert(i, now + criterion.delay);
                }
                None => {}
            }
        }
    }
}
