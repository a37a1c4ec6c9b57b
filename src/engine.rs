//! Load test engine.
//!
//! Builds every collaborator from a plan, runs the scheduler against the
//! scenario runtime and hands the final summary to the report sink.

use crate::aggregator::{self, SharedSummary, Summary, RESERVOIR_SIZE};
use crate::config::PlanConfig;
use crate::data::TestData;
use crate::error::PlanError;
use crate::faker::Registry;
use crate::inject::Injector;
use crate::model::Plan;
use crate::pool::ClientPool;
use crate::proxy::{ProxyStrategy, SingleProxyStrategy};
use crate::report::{sink_for, Report, ReportSink};
use crate::requester::Requester;
use crate::runtime::Runtime;
use crate::scheduler::{build_vector, Outcome, Scheduler};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// How often the sink is told about progress.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Jar seeding target when the first step has no usable URL yet.
const FALLBACK_SEED_TARGET: &str = "http://localhost/";

pub struct Engine {
    plan: Arc<Plan>,
    registry: Arc<Registry>,
    sink: Arc<dyn ReportSink>,
}

impl Engine {
    /// Validate `config` and build an engine reporting to its output.
    pub fn new(config: PlanConfig) -> Result<Self, PlanError> {
        let registry = Arc::new(Registry::new());
        let plan = config.build(&registry)?;
        let sink = sink_for(plan.output);
        Ok(Self {
            plan: Arc::new(plan),
            registry,
            sink,
        })
    }

    /// Report to `sink` instead of the plan's output.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Run until the load shape is exhausted or Ctrl-C is pressed.
    pub async fn run(&self) -> Result<Report> {
        let cancel = CancellationToken::new();
        let signal = cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping test");
                signal.cancel();
            }
        });

        let report = self.run_with_cancel(cancel).await;
        ctrl_c.abort();
        report
    }

    /// Run until the load shape is exhausted or `cancel` fires.
    #[instrument(skip_all, fields(iterations = self.plan.iteration_count, duration = self.plan.duration))]
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> Result<Report> {
        let plan = self.plan.clone();
        info!(
            "Starting load test: {} iteration(s) over {}s, {} step(s)",
            plan.iteration_count,
            plan.duration,
            plan.steps.len()
        );

        let data = TestData::load(&plan.data)
            .await
            .context("Failed to load test data")?;
        let proxies: Arc<dyn ProxyStrategy> =
            Arc::new(SingleProxyStrategy::new(plan.proxy.clone()));
        let requester = Requester::new(&plan, proxies.clone())?;

        let vector = build_vector(plan.iteration_count, plan.duration, &plan.load);
        let pool = Arc::new(ClientPool::new(
            plan.engine_mode,
            plan.seed_cookies.clone(),
            seed_target(&plan).context("Failed to pick a cookie seeding target")?,
            ClientPool::capacity_for(&vector),
        ));
        let runtime = Arc::new(Runtime::new(
            plan.clone(),
            Arc::new(data),
            Injector::new(self.registry.clone()),
            requester,
            proxies.clone(),
            pool.clone(),
        ));
        let summary: SharedSummary = Arc::new(RwLock::new(Summary::new(
            plan.steps.iter().map(|s| (s.id, s.name.as_str())),
            RESERVOIR_SIZE,
        )));

        let (outcome, aborted_by) = if plan.debug {
            (self.run_debug(&runtime, &summary, &cancel).await?, None)
        } else {
            self.run_load(plan.as_ref(), vector, &runtime, &summary, &cancel)
                .await?
        };

        let snapshot = summary.read().clone();
        let criteria = aggregator::evaluate(&plan.success_criteria, &snapshot);
        let report = Report {
            outcome,
            summary: snapshot,
            criteria,
            aborted_by,
        };
        self.sink
            .finish(&report)
            .await
            .context("Failed to write report")?;

        pool.drain();
        proxies.close();
        info!(
            "Load test finished: {} ok, {} failed",
            report.summary.success_count,
            report.summary.fail_count()
        );
        Ok(report)
    }

    /// One iteration, run inline and printed in full.
    async fn run_debug(
        &self,
        runtime: &Runtime,
        summary: &SharedSummary,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        info!("Debug mode: running a single iteration");
        let result = runtime.iterate(0, cancel).await;
        self.sink
            .iteration(&result)
            .await
            .context("Failed to write debug output")?;
        summary.write().record(&result);
        Ok(if cancel.is_cancelled() {
            Outcome::Stopped
        } else {
            Outcome::Done
        })
    }

    async fn run_load(
        &self,
        plan: &Plan,
        vector: Vec<u64>,
        runtime: &Arc<Runtime>,
        summary: &SharedSummary,
        cancel: &CancellationToken,
    ) -> Result<(Outcome, Option<String>)> {
        let (tx, rx) = mpsc::channel(plan.iteration_count.max(1) as usize);
        let consumer = tokio::spawn(aggregator::consume(rx, summary.clone()));

        let stop = CancellationToken::new();
        let watcher = tokio::spawn(aggregator::watch(
            plan.success_criteria.clone(),
            summary.clone(),
            cancel.clone(),
            stop.clone(),
        ));
        let progress = tokio::spawn(report_progress(
            self.sink.clone(),
            summary.clone(),
            stop.clone(),
        ));

        let tracker = TaskTracker::new();
        let scheduler = Scheduler::new(vector);
        debug!("Scheduling {} iteration(s)", scheduler.total());
        let outcome = scheduler
            .run(cancel, &tracker, |index| {
                let runtime = runtime.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                async move {
                    let result = runtime.iterate(index, &cancel).await;
                    if tx.send(result).await.is_err() {
                        warn!(index, "aggregator gone, dropping iteration result");
                    }
                }
            })
            .await;

        tracker.close();
        tracker.wait().await;
        drop(tx);
        consumer.await.context("Aggregator task failed")?;

        stop.cancel();
        let aborted_by = watcher.await.context("Success criteria watcher failed")?;
        progress.await.context("Progress task failed")?;

        let outcome = if cancel.is_cancelled() {
            Outcome::Stopped
        } else {
            outcome
        };
        Ok((outcome, aborted_by))
    }
}

async fn report_progress(
    sink: Arc<dyn ReportSink>,
    summary: SharedSummary,
    stop: CancellationToken,
) {
    let mut ticker = interval(PROGRESS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let snapshot = summary.read().clone();
                sink.progress(&snapshot).await;
            }
        }
    }
}

/// URL the seed cookies are filtered against: the first step's, when it
/// parses without injection.
fn seed_target(plan: &Plan) -> Result<Url, url::ParseError> {
    match plan.steps.first().and_then(|s| Url::parse(&s.url).ok()) {
        Some(url) => Ok(url),
        None => Url::parse(FALLBACK_SEED_TARGET),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> PlanConfig {
        PlanConfig::from_json(&format!(
            r#"{{
                "iteration_count": 1,
                "duration": 1,
                "steps": [{{"id": 1, "url": "{url}", "method": "GET"}}]
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_seed_target_uses_first_step() {
        let engine = Engine::new(config("https://shop.test/cart")).unwrap();
        assert_eq!(seed_target(engine.plan()).unwrap().as_str(), "https://shop.test/cart");
    }

    #[test]
    fn test_seed_target_falls_back_for_placeholders() {
        let mut c = config("{{base}}/cart");
        c.env.insert("base".into(), "http://shop.test".into());
        let engine = Engine::new(c).unwrap();
        assert_eq!(seed_target(engine.plan()).unwrap().as_str(), FALLBACK_SEED_TARGET);
    }

    #[test]
    fn test_invalid_plan_is_rejected() {
        let c = PlanConfig::from_json(
            r#"{"iteration_count": 1, "duration": 1,
                "steps": [{"id": 0, "url": "http://x.test", "method": "GET"}]}"#,
        )
        .unwrap();
        assert!(Engine::new(c).is_err());
    }
}
