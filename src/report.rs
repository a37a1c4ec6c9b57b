//! Report sinks.

use crate::aggregator::{CriteriaResult, StepSummary, Summary};
use crate::model::{IterationResult, OutputKind};
use crate::scheduler::Outcome;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value as Json};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

/// Percentiles reported per step.
pub const PERCENTILES: [(&str, f64); 5] = [
    ("p99", 99.0),
    ("p95", 95.0),
    ("p90", 90.0),
    ("p80", 80.0),
    ("p50", 50.0),
];

/// Everything known at the end of a test.
#[derive(Debug, Clone)]
pub struct Report {
    pub outcome: Outcome,
    pub summary: Summary,
    pub criteria: Vec<CriteriaResult>,
    /// Rule that cancelled the test early, if any.
    pub aborted_by: Option<String>,
}

impl Report {
    pub fn criteria_passed(&self) -> bool {
        self.aborted_by.is_none() && self.criteria.iter().all(|c| c.passed)
    }

    /// Process exit code: 0 when every success criterion holds.
    pub fn exit_code(&self) -> i32 {
        if self.criteria_passed() {
            0
        } else {
            1
        }
    }
}

/// Where progress and results go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Called periodically while the test runs.
    async fn progress(&self, summary: &Summary) {
        info!(
            "Progress: {} iterations ({} ok, {} failed)",
            summary.total(),
            summary.success_count,
            summary.fail_count()
        );
    }

    /// Called with each iteration in debug mode.
    async fn iteration(&self, result: &IterationResult) -> Result<()>;

    /// Called once with the final report.
    async fn finish(&self, report: &Report) -> Result<()>;
}

/// Sink for an output kind.
pub fn sink_for(kind: OutputKind) -> Arc<dyn ReportSink> {
    match kind {
        OutputKind::Stdout => Arc::new(StdoutSink),
        OutputKind::StdoutJson => Arc::new(JsonSink),
    }
}

/// Human-readable summary on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl ReportSink for StdoutSink {
    async fn iteration(&self, result: &IterationResult) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(result)?);
        Ok(())
    }

    async fn finish(&self, report: &Report) -> Result<()> {
        print!("{}", render_text(report));
        Ok(())
    }
}

/// A single JSON document on stdout.
#[derive(Debug, Default)]
pub struct JsonSink;

#[async_trait]
impl ReportSink for JsonSink {
    async fn progress(&self, _summary: &Summary) {}

    async fn iteration(&self, result: &IterationResult) -> Result<()> {
        println!("{}", serde_json::to_string(result)?);
        Ok(())
    }

    async fn finish(&self, report: &Report) -> Result<()> {
        println!("{}", serde_json::to_string(&render_json(report))?);
        Ok(())
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn perc(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

fn step_durations(step: &StepSummary) -> Json {
    let d = &step.durations;
    json!({
        "dns": round3(d.dns),
        "connection": round3(d.connection),
        "tls": round3(d.tls),
        "request_write": round3(d.request_write),
        "server_processing": round3(d.server_processing),
        "response_read": round3(d.response_read),
        "total": round3(d.total),
    })
}

fn step_percentiles(step: &StepSummary) -> Option<Json> {
    if step.reservoir.is_empty() {
        return None;
    }
    let mut out = Map::new();
    for (name, pct) in PERCENTILES {
        if let Some(v) = step.reservoir.percentile(pct) {
            out.insert(name.to_string(), json!(round3(v)));
        }
    }
    Some(Json::Object(out))
}

/// The machine-readable report.
pub fn render_json(report: &Report) -> Json {
    let summary = &report.summary;
    let total = summary.total();

    let mut steps = Map::new();
    for (id, step) in &summary.steps {
        let mut entry = json!({
            "name": step.name,
            "status_code_dist": step.status_code_dist,
            "error_dist": step.error_dist,
            "assertion_dist": step.assertion_dist,
            "durations": step_durations(step),
            "success_count": step.success_count,
            "fail_count": step.fail_count,
            "success_perc": perc(step.success_count, step.total()),
            "fail_perc": perc(step.fail_count, step.total()),
        });
        if let (Some(p), Some(obj)) = (step_percentiles(step), entry.as_object_mut()) {
            obj.insert("percentiles".to_string(), p);
        }
        steps.insert(id.to_string(), entry);
    }

    let mut doc = json!({
        "status": match report.outcome {
            Outcome::Done => "done",
            Outcome::Stopped => "stopped",
        },
        "success_perc": perc(summary.success_count, total),
        "fail_perc": perc(summary.fail_count(), total),
        "success_count": summary.success_count,
        "fail_count": summary.fail_count(),
        "server_fail_count": summary.server_failed_count,
        "assertion_fail_count": summary.assertion_failed_count,
        "avg_duration": round3(summary.avg_duration),
        "steps": steps,
    });
    if let Some(obj) = doc.as_object_mut() {
        if !report.criteria.is_empty() {
            obj.insert("success_criterias".to_string(), json!(report.criteria));
        }
        if let Some(rule) = &report.aborted_by {
            obj.insert("aborted_by".to_string(), json!(rule));
        }
    }
    doc
}

/// The human-readable report.
pub fn render_text(report: &Report) -> String {
    let summary = &report.summary;
    let total = summary.total();
    let mut out = String::new();

    let _ = writeln!(out);
    let _ = writeln!(out, "RESULT");
    let _ = writeln!(out, "-------------------------------------");
    let _ = writeln!(out, "Total Iterations:  {total}");
    let _ = writeln!(
        out,
        "Success Count:     {:<8} ({}%)",
        summary.success_count,
        perc(summary.success_count, total)
    );
    let _ = writeln!(
        out,
        "Failed Count:      {:<8} ({}%)",
        summary.fail_count(),
        perc(summary.fail_count(), total)
    );
    let _ = writeln!(out, "Avg Duration:      {:.3}s", summary.avg_duration);
    if report.outcome == Outcome::Stopped {
        let _ = writeln!(out, "Status:            stopped");
    }

    for (id, step) in &summary.steps {
        let _ = writeln!(out);
        let label = if step.name.is_empty() {
            format!("Step {id}")
        } else {
            format!("Step {id} ({})", step.name)
        };
        let _ = writeln!(out, "{label}");
        let _ = writeln!(
            out,
            "  Success: {} ({}%)   Failed: {} ({}%)",
            step.success_count,
            perc(step.success_count, step.total()),
            step.fail_count,
            perc(step.fail_count, step.total())
        );

        if !step.status_code_dist.is_empty() {
            let _ = writeln!(out, "  Status Code (Count)");
            for (code, count) in &step.status_code_dist {
                let _ = writeln!(out, "    [{code}]  {count}");
            }
        }
        if !step.error_dist.is_empty() {
            let _ = writeln!(out, "  Error Distribution (Count:Reason)");
            for (reason, count) in &step.error_dist {
                let _ = writeln!(out, "    [{count}]  {reason}");
            }
        }
        if !step.assertion_dist.is_empty() {
            let _ = writeln!(out, "  Failed Assertions (Count:Rule)");
            for (rule, stat) in &step.assertion_dist {
                let _ = writeln!(out, "    [{}]  {}", stat.count, rule);
            }
        }

        let d = &step.durations;
        let _ = writeln!(out, "  Durations (Avg)");
        for (name, value) in [
            ("DNS", d.dns),
            ("Connection", d.connection),
            ("TLS", d.tls),
            ("Request Write", d.request_write),
            ("Server Processing", d.server_processing),
            ("Response Read", d.response_read),
            ("Total", d.total),
        ] {
            let _ = writeln!(out, "    {name:<18}: {:.4}s", value);
        }
        if !step.reservoir.is_empty() {
            let line: Vec<String> = PERCENTILES
                .iter()
                .filter_map(|(name, pct)| {
                    step.reservoir
                        .percentile(*pct)
                        .map(|v| format!("{name} {v:.3}s"))
                })
                .collect();
            let _ = writeln!(out, "  Percentiles: {}", line.join(", "));
        }
    }

    if !report.criteria.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Success Criteria");
        for c in &report.criteria {
            let mark = if c.passed { "PASS" } else { "FAIL" };
            let _ = writeln!(out, "  [{mark}] {}", c.rule);
        }
    }
    if let Some(rule) = &report.aborted_by {
        let _ = writeln!(out, "Test aborted by '{rule}'");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RequestError};
    use crate::model::{HttpMethod, Step, StepFlags, StepResult, TlsMaterial};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn result(status: Option<u16>, ms: u64, error: Option<RequestError>) -> IterationResult {
        let step = Step {
            id: 1,
            name: "home".into(),
            method: HttpMethod::Get,
            url: "http://localhost/".into(),
            headers: BTreeMap::new(),
            payload: None,
            auth: None,
            tls: TlsMaterial::default(),
            timeout: Duration::from_secs(1),
            sleep: None,
            captures: vec![],
            assertions: vec![],
            flags: StepFlags::default(),
        };
        let mut r = StepResult::new(&step);
        r.status_code = status;
        r.duration = Duration::from_millis(ms);
        r.error = error;
        IterationResult {
            index: 0,
            started_at: Utc::now(),
            proxy: None,
            steps: vec![r],
        }
    }

    fn report() -> Report {
        let mut summary = Summary::new([(1, "home")], 100);
        summary.record(&result(Some(200), 1234, None));
        summary.record(&result(Some(200), 1000, None));
        summary.record(&result(Some(200), 1000, None));
        summary.record(&result(
            None,
            0,
            Some(RequestError::new(ErrorKind::ReadTimeout, "slow")),
        ));
        Report {
            outcome: Outcome::Done,
            summary,
            criteria: vec![],
            aborted_by: None,
        }
    }

    #[test]
    fn test_json_report_shape() {
        let doc = render_json(&report());
        assert_eq!(doc["success_count"], 3);
        assert_eq!(doc["fail_count"], 1);
        assert_eq!(doc["success_perc"], 75.0);
        assert_eq!(doc["avg_duration"], 1.078);

        let step = &doc["steps"]["1"];
        assert_eq!(step["name"], "home");
        assert_eq!(step["status_code_dist"]["200"], 3);
        assert_eq!(step["error_dist"]["read timeout"], 1);
        assert_eq!(step["percentiles"]["p99"], 1.234);
        assert_eq!(step["fail_perc"], 25.0);
    }

    #[test]
    fn test_text_report_mentions_steps() {
        let text = render_text(&report());
        assert!(text.contains("Success Count:     3"));
        assert!(text.contains("Step 1 (home)"));
        assert!(text.contains("[200]  3"));
        assert!(text.contains("read timeout"));
        assert!(text.contains("Server Processing"));
    }

    #[test]
    fn test_criteria_verdict() {
        let mut r = report();
        assert!(r.criteria_passed());
        assert_eq!(r.exit_code(), 0);
        r.aborted_by = Some("fail_count < 1".into());
        assert!(!r.criteria_passed());
        assert_eq!(r.exit_code(), 1);
    }
}
