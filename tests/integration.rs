use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::Path,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use surge::data::TestData;
use surge::faker::Registry;
use surge::inject::Injector;
use surge::pool::ClientPool;
use surge::proxy::{ProxyStrategy, SingleProxyStrategy};
use surge::requester::Requester;
use surge::runtime::Runtime;
use surge::{
    Engine, ErrorKind, IterationResult, Outcome, PlanConfig, Report, ReportSink,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

struct TestServer {
    base_url: String,
    returning_visits: Arc<AtomicU64>,
    orders: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let returning_visits = Arc::new(AtomicU64::new(0));
        let visits = returning_visits.clone();
        let logins = Arc::new(AtomicU64::new(0));
        let orders = Arc::new(Mutex::new(Vec::new()));
        let recorded = orders.clone();

        let app = Router::new()
            .route("/ok", get(|| async move { "ok" }))
            .route(
                "/fail",
                get(|| async move { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/slow",
                get(|| async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "late"
                }),
            )
            .route(
                "/token",
                get(|| async move { Json(json!({"token": "abc", "user": {"id": 7}})) }),
            )
            .route(
                "/whoami",
                get(|headers: HeaderMap| async move {
                    headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous")
                        .to_string()
                }),
            )
            .route("/echo", post(|body: String| async move { body }))
            .route("/greet/:name", get(|Path(name): Path<String>| async move { name }))
            .route(
                "/visit",
                get(move |headers: HeaderMap| {
                    let visits = visits.clone();
                    async move {
                        let returning = headers
                            .get(header::COOKIE)
                            .and_then(|v| v.to_str().ok())
                            .is_some_and(|c| c.contains("visitor=1"));
                        if returning {
                            visits.fetch_add(1, Ordering::SeqCst);
                        }
                        ([(header::SET_COOKIE, "visitor=1; Path=/")], "hello")
                    }
                }),
            )
            .route(
                "/login",
                get(move || {
                    let sid = if logins.fetch_add(1, Ordering::SeqCst) == 0 {
                        "sid=A; Path=/"
                    } else {
                        "sid=B; Path=/"
                    };
                    async move { ([(header::SET_COOKIE, sid)], "welcome") }
                }),
            )
            .route(
                "/order",
                get(move |headers: HeaderMap| {
                    let sid = headers
                        .get(header::COOKIE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|c| c.split("; ").find_map(|p| p.strip_prefix("sid=")))
                        .unwrap_or("-")
                        .to_string();
                    recorded.lock().push(sid);
                    async move { "ordered" }
                }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(
            async move {
                let _ = shutdown_rx.await;
            },
        );

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            returning_visits,
            orders,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Keeps debug iterations and the final report in memory.
#[derive(Default)]
struct CollectSink {
    iterations: Mutex<Vec<IterationResult>>,
    finished: AtomicU64,
}

#[async_trait]
impl ReportSink for CollectSink {
    async fn progress(&self, _summary: &surge::aggregator::Summary) {}

    async fn iteration(&self, result: &IterationResult) -> anyhow::Result<()> {
        self.iterations.lock().push(result.clone());
        Ok(())
    }

    async fn finish(&self, _report: &Report) -> anyhow::Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn run(plan: JsonValue) -> (Report, Arc<CollectSink>) {
    let config: PlanConfig = serde_json::from_value(plan).expect("plan json");
    let sink = Arc::new(CollectSink::default());
    let engine = Engine::new(config)
        .expect("plan should validate")
        .with_sink(sink.clone());
    let report = engine.run_with_cancel(Default::default()).await.unwrap();
    (report, sink)
}

#[tokio::test]
async fn linear_load_counts_every_iteration() {
    let server = TestServer::spawn().await;

    let (report, sink) = run(json!({
        "iteration_count": 20,
        "duration": 1,
        "load_type": "linear",
        "steps": [{"id": 1, "name": "ok", "url": server.url("/ok"), "method": "GET"}]
    }))
    .await;

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(report.summary.success_count, 20);
    assert_eq!(report.summary.fail_count(), 0);
    assert_eq!(report.summary.steps[&1].status_code_dist.get(&200), Some(&20));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(sink.finished.load(Ordering::SeqCst), 1);

    let doc = surge::report::render_json(&report);
    assert_eq!(doc["success_perc"], 100.0);
    assert!(doc["steps"]["1"]["percentiles"]["p99"].is_number());

    server.shutdown().await;
}

#[tokio::test]
async fn repeated_user_carries_cookies_between_iterations() {
    let server = TestServer::spawn().await;

    let (report, _) = run(json!({
        "manual_load": [{"duration": 1, "count": 1}, {"duration": 1, "count": 1}],
        "engine_mode": "repeated-user",
        "steps": [{"id": 1, "url": server.url("/visit"), "method": "GET"}]
    }))
    .await;

    assert_eq!(report.summary.success_count, 2);
    assert_eq!(server.returning_visits.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn repeated_user_login_cookie_is_overwritten_by_the_next_login() {
    let server = TestServer::spawn().await;

    let (report, _) = run(json!({
        "manual_load": [{"duration": 1, "count": 1}, {"duration": 1, "count": 1}],
        "engine_mode": "repeated-user",
        "steps": [
            {"id": 1, "url": server.url("/login"), "method": "GET"},
            {"id": 2, "url": server.url("/order"), "method": "GET"}
        ]
    }))
    .await;

    assert_eq!(report.summary.success_count, 2);
    // the jar keeps one sid per (name, domain, path); the second login replaces it
    assert_eq!(*server.orders.lock(), vec!["A".to_string(), "B".to_string()]);

    server.shutdown().await;
}

#[tokio::test]
async fn distinct_user_starts_every_iteration_fresh() {
    let server = TestServer::spawn().await;

    let (report, _) = run(json!({
        "manual_load": [{"duration": 1, "count": 1}, {"duration": 1, "count": 1}],
        "steps": [{"id": 1, "url": server.url("/visit"), "method": "GET"}]
    }))
    .await;

    assert_eq!(report.summary.success_count, 2);
    assert_eq!(server.returning_visits.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn captures_flow_into_later_steps() {
    let server = TestServer::spawn().await;

    let (report, sink) = run(json!({
        "iteration_count": 1,
        "duration": 1,
        "debug": true,
        "steps": [
            {
                "id": 1,
                "url": server.url("/token"),
                "method": "GET",
                "capture_env": [
                    {"as": "tok", "from": "body", "json_path": "token"},
                    {"as": "user_id", "from": "body", "json_path": "user.id"}
                ]
            },
            {
                "id": 2,
                "url": server.url("/whoami"),
                "method": "GET",
                "headers": {"Authorization": "Bearer {{tok}}"},
                "assertion": ["status_code == 200", "body == \"Bearer abc\""]
            }
        ]
    }))
    .await;

    assert_eq!(report.summary.success_count, 1);
    let iterations = sink.iterations.lock();
    assert_eq!(iterations.len(), 1);
    let steps = &iterations[0].steps;
    assert!(steps[1].failed_assertions.is_empty(), "{:?}", steps[1].failed_assertions);
    assert_eq!(steps[1].env.get("user_id"), Some(&surge::Value::Int(7)));
    assert_eq!(
        steps[1].response_body,
        Some(surge::Value::from("Bearer abc"))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn missing_payload_variable_keeps_literal_text() {
    let server = TestServer::spawn().await;

    let (_, sink) = run(json!({
        "iteration_count": 1,
        "duration": 1,
        "debug": true,
        "steps": [{
            "id": 1,
            "url": server.url("/echo"),
            "method": "POST",
            "headers": {"Content-Type": "text/plain"},
            "payload": "id={{missing}}",
            "assertion": ["body == \"id={{missing}}\""]
        }]
    }))
    .await;

    let iterations = sink.iterations.lock();
    let step = &iterations[0].steps[0];
    assert_eq!(step.status_code, Some(200));
    assert!(step.error.is_none());
    assert!(step.failed_assertions.is_empty(), "{:?}", step.failed_assertions);
    assert_eq!(
        step.failed_captures.get("missing").map(String::as_str),
        Some("not found")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn csv_rows_are_injected() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("users.csv");
    std::fs::write(&csv, "name,age\nada,36\ngrace,45\n").unwrap();

    let (_, sink) = run(json!({
        "iteration_count": 1,
        "duration": 1,
        "debug": true,
        "data": {
            "users": {
                "path": csv.to_string_lossy(),
                "skip_first_line": true,
                "order": "sequential",
                "vars": {"0": {"tag": "name"}, "1": {"tag": "age", "type": "int"}}
            }
        },
        "steps": [{
            "id": 1,
            "url": format!("{}/greet/{{{{data.users.name}}}}", server.base_url),
            "method": "GET",
            "assertion": ["body == \"ada\""]
        }]
    }))
    .await;

    let iterations = sink.iterations.lock();
    let step = &iterations[0].steps[0];
    assert!(step.url.ends_with("/greet/ada"), "{}", step.url);
    assert!(step.failed_assertions.is_empty(), "{:?}", step.failed_assertions);

    server.shutdown().await;
}

#[tokio::test]
async fn slow_responses_are_read_timeouts() {
    let server = TestServer::spawn().await;

    let (report, _) = run(json!({
        "iteration_count": 1,
        "duration": 1,
        "steps": [{"id": 1, "url": server.url("/slow"), "method": "GET", "timeout": 1}]
    }))
    .await;

    let step = &report.summary.steps[&1];
    assert_eq!(report.summary.server_failed_count, 1);
    assert_eq!(
        step.error_dist.get(ErrorKind::ReadTimeout.reason()),
        Some(&1)
    );
    assert!(step.status_code_dist.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn closed_port_is_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (report, _) = run(json!({
        "iteration_count": 2,
        "duration": 1,
        "steps": [{"id": 1, "url": format!("http://{addr}/"), "method": "GET"}]
    }))
    .await;

    let step = &report.summary.steps[&1];
    assert_eq!(report.summary.server_failed_count, 2);
    assert_eq!(
        step.error_dist.get(ErrorKind::ConnRefused.reason()),
        Some(&2)
    );
}

#[tokio::test]
async fn failing_assertions_abort_through_success_criteria() {
    let server = TestServer::spawn().await;

    let (report, _) = run(json!({
        "iteration_count": 30,
        "duration": 3,
        "steps": [{
            "id": 1,
            "url": server.url("/fail"),
            "method": "GET",
            "assertion": ["status_code == 200"]
        }],
        "success_criterias": [{"rule": "fail_count < 1", "abort": true, "delay": 0}]
    }))
    .await;

    assert_eq!(report.outcome, Outcome::Stopped);
    assert_eq!(report.aborted_by.as_deref(), Some("fail_count < 1"));
    assert!(report.summary.assertion_failed_count >= 1);
    assert!(report.summary.total() < 30);
    let codes: Vec<u16> = report.summary.steps[&1].status_code_dist.keys().copied().collect();
    assert_eq!(codes, vec![500]);
    assert_eq!(report.exit_code(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn cancelled_runs_report_stopped() {
    let server = TestServer::spawn().await;
    let config: PlanConfig = serde_json::from_value(json!({
        "iteration_count": 50,
        "duration": 5,
        "steps": [{"id": 1, "url": server.url("/ok"), "method": "GET"}]
    }))
    .unwrap();
    let engine = Engine::new(config)
        .unwrap()
        .with_sink(Arc::new(CollectSink::default()));

    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        trigger.cancel();
    });

    let report = engine.run_with_cancel(cancel).await.unwrap();
    assert_eq!(report.outcome, Outcome::Stopped);
    assert!(report.summary.total() < 50);
    assert_eq!(report.summary.fail_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn phases_fit_inside_the_step_duration() {
    let server = TestServer::spawn().await;

    let (_, sink) = run(json!({
        "iteration_count": 1,
        "duration": 1,
        "debug": true,
        "steps": [{"id": 1, "url": server.url("/token"), "method": "GET"}]
    }))
    .await;

    let iterations = sink.iterations.lock();
    let step = &iterations[0].steps[0];
    assert_eq!(step.status_code, Some(200));
    assert!(step.error.is_none());
    assert!(
        step.duration + Duration::from_millis(5) >= step.phases.sum(),
        "duration {:?} < phases {:?}",
        step.duration,
        step.phases
    );

    server.shutdown().await;
}

#[tokio::test]
async fn missing_url_variable_skips_the_rest_of_the_iteration() {
    let server = TestServer::spawn().await;

    let (report, sink) = run(json!({
        "iteration_count": 1,
        "duration": 1,
        "debug": true,
        "steps": [
            {
                "id": 1,
                "url": server.url("/ok"),
                "method": "GET",
                "capture_env": [{"as": "tok", "from": "body", "json_path": "token"}]
            },
            {"id": 2, "url": server.url("/greet/{{tok}}"), "method": "GET"},
            {"id": 3, "url": server.url("/ok"), "method": "GET"}
        ]
    }))
    .await;

    let iterations = sink.iterations.lock();
    let steps = &iterations[0].steps;
    assert_eq!(steps.len(), 3);
    assert!(steps[0].failed_captures.contains_key("tok"));
    assert_eq!(
        steps[1].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::InvalidRequest)
    );
    assert_eq!(steps[1].status_code, None);
    assert_eq!(steps[2].error.as_ref().map(|e| e.kind), Some(ErrorKind::Skipped));
    assert_eq!(
        report.summary.steps[&2]
            .error_dist
            .get(ErrorKind::InvalidRequest.reason()),
        Some(&1)
    );
    assert!(report.summary.steps[&3].error_dist.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn delayed_criterion_aborts_only_after_the_recheck() {
    let server = TestServer::spawn().await;
    let started = Instant::now();

    let (report, _) = run(json!({
        "iteration_count": 80,
        "duration": 8,
        "steps": [{
            "id": 1,
            "url": server.url("/fail"),
            "method": "GET",
            "assertion": ["status_code == 200"]
        }],
        "success_criterias": [{"rule": "fail_count_perc < 0.5", "abort": true, "delay": 3}]
    }))
    .await;
    let elapsed = started.elapsed();

    assert_eq!(report.outcome, Outcome::Stopped);
    assert_eq!(report.aborted_by.as_deref(), Some("fail_count_perc < 0.5"));
    assert!(elapsed >= Duration::from_secs(3), "aborted after {elapsed:?}");
    assert!(report.summary.total() > 20, "{}", report.summary.total());
    assert!(report.summary.total() < 80, "{}", report.summary.total());
    assert_eq!(report.exit_code(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn load_mode_results_keep_headers_but_not_bodies() {
    let server = TestServer::spawn().await;
    let registry = Arc::new(Registry::new());
    let config: PlanConfig = serde_json::from_value(json!({
        "iteration_count": 1,
        "duration": 1,
        "steps": [{
            "id": 1,
            "url": server.url("/token"),
            "method": "GET",
            "capture_env": [{"as": "tok", "from": "body", "json_path": "token"}]
        }]
    }))
    .unwrap();
    let plan = Arc::new(config.build(&registry).unwrap());

    let proxies: Arc<dyn ProxyStrategy> = Arc::new(SingleProxyStrategy::new(None));
    let requester = Requester::new(&plan, proxies.clone()).unwrap();
    let pool = Arc::new(ClientPool::new(
        plan.engine_mode,
        Vec::new(),
        Url::parse(&server.url("/")).unwrap(),
        1,
    ));
    let runtime = Runtime::new(
        plan.clone(),
        Arc::new(TestData::new(Vec::new())),
        Injector::new(registry),
        requester,
        proxies,
        pool,
    );

    let result = runtime.iterate(0, &CancellationToken::new()).await;
    let step = &result.steps[0];
    assert_eq!(step.status_code, Some(200));
    assert!(step.failed_captures.is_empty());
    assert!(step
        .response_headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("content-type")));
    assert!(step.response_body.is_none());
    assert!(step.env.is_empty());

    server.shutdown().await;
}
