//! Scenario runtime: one iteration over the plan's steps.
//!
//! The iteration environment starts as the plan globals plus one row per
//! CSV source. Each step injects it into the URL, headers and payload,
//! sends the request, extends the environment with its captures and then
//! checks its assertions. Every step yields exactly one [`StepResult`],
//! including steps skipped after an abort.

use crate::cookie::cookie_map;
use crate::data::TestData;
use crate::env::Env;
use crate::error::{ErrorKind, RequestError};
use crate::expression::{self, Scope};
use crate::extract::{self, ExtractError};
use crate::inject::Injector;
use crate::model::{
    CaptureSpec, FailedAssertion, IterationResult, Plan, Selector, Step, StepResult,
};
use crate::pool::ClientPool;
use crate::proxy::ProxyStrategy;
use crate::requester::{Prepared, Requester};
use crate::transport::{Client, Response};
use crate::value::Value;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// Diagnostic recorded when a placeholder has no value.
pub const NOT_FOUND: &str = "not found";

pub struct Runtime {
    plan: Arc<Plan>,
    data: Arc<TestData>,
    injector: Injector,
    requester: Requester,
    proxies: Arc<dyn ProxyStrategy>,
    pool: Arc<ClientPool>,
}

impl Runtime {
    pub fn new(
        plan: Arc<Plan>,
        data: Arc<TestData>,
        injector: Injector,
        requester: Requester,
        proxies: Arc<dyn ProxyStrategy>,
        pool: Arc<ClientPool>,
    ) -> Self {
        Self {
            plan,
            data,
            injector,
            requester,
            proxies,
            pool,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Run iteration `index` with a client borrowed from the pool.
    #[instrument(skip(self, cancel))]
    pub async fn iterate(&self, index: u64, cancel: &CancellationToken) -> IterationResult {
        let client = self.pool.get();
        let result = self.run_iteration(index, &client, cancel).await;
        self.pool.put(client);
        result
    }

    /// Run iteration `index` on `client`.
    pub async fn run_iteration(
        &self,
        index: u64,
        client: &Client,
        cancel: &CancellationToken,
    ) -> IterationResult {
        let started_at = Utc::now();
        let proxy = self.proxies.next_proxy();

        let mut env: Env = self
            .plan
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(self.data.draw(index));

        let mut steps = Vec::with_capacity(self.plan.steps.len());
        let mut aborted = false;
        for step in &self.plan.steps {
            if aborted {
                steps.push(StepResult::failed(step, RequestError::skipped()));
                continue;
            }
            if cancel.is_cancelled() {
                steps.push(StepResult::failed(step, RequestError::intentional()));
                aborted = true;
                continue;
            }

            let (result, abort) = self
                .run_step(step, &mut env, client, proxy.clone(), cancel)
                .await;
            aborted = abort;
            steps.push(result);

            if !aborted {
                if let Some(sleep) = &step.sleep {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(sleep.sample()) => {}
                    }
                }
            }
        }

        IterationResult {
            index,
            started_at,
            proxy: proxy.map(|p| p.to_string()),
            steps,
        }
    }

    /// Run one step. Returns its result and whether the rest of the
    /// iteration must be skipped.
    #[instrument(skip_all, fields(step = step.id))]
    async fn run_step(
        &self,
        step: &Step,
        env: &mut Env,
        client: &Client,
        proxy: Option<Url>,
        cancel: &CancellationToken,
    ) -> (StepResult, bool) {
        let mut result = StepResult::new(step);

        let prepared = match self.prepare(step, env, &mut result) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(step = step.id, error = %err, "could not build request");
                result.error = Some(err);
                return (result, true);
            }
        };
        result.url = prepared.url.to_string();
        result.request_body = prepared.body.clone();

        let response = match self
            .requester
            .send(client, step, &prepared, proxy, cancel)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let abort = err.kind == ErrorKind::Intentional;
                result.request_headers = prepared.headers.iter().cloned().collect();
                result.error = Some(err);
                return (result, abort);
            }
        };

        result.url = response.url.to_string();
        result.method = response.method.to_string();
        result.request_headers = response.request_headers.clone();
        result.status_code = Some(response.status.as_u16());
        result.response_headers = response.headers.clone();
        result.duration = response.duration;
        result.content_length = response.content_length;
        result.phases = response.phases;

        let body = String::from_utf8_lossy(&response.body).into_owned();
        for capture in &step.captures {
            match capture_value(capture, &body, &response) {
                Ok(value) => env.insert(capture.name.clone(), value),
                Err(err) => {
                    debug!(capture = %capture.name, error = %err, "capture failed");
                    result
                        .failed_captures
                        .insert(capture.name.clone(), err.to_string());
                }
            }
        }

        let mut abort = false;
        let scope = StepScope::new(&response, &body, env);
        for assertion in &step.assertions {
            let check = expression::check(&assertion.program, &scope);
            if check.passed {
                continue;
            }
            result.failed_assertions.push(FailedAssertion {
                rule: assertion.rule.clone(),
                received: check.received,
                reason: check.error.map(|e| e.to_string()),
            });
            if assertion.abort {
                debug!(rule = %assertion.rule, "assertion failed, aborting iteration");
                abort = true;
            }
        }

        if self.plan.debug {
            result.response_body = Some(decode_body(&response));
            result.env = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }

        (result, abort)
    }

    /// Inject the environment into the step. A URL that cannot be built
    /// fails the step; header and payload misses keep the literal text.
    fn prepare(
        &self,
        step: &Step,
        env: &Env,
        result: &mut StepResult,
    ) -> Result<Prepared, RequestError> {
        let invalid = |detail: String| RequestError::new(ErrorKind::InvalidRequest, detail);

        let raw_url = self
            .injector
            .inject(&step.url, env)
            .map_err(|e| invalid(format!("url: {e}")))?;
        let url = Url::parse(&crate::config::normalize_url(&raw_url))
            .map_err(|e| invalid(format!("url '{raw_url}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("url '{url}': unsupported scheme")));
        }

        let mut missing = Vec::new();
        let headers = step
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    self.injector.inject_or_keep(value, env, &mut missing),
                )
            })
            .collect();
        let body = step
            .payload
            .as_ref()
            .map(|payload| self.injector.inject_or_keep(payload, env, &mut missing));

        for key in missing {
            result.failed_captures.insert(key, NOT_FOUND.to_string());
        }

        Ok(Prepared { url, headers, body })
    }
}

/// Headers and cookies come from the response metadata; every other
/// selector runs on the body.
fn capture_value(
    capture: &CaptureSpec,
    body: &str,
    response: &Response,
) -> Result<Value, ExtractError> {
    match &capture.selector {
        Selector::Header { key, regex } => {
            let value = extract::header(&response.headers, key)?;
            match regex {
                Some((pattern, match_no)) => {
                    let text = value.as_text().unwrap_or_default().into_owned();
                    pattern.find(&text, *match_no)
                }
                None => Ok(value),
            }
        }
        Selector::Cookie { name, field } => {
            extract::cookie(&response.cookies, name, field.as_deref())
        }
        Selector::JsonPath(path) => extract::json_path(body, path),
        Selector::XmlPath(path) => extract::xml_path(body, path),
        Selector::HtmlPath(path) => extract::html_path(body, path),
        Selector::Regex { pattern, match_no } => pattern.find(body, *match_no),
    }
}

/// Identifiers visible to step assertions.
struct StepScope<'a> {
    status: u16,
    size: u64,
    time_ms: i64,
    body: &'a str,
    headers: &'a BTreeMap<String, String>,
    cookies: BTreeMap<String, Value>,
    env: &'a Env,
}

impl<'a> StepScope<'a> {
    fn new(response: &'a Response, body: &'a str, env: &'a Env) -> Self {
        Self {
            status: response.status.as_u16(),
            size: response.content_length,
            time_ms: response.duration.as_millis() as i64,
            body,
            headers: &response.headers,
            cookies: cookie_map(&response.cookies),
            env,
        }
    }

    fn header(&self, name: &str) -> Option<Value> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| Value::String(v.clone()))
    }
}

impl Scope for StepScope<'_> {
    fn lookup(&self, ident: &str) -> Option<Value> {
        match ident {
            "status_code" => return Some(Value::Int(self.status as i64)),
            "response_size" => return Some(Value::Int(self.size as i64)),
            "response_time" => return Some(Value::Int(self.time_ms)),
            "body" => return Some(Value::String(self.body.to_string())),
            "headers" => {
                return Some(Value::Map(
                    self.headers
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ))
            }
            "cookies" => return Some(Value::Map(self.cookies.clone())),
            "variables" => return Some(self.env.to_value()),
            _ => {}
        }
        if let Some(name) = ident.strip_prefix("headers.") {
            return self.header(name);
        }
        if let Some(path) = ident.strip_prefix("cookies.") {
            return Value::Map(self.cookies.clone()).get_path(path).cloned();
        }
        if let Some(name) = ident.strip_prefix("variables.") {
            return self.env.get(name).cloned();
        }
        self.env.get(ident).cloned()
    }

    fn body(&self) -> Option<&str> {
        Some(self.body)
    }
}

/// Decode a body for debug output: JSON for `application/json`, unescaped
/// text for `text/html`, raw bytes otherwise.
fn decode_body(response: &Response) -> Value {
    let content_type = response
        .headers
        .get("content-type")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    if content_type.contains("application/json") {
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&response.body) {
            return Value::from_json(json);
        }
    }
    if content_type.contains("text/") {
        let text = String::from_utf8_lossy(&response.body);
        if content_type.contains("text/html") {
            return Value::String(unescape_html(&text));
        }
        return Value::String(text.into_owned());
    }
    Value::Bytes(response.body.to_vec())
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", "\u{a0}")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaptureSource, Phases};
    use bytes::Bytes;
    use http::{Method, StatusCode};
    use std::time::Duration;

    fn response(body: &str, headers: &[(&str, &str)]) -> Response {
        Response {
            status: StatusCode::OK,
            url: Url::parse("http://localhost/").unwrap(),
            method: Method::GET,
            request_headers: BTreeMap::new(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            cookies: vec![crate::cookie::ResponseCookie::parse("sid=abc; Path=/").unwrap()],
            body: Bytes::from(body.to_string()),
            content_length: body.len() as u64,
            phases: Phases::default(),
            duration: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_step_scope_identifiers() {
        let resp = response(r#"{"ok":true}"#, &[("content-type", "application/json")]);
        let mut env = Env::new();
        env.insert("user", Value::from_json(serde_json::json!({"id": 7})));
        let body = String::from_utf8_lossy(&resp.body).into_owned();
        let scope = StepScope::new(&resp, &body, &env);

        assert_eq!(scope.lookup("status_code"), Some(Value::Int(200)));
        assert_eq!(scope.lookup("response_time"), Some(Value::Int(42)));
        assert_eq!(scope.lookup("response_size"), Some(Value::Int(11)));
        assert_eq!(
            scope.lookup("headers.Content-Type"),
            Some(Value::from("application/json"))
        );
        assert_eq!(scope.lookup("cookies.sid.value"), Some(Value::from("abc")));
        assert_eq!(scope.lookup("variables.user.id"), Some(Value::Int(7)));
        assert_eq!(scope.lookup("user.id"), Some(Value::Int(7)));
        assert_eq!(scope.lookup("nope"), None);
    }

    #[test]
    fn test_assertions_against_scope() {
        let resp = response(r#"{"name":"Kate"}"#, &[]);
        let env = Env::new();
        let body = String::from_utf8_lossy(&resp.body).into_owned();
        let scope = StepScope::new(&resp, &body, &env);

        let pass = expression::compile(r#"status_code == 200 && json_path("name") == "Kate""#)
            .unwrap();
        assert!(expression::check(&pass, &scope).passed);

        let fail = expression::compile("status_code == 201").unwrap();
        let check = expression::check(&fail, &scope);
        assert!(!check.passed);
        assert_eq!(check.received.get("status_code"), Some(&Value::Int(200)));
    }

    #[test]
    fn test_capture_from_each_source() {
        let resp = response(r#"{"token":"t-42"}"#, &[("x-trace", "id=99")]);
        let body = String::from_utf8_lossy(&resp.body).into_owned();

        let json = CaptureSpec {
            name: "tok".into(),
            source: CaptureSource::Body,
            selector: Selector::JsonPath("token".into()),
        };
        assert_eq!(capture_value(&json, &body, &resp), Ok(Value::from("t-42")));

        let header = CaptureSpec {
            name: "trace".into(),
            source: CaptureSource::Header,
            selector: Selector::Header {
                key: "X-Trace".into(),
                regex: Some((extract::Pattern::new(r"\d+").unwrap(), 0)),
            },
        };
        assert_eq!(capture_value(&header, &body, &resp), Ok(Value::from("99")));

        let cookie = CaptureSpec {
            name: "sid".into(),
            source: CaptureSource::Cookie,
            selector: Selector::Cookie {
                name: "sid".into(),
                field: None,
            },
        };
        assert_eq!(capture_value(&cookie, &body, &resp), Ok(Value::from("abc")));
    }

    #[test]
    fn test_decode_body_by_content_type() {
        let json = response(r#"{"a":1}"#, &[("content-type", "application/json")]);
        assert!(matches!(decode_body(&json), Value::Map(_)));

        let html = response("<p>a &amp; b</p>", &[("content-type", "text/html")]);
        assert_eq!(decode_body(&html), Value::from("<p>a & b</p>"));

        let raw = response("xyz", &[("content-type", "application/octet-stream")]);
        assert_eq!(decode_body(&raw), Value::Bytes(b"xyz".to_vec()));
    }
}
