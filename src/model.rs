//! Plan and result types.
//!
//! A [`Plan`] is built once from configuration, validated, and then shared
//! read-only by every iteration. Iterations report back through
//! [`IterationResult`] values.

use crate::cookie::SeedCookie;
use crate::data::CsvConf;
use crate::error::RequestError;
use crate::expression::Program;
use crate::extract::Pattern;
use crate::value::Value;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Width of one scheduler tick.
pub const TICK: Duration = Duration::from_millis(100);

/// Number of ticks in one second.
pub const TICKS_PER_SECOND: usize = 10;

/// Longest accepted inter-step sleep, in milliseconds.
pub const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Linear,
    Incremental,
    Waved,
}

/// One `(duration, count)` segment of an explicit load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub duration: u64,
    pub count: u64,
}

/// How the iteration count is spread over the test duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadShape {
    Linear,
    Incremental,
    Waved,
    Explicit(Vec<Segment>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineMode {
    #[default]
    DistinctUser,
    RepeatedUser,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    #[default]
    Stdout,
    StdoutJson,
}

/// HTTP methods a step may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "PATCH" => HttpMethod::Patch,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            other => return Err(format!("unsupported method '{other}'")),
        })
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for http::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Options => http::Method::OPTIONS,
        }
    }
}

/// Delay after a step: fixed, or sampled uniformly from `min..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sleep {
    Fixed(u64),
    Range { min: u64, max: u64 },
}

impl Sleep {
    /// Parse `"<ms>"` or `"<min>-<max>"`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let number = |s: &str| {
            let s = s.trim();
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("sleep '{text}' is not <ms> or <min>-<max>"));
            }
            s.parse::<u64>().map_err(|e| format!("sleep '{text}': {e}"))
        };
        let sleep = match text.split_once('-') {
            Some((min, max)) => {
                let (min, max) = (number(min)?, number(max)?);
                if min > max {
                    return Err(format!("sleep '{text}': min is greater than max"));
                }
                Sleep::Range { min, max }
            }
            None => Sleep::Fixed(number(text)?),
        };
        let upper = match sleep {
            Sleep::Fixed(ms) => ms,
            Sleep::Range { max, .. } => max,
        };
        if upper > MAX_SLEEP_MS {
            return Err(format!("sleep '{text}' exceeds {MAX_SLEEP_MS} ms"));
        }
        Ok(sleep)
    }

    pub fn sample(&self) -> Duration {
        let ms = match *self {
            Sleep::Fixed(ms) => ms,
            Sleep::Range { min, max } => rand::thread_rng().gen_range(min..=max),
        };
        Duration::from_millis(ms)
    }
}

/// Transport switches read from a step's `others` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFlags {
    pub keep_alive: bool,
    pub disable_redirect: bool,
    pub disable_compression: bool,
    pub h2: bool,
    pub hostname: Option<String>,
}

impl Default for StepFlags {
    fn default() -> Self {
        Self {
            keep_alive: true,
            disable_redirect: false,
            disable_compression: false,
            h2: false,
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// PEM material for TLS on one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Client certificate chain and its private key.
    pub client_cert: Option<(Vec<u8>, Vec<u8>)>,
    /// CA bundle used to verify the server. Verification is off without it.
    pub ca_cert: Option<Vec<u8>>,
}

impl TlsMaterial {
    pub fn is_empty(&self) -> bool {
        self.client_cert.is_none() && self.ca_cert.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    #[default]
    Body,
    Header,
    Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    JsonPath(String),
    XmlPath(String),
    HtmlPath(String),
    Regex { pattern: Pattern, match_no: usize },
    Header { key: String, regex: Option<(Pattern, usize)> },
    Cookie { name: String, field: Option<String> },
}

/// Extract one value from a response into the environment under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub name: String,
    pub source: CaptureSource,
    pub selector: Selector,
}

/// A compiled step assertion.
#[derive(Debug, Clone)]
pub struct StepAssertion {
    pub rule: String,
    pub program: Arc<Program>,
    pub abort: bool,
}

/// A compiled test-wide assertion over the running totals.
#[derive(Debug, Clone)]
pub struct TestAssertion {
    pub rule: String,
    pub program: Arc<Program>,
    pub abort: bool,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub id: u32,
    pub name: String,
    pub method: HttpMethod,
    /// Absolute URL, possibly holding `{{placeholders}}`.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Option<String>,
    pub auth: Option<BasicAuth>,
    pub tls: TlsMaterial,
    pub timeout: Duration,
    pub sleep: Option<Sleep>,
    pub captures: Vec<CaptureSpec>,
    pub assertions: Vec<StepAssertion>,
    pub flags: StepFlags,
}

/// The immutable test plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub iteration_count: u64,
    pub duration: u64,
    pub load: LoadShape,
    pub engine_mode: EngineMode,
    pub proxy: Option<Url>,
    pub steps: Vec<Step>,
    pub data: BTreeMap<String, CsvConf>,
    pub env: BTreeMap<String, Value>,
    pub output: OutputKind,
    pub debug: bool,
    pub success_criteria: Vec<TestAssertion>,
    pub seed_cookies: Vec<SeedCookie>,
}

/// Per-phase durations of one request. Redirect hops add up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Phases {
    #[serde(serialize_with = "as_millis")]
    pub dns: Duration,
    #[serde(serialize_with = "as_millis")]
    pub connect: Duration,
    #[serde(serialize_with = "as_millis")]
    pub tls: Duration,
    #[serde(serialize_with = "as_millis")]
    pub write: Duration,
    #[serde(serialize_with = "as_millis")]
    pub server_processing: Duration,
    #[serde(serialize_with = "as_millis")]
    pub read: Duration,
}

impl Phases {
    pub fn sum(&self) -> Duration {
        self.dns + self.connect + self.tls + self.write + self.server_processing + self.read
    }

    pub fn add(&mut self, other: &Phases) {
        self.dns += other.dns;
        self.connect += other.connect;
        self.tls += other.tls;
        self.write += other.write;
        self.server_processing += other.server_processing;
        self.read += other.read;
    }
}

fn as_millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// A step assertion that did not hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAssertion {
    pub rule: String,
    pub received: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: u32,
    pub step_name: String,
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    /// Decoded response body. Only kept in debug mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    pub content_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
    pub phases: Phases,
    pub failed_captures: BTreeMap<String, String>,
    pub failed_assertions: Vec<FailedAssertion>,
    /// Environment after this step's captures. Only kept in debug mode.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Value>,
}

impl StepResult {
    /// An empty result for `step`, filled in as the step progresses.
    pub fn new(step: &Step) -> Self {
        Self {
            step_id: step.id,
            step_name: step.name.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            url: step.url.clone(),
            method: step.method.to_string(),
            request_headers: BTreeMap::new(),
            request_body: None,
            status_code: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            duration: Duration::ZERO,
            content_length: 0,
            error: None,
            phases: Phases::default(),
            failed_captures: BTreeMap::new(),
            failed_assertions: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn failed(step: &Step, error: RequestError) -> Self {
        let mut result = Self::new(step);
        result.error = Some(error);
        result
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_assertions.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationResult {
    pub index: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub steps: Vec<StepResult>,
}

impl IterationResult {
    /// True when a step was cut short by cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.steps.iter().any(|s| {
            s.error
                .as_ref()
                .is_some_and(|e| e.kind == crate::error::ErrorKind::Intentional)
        })
    }

    pub fn is_success(&self) -> bool {
        self.steps.iter().all(StepResult::is_success)
    }

    /// Sum of the step durations.
    pub fn duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_parse() {
        assert_eq!(Sleep::parse("300"), Ok(Sleep::Fixed(300)));
        assert_eq!(
            Sleep::parse("100-500"),
            Ok(Sleep::Range { min: 100, max: 500 })
        );
        assert!(Sleep::parse("500-100").is_err());
        assert!(Sleep::parse("60001").is_err());
        assert!(Sleep::parse("-5").is_err());
        assert!(Sleep::parse("1.5").is_err());
        assert!(Sleep::parse("").is_err());
    }

    #[test]
    fn test_sleep_sample_in_range() {
        let sleep = Sleep::Range { min: 10, max: 20 };
        for _ in 0..50 {
            let d = sleep.sample().as_millis();
            assert!((10..=20).contains(&d));
        }
        assert_eq!(Sleep::Fixed(7).sample(), Duration::from_millis(7));
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<HttpMethod>(), Ok(HttpMethod::Get));
        assert_eq!("OPTIONS".parse::<HttpMethod>(), Ok(HttpMethod::Options));
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_phases_sum_and_add() {
        let mut a = Phases {
            dns: Duration::from_millis(1),
            connect: Duration::from_millis(2),
            ..Phases::default()
        };
        let b = Phases {
            read: Duration::from_millis(4),
            ..Phases::default()
        };
        a.add(&b);
        assert_eq!(a.sum(), Duration::from_millis(7));
    }
}
