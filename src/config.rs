//! Plan configuration files.
//!
//! A plan file is JSON or YAML (chosen by extension) with the same field
//! names in both. It deserializes into [`PlanConfig`], which is validated
//! and compiled into an immutable [`Plan`] by [`PlanConfig::build`].

use crate::cookie::SeedCookie;
use crate::data::CsvConf;
use crate::error::PlanError;
use crate::expression;
use crate::extract::Pattern;
use crate::faker::Registry;
use crate::model::*;
use crate::validator;
use crate::value::Value;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Raw plan file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Total iterations. Derived from `manual_load` when absent.
    #[serde(default)]
    pub iteration_count: Option<u64>,
    /// Test duration in seconds. Derived from `manual_load` when absent.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub load_type: Option<LoadType>,
    #[serde(default)]
    pub manual_load: Vec<Segment>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default)]
    pub data: BTreeMap<String, CsvConf>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
    #[serde(default)]
    pub engine_mode: EngineMode,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub success_criterias: Vec<CriteriaConfig>,
    #[serde(default)]
    pub cookie_jar: Option<CookieJarConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub payload_file: Option<PathBuf>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub cert_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub sleep: Option<String>,
    #[serde(default)]
    pub capture_env: Vec<CaptureConfig>,
    #[serde(default)]
    pub assertion: Vec<AssertionConfig>,
    #[serde(default)]
    pub others: BTreeMap<String, serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default = "default_auth_type")]
    pub kind: String,
    pub username: String,
    pub password: String,
}

fn default_auth_type() -> String {
    "basic".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(alias = "as")]
    pub name: String,
    pub from: CaptureSource,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub xpath: Option<String>,
    #[serde(default)]
    pub xpath_html: Option<String>,
    #[serde(default)]
    pub regexp: Option<RegexConfig>,
    #[serde(default)]
    pub header_key: Option<String>,
    #[serde(default)]
    pub cookie_name: Option<String>,
    #[serde(default)]
    pub cookie_field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexConfig {
    pub exp: String,
    #[serde(default, alias = "matchNo")]
    pub match_no: usize,
}

/// A step assertion, either a bare rule or `{rule, abort}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssertionConfig {
    Rule(String),
    Detailed {
        rule: String,
        #[serde(default)]
        abort: bool,
    },
}

impl AssertionConfig {
    pub fn rule(&self) -> &str {
        match self {
            AssertionConfig::Rule(rule) | AssertionConfig::Detailed { rule, .. } => rule,
        }
    }

    pub fn abort(&self) -> bool {
        matches!(self, AssertionConfig::Detailed { abort: true, .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaConfig {
    pub rule: String,
    #[serde(default)]
    pub abort: bool,
    /// Seconds to wait before re-checking an aborting rule.
    #[serde(default)]
    pub delay: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieJarConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cookies: Vec<SeedCookie>,
}

/// Prefix a bare host with `https://`. URLs that start with a placeholder
/// are left alone until injection has filled them in.
pub fn normalize_url(raw: &str) -> String {
    if raw.contains("://") || raw.starts_with("{{") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

impl PlanConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load a plan file. `.yaml` / `.yml` are read as YAML, anything else
    /// as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading plan from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read plan file: {}", path.display()))?;

        let config = if is_yaml(path) {
            Self::from_yaml(&content)
                .context(format!("Failed to parse YAML plan from {}", path.display()))?
        } else {
            Self::from_json(&content)
                .context(format!("Failed to parse JSON plan from {}", path.display()))?
        };

        debug!("Loaded plan with {} step(s)", config.steps.len());
        Ok(config)
    }

    /// Iteration count and duration, falling back to the explicit load.
    pub fn totals(&self) -> (u64, u64) {
        let n = self
            .iteration_count
            .unwrap_or_else(|| self.manual_load.iter().map(|s| s.count).sum());
        let d = self
            .duration
            .unwrap_or_else(|| self.manual_load.iter().map(|s| s.duration).sum());
        (n, d)
    }

    /// Validate and compile into an immutable plan. Referenced files
    /// (payloads, certificates) are read here.
    pub fn build(self, registry: &Registry) -> Result<Plan, PlanError> {
        validator::validate(&self, registry)?;

        let (iteration_count, duration) = self.totals();
        let load = if !self.manual_load.is_empty() {
            LoadShape::Explicit(self.manual_load.clone())
        } else {
            match self.load_type.unwrap_or(LoadType::Linear) {
                LoadType::Linear => LoadShape::Linear,
                LoadType::Incremental => LoadShape::Incremental,
                LoadType::Waved => LoadShape::Waved,
            }
        };

        let proxy = self
            .proxy
            .as_deref()
            .map(|p| Url::parse(p).map_err(|e| PlanError::invalid(format!("proxy '{p}': {e}"))))
            .transpose()?;

        let steps = self
            .steps
            .into_iter()
            .map(build_step)
            .collect::<Result<Vec<_>, _>>()?;

        let success_criteria = self
            .success_criterias
            .into_iter()
            .map(|c| -> Result<TestAssertion, PlanError> {
                let program = expression::compile(&c.rule)
                    .map_err(|e| PlanError::invalid(format!("success criteria '{}': {e}", c.rule)))?;
                Ok(TestAssertion {
                    rule: c.rule,
                    program,
                    abort: c.abort,
                    delay: Duration::from_secs(c.delay),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let seed_cookies = match self.cookie_jar {
            Some(jar) if jar.enabled => jar.cookies,
            _ => Vec::new(),
        };

        Ok(Plan {
            iteration_count,
            duration,
            load,
            engine_mode: self.engine_mode,
            proxy,
            steps,
            data: self.data,
            env: self.env,
            output: self.output,
            debug: self.debug,
            success_criteria,
            seed_cookies,
        })
    }
}

fn build_step(config: StepConfig) -> Result<Step, PlanError> {
    let id = config.id;
    let method = config
        .method
        .parse::<HttpMethod>()
        .map_err(|e| PlanError::step(id, e))?;

    let payload = match (&config.payload, &config.payload_file) {
        (Some(payload), _) => Some(payload.clone()),
        (None, Some(path)) => Some(read_file(path).and_then(|bytes| {
            String::from_utf8(bytes).map_err(|e| PlanError::step(id, format!("payload file: {e}")))
        })?),
        (None, None) => None,
    };

    let client_cert = match (&config.cert_path, &config.cert_key_path) {
        (Some(cert), Some(key)) => Some((read_file(cert)?, read_file(key)?)),
        _ => None,
    };
    let ca_cert = config.ca_cert_path.as_deref().map(read_file).transpose()?;

    let captures = config
        .capture_env
        .iter()
        .map(|c| build_capture(id, c))
        .collect::<Result<Vec<_>, _>>()?;

    let assertions = config
        .assertion
        .iter()
        .map(|a| -> Result<StepAssertion, PlanError> {
            let program = expression::compile(a.rule())
                .map_err(|e| PlanError::step(id, format!("assertion '{}': {e}", a.rule())))?;
            Ok(StepAssertion {
                rule: a.rule().to_string(),
                program,
                abort: a.abort(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let sleep = config
        .sleep
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(Sleep::parse)
        .transpose()
        .map_err(|e| PlanError::step(id, e))?;

    Ok(Step {
        id,
        name: config.name.unwrap_or_default(),
        method,
        url: normalize_url(&config.url),
        headers: config.headers,
        payload,
        auth: config.auth.map(|a| BasicAuth {
            username: a.username,
            password: a.password,
        }),
        tls: TlsMaterial {
            client_cert,
            ca_cert,
        },
        timeout: Duration::from_secs(config.timeout),
        sleep,
        captures,
        assertions,
        flags: build_flags(id, &config.others)?,
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, PlanError> {
    fs::read(path).map_err(|source| PlanError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub(crate) fn build_capture(step: u32, c: &CaptureConfig) -> Result<CaptureSpec, PlanError> {
    let err = |message: &str| PlanError::step(step, format!("capture '{}': {message}", c.name));
    let selector = match c.from {
        CaptureSource::Body => {
            let mut selectors = Vec::new();
            if let Some(p) = &c.json_path {
                selectors.push(Selector::JsonPath(p.clone()));
            }
            if let Some(p) = &c.xpath {
                selectors.push(Selector::XmlPath(p.clone()));
            }
            if let Some(p) = &c.xpath_html {
                selectors.push(Selector::HtmlPath(p.clone()));
            }
            if let Some(r) = &c.regexp {
                selectors.push(Selector::Regex {
                    pattern: Pattern::new(&r.exp).map_err(|e| err(&e.to_string()))?,
                    match_no: r.match_no,
                });
            }
            if selectors.len() != 1 {
                return Err(err(
                    "body captures need exactly one of json_path, xpath, xpath_html or regexp",
                ));
            }
            selectors.remove(0)
        }
        CaptureSource::Header => {
            let key = c
                .header_key
                .clone()
                .ok_or_else(|| err("header captures need header_key"))?;
            if c.json_path.is_some() || c.xpath.is_some() || c.xpath_html.is_some() {
                return Err(err("header captures only accept header_key and regexp"));
            }
            let regex = match &c.regexp {
                Some(r) => Some((
                    Pattern::new(&r.exp).map_err(|e| err(&e.to_string()))?,
                    r.match_no,
                )),
                None => None,
            };
            Selector::Header { key, regex }
        }
        CaptureSource::Cookie => {
            let name = c
                .cookie_name
                .clone()
                .ok_or_else(|| err("cookie captures need cookie_name"))?;
            if c.json_path.is_some() || c.xpath.is_some() || c.xpath_html.is_some() || c.regexp.is_some() {
                return Err(err("cookie captures only accept cookie_name and cookie_field"));
            }
            Selector::Cookie {
                name,
                field: c.cookie_field.clone(),
            }
        }
    };
    if c.name.is_empty() {
        return Err(err("name is empty"));
    }
    Ok(CaptureSpec {
        name: c.name.clone(),
        source: c.from,
        selector,
    })
}

pub(crate) fn build_flags(
    step: u32,
    others: &BTreeMap<String, serde_json::Value>,
) -> Result<StepFlags, PlanError> {
    let mut flags = StepFlags::default();
    for (key, value) in others {
        let as_bool = || {
            value
                .as_bool()
                .ok_or_else(|| PlanError::step(step, format!("'{key}' must be a bool")))
        };
        match key.as_str() {
            "keep-alive" => flags.keep_alive = as_bool()?,
            "disable-redirect" => flags.disable_redirect = as_bool()?,
            "disable-compression" => flags.disable_compression = as_bool()?,
            "h2" => flags.h2 = as_bool()?,
            "hostname" => {
                let host = value
                    .as_str()
                    .ok_or_else(|| PlanError::step(step, "'hostname' must be a string"))?;
                flags.hostname = Some(host.to_string());
            }
            _ => debug!("Ignoring unknown flag '{}' on step {}", key, step),
        }
    }
    Ok(flags)
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
