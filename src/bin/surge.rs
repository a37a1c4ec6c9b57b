//! surge CLI - rate-shaped HTTP load generator.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::exit;
use surge::config::{AuthConfig, PlanConfig, StepConfig};
use surge::{Engine, LoadType, OutputKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// surge - send a shaped stream of HTTP scenarios at a target.
#[derive(Parser, Debug)]
#[command(name = "surge", version, about)]
struct Cli {
    /// Target URL. Ignored when a config file is given.
    target: Option<String>,

    /// Plan file (JSON or YAML).
    #[arg(long = "config", env = "SURGE_CONFIG")]
    config: Option<PathBuf>,

    /// Request method.
    #[arg(short = 'm', long = "method", default_value = "GET")]
    method: String,

    /// Request header as `Name: value`. Repeatable.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body.
    #[arg(short = 'b', long = "body")]
    body: Option<String>,

    /// Basic auth as `user:pass`.
    #[arg(short = 'a', long = "auth")]
    auth: Option<String>,

    /// Total iterations.
    #[arg(short = 'n', long = "iterations")]
    iterations: Option<u64>,

    /// Test duration in seconds.
    #[arg(short = 'd', long = "duration")]
    duration: Option<u64>,

    /// Load shape.
    #[arg(short = 'l', long = "load-type")]
    load_type: Option<LoadArg>,

    /// Per-request timeout in seconds.
    #[arg(short = 'T', long = "timeout", default_value_t = 5)]
    timeout: u64,

    /// Proxy URL.
    #[arg(short = 'P', long = "proxy")]
    proxy: Option<String>,

    /// Report output.
    #[arg(short = 'o', long = "output")]
    output: Option<OutputArg>,

    /// Client certificate (PEM).
    #[arg(long = "cert-path")]
    cert_path: Option<PathBuf>,

    /// Client certificate key (PEM).
    #[arg(long = "cert-key-path")]
    cert_key_path: Option<PathBuf>,

    /// Run a single iteration and print every step in full.
    #[arg(long = "debug")]
    debug: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum LoadArg {
    Linear,
    Incremental,
    Waved,
}

impl From<LoadArg> for LoadType {
    fn from(arg: LoadArg) -> Self {
        match arg {
            LoadArg::Linear => LoadType::Linear,
            LoadArg::Incremental => LoadType::Incremental,
            LoadArg::Waved => LoadType::Waved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum OutputArg {
    Stdout,
    StdoutJson,
}

impl From<OutputArg> for OutputKind {
    fn from(arg: OutputArg) -> Self {
        match arg {
            OutputArg::Stdout => OutputKind::Stdout,
            OutputArg::StdoutJson => OutputKind::StdoutJson,
        }
    }
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Header must look like 'Name: value': {raw}"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty: {raw}");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_auth(raw: &str) -> Result<AuthConfig> {
    let (username, password) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Auth must look like 'user:pass'"))?;
    Ok(AuthConfig {
        kind: "basic".to_string(),
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// A one-step plan built from the command line.
fn plan_from_flags(args: &Cli, target: &str) -> Result<PlanConfig> {
    let headers = args
        .headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let step = StepConfig {
        id: 1,
        name: None,
        url: target.to_string(),
        method: args.method.to_uppercase(),
        headers,
        payload: args.body.clone(),
        payload_file: None,
        auth: args.auth.as_deref().map(parse_auth).transpose()?,
        cert_path: args.cert_path.clone(),
        cert_key_path: args.cert_key_path.clone(),
        ca_cert_path: None,
        timeout: args.timeout,
        sleep: None,
        capture_env: Vec::new(),
        assertion: Vec::new(),
        others: BTreeMap::new(),
    };

    Ok(PlanConfig {
        iteration_count: Some(100),
        duration: Some(10),
        steps: vec![step],
        ..PlanConfig::default()
    })
}

/// Flags given explicitly win over the plan file.
fn apply_overrides(config: &mut PlanConfig, args: &Cli) {
    if let Some(n) = args.iterations {
        config.iteration_count = Some(n);
    }
    if let Some(d) = args.duration {
        config.duration = Some(d);
    }
    if let Some(load) = args.load_type {
        config.load_type = Some(load.into());
    }
    if let Some(proxy) = &args.proxy {
        config.proxy = Some(proxy.clone());
    }
    if let Some(output) = args.output {
        config.output = output.into();
    }
    if args.debug {
        config.debug = true;
    }
}

fn prepare_config(args: &Cli) -> Result<PlanConfig> {
    let mut config = match (&args.config, &args.target) {
        (Some(path), _) => PlanConfig::load(path)
            .context(format!("Failed to load plan: {}", path.display()))?,
        (None, Some(target)) => plan_from_flags(args, target)?,
        (None, None) => bail!("Either a target URL or --config is required"),
    };
    apply_overrides(&mut config, args);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let config = match prepare_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            exit(1);
        }
    };

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Invalid plan: {}", e);
            exit(1);
        }
    };

    let report = match engine.run().await {
        Ok(report) => report,
        Err(e) => {
            error!("Load test failed: {:#}", e);
            exit(2);
        }
    };

    let code = report.exit_code();
    if code != 0 {
        info!("Success criteria not met");
        exit(code);
    }

    Ok(())
}
