//! Per-step HTTP sender.
//!
//! Takes a step whose URL, headers and body have already been injected,
//! binds it to the iteration's proxy and the step's TLS config, and sends
//! it through the iteration's client. Proxy failures are retried; every
//! other failure is returned as-is.

use crate::error::{ErrorKind, PlanError, RequestError};
use crate::model::{Plan, Step, TlsMaterial};
use crate::proxy::ProxyStrategy;
use crate::transport::{client_config, Client, Outgoing, ProxyTarget, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use rustls::ClientConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// Attempts made when the proxy fails.
pub const PROXY_ATTEMPTS: usize = 3;

/// A step after injection.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

pub struct Requester {
    tls: BTreeMap<u32, Arc<ClientConfig>>,
    proxy_tls: Arc<ClientConfig>,
    proxies: Arc<dyn ProxyStrategy>,
}

impl Requester {
    /// Build the TLS config of every step up front so bad certificates
    /// fail the plan rather than an iteration.
    pub fn new(plan: &Plan, proxies: Arc<dyn ProxyStrategy>) -> Result<Self, PlanError> {
        let mut tls = BTreeMap::new();
        for step in &plan.steps {
            let config = client_config(&step.tls, step.flags.h2).map_err(|message| {
                PlanError::Tls {
                    step: step.id,
                    message,
                }
            })?;
            tls.insert(step.id, Arc::new(config));
        }
        let proxy_tls = client_config(&TlsMaterial::default(), false)
            .map_err(|message| PlanError::Tls { step: 0, message })?;
        Ok(Self {
            tls,
            proxy_tls: Arc::new(proxy_tls),
            proxies,
        })
    }

    /// Send `prepared` for `step`. Cancellation ends the request with an
    /// `Intentional` error.
    #[instrument(skip_all, fields(step = step.id, url = %prepared.url))]
    pub async fn send(
        &self,
        client: &Client,
        step: &Step,
        prepared: &Prepared,
        proxy: Option<Url>,
        cancel: &CancellationToken,
    ) -> Result<Response, RequestError> {
        let tls = match self.tls.get(&step.id) {
            Some(tls) => tls.clone(),
            None => {
                return Err(RequestError::new(
                    ErrorKind::InvalidRequest,
                    format!("no TLS config for step {}", step.id),
                ))
            }
        };

        let mut headers = prepared.headers.clone();
        if let Some(auth) = &step.auth {
            if !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            {
                let credentials = format!("{}:{}", auth.username, auth.password);
                headers.push((
                    "Authorization".to_string(),
                    format!("Basic {}", STANDARD.encode(credentials)),
                ));
            }
        }

        let mut outgoing = Outgoing {
            method: step.method.into(),
            url: prepared.url.clone(),
            headers,
            body: prepared.body.clone().map(Bytes::from),
            timeout: step.timeout,
            flags: step.flags.clone(),
            tls,
            proxy: None,
        };

        let mut proxy = proxy;
        let mut attempt = 1;
        loop {
            outgoing.proxy = proxy.clone().map(|url| ProxyTarget {
                url,
                tls: self.proxy_tls.clone(),
            });

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RequestError::intentional()),
                result = client.execute(&outgoing) => result,
            };

            match result {
                Err(err) if err.kind == ErrorKind::Proxy && attempt < PROXY_ATTEMPTS => {
                    warn!(attempt, error = %err, "proxy failed, retrying");
                    proxy = self.proxies.report(proxy.as_ref(), &err.detail);
                    attempt += 1;
                }
                Err(err) => {
                    debug!(kind = ?err.kind, detail = %err.detail, "request failed");
                    return Err(err);
                }
                Ok(response) => return Ok(response),
            }
        }
    }
}
