//! Proxy selection.

use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// Hands out the proxy each iteration should use and hears back about
/// failures.
pub trait ProxyStrategy: Send + Sync {
    /// Proxy for the next iteration, `None` to go direct.
    fn next_proxy(&self) -> Option<Url>;

    /// Report a failure through `addr`. Returns the proxy to retry with.
    fn report(&self, addr: Option<&Url>, reason: &str) -> Option<Url>;

    /// Proxy count per country, for strategies that know it.
    fn countries(&self) -> BTreeMap<String, usize> {
        BTreeMap::new()
    }

    fn close(&self) {}
}

/// Always the same proxy (or none).
#[derive(Debug, Clone, Default)]
pub struct SingleProxyStrategy {
    addr: Option<Url>,
}

impl SingleProxyStrategy {
    pub fn new(addr: Option<Url>) -> Self {
        Self { addr }
    }
}

impl ProxyStrategy for SingleProxyStrategy {
    fn next_proxy(&self) -> Option<Url> {
        self.addr.clone()
    }

    fn report(&self, addr: Option<&Url>, reason: &str) -> Option<Url> {
        if let Some(addr) = addr {
            debug!(proxy = %addr, reason, "proxy failure reported");
        }
        self.addr.clone()
    }
}
