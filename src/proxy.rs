use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy health-check and acquisition collaborator. Shared by every account
/// loop in the process, so implementations must tolerate concurrent calls.
#[async_trait]
pub trait ProxyDirectory: Send + Sync {
    /// Whether traffic currently flows through `addr`.
    async fn check_alive(&self, addr: &str) -> bool;

    /// First working proxy that is not the excluded (current) one.
    async fn acquire_working(&self, exclude: Option<&str>) -> Option<String>;
}

/// Directory backed by a static pool from the account configuration.
/// Liveness is a GET against a probe URL routed through the candidate.
pub struct ProbeProxyDirectory {
    pool: Vec<String>,
    probe_url: String,
}

impl ProbeProxyDirectory {
    pub fn new(pool: Vec<String>, probe_url: impl Into<String>) -> Self {
        Self {
            pool,
            probe_url: probe_url.into(),
        }
    }
}

#[async_trait]
impl ProxyDirectory for ProbeProxyDirectory {
    async fn check_alive(&self, addr: &str) -> bool {
        let proxy = match reqwest::Proxy::all(addr) {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!("Unusable proxy address {}: {}", addr, e);
                return false;
            }
        };
        let client = match reqwest::Client::builder()
            .proxy(proxy)
            .timeout(PROBE_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build probe client for {}: {}", addr, e);
                return false;
            }
        };
        match client.get(&self.probe_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Proxy {} failed probe: {}", addr, e);
                false
            }
        }
    }

    async fn acquire_working(&self, exclude: Option<&str>) -> Option<String> {
        for candidate in &self.pool {
            if Some(candidate.as_str()) == exclude {
                continue;
            }
            if self.check_alive(candidate).await {
                return Some(candidate.clone());
            }
        }
        None
    }
}
