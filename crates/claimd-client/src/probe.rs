use std::time::{Duration, Instant};

use claimd_core::error::AppError;
use claimd_core::proxy_pool::ProxyAddress;
use claimd_core::traits::ProxyProbe;
use reqwest::{Client, Proxy};
use url::Url;

/// Proxy probe using reqwest.
///
/// Sends one GET to `probe_url` through the proxy and reports the
/// round-trip time. Any non-2xx answer or transport error fails the probe.
#[derive(Clone)]
pub struct HttpProxyProbe {
    probe_url: Url,
    timeout: Duration,
    user_agent: String,
}

impl HttpProxyProbe {
    pub fn new(probe_url: &str) -> Result<Self, AppError> {
        let probe_url = Url::parse(probe_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid probe URL '{probe_url}': {e}")))?;
        match probe_url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::ConfigError(format!(
                    "Probe URL scheme '{scheme}' is not allowed (only http/https)"
                )));
            }
        }
        Ok(Self {
            probe_url,
            timeout: Duration::from_secs(10),
            user_agent: "claimd/0.1 (proxy probe)".to_string(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn probe_url(&self) -> &Url {
        &self.probe_url
    }

    fn client_for(&self, proxy: &ProxyAddress) -> Result<Client, AppError> {
        let proxy = Proxy::all(proxy.to_url())
            .map_err(|e| AppError::ProxyError(format!("Invalid proxy {proxy}: {e}")))?;
        Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))
    }
}

impl ProxyProbe for HttpProxyProbe {
    async fn probe(&self, proxy: &ProxyAddress) -> Result<Duration, AppError> {
        let client = self.client_for(proxy)?;
        let started = Instant::now();

        let response = client
            .get(self.probe_url.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout.as_secs())
                } else if e.is_connect() {
                    AppError::ProxyError(format!("Connection to {proxy} failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status_code: status.as_u16(),
                message: format!("probe through {proxy} rejected"),
            });
        }
        let latency = started.elapsed();
        tracing::debug!(%proxy, latency_ms = latency.as_millis() as u64, "Proxy probe ok");
        Ok(latency)
    }
}
