//! Proxy list providers.
//!
//! Every source yields plain-text lists, one proxy per line, in any format
//! [`ProxyAddress::parse`] understands. Blank lines and `#` comments are
//! skipped; malformed lines are logged and dropped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use claimd_core::error::AppError;
use claimd_core::proxy_pool::ProxyAddress;
use claimd_core::traits::ProxySource;
use reqwest::Client;
use url::Url;

/// Parse a proxy list, skipping comments and malformed lines.
pub fn parse_proxy_list(source: &str, text: &str) -> Vec<ProxyAddress> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match ProxyAddress::parse(line) {
            Ok(address) => Some(address),
            Err(e) => {
                tracing::warn!(%source, error = %e, "Skipping malformed proxy line");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Fixed list, e.g. inline in the farm file.
#[derive(Debug, Clone)]
pub struct StaticProxySource {
    name: String,
    addresses: Vec<ProxyAddress>,
}

impl StaticProxySource {
    pub fn new(name: impl Into<String>, addresses: Vec<ProxyAddress>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }

    /// Build from raw lines; fails on the first malformed entry.
    pub fn from_lines<I, L>(name: impl Into<String>, lines: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<str>,
    {
        let addresses = lines
            .into_iter()
            .map(|line| ProxyAddress::parse(line.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(name, addresses))
    }
}

impl ProxySource for StaticProxySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<ProxyAddress>, AppError> {
        Ok(self.addresses.clone())
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// A local list file, re-read on every refresh.
#[derive(Debug, Clone)]
pub struct FileProxySource {
    name: String,
    path: PathBuf,
}

impl FileProxySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProxySource for FileProxySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<ProxyAddress>, AppError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AppError::ProxyError(format!("Cannot read {}: {e}", self.path.display()))
        })?;
        Ok(parse_proxy_list(&self.name, &text))
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// A provider endpoint returning a plain-text list.
#[derive(Clone)]
pub struct HttpProxySource {
    name: String,
    url: Url,
    client: Client,
    timeout_secs: u64,
}

impl HttpProxySource {
    pub fn new(url: &str) -> Result<Self, AppError> {
        Self::with_timeout(url, Duration::from_secs(30))
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, AppError> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy list URL '{url}': {e}")))?;
        let client = Client::builder()
            .user_agent("claimd/0.1 (proxy refresh)")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            name: format!("http:{}", parsed.host_str().unwrap_or("unknown")),
            url: parsed,
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl ProxySource for HttpProxySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<ProxyAddress>, AppError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status_code: status.as_u16(),
                message: format!("proxy list {} unavailable", self.url),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;
        Ok(parse_proxy_list(&self.name, &text))
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Any configured source, so a mixed list fits one `ProxyPool::refresh` call.
#[derive(Clone)]
pub enum ProxySourceKind {
    Static(StaticProxySource),
    File(FileProxySource),
    Http(HttpProxySource),
}

impl ProxySource for ProxySourceKind {
    fn name(&self) -> &str {
        match self {
            ProxySourceKind::Static(s) => s.name(),
            ProxySourceKind::File(s) => s.name(),
            ProxySourceKind::Http(s) => s.name(),
        }
    }

    async fn fetch(&self) -> Result<Vec<ProxyAddress>, AppError> {
        match self {
            ProxySourceKind::Static(s) => s.fetch().await,
            ProxySourceKind::File(s) => s.fetch().await,
            ProxySourceKind::Http(s) => s.fetch().await,
        }
    }
}

impl From<StaticProxySource> for ProxySourceKind {
    fn from(source: StaticProxySource) -> Self {
        ProxySourceKind::Static(source)
    }
}

impl From<FileProxySource> for ProxySourceKind {
    fn from(source: FileProxySource) -> Self {
        ProxySourceKind::File(source)
    }
}

impl From<HttpProxySource> for ProxySourceKind {
    fn from(source: HttpProxySource) -> Self {
        ProxySourceKind::Http(source)
    }
}
