use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::BuildCacheService;
use crate::config::RemoteCacheConfig;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::logging::{operations, services, status};

/// Credentials sent with every remote request
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteCredentials {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

impl std::fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

impl RemoteCredentials {
    /// Resolve credentials from config; a bearer token is read from `token_env`
    pub fn from_config(config: &RemoteCacheConfig) -> Self {
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            return Self::Basic {
                username: username.clone(),
                password: password.clone(),
            };
        }
        config
            .token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.is_empty())
            .map(Self::Bearer)
            .unwrap_or(Self::None)
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::None => request,
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
            Self::Bearer(token) => request.bearer_auth(token),
        }
    }
}

/// HTTP build cache client
///
/// Speaks the Gradle HTTP build cache protocol:
/// - `GET {url}/{key}`: 200 with the entry, 404 on a miss
/// - `PUT {url}/{key}`: store the entry (any 2xx is success)
///
/// Every request is bounded by the configured timeout and aborted when the
/// session's cancellation token fires.
pub struct HttpBuildCache {
    client: Client,
    base_url: String,
    push: bool,
    credentials: RemoteCredentials,
    cancel: CancellationToken,
}

impl HttpBuildCache {
    pub fn new(
        url: &str,
        push: bool,
        timeout: Duration,
        credentials: RemoteCredentials,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cachet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::configuration(format!("failed to build HTTP client: {e}")))?;

        let base_url = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        };

        info!("Remote HTTP cache at {} (push: {})", base_url, push);

        Ok(Self {
            client,
            base_url,
            push,
            credentials,
            cancel,
        })
    }

    /// Build from the `[remote]` section
    pub fn from_config(config: &RemoteCacheConfig, cancel: CancellationToken) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CacheError::configuration("remote.url must be set"))?;
        Self::new(
            url,
            config.push,
            config.timeout()?,
            RemoteCredentials::from_config(config),
            cancel,
        )
    }

    fn entry_url(&self, key: &CacheKey) -> String {
        format!("{}{}", self.base_url, key.to_hex())
    }

    async fn cancellable<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = reqwest::Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CacheError::network(operation, "cancelled")),
            result = future => result.map_err(|e| CacheError::network(operation, e)),
        }
    }
}

#[async_trait]
impl BuildCacheService for HttpBuildCache {
    fn name(&self) -> &'static str {
        services::REMOTE_HTTP
    }

    fn describe(&self) -> String {
        format!("http:{} (push: {})", self.base_url, self.push)
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let url = self.entry_url(key);
        debug!("GET {}", url);

        let request = self.credentials.apply(self.client.get(&url));
        let response = self.cancellable(operations::LOAD, request.send()).await?;

        match response.status() {
            StatusCode::OK => {
                let body = self
                    .cancellable(operations::LOAD, response.bytes())
                    .await?;
                debug!(
                    service = services::REMOTE_HTTP,
                    operation = operations::LOAD,
                    status = status::HIT,
                    key = %key,
                    size_bytes = body.len(),
                    "Remote cache hit"
                );
                Ok(Some(body.to_vec()))
            }
            StatusCode::NOT_FOUND => {
                debug!(
                    service = services::REMOTE_HTTP,
                    operation = operations::LOAD,
                    status = status::MISS,
                    key = %key,
                    "Remote cache miss"
                );
                Ok(None)
            }
            other => Err(CacheError::network(
                operations::LOAD,
                format!("unexpected status {other} from {url}"),
            )),
        }
    }

    async fn store(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        if !self.push {
            debug!(key = %key, "Remote push disabled, skipping store");
            return Ok(());
        }

        let url = self.entry_url(key);
        debug!("PUT {} ({} bytes)", url, payload.len());

        let request = self
            .credentials
            .apply(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.to_vec());
        let response = self.cancellable(operations::STORE, request.send()).await?;

        if !response.status().is_success() {
            return Err(CacheError::network(
                operations::STORE,
                format!("unexpected status {} from {}", response.status(), url),
            ));
        }

        debug!(
            service = services::REMOTE_HTTP,
            operation = operations::STORE,
            status = status::SUCCESS,
            key = %key,
            size_bytes = payload.len(),
            "Stored entry remotely"
        );
        Ok(())
    }
}
