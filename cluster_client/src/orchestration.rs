//! Client for an HTTP orchestration service that provisions standalone
//! servers, replica sets and sharded clusters for integration testing.
//!
//! The service is found at `http://localhost:8889` unless the
//! `MONGO_ORCHESTRATION` environment variable names another base URL.

use std::fmt;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::instrument;
use url::Url;

use crate::{error_chain_fmt, ConnectionString, ServerAddress};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8889";
pub const BASE_URL_VARIABLE: &str = "MONGO_ORCHESTRATION";
pub const VERSION_REQUIRED: &str = "0.9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Servers,
    ReplicaSets,
    ShardedClusters,
}

impl ResourceKind {
    pub fn as_path(&self) -> &'static str {
        match self {
            ResourceKind::Servers => "servers",
            ResourceKind::ReplicaSets => "replica_sets",
            ResourceKind::ShardedClusters => "sharded_clusters",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_path())
    }
}

#[derive(Debug, Clone)]
pub struct OrchestrationService {
    client: reqwest::Client,
    base_url: Url,
    version: String,
}

impl OrchestrationService {
    /// Connects to the service named by `MONGO_ORCHESTRATION`, or the
    /// default one.
    pub async fn connect() -> Result<Self, OrchestrationError> {
        let base_url = resolve_base_url(std::env::var(BASE_URL_VARIABLE).ok())?;
        Self::connect_to(base_url).await
    }

    /// Checks that the service is up and recent enough.
    #[instrument(level = "debug", name = "Orchestration - Connect")]
    pub async fn connect_to(base_url: Url) -> Result<Self, OrchestrationError> {
        let client = reqwest::Client::new();
        let response = client.get(base_url.clone()).send().await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(OrchestrationError::Unavailable(base_url)),
            status => {
                return Err(OrchestrationError::UnexpectedStatus {
                    method: Method::GET,
                    path: base_url.path().to_string(),
                    status,
                })
            }
        }

        let body: Value = response.json().await?;
        let version = body
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !version_at_least(&version, VERSION_REQUIRED) {
            return Err(OrchestrationError::InsufficientVersion {
                found: version,
                required: VERSION_REQUIRED.to_string(),
            });
        }
        tracing::debug!("Orchestration service {} is at version {}", base_url, version);

        Ok(Self {
            client,
            base_url,
            version,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Creates a resource from `request` and returns a handle to it. The
    /// request may carry its own `id`; otherwise the service picks one.
    #[instrument(level = "debug", name = "Orchestration - Configure", skip(self))]
    pub async fn configure(
        &self,
        kind: ResourceKind,
        request: Value,
    ) -> Result<Resource, OrchestrationError> {
        let path = kind.as_path().to_string();
        let object = send(&self.client, &self.base_url, Method::POST, &path, Some(&request), StatusCode::OK)
            .await?;
        let id = object
            .get("id")
            .or_else(|| request.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Orchestration service returned a {} without an id", kind))?;
        tracing::info!("Configured {} `{}`", kind, id);

        Ok(Resource {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            kind,
            id,
            object,
        })
    }
}

/// One provisioned server, replica set or sharded cluster.
#[derive(Debug, Clone)]
pub struct Resource {
    client: reqwest::Client,
    base_url: Url,
    kind: ResourceKind,
    id: String,
    object: Value,
}

impl Resource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The last description the service returned.
    pub fn object(&self) -> &Value {
        &self.object
    }

    fn path(&self) -> String {
        format!("{}/{}", self.kind.as_path(), self.id)
    }

    /// Refreshes the description of the resource.
    pub async fn status(&mut self) -> Result<&Value, OrchestrationError> {
        self.object = send(&self.client, &self.base_url, Method::GET, &self.path(), None, StatusCode::OK)
            .await?;
        Ok(&self.object)
    }

    pub async fn start(&mut self) -> Result<(), OrchestrationError> {
        self.action("start").await
    }

    pub async fn stop(&mut self) -> Result<(), OrchestrationError> {
        self.action("stop").await
    }

    pub async fn restart(&mut self) -> Result<(), OrchestrationError> {
        self.action("restart").await
    }

    #[instrument(level = "debug", name = "Orchestration - Action", skip(self), fields(id = %self.id))]
    async fn action(&mut self, action: &str) -> Result<(), OrchestrationError> {
        let body = serde_json::json!({ "action": action });
        let object = send(&self.client, &self.base_url, Method::POST, &self.path(), Some(&body), StatusCode::OK)
            .await?;
        if !object.is_null() {
            self.object = object;
        }
        Ok(())
    }

    /// Tears the resource down.
    #[instrument(level = "debug", name = "Orchestration - Destroy", skip(self), fields(id = %self.id))]
    pub async fn destroy(self) -> Result<(), OrchestrationError> {
        send(&self.client, &self.base_url, Method::DELETE, &self.path(), None, StatusCode::NO_CONTENT)
            .await?;
        tracing::info!("Destroyed {} `{}`", self.kind, self.id);
        Ok(())
    }

    /// Seed addresses from the `mongodb_uri` the service reports.
    pub fn addresses(&self) -> Result<Vec<ServerAddress>, OrchestrationError> {
        let uri = self
            .object
            .get("mongodb_uri")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Resource `{}` reports no mongodb_uri", self.id))?;
        let parsed: ConnectionString = uri
            .parse()
            .map_err(|e| anyhow::anyhow!("Resource `{}` reports a bad mongodb_uri. Caused by: {}", self.id, e))?;
        Ok(parsed.hosts().to_vec())
    }
}

async fn send(
    client: &reqwest::Client,
    base_url: &Url,
    method: Method,
    path: &str,
    body: Option<&Value>,
    expected: StatusCode,
) -> Result<Value, OrchestrationError> {
    let url = Url::parse(&format!(
        "{}/{}",
        base_url.as_str().trim_end_matches('/'),
        path
    ))?;
    tracing::trace!("{} {}", method, url);

    let mut request = client.request(method.clone(), url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let response = request.send().await?;

    let status = response.status();
    if status != expected {
        return Err(OrchestrationError::UnexpectedStatus {
            method,
            path: path.to_string(),
            status,
        });
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("{} returned invalid JSON. Caused by: {}", path, e).into())
}

fn resolve_base_url(from_env: Option<String>) -> Result<Url, OrchestrationError> {
    let base = from_env
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    Ok(Url::parse(&base)?)
}

/// Compares dotted version strings numerically. Missing parts count as zero.
fn version_at_least(found: &str, required: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (found, required) = (parse(found), parse(required));
    let len = found.len().max(required.len());
    for i in 0..len {
        let f = found.get(i).copied().unwrap_or(0);
        let r = required.get(i).copied().unwrap_or(0);
        if f != r {
            return f > r;
        }
    }
    true
}

#[derive(thiserror::Error)]
pub enum OrchestrationError {
    #[error("Orchestration service {0} is not available")]
    Unavailable(Url),
    #[error("Orchestration service version `{found}` is insufficient, {required} is required")]
    InsufficientVersion { found: String, required: String },
    #[error("{method} {path} returned unexpected status {status}")]
    UnexpectedStatus {
        method: Method,
        path: String,
        status: StatusCode,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl fmt::Debug for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        error_chain_fmt(self, f)
    }
}
