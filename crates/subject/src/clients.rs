//! Shared network clients injected into subject adapters.
//!
//! Adapters receive these pre-built at construction; nothing in the operator
//! creates per-request clients.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ActionError, ObserveError};
use crate::retry::RetryPolicy;

/// Map a reqwest failure onto the transient/fatal split.
fn classify(err: &reqwest::Error) -> ObserveError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ObserveError::Transient(err.to_string())
    } else {
        ObserveError::Fatal(err.to_string())
    }
}

/// JSON client for a subject's control-plane HTTP API, with bounded retry
/// on transient transport failures.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ControlPlaneClient {
    /// Build a client with a 10 s request timeout and default retry policy.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ObserveError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ObserveError::Fatal(e.to_string()))?;
        Ok(Self {
            base: base_url.into().trim_end_matches('/').to_owned(),
            http,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ObserveError> {
        let url = format!("{}{path}", self.base);
        let mut failures = 0u32;
        loop {
            let result = self.try_get(&url).await;
            match result {
                Ok(body) => {
                    return serde_json::from_str(&body)
                        .map_err(|e| ObserveError::Fatal(format!("decoding {url}: {e}")));
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if !self.retry.should_retry(failures) {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(failures);
                    debug!(url = %url, attempt = failures, ?delay, "retrying control-plane request");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_get(&self, url: &str) -> Result<String, ObserveError> {
        let response = self.http.get(url).send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ObserveError::Transient(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else if status.is_server_error() {
            Err(ObserveError::Transient(format!("{url}: HTTP {status}")))
        } else {
            Err(ObserveError::Fatal(format!("{url}: HTTP {status}: {body}")))
        }
    }

    /// POST a JSON body to `path` for a fire-and-forget action. Returns once
    /// the endpoint accepts the request; rejection text passes through raw.
    pub async fn post_action(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), ActionError> {
        let url = format!("{}{path}", self.base);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ActionError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, "control plane rejected action");
            Err(ActionError::RemoteRejected(format!("HTTP {status}: {text}")))
        }
    }
}

/// Minimal client for the Prometheus instant-query API.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: PromData,
}

#[derive(Debug, Default, serde::Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSample>,
}

#[derive(Debug, serde::Deserialize)]
struct PromSample {
    metric: HashMap<String, String>,
    /// `[unix_ts, "value"]`
    value: (f64, String),
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ObserveError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ObserveError::Fatal(e.to_string()))?;
        Ok(Self {
            base: base_url.into().trim_end_matches('/').to_owned(),
            http,
        })
    }

    /// Run an instant query and return one value per result series, keyed by
    /// the given label. Series missing the label or carrying NaN are dropped.
    pub async fn query_by_label(
        &self,
        expr: &str,
        label: &str,
    ) -> Result<HashMap<String, f64>, ObserveError> {
        let url = format!("{}/api/v1/query", self.base);
        let response = self
            .http
            .get(&url)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObserveError::Transient(format!("{url}: HTTP {status}")));
        }

        let parsed: PromResponse = response
            .json()
            .await
            .map_err(|e| ObserveError::Transient(e.to_string()))?;
        if parsed.status != "success" {
            return Err(ObserveError::Transient(format!(
                "prometheus query status {}",
                parsed.status
            )));
        }

        let mut out = HashMap::new();
        for sample in parsed.data.result {
            let Some(key) = sample.metric.get(label) else {
                continue;
            };
            if let Ok(v) = sample.value.1.parse::<f64>() {
                if v.is_finite() {
                    out.insert(key.clone(), v);
                }
            }
        }
        Ok(out)
    }
}
