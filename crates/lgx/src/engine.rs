//! 📡 The search engine client: one reqwest client, the auth rules, the URL rules.
//!
//! 🔒 Auth precedence: an API key header beats basic auth, and no credentials
//! at all is allowed (local clusters, security plugin off, living dangerously).
//!
//! Every call goes through `execute`, which turns "never got an answer" into
//! `IndexError::Network` and hands back status + body for the caller to judge.
//! The bulk path and the setup path judge differently, so judging is not done here.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::error::IndexError;

/// ⚙️ `[engine]` section.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// 📡 where the engine lives
    #[serde(default = "default_url")]
    pub url: String,
    /// 🔒 the bouncer at the club, except the club is a search cluster
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key, wins over username/password
    #[serde(default)]
    pub api_key: Option<String>,
    /// 📊 dashboards endpoint for saved-view import
    #[serde(default)]
    pub dashboards_url: Option<String>,
    /// 🛂 security plugin on: role mapping is part of bootstrap
    #[serde(default)]
    pub fine_grained_access_control: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            api_key: None,
            dashboards_url: None,
            fine_grained_access_control: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// 📬 What came back: status and raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub status: u16,
    pub body: String,
}

impl EngineResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 🦆 Parse the body, blaming `operation` if it isn't what we expected.
    pub fn json<T: DeserializeOwned>(&self, operation: &str) -> Result<T, IndexError> {
        serde_json::from_str(&self.body).map_err(|err| IndexError::Fatal {
            operation: operation.to_string(),
            reason: format!("response body is not the expected JSON ({err}): {:.200}", self.body),
        })
    }

    /// 🏷️ Success passes through, anything else becomes the matching `IndexError`.
    pub fn error_for_status(self, operation: &str) -> Result<Self, IndexError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(IndexError::from_status(operation, self.status, self.body))
        }
    }
}

/// 📡 Thin wrapper around `reqwest::Client` that knows the base URL and the credentials.
#[derive(Debug, Clone)]
pub struct EngineClient {
    client: reqwest::Client,
    config: EngineConfig,
}

impl EngineClient {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a TLS setup problem on this host.")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 🔗 `{url}/{path}` without doubled slashes.
    pub fn url(&self, path: &str) -> String {
        join_url(&self.config.url, path)
    }

    /// 🔗 Same, against the dashboards endpoint, if there is one.
    pub fn dashboards_url(&self, path: &str) -> Option<String> {
        self.config
            .dashboards_url
            .as_deref()
            .map(|base| join_url(base, path))
    }

    /// 🔒 A request with credentials attached.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 🦆 A request with a JSON body. Serialized by hand so the client needs no extra features.
    pub fn json_request(&self, method: Method, url: &str, body: &Value) -> RequestBuilder {
        self.request(method, url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    /// 📦 A bulk request with an NDJSON body.
    pub fn ndjson_request(&self, url: &str, body: String) -> RequestBuilder {
        self.request(Method::POST, url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
    }

    /// 🚀 Send it and collect status + body.
    pub async fn execute(&self, operation: &str, request: RequestBuilder) -> Result<EngineResponse, IndexError> {
        let response = request.send().await.map_err(|source| IndexError::Network {
            operation: operation.to_string(),
            source,
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|source| IndexError::Network {
            operation: operation.to_string(),
            source,
        })?;
        trace!(status, "📬 {operation} answered with {} bytes", body.len());
        Ok(EngineResponse { status, body })
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
