use crate::client::{BulkItemResponse, BulkResponse, IndexClient, IndexRequest, DEFAULT_DOC_TYPE};
use crate::env::{
    env_or, ELASTIC_HOOK_PASSWORD_ENV, ELASTIC_HOOK_TIMEOUT_SECS_ENV, ELASTIC_HOOK_URL_ENV,
    ELASTIC_HOOK_USERNAME_ENV,
};
use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for [`ElasticClient`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    /// Base URL of the cluster, e.g. "http://localhost:9200".
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout. Zero disables it.
    pub timeout_secs: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl ElasticConfig {
    /// Build a config from `ELASTIC_HOOK_*` variables, falling back to
    /// [`ElasticConfig::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout_secs = env_or(ELASTIC_HOOK_TIMEOUT_SECS_ENV, "")
            .parse()
            .unwrap_or(defaults.timeout_secs);

        Self {
            url: env_or(ELASTIC_HOOK_URL_ENV, &defaults.url),
            username: std::env::var(ELASTIC_HOOK_USERNAME_ENV).ok(),
            password: std::env::var(ELASTIC_HOOK_PASSWORD_ENV).ok(),
            timeout_secs,
        }
    }
}

/// Elasticsearch implementation of [`IndexClient`] over the HTTP API.
#[derive(Clone)]
pub struct ElasticClient {
    client: Client,
    config: ElasticConfig,
}

impl ElasticClient {
    pub fn new(config: ElasticConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder();
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(user) => req.basic_auth(user, self.config.password.as_ref()),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
        Err(ClientError::Status { status, body })
    }

    fn bulk_body(requests: &[IndexRequest]) -> String {
        let mut body = String::with_capacity(requests.iter().map(IndexRequest::size_in_bytes).sum());
        for request in requests {
            body.push_str(&request.action_line());
            body.push('\n');
            body.push_str(&request.body);
            body.push('\n');
        }
        body
    }
}

#[async_trait]
impl IndexClient for ElasticClient {
    async fn index_exists(&self, index: &str) -> Result<bool, ClientError> {
        let url = self.url(&urlencoding::encode(index));
        let resp = self.authorize(self.client.head(&url)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(ClientError::Status {
                status: s.as_u16(),
                body: String::new(),
            }),
        }
    }

    async fn index(&self, request: &IndexRequest) -> Result<(), ClientError> {
        let doc_type = if request.doc_type.is_empty() {
            DEFAULT_DOC_TYPE
        } else {
            request.doc_type.as_str()
        };
        let url = self.url(&format!(
            "{}/{}",
            urlencoding::encode(&request.index),
            urlencoding::encode(doc_type)
        ));
        let resp = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json")
            .body(request.body.clone())
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn bulk(&self, requests: &[IndexRequest]) -> Result<BulkResponse, ClientError> {
        if requests.is_empty() {
            return Ok(BulkResponse::default());
        }

        let resp = self
            .authorize(self.client.post(self.url("_bulk")))
            .header("Content-Type", "application/x-ndjson")
            .body(Self::bulk_body(requests))
            .send()
            .await?;
        let raw: RawBulkResponse = Self::check(resp).await?.json().await?;
        debug!(items = raw.items.len(), took = raw.took, "bulk response");

        if raw.items.len() != requests.len() {
            // Requests without an item are reported as failed by the caller.
            debug!(
                items = raw.items.len(),
                requests = requests.len(),
                "bulk response does not answer every request"
            );
        }

        let items = raw
            .items
            .into_iter()
            .take(requests.len())
            .map(|mut item| {
                // One action per item; we only ever send "index".
                let (_, result) = item.drain().next().unwrap_or_default();
                BulkItemResponse {
                    index: result.index,
                    status: result.status,
                    error: result.error.map(|e| e.to_string()),
                }
            })
            .collect();

        Ok(BulkResponse {
            took: raw.took,
            errors: raw.errors,
            items,
        })
    }
}

#[derive(Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, RawBulkItem>>,
}

#[derive(Deserialize, Default)]
struct RawBulkItem {
    #[serde(default, rename = "_index")]
    index: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::Document;

    #[test]
    fn bulk_body_is_ndjson() {
        let mut doc = Document::new();
        doc.insert("message".into(), "hi".into());
        let typed = IndexRequest::new("logs", "doc", &doc).unwrap();
        let untyped = IndexRequest::new("logs", DEFAULT_DOC_TYPE, &doc).unwrap();

        let body = ElasticClient::bulk_body(&[typed, untyped]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"index":{"_index":"logs","_type":"doc"}}"#,
                r#"{"message":"hi"}"#,
                r#"{"index":{"_index":"logs"}}"#,
                r#"{"message":"hi"}"#,
            ]
        );
        assert!(body.ends_with('\n'));
    }
}
