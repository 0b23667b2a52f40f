use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use super::{BulkResponse, DocumentStore, IndexOp, ItemFailure, StoreError};
use crate::config::ElasticsearchConfig;

/// Elasticsearch bulk API client. Requests rotate over the configured hosts.
#[derive(Debug)]
pub struct ElasticsearchStore {
    http: Client,
    hosts: Vec<Url>,
    next_host: AtomicUsize,
    send_type: bool,
}

impl ElasticsearchStore {
    pub fn from_config(config: &ElasticsearchConfig) -> Result<Self, StoreError> {
        let hosts = parse_hosts(&config.hosts, config.default_port);
        if hosts.is_empty() {
            return Err(StoreError::Transport(format!(
                "no usable elasticsearch host in '{}'",
                config.hosts
            )));
        }
        let http = Client::builder()
            .user_agent(concat!("forecast-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            hosts,
            next_host: AtomicUsize::new(0),
            send_type: config.send_type,
        })
    }

    pub fn build_request(&self, ops: &[IndexOp]) -> Result<reqwest::Request, StoreError> {
        let n = self.next_host.fetch_add(1, Ordering::Relaxed);
        let base = &self.hosts[n % self.hosts.len()];
        let endpoint = base
            .join("_bulk")
            .map_err(|e| StoreError::Transport(format!("invalid host {}: {}", base, e)))?;
        let body = build_bulk_body(ops, self.send_type)?;
        self.http
            .post(endpoint)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn bulk(&self, ops: &[IndexOp]) -> Result<BulkResponse, StoreError> {
        let request = self.build_request(ops)?;
        debug!(url=%request.url(), ops = ops.len(), "sending bulk request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            warn!(%status, "bulk request rejected");
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_bulk_response(&body)
    }
}

/// Split a comma-separated `host[:port]` list into base URLs. Entries with an
/// explicit `http://` or `https://` scheme are taken as they are; a missing or
/// unparsable port falls back to `default_port`.
pub fn parse_hosts(hosts: &str, default_port: u16) -> Vec<Url> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .filter_map(|entry| {
            let raw = if entry.starts_with("http://") || entry.starts_with("https://") {
                entry.to_string()
            } else {
                let (host, port) = match entry.split_once(':') {
                    Some((host, port)) => (host, port.trim().parse().unwrap_or(default_port)),
                    None => (entry, default_port),
                };
                format!("http://{}:{}/", host, port)
            };
            match Url::parse(&raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(entry, %err, "ignoring invalid elasticsearch host");
                    None
                }
            }
        })
        .collect()
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(rename = "_id")]
    id: &'a str,
}

#[derive(Serialize)]
struct Action<'a> {
    index: ActionMeta<'a>,
}

/// NDJSON body: an action line and a source line per op, newline-terminated.
pub fn build_bulk_body(ops: &[IndexOp], send_type: bool) -> Result<String, StoreError> {
    let mut body = String::with_capacity(ops.iter().map(IndexOp::size_bytes).sum());
    for op in ops {
        let action = Action {
            index: ActionMeta {
                index: &op.index,
                doc_type: send_type.then_some(op.doc_type.as_str()),
                id: &op.id,
            },
        };
        let line = serde_json::to_string(&action)
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
        body.push_str(&op.source);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Deserialize)]
struct BulkBody {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub fn parse_bulk_response(body: &str) -> Result<BulkResponse, StoreError> {
    let parsed: BulkBody =
        serde_json::from_str(body).map_err(|e| StoreError::Response(e.to_string()))?;
    if !parsed.errors {
        return Ok(BulkResponse::default());
    }
    let failures = parsed
        .items
        .into_iter()
        .enumerate()
        .filter_map(|(position, item)| {
            let item = item.into_values().next()?;
            if item.status < 300 && item.error.is_none() {
                return None;
            }
            let reason = match item.error {
                Some(err) => err
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
                None => String::new(),
            };
            Some(ItemFailure {
                position,
                status: item.status,
                reason,
            })
        })
        .collect();
    Ok(BulkResponse { failures })
}
