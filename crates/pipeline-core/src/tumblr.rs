//! Rate-limited client for the remote blog API.
//!
//! The client is the single entry point for outbound HTTP. It paces requests
//! per instance (one client per worker, so each worker has an independent
//! pacing clock) and never fails on non-2xx responses: callers inspect
//! `meta.status` on the decoded envelope instead.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing between two requests from the same client instance.
pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(200);

/// Page size of the posts endpoint; offsets advance in these steps.
pub const POSTS_PAGE_SIZE: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMeta {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// A decoded API response, flattened into `{meta, blog, posts, ...}`.
///
/// The wire shape is `{meta: {status, msg}, response: {...}}`; the client
/// merges the response fields up one level so callers address `blog` and
/// `posts` directly. Serializing an envelope reproduces the flattened form,
/// which is also the staging format for raw blog records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ApiMeta>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ApiEnvelope {
    pub fn status(&self) -> Option<u16> {
        self.meta.as_ref().map(|m| m.status)
    }

    pub fn blog(&self) -> Option<&Value> {
        self.body.get("blog")
    }

    pub fn posts(&self) -> Option<&Vec<Value>> {
        self.body.get("posts")?.as_array()
    }

    /// Total post count advertised in the blog metadata.
    pub fn blog_post_count(&self) -> Option<u64> {
        self.blog()?.get("posts")?.as_u64()
    }
}

/// Seam for the two remote operations the pipeline consumes. Production uses
/// [`TumblrClient`]; tests substitute scripted fixtures.
#[async_trait]
pub trait TumblrApi: Send + Sync {
    async fn blog_info(&self, name: &str) -> anyhow::Result<ApiEnvelope>;

    async fn posts(&self, name: &str, offset: u64) -> anyhow::Result<ApiEnvelope>;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    meta: Option<ApiMeta>,
    #[serde(default)]
    response: Option<Value>,
}

pub struct TumblrClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
    last_request: Mutex<Option<Instant>>,
}

impl TumblrClient {
    pub fn new(base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            api_key: api_key.into(),
            last_request: Mutex::new(None),
        }
    }

    /// Sleep out the remainder of [`MIN_REQUEST_INTERVAL`] since the previous
    /// request from this instance.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get(&self, url: String, query: &[(&str, String)]) -> anyhow::Result<ApiEnvelope> {
        self.pace().await;
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let wire: WireResponse = resp
            .json()
            .await
            .with_context(|| format!("decode response of {url}"))?;
        let body = match wire.response {
            Some(Value::Object(map)) => map,
            // Error responses carry `"response": []`; nothing to flatten.
            _ => Map::new(),
        };
        Ok(ApiEnvelope {
            meta: wire.meta,
            body,
        })
    }
}

#[async_trait]
impl TumblrApi for TumblrClient {
    async fn blog_info(&self, name: &str) -> anyhow::Result<ApiEnvelope> {
        let url = format!("{}/v2/blog/{}/info", self.base, name);
        self.get(url, &[("api_key", self.api_key.clone())]).await
    }

    async fn posts(&self, name: &str, offset: u64) -> anyhow::Result<ApiEnvelope> {
        let url = format!("{}/v2/blog/{}/posts", self.base, name);
        self.get(
            url,
            &[
                ("api_key", self.api_key.clone()),
                ("offset", offset.to_string()),
                ("limit", POSTS_PAGE_SIZE.to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_exposes_flattened_fields() {
        let envelope: ApiEnvelope = serde_json::from_value(json!({
            "meta": {"status": 200, "msg": "OK"},
            "blog": {"name": "staff", "uuid": "t:abc", "posts": 42},
            "posts": [{"id": 1}, {"id": 2}],
        }))
        .unwrap();

        assert_eq!(envelope.status(), Some(200));
        assert_eq!(envelope.blog_post_count(), Some(42));
        assert_eq!(envelope.posts().map(Vec::len), Some(2));
    }

    #[test]
    fn envelope_without_meta_has_no_status() {
        let envelope: ApiEnvelope =
            serde_json::from_value(json!({"blog": {"posts": 3}})).unwrap();
        assert_eq!(envelope.status(), None);
        assert!(envelope.posts().is_none());
    }

    #[test]
    fn envelope_serialization_keeps_flattened_shape() {
        let envelope: ApiEnvelope = serde_json::from_value(json!({
            "meta": {"status": 200},
            "blog": {"uuid": "t:abc"},
        }))
        .unwrap();
        let round_tripped = serde_json::to_value(&envelope).unwrap();
        assert_eq!(round_tripped["meta"]["status"], 200);
        assert_eq!(round_tripped["blog"]["uuid"], "t:abc");
    }
}
