//! REST implementation of [`CoordinatorApi`].
//!
//! Speaks the coordinator's PostgREST-style surface:
//!
//! - `GET    /rest/v1/<resource>?<field>=<op>.<value>&select=...`
//! - `POST   /rest/v1/<resource>` with `Prefer: return=representation`
//! - `PATCH  /rest/v1/<resource>?<filters>` (partial update)
//! - `DELETE /rest/v1/<resource>?<filters>`
//!
//! Every request carries the service bearer token and the API key header.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use super::{CoordinatorApi, Filter, SelectOptions};
use crate::config::Config;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RestCoordinator {
    client: reqwest::Client,
    base_url: String,
}

impl RestCoordinator {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key).context("API key is not a valid header")?,
        );
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", config.service_token))
                .context("service token is not a valid header")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(DEFAULT_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build coordinator HTTP client")?;

        Ok(Self {
            client,
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
        })
    }

    fn resource_url(&self, resource: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, resource)
    }

    fn apply_filters(
        request: reqwest::RequestBuilder,
        filters: &[Filter],
    ) -> reqwest::RequestBuilder {
        let pairs: Vec<(String, String)> = filters.iter().map(Filter::to_query_pair).collect();
        request.query(&pairs)
    }

    async fn read_rows(response: reqwest::Response, context: &str) -> Result<Vec<Value>> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("coordinator {context} failed: {status}: {}", excerpt(&body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value =
            serde_json::from_str(&body).with_context(|| format!("coordinator {context} returned invalid JSON"))?;
        match value {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }
}

#[async_trait]
impl CoordinatorApi for RestCoordinator {
    async fn select(
        &self,
        resource: &str,
        filters: &[Filter],
        opts: SelectOptions,
    ) -> Result<Vec<Value>> {
        let mut request = self.client.get(self.resource_url(resource));
        request = Self::apply_filters(request, filters);
        if let Some(select) = opts.select {
            request = request.query(&[("select", select)]);
        }
        if let Some(order) = opts.order {
            request = request.query(&[("order", order)]);
        }
        if let Some(limit) = opts.limit {
            request = request.query(&[("limit", limit.to_string())]);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("coordinator GET {resource} failed to send"))?;
        Self::read_rows(response, resource).await
    }

    async fn insert(&self, resource: &str, row: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.resource_url(resource))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .with_context(|| format!("coordinator POST {resource} failed to send"))?;
        let mut rows = Self::read_rows(response, resource).await?;
        match rows.pop() {
            Some(inserted) => Ok(inserted),
            None => bail!("coordinator POST {resource} returned no representation"),
        }
    }

    async fn patch(&self, resource: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .request(Method::PATCH, self.resource_url(resource))
            .header("Prefer", "return=representation")
            .json(&patch);
        request = Self::apply_filters(request, filters);

        let response = request
            .send()
            .await
            .with_context(|| format!("coordinator PATCH {resource} failed to send"))?;

        // A 404 on a keyed patch means the row vanished under us: the same
        // "lost the race" outcome as zero rows changed.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::read_rows(response, resource).await
    }

    async fn delete(&self, resource: &str, filters: &[Filter]) -> Result<u64> {
        let mut request = self
            .client
            .delete(self.resource_url(resource))
            .header("Prefer", "return=representation");
        request = Self::apply_filters(request, filters);

        let response = request
            .send()
            .await
            .with_context(|| format!("coordinator DELETE {resource} failed to send"))?;
        let rows = Self::read_rows(response, resource).await?;
        Ok(rows.len() as u64)
    }
}

fn excerpt(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(300)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_bounds_long_bodies() {
        let long = "x".repeat(1000);
        assert_eq!(excerpt(&long).len(), 300);
        assert_eq!(excerpt("short"), "short");
    }
}
