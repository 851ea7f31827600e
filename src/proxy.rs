//! Forwards a one-off test request to an entry's upstream.

use std::collections::BTreeMap;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::ApiEntry;
use crate::error::{CatalogError, CatalogResult};

#[derive(Debug, Clone, Deserialize)]
pub struct TestRequest {
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResponse {
  pub status_code: u16,
  pub headers: BTreeMap<String, Vec<String>>,
  pub body: String,
}

#[derive(Clone)]
pub struct TestProxy {
  http: reqwest::Client,
}

impl TestProxy {
  pub fn new(timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create proxy client: {}", e))?;

    Ok(Self { http })
  }

  /// Send `request` to the entry's upstream URL and return the response as is.
  pub async fn send(&self, entry: &ApiEntry, request: &TestRequest) -> CatalogResult<TestResponse> {
    let method = Method::from_bytes(request.method.trim().to_uppercase().as_bytes())
      .map_err(|_| CatalogError::validation(format!("invalid HTTP method {:?}", request.method)))?;
    let headers = build_headers(&request.headers)?;

    let mut builder = self
      .http
      .request(method.clone(), &entry.upstream_url)
      .headers(headers.clone());
    if let Some(body) = &request.body {
      if !headers.contains_key(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, "application/json");
      }
      builder = builder.body(body.clone());
    }

    debug!(api = %entry.name, %method, url = %entry.upstream_url, "forwarding test request");
    let response = builder.send().await.map_err(|e| {
      warn!(api = %entry.name, error = %e, "upstream unreachable");
      CatalogError::Unreachable(format!("{}: {}", entry.upstream_url, e))
    })?;

    let status_code = response.status().as_u16();
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in response.headers() {
      headers
        .entry(name.as_str().to_string())
        .or_default()
        .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let body = response.text().await.map_err(|e| {
      CatalogError::Unreachable(format!("failed to read upstream response: {}", e))
    })?;

    Ok(TestResponse {
      status_code,
      headers,
      body,
    })
  }
}

fn build_headers(raw: &BTreeMap<String, String>) -> CatalogResult<HeaderMap> {
  let mut headers = HeaderMap::new();
  for (name, value) in raw {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|_| CatalogError::validation(format!("invalid header name {name:?}")))?;
    let value = HeaderValue::from_str(value)
      .map_err(|_| CatalogError::validation(format!("invalid value for header {name}")))?;
    headers.insert(name, value);
  }
  Ok(headers)
}
