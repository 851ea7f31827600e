use std::collections::BTreeSet;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

use super::api_types::{ApiPluginList, PluginPayload, PluginToggle, RoutePayload, ServicePayload};

/// What `set_enabled` had to do to reach the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginChange {
  Added,
  /// A switched-off termination plugin was switched back on
  Enabled,
  Removed,
  Unchanged,
}

/// Gateway admin API client
#[derive(Clone)]
pub struct GatewayClient {
  http: reqwest::Client,
  base_url: String,
}

impl GatewayClient {
  pub fn new(config: &GatewayConfig) -> Result<Self> {
    Self::with_base_url(&config.admin_url, config.timeout())
  }

  pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create gateway client: {}", e))?;

    Ok(Self {
      http,
      base_url: base_url.trim_end_matches('/').to_string(),
    })
  }

  /// Create or wholesale replace the service `name`.
  pub async fn upsert_service(
    &self,
    name: &str,
    upstream_url: &str,
    tags: &BTreeSet<String>,
  ) -> Result<(), GatewayError> {
    let path = format!("/services/{}", name);
    let body = ServicePayload {
      name,
      url: upstream_url,
      tags,
    };

    let response = self.send_json(Method::PUT, &path, &body).await?;
    check(Method::PUT, &path, response).await?;
    Ok(())
  }

  /// Check whether the route `name` exists under the service of the same name.
  ///
  /// A 404 means the route is absent; any other failure status is an error.
  pub async fn route_exists(&self, name: &str) -> Result<bool, GatewayError> {
    let path = format!("/services/{}/routes/{}", name, name);

    let response = self.send(Method::GET, &path).await?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(false);
    }
    check(Method::GET, &path, response).await?;
    Ok(true)
  }

  /// Patch the route if it `existed`, otherwise create it under its service.
  pub async fn upsert_route(
    &self,
    name: &str,
    route: &str,
    methods: &BTreeSet<String>,
    hosts: &BTreeSet<String>,
    tags: &BTreeSet<String>,
    existed: bool,
  ) -> Result<(), GatewayError> {
    let body = RoutePayload {
      name,
      paths: vec![route],
      methods,
      hosts,
      tags,
    };

    let (method, path) = if existed {
      (Method::PATCH, format!("/routes/{}", name))
    } else {
      (Method::POST, format!("/services/{}/routes", name))
    };

    let response = self.send_json(method.clone(), &path, &body).await?;
    check(method, &path, response).await?;
    Ok(())
  }

  /// List plugins attached to the route `name`.
  pub async fn list_plugins(&self, name: &str) -> Result<ApiPluginList, GatewayError> {
    let path = format!("/routes/{}/plugins", name);

    let response = self.send(Method::GET, &path).await?;
    let response = check(Method::GET, &path, response).await?;

    response
      .json::<ApiPluginList>()
      .await
      .map_err(|e| GatewayError::Decode {
        path,
        message: e.to_string(),
      })
  }

  /// Converge the route's termination plugin so it is active iff `enabled`
  /// is false. A termination plugin that exists but is switched off does not
  /// block traffic, so a disabled entry switches it on.
  pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<PluginChange, GatewayError> {
    let plugins = self.list_plugins(name).await?;

    match (enabled, plugins.termination()) {
      (true, Some(plugin)) => {
        let path = format!("/routes/{}/plugins/{}", name, plugin.id);
        let response = self.send(Method::DELETE, &path).await?;
        // Someone else removed it in the meantime
        if response.status() != StatusCode::NOT_FOUND {
          check(Method::DELETE, &path, response).await?;
        }
        Ok(PluginChange::Removed)
      }
      (false, None) => {
        let path = format!("/routes/{}/plugins", name);
        let response = self
          .send_json(Method::POST, &path, &PluginPayload::termination())
          .await?;
        check(Method::POST, &path, response).await?;
        Ok(PluginChange::Added)
      }
      (false, Some(plugin)) if !plugin.enabled => {
        let path = format!("/routes/{}/plugins/{}", name, plugin.id);
        let response = self
          .send_json(Method::PATCH, &path, &PluginToggle { enabled: true })
          .await?;
        check(Method::PATCH, &path, response).await?;
        Ok(PluginChange::Enabled)
      }
      _ => Ok(PluginChange::Unchanged),
    }
  }

  /// Delete the route `name`. Returns false if it was already gone.
  pub async fn delete_route(&self, name: &str) -> Result<bool, GatewayError> {
    self
      .delete(&format!("/services/{}/routes/{}", name, name))
      .await
  }

  /// Delete the service `name`. Returns false if it was already gone.
  pub async fn delete_service(&self, name: &str) -> Result<bool, GatewayError> {
    self.delete(&format!("/services/{}", name)).await
  }

  async fn delete(&self, path: &str) -> Result<bool, GatewayError> {
    let response = self.send(Method::DELETE, path).await?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(false);
    }
    check(Method::DELETE, path, response).await?;
    Ok(true)
  }

  async fn send(&self, method: Method, path: &str) -> Result<Response, GatewayError> {
    let url = self.url(path);
    let request = self.http.request(method.clone(), &url);
    dispatch(method, url, request).await
  }

  async fn send_json<B: Serialize + ?Sized>(
    &self,
    method: Method,
    path: &str,
    body: &B,
  ) -> Result<Response, GatewayError> {
    let url = self.url(path);
    let request = self.http.request(method.clone(), &url).json(body);
    dispatch(method, url, request).await
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }
}

async fn dispatch(
  method: Method,
  url: String,
  request: reqwest::RequestBuilder,
) -> Result<Response, GatewayError> {
  debug!(%method, %url, "gateway request");

  match request.send().await {
    Ok(response) => {
      debug!(%method, %url, status = response.status().as_u16(), "gateway response");
      Ok(response)
    }
    Err(source) => Err(GatewayError::Transport {
      method,
      url,
      source,
    }),
  }
}

/// Turn a non-2xx response into an error carrying the status and body.
async fn check(method: Method, path: &str, response: Response) -> Result<Response, GatewayError> {
  if response.status().is_success() {
    return Ok(response);
  }

  let status = response.status().as_u16();
  let body = response.text().await.unwrap_or_default();
  Err(GatewayError::Status {
    method,
    path: path.to_string(),
    status,
    body,
  })
}
