//! Serde types matching gateway admin API requests and responses.
//!
//! These are kept separate from catalog types so the wire format can follow
//! the admin API while the catalog keeps its own shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Plugin that short-circuits every request on a route.
pub const TERMINATION_PLUGIN: &str = "request-termination";

/// Status code returned by a disabled route.
pub const DISABLED_STATUS_CODE: u16 = 503;

/// Message returned by a disabled route.
pub const DISABLED_MESSAGE: &str = "API is disabled";

// ============================================================================
// Request bodies
// ============================================================================

/// Body of `PUT /services/{name}`.
#[derive(Debug, Serialize)]
pub struct ServicePayload<'a> {
  pub name: &'a str,
  pub url: &'a str,
  pub tags: &'a BTreeSet<String>,
}

/// Body of `POST /services/{name}/routes` and `PATCH /routes/{name}`.
#[derive(Debug, Serialize)]
pub struct RoutePayload<'a> {
  pub name: &'a str,
  pub paths: Vec<&'a str>,
  pub methods: &'a BTreeSet<String>,
  pub hosts: &'a BTreeSet<String>,
  pub tags: &'a BTreeSet<String>,
}

/// Body of `POST /routes/{name}/plugins` for the termination plugin.
#[derive(Debug, Serialize)]
pub struct PluginPayload {
  pub name: &'static str,
  pub config: TerminationConfig,
}

/// Body of `PATCH /routes/{name}/plugins/{id}` toggling a plugin.
#[derive(Debug, Serialize)]
pub struct PluginToggle {
  pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct TerminationConfig {
  pub status_code: u16,
  pub message: &'static str,
}

impl PluginPayload {
  pub fn termination() -> Self {
    Self {
      name: TERMINATION_PLUGIN,
      config: TerminationConfig {
        status_code: DISABLED_STATUS_CODE,
        message: DISABLED_MESSAGE,
      },
    }
  }
}

// ============================================================================
// Responses
// ============================================================================

/// Response of `GET /routes/{name}/plugins`.
#[derive(Debug, Deserialize)]
pub struct ApiPluginList {
  #[serde(default)]
  pub data: Vec<ApiPlugin>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPlugin {
  pub id: String,
  pub name: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
}

fn default_enabled() -> bool {
  true
}

impl ApiPluginList {
  /// The termination plugin attached to the route, if any.
  pub fn termination(&self) -> Option<&ApiPlugin> {
    self.data.iter().find(|p| p.name == TERMINATION_PLUGIN)
  }
}
