//! Policy kinds and their configuration schemas.
//!
//! Policies are stored as a free-form `type` plus JSON text. Known kinds are
//! parsed into typed configs and checked before anything is written; unknown
//! kinds only need a JSON object.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};

use super::types::{Policy, PolicyInput};

const MAX_KIND_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyKind {
  RateLimiting(RateLimitingConfig),
  KeyAuth(KeyAuthConfig),
  Cors(CorsConfig),
  IpRestriction(IpRestrictionConfig),
  RequestSizeLimiting(RequestSizeLimitingConfig),
  Custom { kind: String, config: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingConfig {
  pub second: Option<u64>,
  pub minute: Option<u64>,
  pub hour: Option<u64>,
  pub day: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyAuthConfig {
  #[serde(default = "default_key_names")]
  pub key_names: Vec<String>,
  #[serde(default)]
  pub hide_credentials: bool,
}

fn default_key_names() -> Vec<String> {
  vec!["apikey".to_string()]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
  pub origins: Vec<String>,
  #[serde(default)]
  pub methods: Vec<String>,
  #[serde(default)]
  pub credentials: bool,
  pub max_age: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpRestrictionConfig {
  #[serde(default)]
  pub allow: Vec<String>,
  #[serde(default)]
  pub deny: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSizeLimitingConfig {
  /// Megabytes
  pub allowed_payload_size: u64,
}

impl PolicyKind {
  /// Parse and validate a stored `(type, configuration)` pair.
  pub fn parse(kind: &str, configuration: &str) -> CatalogResult<Self> {
    let kind = kind.trim();
    if kind.is_empty() || kind.len() > MAX_KIND_LEN {
      return Err(CatalogError::validation(format!(
        "policy type must be 1 to {MAX_KIND_LEN} characters"
      )));
    }

    let value: Value = serde_json::from_str(configuration).map_err(|e| {
      CatalogError::validation(format!("policy {kind} configuration is not JSON: {e}"))
    })?;
    let Value::Object(map) = value else {
      return Err(CatalogError::validation(format!(
        "policy {kind} configuration must be a JSON object"
      )));
    };

    let parsed = match kind {
      "rate-limiting" => {
        let config: RateLimitingConfig = typed(kind, map)?;
        let limits = [config.second, config.minute, config.hour, config.day];
        if limits.iter().all(Option::is_none) {
          return Err(CatalogError::validation(
            "rate-limiting needs at least one of second, minute, hour, day",
          ));
        }
        if limits.iter().flatten().any(|&n| n == 0) {
          return Err(CatalogError::validation("rate-limiting limits must be positive"));
        }
        Self::RateLimiting(config)
      }
      "key-auth" => {
        let config: KeyAuthConfig = typed(kind, map)?;
        if config.key_names.is_empty() || config.key_names.iter().any(|k| k.trim().is_empty()) {
          return Err(CatalogError::validation("key-auth key_names must be non-empty"));
        }
        Self::KeyAuth(config)
      }
      "cors" => {
        let config: CorsConfig = typed(kind, map)?;
        if config.origins.is_empty() {
          return Err(CatalogError::validation("cors needs at least one origin"));
        }
        Self::Cors(config)
      }
      "ip-restriction" => {
        let config: IpRestrictionConfig = typed(kind, map)?;
        if config.allow.is_empty() && config.deny.is_empty() {
          return Err(CatalogError::validation(
            "ip-restriction needs an allow or deny list",
          ));
        }
        for range in config.allow.iter().chain(&config.deny) {
          validate_ip_range(range)?;
        }
        Self::IpRestriction(config)
      }
      "request-size-limiting" => {
        let config: RequestSizeLimitingConfig = typed(kind, map)?;
        if config.allowed_payload_size == 0 {
          return Err(CatalogError::validation(
            "request-size-limiting allowed_payload_size must be positive",
          ));
        }
        Self::RequestSizeLimiting(config)
      }
      other => Self::Custom {
        kind: other.to_string(),
        config: map,
      },
    };

    Ok(parsed)
  }

  pub fn kind(&self) -> &str {
    match self {
      Self::RateLimiting(_) => "rate-limiting",
      Self::KeyAuth(_) => "key-auth",
      Self::Cors(_) => "cors",
      Self::IpRestriction(_) => "ip-restriction",
      Self::RequestSizeLimiting(_) => "request-size-limiting",
      Self::Custom { kind, .. } => kind,
    }
  }
}

fn typed<T: DeserializeOwned>(kind: &str, map: Map<String, Value>) -> CatalogResult<T> {
  serde_json::from_value(Value::Object(map))
    .map_err(|e| CatalogError::validation(format!("invalid {kind} configuration: {e}")))
}

/// Accepts a single address or CIDR notation.
fn validate_ip_range(range: &str) -> CatalogResult<()> {
  let invalid = || CatalogError::validation(format!("invalid IP or CIDR {range:?}"));

  let (addr, prefix) = match range.split_once('/') {
    Some((addr, prefix)) => (addr, Some(prefix)),
    None => (range, None),
  };
  let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
  if let Some(prefix) = prefix {
    let bits: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if bits > max {
      return Err(invalid());
    }
  }
  Ok(())
}

/// Validate a full replacement set and turn it into stored policies.
pub fn build_policies(inputs: &[PolicyInput]) -> CatalogResult<Vec<Policy>> {
  let mut seen = HashSet::new();
  inputs
    .iter()
    .map(|input| {
      let parsed = PolicyKind::parse(&input.kind, &input.configuration)?;
      if !seen.insert(parsed.kind().to_string()) {
        return Err(CatalogError::validation(format!(
          "policy {} listed more than once",
          parsed.kind()
        )));
      }
      Ok(Policy {
        id: Uuid::new_v4(),
        kind: parsed.kind().to_string(),
        configuration: input.configuration.clone(),
      })
    })
    .collect()
}
