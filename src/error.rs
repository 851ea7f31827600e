//! Error types shared across the catalog, gateway and proxy layers.

use thiserror::Error;
use uuid::Uuid;

use crate::gateway::SyncStep;

/// Failure of a single gateway admin call.
#[derive(Debug, Error)]
pub enum GatewayError {
  /// The admin endpoint could not be reached (connect error, timeout).
  #[error("gateway unreachable: {method} {url}: {source}")]
  Transport {
    method: reqwest::Method,
    url: String,
    #[source]
    source: reqwest::Error,
  },

  /// The admin endpoint answered with a status the protocol does not accept.
  #[error("gateway returned {status} for {method} {path}: {body}")]
  Status {
    method: reqwest::Method,
    path: String,
    status: u16,
    body: String,
  },

  /// The response body could not be decoded.
  #[error("invalid gateway response for {path}: {message}")]
  Decode { path: String, message: String },
}

impl GatewayError {
  /// HTTP status returned by the gateway, if it answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }
}

/// A reconcile or decommission run that stopped at `step`.
#[derive(Debug, Error)]
#[error("gateway sync failed at {step}: {source}")]
pub struct SyncError {
  pub step: SyncStep,
  #[source]
  pub source: GatewayError,
}

/// Errors surfaced by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
  /// Bad input; nothing was written.
  #[error("validation failed: {0}")]
  Validation(String),

  /// Unknown entry or product id; nothing was written.
  #[error("{kind} {id} not found")]
  NotFound { kind: &'static str, id: Uuid },

  /// The gateway rejected or missed a sync step. The catalog write that
  /// preceded it is already committed.
  #[error(transparent)]
  Gateway(#[from] SyncError),

  /// The upstream of a proxied test request could not be reached.
  #[error("upstream unreachable: {0}")]
  Unreachable(String),

  /// Internal storage failure.
  #[error("catalog store error: {0}")]
  Store(color_eyre::Report),
}

impl From<color_eyre::Report> for CatalogError {
  fn from(report: color_eyre::Report) -> Self {
    Self::Store(report)
  }
}

impl CatalogError {
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation(message.into())
  }

  pub fn entry_not_found(id: Uuid) -> Self {
    Self::NotFound { kind: "api", id }
  }

  pub fn product_not_found(id: Uuid) -> Self {
    Self::NotFound {
      kind: "product",
      id,
    }
  }

  /// Process exit code used by the CLI.
  pub fn exit_code(&self) -> i32 {
    match self {
      Self::Validation(_) => 2,
      Self::NotFound { .. } => 3,
      Self::Gateway(_) | Self::Unreachable(_) => 4,
      Self::Store(_) => 1,
    }
  }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
