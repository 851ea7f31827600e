//! Input validation and normalization for catalog writes.

use std::collections::BTreeSet;

use url::Url;

use crate::error::{CatalogError, CatalogResult};

use super::types::{EntryFields, EntryInput, ProductInput};

const MAX_NAME_LEN: usize = 100;
const MAX_ROUTE_LEN: usize = 200;
const MAX_URL_LEN: usize = 500;
const MAX_DESCRIPTION_LEN: usize = 500;

const HTTP_METHODS: &[&str] = &[
  "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "TRACE", "CONNECT",
];

/// Validate an entry write and normalize its sets.
pub fn entry_fields(input: &EntryInput) -> CatalogResult<EntryFields> {
  let name = input.name.trim();
  validate_name(name)?;

  let route = input.route.trim();
  if !route.starts_with('/') {
    return Err(CatalogError::validation(format!(
      "route must start with '/': {route:?}"
    )));
  }
  if route.len() > MAX_ROUTE_LEN || route.chars().any(char::is_whitespace) {
    return Err(CatalogError::validation(format!(
      "route must be at most {MAX_ROUTE_LEN} characters without whitespace"
    )));
  }

  let upstream_url = input.upstream_url.trim();
  validate_upstream(upstream_url)?;

  let methods = input
    .methods
    .iter()
    .map(|m| {
      let upper = m.trim().to_uppercase();
      if HTTP_METHODS.contains(&upper.as_str()) {
        Ok(upper)
      } else {
        Err(CatalogError::validation(format!("unknown HTTP method {m:?}")))
      }
    })
    .collect::<CatalogResult<BTreeSet<_>>>()?;

  Ok(EntryFields {
    name: name.to_string(),
    route: route.to_string(),
    upstream_url: upstream_url.to_string(),
    methods,
    hosts: non_empty_set("host", &input.hosts)?,
    tags: non_empty_set("tag", &input.tags)?,
    enabled: input.enabled,
  })
}

/// Entry names become gateway path segments, so they are limited to
/// characters that need no escaping.
fn validate_name(name: &str) -> CatalogResult<()> {
  if name.is_empty() || name.len() > MAX_NAME_LEN {
    return Err(CatalogError::validation(format!(
      "name must be 1 to {MAX_NAME_LEN} characters"
    )));
  }
  let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~');
  if !name.chars().all(allowed) {
    return Err(CatalogError::validation(format!(
      "name {name:?} may only contain letters, digits, '-', '_', '.' and '~'"
    )));
  }
  // "." and ".." are dot-segments and would be resolved away in admin paths
  if !name.chars().any(|c| c.is_ascii_alphanumeric()) {
    return Err(CatalogError::validation(format!(
      "name {name:?} must contain at least one letter or digit"
    )));
  }
  Ok(())
}

fn validate_upstream(upstream_url: &str) -> CatalogResult<()> {
  if upstream_url.len() > MAX_URL_LEN {
    return Err(CatalogError::validation(format!(
      "upstream_url must be at most {MAX_URL_LEN} characters"
    )));
  }
  let url = Url::parse(upstream_url)
    .map_err(|e| CatalogError::validation(format!("invalid upstream_url {upstream_url:?}: {e}")))?;
  if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
    return Err(CatalogError::validation(format!(
      "upstream_url must be an absolute http(s) URL: {upstream_url:?}"
    )));
  }
  Ok(())
}

fn non_empty_set(what: &str, values: &[String]) -> CatalogResult<BTreeSet<String>> {
  values
    .iter()
    .map(|v| {
      let v = v.trim();
      if v.is_empty() {
        Err(CatalogError::validation(format!("{what} must not be empty")))
      } else {
        Ok(v.to_string())
      }
    })
    .collect()
}

pub fn product_name(name: &str) -> CatalogResult<String> {
  let name = name.trim();
  if name.is_empty() || name.len() > MAX_NAME_LEN {
    return Err(CatalogError::validation(format!(
      "product name must be 1 to {MAX_NAME_LEN} characters"
    )));
  }
  Ok(name.to_string())
}

pub fn product_description(description: &str) -> CatalogResult<String> {
  if description.len() > MAX_DESCRIPTION_LEN {
    return Err(CatalogError::validation(format!(
      "description must be at most {MAX_DESCRIPTION_LEN} characters"
    )));
  }
  Ok(description.to_string())
}

pub fn product(input: &ProductInput) -> CatalogResult<(String, Option<String>)> {
  let name = product_name(&input.name)?;
  let description = input
    .description
    .as_deref()
    .map(product_description)
    .transpose()?;
  Ok((name, description))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn input() -> EntryInput {
    EntryInput {
      name: "orders".into(),
      route: "/orders".into(),
      upstream_url: "http://svc:8080".into(),
      methods: vec!["get".into(), "GET".into(), " post ".into()],
      hosts: vec!["api.example.com".into()],
      tags: vec!["team-a".into(), "team-a".into()],
      enabled: true,
      product_id: None,
    }
  }

  #[test]
  fn test_normalizes_sets() {
    let fields = entry_fields(&input()).unwrap();
    assert_eq!(
      fields.methods.into_iter().collect::<Vec<_>>(),
      vec!["GET", "POST"]
    );
    assert_eq!(fields.tags.len(), 1);
  }

  #[test]
  fn test_rejects_bad_names() {
    for name in ["", "has space", "a/b", "über", ".", "..", "-_~.", &"x".repeat(101)] {
      let mut i = input();
      i.name = name.to_string();
      assert!(
        matches!(entry_fields(&i), Err(CatalogError::Validation(_))),
        "{name:?} should be rejected"
      );
    }
  }

  #[test]
  fn test_rejects_bad_route() {
    let mut i = input();
    i.route = "orders".into();
    assert!(entry_fields(&i).is_err());

    i.route = "/ord ers".into();
    assert!(entry_fields(&i).is_err());
  }

  #[test]
  fn test_rejects_bad_upstream() {
    for url in ["svc:8080", "ftp://svc", "not a url", "http://"] {
      let mut i = input();
      i.upstream_url = url.to_string();
      assert!(entry_fields(&i).is_err(), "{url:?} should be rejected");
    }
  }

  #[test]
  fn test_rejects_unknown_method_and_empty_host() {
    let mut i = input();
    i.methods = vec!["FETCH".into()];
    assert!(entry_fields(&i).is_err());

    let mut i = input();
    i.hosts = vec!["  ".into()];
    assert!(entry_fields(&i).is_err());
  }

  #[test]
  fn test_product_validation() {
    let ok = ProductInput {
      name: " Payments ".into(),
      description: Some("All payment APIs".into()),
    };
    assert_eq!(
      product(&ok).unwrap(),
      ("Payments".to_string(), Some("All payment APIs".to_string()))
    );

    let bad = ProductInput {
      name: "".into(),
      description: None,
    };
    assert!(product(&bad).is_err());
    assert!(product_description(&"d".repeat(501)).is_err());
  }
}
