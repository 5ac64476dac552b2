//! Core types for cache namespaces and stored responses.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, VARY};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseKind};

/// What a namespace holds. Exactly one live namespace exists per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Purpose {
  /// Precached app shell and static assets
  Static,
  /// API responses and navigations written at runtime
  Runtime,
  Image,
}

impl Purpose {
  pub const ALL: [Purpose; 3] = [Purpose::Static, Purpose::Runtime, Purpose::Image];

  pub fn as_str(&self) -> &'static str {
    match self {
      Purpose::Static => "static",
      Purpose::Runtime => "runtime",
      Purpose::Image => "image",
    }
  }
}

impl fmt::Display for Purpose {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A named, versioned partition of response storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
  pub name: String,
  pub version: String,
  pub purpose: Purpose,
}

impl Namespace {
  /// Namespaces are named `<prefix>-<purpose>-<version>`.
  pub fn new(prefix: &str, purpose: Purpose, version: &str) -> Self {
    Self {
      name: format!("{}-{}-{}", prefix, purpose, version),
      version: version.to_string(),
      purpose,
    }
  }
}

/// Row key for a cached request: SHA-256 over method and URL.
///
/// Vary headers are not part of the digest; they are recorded with the entry
/// and compared when matching.
pub fn request_key(request: &Request) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

/// A response as persisted in a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub kind: ResponseKind,
  /// Request header values the response varies on, captured at store time
  pub vary: Vec<(String, Option<String>)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

/// Header and vary metadata serialized next to the body.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
  pub headers: Vec<(String, String)>,
  pub kind: ResponseKind,
  pub vary: Vec<(String, Option<String>)>,
}

impl CachedResponse {
  pub fn capture(request: &Request, response: &Response) -> Self {
    let headers = response
      .headers
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();

    let vary = vary_names(response)
      .into_iter()
      .map(|name| {
        let value = request.header(&name).map(String::from);
        (name, value)
      })
      .collect();

    Self {
      url: request.url.to_string(),
      status: response.status.as_u16(),
      headers,
      kind: response.kind,
      vary,
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Whether this entry satisfies `request` under its recorded vary headers.
  pub fn matches(&self, request: &Request) -> bool {
    self.vary.iter().all(|(name, value)| {
      name != "*" && request.header(name) == value.as_deref()
    })
  }

  pub fn to_response(&self) -> Response {
    let mut headers = HeaderMap::new();
    for (k, v) in &self.headers {
      if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
        headers.append(name, value);
      }
    }

    Response {
      status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
      headers,
      body: self.body.clone(),
      kind: self.kind,
    }
  }

  pub(crate) fn meta(&self) -> EntryMeta {
    EntryMeta {
      headers: self.headers.clone(),
      kind: self.kind,
      vary: self.vary.clone(),
    }
  }
}

/// Only complete 200 responses readable by the application are stored.
pub fn validate_for_cache(response: &Response) -> Result<()> {
  if response.status != StatusCode::OK {
    return Err(Error::ValidationFailure(format!("status {}", response.status)));
  }
  match response.kind {
    ResponseKind::Basic | ResponseKind::Cors => Ok(()),
    kind => Err(Error::ValidationFailure(format!("response kind {:?}", kind))),
  }
}

fn vary_names(response: &Response) -> Vec<String> {
  response
    .headers
    .get_all(VARY)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|name| name.trim().to_ascii_lowercase())
    .filter(|name| !name.is_empty())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::get;
  use reqwest::header::ACCEPT_LANGUAGE;

  #[test]
  fn namespace_name_embeds_purpose_and_version() {
    let ns = Namespace::new("lantern", Purpose::Runtime, "v7");
    assert_eq!(ns.name, "lantern-runtime-v7");
  }

  #[test]
  fn request_key_ignores_fragment_but_not_query() {
    let a = get("/index.html#top");
    let b = get("/index.html");
    let c = get("/index.html?x=1");
    assert_eq!(request_key(&a), request_key(&b));
    assert_ne!(request_key(&b), request_key(&c));
  }

  #[test]
  fn vary_headers_gate_matching() {
    let request = get("/api/models").with_header(ACCEPT_LANGUAGE, "en");
    let response = Response::new(StatusCode::OK, "[]").with_header(VARY, "Accept-Language");
    let cached = CachedResponse::capture(&request, &response);

    assert!(cached.matches(&request));
    assert!(!cached.matches(&get("/api/models").with_header(ACCEPT_LANGUAGE, "tr")));
  }

  #[test]
  fn only_ok_readable_responses_validate() {
    assert!(validate_for_cache(&Response::new(StatusCode::OK, "x")).is_ok());
    assert!(validate_for_cache(&Response::new(StatusCode::NOT_FOUND, "x")).is_err());
    let opaque = Response::new(StatusCode::OK, "").with_kind(ResponseKind::Opaque);
    assert!(matches!(validate_for_cache(&opaque), Err(Error::ValidationFailure(_))));
  }

  #[test]
  fn vary_star_never_matches() {
    let request = get("/api/models");
    let response = Response::new(StatusCode::OK, "[]").with_header(VARY, "*");
    assert!(!CachedResponse::capture(&request, &response).matches(&request));
  }
}
