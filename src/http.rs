//! Request/response values and the network transport seam.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

/// An outbound request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: None,
    }
  }

  /// Build a GET request from an absolute URL string.
  pub fn get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| Error::InvalidRequest(format!("{}: {}", url, e)))?;
    Ok(Self::new(Method::GET, url))
  }

  /// Add a header; values that are not valid header text are dropped.
  pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
    match HeaderValue::from_str(value) {
      Ok(v) => {
        self.headers.insert(name, v);
      }
      Err(_) => tracing::warn!(header = %name, "dropping invalid header value"),
    }
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  /// True when the Accept header asks for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get(ACCEPT)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.contains("text/html"))
      .unwrap_or(false)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }
}

/// Mirrors the platform response type used for cache validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin network response
  Basic,
  /// Cross-origin response with CORS headers
  Cors,
  /// Cross-origin response without readable body
  Opaque,
  /// Built locally (offline fallback, queue acknowledgements)
  Synthetic,
}

#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  /// A same-origin response with the given status and body.
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  /// A locally built response carrying a content type.
  pub fn synthetic(status: StatusCode, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    Self {
      status,
      headers,
      body: body.into(),
      kind: ResponseKind::Synthetic,
    }
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
    if let Ok(v) = HeaderValue::from_str(value) {
      self.headers.insert(name, v);
    }
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body)
      .map_err(|e| Error::ValidationFailure(format!("body is not the expected JSON: {}", e)))
  }
}

/// The network leg. Implemented by the HTTP transport and by the
/// throttling/retry wrappers so they compose.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    (**self).fetch(request).await
  }
}

/// Run a fetch bounded by `timeout`. Expiry drops the in-flight future.
pub async fn fetch_with_timeout(
  fetcher: &dyn Fetcher,
  request: &Request,
  timeout: Duration,
) -> Result<Response> {
  match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
    Ok(result) => result,
    Err(_) => {
      tracing::debug!(url = %request.url, ?timeout, "fetch timed out");
      Err(Error::Timeout(timeout))
    }
  }
}

/// Bounds every attempt through `inner` by `timeout`.
pub struct TimeoutFetcher {
  inner: Arc<dyn Fetcher>,
  timeout: Duration,
}

impl TimeoutFetcher {
  pub fn new(inner: Arc<dyn Fetcher>, timeout: Duration) -> Self {
    Self { inner, timeout }
  }
}

#[async_trait]
impl Fetcher for TimeoutFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    fetch_with_timeout(self.inner.as_ref(), request, self.timeout).await
  }
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: url::Origin,
}

impl HttpFetcher {
  pub fn new(origin: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("lantern/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::NetworkUnavailable(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        Error::Timeout(Duration::ZERO)
      } else {
        Error::NetworkUnavailable(e.to_string())
      }
    })?;

    let kind = if response.url().origin() == self.origin {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    };
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
      .bytes()
      .await
      .map_err(|e| Error::NetworkUnavailable(format!("failed to read body: {}", e)))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
      kind,
    })
  }
}
