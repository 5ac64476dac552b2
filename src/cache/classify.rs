//! Request classification against statically declared route lists.

use url::{Origin, Url};

use super::traits::Purpose;
use crate::config::Config;
use crate::http::Request;

/// Path prefixes whose traffic is never cached.
pub const SENSITIVE_PREFIXES: &[&str] = &[
  "/auth",
  "/login",
  "/logout",
  "/admin",
  "/api/auth",
  "/api/login",
  "/api/logout",
  "/api/user",
  "/api/session",
  "/api/token",
  "/api/admin",
  "/api/clinical",
  "/api/medical",
  "/api/records",
  "/api/patient",
];

pub const STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "mjs", "map", "wasm", "woff", "woff2", "ttf", "otf", "eot",
];

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"];

pub const ASSET_FRAGMENTS: &[&str] = &["/static/", "/assets/", "/css/", "/js/", "/fonts/", "/icons/"];

/// The strategy bucket a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Deny-listed; network only, never persisted
  Sensitive,
  /// Cache-first
  StaticAsset,
  /// Network-first, cached only when allow-listed
  Api,
  /// Stale-while-revalidate
  Navigation,
  /// Unlisted traffic: same-origin GETs are network-first into the runtime
  /// namespace, everything else is network only
  Passthrough,
}

#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  allowed_origins: Vec<Origin>,
  api_prefix: String,
  cacheable_apis: Vec<String>,
  content_routes: Vec<String>,
  precache: Vec<String>,
}

impl Classifier {
  pub fn new(config: &Config, origin: &Url) -> Self {
    let allowed_origins = config
      .allowed_origins
      .iter()
      .filter_map(|o| match Url::parse(o) {
        Ok(url) => Some(url.origin()),
        Err(e) => {
          tracing::warn!(origin = %o, error = %e, "ignoring malformed allowed origin");
          None
        }
      })
      .collect();

    Self {
      origin: origin.origin(),
      allowed_origins,
      api_prefix: config.api_prefix.clone(),
      cacheable_apis: config.cacheable_apis.clone(),
      content_routes: config.content_routes.clone(),
      precache: config.precache.clone(),
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin
  }

  /// Same-origin requests and allow-listed cross-origin hosts are
  /// intercepted; everything else passes through untouched.
  pub fn intercepts(&self, request: &Request) -> bool {
    let origin = request.url.origin();
    origin == self.origin || self.allowed_origins.contains(&origin)
  }

  /// Deny-list check on the normalized path, so `/Admin`, `//admin` and
  /// `/%61dmin` all hit the `/admin` entry.
  pub fn is_sensitive(&self, path: &str) -> bool {
    let path = normalize_path(path);
    SENSITIVE_PREFIXES.iter().any(|p| path.starts_with(p))
  }

  pub fn is_api(&self, path: &str) -> bool {
    path.starts_with(&self.api_prefix)
  }

  pub fn is_cacheable_api(&self, path: &str) -> bool {
    self.cacheable_apis.iter().any(|p| path.starts_with(p.as_str()))
  }

  /// Exactly one class per request; the deny-list is checked first.
  pub fn classify(&self, request: &Request) -> RequestClass {
    let path = request.path();

    if self.is_sensitive(path) {
      return RequestClass::Sensitive;
    }
    if !request.is_get() {
      return RequestClass::Passthrough;
    }

    if !self.is_same_origin(&request.url) {
      return if is_asset_path(path) {
        RequestClass::StaticAsset
      } else {
        RequestClass::Passthrough
      };
    }

    if self.is_api(path) {
      RequestClass::Api
    } else if self.is_navigation(request) {
      RequestClass::Navigation
    } else if is_asset_path(path) || self.precache.iter().any(|p| p == path) {
      RequestClass::StaticAsset
    } else {
      RequestClass::Passthrough
    }
  }

  fn is_navigation(&self, request: &Request) -> bool {
    let path = request.path();
    path == "/"
      || path.ends_with(".html")
      || self.content_routes.iter().any(|r| r == path)
      || (request.accepts_html() && extension(path).is_none())
  }

  /// Namespace purpose for a cache-first asset.
  pub fn asset_purpose(&self, request: &Request) -> Purpose {
    match extension(request.path()) {
      Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => Purpose::Image,
      _ => Purpose::Static,
    }
  }
}

/// Percent-decoded, lower-cased path with runs of `/` collapsed to one.
pub fn normalize_path(path: &str) -> String {
  let decoded = urlencoding::decode_binary(path.as_bytes());
  let decoded = String::from_utf8_lossy(&decoded).to_lowercase();

  let mut out = String::with_capacity(decoded.len());
  for c in decoded.chars() {
    if c == '/' && out.ends_with('/') {
      continue;
    }
    out.push(c);
  }
  out
}

fn extension(path: &str) -> Option<String> {
  let last = path.rsplit('/').next()?;
  let (_, ext) = last.rsplit_once('.')?;
  Some(ext.to_ascii_lowercase())
}

fn is_asset_path(path: &str) -> bool {
  let by_extension = extension(path)
    .map(|ext| STATIC_EXTENSIONS.contains(&ext.as_str()) || IMAGE_EXTENSIONS.contains(&ext.as_str()))
    .unwrap_or(false);
  by_extension || ASSET_FRAGMENTS.iter().any(|f| path.contains(f))
}
