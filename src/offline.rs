//! Synthesized responses for when neither cache nor network can answer.

use chrono::Utc;
use reqwest::StatusCode;
use serde::Serialize;

use crate::http::Request;
use crate::http::Response;

/// Precached document served to navigations before the built-in page.
pub const OFFLINE_PAGE_PATH: &str = "/offline.html";

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page is not available without a network connection and has not been saved for offline use.</p>
    <button type="button" onclick="window.location.reload()">Retry</button>
  </main>
</body>
</html>
"#;

/// JSON body returned to API callers.
#[derive(Debug, Serialize)]
struct OfflineError {
  error: &'static str,
  message: &'static str,
  offline: bool,
  timestamp: String,
}

/// Builds a well-formed response for any request. Never fails.
#[derive(Debug, Clone)]
pub struct OfflineFallbackProvider {
  api_prefix: String,
}

impl OfflineFallbackProvider {
  pub fn new(api_prefix: impl Into<String>) -> Self {
    Self {
      api_prefix: api_prefix.into(),
    }
  }

  pub fn respond(&self, request: &Request) -> Response {
    tracing::debug!(url = %request.url, "serving offline fallback");

    if request.accepts_html() {
      return Response::synthetic(StatusCode::OK, "text/html; charset=utf-8", OFFLINE_PAGE);
    }

    if request.path().starts_with(&self.api_prefix) {
      let body = OfflineError {
        error: "Offline",
        message: "No network connection and no cached data available",
        offline: true,
        timestamp: Utc::now().to_rfc3339(),
      };
      let body = serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"offline\":true}".to_vec());
      return Response::synthetic(StatusCode::SERVICE_UNAVAILABLE, "application/json", body);
    }

    Response::synthetic(StatusCode::SERVICE_UNAVAILABLE, "text/plain; charset=utf-8", "Offline")
  }
}
