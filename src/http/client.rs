use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use tracing::debug;
use url::Url;

use super::error::SyncError;
use super::types::{Headers, Method, Request, Response};

/// The network seam. Everything the interceptor sends goes through here.
pub trait Transport: Send + Sync + 'static {
  fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, SyncError>>;
}

/// reqwest-backed transport for the real API.
///
/// The API token is only attached to requests sent to the API root's origin;
/// tiles and third-party media go out without credentials.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  api_root: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(api_root: Url, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .user_agent(concat!("heritage-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      api_root,
      token,
    })
  }

  fn prepare(&self, request: &Request) -> reqwest::RequestBuilder {
    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    // Credentials are applied at send time so replayed requests carry current ones
    if let Some(token) = &self.token {
      if request.url.origin() == self.api_root.origin() {
        builder = builder.bearer_auth(token);
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }
    builder
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

fn classify_error(e: reqwest::Error) -> SyncError {
  if e.is_connect() || e.is_timeout() || e.is_request() {
    SyncError::Unreachable(e.to_string())
  } else {
    SyncError::Protocol(e.to_string())
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, SyncError>> {
    let builder = self.prepare(&request);

    Box::pin(async move {
      debug!(method = %request.method, url = %request.url, "sending");

      let response = builder.send().await.map_err(classify_error)?;

      let status = response.status().as_u16();
      let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await.map_err(classify_error)?.to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}
