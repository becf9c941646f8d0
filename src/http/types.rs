use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// HTTP method of an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  /// Methods that change server state
  pub fn is_mutating(self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Some(Method::Get),
      "HEAD" => Some(Method::Head),
      "POST" => Some(Method::Post),
      "PUT" => Some(Method::Put),
      "PATCH" => Some(Method::Patch),
      "DELETE" => Some(Method::Delete),
      "OPTIONS" => Some(Method::Options),
      _ => None,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What the request is fetching, as the page that issued it sees it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// Top-level page load
  Document,
  /// Image element or CSS image
  Image,
  /// fetch()/XHR and everything else
  #[default]
  Other,
}

/// Header map with lower-cased names
pub type Headers = BTreeMap<String, String>;

/// Outbound request as seen by the interceptor
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: Vec::new(),
      destination: Destination::Other,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_json<T: Serialize>(mut self, body: &T) -> serde_json::Result<Self> {
    self.body = serde_json::to_vec(body)?;
    self
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    Ok(self)
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }
}

/// Response returned to the caller, either from the network or a cache tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn json<T: Serialize>(status: u16, value: &T) -> serde_json::Result<Self> {
    let mut response = Self::new(status, serde_json::to_vec(value)?);
    response
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    Ok(response)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  /// Only successful responses are written to a cache tier.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }
}
