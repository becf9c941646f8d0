//! Request classification: decides which route every outbound request takes.

use url::Url;

use crate::cache::TierName;
use crate::config::ApiConfig;
use crate::http::{Destination, Method, Request};

/// Where an intercepted request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
  /// Top-level page load, answered from the application shell
  Navigation,
  /// Contribution write: network first, durable queue on connectivity loss
  MutationQueue,
  /// Identity-bearing path: network only, never cached
  UserData,
  ApiList,
  ApiDetail,
  Media,
  MapTile,
  /// No caching at all
  Passthrough,
}

impl RouteClass {
  /// The cache tier backing this class, if any.
  pub fn tier(self) -> Option<TierName> {
    match self {
      RouteClass::ApiList => Some(TierName::ApiList),
      RouteClass::ApiDetail => Some(TierName::ApiDetail),
      RouteClass::Media => Some(TierName::Media),
      RouteClass::MapTile => Some(TierName::MapTile),
      _ => None,
    }
  }
}

/// Query parameters that mark a request as paginated listing.
const PAGINATION_PARAMS: &[&str] = &["page", "page_size", "limit", "offset", "cursor"];

/// Static route table built once from configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
  api_root: Url,
  contributions_path: String,
  identity_prefixes: Vec<String>,
  media_prefix: String,
  tile_hosts: Vec<String>,
}

impl Classifier {
  pub fn new(api: &ApiConfig) -> Self {
    Self {
      api_root: api.root.clone(),
      contributions_path: normalize_prefix(&api.contributions_path),
      identity_prefixes: api
        .identity_paths
        .iter()
        .map(|p| normalize_prefix(p))
        .filter(|p| !p.is_empty())
        .collect(),
      media_prefix: api.media_prefix.clone(),
      tile_hosts: api
        .map_tile_hosts
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect(),
    }
  }

  /// Classify a request. Rules are checked in priority order; the identity
  /// bypass must stay ahead of the list/detail rules.
  pub fn classify(&self, request: &Request) -> RouteClass {
    if request.is_navigation() {
      return RouteClass::Navigation;
    }

    let api_path = self.api_relative_path(&request.url);

    if let Some(path) = api_path.as_deref() {
      if request.method.is_mutating()
        && !self.contributions_path.is_empty()
        && under_prefix(path, &self.contributions_path)
      {
        return RouteClass::MutationQueue;
      }

      if self.identity_prefixes.iter().any(|p| under_prefix(path, p)) {
        return RouteClass::UserData;
      }
    }

    // Only GET responses are ever cached
    if request.method != Method::Get {
      return RouteClass::Passthrough;
    }

    if let Some(path) = api_path.as_deref() {
      if is_paginated(&request.url) || !ends_with_identifier(path) {
        return RouteClass::ApiList;
      }
      return RouteClass::ApiDetail;
    }

    if request.destination == Destination::Image
      || (self.same_origin(&request.url) && request.url.path().starts_with(&self.media_prefix))
    {
      return RouteClass::Media;
    }

    if self.is_tile_host(&request.url) {
      return RouteClass::MapTile;
    }

    RouteClass::Passthrough
  }

  /// Path below the API root, without a leading slash, if the URL is under it.
  fn api_relative_path(&self, url: &Url) -> Option<String> {
    if !self.same_origin(url) {
      return None;
    }
    let root = self.api_root.path().trim_end_matches('/');
    let path = url.path();
    let rest = path.strip_prefix(root)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
      // "/api/v10" is not under "/api/v1"
      return None;
    }
    Some(rest.trim_start_matches('/').to_string())
  }

  fn same_origin(&self, url: &Url) -> bool {
    url.origin() == self.api_root.origin()
  }

  fn is_tile_host(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    let host = host.to_ascii_lowercase();
    self
      .tile_hosts
      .iter()
      .any(|t| host == *t || host.ends_with(&format!(".{}", t)))
  }
}

/// Prefixes are compared as whole path segments, without surrounding slashes.
fn normalize_prefix(prefix: &str) -> String {
  prefix.trim_matches('/').to_string()
}

/// `users/me` covers `users/me` and `users/me/...` but not `users/meetings`.
fn under_prefix(path: &str, prefix: &str) -> bool {
  path
    .strip_prefix(prefix)
    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn is_paginated(url: &Url) -> bool {
  url
    .query_pairs()
    .any(|(k, _)| PAGINATION_PARAMS.contains(&k.as_ref()))
}

/// `heritage-items/42/` addresses one resource; `heritage-items/` and
/// `heritage-items/geojson/` do not.
fn ends_with_identifier(path: &str) -> bool {
  let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
  match segments.as_slice() {
    [.., _, last] => is_identifier(last),
    _ => false,
  }
}

fn is_identifier(segment: &str) -> bool {
  (!segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
    || uuid::Uuid::parse_str(segment).is_ok()
}
