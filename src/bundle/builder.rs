use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::manifest::{storage_key, ManifestStorage, OfflineManifest};
use super::query::BundleQuery;
use super::BundleConfig;
use crate::http::{Destination, Request, Response, SyncError};
use crate::interceptor::Interceptor;

/// Single-valued media fields of an item detail.
const MEDIA_FIELDS: &[&str] = &["primary_image"];
/// Array fields whose elements carry a `file` URL.
const MEDIA_COLLECTIONS: &[&str] = &["images", "audio", "video", "documents"];

/// Paginated collection envelope.
#[derive(Debug, Deserialize)]
struct Page {
  #[serde(default)]
  next: Option<String>,
  #[serde(default)]
  results: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct BundleReport {
  pub manifest: OfflineManifest,
  pub pages: usize,
  pub details_failed: usize,
  pub media_fetched: usize,
  pub media_failed: usize,
  /// Results remained past the item ceiling
  pub truncated: bool,
}

#[derive(Debug, Default)]
struct ItemCapture {
  captured: bool,
  media_fetched: usize,
  media_failed: usize,
}

/// Walks a filtered list view and pulls every item and its media into the
/// cache tiers through the interceptor.
pub struct BundleBuilder {
  interceptor: Arc<Interceptor>,
  config: BundleConfig,
}

impl BundleBuilder {
  pub fn new(interceptor: Arc<Interceptor>, config: BundleConfig) -> Self {
    Self {
      interceptor,
      config,
    }
  }

  /// Capture the results of `query` for offline use.
  ///
  /// Refused outright while offline. A failed first page is an error; later
  /// failures (pages, details, media) only shrink the bundle.
  pub async fn build(&self, query: &BundleQuery) -> Result<BundleReport> {
    if !self.interceptor.connectivity().is_online() {
      return Err(SyncError::OfflineBundleRefused.into());
    }

    let collection = self.collection_url()?;
    let mut first = collection.clone();
    query.apply_to(&mut first);
    first
      .query_pairs_mut()
      .append_pair("page", "1")
      .append_pair("page_size", &self.config.page_size.to_string());

    info!(query = %query.signature(), url = %first, "building offline bundle");

    let mut budget = self.config.max_items();
    let mut next = Some(first);
    let mut pages = 0;
    let mut captured = 0;
    let mut details_failed = 0;
    let mut media_fetched = 0;
    let mut media_failed = 0;

    while let Some(url) = next.take() {
      if pages == self.config.max_pages || budget == 0 {
        next = Some(url);
        break;
      }

      let page = match self.fetch_page(&url).await {
        Ok(page) => page,
        Err(e) if pages == 0 => return Err(e),
        Err(e) => {
          warn!(page = pages + 1, error = %e, "stopping bundle at failed page");
          break;
        }
      };
      pages += 1;
      if page.results.is_empty() {
        break;
      }

      let ids: Vec<String> = page.results.iter().filter_map(item_id).take(budget).collect();
      budget -= ids.len();
      debug!(page = pages, items = ids.len(), "bundling page");

      let captures: Vec<ItemCapture> = stream::iter(ids)
        .map(|id| self.capture_item(&collection, id))
        .buffer_unordered(self.config.detail_concurrency.max(1))
        .collect()
        .await;

      for capture in captures {
        if capture.captured {
          captured += 1;
        } else {
          details_failed += 1;
        }
        media_fetched += capture.media_fetched;
        media_failed += capture.media_failed;
      }

      next = match page.next {
        Some(link) => Some(
          url
            .join(&link)
            .map_err(|e| eyre!("Invalid next link '{}': {}", link, e))?,
        ),
        None => None,
      };
    }

    let manifest = OfflineManifest {
      query: query.clone(),
      downloaded_at: Utc::now(),
      item_count: captured,
    };
    self
      .interceptor
      .storage()
      .save_manifest(&self.storage_key(), &manifest)?;

    let report = BundleReport {
      manifest,
      pages,
      details_failed,
      media_fetched,
      media_failed,
      truncated: next.is_some(),
    };
    info!(
      items = report.manifest.item_count,
      pages = report.pages,
      media = report.media_fetched,
      media_failed = report.media_failed,
      truncated = report.truncated,
      "offline bundle stored"
    );
    Ok(report)
  }

  /// The stored manifest for this API origin, if any.
  pub fn manifest(&self) -> Result<Option<OfflineManifest>> {
    self.interceptor.storage().load_manifest(&self.storage_key())
  }

  /// Whether the stored bundle was taken with exactly this query.
  pub fn has_offline_copy(&self, query: &BundleQuery) -> Result<bool> {
    Ok(self.manifest()?.is_some_and(|m| m.covers(query)))
  }

  fn storage_key(&self) -> String {
    storage_key(self.interceptor.api_root())
  }

  fn collection_url(&self) -> Result<Url> {
    let resource = self.config.resource.trim_matches('/');
    self
      .interceptor
      .api_root()
      .join(&format!("{}/", resource))
      .map_err(|e| eyre!("Invalid bundle resource '{}': {}", resource, e))
  }

  async fn fetch_page(&self, url: &Url) -> Result<Page> {
    let outcome = self.interceptor.handle(Request::get(url.clone())).await?;
    let response = outcome
      .response()
      .ok_or_else(|| eyre!("List request {} was deferred", url))?;
    if !response.is_success() {
      return Err(SyncError::Protocol(format!("{} returned status {}", url, response.status)).into());
    }
    response
      .parse_json()
      .map_err(|e| eyre!("Unexpected list payload from {}: {}", url, e))
  }

  async fn capture_item(&self, collection: &Url, id: String) -> ItemCapture {
    let mut capture = ItemCapture::default();

    let url = match collection.join(&format!("{}/", id)) {
      Ok(url) => url,
      Err(e) => {
        warn!(id = %id, error = %e, "skipping item with unusable id");
        return capture;
      }
    };

    let detail = match self.interceptor.handle(Request::get(url.clone())).await {
      Ok(outcome) => match outcome.into_response() {
        Some(result) if result.data.is_success() => result.data,
        _ => return capture,
      },
      Err(e) => {
        debug!(url = %url, error = %e, "detail fetch failed");
        return capture;
      }
    };
    capture.captured = true;

    let Ok(body) = detail.parse_json::<Value>() else {
      return capture;
    };

    for (media, destination) in media_urls(&body, &url) {
      let request = Request::get(media.clone()).with_destination(destination);
      match self.interceptor.handle(request).await {
        Ok(outcome) if outcome.response().is_some_and(Response::is_success) => {
          capture.media_fetched += 1;
        }
        Ok(_) => capture.media_failed += 1,
        Err(e) => {
          debug!(url = %media, error = %e, "media prefetch failed");
          capture.media_failed += 1;
        }
      }
    }

    capture
  }
}

fn item_id(item: &Value) -> Option<String> {
  match item.get("id")? {
    Value::Number(n) => Some(n.to_string()),
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    _ => None,
  }
}

/// Every media URL referenced by an item detail, resolved against `base` and
/// deduplicated in order of appearance.
fn media_urls(detail: &Value, base: &Url) -> Vec<(Url, Destination)> {
  let mut found: Vec<(&str, Destination)> = Vec::new();

  for field in MEDIA_FIELDS {
    if let Some(link) = detail.get(*field).and_then(Value::as_str) {
      found.push((link, Destination::Image));
    }
  }
  if let Some(link) = detail.pointer("/main_image/file").and_then(Value::as_str) {
    found.push((link, Destination::Image));
  }
  for field in MEDIA_COLLECTIONS {
    let destination = if *field == "images" {
      Destination::Image
    } else {
      Destination::Other
    };
    let Some(items) = detail.get(*field).and_then(Value::as_array) else {
      continue;
    };
    for item in items {
      let link = item
        .get("file")
        .and_then(Value::as_str)
        .or_else(|| item.as_str());
      if let Some(link) = link {
        found.push((link, destination));
      }
    }
  }

  let mut seen = HashSet::new();
  found
    .into_iter()
    .filter(|(link, _)| !link.trim().is_empty())
    .filter_map(|(link, destination)| {
      let url = base.join(link.trim()).ok()?;
      matches!(url.scheme(), "http" | "https").then_some((url, destination))
    })
    .filter(|(url, _)| seen.insert(url.clone()))
    .collect()
}
