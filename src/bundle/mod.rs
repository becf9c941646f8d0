//! Offline bundles: a bounded snapshot of a filtered list view, with item
//! details and media, captured into the regular cache tiers.

pub mod builder;
pub mod manifest;
pub mod query;

use serde::Deserialize;

pub use builder::BundleBuilder;
pub use query::BundleQuery;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
  /// Collection path below the API root
  pub resource: String,
  pub page_size: usize,
  pub max_pages: usize,
  /// Detail requests in flight at once
  pub detail_concurrency: usize,
}

impl Default for BundleConfig {
  fn default() -> Self {
    Self {
      resource: "heritage-items".to_string(),
      page_size: 100,
      max_pages: 5,
      detail_concurrency: 6,
    }
  }
}

impl BundleConfig {
  /// Hard ceiling on bundled items.
  pub fn max_items(&self) -> usize {
    self.page_size * self.max_pages
  }
}
