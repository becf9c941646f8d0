use chrono::{DateTime, Utc};
use color_eyre::Result;
use url::Url;

use super::query::BundleQuery;

/// Record of the most recent offline bundle for one origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineManifest {
  pub query: BundleQuery,
  pub downloaded_at: DateTime<Utc>,
  /// Items whose detail representation was captured
  pub item_count: usize,
}

impl OfflineManifest {
  /// True only when the current view selects exactly the bundled results.
  pub fn covers(&self, current: &BundleQuery) -> bool {
    self.query.signature() == current.signature()
  }
}

/// Trait for manifest storage backends.
pub trait ManifestStorage: Send + Sync + 'static {
  fn load_manifest(&self, storage_key: &str) -> Result<Option<OfflineManifest>>;

  /// Store a manifest, overwriting the previous one for the key.
  fn save_manifest(&self, storage_key: &str, manifest: &OfflineManifest) -> Result<()>;
}

/// Fixed storage key of the manifest for an API origin.
pub fn storage_key(api_root: &Url) -> String {
  format!("offline-bundle:{}", api_root.origin().ascii_serialization())
}
