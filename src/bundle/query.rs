use std::collections::BTreeMap;

use color_eyre::{eyre::eyre, Result};
use url::Url;

/// Query parameters that describe a position in the result set rather than
/// the result set itself.
const PAGINATION_KEYS: &[&str] = &["page", "page_size", "cursor", "offset", "limit"];

/// The filter/sort parameters of a list view, in canonical form.
///
/// Keys are kept sorted, values trimmed, and empty values and pagination
/// state dropped, so two queries that select the same results compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleQuery {
  params: BTreeMap<String, String>,
}

impl BundleQuery {
  pub fn from_pairs<I, K, V>(pairs: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let params = pairs
      .into_iter()
      .filter_map(|(k, v)| {
        let key = k.as_ref().trim();
        let value = v.as_ref().trim();
        if key.is_empty() || value.is_empty() || PAGINATION_KEYS.contains(&key) {
          None
        } else {
          Some((key.to_string(), value.to_string()))
        }
      })
      .collect();
    Self { params }
  }

  /// Take the filters from a list URL's query string.
  pub fn from_url(url: &Url) -> Self {
    Self::from_pairs(url.query_pairs())
  }

  /// Parse `key=value` arguments.
  pub fn parse_args(args: &[String]) -> Result<Self> {
    let pairs = args
      .iter()
      .map(|arg| {
        arg
          .split_once('=')
          .ok_or_else(|| eyre!("Expected key=value, got '{}'", arg))
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(Self::from_pairs(pairs))
  }

  /// Canonical serialization used for manifest comparison.
  pub fn signature(&self) -> String {
    // BTreeMap serializes with sorted keys
    serde_json::to_string(&self.params).unwrap_or_default()
  }

  pub fn from_signature(signature: &str) -> Result<Self> {
    let params: BTreeMap<String, String> = serde_json::from_str(signature)
      .map_err(|e| eyre!("Invalid query signature '{}': {}", signature, e))?;
    Ok(Self::from_pairs(params))
  }

  /// Append the filters to a URL.
  pub fn apply_to(&self, url: &mut Url) {
    if self.params.is_empty() {
      return;
    }
    url.query_pairs_mut().extend_pairs(self.params.iter());
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}
