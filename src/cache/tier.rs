//! Named cache partitions and their retention policies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::Deserialize;

/// A named cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierName {
  ApiList,
  ApiDetail,
  Media,
  MapTile,
}

impl TierName {
  pub const ALL: [TierName; 4] = [
    TierName::ApiList,
    TierName::ApiDetail,
    TierName::Media,
    TierName::MapTile,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      TierName::ApiList => "api-list",
      TierName::ApiDetail => "api-detail",
      TierName::Media => "media",
      TierName::MapTile => "map-tile",
    }
  }
}

impl fmt::Display for TierName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TierName {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    TierName::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| eyre!("Unknown cache tier '{}'", s))
  }
}

/// Freshness strategy applied by a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network with a timeout, cached copy as fallback
  NetworkFirst,
  /// Cached copy now, refresh in the background
  StaleWhileRevalidate,
  /// Cached copy if present, network only on a miss
  CacheFirst,
}

/// Retention and freshness policy of one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
  pub name: TierName,
  pub strategy: Strategy,
  pub max_age: Duration,
  pub max_entries: usize,
  /// Only meaningful for network-first tiers
  pub network_timeout: Option<std::time::Duration>,
}

impl TierPolicy {
  pub fn is_expired(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - stored_at > self.max_age
  }

  /// Anything stored before this instant has outlived the tier's max age.
  pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    now - self.max_age
  }
}

/// Per-tier overrides read from the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierOverride {
  pub max_age_secs: Option<i64>,
  pub max_entries: Option<usize>,
  pub network_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TiersConfig {
  #[serde(default)]
  pub api_list: TierOverride,
  #[serde(default)]
  pub api_detail: TierOverride,
  #[serde(default)]
  pub media: TierOverride,
  #[serde(default)]
  pub map_tile: TierOverride,
}

/// The fixed table of tier policies handed to the cache layer at construction.
#[derive(Debug, Clone)]
pub struct TierTable {
  api_list: TierPolicy,
  api_detail: TierPolicy,
  media: TierPolicy,
  map_tile: TierPolicy,
}

impl Default for TierTable {
  fn default() -> Self {
    Self {
      api_list: TierPolicy {
        name: TierName::ApiList,
        strategy: Strategy::NetworkFirst,
        max_age: Duration::hours(1),
        max_entries: 200,
        network_timeout: Some(std::time::Duration::from_secs(5)),
      },
      api_detail: TierPolicy {
        name: TierName::ApiDetail,
        strategy: Strategy::StaleWhileRevalidate,
        max_age: Duration::hours(24),
        max_entries: 500,
        network_timeout: None,
      },
      media: TierPolicy {
        name: TierName::Media,
        strategy: Strategy::CacheFirst,
        max_age: Duration::days(7),
        max_entries: 500,
        network_timeout: None,
      },
      map_tile: TierPolicy {
        name: TierName::MapTile,
        strategy: Strategy::CacheFirst,
        max_age: Duration::days(30),
        max_entries: 2000,
        network_timeout: None,
      },
    }
  }
}

impl TierTable {
  /// Default table with config overrides applied.
  pub fn from_config(config: &TiersConfig) -> Self {
    let mut table = Self::default();
    apply(&mut table.api_list, &config.api_list);
    apply(&mut table.api_detail, &config.api_detail);
    apply(&mut table.media, &config.media);
    apply(&mut table.map_tile, &config.map_tile);
    table
  }

  pub fn policy(&self, name: TierName) -> &TierPolicy {
    match name {
      TierName::ApiList => &self.api_list,
      TierName::ApiDetail => &self.api_detail,
      TierName::Media => &self.media,
      TierName::MapTile => &self.map_tile,
    }
  }

  #[cfg(test)]
  pub fn policy_mut(&mut self, name: TierName) -> &mut TierPolicy {
    match name {
      TierName::ApiList => &mut self.api_list,
      TierName::ApiDetail => &mut self.api_detail,
      TierName::Media => &mut self.media,
      TierName::MapTile => &mut self.map_tile,
    }
  }
}

fn apply(policy: &mut TierPolicy, over: &TierOverride) {
  if let Some(secs) = over.max_age_secs {
    policy.max_age = Duration::seconds(secs);
  }
  if let Some(max) = over.max_entries {
    policy.max_entries = max;
  }
  if policy.strategy == Strategy::NetworkFirst {
    if let Some(secs) = over.network_timeout_secs {
      policy.network_timeout = Some(std::time::Duration::from_secs(secs));
    }
  }
}
