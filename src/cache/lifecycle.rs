//! Expiration and entry-ceiling enforcement shared by every tier.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use tracing::debug;

use super::tier::TierPolicy;
use super::traits::CacheStorage;

/// What a lifecycle pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
  pub expired: usize,
  pub evicted: usize,
}

/// Drop expired entries, then evict the oldest insertions until the ceiling holds.
///
/// Runs after every write into a tier.
pub fn enforce<S: CacheStorage + ?Sized>(
  storage: &S,
  policy: &TierPolicy,
  now: DateTime<Utc>,
) -> Result<Sweep> {
  let expired = storage.purge_stored_before(policy.name, policy.expiry_cutoff(now))?;

  let evicted = if storage.count_entries(policy.name)? > policy.max_entries {
    storage.evict_oldest(policy.name, policy.max_entries)?
  } else {
    0
  };

  if expired > 0 || evicted > 0 {
    debug!(tier = %policy.name, expired, evicted, "tier swept");
  }

  Ok(Sweep { expired, evicted })
}
