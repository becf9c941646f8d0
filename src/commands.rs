//! Subcommands of the `hsync` front end

use clap::Subcommand;

use crate::cache::TierName;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch a URL through the interceptor and print the body
  Fetch {
    /// Absolute URL, or a path relative to the API root
    url: String,
    /// Treat as a top-level navigation (served from the app shell)
    #[arg(long)]
    navigate: bool,
    /// Mark the request as an image load
    #[arg(long)]
    image: bool,
  },

  /// Send a write; queued for replay if the API is unreachable
  Submit {
    /// Absolute URL, or a path relative to the API root
    url: String,
    /// JSON request body
    #[arg(short, long)]
    data: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
  },

  /// Replay queued writes now
  Sync,

  /// List queued writes
  Queue,

  /// Download a filtered result set for offline use
  Bundle {
    /// Filters as key=value (e.g. search=church)
    filters: Vec<String>,
  },

  /// Check whether the stored bundle covers a filter set
  OfflineStatus {
    /// Filters as key=value
    filters: Vec<String>,
  },

  /// Store the application shell served to navigations
  Precache,

  /// Inspect or empty cache tiers
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Check the API periodically and replay writes when it comes back
  Watch {
    /// Seconds between checks
    #[arg(short, long, default_value_t = 30)]
    interval: u64,
  },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Entry counts and limits per tier
  Stats,
  /// Empty one tier, or all of them
  Clear {
    /// api-list, api-detail, media or map-tile
    tier: Option<TierName>,
  },
}
