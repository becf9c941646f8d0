use crate::bundle::{BundleBuilder, BundleQuery};
use crate::cache::{SqliteStorage, TierName};
use crate::commands::{CacheCommand, Command};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::http::{Destination, HttpTransport, Method, Request, SyncError};
use crate::interceptor::{Interceptor, Outcome};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Wired-up interceptor plus the configuration it was built from
pub struct App {
  config: Config,
  interceptor: Arc<Interceptor>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
    let transport = Arc::new(HttpTransport::new(
      config.api.root.clone(),
      Config::get_api_token(),
    )?);

    // Optimistic until a request says otherwise
    let connectivity = Connectivity::new(true);
    let interceptor = Interceptor::new(&config, storage, transport, connectivity)?;

    Ok(Self {
      config,
      interceptor: Arc::new(interceptor),
    })
  }

  /// Run one command, then let pending cache refreshes land before returning.
  pub async fn run(&self, command: Command) -> Result<()> {
    let result = match command {
      Command::Fetch {
        url,
        navigate,
        image,
      } => self.fetch(&url, navigate, image).await,
      Command::Submit { url, data, method } => self.submit(&url, &data, &method).await,
      Command::Sync => self.sync().await,
      Command::Queue => self.queue(),
      Command::Bundle { filters } => self.bundle(&filters).await,
      Command::OfflineStatus { filters } => self.offline_status(&filters),
      Command::Precache => self.precache().await,
      Command::Cache(CacheCommand::Stats) => self.cache_stats(),
      Command::Cache(CacheCommand::Clear { tier }) => self.cache_clear(tier),
      Command::Watch { interval } => self.watch(Duration::from_secs(interval.max(1))).await,
    };
    self.interceptor.wait_for_refreshes().await;
    result
  }

  /// Absolute URLs pass through; anything else is taken relative to the API root.
  fn resolve(&self, raw: &str) -> Result<Url> {
    Url::parse(raw)
      .or_else(|_| self.config.api.root.join(raw.trim_start_matches('/')))
      .map_err(|e| eyre!("Invalid URL '{}': {}", raw, e))
  }

  async fn fetch(&self, raw: &str, navigate: bool, image: bool) -> Result<()> {
    let url = self.resolve(raw)?;
    let request = if navigate {
      Request::navigate(url)
    } else if image {
      Request::get(url).with_destination(Destination::Image)
    } else {
      Request::get(url)
    };

    let class = self.interceptor.classify(&request);
    let Some(result) = self.interceptor.handle(request).await?.into_response() else {
      return Err(eyre!("GET request was unexpectedly deferred"));
    };

    match result.cached_at {
      Some(at) => eprintln!(
        "{} {:?} via {} (cached {})",
        result.data.status,
        class,
        result.source.as_str(),
        at.to_rfc3339()
      ),
      None => eprintln!(
        "{} {:?} via {}",
        result.data.status,
        class,
        result.source.as_str()
      ),
    }
    std::io::stdout().write_all(&result.data.body)?;
    Ok(())
  }

  async fn submit(&self, raw: &str, data: &str, method: &str) -> Result<()> {
    let method = Method::parse(method).ok_or_else(|| eyre!("Unknown method '{}'", method))?;
    if !method.is_mutating() {
      return Err(eyre!("{} is not a write method", method));
    }
    let body: serde_json::Value =
      serde_json::from_str(data).map_err(|e| eyre!("Request body is not valid JSON: {}", e))?;
    let request = Request::new(method, self.resolve(raw)?).with_json(&body)?;

    match self.interceptor.handle(request).await {
      Ok(Outcome::Response(result)) => {
        eprintln!("{} sent", result.data.status);
        std::io::stdout().write_all(&result.data.body)?;
        Ok(())
      }
      Ok(Outcome::Deferred(mutation)) => {
        println!("queued {} (API unreachable, will replay)", mutation.id);
        Ok(())
      }
      Err(e) => match e.downcast_ref::<SyncError>() {
        Some(SyncError::Rejected { status, body, .. }) => Err(eyre!(
          "Server rejected the write ({}): {}",
          status,
          String::from_utf8_lossy(body)
        )),
        _ => Err(e),
      },
    }
  }

  async fn sync(&self) -> Result<()> {
    let report = self.interceptor.replay().await?;
    if report.skipped {
      println!("another replay is already running");
      return Ok(());
    }
    println!(
      "sent {}, rejected {}, expired {}, remaining {}",
      report.sent, report.rejected, report.expired, report.remaining
    );
    Ok(())
  }

  fn queue(&self) -> Result<()> {
    let pending = self.interceptor.pending_mutations()?;
    if pending.is_empty() {
      println!("queue is empty");
      return Ok(());
    }
    for mutation in pending {
      println!(
        "{}  {}  {:<6} {}",
        mutation.id,
        mutation.enqueued_at.to_rfc3339(),
        mutation.method,
        mutation.url
      );
    }
    Ok(())
  }

  async fn bundle(&self, filters: &[String]) -> Result<()> {
    let query = BundleQuery::parse_args(filters)?;
    self.interceptor.check_reachability().await;

    let builder = BundleBuilder::new(Arc::clone(&self.interceptor), self.config.bundle.clone());
    let report = builder.build(&query).await?;

    println!(
      "bundled {} items from {} pages ({} media files, {} failed)",
      report.manifest.item_count, report.pages, report.media_fetched, report.media_failed
    );
    if report.details_failed > 0 {
      println!("{} item details could not be fetched", report.details_failed);
    }
    if report.truncated {
      println!(
        "more results exist; only the first {} were bundled",
        self.config.bundle.max_items()
      );
    }
    Ok(())
  }

  fn offline_status(&self, filters: &[String]) -> Result<()> {
    let query = BundleQuery::parse_args(filters)?;
    let builder = BundleBuilder::new(Arc::clone(&self.interceptor), self.config.bundle.clone());

    match builder.manifest()? {
      Some(manifest) => {
        let covered = manifest.covers(&query);
        println!(
          "{}: bundle of {} items for {} downloaded {}",
          if covered { "available offline" } else { "not covered" },
          manifest.item_count,
          manifest.query.signature(),
          manifest.downloaded_at.to_rfc3339()
        );
      }
      None => println!("no offline bundle stored"),
    }
    Ok(())
  }

  async fn precache(&self) -> Result<()> {
    let shell = self.interceptor.precache_shell().await?;
    println!(
      "stored app shell from {} ({} bytes)",
      shell.url,
      shell.response.body.len()
    );
    Ok(())
  }

  fn cache_stats(&self) -> Result<()> {
    println!(
      "{:<11} {:>8} {:>8} {:>10}",
      "TIER", "ENTRIES", "MAX", "MAX AGE"
    );
    for (policy, count) in self.interceptor.tier_stats()? {
      println!(
        "{:<11} {:>8} {:>8} {:>9}h",
        policy.name.as_str(),
        count,
        policy.max_entries,
        policy.max_age.num_hours()
      );
    }
    Ok(())
  }

  fn cache_clear(&self, tier: Option<TierName>) -> Result<()> {
    let tiers = match tier {
      Some(tier) => vec![tier],
      None => TierName::ALL.to_vec(),
    };
    for tier in tiers {
      let removed = self.interceptor.clear_tier(tier)?;
      println!("{}: removed {}", tier, removed);
    }
    Ok(())
  }

  async fn watch(&self, interval: Duration) -> Result<()> {
    let watcher = self.interceptor.spawn_replay_on_reconnect();
    let mut ticker = tokio::time::interval(interval);
    info!(
      api = %self.config.api.root,
      interval_secs = interval.as_secs(),
      "watching connectivity"
    );

    // A pass at start-up covers writes queued by earlier runs
    if self.interceptor.check_reachability().await {
      if let Err(e) = self.interceptor.replay().await {
        warn!(error = %e, "initial replay failed");
      }
    }

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let was_online = self.interceptor.connectivity().is_online();
          let online = self.interceptor.check_reachability().await;
          if online != was_online {
            info!(online, "connectivity changed");
          }
        }
        _ = tokio::signal::ctrl_c() => {
          info!("stopping watch");
          break;
        }
      }
    }

    watcher.abort();
    Ok(())
  }
}
