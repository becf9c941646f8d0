//! Precached application shell served for every navigation request.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::Response;

/// Snapshot of the single-page app's entry document.
#[derive(Debug, Clone)]
pub struct AppShell {
  pub url: String,
  pub response: Response,
  pub captured_at: DateTime<Utc>,
}

/// Trait for shell storage backends.
pub trait ShellStorage: Send + Sync + 'static {
  fn load_shell(&self) -> Result<Option<AppShell>>;

  /// Replace the stored snapshot.
  fn save_shell(&self, shell: &AppShell) -> Result<()>;
}
