//! SQLite-backed persistence for cache tiers, the write queue, the bundle
//! manifest and the application shell.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use url::Url;
use uuid::Uuid;

use super::tier::TierName;
use super::traits::{CacheEntry, CacheKey, CacheStorage};
use crate::bundle::manifest::{ManifestStorage, OfflineManifest};
use crate::bundle::query::BundleQuery;
use crate::http::{Headers, Method, Response};
use crate::queue::{QueueStorage, QueuedMutation};
use crate::shell::{AppShell, ShellStorage};

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at the given path, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("heritage-sync").join("sync.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }
}

const SCHEMA: &str = r#"
-- Cached responses, one partition per tier. seq orders entries by insertion.
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    tier TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    UNIQUE (tier, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_tier_seq
    ON cache_entries(tier, seq);

-- Mutations waiting for connectivity, FIFO by seq
CREATE TABLE IF NOT EXISTS mutation_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_name
    ON mutation_queue(queue_name, seq);

-- Most recent offline bundle per origin
CREATE TABLE IF NOT EXISTS bundle_manifest (
    storage_key TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    downloaded_at INTEGER NOT NULL,
    item_count INTEGER NOT NULL
);

-- Precached application shell (single row)
CREATE TABLE IF NOT EXISTS app_shell (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at INTEGER NOT NULL
);
"#;

fn to_millis(dt: DateTime<Utc>) -> i64 {
  dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid timestamp {}", ms))
}

fn encode_headers(headers: &Headers) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(s: &str) -> Result<Headers> {
  serde_json::from_str(s).map_err(|e| eyre!("Failed to deserialize headers: {}", e))
}

impl CacheStorage for SqliteStorage {
  fn get_entry(&self, tier: TierName, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE tier = ? AND key_hash = ?",
        params![tier.as_str(), key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, stored_at)) => Ok(Some(CacheEntry {
        key: key.clone(),
        response: Response {
          status,
          headers: decode_headers(&headers)?,
          body,
        },
        stored_at: from_millis(stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put_entry(&self, tier: TierName, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn()?;
    let headers = encode_headers(&entry.response.headers)?;

    // REPLACE deletes the old row, so a re-stored key gets a fresh seq
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (tier, key_hash, request_key, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          tier.as_str(),
          entry.key.hash(),
          entry.key.as_str(),
          entry.response.status,
          headers,
          entry.response.body,
          to_millis(entry.stored_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn remove_entry(&self, tier: TierName, key: &CacheKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE tier = ? AND key_hash = ?",
        params![tier.as_str(), key.hash()],
      )
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn count_entries(&self, tier: TierName) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE tier = ?",
        params![tier.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }

  fn purge_stored_before(&self, tier: TierName, cutoff: DateTime<Utc>) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE tier = ? AND stored_at < ?",
        params![tier.as_str(), to_millis(cutoff)],
      )
      .map_err(|e| eyre!("Failed to purge expired entries: {}", e))
  }

  fn evict_oldest(&self, tier: TierName, keep: usize) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM cache_entries
         WHERE tier = ?1 AND seq NOT IN (
           SELECT seq FROM cache_entries WHERE tier = ?1 ORDER BY seq DESC LIMIT ?2
         )",
        params![tier.as_str(), keep as i64],
      )
      .map_err(|e| eyre!("Failed to evict cache entries: {}", e))
  }

  fn clear_tier(&self, tier: TierName) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE tier = ?",
        params![tier.as_str()],
      )
      .map_err(|e| eyre!("Failed to clear tier {}: {}", tier, e))
  }
}

impl QueueStorage for SqliteStorage {
  fn push_mutation(&self, queue: &str, mutation: &QueuedMutation) -> Result<()> {
    let conn = self.conn()?;
    let headers = encode_headers(&mutation.headers)?;

    conn
      .execute(
        "INSERT INTO mutation_queue (queue_name, id, method, url, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          queue,
          mutation.id.to_string(),
          mutation.method.as_str(),
          mutation.url.as_str(),
          headers,
          mutation.body,
          to_millis(mutation.enqueued_at),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(())
  }

  fn list_mutations(&self, queue: &str) -> Result<Vec<QueuedMutation>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, enqueued_at FROM mutation_queue
         WHERE queue_name = ?
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, String, String, String, Vec<u8>, i64)> = stmt
      .query_map(params![queue], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, enqueued_at)| {
        Ok(QueuedMutation {
          id: Uuid::parse_str(&id).map_err(|e| eyre!("Invalid mutation id '{}': {}", id, e))?,
          method: Method::parse(&method)
            .ok_or_else(|| eyre!("Invalid queued method '{}'", method))?,
          url: Url::parse(&url).map_err(|e| eyre!("Invalid queued url '{}': {}", url, e))?,
          headers: decode_headers(&headers)?,
          body,
          enqueued_at: from_millis(enqueued_at)?,
        })
      })
      .collect()
  }

  fn remove_mutation(&self, id: Uuid) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM mutation_queue WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to dequeue mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn purge_mutations_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM mutation_queue WHERE queue_name = ? AND enqueued_at < ?",
        params![queue, to_millis(cutoff)],
      )
      .map_err(|e| eyre!("Failed to purge expired mutations: {}", e))
  }
}

impl ManifestStorage for SqliteStorage {
  fn load_manifest(&self, storage_key: &str) -> Result<Option<OfflineManifest>> {
    let conn = self.conn()?;

    let row: Option<(String, i64, i64)> = conn
      .query_row(
        "SELECT query, downloaded_at, item_count FROM bundle_manifest WHERE storage_key = ?",
        params![storage_key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read bundle manifest: {}", e))?;

    match row {
      Some((query, downloaded_at, item_count)) => Ok(Some(OfflineManifest {
        query: BundleQuery::from_signature(&query)?,
        downloaded_at: from_millis(downloaded_at)?,
        item_count: item_count as usize,
      })),
      None => Ok(None),
    }
  }

  fn save_manifest(&self, storage_key: &str, manifest: &OfflineManifest) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO bundle_manifest (storage_key, query, downloaded_at, item_count)
         VALUES (?, ?, ?, ?)",
        params![
          storage_key,
          manifest.query.signature(),
          to_millis(manifest.downloaded_at),
          manifest.item_count as i64,
        ],
      )
      .map_err(|e| eyre!("Failed to write bundle manifest: {}", e))?;
    Ok(())
  }
}

impl ShellStorage for SqliteStorage {
  fn load_shell(&self) -> Result<Option<AppShell>> {
    let conn = self.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT url, status, headers, body, captured_at FROM app_shell WHERE id = 1",
        [],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read app shell: {}", e))?;

    match row {
      Some((url, status, headers, body, captured_at)) => Ok(Some(AppShell {
        url,
        response: Response {
          status,
          headers: decode_headers(&headers)?,
          body,
        },
        captured_at: from_millis(captured_at)?,
      })),
      None => Ok(None),
    }
  }

  fn save_shell(&self, shell: &AppShell) -> Result<()> {
    let headers = encode_headers(&shell.response.headers)?;
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO app_shell (id, url, status, headers, body, captured_at)
         VALUES (1, ?, ?, ?, ?, ?)",
        params![
          shell.url,
          shell.response.status,
          headers,
          shell.response.body,
          to_millis(shell.captured_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store app shell: {}", e))?;
    Ok(())
  }
}
