//! Time-bounded response cache backed by one JSON file per key
//!
//! What this module provides
//! - `Cache`: get/set/delete/clear over a directory of entry files
//! - `CacheEntry` on-disk record and `CacheInfo` read-side metadata
//! - `CacheStatus` peek result, `CacheTtl` volatility classes, `CacheKey` builder
//!
//! Storage layout
//! - Each semantic key is hashed with SHA-256; the hex digest names the file
//!   (`<dir>/<digest>.json`), so any key string maps to a safe, fixed-length name.
//! - The file holds `{"value": .., "created_at": .., "expires_at": ..}` with
//!   RFC 3339 timestamps.
//!
//! Expiry
//! - There is no background timer. An entry past `expires_at` is evicted by the
//!   next `get`/`get_with_info` that touches it, or by `clear_expired`.
//! - Unreadable entries (bad JSON, missing fields, value of the wrong shape) are
//!   treated as misses and deleted on read.
//!
//! Concurrency
//! - Writes land in a temp file inside the cache dir and are renamed over the
//!   target, so readers never observe a half-written entry. Concurrent `set`
//!   calls for one key resolve last-writer-wins.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::Result;

const ENTRY_EXTENSION: &str = "json";

/// One stored cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of a non-evicting status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Expired,
}

/// Metadata about a cached value, computed at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
    /// `now - cached_at`
    pub age: Duration,
    /// `expires_at - now`, floored at zero
    pub expires_in: Duration,
}

impl CacheInfo {
    fn from_entry(entry: &CacheEntry, now: DateTime<Utc>) -> Self {
        Self {
            cached_at: entry.created_at,
            expires_at: entry.expires_at,
            ttl: non_negative(entry.expires_at - entry.created_at),
            age: non_negative(now - entry.created_at),
            expires_in: non_negative(entry.expires_at - now),
        }
    }

    /// e.g. `"5 minutes ago"`
    pub fn format_age(&self) -> String {
        format!("{} ago", humanize(self.age))
    }

    /// e.g. `"expires in 55 minutes"`, or `"expired"` once nothing remains.
    pub fn format_expires(&self) -> String {
        if self.expires_in.is_zero() {
            "expired".to_string()
        } else {
            format!("expires in {}", humanize(self.expires_in))
        }
    }

    /// One-line note a caller can prepend to a cached response.
    pub fn feedback(&self) -> String {
        format!("[Cached {} | {}]", self.format_age(), self.format_expires())
    }
}

fn non_negative(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..=59 => format!("{} seconds", secs),
        60..=3599 => format!("{} minutes", secs / 60),
        3600..=86399 => format!("{} hours", secs / 3600),
        _ => format!("{} days", secs / 86400),
    }
}

/// TTL classes matched to how quickly the underlying data changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTtl {
    /// Quotes and live snapshots: 5 minutes
    Realtime,
    /// Cost and size estimates: 30 minutes
    Intraday,
    /// Historical ranges: 1 hour
    Historical,
    /// Dataset/schema listings: 2 hours
    Metadata,
    /// Reference data such as symbology and conditions: 24 hours
    Reference,
}

impl CacheTtl {
    pub fn duration(self) -> Duration {
        match self {
            CacheTtl::Realtime => Duration::from_secs(300),
            CacheTtl::Intraday => Duration::from_secs(1800),
            CacheTtl::Historical => Duration::from_secs(3600),
            CacheTtl::Metadata => Duration::from_secs(7200),
            CacheTtl::Reference => Duration::from_secs(86400),
        }
    }
}

impl From<CacheTtl> for Duration {
    fn from(ttl: CacheTtl) -> Self {
        ttl.duration()
    }
}

/// Builder for semantic cache keys made of `:`-separated query parameters.
///
/// ```
/// use tower_mdgate::cache::CacheKey;
///
/// let key = CacheKey::new("historical")
///     .part("GLBX.MDP3")
///     .sorted_list(["MSFT", "AAPL"])
///     .part("2024-01-01");
/// assert_eq!(key.to_string(), "historical:GLBX.MDP3:AAPL,MSFT:2024-01-01");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    parts: Vec<String>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            parts: vec![namespace.into()],
        }
    }

    pub fn part(mut self, part: impl fmt::Display) -> Self {
        self.parts.push(part.to_string());
        self
    }

    /// Appends an optional parameter; absent values still occupy a slot so
    /// `(None, Some(x))` and `(Some(x), None)` never collide.
    pub fn optional(mut self, part: Option<impl fmt::Display>) -> Self {
        self.parts.push(part.map(|p| p.to_string()).unwrap_or_default());
        self
    }

    /// Appends a list whose order does not matter to the query.
    pub fn sorted_list<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut items: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
        items.sort();
        self.parts.push(items.join(","));
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join(":"))
    }
}

/// Hex SHA-256 of a semantic key; used as the entry's file stem.
pub fn storage_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

enum Stored {
    Missing,
    Unreadable(io::Error),
    Corrupt(String),
    Found(CacheEntry),
}

fn load(path: &Path) -> Stored {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Stored::Missing,
        Err(e) => return Stored::Unreadable(e),
    };
    match serde_json::from_slice::<CacheEntry>(&bytes) {
        Ok(entry) => Stored::Found(entry),
        Err(e) => Stored::Corrupt(e.to_string()),
    }
}

/// File-backed cache with per-entry expiry.
#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Cache {
    /// Opens (creating if needed) the cache directory from `config`.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self {
            dir: config.dir,
            default_ttl: config.default_ttl,
            clock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// File that stores (or would store) `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", storage_name(key), ENTRY_EXTENSION))
    }

    /// Cached value for `key`, or `None` on miss, expiry, corruption or
    /// `force_refresh`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, force_refresh: bool) -> Option<T> {
        self.get_with_info(key, force_refresh).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning age and expiry information.
    pub fn get_with_info<T: DeserializeOwned>(
        &self,
        key: &str,
        force_refresh: bool,
    ) -> Option<(T, CacheInfo)> {
        if force_refresh {
            debug!(key, "cache bypassed by force_refresh");
            return None;
        }

        let path = self.path_for(key);
        let entry = match load(&path) {
            Stored::Missing => return None,
            Stored::Unreadable(e) => {
                warn!(key, error = %e, "cache entry unreadable");
                return None;
            }
            Stored::Corrupt(reason) => {
                self.evict(&path, key, &reason);
                return None;
            }
            Stored::Found(entry) => entry,
        };

        let now = self.clock.now();
        if entry.is_expired(now) {
            self.evict(&path, key, "expired");
            return None;
        }

        let info = CacheInfo::from_entry(&entry, now);
        match serde_json::from_value::<T>(entry.value) {
            Ok(value) => {
                debug!(key, age_secs = info.age.as_secs(), "cache hit");
                Some((value, info))
            }
            Err(e) => {
                self.evict(&path, key, &e.to_string());
                None
            }
        }
    }

    /// Stores `value` under `key`, replacing any previous entry. `None` uses
    /// the configured default TTL.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            value: serde_json::to_value(value)?,
            created_at: now,
            expires_at,
        };

        let bytes = serde_json::to_vec_pretty(&entry)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        Ok(())
    }

    /// Removes `key`; `Ok(false)` if it was not present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every entry. Returns how many were deleted.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_paths()? {
            if remove_if_present(&path)? {
                removed += 1;
            }
        }
        debug!(removed, "cache cleared");
        Ok(removed)
    }

    /// Removes expired (and unreadable) entries, leaving live ones alone.
    pub fn clear_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for path in self.entry_paths()? {
            let stale = match load(&path) {
                Stored::Found(entry) => entry.is_expired(now),
                Stored::Corrupt(_) => true,
                Stored::Missing | Stored::Unreadable(_) => false,
            };
            if stale && remove_if_present(&path)? {
                removed += 1;
            }
        }
        debug!(removed, "expired cache entries swept");
        Ok(removed)
    }

    /// Peeks at `key` without evicting anything.
    pub fn status(&self, key: &str) -> CacheStatus {
        match load(&self.path_for(key)) {
            Stored::Found(entry) if entry.is_expired(self.clock.now()) => CacheStatus::Expired,
            Stored::Found(_) => CacheStatus::Hit,
            Stored::Missing | Stored::Unreadable(_) | Stored::Corrupt(_) => CacheStatus::Miss,
        }
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn evict(&self, path: &Path, key: &str, reason: &str) {
        debug!(key, reason, "evicting cache entry");
        if let Err(e) = remove_if_present(path) {
            warn!(key, error = %e, "failed to evict cache entry");
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn cache_with_clock(dir: &TempDir) -> (Cache, ManualClock) {
        let clock = ManualClock::starting_now();
        let cache =
            Cache::with_clock(CacheConfig::new(dir.path()), Arc::new(clock.clone())).unwrap();
        (cache, clock)
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        cache.set("q", &json!({"rows": [1, 2, 3]}), None).unwrap();
        let value: serde_json::Value = cache.get("q", false).unwrap();
        assert_eq!(value, json!({"rows": [1, 2, 3]}));
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = cache_with_clock(&dir);

        cache.set("q1", "v1", Some(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_millis(1100));

        assert_eq!(cache.get::<String>("q1", false), None);
        assert!(!cache.path_for("q1").exists());

        cache.set("q2", "v2", None).unwrap();
        assert_eq!(cache.get::<String>("q2", false), Some("v2".to_string()));
    }

    #[test]
    fn entry_is_valid_exactly_at_expiry() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = cache_with_clock(&dir);

        cache.set("edge", &1u32, Some(Duration::from_secs(10))).unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get::<u32>("edge", false), Some(1));
    }

    #[test]
    fn force_refresh_skips_storage() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        cache.set("q", &42, None).unwrap();
        assert_eq!(cache.get::<i32>("q", true), None);
        assert!(cache.get_with_info::<i32>("q", true).is_none());
        // still there for normal reads
        assert_eq!(cache.get::<i32>("q", false), Some(42));
    }

    #[test]
    fn corrupt_entry_is_deleted() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        let path = cache.path_for("broken");
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(cache.status("broken"), CacheStatus::Miss);
        assert!(path.exists(), "status must not evict");

        assert_eq!(cache.get::<String>("broken", false), None);
        assert!(!path.exists());
    }

    #[test]
    fn missing_fields_count_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        let path = cache.path_for("partial");
        fs::write(&path, br#"{"value": 1}"#).unwrap();
        assert_eq!(cache.get::<i32>("partial", false), None);
        assert!(!path.exists());
    }

    #[test]
    fn wrong_value_shape_is_self_healed() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        cache.set("shape", "text", None).unwrap();
        assert_eq!(cache.get::<Vec<u32>>("shape", false), None);
        assert!(!cache.path_for("shape").exists());
    }

    #[test]
    fn status_peeks_without_evicting() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = cache_with_clock(&dir);

        assert_eq!(cache.status("k"), CacheStatus::Miss);
        cache.set("k", &1, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(cache.status("k"), CacheStatus::Hit);

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.status("k"), CacheStatus::Expired);
        assert!(cache.path_for("k").exists());
    }

    #[test]
    fn set_overwrites_existing_entry() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = cache_with_clock(&dir);

        cache.set("k", "old", Some(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_millis(500));
        cache.set("k", "new", Some(Duration::from_secs(60))).unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.get::<String>("k", false), Some("new".to_string()));
    }

    #[test]
    fn delete_reports_presence() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        cache.set("k", &1, None).unwrap();
        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
        assert_eq!(cache.get::<i32>("k", false), None);
    }

    #[test]
    fn clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        for i in 0..4 {
            cache.set(&format!("k{}", i), &i, None).unwrap();
        }
        assert_eq!(cache.clear().unwrap(), 4);
        assert_eq!(cache.status("k0"), CacheStatus::Miss);
    }

    #[test]
    fn clear_expired_keeps_live_entries() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = cache_with_clock(&dir);

        cache.set("short", &1, Some(Duration::from_secs(1))).unwrap();
        cache.set("long", &2, Some(Duration::from_secs(3600))).unwrap();
        fs::write(cache.path_for("junk"), b"???").unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.clear_expired().unwrap(), 2);
        assert_eq!(cache.get::<i32>("long", false), Some(2));
        assert_eq!(cache.status("short"), CacheStatus::Miss);
    }

    #[test]
    fn info_reports_age_and_remaining() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = cache_with_clock(&dir);

        cache.set("k", "v", Some(Duration::from_secs(3600))).unwrap();
        clock.advance(Duration::from_secs(300));

        let (value, info) = cache.get_with_info::<String>("k", false).unwrap();
        assert_eq!(value, "v");
        assert_eq!(info.ttl, Duration::from_secs(3600));
        assert_eq!(info.age, Duration::from_secs(300));
        assert_eq!(info.expires_in, Duration::from_secs(3300));
        assert_eq!(info.format_age(), "5 minutes ago");
        assert_eq!(info.format_expires(), "expires in 55 minutes");
        assert_eq!(info.feedback(), "[Cached 5 minutes ago | expires in 55 minutes]");
    }

    #[test]
    fn humanize_picks_largest_unit() {
        assert_eq!(humanize(Duration::from_secs(12)), "12 seconds");
        assert_eq!(humanize(Duration::from_secs(7200)), "2 hours");
        assert_eq!(humanize(Duration::from_secs(3 * 86400)), "3 days");
    }

    #[test]
    fn entry_file_is_named_by_key_digest() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        let path = cache.path_for("historical:GLBX.MDP3");
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(stem, storage_name("historical:GLBX.MDP3"));
        assert_ne!(storage_name("a"), storage_name("b"));
    }

    #[test]
    fn stored_file_has_iso_timestamps() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_clock(&dir);

        cache.set("k", &json!([1]), None).unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(cache.path_for("k")).unwrap()).unwrap();
        assert_eq!(raw["value"], json!([1]));
        for field in ["created_at", "expires_at"] {
            let text = raw[field].as_str().unwrap();
            assert!(DateTime::parse_from_rfc3339(text).is_ok(), "{} = {}", field, text);
        }
    }

    #[test]
    fn cache_key_is_order_insensitive_for_lists() {
        let a = CacheKey::new("h").sorted_list(["MSFT", "AAPL"]).part(10);
        let b = CacheKey::new("h").sorted_list(vec!["AAPL", "MSFT"]).part(10);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "h:AAPL,MSFT:10");

        let none_first = CacheKey::new("h").optional(None::<&str>).optional(Some("x"));
        let none_last = CacheKey::new("h").optional(Some("x")).optional(None::<&str>);
        assert_ne!(none_first.to_string(), none_last.to_string());
    }

    #[test]
    fn ttl_classes() {
        assert_eq!(CacheTtl::Realtime.duration(), Duration::from_secs(300));
        assert_eq!(Duration::from(CacheTtl::Reference), Duration::from_secs(86400));
    }
}
