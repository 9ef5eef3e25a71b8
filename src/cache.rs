//! Cache of recent bridge test results.
//!
//! Testing a bridge takes up to a minute of wall-clock time on a shared tor
//! process, so results are worth keeping. [`TestCache`] maps a bridge's
//! `addr:port` to its most recent verdict and serves repeat queries for the
//! configured entry timeout (18 hours by default). The cache is persisted to
//! disk across restarts as a self-describing JSON map; fields added in newer
//! versions decode to their zero value when reading an older file.
//!
//! # Concurrency
//!
//! A single mutex guards the entry map. Every operation takes the lock, so
//! lookups are safe under a concurrent writer.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bridge_line;
use crate::error::Result;
use crate::metrics::Metrics;

/// An entry in our cache of bridges that we recently tested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hashed identifier for this bridge, safe to publish. Empty in cache
    /// files written by older versions.
    #[serde(default)]
    pub hashed_ident: String,
    /// Empty if the bridge works, and the error description otherwise.
    pub error: String,
    /// When we tested the bridge.
    pub time: DateTime<Utc>,
    /// How many times this entry was served from the cache.
    #[serde(default)]
    pub cache_hits: u64,
}

/// Cache of bridge test results, keyed by the bridge's `addr:port`.
pub struct TestCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// How long a cache entry is valid for.
    entry_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl TestCache {
    /// Creates an empty cache whose entries expire after `entry_timeout`.
    pub fn new(entry_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            entry_timeout,
            metrics,
        }
    }

    /// Returns a copy of the cache entry for the given bridge line if we
    /// tested it recently, and `None` otherwise.
    ///
    /// Expired entries are pruned before the lookup, so a stale entry is
    /// never observable. A hit increments the entry's hit counter.
    pub fn is_cached(&self, bridge_line: &str) -> Option<CacheEntry> {
        let cutoff = Utc::now() - self.entry_timeout;
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.time >= cutoff);
        self.metrics.cache_size.set(entries.len() as i64);

        let addr_port = match bridge_line::addr_port(bridge_line) {
            Ok(ap) => ap,
            Err(_) => return None,
        };

        match entries.get_mut(&addr_port) {
            Some(entry) => {
                entry.cache_hits += 1;
                self.metrics.cache.with_label_values(&["hit"]).inc();
                Some(entry.clone())
            }
            None => {
                self.metrics.cache.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    /// Adds an entry for the given bridge, test result and test time.
    ///
    /// Bridge lines without an extractable `addr:port` are silently dropped;
    /// such lines never make it to the dispatcher in the first place.
    pub fn add_entry(&self, bridge_line: &str, error: Option<String>, last_tested: DateTime<Utc>) {
        let Ok(addr_port) = bridge_line::addr_port(bridge_line) else {
            return;
        };
        let Ok(hashed_ident) = bridge_line::hashed_identifier(bridge_line) else {
            return;
        };

        let mut entries = self.entries.lock();
        entries.insert(
            addr_port,
            CacheEntry {
                hashed_ident,
                error: error.unwrap_or_default(),
                time: last_tested,
                cache_hits: 0,
            },
        );
        self.metrics.cache_size.set(entries.len() as i64);
        self.metrics
            .frac_functional
            .set(Self::frac_functional_locked(&entries));
    }

    /// Returns the fraction of bridges currently in the cache that are
    /// functional, or 0 for an empty cache.
    pub fn frac_functional(&self) -> f64 {
        Self::frac_functional_locked(&self.entries.lock())
    }

    fn frac_functional_locked(entries: &HashMap<String, CacheEntry>) -> f64 {
        if entries.is_empty() {
            return 0.0;
        }
        let num_functional = entries.values().filter(|e| e.error.is_empty()).count();
        num_functional as f64 / entries.len() as f64
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Writes the cache to disk, allowing it to persist across restarts.
    pub fn write_to_disk(&self, cache_file: &Path) -> Result<()> {
        let entries = self.entries.lock();
        let encoded = serde_json::to_vec(&*entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(cache_file, encoded)?;
        info!(
            "Wrote cache with {} elements to {:?}.",
            entries.len(),
            cache_file
        );
        Ok(())
    }

    /// Reads the cache from disk, replacing the in-memory entries.
    pub fn read_from_disk(&self, cache_file: &Path) -> Result<()> {
        let fh = File::open(cache_file)?;
        let loaded: HashMap<String, CacheEntry> = serde_json::from_reader(BufReader::new(fh))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut entries = self.entries.lock();
        *entries = loaded;
        self.metrics.cache_size.set(entries.len() as i64);
        info!(
            "Read cache with {} elements from {:?}.",
            entries.len(),
            cache_file
        );
        Ok(())
    }

    /// Returns the cached results as v1 bridge metrics lines.
    ///
    /// Bridges are identified by their hashed identifier only; the lines
    /// must not contain anything sensitive.
    pub fn v1_metrics_lines(&self) -> Vec<String> {
        let entries = self.entries.lock();
        entries
            .values()
            .map(|e| {
                format!(
                    "bridge id={} err={:?} at={} cache-hits={}\n",
                    e.hashed_ident,
                    e.error,
                    e.time.format("%Y-%m-%dT%H:%M:%S"),
                    e.cache_hits
                )
            })
            .collect()
    }

    /// Returns a snapshot of all entries, for `--print-cache`.
    pub fn snapshot(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[cfg(test)]
    fn insert_raw(&self, addr_port: &str, entry: CacheEntry) {
        self.entries.lock().insert(addr_port.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cache(timeout: Duration) -> TestCache {
        TestCache::new(timeout, Arc::new(Metrics::new(60.0).unwrap()))
    }

    #[test]
    fn test_cache_functions() {
        let cache = new_cache(Duration::hours(18));
        let bridge_line = "obfs4 127.0.0.1:1 cert=foo iat-mode=0";

        assert!(cache.is_cached(bridge_line).is_none());

        cache.add_entry(bridge_line, None, Utc::now());
        assert!(cache.is_cached(bridge_line).is_some());

        cache.add_entry(bridge_line, Some("bridge is on fire".to_string()), Utc::now());
        let entry = cache.is_cached(bridge_line).unwrap();
        assert_eq!(entry.error, "bridge is on fire");
    }

    #[test]
    fn test_cache_hit_counting() {
        let cache = new_cache(Duration::hours(18));
        cache.add_entry("1.1.1.1:1111", None, Utc::now());

        assert_eq!(cache.is_cached("1.1.1.1:1111").unwrap().cache_hits, 1);
        assert_eq!(cache.is_cached("1.1.1.1:1111").unwrap().cache_hits, 2);
    }

    #[test]
    fn test_cache_expiration() {
        let cache = new_cache(Duration::hours(18));

        let expiry = "2000-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        cache.insert_raw(
            "1.1.1.1:1111",
            CacheEntry {
                hashed_ident: String::new(),
                error: String::new(),
                time: expiry,
                cache_hits: 0,
            },
        );
        cache.insert_raw(
            "2.2.2.2:2222",
            CacheEntry {
                hashed_ident: String::new(),
                error: String::new(),
                time: Utc::now(),
                cache_hits: 0,
            },
        );

        assert!(cache.is_cached("1.1.1.1:1111").is_none());
        assert!(cache.is_cached("2.2.2.2:2222").is_some());
        // The stale entry is gone after any lookup, not just its own.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_frac_functional() {
        let cache = new_cache(Duration::hours(18));
        assert_eq!(cache.frac_functional(), 0.0);

        cache.add_entry("1.1.1.1:1", None, Utc::now());
        assert_eq!(cache.frac_functional(), 1.0);

        cache.add_entry("2.2.2.2:2", Some("broken".to_string()), Utc::now());
        assert_eq!(cache.frac_functional(), 0.5);
    }

    #[test]
    fn test_cache_serialisation() {
        let cache = new_cache(Duration::hours(18));
        cache.add_entry("1.1.1.1:1", Some("foo".to_string()), Utc::now());
        cache.add_entry("2.2.2.2:2", Some("bar".to_string()), Utc::now());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache-file");
        cache.write_to_disk(&path).unwrap();

        let restored = new_cache(Duration::hours(18));
        restored.read_from_disk(&path).unwrap();

        assert_eq!(restored.len(), 2);
        let entry = restored.is_cached("1.1.1.1:1").unwrap();
        assert_eq!(entry.error, "foo");
    }

    #[test]
    fn test_forward_compatible_decoding() {
        // Cache files from older versions lack the hashed_ident and
        // cache_hits fields; they must decode to their zero values.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old-cache");
        std::fs::write(
            &path,
            r#"{"3.3.3.3:3333":{"error":"","time":"2024-05-01T00:00:00Z"}}"#,
        )
        .unwrap();

        let cache = new_cache(Duration::days(365 * 100));
        cache.read_from_disk(&path).unwrap();
        let entry = cache.is_cached("3.3.3.3:3333").unwrap();
        assert_eq!(entry.hashed_ident, "");
        assert_eq!(entry.cache_hits, 1);
    }

    #[test]
    fn test_read_missing_file() {
        let cache = new_cache(Duration::hours(18));
        assert!(cache.read_from_disk(Path::new("/nonexistent/cache")).is_err());
    }

    #[test]
    fn test_cache_concurrency() {
        let cache = Arc::new(new_cache(Duration::hours(18)));
        let max = 10_000u32;

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..max {
                    let line = format!(
                        "{}.{}.{}.{}:1234",
                        (i >> 24) & 0xff,
                        (i >> 16) & 0xff,
                        (i >> 8) & 0xff,
                        i & 0xff
                    );
                    cache.add_entry(&line, None, Utc::now());
                }
            })
        };
        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..max {
                    let line = format!(
                        "{}.{}.{}.{}:1234",
                        (i >> 24) & 0xff,
                        (i >> 16) & 0xff,
                        (i >> 8) & 0xff,
                        i & 0xff
                    );
                    cache.is_cached(&line);
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_v1_metrics_lines() {
        let cache = new_cache(Duration::hours(18));
        cache.add_entry("1.1.1.1:1", Some("broken".to_string()), Utc::now());
        let lines = cache.v1_metrics_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bridge id="));
        assert!(lines[0].contains("err=\"broken\""));
        assert!(lines[0].contains("cache-hits=0"));
    }
}
