use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Reserved key under which the navigation index document is stored.
pub const INDEX_KEY: &str = "_index";

const PAYLOAD_EXT: &str = "bin";
const META_EXT: &str = "meta";
const MAX_KEY_STEM: usize = 120;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache metadata error: {0}")]
    Meta(#[from] serde_json::Error),
}

/// Derives the deterministic cache key for a remote URL.
///
/// Normalization: the fragment is stripped, the URL is re-serialized (which
/// percent-encodes consistently), path separators and other characters that
/// are hostile to filesystems are mapped to `_`, and a short content hash of
/// the normalized URL is appended. Equal URLs always produce equal keys; the
/// hash suffix makes distinct URLs collide only with negligible probability
/// even after the lossy character mapping.
pub fn cache_key(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let normalized = normalized.to_string();

    let digest = Sha256::digest(normalized.as_bytes());
    let suffix = hex::encode(&digest[..8]);

    let mut stem: String = normalized
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => c,
            _ => '_',
        })
        .collect();
    stem.truncate(MAX_KEY_STEM);

    format!("{}-{}", stem, suffix)
}

/// One persisted cache entry, decompressed and ready for use.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    /// Whether the payload was stored compressed on disk.
    pub compressed: bool,
    pub created_at: SystemTime,
    /// `None` means the entry never expires.
    pub expires_at: Option<SystemTime>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    compressed: bool,
    created_at_secs: u64,
    expires_at_secs: Option<u64>,
}

/// Content-addressable persistence with lazy TTL expiry and optional
/// per-entry gzip compression.
///
/// Writes go to a temporary file and are renamed into place, payload before
/// metadata, so a concurrent reader never observes a partially written
/// entry: an entry is visible only once its metadata file exists.
pub struct CacheStore {
    base_dir: PathBuf,
    // Insertion-ordered key index; listing stays stable for the lifetime of
    // this store instance.
    keys: Mutex<Vec<String>>,
}

impl CacheStore {
    /// Opens a store rooted at `base_dir`, creating the directory if needed.
    /// Pre-existing entries are indexed in sorted order.
    pub fn open(base_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_dir)?;

        let mut keys = Vec::new();
        for entry in fs::read_dir(base_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(&format!(".{}", META_EXT)) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            keys: Mutex::new(keys),
        })
    }

    /// Persists a payload under `key`, overwriting any existing entry.
    /// `ttl` of `None` means the entry never expires.
    pub fn put(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        compress: bool,
    ) -> Result<(), StorageError> {
        self.put_at(key, payload, ttl, compress, SystemTime::now())
    }

    pub(crate) fn put_at(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        compress: bool,
        now: SystemTime,
    ) -> Result<(), StorageError> {
        let stored: Vec<u8> = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            encoder.finish()?
        } else {
            payload.to_vec()
        };

        let meta = EntryMeta {
            compressed: compress,
            created_at_secs: unix_secs(now),
            expires_at_secs: ttl.map(|ttl| unix_secs(now + ttl)),
        };

        self.write_atomic(&self.payload_path(key), &stored)?;
        self.write_atomic(&self.meta_path(key), serde_json::to_vec(&meta)?.as_slice())?;

        let mut keys = self.keys.lock().unwrap();
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }

        tracing::debug!(key, bytes = payload.len(), compressed = compress, "cached entry");
        Ok(())
    }

    /// Returns the entry for `key`, or `None` if it does not exist or has
    /// expired. Expired entries are deleted on observation.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.get_at(key, SystemTime::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: SystemTime) -> Result<Option<CacheEntry>, StorageError> {
        let meta = match self.read_meta(key)? {
            Some(meta) => meta,
            None => return Ok(None),
        };

        if let Some(expires) = meta.expires_at_secs {
            if unix_secs(now) >= expires {
                tracing::debug!(key, "cache entry expired");
                self.remove(key)?;
                return Ok(None);
            }
        }

        let stored = match fs::read(self.payload_path(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let payload = if meta.compressed {
            let mut decoder = GzDecoder::new(stored.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            stored
        };

        Ok(Some(CacheEntry {
            key: key.to_string(),
            payload,
            compressed: meta.compressed,
            created_at: UNIX_EPOCH + Duration::from_secs(meta.created_at_secs),
            expires_at: meta
                .expires_at_secs
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        }))
    }

    /// True when an unexpired entry exists for `key`. Does not read the
    /// payload; used by the rewriter's resolver.
    pub fn contains(&self, key: &str) -> bool {
        self.contains_at(key, SystemTime::now())
    }

    pub(crate) fn contains_at(&self, key: &str, now: SystemTime) -> bool {
        match self.read_meta(key) {
            Ok(Some(meta)) => match meta.expires_at_secs {
                Some(expires) => unix_secs(now) < expires,
                None => true,
            },
            _ => false,
        }
    }

    /// Every key this store instance has seen, in stable order.
    pub fn list_keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    /// Removes the entry for `key`. Idempotent; absent keys are not an error.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        remove_if_exists(&self.meta_path(key))?;
        remove_if_exists(&self.payload_path(key))?;
        self.keys.lock().unwrap().retain(|k| k != key);
        Ok(())
    }

    fn read_meta(&self, key: &str) -> Result<Option<EntryMeta>, StorageError> {
        match fs::read(self.meta_path(key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", key, PAYLOAD_EXT))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", key, META_EXT))
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let url = Url::parse("https://example.com/page?q=1").unwrap();
        assert_eq!(cache_key(&url), cache_key(&url));
    }

    #[test]
    fn test_cache_key_strips_fragment() {
        let with = Url::parse("https://example.com/page#section").unwrap();
        let without = Url::parse("https://example.com/page").unwrap();
        assert_eq!(cache_key(&with), cache_key(&without));
    }

    #[test]
    fn test_cache_key_collision_resistance_over_corpus() {
        use std::collections::HashSet;
        let mut keys = HashSet::new();
        let mut count = 0;
        for host in 0..50 {
            for page in 0..40 {
                let url = Url::parse(&format!("https://host{}.test/dir/page{}", host, page)).unwrap();
                keys.insert(cache_key(&url));
                count += 1;
            }
        }
        assert_eq!(keys.len(), count);
    }

    #[test]
    fn test_cache_key_distinguishes_slash_and_underscore() {
        let a = Url::parse("https://example.com/a/b").unwrap();
        let b = Url::parse("https://example.com/a_b").unwrap();
        assert_ne!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let (_dir, store) = store();
        store.put("k1", b"payload bytes", None, false).unwrap();
        let entry = store.get("k1").unwrap().unwrap();
        assert_eq!(entry.payload, b"payload bytes");
        assert!(!entry.compressed);
        assert!(entry.expires_at.is_none());
    }

    #[test]
    fn test_compressed_entry_decompresses_transparently() {
        let (_dir, store) = store();
        let text = "repetitive text ".repeat(200);
        store.put("k1", text.as_bytes(), None, true).unwrap();

        let on_disk = fs::read(store.payload_path("k1")).unwrap();
        assert!(on_disk.len() < text.len());

        let entry = store.get("k1").unwrap().unwrap();
        assert!(entry.compressed);
        assert_eq!(entry.payload, text.as_bytes());
    }

    #[test]
    fn test_get_missing_key_is_none() {
        let (_dir, store) = store();
        assert!(store.get("absent").unwrap().is_none());
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let (_dir, store) = store();
        let now = SystemTime::now();
        store
            .put_at("k1", b"short lived", Some(Duration::from_secs(3600)), false, now)
            .unwrap();

        let one_hour_less_a_second = now + Duration::from_secs(3599);
        assert!(store.get_at("k1", one_hour_less_a_second).unwrap().is_some());

        let two_hours = now + Duration::from_secs(7200);
        assert!(store.get_at("k1", two_hours).unwrap().is_none());
        // Observation removed the expired entry.
        assert!(!store.list_keys().contains(&"k1".to_string()));
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let (_dir, store) = store();
        store.put("k1", b"old", None, false).unwrap();
        store.put("k1", b"new", None, false).unwrap();
        let entry = store.get("k1").unwrap().unwrap();
        assert_eq!(entry.payload, b"new");
        assert_eq!(store.list_keys().iter().filter(|k| *k == "k1").count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, store) = store();
        store.put("k1", b"bytes", None, false).unwrap();
        store.remove("k1").unwrap();
        store.remove("k1").unwrap();
        assert!(store.get("k1").unwrap().is_none());
    }

    #[test]
    fn test_list_keys_keeps_insertion_order() {
        let (_dir, store) = store();
        store.put("b", b"1", None, false).unwrap();
        store.put("a", b"2", None, false).unwrap();
        store.put("c", b"3", None, false).unwrap();
        assert_eq!(store.list_keys(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_reopened_store_lists_existing_entries() {
        let dir = tempdir().unwrap();
        {
            let store = CacheStore::open(dir.path()).unwrap();
            store.put("b", b"1", None, false).unwrap();
            store.put("a", b"2", None, false).unwrap();
        }
        let reopened = CacheStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list_keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_contains_respects_expiry() {
        let (_dir, store) = store();
        let now = SystemTime::now();
        store
            .put_at("k1", b"bytes", Some(Duration::from_secs(60)), false, now)
            .unwrap();
        assert!(store.contains_at("k1", now + Duration::from_secs(30)));
        assert!(!store.contains_at("k1", now + Duration::from_secs(61)));
        assert!(!store.contains_at("missing", now));
    }
}
