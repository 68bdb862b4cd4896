use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use tracing::{event, instrument, Level};

/// A file held in memory, with the time it was last checked against disk.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    path: PathBuf,
    bytes: Bytes,
    stat_time: Instant,
    modified: Option<SystemTime>,
    content_type: &'static str,
}

impl CacheEntry {
    pub fn new(path: impl Into<PathBuf>, bytes: impl Into<Bytes>, stat_time: Instant) -> Self {
        let path = path.into();
        let content_type = guess_content_type(&path);

        Self {
            path,
            bytes: bytes.into(),
            stat_time,
            modified: None,
            content_type,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn stat_time(&self) -> Instant {
        self.stat_time
    }

    /// Modification time of the file when it was read, if the platform reports one.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Time since the entry was last checked, zero if `now` is before that.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stat_time)
    }
}

/// Path-keyed cache of file contents, belonging to one worker.
///
/// Entries older than the TTL are dropped by `sweep`, which the worker runs periodically.
pub struct FileCache {
    entries: HashMap<PathBuf, CacheEntry>,
    ttl: Duration,
}

impl FileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Insert an entry, replacing any existing entry for the same path.
    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        self.entries.remove(path)
    }

    pub fn clear(&mut self) {
        event!(Level::DEBUG, count = self.entries.len(), "clearing file cache");
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Look up a file, reading it into the cache if it's missing or stale.
    ///
    /// A stale entry is checked against the file's metadata, and its bytes are only read again
    /// when the file changed. If the file can no longer be read, the entry is dropped.
    pub fn open(&mut self, path: &Path) -> Result<&CacheEntry, io::Error> {
        let now = Instant::now();

        let fresh = self
            .entries
            .get(path)
            .is_some_and(|entry| entry.age(now) <= self.ttl);
        if !fresh {
            self.refresh(path, now)?;
        }

        self.entries
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cache entry missing"))
    }

    fn refresh(&mut self, path: &Path, now: Instant) -> Result<(), io::Error> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) => {
                self.entries.remove(path);
                return Err(error);
            }
        };

        if !metadata.is_file() {
            self.entries.remove(path);
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }

        let modified = metadata.modified().ok();
        let unchanged = self.entries.get(path).is_some_and(|entry| {
            entry.modified.is_some()
                && entry.modified == modified
                && entry.bytes.len() as u64 == metadata.len()
        });

        if unchanged {
            if let Some(entry) = self.entries.get_mut(path) {
                event!(Level::TRACE, path = ?path, "cached file unchanged");
                entry.stat_time = now;
            }
            return Ok(());
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) => {
                self.entries.remove(path);
                return Err(error);
            }
        };
        event!(Level::DEBUG, path = ?path, len = bytes.len(), "caching file");

        let mut entry = CacheEntry::new(path, bytes, now);
        entry.modified = modified;
        self.insert(entry);

        Ok(())
    }

    /// Drop every entry that was last checked more than the TTL before `now`.
    ///
    /// Returns the number of evicted entries.
    #[instrument("FileCache::sweep", skip_all)]
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;

        self.entries.retain(|path, entry| {
            let keep = entry.age(now) <= ttl;
            if !keep {
                event!(Level::TRACE, path = ?path, "evicting cached file");
            }
            keep
        });

        let evicted = before - self.entries.len();
        if evicted > 0 {
            event!(Level::DEBUG, evicted, remaining = self.entries.len(), "swept file cache");
        }

        evicted
    }
}

/// Content type of a file by its extension.
pub(crate) fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_ascii_lowercase());

    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
