//! ResultCache - スレッドセーフな TTL ストアと任意のディスク永続化
//!
//! # フロー
//! - `get` は遅延評価: 失効したエントリは無いものとして読み、その場で捨てる
//! - `set` はエントリを丸ごと差し替える（`Arc<CacheEntry<V>>`）
//! - `sweep` は失効したエントリをまとめて捨てる。`start_maintenance` が
//!   バックグラウンドで実行し、永続化していればディスクにも flush する
//!
//! マップの mutex を持つのはマップ操作の間だけ。値の計算、clone、
//! シリアライズはロック外。
//!
//! 同時に起きたミスの重複排除はしない。それには coalescer と組み合わせる。

mod entry;
mod error;
mod key;
mod persist;
mod policy;

pub use entry::CacheEntry;
pub use error::{CacheError, PersistenceError};
pub use key::{KeyPart, SEPARATOR, make_key};
pub use persist::PersistedEntry;
pub use policy::CachePolicy;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::ticker::Ticker;
use crate::ports::Clock;

type EntryMap<V> = HashMap<String, Arc<CacheEntry<V>>>;

pub struct ResultCache<V> {
    entries: Mutex<EntryMap<V>>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
    persistent: AtomicBool,
    /// スナップショットから書き込みまで保持。保存はすべて `<path>.tmp` を通る
    writer: Mutex<()>,
}

impl<V: Clone + Send + Sync> ResultCache<V> {
    /// メモリのみのキャッシュ
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            path: None,
            persistent: AtomicBool::new(false),
            writer: Mutex::new(()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, EntryMap<V>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `key` の有効な値。ミスはエラーではなく `None`
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_entry(key).map(|entry| entry.value.clone())
    }

    /// Fresh entry for `key`. An expired entry is removed on the way out.
    pub fn get_entry(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let entry = entries.get(key)?;
        if entry.is_expired(now) {
            entries.remove(key);
            return None;
        }
        Some(Arc::clone(entry))
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) -> Result<(), CacheError> {
        let key = key.into();
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl { key });
        }
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            value,
            created_at: self.clock.now(),
            ttl,
        });
        self.entries().insert(key, entry);
        Ok(())
    }

    /// Returns true if an entry (fresh or not) was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = entries.len(), "cache swept");
        }
        swept
    }

    /// Stored entries, expired ones included until swept or read.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Is the cache still backed by its file?
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn degrade(&self, error: &PersistenceError) {
        if self.persistent.swap(false, Ordering::SeqCst) {
            tracing::warn!(error = %error, "cache persistence disabled, continuing in memory only");
        }
    }
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned,
{
    /// `path` に裏打ちされたキャッシュ
    ///
    /// 既存のレコードはここで読み込む。失敗したら空のメモリのみで始める。
    pub fn with_persistence(clock: Arc<dyn Clock>, path: impl Into<PathBuf>) -> Self {
        let cache = Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            path: Some(path.into()),
            persistent: AtomicBool::new(true),
            writer: Mutex::new(()),
        };
        if let Err(error) = cache.load() {
            cache.degrade(&error);
        }
        cache
    }

    /// Merge records from the file. Records already expired by the clock and
    /// malformed records are discarded. Returns how many were loaded.
    pub fn load(&self) -> Result<usize, PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let (records, skipped) = persist::read_entries::<V>(path)?;
        for error in &skipped {
            tracing::warn!(error = %error, "skipping cache record");
        }

        let now = self.clock.now();
        let fresh: Vec<CacheEntry<V>> = records
            .into_iter()
            .filter_map(PersistedEntry::into_entry)
            .filter(|entry| !entry.is_expired(now))
            .collect();
        let loaded = fresh.len();
        {
            let mut entries = self.entries();
            for entry in fresh {
                entries.insert(entry.key.clone(), Arc::new(entry));
            }
        }
        tracing::info!(path = %path.display(), loaded, skipped = skipped.len(), "cache loaded");
        Ok(loaded)
    }

    /// 有効なエントリをすべてファイルに書き、書いた件数を返す
    ///
    /// 同時の保存（メンテナンススレッドと所有スレッド）は順番に実行され、
    /// ファイルには後のスナップショットが残る。
    pub fn save(&self) -> Result<usize, PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let _writing = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let snapshot: Vec<Arc<CacheEntry<V>>> = self
            .entries()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect();
        let records: Vec<PersistedEntry<V>> = snapshot.iter().map(|entry| PersistedEntry::from_entry(entry)).collect();
        persist::write_entries(path, &records)?;
        tracing::debug!(path = %path.display(), written = records.len(), "cache flushed");
        Ok(records.len())
    }

    /// 永続化が生きていれば `save`。失敗したらメモリのみに切り替える
    pub fn flush(&self) -> bool {
        if !self.is_persistent() {
            return false;
        }
        match self.save() {
            Ok(_) => true,
            Err(error) => {
                self.degrade(&error);
                false
            }
        }
    }
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Sweep every `sweep_interval` and flush at most every
    /// `flush_interval`. Stopping the handle flushes once more.
    pub fn start_maintenance(
        self: &Arc<Self>,
        sweep_interval: Duration,
        flush_interval: Duration,
    ) -> io::Result<MaintenanceHandle> {
        let cache = Arc::clone(self);
        let final_flush = Arc::clone(self);
        let mut last_flush = Instant::now();
        let ticker = Ticker::spawn(
            "offload-cache",
            sweep_interval,
            move || {
                cache.sweep();
                if last_flush.elapsed() >= flush_interval {
                    cache.flush();
                    last_flush = Instant::now();
                }
            },
            move || {
                final_flush.flush();
            },
        )?;
        Ok(MaintenanceHandle { ticker })
    }
}

pub struct MaintenanceHandle {
    ticker: Ticker,
}

impl MaintenanceHandle {
    /// Stop the maintenance thread after its final flush.
    pub fn shutdown_and_join(self) {
        self.ticker.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use chrono::{TimeZone, Utc};
    use serde::Deserialize;

    use crate::ports::ManualClock;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Verdict {
        malicious: bool,
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()))
    }

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("offload-cache-{}.jsonl", ulid::Ulid::new()))
    }

    #[test]
    fn cached_verdict_is_served_without_recomputing() {
        let clock = clock();
        let cache = ResultCache::new(clock.clone());
        let calls = AtomicUsize::new(0);
        let lookup = |cache: &ResultCache<Verdict>| {
            let key = crate::cache_key!("vt", "sha256", "abc");
            if let Some(hit) = cache.get(&key) {
                return hit;
            }
            calls.fetch_add(1, Ordering::SeqCst);
            let verdict = Verdict { malicious: false };
            cache.set(key, verdict.clone(), Duration::from_secs(3600)).unwrap();
            verdict
        };

        assert_eq!(lookup(&cache), Verdict { malicious: false });
        clock.advance(Duration::from_secs(1));
        assert_eq!(lookup(&cache), Verdict { malicious: false });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entry_reads_as_absent_after_ttl() {
        let clock = clock();
        let cache = ResultCache::new(clock.clone());
        cache.set("k", 1u32, Duration::from_secs(10)).unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("k"), Some(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let cache = ResultCache::new(clock());
        assert_eq!(
            cache.set("k", 1u32, Duration::ZERO),
            Err(CacheError::InvalidTtl { key: "k".to_string() })
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn set_replaces_the_entry_wholesale() {
        let clock = clock();
        let cache = ResultCache::new(clock.clone());
        cache.set("k", 1u32, Duration::from_secs(10)).unwrap();
        let old = cache.get_entry("k").unwrap();

        clock.advance(Duration::from_secs(5));
        cache.set("k", 2u32, Duration::from_secs(10)).unwrap();
        let new = cache.get_entry("k").unwrap();

        assert_eq!(old.value, 1);
        assert_eq!(new.value, 2);
        assert!(new.created_at > old.created_at);
    }

    #[test]
    fn invalidate_and_sweep() {
        let clock = clock();
        let cache = ResultCache::new(clock.clone());
        cache.set("short", 1u32, Duration::from_secs(1)).unwrap();
        cache.set("long", 2u32, Duration::from_secs(100)).unwrap();
        cache.set("gone", 3u32, Duration::from_secs(100)).unwrap();

        assert!(cache.invalidate("gone"));
        assert!(!cache.invalidate("gone"));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some(2));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_sets_leave_one_whole_value() {
        let cache = Arc::new(ResultCache::new(clock()));
        let writers: Vec<_> = (0..8u32)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let value = vec![i; 64];
                        cache.set("shared", value, Duration::from_secs(60)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stored = cache.get("shared").unwrap();
        assert_eq!(stored.len(), 64);
        assert!(stored.iter().all(|v| *v == stored[0]));
        assert!(stored[0] < 8);
    }

    #[test]
    fn reload_discards_entries_expired_by_the_clock() {
        let path = scratch();
        let clock = clock();
        {
            let cache = ResultCache::with_persistence(clock.clone(), &path);
            cache.set("fresh", "keep".to_string(), Duration::from_secs(3600)).unwrap();
            cache.set("stale", "drop".to_string(), Duration::from_secs(60)).unwrap();
            assert_eq!(cache.save().unwrap(), 2);
        }

        clock.advance(Duration::from_secs(120));
        let reloaded: ResultCache<String> = ResultCache::with_persistence(clock.clone(), &path);
        assert!(reloaded.is_persistent());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("fresh").as_deref(), Some("keep"));
        assert_eq!(reloaded.get("stale"), None);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn concurrent_saves_do_not_trample_each_other() {
        let path = scratch();
        let cache = Arc::new(ResultCache::with_persistence(clock(), &path));
        for i in 0..2_000u32 {
            cache.set(format!("ioc:{i}"), i, Duration::from_secs(3600)).unwrap();
        }

        let savers: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || (0..20).map(|_| cache.save()).collect::<Vec<_>>())
            })
            .collect();
        for saver in savers {
            for result in saver.join().unwrap() {
                assert_eq!(result.unwrap(), 2_000);
            }
        }
        assert!(cache.flush());
        assert!(cache.is_persistent());
        assert!(!persist::temp_path(&path).exists());

        let reloaded: ResultCache<u32> = ResultCache::with_persistence(clock(), &path);
        assert_eq!(reloaded.len(), 2_000);
        assert_eq!(reloaded.get("ioc:1999"), Some(1999));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn failed_flush_degrades_to_memory_only() {
        let path = scratch();
        // a directory where the temp file should go makes the write fail
        std::fs::create_dir(persist::temp_path(&path)).unwrap();

        let cache = ResultCache::with_persistence(clock(), &path);
        cache.set("k", 1u32, Duration::from_secs(60)).unwrap();
        assert!(cache.is_persistent());
        assert!(!cache.flush());
        assert!(!cache.is_persistent());
        assert_eq!(cache.get("k"), Some(1));
        std::fs::remove_dir(persist::temp_path(&path)).ok();
    }

    #[test]
    fn unreadable_file_starts_memory_only() {
        let blocker = scratch();
        std::fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("cache.jsonl");

        let cache: ResultCache<u32> = ResultCache::with_persistence(clock(), &path);
        assert!(!cache.is_persistent());
        assert!(cache.is_empty());
        std::fs::remove_file(&blocker).ok();
    }

    #[test]
    fn memory_only_cache_never_touches_disk() {
        let cache: ResultCache<u32> = ResultCache::new(clock());
        assert!(!cache.is_persistent());
        assert_eq!(cache.save().unwrap(), 0);
        assert!(!cache.flush());
    }

    #[test]
    fn stopping_maintenance_flushes() {
        let path = scratch();
        let cache = Arc::new(ResultCache::with_persistence(clock(), &path));
        let handle = cache
            .start_maintenance(Duration::from_secs(3600), Duration::from_secs(3600))
            .unwrap();
        cache.set("k", 7u32, Duration::from_secs(60)).unwrap();
        handle.shutdown_and_join();

        let reloaded: ResultCache<u32> = ResultCache::with_persistence(clock(), &path);
        assert_eq!(reloaded.get("k"), Some(7));
        std::fs::remove_file(&path).ok();
    }
}
