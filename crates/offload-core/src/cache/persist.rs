//! JSON Lines のキャッシュファイル
//!
//! 1 行に 1 つの `PersistedEntry`。保存は `<path>.tmp` に書いて sync し、
//! `<path>` に rename する。クラッシュしても古いファイルか新しいファイルの
//! どちらかが残る。
//!
//! 時刻は秒単位。`created_at_epoch` は切り捨て、`ttl_seconds` はその切り捨てた
//! 時刻から本来の失効時刻までを切り上げで数える。読み戻したエントリの失効は
//! 元の時刻ちょうどか 1 秒未満遅く、早まることはない。

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use super::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry<V> {
    pub key: String,
    pub value: V,
    pub ttl_seconds: u64,
    pub created_at_epoch: i64,
}

impl<V: Clone> PersistedEntry<V> {
    pub fn from_entry(entry: &CacheEntry<V>) -> Self {
        let lifetime = entry.ttl.as_nanos() + u128::from(entry.created_at.timestamp_subsec_nanos());
        let ttl_seconds = u64::try_from(lifetime.div_ceil(1_000_000_000)).unwrap_or(u64::MAX);
        Self {
            key: entry.key.clone(),
            value: entry.value.clone(),
            ttl_seconds,
            created_at_epoch: entry.created_at.timestamp(),
        }
    }
}

impl<V> PersistedEntry<V> {
    /// `None` for records that cannot become a valid entry.
    pub fn into_entry(self) -> Option<CacheEntry<V>> {
        if self.ttl_seconds == 0 {
            return None;
        }
        let created_at = DateTime::<Utc>::from_timestamp(self.created_at_epoch, 0)?;
        Some(CacheEntry {
            key: self.key,
            value: self.value,
            created_at,
            ttl: Duration::from_secs(self.ttl_seconds),
        })
    }
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Atomically replace `path` with `entries`.
pub(crate) fn write_entries<V: Serialize>(path: &Path, entries: &[PersistedEntry<V>]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let tmp = temp_path(path);
    let file = File::create(&tmp).map_err(io_error(&tmp))?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        serde_json::to_writer(&mut writer, entry).map_err(|source| PersistenceError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        writer.write_all(b"\n").map_err(io_error(&tmp))?;
    }
    let file = writer.into_inner().map_err(|e| io_error(&tmp)(e.into_error()))?;
    file.sync_all().map_err(io_error(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_error(path))
}

/// Records read from `path`, plus the decode errors of skipped lines.
/// A missing file reads as empty.
pub(crate) fn read_entries<V: DeserializeOwned>(
    path: &Path,
) -> Result<(Vec<PersistedEntry<V>>, Vec<PersistenceError>), PersistenceError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
        Err(e) => return Err(io_error(path)(e)),
    };

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error(path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(source) => skipped.push(PersistenceError::Decode {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            }),
        }
    }
    Ok((records, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("offload-{name}-{}.jsonl", ulid::Ulid::new()))
    }

    #[test]
    fn ttl_rounds_up_and_zero_ttl_is_rejected() {
        let entry = CacheEntry {
            key: "k".to_string(),
            value: 1u8,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ttl: Duration::from_millis(1500),
        };
        let persisted = PersistedEntry::from_entry(&entry);
        assert_eq!(persisted.ttl_seconds, 2);
        assert_eq!(persisted.created_at_epoch, entry.created_at.timestamp());

        let zero = PersistedEntry {
            ttl_seconds: 0,
            ..persisted
        };
        assert!(zero.into_entry().is_none());
    }

    #[test]
    fn reloaded_expiry_is_never_earlier_than_the_original() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::TimeDelta::milliseconds(700);
        let entry = CacheEntry {
            key: "k".to_string(),
            value: 1u8,
            created_at,
            ttl: Duration::from_secs(10),
        };
        let persisted = PersistedEntry::from_entry(&entry);
        assert_eq!(persisted.created_at_epoch, created_at.timestamp());
        assert_eq!(persisted.ttl_seconds, 11);

        let reloaded = persisted.into_entry().unwrap();
        let original_expiry = created_at + chrono::TimeDelta::seconds(10);
        let reloaded_expiry = reloaded.created_at + chrono::TimeDelta::seconds(11);
        assert!(reloaded_expiry >= original_expiry);
        assert!(reloaded_expiry - original_expiry < chrono::TimeDelta::seconds(1));
    }

    #[test]
    fn malformed_lines_are_skipped_and_reported() {
        let path = scratch("malformed");
        fs::write(
            &path,
            "{\"key\":\"a\",\"value\":1,\"ttl_seconds\":10,\"created_at_epoch\":0}\nnot json\n\n",
        )
        .unwrap();

        let (records, skipped) = read_entries::<u32>(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
        assert!(matches!(skipped.as_slice(), [PersistenceError::Decode { line: 2, .. }]));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let (records, skipped) = read_entries::<u32>(&scratch("missing")).unwrap();
        assert!(records.is_empty());
        assert!(skipped.is_empty());
    }

    #[test]
    fn write_leaves_no_temp_file_behind() {
        let path = scratch("atomic");
        let entries = vec![PersistedEntry {
            key: "k".to_string(),
            value: "v".to_string(),
            ttl_seconds: 5,
            created_at_epoch: 1_700_000_000,
        }];
        write_entries(&path, &entries).unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
        let (records, _) = read_entries::<String>(&path).unwrap();
        assert_eq!(records, entries);
        fs::remove_file(&path).ok();
    }
}
