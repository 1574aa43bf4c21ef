//! CacheEntry - 書き込んだら不変

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ports::elapsed_between;

/// One cached value.
///
/// Entries are shared as `Arc<CacheEntry<V>>` and never mutated; `set` on an
/// existing key stores a new entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Strictly older than `ttl`. An entry exactly `ttl` old is still fresh.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.created_at, now) > self.ttl
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.ttl.saturating_sub(elapsed_between(self.created_at, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn entry() -> CacheEntry<u8> {
        CacheEntry {
            key: "k".into(),
            value: 1,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            ttl: Duration::from_secs(60),
        }
    }

    #[rstest]
    #[case(0, false)]
    #[case(59, false)]
    #[case(60, false)]
    #[case(61, true)]
    fn expiry_is_strictly_after_ttl(#[case] age_secs: i64, #[case] expired: bool) {
        let e = entry();
        let now = e.created_at + chrono::Duration::seconds(age_secs);
        assert_eq!(e.is_expired(now), expired);
    }

    #[test]
    fn remaining_counts_down_to_zero() {
        let e = entry();
        assert_eq!(e.remaining(e.created_at + chrono::Duration::seconds(45)), Duration::from_secs(15));
        assert_eq!(e.remaining(e.created_at + chrono::Duration::seconds(90)), Duration::ZERO);
    }
}
