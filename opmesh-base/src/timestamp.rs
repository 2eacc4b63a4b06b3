//! Timestamps with a stable 12-byte big-endian wire form.

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A `(seconds, nanoseconds)` pair since the Unix epoch, totally ordered.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    /// Byte length of the wire form: 8 bytes seconds, 4 bytes nanos.
    pub const WIRE_LEN: usize = 12;

    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    pub const fn new(secs: u64, nanos: u32) -> Self {
        Timestamp { secs, nanos }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    pub fn to_bytes(self) -> [u8; Timestamp::WIRE_LEN] {
        let mut out = [0u8; Timestamp::WIRE_LEN];
        out[..8].copy_from_slice(&self.secs.to_be_bytes());
        out[8..].copy_from_slice(&self.nanos.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Timestamp::WIRE_LEN {
            return None;
        }
        let secs = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let nanos = u32::from_be_bytes(bytes[8..12].try_into().ok()?);
        Some(Timestamp { secs, nanos })
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next_tick(self) -> Self {
        if self.nanos == 999_999_999 {
            Timestamp::new(self.secs + 1, 0)
        } else {
            Timestamp::new(self.secs, self.nanos + 1)
        }
    }

    pub fn saturating_sub_secs(self, secs: u64) -> Self {
        Timestamp::new(self.secs.saturating_sub(secs), self.nanos)
    }

    /// Start of the hour bucket containing `self`, and the start of the next.
    pub fn hour_bucket(self) -> (Timestamp, Timestamp) {
        let start = self.secs - self.secs % 3600;
        (Timestamp::new(start, 0), Timestamp::new(start + 3600, 0))
    }

    /// Start of the UTC day bucket containing `self`, and the start of the next.
    pub fn day_bucket(self) -> (Timestamp, Timestamp) {
        let start = self.secs - self.secs % 86_400;
        (Timestamp::new(start, 0), Timestamp::new(start + 86_400, 0))
    }

    /// Start of the UTC calendar month containing `self`, and the start of the
    /// next month.
    pub fn month_bucket(self) -> (Timestamp, Timestamp) {
        let dt = Utc.timestamp_opt(self.secs as i64, 0).single();
        let Some(dt) = dt else {
            return (Timestamp::ZERO, Timestamp::ZERO);
        };
        let start = Utc
            .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
            .single();
        let (ny, nm) = if dt.month() == 12 {
            (dt.year() + 1, 1)
        } else {
            (dt.year(), dt.month() + 1)
        };
        let next = Utc.with_ymd_and_hms(ny, nm, 1, 0, 0, 0).single();
        match (start, next) {
            (Some(s), Some(n)) => (
                Timestamp::new(s.timestamp() as u64, 0),
                Timestamp::new(n.timestamp() as u64, 0),
            ),
            _ => (Timestamp::ZERO, Timestamp::ZERO),
        }
    }

    /// Start of the UTC calendar year containing `self`, and the start of the
    /// next year.
    pub fn year_bucket(self) -> (Timestamp, Timestamp) {
        let dt = Utc.timestamp_opt(self.secs as i64, 0).single();
        let Some(dt) = dt else {
            return (Timestamp::ZERO, Timestamp::ZERO);
        };
        let start = Utc.with_ymd_and_hms(dt.year(), 1, 1, 0, 0, 0).single();
        let next = Utc.with_ymd_and_hms(dt.year() + 1, 1, 1, 0, 0, 0).single();
        match (start, next) {
            (Some(s), Some(n)) => (
                Timestamp::new(s.timestamp() as u64, 0),
                Timestamp::new(n.timestamp() as u64, 0),
            ),
            _ => (Timestamp::ZERO, Timestamp::ZERO),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// A source of timestamps. Injected so tests can drive time by hand.
pub trait Clock: Send + Sync + std::fmt::Debug + 'static {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
