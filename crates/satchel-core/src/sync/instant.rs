//! Comparable instants for sync bookkeeping.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// A point in time with millisecond precision.
///
/// Missing or unparsable timestamps collapse to [`SyncInstant::EPOCH`], so
/// they are never "newer" than anything that was actually recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncInstant(i64);

impl SyncInstant {
    pub const EPOCH: Self = Self(0);

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Parse an RFC 3339 string or a raw millisecond count.
    pub fn parse(raw: Option<&str>) -> Self {
        Self::try_parse(raw).unwrap_or(Self::EPOCH)
    }

    /// Like [`SyncInstant::parse`], but reports whether a value was present.
    ///
    /// Values before 1970 clamp to [`SyncInstant::EPOCH`]; nothing sorts below it.
    pub fn try_parse(raw: Option<&str>) -> Option<Self> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        let millis = match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => parsed.timestamp_millis(),
            Err(_) => raw.parse::<i64>().ok()?,
        };
        Some(Self(millis.max(0)))
    }

    pub fn to_rfc3339(self) -> String {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for SyncInstant {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.to_rfc3339())
    }
}

/// Source of "now" for the reconciler.
pub trait Clock: Send + Sync {
    fn now(&self) -> SyncInstant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SyncInstant {
        SyncInstant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_garbage_collapse_to_epoch() {
        assert_eq!(SyncInstant::parse(None), SyncInstant::EPOCH);
        assert_eq!(SyncInstant::parse(Some("")), SyncInstant::EPOCH);
        assert_eq!(SyncInstant::parse(Some("yesterday")), SyncInstant::EPOCH);
        assert!(SyncInstant::try_parse(Some("yesterday")).is_none());
    }

    #[test]
    fn parses_rfc3339_with_offsets() {
        let utc = SyncInstant::parse(Some("2024-05-01T10:00:00.250Z"));
        let offset = SyncInstant::parse(Some("2024-05-01T12:00:00.250+02:00"));
        assert_eq!(utc, offset);
        assert_eq!(utc.as_millis() % 1000, 250);
    }

    #[test]
    fn parses_raw_millis() {
        assert_eq!(
            SyncInstant::parse(Some("1714557600000")),
            SyncInstant::from_millis(1_714_557_600_000)
        );
    }

    #[test]
    fn rfc3339_round_trips() {
        let instant = SyncInstant::from_millis(1_714_557_600_123);
        let rendered = instant.to_rfc3339();
        assert_eq!(rendered, "2024-05-01T10:00:00.123Z");
        assert_eq!(SyncInstant::parse(Some(&rendered)), instant);
    }

    #[test]
    fn pre_epoch_values_clamp_to_epoch() {
        assert_eq!(SyncInstant::parse(Some("-5000")), SyncInstant::EPOCH);
        assert_eq!(
            SyncInstant::parse(Some("1969-07-20T20:17:00Z")),
            SyncInstant::EPOCH
        );
        assert_eq!(
            SyncInstant::try_parse(Some("-1")),
            Some(SyncInstant::EPOCH)
        );
    }

    #[test]
    fn epoch_is_older_than_everything_recorded() {
        assert!(SyncInstant::EPOCH < SyncInstant::from_millis(1));
    }
}
