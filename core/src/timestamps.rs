use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Raw values at or above this magnitude are epoch milliseconds, below it seconds.
/// 10^11 seconds is past the year 5000; 10^11 milliseconds is March 1973.
pub const MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochUnit {
    Seconds,
    Milliseconds,
}

pub fn detect_unit(raw: i64) -> EpochUnit {
    if raw.unsigned_abs() >= MILLIS_THRESHOLD.unsigned_abs() {
        EpochUnit::Milliseconds
    } else {
        EpochUnit::Seconds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Timestamp {
    /// Null or zero in the source.
    Unknown,
    /// A value chrono cannot place on the calendar. Shown as unknown; the raw
    /// integer is kept for the diagnostic.
    Invalid(i64),
    At(DateTime<Utc>),
}

impl Timestamp {
    pub fn from_raw(raw: Option<i64>) -> Self {
        let raw = match raw {
            None | Some(0) => return Timestamp::Unknown,
            Some(raw) => raw,
        };
        let instant = match detect_unit(raw) {
            EpochUnit::Seconds => DateTime::from_timestamp(raw, 0),
            EpochUnit::Milliseconds => DateTime::from_timestamp_millis(raw),
        };
        match instant {
            Some(at) => Timestamp::At(at),
            None => Timestamp::Invalid(raw),
        }
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::At(at) => Some(*at),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Timestamp::At(_))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Unknown | Timestamp::Invalid(_) => write!(f, "unknown"),
            Timestamp::At(at) => write!(f, "{}", at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}
