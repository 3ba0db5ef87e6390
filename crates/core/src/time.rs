use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A point in time captured in a specific zone.
///
/// Holds the wall-clock (local) date-time together with the UTC offset of the
/// zone that produced it. Ordering, equality and deltas are computed on the
/// absolute instant, so two timestamps taken in different zones compare
/// correctly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(into = "DateTime<FixedOffset>", from = "DateTime<FixedOffset>")]
pub struct Timestamp {
    local: NaiveDateTime,
    offset: FixedOffset,
}

impl Timestamp {
    /// Current time in the system's local zone
    pub fn now() -> Self {
        Local::now().fixed_offset().into()
    }

    /// Current time in the given zone
    pub fn now_in(offset: FixedOffset) -> Self {
        Utc::now().with_timezone(&offset).into()
    }

    /// Wall-clock date-time as seen in the capturing zone
    pub fn local(&self) -> NaiveDateTime {
        self.local
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The absolute instant, in UTC
    pub fn instant(&self) -> DateTime<Utc> {
        let offset = TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        (self.local - offset).and_utc()
    }

    /// Signed delta from `earlier` to `self`
    pub fn signed_duration_since(&self, earlier: &Timestamp) -> TimeDelta {
        self.instant() - earlier.instant()
    }

    /// Absolute distance between two timestamps in milliseconds
    pub fn duration_ms(&self, other: &Timestamp) -> i64 {
        self.signed_duration_since(other).num_milliseconds().abs()
    }
}

impl From<DateTime<FixedOffset>> for Timestamp {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Self {
            local: value.naive_local(),
            offset: *value.offset(),
        }
    }
}

impl From<Timestamp> for DateTime<FixedOffset> {
    fn from(value: Timestamp) -> Self {
        value.instant().with_timezone(&value.offset)
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.instant() == other.instant()
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant().cmp(&other.instant())
    }
}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instant().hash(state);
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value: DateTime<FixedOffset> = (*self).into();
        write!(f, "{}", value.to_rfc3339())
    }
}
