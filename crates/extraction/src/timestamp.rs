use chrono::{DateTime, Duration, Utc};

/// A monotonic wall-clock value with microsecond resolution, totally ordered,
/// and round-trippable through a canonical string form.
///
/// `Timestamp::VERY_OLD` is a sentinel strictly less than any timestamp a real
/// message could carry, used to seed queues and the scheduler's virtual clock
/// before anything has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Less than any timestamp a real message can carry.
    pub const VERY_OLD: Timestamp = Timestamp(DateTime::<Utc>::MIN_UTC);

    pub fn new(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn checked_add(&self, d: Duration) -> Option<Self> {
        self.0.checked_add_signed(d).map(Self)
    }

    /// Saturates to `VERY_OLD`/the far future rather than panicking; the
    /// scheduler adds biases and durations too often for this to be a hard error.
    pub fn saturating_add(&self, d: Duration) -> Self {
        self.checked_add(d).unwrap_or(if d < Duration::zero() {
            Self::VERY_OLD
        } else {
            Timestamp(DateTime::<Utc>::MAX_UTC)
        })
    }

    pub fn inner(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::ops::Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0 - rhs.0
    }
}

/// Canonical string form, e.g. `2024-03-05T12:30:00.123456Z`. This is the
/// on-disk representation used both for the queue state file's `time` field
/// and as the map keys under `acked`.
impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.6fZ"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid canonical timestamp '{0}'")]
pub struct ParseTimestampError(String);

impl std::str::FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Timestamp(dt.with_timezone(&Utc)))
            .map_err(|_| ParseTimestampError(s.to_string()))
    }
}

impl serde::Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        let t = Timestamp::new(
            "2024-03-05T12:30:00.123456Z"
                .parse::<DateTime<Utc>>()
                .unwrap(),
        );
        let s = t.to_string();
        assert_eq!(s, "2024-03-05T12:30:00.123456Z");
        assert_eq!(s.parse::<Timestamp>().unwrap(), t);
    }

    #[test]
    fn very_old_is_less_than_anything_real() {
        let real = Timestamp::new("1970-01-01T00:00:00Z".parse().unwrap());
        assert!(Timestamp::VERY_OLD < real);
    }

    #[test]
    fn ordering_is_total() {
        let a = Timestamp::new("2020-01-01T00:00:00Z".parse().unwrap());
        let b = Timestamp::new("2020-01-01T00:00:00.000001Z".parse().unwrap());
        assert!(a < b);
    }
}
