//! Time bucketing: bucket sizes and window truncation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// A validated bucket size, parsed from labels like "1m", "10m", "1h", "1d".
/// Aggregation currently runs on one-minute buckets only, but rollups need
/// hour and day arithmetic so the type supports the general labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketSize {
    seconds: i64,
}

impl BucketSize {
    pub const MINUTE: Self = Self { seconds: 60 };
    pub const HOUR: Self = Self { seconds: 3_600 };
    pub const DAY: Self = Self { seconds: 86_400 };

    pub const fn seconds(self) -> i64 {
        self.seconds
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds)
    }

    /// Canonical label, e.g. "1m", "2h", "1d". Days win over hours win over
    /// minutes so "1d" never renders as "24h".
    pub fn label(self) -> String {
        if self.seconds % 86_400 == 0 {
            format!("{}d", self.seconds / 86_400)
        } else if self.seconds % 3_600 == 0 {
            format!("{}h", self.seconds / 3_600)
        } else if self.seconds % 60 == 0 {
            format!("{}m", self.seconds / 60)
        } else {
            format!("{}s", self.seconds)
        }
    }
}

impl fmt::Display for BucketSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Error)]
#[error("unsupported bucket size: {0:?}")]
pub struct ParseBucketSizeError(String);

impl FromStr for BucketSize {
    type Err = ParseBucketSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digits, unit_seconds) = match s.as_bytes().last() {
            Some(b's') => (&s[..s.len() - 1], 1),
            Some(b'm') => (&s[..s.len() - 1], 60),
            Some(b'h') => (&s[..s.len() - 1], 3_600),
            Some(b'd') => (&s[..s.len() - 1], 86_400),
            _ => return Err(ParseBucketSizeError(s.to_string())),
        };

        let count: i64 = digits
            .parse()
            .map_err(|_| ParseBucketSizeError(s.to_string()))?;
        if count <= 0 {
            return Err(ParseBucketSizeError(s.to_string()));
        }

        Ok(Self {
            seconds: count * unit_seconds,
        })
    }
}

/// Truncates a timestamp to its bucket boundary. This is the atomic unit of
/// aggregation storage: bucket_for(10:35:42, 1m) is 10:35:00.
///
/// Buckets align to the Unix epoch, which for minutes, hours, and days means
/// the natural UTC wall-clock boundaries.
pub fn bucket_for(ts: DateTime<Utc>, size: BucketSize) -> DateTime<Utc> {
    let seconds = ts.timestamp();
    let aligned = seconds - seconds.rem_euclid(size.seconds);
    DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
}
