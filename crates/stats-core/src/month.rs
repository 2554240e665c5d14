//! Fixed-width `YYYY-MM` month values and the window arithmetic built on them.
//!
//! A [`Month`] always renders zero padded, so the lexicographic order of its
//! string form equals chronological order. Persisted state relies on this:
//! month keys stored as strings sort correctly without being parsed.

use std::fmt;
use std::str::FromStr;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::error::StatsError;

/// One calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month {
    year: u16,
    month: u8,
}

impl Month {
    /// Earliest representable month.
    pub const MIN: Month = Month { year: 1, month: 1 };
    /// Latest representable month.
    pub const MAX: Month = Month {
        year: 9999,
        month: 12,
    };

    /// Build a month from its parts. Returns `None` when out of range.
    pub fn new(year: u16, month: u8) -> Option<Self> {
        if (1..=9999).contains(&year) && (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Month containing the given date.
    pub fn from_date(date: &impl Datelike) -> Option<Self> {
        let year = u16::try_from(date.year()).ok()?;
        Self::new(year, date.month() as u8)
    }

    /// Months elapsed since `0001-01`.
    fn index(&self) -> i64 {
        (i64::from(self.year) - 1) * 12 + i64::from(self.month) - 1
    }

    fn from_index(index: i64) -> Self {
        let clamped = index.clamp(Self::MIN.index(), Self::MAX.index());
        Self {
            year: (clamped / 12 + 1) as u16,
            month: (clamped % 12 + 1) as u8,
        }
    }

    /// Shift by `delta` months, saturating at [`Month::MIN`] / [`Month::MAX`].
    pub fn plus(&self, delta: i64) -> Self {
        Self::from_index(self.index() + delta)
    }

    /// `n` months earlier.
    pub fn minus(&self, n: u32) -> Self {
        self.plus(-i64::from(n))
    }

    /// Next month; December rolls over to January of the next year.
    pub fn succ(&self) -> Self {
        self.plus(1)
    }

    /// Previous month; January rolls back to December of the previous year.
    pub fn pred(&self) -> Self {
        self.plus(-1)
    }

    /// All months from `start` to `end`, both inclusive. Empty when
    /// `start > end`.
    pub fn range_inclusive(start: Month, end: Month) -> Vec<Month> {
        (start.index()..=end.index()).map(Self::from_index).collect()
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StatsError::InvalidMonth(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 7 || bytes[4] != b'-' {
            return Err(invalid());
        }
        let digits = |range: std::ops::Range<usize>| -> Option<u16> {
            let part = &s[range];
            if part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse().ok()
            } else {
                None
            }
        };
        let year = digits(0..4).ok_or_else(invalid)?;
        let month = digits(5..7).ok_or_else(invalid)?;
        Month::new(year, month as u8).ok_or_else(invalid)
    }
}

impl TryFrom<String> for Month {
    type Error = StatsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Month> for String {
    fn from(month: Month) -> Self {
        month.to_string()
    }
}

// ── Window ────────────────────────────────────────────────────────────────────

/// Inclusive range of months.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Month,
    pub end: Month,
}

impl Window {
    pub fn new(start: Month, end: Month) -> Self {
        Self { start, end }
    }

    /// A window covering exactly one month.
    pub fn single(month: Month) -> Self {
        Self::new(month, month)
    }
}

/// Months strictly after `latest` through `through`, inclusive.
///
/// With no `latest` (empty state) the range starts at `start`.
pub fn months_after(latest: Option<Month>, start: Month, through: Month) -> Vec<Month> {
    let first = match latest {
        Some(m) if m >= Month::MAX => return Vec::new(),
        Some(m) => m.succ(),
        None => start,
    };
    Month::range_inclusive(first, through)
}
