use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::month::Month;

// ── System timezone detection ─────────────────────────────────────────────────

/// Detect the IANA timezone name of the running system.
///
/// Falls back to `"UTC"` if detection fails.
pub fn get_system_timezone() -> String {
    iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
}

/// Parse an IANA timezone name, falling back to UTC with a warning.
pub fn resolve_timezone(tz_name: &str) -> Tz {
    tz_name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(
            "unrecognised timezone \"{}\", falling back to UTC",
            tz_name
        );
        Tz::UTC
    })
}

// ── Anchor month ──────────────────────────────────────────────────────────────

/// Calendar month containing `now` as seen from `tz`.
pub fn month_at(now: DateTime<Utc>, tz: Tz) -> Month {
    let local = now.with_timezone(&tz);
    // chrono years are always within Month's range for realistic clocks.
    Month::from_date(&local).unwrap_or(Month::MAX)
}

/// The current calendar month in the named timezone.
pub fn current_month(tz_name: &str) -> Month {
    month_at(Utc::now(), resolve_timezone(tz_name))
}
