/// Format a count with French digit grouping (a space every three digits).
///
/// # Examples
///
/// ```
/// use stats_core::formatting::format_count;
///
/// assert_eq!(format_count(0), "0");
/// assert_eq!(format_count(999), "999");
/// assert_eq!(format_count(1234567), "1 234 567");
/// ```
pub fn format_count(value: u64) -> String {
    group_thousands(&value.to_string(), ' ')
}

/// Percentage change from `previous` to `current`.
///
/// Returns exactly `0.0` when `previous` is zero, so entities with no prior
/// activity show no trend rather than an undefined value.
///
/// # Examples
///
/// ```
/// use stats_core::formatting::trend_percent;
///
/// assert_eq!(trend_percent(300, 200), 50.0);
/// assert_eq!(trend_percent(10, 0), 0.0);
/// assert_eq!(trend_percent(50, 100), -50.0);
/// ```
pub fn trend_percent(current: u64, previous: u64) -> f64 {
    if previous == 0 {
        return 0.0;
    }
    (current as f64 - previous as f64) / previous as f64 * 100.0
}

fn group_thousands(digits: &str, separator: char) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(ch);
    }
    out
}
