//! IMF-fixdate formatting (RFC 7231 section 7.1.1.1).

#[cfg(test)]
#[path = "date_tests.rs"]
mod tests;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Formats a timestamp as an IMF-fixdate, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
///
/// Times before the epoch are clamped to the epoch.
#[must_use]
pub fn format_http_date(time: SystemTime) -> String {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let days = since_epoch / 86400;
    let second_of_day = since_epoch % 86400;
    let (year, month, day) = civil_from_days(days as i64);
    // The epoch was a Thursday.
    let weekday = DAY_NAMES[((days + 3) % 7) as usize];
    format!(
        "{weekday}, {day:02} {month} {year} {:02}:{:02}:{:02} GMT",
        second_of_day / 3600,
        (second_of_day / 60) % 60,
        second_of_day % 60,
        month = MONTH_NAMES[month - 1],
    )
}

/// Converts days since the epoch to a civil date.
fn civil_from_days(days: i64) -> (i64, usize, u32) {
    let days = days + 719_468;
    let era = days.div_euclid(146_097);
    let day_of_era = days.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let year = year_of_era + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as usize;
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}
