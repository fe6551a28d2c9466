//! Formatting helpers for progress and timing messages.

use std::time::Duration;

/// Formats a number with thousand separators.
///
/// # Examples
///
/// ```
/// use abp_process::utilities::format_count;
///
/// assert_eq!(format_count(0), "0");
/// assert_eq!(format_count(1000), "1,000");
/// assert_eq!(format_count(1234567), "1,234,567");
/// ```
pub fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let len = digits.len();

    if len <= 3 {
        return digits;
    }

    let mut result = String::with_capacity(len + (len - 1) / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Formats an elapsed time as `Xh Ym Z.ZZZs`.
///
/// Hours are only shown when non-zero, minutes when hours or minutes are
/// non-zero. Seconds keep millisecond precision, since most index builds
/// and small copies finish in under a second.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use abp_process::utilities::format_elapsed;
///
/// assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.500s");
/// assert_eq!(format_elapsed(Duration::from_secs(3665)), "1h 1m 5.000s");
/// ```
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_seconds = elapsed.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = elapsed.subsec_millis();

    let mut parts = Vec::new();

    if hours > 0 {
        parts.push(format!("{hours}h"));
    }

    if minutes > 0 || hours > 0 {
        parts.push(format!("{minutes}m"));
    }

    parts.push(format!("{seconds}.{millis:03}s"));

    parts.join(" ")
}
