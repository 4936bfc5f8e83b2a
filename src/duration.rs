//! Human-readable durations for configuration values.

use std::time::Duration;

/// Parse a duration such as `75s`, `5m`, `500ms` or `2h`.
///
/// A bare number is taken as seconds.
///
/// # Examples
/// ```
/// use rapt_pill_mqtt::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("75s").unwrap(), Duration::from_secs(75));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be tried before "m" and "s"
    let units: [(&str, fn(u64) -> Duration); 4] = [
        ("ms", Duration::from_millis),
        ("h", |n| Duration::from_secs(n.saturating_mul(3600))),
        ("m", |n| Duration::from_secs(n.saturating_mul(60))),
        ("s", Duration::from_secs),
    ];

    let (number, to_duration) = units
        .iter()
        .find_map(|(suffix, to_duration)| {
            src.strip_suffix(suffix)
                .map(|number| (number.trim(), *to_duration))
        })
        .unwrap_or((src, Duration::from_secs as fn(u64) -> Duration));

    number
        .parse::<u64>()
        .map(to_duration)
        .map_err(|_| format!("invalid duration: {src}"))
}
