//! Reset-time heuristics for rate-limit messages.
//!
//! Agent CLIs report throttling as free text. These helpers turn the common
//! shapes into a single delay estimate; each adapter decides which of them
//! apply to its tool.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Used when a limit is reported without any reset hint.
pub(crate) const DEFAULT_RESET: Duration = Duration::from_secs(60);

static DECIMAL_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:retry[- ]after|try again in|retry in|resets? in)[:\s]+(\d+(?:\.\d+)?)\s*(?:s\b|sec\b|secs\b|seconds?\b)")
        .expect("valid regex")
});

// `ms` and `millis` precede `m` in the alternations; the leftmost
// alternative wins, so `20ms` is never read as minutes.
static PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:try again in|retry in|resets? in|available in|wait)\s+((?:\d+(?:\.\d+)?\s*(?:hours?|hrs?|h|ms|millis(?:econds?)?|minutes?|mins?|m|seconds?|secs?|s)[\s,]*(?:and\s+)?)+)")
        .expect("valid regex")
});

static COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(hours?|hrs?|h|ms|millis(?:econds?)?|minutes?|mins?|m|seconds?|secs?|s)")
        .expect("valid regex")
});

/// `retry after 2.5s`, `try again in 12 seconds`.
pub(crate) fn decimal_seconds(text: &str) -> Option<Duration> {
    let caps = DECIMAL_SECONDS.captures(text)?;
    let secs: f64 = caps[1].parse().ok()?;
    positive(secs)
}

/// `try again in 1 hour 5 minutes`, `resets in 2m30s`, `try again in 20ms`.
pub(crate) fn duration_phrase(text: &str) -> Option<Duration> {
    let caps = PHRASE.captures(text)?;
    let mut secs = 0.0;
    for part in COMPONENT.captures_iter(&caps[1]) {
        let value: f64 = part[1].parse().ok()?;
        let unit = part[2].to_ascii_lowercase();
        secs += match unit.as_str() {
            u if u.starts_with('h') => value * 3600.0,
            u if u == "ms" || u.starts_with("milli") => value / 1000.0,
            u if u.starts_with('m') => value * 60.0,
            _ => value,
        };
    }
    positive(secs)
}

/// First matching estimate, or `fallback` when the text has no hint.
pub(crate) fn reset_estimate(text: &str, fallback: Duration) -> Duration {
    decimal_seconds(text)
        .or_else(|| duration_phrase(text))
        .unwrap_or(fallback)
}

/// The line containing the first match of `re`, trimmed, as the raw message.
pub(crate) fn matched_line(text: &str, re: &Regex) -> Option<String> {
    text.lines()
        .find(|line| re.is_match(line))
        .map(|line| line.trim().to_string())
}

fn positive(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_seconds_variants() {
        assert_eq!(
            decimal_seconds("Rate limited. Retry after 2.5s"),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            decimal_seconds("Please try again in 12 seconds."),
            Some(Duration::from_secs(12))
        );
        assert_eq!(decimal_seconds("retry-after: 30 sec"), Some(Duration::from_secs(30)));
        assert_eq!(decimal_seconds("no hint here"), None);
    }

    #[test]
    fn duration_phrases() {
        assert_eq!(
            duration_phrase("Usage limit reached, try again in 1 hour 5 minutes"),
            Some(Duration::from_secs(3900))
        );
        assert_eq!(
            duration_phrase("limit resets in 2m30s"),
            Some(Duration::from_secs(150))
        );
        assert_eq!(
            duration_phrase("Please try again in 4h, 10 mins and 3 seconds"),
            Some(Duration::from_secs(4 * 3600 + 600 + 3))
        );
        assert_eq!(
            duration_phrase("Please try again in 20ms."),
            Some(Duration::from_millis(20))
        );
        assert_eq!(
            duration_phrase("retry in 1s 500 milliseconds"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            duration_phrase("resets in 1m500ms"),
            Some(Duration::from_millis(60_500))
        );
        assert_eq!(duration_phrase("wait for it"), None);
    }

    #[test]
    fn fallback_is_default() {
        assert_eq!(reset_estimate("429 Too Many Requests", DEFAULT_RESET), DEFAULT_RESET);
        assert_eq!(
            reset_estimate("429 Too Many Requests", Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(reset_estimate("retry after 7s", DEFAULT_RESET), Duration::from_secs(7));
    }

    #[test]
    fn zero_is_not_an_estimate() {
        assert_eq!(decimal_seconds("retry after 0s"), None);
    }
}
