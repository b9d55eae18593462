//! Cadence parsing and scheduling jitter.

use std::time::{Duration, Instant};

use chrono::TimeDelta;
use rand::Rng;

/// Default poll cadence for items.
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_secs(60);

/// Default cadence for discovery rules.
pub const DEFAULT_DISCOVERY_DELAY: Duration = Duration::from_secs(3600);

const MAX_JITTER: Duration = Duration::from_secs(30);

/// Parse a template delay expression.
///
/// Only the part before the first `;` is considered (flexible and scheduling
/// intervals are ignored). A bare integer is seconds, anything else goes
/// through humantime (`30s`, `5m`, `1h`, `1d`, `1h30m`). Empty, zero or
/// unparsable values fall back to `default`.
pub fn parse_delay(expr: &str, default: Duration) -> Duration {
    let first = expr.split(';').next().unwrap_or("").trim();
    if first.is_empty() {
        return default;
    }

    let parsed = match first.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(first).ok(),
    };

    match parsed {
        Some(d) if !d.is_zero() => d,
        _ => {
            tracing::debug!(delay = first, "Unparsable delay, using default");
            default
        }
    }
}

/// `min(d / 100, 30s)`, zero for a zero cadence.
pub fn jitter_magnitude(cadence: Duration) -> Duration {
    if cadence.is_zero() {
        return Duration::ZERO;
    }
    (cadence / 100).min(MAX_JITTER)
}

/// A uniformly distributed offset in `[-magnitude, +magnitude)`.
pub fn jitter(cadence: Duration) -> TimeDelta {
    let magnitude = jitter_magnitude(cadence).as_nanos() as i64;
    if magnitude == 0 {
        return TimeDelta::zero();
    }
    let nanos = rand::thread_rng().gen_range(-magnitude..magnitude);
    TimeDelta::nanoseconds(nanos)
}

/// Shift an instant by a signed offset, saturating at `base` when the
/// subtraction would underflow the clock.
pub fn offset(base: Instant, delta: TimeDelta) -> Instant {
    match delta.to_std() {
        Ok(forward) => base + forward,
        Err(_) => {
            let back = (-delta).to_std().unwrap_or_default();
            base.checked_sub(back).unwrap_or(base)
        }
    }
}

/// `now + jitter(cadence)`.
pub fn jittered(now: Instant, cadence: Duration) -> Instant {
    offset(now, jitter(cadence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_forms() {
        let d = DEFAULT_ITEM_DELAY;
        assert_eq!(parse_delay("", d), d);
        assert_eq!(parse_delay("30", d), Duration::from_secs(30));
        assert_eq!(parse_delay("5m", d), Duration::from_secs(300));
        assert_eq!(parse_delay("1h", d), Duration::from_secs(3600));
        assert_eq!(parse_delay("1d", d), Duration::from_secs(86400));
        assert_eq!(parse_delay("3m;wd1-5h9-18", d), Duration::from_secs(180));
        assert_eq!(parse_delay("{$UNSET}", d), d);
        assert_eq!(parse_delay("0", d), d);
    }

    #[test]
    fn discovery_default_is_an_hour() {
        assert_eq!(parse_delay("", DEFAULT_DISCOVERY_DELAY), Duration::from_secs(3600));
    }

    #[test]
    fn magnitude_is_capped() {
        assert_eq!(jitter_magnitude(Duration::ZERO), Duration::ZERO);
        assert_eq!(jitter_magnitude(Duration::from_secs(60)), Duration::from_millis(600));
        assert_eq!(jitter_magnitude(Duration::from_secs(3600)), Duration::from_secs(30));
        assert_eq!(jitter_magnitude(Duration::from_secs(86400)), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for cadence in [
            Duration::from_millis(1),
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::from_secs(7 * 86400),
        ] {
            let m = TimeDelta::from_std(jitter_magnitude(cadence)).unwrap();
            for _ in 0..500 {
                let j = jitter(cadence);
                assert!(j >= -m, "{j:?} below -{m:?}");
                if m.is_zero() {
                    assert!(j.is_zero());
                } else {
                    assert!(j < m, "{j:?} not below {m:?}");
                }
            }
        }
    }

    #[test]
    fn offset_moves_both_ways() {
        let now = Instant::now();
        assert_eq!(offset(now, TimeDelta::seconds(2)), now + Duration::from_secs(2));
        let back = offset(now, TimeDelta::milliseconds(-5));
        assert!(back <= now);
    }
}
