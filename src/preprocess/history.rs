use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-item observations used by change and discard steps, keyed by
/// `agent|key`. Entries are created lazily and never expire.
#[derive(Default)]
pub struct History {
    numeric: Mutex<HashMap<String, (f64, Instant)>>,
    emitted: Mutex<HashMap<String, (String, Instant)>>,
}

impl History {
    /// Record `value` and return the previous observation, if any.
    pub fn swap(&self, key: &str, value: f64, at: Instant) -> Option<(f64, Instant)> {
        self.numeric.lock().insert(key.to_string(), (value, at))
    }

    /// True when `text` equals the last emitted value and, with a heartbeat,
    /// the heartbeat has not elapsed yet. Otherwise `text` becomes the last
    /// emitted value.
    pub fn unchanged(&self, key: &str, text: &str, at: Instant, heartbeat: Option<Duration>) -> bool {
        let mut emitted = self.emitted.lock();
        if let Some((last, last_at)) = emitted.get(key) {
            let within_heartbeat = match heartbeat {
                Some(hb) => at.saturating_duration_since(*last_at) < hb,
                None => true,
            };
            if last == text && within_heartbeat {
                return true;
            }
        }
        emitted.insert(key.to_string(), (text.to_string(), at));
        false
    }

    /// Number of items with numeric history.
    pub fn len(&self) -> usize {
        self.numeric.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_previous() {
        let history = History::default();
        let t0 = Instant::now();
        assert!(history.swap("a|k", 1.0, t0).is_none());
        assert_eq!(history.swap("a|k", 2.0, t0).map(|(v, _)| v), Some(1.0));
        assert_eq!(history.len(), 1);
    }
}
