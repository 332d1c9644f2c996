use chrono::{DateTime, Utc};
use service_graph_core::TimeRange;
use std::{fmt, time::Duration};

/// Identifies the data held by a cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub cluster: String,
    pub window: Window,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Window {
    /// Absolute bounds, in seconds since the Unix epoch.
    Fixed { from: i64, to: i64 },

    /// Offsets in seconds before the time the data is gathered. The data behind a relative key
    /// moves with the clock and is refreshed while it is being polled.
    Relative { start: i64, end: i64 },
}

// === impl CacheKey ===

impl CacheKey {
    /// Relative offsets are rounded to the nearest multiple of `quantum` so that requests issued
    /// moments apart share an entry.
    pub fn new(cluster: &str, range: &TimeRange, quantum: Duration) -> Self {
        let window = match range.now {
            None => Window::Fixed {
                from: range.from.timestamp(),
                to: range.to.timestamp(),
            },
            Some(now) => {
                let q = quantum.as_secs().max(1) as i64;
                let offset = |t: DateTime<Utc>| {
                    let ms = (now - t).num_milliseconds();
                    (ms + q * 500).div_euclid(q * 1000) * q
                };
                Window::Relative {
                    start: offset(range.from),
                    end: offset(range.to),
                }
            }
        };
        Self {
            cluster: cluster.to_string(),
            window,
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self.window, Window::Relative { .. })
    }

    /// The bounds of the data to gather for this key at `now`.
    pub fn time_range(&self, now: DateTime<Utc>) -> TimeRange {
        let (from, to) = match self.window {
            Window::Fixed { from, to } => (
                DateTime::from_timestamp(from, 0).unwrap_or_default(),
                DateTime::from_timestamp(to, 0).unwrap_or_default(),
            ),
            Window::Relative { start, end } => (
                now - chrono::Duration::seconds(start),
                now - chrono::Duration::seconds(end),
            ),
        };
        TimeRange {
            from,
            to,
            now: None,
        }
    }

    /// The end of a fixed window. Relative windows never settle.
    pub(crate) fn fixed_end(&self) -> Option<DateTime<Utc>> {
        match self.window {
            Window::Fixed { to, .. } => DateTime::from_timestamp(to, 0),
            Window::Relative { .. } => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window {
            Window::Fixed { from, to } => write!(f, "{}/{from}..{to}", self.cluster),
            Window::Relative { start, end } => {
                write!(f, "{}/now-{start}s..now-{end}s", self.cluster)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp must parse")
    }

    fn relative(now: &str, from: &str, to: &str) -> TimeRange {
        TimeRange {
            from: at(from),
            to: at(to),
            now: Some(at(now)),
        }
    }

    #[test]
    fn fixed_keys_ignore_the_clock() {
        let range = TimeRange {
            from: at("2026-01-01T10:00:00Z"),
            to: at("2026-01-01T10:15:00Z"),
            now: None,
        };
        let key = CacheKey::new("c1", &range, Duration::from_secs(1));
        assert!(!key.is_relative());
        assert_eq!(key.time_range(at("2030-01-01T00:00:00Z")), range);
        assert_eq!(key.fixed_end(), Some(at("2026-01-01T10:15:00Z")));
        assert_eq!(key.to_string(), "c1/1767261600..1767262500");
    }

    #[test]
    fn relative_keys_round_to_the_quantum() {
        let q = Duration::from_secs(1);
        let a = CacheKey::new(
            "c1",
            &relative(
                "2026-01-01T10:15:00Z",
                "2026-01-01T10:00:00Z",
                "2026-01-01T10:15:00Z",
            ),
            q,
        );
        let b = CacheKey::new(
            "c1",
            &relative(
                "2026-01-01T10:15:00.300Z",
                "2026-01-01T10:00:00Z",
                "2026-01-01T10:15:00Z",
            ),
            q,
        );
        assert_eq!(a, b);
        assert_eq!(
            a.window,
            Window::Relative {
                start: 900,
                end: 0
            }
        );
        assert_eq!(a.to_string(), "c1/now-900s..now-0s");

        let coarse = CacheKey::new(
            "c1",
            &relative(
                "2026-01-01T10:15:20Z",
                "2026-01-01T10:00:00Z",
                "2026-01-01T10:15:00Z",
            ),
            Duration::from_secs(60),
        );
        assert_eq!(
            coarse.window,
            Window::Relative {
                start: 900,
                end: 0
            }
        );
    }

    #[test]
    fn relative_ranges_move_with_the_clock() {
        let key = CacheKey::new(
            "c1",
            &relative(
                "2026-01-01T10:15:00Z",
                "2026-01-01T10:00:00Z",
                "2026-01-01T10:10:00Z",
            ),
            Duration::from_secs(1),
        );
        assert_eq!(key.fixed_end(), None);
        let range = key.time_range(at("2026-01-01T12:00:00Z"));
        assert_eq!(range.from, at("2026-01-01T11:45:00Z"));
        assert_eq!(range.to, at("2026-01-01T11:55:00Z"));
        assert_eq!(range.now, None);
    }

    #[test]
    fn clusters_are_distinct() {
        let range = relative(
            "2026-01-01T10:15:00Z",
            "2026-01-01T10:00:00Z",
            "2026-01-01T10:15:00Z",
        );
        assert_ne!(
            CacheKey::new("c1", &range, Duration::from_secs(1)),
            CacheKey::new("c2", &range, Duration::from_secs(1))
        );
    }
}
