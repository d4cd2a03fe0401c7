use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters for one live poll cycle, written as one CSV row.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PollStats {
    pub timestamp: DateTime<Utc>,
    pub lines: usize,
    pub lines_merged: usize,
    pub requests: usize,

    // pacing
    pub short_pauses: usize,
    pub long_pauses: usize,
    pub backoffs: usize,
    pub cooldowns: usize,

    pub buses: usize,
    pub complete: bool,
}

impl PollStats {
    pub fn start(lines: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            lines,
            ..Default::default()
        }
    }

    /// Requests that did not produce a merged line.
    pub fn failed_requests(&self) -> usize {
        self.requests.saturating_sub(self.lines_merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_requests() {
        let stats = PollStats {
            requests: 12,
            lines_merged: 10,
            ..PollStats::start(10)
        };
        assert_eq!(stats.failed_requests(), 2);
        assert!(!stats.complete);
    }
}
