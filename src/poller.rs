//! Live poller: one per-line request for every known line, merged into a
//! single set of buses.
//!
//! A cycle walks its lines in order:
//!
//! ```text
//! Pending --request ok--> Merge --pause--> Pending ... --> Done
//!    |
//!    +--transient error--> Backoff --wait--> Pending (same line)
//! ```
//!
//! Lines already merged are never fetched again within the cycle. Transient
//! errors are retried without limit; the only way out of a stuck cycle is the
//! cancellation token, which ends it promptly with whatever was merged so far.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Pacing;
use crate::error::Result;
use crate::queries;
use crate::snapshot::{BusSnapshot, LineBuses};
use crate::stats::PollStats;
use crate::store::{BusId, EntityStore, LineId};
use crate::upstream::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    Short,
    Long,
}

/// The pause owed after `processed` lines have been merged: long after every
/// `burst_size`-th line, short otherwise.
pub fn pause_after(pacing: &Pacing, processed: usize) -> (Pause, Duration) {
    if processed > 0 && processed % pacing.burst_size.max(1) == 0 {
        (Pause::Long, pacing.long_pause)
    } else {
        (Pause::Short, pacing.short_pause)
    }
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// One snapshot per bus, ordered by bus id.
    pub buses: Vec<BusSnapshot>,
    /// `false` when the cycle was cancelled before every line was merged.
    pub complete: bool,
    pub stats: PollStats,
}

enum Phase {
    Pending,
    Merge(LineBuses),
    Backoff(Duration),
    Done,
}

pub struct LivePoller<'a, T: ?Sized> {
    transport: &'a T,
    store: &'a EntityStore,
    pacing: Pacing,
}

impl<'a, T: Transport + ?Sized> LivePoller<'a, T> {
    pub fn new(transport: &'a T, store: &'a EntityStore, pacing: Pacing) -> Self {
        Self {
            transport,
            store,
            pacing,
        }
    }

    /// Every line id the store knows about.
    pub fn known_lines(&self) -> Result<Vec<LineId>> {
        Ok(self.store.read(|t| t.line_ids())?)
    }

    /// Runs one cycle over `lines`. Duplicate ids are polled once.
    #[tracing::instrument(skip(self, lines, cancel), fields(lines = lines.len()))]
    pub async fn poll(&self, lines: &[LineId], cancel: &CancellationToken) -> Result<PollOutcome> {
        let mut pending: Vec<LineId> = Vec::with_capacity(lines.len());
        for line in lines {
            if !pending.contains(line) {
                pending.push(*line);
            }
        }

        let mut stats = PollStats::start(pending.len());
        let mut buses: BTreeMap<BusId, BusSnapshot> = BTreeMap::new();
        let mut next = 0;
        let mut phase = Phase::Pending;

        loop {
            phase = match phase {
                Phase::Pending if next == pending.len() => Phase::Done,
                Phase::Pending => {
                    let line = pending[next];
                    stats.requests += 1;
                    let result = tokio::select! {
                        result = queries::line_buses(self.transport, self.store, line) => result,
                        _ = cancel.cancelled() => return Ok(finish(buses, stats, false)),
                    };

                    match result {
                        Ok(line) => Phase::Merge(line),
                        Err(e) if e.is_transient() => {
                            let wait = if e.is_rate_limit() {
                                stats.cooldowns += 1;
                                self.pacing.cooldown
                            } else {
                                stats.backoffs += 1;
                                self.pacing.backoff
                            };
                            warn!(line, error = %e, wait_ms = wait.as_millis() as u64, "Line request failed, backing off");
                            Phase::Backoff(wait)
                        }
                        Err(e) => return Err(e),
                    }
                }
                Phase::Merge(line) => {
                    let added = merge(&mut buses, &line);
                    debug!(line = pending[next], added, total = buses.len(), "Line merged");
                    next += 1;
                    stats.lines_merged += 1;

                    let (kind, wait) = pause_after(&self.pacing, next);
                    match kind {
                        Pause::Short => stats.short_pauses += 1,
                        Pause::Long => stats.long_pauses += 1,
                    }
                    if !pause(wait, cancel).await {
                        return Ok(finish(buses, stats, false));
                    }
                    Phase::Pending
                }
                Phase::Backoff(wait) => {
                    if !pause(wait, cancel).await {
                        return Ok(finish(buses, stats, false));
                    }
                    Phase::Pending
                }
                Phase::Done => break,
            };
        }

        let outcome = finish(buses, stats, true);
        info!(
            buses = outcome.buses.len(),
            requests = outcome.stats.requests,
            retries = outcome.stats.failed_requests(),
            "Poll cycle complete"
        );
        Ok(outcome)
    }
}

/// Adds every bus not seen earlier in the cycle, walking the response in the
/// order it listed them. Returns how many were new.
fn merge(buses: &mut BTreeMap<BusId, BusSnapshot>, line: &LineBuses) -> usize {
    let before = buses.len();
    for snapshot in &line.observed {
        buses
            .entry(snapshot.id)
            .or_insert_with(|| snapshot.clone());
    }
    buses.len() - before
}

fn finish(buses: BTreeMap<BusId, BusSnapshot>, mut stats: PollStats, complete: bool) -> PollOutcome {
    if !complete {
        info!(merged = stats.lines_merged, of = stats.lines, "Poll cycle cancelled");
    }
    stats.buses = buses.len();
    stats.complete = complete;
    PollOutcome {
        buses: buses.into_values().collect(),
        complete,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::BusState;
    use crate::store::Bus;

    fn snapshot(id: BusId, line: LineId, state: BusState) -> BusSnapshot {
        let bus = Bus { id, line: Some(line), route: None };
        BusSnapshot::of(&bus, state)
    }

    #[test]
    fn test_pause_after_every_tenth_line_is_long() {
        let pacing = Pacing::default();
        let kinds: Vec<Pause> = (1..=20).map(|n| pause_after(&pacing, n).0).collect();
        for (i, kind) in kinds.iter().enumerate() {
            let expected = if (i + 1) % 10 == 0 { Pause::Long } else { Pause::Short };
            assert_eq!(*kind, expected, "after line {}", i + 1);
        }
        assert_eq!(pause_after(&pacing, 10).1, Duration::from_secs(10));
        assert_eq!(pause_after(&pacing, 3).1, Duration::from_secs(1));
    }

    #[test]
    fn test_merge_keeps_first_observation() {
        let line = LineBuses {
            observed: vec![
                snapshot(5, 42, BusState::AtStop),
                snapshot(5, 42, BusState::Moving),
                snapshot(6, 42, BusState::Moving),
            ],
            ..Default::default()
        };

        let mut buses = BTreeMap::new();
        assert_eq!(merge(&mut buses, &line), 2);
        assert_eq!(buses[&5].state, BusState::AtStop);
        assert_eq!(merge(&mut buses, &line), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(Duration::from_secs(3600), &cancel).await);
        assert!(pause(Duration::from_secs(1), &CancellationToken::new()).await);
    }
}
