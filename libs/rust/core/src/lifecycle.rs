//! Round state machines for both sides of the protocol.
//!
//! Coordinator, per index:
//! `Idle -> RoundStarted(r) -> AwaitingQuorum -> Aggregating -> RoundStarted(r+1) -> ... -> Done`
//!
//! Follower, per index:
//! `WaitRound(r) -> Train -> Publish -> WaitRound(r+1) -> ...` until stopped.
//!
//! Trackers keep the time spent in each phase for status reporting.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase { Idle, RoundStarted, AwaitingQuorum, Aggregating, Done }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowerPhase { Resuming, WaitRound, Train, Publish, Stopped }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: RoundPhase,
    pub to: RoundPhase,
}

#[derive(Debug)]
pub struct RoundTracker {
    phase: RoundPhase,
    round: u64,
    phase_started_at: Instant,
    last_durations: Vec<(RoundPhase, Duration)>,
}

impl Default for RoundTracker {
    fn default() -> Self { Self::new() }
}

impl RoundTracker {
    pub fn new() -> Self {
        Self { phase: RoundPhase::Idle, round: 0, phase_started_at: Instant::now(), last_durations: Vec::new() }
    }

    pub fn phase(&self) -> RoundPhase { self.phase }
    pub fn round(&self) -> u64 { self.round }
    pub fn durations(&self) -> &[(RoundPhase, Duration)] { &self.last_durations }

    fn allowed(from: RoundPhase, to: RoundPhase) -> bool {
        use RoundPhase::*;
        matches!(
            (from, to),
            (Idle | Done | Aggregating, RoundStarted)
                | (RoundStarted, AwaitingQuorum)
                | (AwaitingQuorum, Aggregating)
                | (Aggregating, AwaitingQuorum)
                | (Aggregating | AwaitingQuorum | RoundStarted, Done)
                | (_, Idle)
        )
    }

    fn enter(&mut self, to: RoundPhase) -> Result<(), InvalidTransition> {
        if !Self::allowed(self.phase, to) {
            return Err(InvalidTransition { from: self.phase, to });
        }
        let now = Instant::now();
        if to == RoundPhase::RoundStarted {
            self.last_durations.clear();
        }
        self.last_durations.push((self.phase, now - self.phase_started_at));
        self.phase = to;
        self.phase_started_at = now;
        Ok(())
    }

    /// Called once the round's announcement is committed.
    pub fn round_started(&mut self, round: u64) -> Result<(), InvalidTransition> {
        self.enter(RoundPhase::RoundStarted)?;
        self.round = round;
        Ok(())
    }

    pub fn awaiting_quorum(&mut self) -> Result<(), InvalidTransition> { self.enter(RoundPhase::AwaitingQuorum) }
    pub fn aggregating(&mut self) -> Result<(), InvalidTransition> { self.enter(RoundPhase::Aggregating) }
    pub fn done(&mut self) -> Result<(), InvalidTransition> { self.enter(RoundPhase::Done) }

    /// Session ended early (stop flag or deadline); keeps the last round.
    pub fn idle(&mut self) { let _ = self.enter(RoundPhase::Idle); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_cycle() {
        let mut t = RoundTracker::new();
        assert_eq!(t.phase(), RoundPhase::Idle);
        t.round_started(1).unwrap();
        t.awaiting_quorum().unwrap();
        t.aggregating().unwrap();
        t.round_started(2).unwrap();
        assert_eq!(t.round(), 2);
        t.awaiting_quorum().unwrap();
        t.aggregating().unwrap();
        t.done().unwrap();
        assert_eq!(t.phase(), RoundPhase::Done);
        assert!(!t.durations().is_empty());
    }

    #[test]
    fn failed_aggregation_returns_to_polling() {
        let mut t = RoundTracker::new();
        t.round_started(1).unwrap();
        t.awaiting_quorum().unwrap();
        t.aggregating().unwrap();
        t.awaiting_quorum().unwrap();
        assert_eq!(t.phase(), RoundPhase::AwaitingQuorum);
    }

    #[test]
    fn rejects_skipping_quorum() {
        let mut t = RoundTracker::new();
        t.round_started(1).unwrap();
        assert_eq!(t.aggregating(), Err(InvalidTransition { from: RoundPhase::RoundStarted, to: RoundPhase::Aggregating }));
        t.idle();
        assert_eq!(t.phase(), RoundPhase::Idle);
        assert_eq!(t.round(), 1);
    }
}
