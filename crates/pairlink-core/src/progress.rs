//! Pairing progress telemetry.
//!
//! Observational only: nothing here influences the protocol.

use std::time::Duration;

use tokio::time::Instant;

use crate::lifecycle::PairingState;

/// Named phases of a pairing attempt, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairingPhase {
    Scanned,
    CreatingConnection,
    ReachingHost,
    DirectAttempt,
    RelayConnection,
    Authenticating,
}

impl PairingPhase {
    pub fn label(&self) -> &'static str {
        match self {
            PairingPhase::Scanned => "scanned",
            PairingPhase::CreatingConnection => "creating connection",
            PairingPhase::ReachingHost => "reaching host",
            PairingPhase::DirectAttempt => "direct attempt",
            PairingPhase::RelayConnection => "relay connection",
            PairingPhase::Authenticating => "authenticating",
        }
    }

    /// Phases this one may be entered from. `None` is the start.
    fn predecessors(&self) -> &'static [Option<PairingPhase>] {
        use PairingPhase::*;
        match self {
            Scanned => &[None],
            CreatingConnection => &[Some(Scanned)],
            ReachingHost => &[Some(CreatingConnection)],
            DirectAttempt => &[Some(ReachingHost)],
            RelayConnection => &[Some(ReachingHost), Some(DirectAttempt)],
            Authenticating => &[Some(ReachingHost), Some(DirectAttempt), Some(RelayConnection)],
        }
    }
}

impl std::fmt::Display for PairingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    Active,
    Completed,
    /// The attempt failed while this phase was active
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: PairingPhase,
    pub status: PhaseStatus,
    /// Set once the phase has ended
    pub elapsed: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOrderError {
    pub current: Option<PairingPhase>,
    pub next: PairingPhase,
}

impl std::fmt::Display for PhaseOrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let from = self.current.map(|p| p.label()).unwrap_or("start");
        write!(f, "cannot enter {} from {}", self.next, from)
    }
}

impl std::error::Error for PhaseOrderError {}

/// Records how long each phase of an attempt took.
#[derive(Debug, Default)]
pub struct StepTimer {
    records: Vec<PhaseRecord>,
    started_at: Option<Instant>,
}

impl StepTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently active phase, if any.
    pub fn current(&self) -> Option<PairingPhase> {
        self.records
            .last()
            .filter(|r| r.status == PhaseStatus::Active)
            .map(|r| r.phase)
    }

    fn last_phase(&self) -> Option<PairingPhase> {
        self.records.last().map(|r| r.phase)
    }

    /// Finish the active phase and start `next`. Returns the finished phase and
    /// its duration.
    pub fn enter(
        &mut self,
        next: PairingPhase,
    ) -> Result<Option<(PairingPhase, Duration)>, PhaseOrderError> {
        let current = self.current();
        let allowed = current.is_some() || self.records.is_empty();
        if !allowed || !next.predecessors().contains(&self.last_phase()) {
            return Err(PhaseOrderError { current, next });
        }
        let finished = self.finish(PhaseStatus::Completed);
        self.records.push(PhaseRecord {
            phase: next,
            status: PhaseStatus::Active,
            elapsed: None,
        });
        self.started_at = Some(Instant::now());
        Ok(finished)
    }

    /// Mark the whole attempt complete.
    pub fn complete(&mut self) -> Option<(PairingPhase, Duration)> {
        self.finish(PhaseStatus::Completed)
    }

    /// Mark the active phase unavailable, recording how long it ran.
    pub fn fail(&mut self) -> Option<(PairingPhase, Duration)> {
        self.finish(PhaseStatus::Unavailable)
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    fn finish(&mut self, status: PhaseStatus) -> Option<(PairingPhase, Duration)> {
        let started = self.started_at.take()?;
        let record = self.records.last_mut()?;
        if record.status != PhaseStatus::Active {
            return None;
        }
        let elapsed = started.elapsed();
        record.status = status;
        record.elapsed = Some(elapsed);
        Some((record.phase, elapsed))
    }
}

// ============================================================================
// Sink
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    PhaseStarted(PairingPhase),
    PhaseCompleted {
        phase: PairingPhase,
        elapsed: Duration,
    },
    PhaseUnavailable {
        phase: PairingPhase,
        elapsed: Duration,
    },
    RelayRetry {
        attempt: u32,
        max_retries: u32,
    },
}

/// Receives lifecycle state changes and phase telemetry (UI, metrics).
///
/// Called from the pairing task. Callbacks run in order and may call back into
/// the lifecycle's `start` or `reset`; events from an attempt superseded that
/// way are dropped.
pub trait ProgressSink: Send + Sync {
    fn on_state(&self, _state: &PairingState) {}
    fn on_progress(&self, _event: &ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_linear_walk_records_durations() {
        let mut timer = StepTimer::new();
        assert_eq!(timer.enter(PairingPhase::Scanned).unwrap(), None);
        tokio::time::advance(Duration::from_millis(100)).await;

        let finished = timer.enter(PairingPhase::CreatingConnection).unwrap();
        assert_eq!(finished, Some((PairingPhase::Scanned, Duration::from_millis(100))));

        timer.enter(PairingPhase::ReachingHost).unwrap();
        timer.enter(PairingPhase::RelayConnection).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        timer.enter(PairingPhase::Authenticating).unwrap();
        timer.complete();

        let records = timer.records();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.status == PhaseStatus::Completed));
        assert_eq!(records[3].elapsed, Some(Duration::from_secs(2)));
        assert_eq!(timer.current(), None);
    }

    #[test]
    fn test_enter_requires_predecessor() {
        let mut timer = StepTimer::new();
        let err = timer.enter(PairingPhase::ReachingHost).unwrap_err();
        assert_eq!(err.current, None);

        timer.enter(PairingPhase::Scanned).unwrap();
        assert!(timer.enter(PairingPhase::Authenticating).is_err());
        assert!(timer.enter(PairingPhase::Scanned).is_err());
        assert_eq!(timer.current(), Some(PairingPhase::Scanned));
    }

    #[test]
    fn test_direct_then_relay() {
        let mut timer = StepTimer::new();
        for phase in [
            PairingPhase::Scanned,
            PairingPhase::CreatingConnection,
            PairingPhase::ReachingHost,
            PairingPhase::DirectAttempt,
            PairingPhase::RelayConnection,
        ] {
            timer.enter(phase).unwrap();
        }
        assert!(timer.enter(PairingPhase::DirectAttempt).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_marks_active_phase_unavailable() {
        let mut timer = StepTimer::new();
        timer.enter(PairingPhase::Scanned).unwrap();
        timer.enter(PairingPhase::CreatingConnection).unwrap();
        timer.enter(PairingPhase::ReachingHost).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(
            timer.fail(),
            Some((PairingPhase::ReachingHost, Duration::from_secs(30)))
        );
        assert_eq!(timer.records()[2].status, PhaseStatus::Unavailable);
        // Nothing can be entered after the attempt ended.
        assert!(timer.enter(PairingPhase::RelayConnection).is_err());
        assert_eq!(timer.fail(), None);
    }
}
