//! Episode lifecycle state machine.
//!
//! ```text
//! Init -> Resetting -> Executing -> Succeeded | Failed | Timeout -> Finalized
//!             |            |
//!             +------------+-----> Aborted
//! ```

use std::fmt;

use crate::error::IllegalTransition;
use crate::trajectory::types::Outcome;

// ---------------------------------------------------------------------------
// EpisodePhase
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EpisodePhase {
    /// Task sampled, nothing touched yet.
    #[default]
    Init,
    Resetting,
    Executing,
    Succeeded,
    Failed,
    Timeout,
    /// Ended without a usable trajectory; never archived.
    Aborted,
    /// Header written and trajectory flushed.
    Finalized,
}

impl EpisodePhase {
    /// Returns `true` for the outcome phases (everything after `Executing`
    /// except `Finalized`).
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Timeout | Self::Aborted)
    }

    pub const fn outcome(self) -> Option<Outcome> {
        match self {
            Self::Succeeded => Some(Outcome::Succeeded),
            Self::Failed => Some(Outcome::Failed),
            Self::Timeout => Some(Outcome::Timeout),
            Self::Aborted => Some(Outcome::Aborted),
            _ => None,
        }
    }

    const fn allows(self, next: Self) -> bool {
        use EpisodePhase::*;
        matches!(
            (self, next),
            (Init, Resetting)
                | (Resetting, Executing)
                | (Resetting, Aborted)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Executing, Timeout)
                | (Executing, Aborted)
                | (Succeeded, Finalized)
                | (Failed, Finalized)
                | (Timeout, Finalized)
        )
    }
}

impl From<Outcome> for EpisodePhase {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => Self::Succeeded,
            Outcome::Failed => Self::Failed,
            Outcome::Timeout => Self::Timeout,
            Outcome::Aborted => Self::Aborted,
        }
    }
}

impl fmt::Display for EpisodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// EpisodeLifecycle
// ---------------------------------------------------------------------------

/// Tracks one episode's phase and rejects illegal transitions.
#[derive(Clone, Debug, Default)]
pub struct EpisodeLifecycle {
    phase: EpisodePhase,
    seed: u64,
}

impl EpisodeLifecycle {
    pub fn new(seed: u64) -> Self {
        Self {
            phase: EpisodePhase::Init,
            seed,
        }
    }

    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    pub fn transition(&mut self, next: EpisodePhase) -> Result<(), IllegalTransition> {
        if !self.phase.allows(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(seed = self.seed, from = %self.phase, to = %next, "episode transition");
        self.phase = next;
        Ok(())
    }

    /// Move from `Executing` to the phase matching `outcome`.
    pub fn conclude(&mut self, outcome: Outcome) -> Result<(), IllegalTransition> {
        self.transition(outcome.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_finalized() {
        let mut lc = EpisodeLifecycle::new(1);
        lc.transition(EpisodePhase::Resetting).unwrap();
        lc.transition(EpisodePhase::Executing).unwrap();
        lc.conclude(Outcome::Timeout).unwrap();
        assert!(lc.phase().is_terminal());
        lc.transition(EpisodePhase::Finalized).unwrap();
        assert_eq!(lc.phase(), EpisodePhase::Finalized);
    }

    #[test]
    fn aborted_never_finalizes() {
        let mut lc = EpisodeLifecycle::new(1);
        lc.transition(EpisodePhase::Resetting).unwrap();
        lc.transition(EpisodePhase::Aborted).unwrap();
        let err = lc.transition(EpisodePhase::Finalized).unwrap_err();
        assert_eq!(err.from, EpisodePhase::Aborted);
        assert_eq!(lc.phase(), EpisodePhase::Aborted);
    }

    #[test]
    fn cannot_skip_reset() {
        let mut lc = EpisodeLifecycle::new(1);
        assert!(lc.transition(EpisodePhase::Executing).is_err());
        assert!(lc.conclude(Outcome::Succeeded).is_err());
    }

    #[test]
    fn outcome_is_set_once() {
        let mut lc = EpisodeLifecycle::new(1);
        lc.transition(EpisodePhase::Resetting).unwrap();
        lc.transition(EpisodePhase::Executing).unwrap();
        lc.conclude(Outcome::Succeeded).unwrap();
        assert!(lc.conclude(Outcome::Failed).is_err());
        assert_eq!(lc.phase().outcome(), Some(Outcome::Succeeded));
    }
}
