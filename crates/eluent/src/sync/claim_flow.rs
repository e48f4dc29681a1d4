//! Bounded optimistic-locking retry loop for claims.
//!
//! Each attempt pulls, reads, mutates, and pushes; a non-fast-forward
//! rejection means another agent pushed first and this attempt lost the
//! race. Losing sleeps an exponentially growing, jittered delay and retries
//! with the new parent. Jitter matters: without it, N agents contending for
//! the same atom resynchronize their retries every round.
//!
//! Separated from the syncer so the loop can be driven with a test clock
//! and scripted attempt outcomes.

use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::{ClaimResult, LedgerError};

/// First-retry delay.
pub const BASE_BACKOFF: Duration = Duration::from_millis(100);
/// Ceiling on a single delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Uniform jitter applied to every delay, as a fraction.
pub const BACKOFF_JITTER: f64 = 0.2;

/// Bounds the configured retry ceiling.
pub const MIN_CLAIM_RETRIES: u32 = 1;
pub const MAX_CLAIM_RETRIES: u32 = 100;

/// Outcome of a single claim attempt, as reported by the driver closure.
#[derive(Debug)]
pub enum Attempt {
    /// Our push landed; the claim is ours
    Won,
    /// The atom was already claimed by the requesting agent
    AlreadyOurs,
    /// The atom is held by another agent
    Conflict { owner: String },
    /// The atom is in a terminal status
    Terminal { status: String },
    /// The atom does not exist in the ledger
    NotFound,
    /// The remote rejected our push; retry with the new parent
    Lost,
    /// Unrecoverable failure; do not retry
    Fatal(LedgerError),
}

/// Final outcome of the retry loop.
///
/// This is the internal sum type; it flattens to the documented
/// [`ClaimResult`] record only at the API boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed { retries: u32 },
    Idempotent { retries: u32 },
    Conflict { owner: String, retries: u32 },
    Terminal { status: String },
    NotFound,
    MaxRetries { retries: u32 },
    Failed { error: LedgerError, retries: u32 },
}

impl ClaimOutcome {
    /// Flatten to the value record returned to callers.
    pub fn into_claim_result(self, atom_id: &str, agent_id: &str) -> ClaimResult {
        match self {
            ClaimOutcome::Claimed { retries } | ClaimOutcome::Idempotent { retries } => {
                ClaimResult::ok(agent_id, retries)
            }
            ClaimOutcome::Conflict { owner, retries } => ClaimResult::failed(
                LedgerError::ClaimConflict {
                    atom_id: atom_id.to_string(),
                    owner,
                },
                retries,
            ),
            ClaimOutcome::Terminal { status } => ClaimResult::failed(
                LedgerError::AtomTerminal {
                    atom_id: atom_id.to_string(),
                    status,
                },
                0,
            ),
            ClaimOutcome::NotFound => ClaimResult::failed(
                LedgerError::AtomNotFound {
                    atom_id: atom_id.to_string(),
                },
                0,
            ),
            ClaimOutcome::MaxRetries { retries } => {
                ClaimResult::failed(LedgerError::MaxRetriesExceeded { retries }, retries)
            }
            ClaimOutcome::Failed { error, retries } => ClaimResult::failed(error, retries),
        }
    }
}

/// The retry/backoff state machine.
#[derive(Debug, Clone)]
pub struct ClaimFlow {
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl ClaimFlow {
    /// Create a flow with the retry ceiling clamped to `[1, 100]`.
    pub fn new(max_retries: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_retries: max_retries.clamp(MIN_CLAIM_RETRIES, MAX_CLAIM_RETRIES),
            clock,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Drive attempts until a resolution or the retry ceiling.
    ///
    /// `retries` in the outcome counts remote push rejections, except for a
    /// fatal failure, which reports the attempt number it occurred on.
    pub fn run(&self, mut attempt_fn: impl FnMut(u32) -> Attempt) -> ClaimOutcome {
        let mut rejections = 0u32;

        for attempt in 1..=self.max_retries {
            match attempt_fn(attempt) {
                Attempt::Won => {
                    return ClaimOutcome::Claimed {
                        retries: rejections,
                    }
                }
                Attempt::AlreadyOurs => {
                    return ClaimOutcome::Idempotent {
                        retries: rejections,
                    }
                }
                Attempt::Conflict { owner } => {
                    return ClaimOutcome::Conflict {
                        owner,
                        retries: rejections,
                    }
                }
                Attempt::Terminal { status } => return ClaimOutcome::Terminal { status },
                Attempt::NotFound => return ClaimOutcome::NotFound,
                Attempt::Lost => {
                    rejections += 1;
                    if attempt < self.max_retries {
                        self.clock.sleep(self.backoff_delay(attempt));
                    }
                }
                Attempt::Fatal(error) => {
                    return ClaimOutcome::Failed {
                        error,
                        retries: attempt,
                    }
                }
            }
        }

        ClaimOutcome::MaxRetries {
            retries: rejections,
        }
    }

    /// Jittered exponential delay before the attempt after `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = BASE_BACKOFF.as_millis() as u64;
        // Shift capped well past the point the ceiling takes over
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let capped = base
            .saturating_mul(factor)
            .min(MAX_BACKOFF.as_millis() as u64);

        let jitter = rand::rng().random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
        let jittered = (capped as f64 * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::TestClock;
    use chrono::{TimeZone, Utc};

    fn flow(max_retries: u32) -> (ClaimFlow, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        (ClaimFlow::new(max_retries, clock.clone()), clock)
    }

    #[test]
    fn test_retry_ceiling_clamped() {
        let (low, _) = flow(0);
        assert_eq!(low.max_retries(), 1);
        let (high, _) = flow(10_000);
        assert_eq!(high.max_retries(), 100);
        let (mid, _) = flow(5);
        assert_eq!(mid.max_retries(), 5);
    }

    #[test]
    fn test_uncontended_win_reports_zero_retries() {
        let (flow, clock) = flow(5);
        let outcome = flow.run(|_| Attempt::Won);

        assert_eq!(outcome, ClaimOutcome::Claimed { retries: 0 });
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_lost_once_then_conflict_reports_one_rejection() {
        let (flow, clock) = flow(5);
        let mut calls = 0;
        let outcome = flow.run(|_| {
            calls += 1;
            if calls == 1 {
                Attempt::Lost
            } else {
                Attempt::Conflict {
                    owner: "agent-y".to_string(),
                }
            }
        });

        assert_eq!(
            outcome,
            ClaimOutcome::Conflict {
                owner: "agent-y".to_string(),
                retries: 1
            }
        );
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn test_lost_once_then_win_counts_the_rejection() {
        let (flow, _) = flow(5);
        let mut calls = 0;
        let outcome = flow.run(|_| {
            calls += 1;
            if calls == 1 {
                Attempt::Lost
            } else {
                Attempt::Won
            }
        });

        assert_eq!(outcome, ClaimOutcome::Claimed { retries: 1 });
    }

    #[test]
    fn test_exhaustion_reports_max_retries() {
        let (flow, clock) = flow(3);
        let outcome = flow.run(|_| Attempt::Lost);

        assert_eq!(outcome, ClaimOutcome::MaxRetries { retries: 3 });
        // No sleep after the final attempt
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn test_retries_never_exceed_ceiling() {
        for ceiling in [1, 2, 7, 100] {
            let (flow, _) = flow(ceiling);
            let outcome = flow.run(|_| Attempt::Lost);
            match outcome {
                ClaimOutcome::MaxRetries { retries } => assert_eq!(retries, ceiling),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn test_fatal_reports_attempt_number() {
        let (flow, _) = flow(5);
        let mut calls = 0;
        let outcome = flow.run(|_| {
            calls += 1;
            if calls < 3 {
                Attempt::Lost
            } else {
                Attempt::Fatal(LedgerError::GitFailure {
                    reason: "boom".to_string(),
                })
            }
        });

        assert_eq!(
            outcome,
            ClaimOutcome::Failed {
                error: LedgerError::GitFailure {
                    reason: "boom".to_string()
                },
                retries: 3
            }
        );
    }

    #[test]
    fn test_terminal_and_not_found_short_circuit() {
        let (flow, clock) = flow(5);
        let outcome = flow.run(|_| Attempt::Terminal {
            status: "closed".to_string(),
        });
        assert_eq!(
            outcome,
            ClaimOutcome::Terminal {
                status: "closed".to_string()
            }
        );

        let outcome = flow.run(|_| Attempt::NotFound);
        assert_eq!(outcome, ClaimOutcome::NotFound);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_backoff_grows_and_caps_within_jitter_envelope() {
        let (flow, _) = flow(5);

        for _ in 0..50 {
            let first = flow.backoff_delay(1).as_millis() as f64;
            assert!((80.0..=120.0).contains(&first), "attempt 1: {first}ms");

            let third = flow.backoff_delay(3).as_millis() as f64;
            assert!((320.0..=480.0).contains(&third), "attempt 3: {third}ms");

            let deep = flow.backoff_delay(40).as_millis() as f64;
            assert!((4000.0..=6000.0).contains(&deep), "attempt 40: {deep}ms");
        }
    }

    #[test]
    fn test_outcome_flattens_to_claim_result() {
        let conflict = ClaimOutcome::Conflict {
            owner: "agent-y".to_string(),
            retries: 2,
        }
        .into_claim_result("A1", "agent-x");
        assert!(!conflict.success);
        assert_eq!(conflict.claimed_by.as_deref(), Some("agent-y"));
        assert_eq!(conflict.retries, 2);

        let won = ClaimOutcome::Claimed { retries: 0 }.into_claim_result("A1", "agent-x");
        assert!(won.success);
        assert_eq!(won.claimed_by.as_deref(), Some("agent-x"));
        assert!(!won.offline_claim);

        let terminal = ClaimOutcome::Terminal {
            status: "discard".to_string(),
        }
        .into_claim_result("A1", "agent-x");
        assert_eq!(
            terminal.error,
            Some(LedgerError::AtomTerminal {
                atom_id: "A1".to_string(),
                status: "discard".to_string()
            })
        );
    }
}
