//! Run reporting
//!
//! Every submission is recorded as an [`Attempt`]; the run ends in exactly one
//! [`RunOutcome`], which maps to a process exit code.

use crate::budget::RetryBudget;
use crate::classifier::Classification;
use chrono::{DateTime, Utc};
use pipeline_core::{ExecutionMode, PipelineError, RemoteOperation};
use serde::Serialize;

/// Exit code: the job succeeded
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code: the run hit an unretriable condition
pub const EXIT_FATAL: i32 = 1;
/// Exit code: bad invocation or configuration, nothing was submitted
pub const EXIT_USAGE: i32 = 2;
/// Exit code: every permitted attempt was used and the last one was preempted
pub const EXIT_EXHAUSTED: i32 = 3;
/// Exit code: cancelled by the caller; the remote operation may still be running
pub const EXIT_CANCELLED: i32 = 130;

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    /// Submitted, terminal state not yet observed
    InFlight,
    Succeeded,
    Preempted,
    NoWorkerAssigned,
    /// Failed for a reason other than preemption
    NotPreempted,
    SubmissionFailed,
    PollingFailed,
    Cancelled,
}

/// One submission cycle
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    pub mode: ExecutionMode,
    pub submitted_at: DateTime<Utc>,
    /// Latest known state of the remote operation, if submission succeeded
    pub operation: Option<RemoteOperation>,
    pub outcome: AttemptOutcome,
    pub classification: Option<Classification>,
}

impl Attempt {
    pub fn new(number: u32, mode: ExecutionMode) -> Self {
        Self {
            number,
            mode,
            submitted_at: Utc::now(),
            operation: None,
            outcome: AttemptOutcome::InFlight,
            classification: None,
        }
    }
}

/// Why the run was aborted
#[derive(Debug)]
pub enum FatalReason {
    /// Submission failed after its own transport retries
    SubmissionFailed(PipelineError),
    /// Status polling failed; remote state unknown
    PollingFailed(PipelineError),
    /// The job never reached a worker
    NoWorkerAssigned,
    /// The job failed on a worker and no preemption was confirmed
    NotPreempted,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalReason::SubmissionFailed(e) => write!(f, "{}", e),
            FatalReason::PollingFailed(e) => write!(f, "{}", e),
            FatalReason::NoWorkerAssigned => write!(f, "job failed before a worker was assigned"),
            FatalReason::NotPreempted => write!(f, "job failed, but not due to preemption"),
        }
    }
}

/// Terminal state of a run
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded,
    /// Retry budget used up by preemptions
    Exhausted,
    FatalAbort(FatalReason),
    /// Cancelled by the caller
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => EXIT_SUCCESS,
            RunOutcome::Exhausted => EXIT_EXHAUSTED,
            RunOutcome::FatalAbort(_) => EXIT_FATAL,
            RunOutcome::Cancelled => EXIT_CANCELLED,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

/// Result of a supervised run
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// All attempts, oldest first
    pub attempts: Vec<Attempt>,
    /// Budget left when the run ended
    pub budget: RetryBudget,
}

impl RunReport {
    /// Number of submissions made
    pub fn submissions(&self) -> usize {
        self.attempts.len()
    }

    /// Modes used, in attempt order
    pub fn modes(&self) -> Vec<ExecutionMode> {
        self.attempts.iter().map(|a| a.mode).collect()
    }

    /// Last known remote operation
    pub fn last_operation(&self) -> Option<&RemoteOperation> {
        self.attempts.iter().rev().find_map(|a| a.operation.as_ref())
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// One-line human-readable status
    pub fn status_line(&self) -> String {
        let name = self
            .last_operation()
            .map(|op| op.name.as_str())
            .unwrap_or("<none>");
        let n = self.submissions();

        match &self.outcome {
            RunOutcome::Succeeded => {
                format!("Operation {} succeeded after {} attempt(s)", name, n)
            }
            RunOutcome::Exhausted => format!(
                "Retry budget exhausted after {} attempt(s); final run {} was preempted",
                n, name
            ),
            RunOutcome::FatalAbort(reason) => {
                format!("Run aborted on attempt {} ({}): {}", n, name, reason)
            }
            RunOutcome::Cancelled => format!(
                "Run cancelled on attempt {}; operation {} was left running",
                n, name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: RunOutcome, attempts: Vec<Attempt>) -> RunReport {
        RunReport {
            outcome,
            attempts,
            budget: RetryBudget::new(0, 1).unwrap(),
        }
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            RunOutcome::Succeeded.exit_code(),
            RunOutcome::Exhausted.exit_code(),
            RunOutcome::FatalAbort(FatalReason::NotPreempted).exit_code(),
            RunOutcome::Cancelled.exit_code(),
            EXIT_USAGE,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
    }

    #[test]
    fn test_last_operation_skips_failed_submission() {
        let mut first = Attempt::new(1, ExecutionMode::Preemptible);
        first.operation = Some(RemoteOperation::new("operations/1"));
        let second = Attempt::new(2, ExecutionMode::NonPreemptible);

        let report = report(
            RunOutcome::FatalAbort(FatalReason::SubmissionFailed(PipelineError::transport(
                "down",
            ))),
            vec![first, second],
        );
        assert_eq!(report.last_operation().unwrap().name, "operations/1");
        assert_eq!(
            report.modes(),
            vec![ExecutionMode::Preemptible, ExecutionMode::NonPreemptible]
        );
        assert!(report.status_line().contains("aborted on attempt 2"));
    }

    #[test]
    fn test_status_line_success() {
        let mut attempt = Attempt::new(1, ExecutionMode::Preemptible);
        attempt.operation = Some(RemoteOperation::new("operations/9").with_done());
        let report = report(RunOutcome::Succeeded, vec![attempt]);
        assert_eq!(
            report.status_line(),
            "Operation operations/9 succeeded after 1 attempt(s)"
        );
    }
}
