//! Submission & retry orchestration
//!
//! Supervises one job from first submission to a terminal state:
//!
//! ```text
//!            ┌──────────────────────── Retrying ◄──────────┐
//!            ▼                                             │ preempted
//!  Idle ──► Submitting ──► Polling ──► Classifying ────────┤
//!   │           │             │     │                      │ no worker / not preempted
//!   │           │ fatal       │     └─► Succeeded          ▼
//!   │           └─────────────┴───────────────────────► FatalAbort
//!   └─ budget exhausted ─► ExhaustedFailure
//! ```
//!
//! ## Key Design Decisions
//!
//! - **Retry only confirmed preemption**: any other failure is assumed
//!   deterministic, so it aborts regardless of remaining budget
//! - **Cheap first**: preemptible attempts are used before the single
//!   non-preemptible one
//! - **One mutable field**: only `JobRequest::preemptible` changes between attempts
//! - **No exit calls**: the run ends with a [`RunReport`]; the caller picks the exit code

use crate::budget::RetryBudget;
use crate::classifier::{FailureClass, FailureClassifier, DEFAULT_SETTLE_DELAY_SECS};
use crate::client::{ExecutionClient, RetryPolicy};
use crate::poller::{Poller, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_POLLING_INTERVAL_SECS};
use crate::report::{Attempt, AttemptOutcome, FatalReason, RunOutcome, RunReport};
use pipeline_core::{
    ExecutionBackend, ExecutionMode, JobRequest, PipelineError, RemoteOperation, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between status checks
    pub polling_interval: Duration,

    /// Wait before trusting the fleet API's preemption records
    pub settle_delay: Duration,

    /// Consecutive transient polling failures tolerated
    pub max_consecutive_poll_failures: u32,

    /// Submission retry policy
    pub retry_policy: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_DELAY_SECS),
            max_consecutive_poll_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Set polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set submission retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the consecutive polling failure cap
    pub fn with_max_consecutive_poll_failures(mut self, max: u32) -> Self {
        self.max_consecutive_poll_failures = max;
        self
    }
}

/// Internal state of a run
#[derive(Debug)]
enum State {
    Idle,
    Submitting(ExecutionMode),
    Polling(RemoteOperation),
    Classifying(RemoteOperation),
    Retrying,
}

/// Supervises a single job through submission, polling and retries
pub struct Orchestrator {
    client: ExecutionClient,
    poller: Poller,
    classifier: FailureClassifier,
}

impl Orchestrator {
    /// Create an orchestrator with default configuration
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::with_config(backend, OrchestratorConfig::default())
    }

    /// Create an orchestrator with custom configuration
    pub fn with_config(backend: Arc<dyn ExecutionBackend>, config: OrchestratorConfig) -> Self {
        let client = ExecutionClient::with_policy(backend, config.retry_policy);
        let poller = Poller::new(client.clone())
            .with_interval(config.polling_interval)
            .with_max_consecutive_failures(config.max_consecutive_poll_failures);
        let classifier =
            FailureClassifier::new(client.clone()).with_settle_delay(config.settle_delay);

        Self {
            client,
            poller,
            classifier,
        }
    }

    /// Run the job to a terminal state.
    ///
    /// Fails only when the budget is empty before the first submission;
    /// everything after that is reported through [`RunReport::outcome`].
    pub async fn run(
        &self,
        mut request: JobRequest,
        mut budget: RetryBudget,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if budget.is_exhausted() {
            return Err(PipelineError::config(
                "no attempts permitted: retry budget is empty",
            ));
        }

        info!(
            preemptible_tries = budget.preemptible_remaining(),
            non_preemptible_tries = budget.non_preemptible_remaining(),
            "Starting supervised run"
        );

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut state = State::Idle;

        let outcome = loop {
            state = match state {
                State::Idle | State::Retrying => match budget.next_mode() {
                    Some(mode) => State::Submitting(mode),
                    None => {
                        warn!(attempts = attempts.len(), "Retry budget exhausted");
                        break RunOutcome::Exhausted;
                    }
                },

                State::Submitting(mode) => {
                    request.set_preemptible(mode.is_preemptible());
                    let number = attempts.len() as u32 + 1;
                    info!(
                        attempt = number,
                        mode = %mode,
                        preemptible_remaining = budget.preemptible_remaining(),
                        non_preemptible_remaining = budget.non_preemptible_remaining(),
                        "Running pipeline"
                    );
                    attempts.push(Attempt::new(number, mode));

                    match self.client.submit(&request, &cancel).await {
                        Ok(operation) => {
                            record(&mut attempts, Some(&operation), AttemptOutcome::InFlight);
                            State::Polling(operation)
                        }
                        Err(PipelineError::Cancelled) => {
                            record(&mut attempts, None, AttemptOutcome::Cancelled);
                            break RunOutcome::Cancelled;
                        }
                        Err(e) => {
                            error!(attempt = number, error = %e, "Submission failed");
                            record(&mut attempts, None, AttemptOutcome::SubmissionFailed);
                            break RunOutcome::FatalAbort(FatalReason::SubmissionFailed(e));
                        }
                    }
                }

                State::Polling(operation) => {
                    match self.poller.wait_until_done(operation, &cancel).await {
                        Ok(done) if done.succeeded() => {
                            info!(operation = %done.name, "Operation succeeded");
                            record(&mut attempts, Some(&done), AttemptOutcome::Succeeded);
                            break RunOutcome::Succeeded;
                        }
                        Ok(done) => {
                            if let Some(err) = &done.error {
                                warn!(
                                    operation = %done.name,
                                    code = err.code,
                                    message = %err.message,
                                    "Operation failed"
                                );
                            }
                            record(&mut attempts, Some(&done), AttemptOutcome::InFlight);
                            State::Classifying(done)
                        }
                        Err(PipelineError::Cancelled) => {
                            record(&mut attempts, None, AttemptOutcome::Cancelled);
                            break RunOutcome::Cancelled;
                        }
                        Err(e) => {
                            error!(error = %e, "Lost track of the running operation");
                            record(&mut attempts, None, AttemptOutcome::PollingFailed);
                            break RunOutcome::FatalAbort(FatalReason::PollingFailed(e));
                        }
                    }
                }

                State::Classifying(operation) => {
                    let classification = match self.classifier.classify(&operation, &cancel).await {
                        Ok(c) => c,
                        Err(_) => {
                            record(&mut attempts, None, AttemptOutcome::Cancelled);
                            break RunOutcome::Cancelled;
                        }
                    };
                    let class = classification.class;
                    if let Some(attempt) = attempts.last_mut() {
                        attempt.classification = Some(classification);
                    }

                    match class {
                        FailureClass::PreemptedRetriable => {
                            info!(
                                attempt = attempts.len(),
                                remaining = budget.remaining(),
                                "Run failed due to preemption, retrying"
                            );
                            record(&mut attempts, None, AttemptOutcome::Preempted);
                            State::Retrying
                        }
                        FailureClass::NoWorkerAssigned => {
                            error!(
                                attempt = attempts.len(),
                                "Run failed before reaching a worker, not retrying"
                            );
                            record(&mut attempts, None, AttemptOutcome::NoWorkerAssigned);
                            break RunOutcome::FatalAbort(FatalReason::NoWorkerAssigned);
                        }
                        FailureClass::OtherFailureFatal => {
                            error!(
                                attempt = attempts.len(),
                                "Run failed, but not due to preemption"
                            );
                            record(&mut attempts, None, AttemptOutcome::NotPreempted);
                            break RunOutcome::FatalAbort(FatalReason::NotPreempted);
                        }
                    }
                }
            };
        };

        Ok(RunReport {
            outcome,
            attempts,
            budget,
        })
    }
}

/// Update the current attempt with the latest operation state and outcome
fn record(attempts: &mut [Attempt], operation: Option<&RemoteOperation>, outcome: AttemptOutcome) {
    if let Some(attempt) = attempts.last_mut() {
        if let Some(op) = operation {
            attempt.operation = Some(op.clone());
        }
        attempt.outcome = outcome;
    }
}
