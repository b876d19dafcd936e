//! Failure classification
//!
//! Decides whether a failed operation was caused by preemption. Only a
//! positively confirmed preemption is worth retrying:
//!
//! ```text
//! failed operation
//!     │
//!     ├── no worker assignment ──────────────► NoWorkerAssigned   (fatal)
//!     │
//!     └── worker {instance, zone}
//!           │  settle delay
//!           ├── fleet lookup has preemption ─► PreemptedRetriable
//!           ├── fleet lookup empty ──────────► OtherFailureFatal
//!           └── fleet lookup failed ─────────► OtherFailureFatal
//! ```
//!
//! The fleet API lags reality, so the lookup waits a settle delay first.

use crate::client::ExecutionClient;
use crate::shutdown::sleep_or_cancel;
use pipeline_core::{PipelineError, PreemptionEvent, RemoteOperation, Result, WorkerAssignment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default wait before trusting the fleet API (seconds)
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 30;

/// Cause of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Job never reached a worker (bad request, quota, ...)
    NoWorkerAssigned,
    /// Worker was preempted; worth retrying
    PreemptedRetriable,
    /// Failure unrelated to preemption, or preemption not confirmed
    OtherFailureFatal,
}

impl FailureClass {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::PreemptedRetriable)
    }
}

/// Decide a failure class from the worker assignment and the fleet lookup.
///
/// `lookup` is `None` when no lookup was made.
pub fn classify(
    worker: Option<&WorkerAssignment>,
    lookup: Option<&Result<Vec<PreemptionEvent>>>,
) -> FailureClass {
    match (worker, lookup) {
        (None, _) => FailureClass::NoWorkerAssigned,
        (Some(_), Some(Ok(events))) if events.iter().any(PreemptionEvent::is_preemption) => {
            FailureClass::PreemptedRetriable
        }
        _ => FailureClass::OtherFailureFatal,
    }
}

/// Classification with the evidence it was based on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub class: FailureClass,
    pub worker: Option<WorkerAssignment>,
    pub preemption_events: Vec<PreemptionEvent>,
    /// Set when the fleet API could not be queried
    pub lookup_error: Option<String>,
}

/// Classifies failed operations against the fleet-management API
#[derive(Clone)]
pub struct FailureClassifier {
    client: ExecutionClient,
    settle_delay: Duration,
}

impl FailureClassifier {
    /// Create a classifier with the default settle delay
    pub fn new(client: ExecutionClient) -> Self {
        Self {
            client,
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_DELAY_SECS),
        }
    }

    /// Set settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Classify a finished, failed operation.
    ///
    /// Only fails with `Cancelled`; fleet API errors are folded into the
    /// classification.
    pub async fn classify(
        &self,
        operation: &RemoteOperation,
        cancel: &CancellationToken,
    ) -> Result<Classification> {
        let Some(worker) = operation.worker_assignment() else {
            warn!(
                operation = %operation.name,
                "Operation failed before a worker was assigned"
            );
            return Ok(Classification {
                class: FailureClass::NoWorkerAssigned,
                worker: None,
                preemption_events: vec![],
                lookup_error: None,
            });
        };

        info!(
            operation = %operation.name,
            instance = %worker.instance,
            zone = %worker.zone,
            settle_secs = self.settle_delay.as_secs(),
            "Operation failed on a worker, checking fleet for preemption"
        );
        sleep_or_cancel(self.settle_delay, cancel).await?;

        let lookup = self
            .client
            .list_preemption_events(&worker.instance, &worker.zone, cancel)
            .await;
        if matches!(lookup, Err(PipelineError::Cancelled)) {
            return Err(PipelineError::Cancelled);
        }

        let class = classify(Some(&worker), Some(&lookup));
        let (preemption_events, lookup_error) = match lookup {
            Ok(events) => (events, None),
            Err(e) => {
                warn!(
                    instance = %worker.instance,
                    error = %e,
                    "Fleet lookup failed, not assuming preemption"
                );
                (vec![], Some(e.to_string()))
            }
        };

        info!(
            operation = %operation.name,
            instance = %worker.instance,
            class = ?class,
            events = preemption_events.len(),
            "Failure classified"
        );

        Ok(Classification {
            class,
            worker: Some(worker),
            preemption_events,
            lookup_error,
        })
    }
}
