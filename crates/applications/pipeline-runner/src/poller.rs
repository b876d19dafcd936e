//! Operation status polling
//!
//! Checks a submitted operation at a fixed interval until it reports `done`.
//!
//! A transient failure (network blip, expired credential, 5xx) is tolerated
//! as long as it does not repeat more than `max_consecutive_failures` times
//! in a row; a successful check resets the count. Anything else ends polling
//! with [`PipelineError::PollingFailed`], because the remote state is then
//! unknown and the run cannot safely continue.

use crate::client::ExecutionClient;
use futures::StreamExt;
use pipeline_core::{PipelineError, RemoteOperation, Result};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default polling interval (seconds)
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 30;

/// Consecutive transient failures tolerated before giving up
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Fixed-interval status poller
#[derive(Clone)]
pub struct Poller {
    client: ExecutionClient,
    interval: Duration,
    max_consecutive_failures: u32,
}

impl Poller {
    /// Create a poller with the default interval and failure cap
    pub fn new(client: ExecutionClient) -> Self {
        Self {
            client,
            interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }

    /// Set polling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the consecutive failure cap
    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Stream of status checks for `name`, one per interval.
    ///
    /// The first check happens one interval after the call.
    pub fn status_stream(
        &self,
        name: String,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn futures::Stream<Item = Result<RemoteOperation>> + Send>> {
        let client = self.client.clone();
        let interval = self.interval;

        Box::pin(async_stream::stream! {
            loop {
                tokio::time::sleep(interval).await;
                yield client.poll(&name, &cancel).await;
            }
        })
    }

    /// Poll until the operation is done.
    ///
    /// Returns immediately if `operation` is already done.
    pub async fn wait_until_done(
        &self,
        operation: RemoteOperation,
        cancel: &CancellationToken,
    ) -> Result<RemoteOperation> {
        if operation.done {
            debug!(operation = %operation.name, "Operation already done");
            return Ok(operation);
        }

        let name = operation.name.clone();
        let mut stream = self.status_stream(name.clone(), cancel.clone());
        let mut consecutive_failures = 0u32;
        let mut checks = 0u64;

        info!(
            operation = %name,
            interval_secs = self.interval.as_secs_f64(),
            "Waiting for operation to finish"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                next = stream.next() => next,
            };

            let Some(result) = next else {
                return Err(PipelineError::PollingFailed {
                    name,
                    failures: consecutive_failures,
                    source: Box::new(PipelineError::invalid_response("status stream ended")),
                });
            };
            checks += 1;

            match result {
                Ok(current) => {
                    consecutive_failures = 0;
                    if current.done {
                        info!(
                            operation = %name,
                            checks,
                            failed = current.error.is_some(),
                            "Operation finished"
                        );
                        return Ok(current);
                    }
                    debug!(operation = %name, checks, "Operation still running");
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if e.is_transient() => {
                    consecutive_failures += 1;
                    warn!(
                        operation = %name,
                        consecutive_failures,
                        max = self.max_consecutive_failures,
                        error = %e,
                        "Transient error while polling"
                    );
                    if consecutive_failures > self.max_consecutive_failures {
                        return Err(PipelineError::PollingFailed {
                            name,
                            failures: consecutive_failures,
                            source: Box::new(e),
                        });
                    }
                }
                Err(e) => {
                    return Err(PipelineError::PollingFailed {
                        name,
                        failures: consecutive_failures + 1,
                        source: Box::new(e),
                    });
                }
            }
        }
    }
}
