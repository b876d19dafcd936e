//! Execution client
//!
//! Wraps a raw [`ExecutionBackend`] with the bounded retry policy used for
//! submission. Transport retries live here and only here; the orchestrator
//! never resubmits because of a transport failure.
//!
//! ## Backoff
//!
//! Truncated exponential backoff with full jitter. The sleep before attempt
//! `i` (0-based) is drawn from `U(0, 1) * base_interval * (2^i - 1)`, so the
//! first attempt never waits:
//!
//! ```text
//! attempt   0    1     2     3     4      5
//! max wait  0   1b    3b    7b   15b    31b
//! ```

use crate::shutdown::{run_or_cancel, sleep_or_cancel};
use pipeline_core::{
    ExecutionBackend, JobRequest, PipelineError, PreemptionEvent, RemoteOperation, Result,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of submission attempts
pub const DEFAULT_SUBMIT_ATTEMPTS: u32 = 6;

/// Default backoff base interval (seconds)
pub const DEFAULT_BASE_INTERVAL_SECS: u64 = 2;

/// Smallest accepted backoff base interval
const MIN_BASE_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded retry policy for transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SUBMIT_ATTEMPTS,
            base_interval: Duration::from_secs(DEFAULT_BASE_INTERVAL_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy. Needs at least one attempt and a base interval of 1s or more.
    pub fn new(max_attempts: u32, base_interval: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(PipelineError::config("retry policy needs at least one attempt"));
        }
        if base_interval < MIN_BASE_INTERVAL {
            return Err(PipelineError::config(format!(
                "backoff base interval must be at least {:?}, got {:?}",
                MIN_BASE_INTERVAL, base_interval
            )));
        }
        Ok(Self {
            max_attempts,
            base_interval,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Upper bound of the sleep before `attempt`: `base * (2^attempt - 1)`
    pub fn max_delay(&self, attempt: u32) -> Duration {
        let factor = (1u64 << attempt.min(32)) - 1;
        let factor = u32::try_from(factor).unwrap_or(u32::MAX);
        self.base_interval.saturating_mul(factor)
    }

    /// Sleep before `attempt` for a jitter sample in `[0, 1]`
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        self.max_delay(attempt).mul_f64(jitter.clamp(0.0, 1.0))
    }

    /// Sleep before `attempt` with a fresh random jitter sample
    pub fn sample_delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay(attempt, jitter)
    }
}

/// Execution client with submission retries.
///
/// Cheap to clone; clones share the backend (and its connection pool).
#[derive(Clone)]
pub struct ExecutionClient {
    backend: Arc<dyn ExecutionBackend>,
    policy: RetryPolicy,
}

impl ExecutionClient {
    /// Create a client with the default retry policy
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::with_policy(backend, RetryPolicy::default())
    }

    /// Create a client with a custom retry policy
    pub fn with_policy(backend: Arc<dyn ExecutionBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Submit a job, retrying transient transport failures.
    ///
    /// Non-transient failures stop immediately. Either way the error comes
    /// back as [`PipelineError::SubmissionFailed`]; cancellation comes back as
    /// [`PipelineError::Cancelled`].
    pub async fn submit(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<RemoteOperation> {
        let mut last_error = None;

        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.sample_delay(attempt);
            if !delay.is_zero() {
                info!(
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    "Backing off before resubmitting"
                );
                sleep_or_cancel(delay, cancel).await?;
            }

            match run_or_cancel(self.backend.submit(request), cancel).await {
                Ok(operation) => {
                    info!(
                        operation = %operation.name,
                        preemptible = request.preemptible(),
                        "Job submitted"
                    );
                    return Ok(operation);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if e.is_transient() => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "Transient error submitting job"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(PipelineError::SubmissionFailed {
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
            }
        }

        Err(PipelineError::SubmissionFailed {
            attempts: self.policy.max_attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| PipelineError::transport("no submission attempted")),
            ),
        })
    }

    /// Single status check
    pub async fn poll(&self, name: &str, cancel: &CancellationToken) -> Result<RemoteOperation> {
        debug!(operation = %name, "Polling operation");
        run_or_cancel(self.backend.get_operation(name), cancel).await
    }

    /// Fleet-management preemption records for an instance
    pub async fn list_preemption_events(
        &self,
        instance: &str,
        zone: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreemptionEvent>> {
        run_or_cancel(self.backend.list_preemption_events(instance, zone), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline_core::ResourceShape;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Backend that replays a fixed list of submission results
    struct ScriptedSubmit {
        results: Mutex<Vec<Result<RemoteOperation>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSubmit {
        fn new(mut results: Vec<Result<RemoteOperation>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExecutionBackend for ScriptedSubmit {
        async fn submit(&self, _request: &JobRequest) -> Result<RemoteOperation> {
            *self.calls.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(PipelineError::transport("script exhausted")))
        }

        async fn get_operation(&self, name: &str) -> Result<RemoteOperation> {
            Ok(RemoteOperation::new(name))
        }

        async fn list_preemption_events(
            &self,
            _instance: &str,
            _zone: &str,
        ) -> Result<Vec<PreemptionEvent>> {
            Ok(vec![])
        }
    }

    fn request() -> JobRequest {
        JobRequest::new(
            "proj",
            ResourceShape {
                machine_type: "n1-standard-1".to_string(),
                disks: vec![],
                zones: vec!["us-central1-a".to_string()],
            },
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_backoff_upper_bounds() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1)).unwrap();
        assert_eq!(policy.max_delay(0), Duration::ZERO);
        assert_eq!(policy.max_delay(1), Duration::from_secs(1));
        assert_eq!(policy.max_delay(2), Duration::from_secs(3));
        assert_eq!(policy.max_delay(5), Duration::from_secs(31));

        for attempt in 0..policy.max_attempts() {
            for _ in 0..50 {
                assert!(policy.sample_delay(attempt) <= policy.max_delay(attempt));
            }
        }
    }

    #[test]
    fn test_first_attempt_never_sleeps() {
        let policy = RetryPolicy::new(6, Duration::from_secs(10)).unwrap();
        assert_eq!(policy.delay(0, 1.0), Duration::ZERO);
        assert_eq!(policy.sample_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_jitter_scales_delay() {
        let policy = RetryPolicy::new(6, Duration::from_secs(2)).unwrap();
        assert_eq!(policy.delay(3, 0.5), Duration::from_secs(7));
        assert_eq!(policy.delay(3, 7.0), Duration::from_secs(14));
        assert_eq!(policy.delay(3, -1.0), Duration::ZERO);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::new(0, Duration::from_secs(1)).is_err());
        assert!(RetryPolicy::new(6, Duration::from_millis(500)).is_err());
        assert_eq!(RetryPolicy::default().max_attempts(), DEFAULT_SUBMIT_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_retries_transient_errors() {
        let backend = Arc::new(ScriptedSubmit::new(vec![
            Err(PipelineError::transport("connection reset")),
            Err(PipelineError::api(503, "backend unavailable")),
            Ok(RemoteOperation::new("operations/1")),
        ]));
        let client = ExecutionClient::new(backend.clone());

        let op = client
            .submit(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(op.name, "operations/1");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_gives_up_after_cap() {
        let backend = Arc::new(ScriptedSubmit::new(vec![]));
        let client = ExecutionClient::new(backend.clone());

        let err = client
            .submit(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::SubmissionFailed { attempts, .. } => {
                assert_eq!(attempts, DEFAULT_SUBMIT_ATTEMPTS)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.calls(), DEFAULT_SUBMIT_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_does_not_retry_bad_request() {
        let backend = Arc::new(ScriptedSubmit::new(vec![Err(PipelineError::api(
            400,
            "invalid machine type",
        ))]));
        let client = ExecutionClient::new(backend.clone());

        let err = client
            .submit(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SubmissionFailed { attempts: 1, .. }
        ));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_cancelled_during_backoff() {
        let backend = Arc::new(ScriptedSubmit::new(vec![]));
        let policy = RetryPolicy::new(6, Duration::from_secs(600)).unwrap();
        let client = ExecutionClient::with_policy(backend.clone(), policy);
        let token = CancellationToken::new();
        token.cancel();

        let err = client.submit(&request(), &token).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(backend.calls(), 0);
    }
}
