//! Deadline-bounded execution of blocking pipeline work.
//!
//! Work runs on tokio's blocking threads, gated by a fixed number of permits
//! so load never grows the pool. The deadline is measured from admission:
//! time spent waiting for a permit is charged against it.
//!
//! A computation that misses its deadline is abandoned, not killed. Blocking
//! code cannot be preempted, so the worker keeps its thread and its permit
//! until it returns on its own, and whatever it produces is dropped. The
//! request's cancellation token is fired as a hint for pipelines that check
//! it. Callers always get their outcome by the deadline; the price is that an
//! abandoned worker can hold a pool slot after its caller has moved on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harvest_core::ids::{RequestId, UserId};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::{InvocationRequest, Pipeline, MAX_DEADLINE};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Clone, Debug)]
pub struct InvokerConfig {
    /// Maximum number of pipeline computations running at once.
    pub workers: usize,
    /// Deadline applied to requests admitted through [`BoundedInvoker::admit`].
    pub deadline: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// Caller-safe summary of a failed computation. Never carries the
/// pipeline's own error text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    PipelineError,
    PipelinePanicked,
    WorkerPoolClosed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PipelineError => "the request could not be processed",
            Self::PipelinePanicked => "the request processor stopped unexpectedly",
            Self::WorkerPoolClosed => "the service is shutting down",
        })
    }
}

/// Result of one invocation. Exactly one variant per call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success(String),
    Timeout,
    Failure(FailureReason),
}

impl InvocationOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Timeout => "timeout",
            Self::Failure(_) => "failure",
        }
    }
}

/// Runs blocking computations on a bounded pool and races them against the
/// request deadline.
pub struct BoundedInvoker {
    permits: Arc<Semaphore>,
    workers: usize,
    deadline: Duration,
    abandoned: Arc<AtomicUsize>,
}

impl BoundedInvoker {
    /// Worker count is clamped to what a semaphore can hold and the deadline
    /// to [`MAX_DEADLINE`].
    pub fn new(config: InvokerConfig) -> Self {
        let workers = config.workers.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            deadline: config.deadline.min(MAX_DEADLINE),
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Admit a request with the configured deadline, starting its clock now.
    pub fn admit(&self, user_id: Option<UserId>, text: impl Into<String>) -> InvocationRequest {
        InvocationRequest::new(user_id, text, self.deadline)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Pool slots free right now. Abandoned workers still occupy theirs.
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Timed-out computations that have not returned yet.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Refuse new work. Requests still queued for a permit fail with
    /// [`FailureReason::WorkerPoolClosed`]; running workers are unaffected.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `pipeline` for `request`.
    pub async fn invoke(
        &self,
        request: InvocationRequest,
        pipeline: Arc<dyn Pipeline>,
    ) -> InvocationOutcome {
        self.invoke_with(request, move |req| pipeline.compute(req))
            .await
    }

    /// Run an arbitrary blocking computation for `request`.
    pub async fn invoke_with<F>(&self, request: InvocationRequest, compute: F) -> InvocationOutcome
    where
        F: FnOnce(&InvocationRequest) -> Result<String, PipelineError> + Send + 'static,
    {
        let expires_at = request.expires_at();
        let request_id = request.id().clone();
        let user = request.user_label().to_owned();
        let cancel = request.cancellation().clone();

        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match tokio::time::timeout_at(expires_at, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                warn!(request_id = %request_id, user_id = %user, "worker pool closed, rejecting request");
                return InvocationOutcome::Failure(FailureReason::WorkerPoolClosed);
            }
            Err(_elapsed) => {
                cancel.cancel();
                warn!(
                    request_id = %request_id,
                    user_id = %user,
                    deadline_secs = request.deadline().as_secs_f64(),
                    "request expired while queued for a worker"
                );
                return InvocationOutcome::Timeout;
            }
        };

        let deadline = request.deadline();
        debug!(
            request_id = %request_id,
            user_id = %user,
            remaining_ms = request.remaining().as_millis() as u64,
            "dispatching to worker"
        );

        let mut worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            compute(&request)
        });

        match tokio::time::timeout_at(expires_at, &mut worker).await {
            Ok(joined) => settle(&request_id, &user, joined),
            Err(_elapsed) => {
                cancel.cancel();
                warn!(
                    request_id = %request_id,
                    user_id = %user,
                    deadline_secs = deadline.as_secs_f64(),
                    "pipeline exceeded deadline, abandoning worker"
                );
                self.abandon(request_id, worker);
                InvocationOutcome::Timeout
            }
        }
    }

    /// Let a timed-out worker finish in the background and throw away its result.
    fn abandon(&self, request_id: RequestId, worker: JoinHandle<Result<String, PipelineError>>) {
        let abandoned = Arc::clone(&self.abandoned);
        let _ = abandoned.fetch_add(1, Ordering::SeqCst);
        let since = Instant::now();

        tokio::spawn(async move {
            let joined = worker.await;
            let _ = abandoned.fetch_sub(1, Ordering::SeqCst);
            let overran_ms = since.elapsed().as_millis() as u64;
            match joined {
                Ok(Ok(text)) => info!(
                    request_id = %request_id,
                    overran_ms,
                    response_len = text.len(),
                    "abandoned computation finished, result discarded"
                ),
                Ok(Err(e)) => info!(
                    request_id = %request_id,
                    overran_ms,
                    error = %e,
                    "abandoned computation failed after deadline"
                ),
                Err(e) => warn!(
                    request_id = %request_id,
                    overran_ms,
                    error = %e,
                    "abandoned computation panicked"
                ),
            }
        });
    }
}

impl Default for BoundedInvoker {
    fn default() -> Self {
        Self::new(InvokerConfig::default())
    }
}

fn settle(
    request_id: &RequestId,
    user: &str,
    joined: Result<Result<String, PipelineError>, JoinError>,
) -> InvocationOutcome {
    match joined {
        Ok(Ok(text)) => {
            debug!(request_id = %request_id, user_id = %user, response_len = text.len(), "pipeline completed");
            InvocationOutcome::Success(text)
        }
        Ok(Err(e)) => {
            error!(
                request_id = %request_id,
                user_id = %user,
                error_kind = e.error_kind(),
                error = %e,
                "pipeline failed"
            );
            InvocationOutcome::Failure(FailureReason::PipelineError)
        }
        Err(e) => {
            error!(request_id = %request_id, user_id = %user, error = %e, "pipeline worker panicked");
            InvocationOutcome::Failure(FailureReason::PipelinePanicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicBool;

    fn invoker(workers: usize, deadline: Duration) -> BoundedInvoker {
        BoundedInvoker::new(InvokerConfig { workers, deadline })
    }

    struct Echo;

    impl Pipeline for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn compute(&self, request: &InvocationRequest) -> Result<String, PipelineError> {
            Ok(format!("echo: {}", request.text()))
        }
    }

    #[tokio::test]
    async fn success_returns_exact_value() {
        let inv = invoker(2, Duration::from_secs(2));
        let req = inv.admit(Some(UserId::from_raw("u1")), "hi");
        let outcome = inv
            .invoke_with(req, |_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok("  exact value\n".into())
            })
            .await;
        assert_eq!(outcome, InvocationOutcome::Success("  exact value\n".into()));
        assert_eq!(inv.available_workers(), 2);
    }

    #[tokio::test]
    async fn pipeline_trait_object() {
        let inv = invoker(1, Duration::from_secs(2));
        let req = inv.admit(None, "maize");
        let outcome = inv.invoke(req, Arc::new(Echo)).await;
        assert_eq!(outcome, InvocationOutcome::Success("echo: maize".into()));
    }

    #[tokio::test]
    async fn failure_does_not_leak_internal_detail() {
        let inv = invoker(1, Duration::from_secs(2));
        let req = inv.admit(None, "hi");
        let outcome = inv
            .invoke_with(req, |_| {
                Err(PipelineError::Internal("db password=hunter2 at 10.0.0.7".into()))
            })
            .await;
        assert_matches!(outcome, InvocationOutcome::Failure(FailureReason::PipelineError));
        if let InvocationOutcome::Failure(reason) = outcome {
            let surfaced = reason.to_string();
            assert!(!surfaced.contains("hunter2"));
            assert!(!surfaced.contains("10.0.0.7"));
        }
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let inv = invoker(1, Duration::from_secs(2));
        let req = inv.admit(None, "hi");
        let outcome = inv
            .invoke_with(req, |_| -> Result<String, PipelineError> {
                panic!("graph recursion limit")
            })
            .await;
        assert_eq!(outcome, InvocationOutcome::Failure(FailureReason::PipelinePanicked));
        // The permit is released even though the worker unwound.
        assert_eq!(inv.available_workers(), 1);
    }

    #[tokio::test]
    async fn timeout_returns_at_deadline_and_discards_late_result() {
        let inv = invoker(1, Duration::from_millis(50));
        let req = inv.admit(None, "slow");
        let start = Instant::now();
        let outcome = inv
            .invoke_with(req, |_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok("too late".into())
            })
            .await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, InvocationOutcome::Timeout);
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
        assert_eq!(inv.abandoned(), 1);
        // The abandoned worker still holds its slot.
        assert_eq!(inv.available_workers(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(inv.abandoned(), 0);
        assert_eq!(inv.available_workers(), 1);
    }

    #[tokio::test]
    async fn queueing_time_counts_against_deadline() {
        let inv = Arc::new(invoker(1, Duration::from_secs(5)));

        let busy = Arc::clone(&inv);
        let first = tokio::spawn(async move {
            let req = busy.admit(None, "long");
            busy.invoke_with(req, |_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok("first".into())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        let req = InvocationRequest::new(None, "queued", Duration::from_millis(100));
        let start = Instant::now();
        let outcome = inv
            .invoke_with(req, move |_| {
                ran_flag.store(true, Ordering::SeqCst);
                Ok("second".into())
            })
            .await;

        assert_eq!(outcome, InvocationOutcome::Timeout);
        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(first.await.unwrap(), InvocationOutcome::Success("first".into()));
        assert!(!ran.load(Ordering::SeqCst), "expired request must never start");
    }

    #[tokio::test]
    async fn timeout_fires_cancellation_hint() {
        let inv = invoker(1, Duration::from_millis(50));
        let req = inv.admit(None, "cooperative");
        let observed = Arc::new(AtomicBool::new(false));
        let observed_flag = Arc::clone(&observed);

        let outcome = inv
            .invoke_with(req, move |req| {
                for _ in 0..200 {
                    if req.cancellation().is_cancelled() {
                        observed_flag.store(true, Ordering::SeqCst);
                        return Err(PipelineError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok("never cancelled".into())
            })
            .await;

        assert_eq!(outcome, InvocationOutcome::Timeout);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(inv.abandoned(), 0);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let inv = Arc::new(invoker(2, Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let inv = Arc::clone(&inv);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let req = inv.admit(None, format!("q{i}"));
                inv.invoke_with(req, move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok("done".into())
                })
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), InvocationOutcome::Success("done".into()));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_pool_rejects_new_work() {
        let inv = invoker(1, Duration::from_secs(1));
        inv.close();
        let req = inv.admit(None, "late");
        let outcome = inv.invoke_with(req, |_| Ok("unreachable".into())).await;
        assert_eq!(outcome, InvocationOutcome::Failure(FailureReason::WorkerPoolClosed));
    }

    #[test]
    fn zero_workers_clamped_to_one() {
        let inv = invoker(0, Duration::from_secs(1));
        assert_eq!(inv.workers(), 1);
        assert_eq!(inv.available_workers(), 1);
    }

    #[test]
    fn oversized_config_is_clamped() {
        let inv = invoker(usize::MAX, Duration::MAX);
        assert_eq!(inv.workers(), Semaphore::MAX_PERMITS);
        assert_eq!(inv.deadline(), MAX_DEADLINE);
    }

    #[tokio::test]
    async fn oversized_deadline_still_answers() {
        let inv = invoker(1, Duration::from_secs(u64::MAX));
        let req = inv.admit(None, "hi");
        let outcome = inv.invoke(req, Arc::new(Echo)).await;
        assert_eq!(outcome, InvocationOutcome::Success("echo: hi".into()));
    }

    /// Pipeline panics are only contained if the release build unwinds.
    #[test]
    fn release_profile_unwinds() {
        let manifest = include_str!("../../../Cargo.toml");
        let release = manifest
            .split("[profile.release]")
            .nth(1)
            .expect("workspace manifest has a release profile");
        assert!(!release.contains("panic = \"abort\""));
    }

    #[test]
    fn defaults() {
        let inv = BoundedInvoker::default();
        assert_eq!(inv.deadline(), Duration::from_secs(30));
        assert_eq!(inv.workers(), DEFAULT_WORKERS);
    }

    #[test]
    fn outcome_kinds() {
        assert_eq!(InvocationOutcome::Success(String::new()).kind(), "success");
        assert_eq!(InvocationOutcome::Timeout.kind(), "timeout");
        assert_eq!(InvocationOutcome::Failure(FailureReason::PipelineError).kind(), "failure");
    }
}
