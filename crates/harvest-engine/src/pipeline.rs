//! Boundary to the reasoning subsystem.
//!
//! The gateway treats a pipeline as a synchronous black box: it may block for
//! any amount of time, return text, return an error, or panic. Everything
//! about bounding that is the invoker's job.

use std::time::Duration;

use harvest_core::ids::{RequestId, UserId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Longest deadline a request may carry; longer ones are capped.
pub const MAX_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// One admitted query. The deadline is fixed at admission and cannot change.
#[derive(Clone, Debug)]
pub struct InvocationRequest {
    id: RequestId,
    user_id: Option<UserId>,
    text: String,
    profile: Option<serde_json::Value>,
    admitted_at: Instant,
    deadline: Duration,
    cancel: CancellationToken,
}

impl InvocationRequest {
    /// Admit a request now. `user_id` is `None` for anonymous callers.
    pub fn new(user_id: Option<UserId>, text: impl Into<String>, deadline: Duration) -> Self {
        Self {
            id: RequestId::new(),
            user_id,
            text: text.into(),
            profile: None,
            admitted_at: Instant::now(),
            deadline: deadline.min(MAX_DEADLINE),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach profile context for the pipeline. Not interpreted by the gateway.
    #[must_use]
    pub fn with_profile(mut self, profile: serde_json::Value) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// `"anonymous"` when no identity is attached.
    pub fn user_label(&self) -> &str {
        self.user_id.as_ref().map_or("anonymous", UserId::as_str)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn profile(&self) -> Option<&serde_json::Value> {
        self.profile.as_ref()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Absolute instant after which the caller gets `Timeout`.
    pub fn expires_at(&self) -> Instant {
        self.admitted_at + self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }

    /// Cancelled by the invoker once the deadline passes. Pipelines that can
    /// stop early may poll it; nothing requires them to.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A reasoning engine that turns a query into response text.
pub trait Pipeline: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Runs on a blocking worker thread. May block indefinitely.
    fn compute(&self, request: &InvocationRequest) -> Result<String, crate::PipelineError>;

    /// `false` when the engine failed to initialize (missing model
    /// credentials, for example). Queries are then refused up front.
    fn is_ready(&self) -> bool {
        true
    }
}
