//! Query orchestration between a user's connection and the invoker.
//!
//! Each query runs on its own task, so one slow query never delays another.
//! Two concurrent queries from the same user may therefore be answered in
//! either order. Every query ends in exactly one message to the user, or
//! nothing if the user is gone by then; undeliverable replies are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harvest_core::errors::DeliveryError;
use harvest_core::ids::UserId;
use harvest_core::protocol::{Inbound, OutboundMessage};
use harvest_engine::{BoundedInvoker, InvocationOutcome, Pipeline};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;

pub const FAILURE_MESSAGE: &str =
    "I encountered an error while processing your request. Please try again or rephrase your question.";
pub const NOT_READY_MESSAGE: &str =
    "The system is currently initializing or missing configuration. Please try again later.";
pub const INVALID_MESSAGE: &str =
    "Invalid message. Send {\"type\": \"query\", \"text\": \"your question\"}.";
pub const EMPTY_RESPONSE_MESSAGE: &str =
    "I processed your request but didn't generate a response.";

/// User-facing text for a request that hit its deadline.
pub fn timeout_message(deadline: Duration) -> String {
    format!(
        "Your request is taking too long to process (timeout after {}s). \
         This might be due to a complex query or a system issue. \
         Please try a simpler question or try again later.",
        deadline.as_secs()
    )
}

/// Map an invocation outcome to the message the user sees.
pub fn render_outcome(outcome: &InvocationOutcome, deadline: Duration) -> OutboundMessage {
    match outcome {
        InvocationOutcome::Success(text) if text.trim().is_empty() => {
            OutboundMessage::response(EMPTY_RESPONSE_MESSAGE)
        }
        InvocationOutcome::Success(text) => OutboundMessage::response(text.clone()),
        InvocationOutcome::Timeout => OutboundMessage::timeout(timeout_message(deadline)),
        InvocationOutcome::Failure(_) => OutboundMessage::error(FAILURE_MESSAGE),
    }
}

/// Supplies per-user context handed to the pipeline untouched.
pub trait ProfileSource: Send + Sync {
    fn profile(&self, user_id: &UserId) -> Option<serde_json::Value>;
}

/// No profile context for anyone.
pub struct NoProfiles;

impl ProfileSource for NoProfiles {
    fn profile(&self, _user_id: &UserId) -> Option<serde_json::Value> {
        None
    }
}

/// Fixed in-memory profile table.
#[derive(Default)]
pub struct StaticProfiles {
    profiles: HashMap<UserId, serde_json::Value>,
}

impl StaticProfiles {
    pub fn new(profiles: HashMap<UserId, serde_json::Value>) -> Self {
        Self { profiles }
    }
}

impl ProfileSource for StaticProfiles {
    fn profile(&self, user_id: &UserId) -> Option<serde_json::Value> {
        self.profiles.get(user_id).cloned()
    }
}

pub struct QueryGateway {
    registry: Arc<ConnectionRegistry>,
    invoker: Arc<BoundedInvoker>,
    pipeline: Arc<dyn Pipeline>,
    profiles: Arc<dyn ProfileSource>,
    in_flight: TaskTracker,
}

impl QueryGateway {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        invoker: Arc<BoundedInvoker>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        Self {
            registry,
            invoker,
            pipeline,
            profiles: Arc::new(NoProfiles),
            in_flight: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn invoker(&self) -> &Arc<BoundedInvoker> {
        &self.invoker
    }

    pub fn pipeline_ready(&self) -> bool {
        self.pipeline.is_ready()
    }

    /// Queries and replies still being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Handle one raw client frame from `user_id`'s connection.
    ///
    /// Returns immediately; any work happens on a tracked task.
    pub fn dispatch(self: &Arc<Self>, user_id: UserId, raw: &str) {
        match Inbound::parse(raw) {
            Ok(Inbound::Query { text, claimed_user }) => {
                if let Some(claimed) = claimed_user.filter(|c| *c != user_id) {
                    warn!(
                        user_id = %user_id,
                        claimed_user = %claimed,
                        "envelope userId differs from connection identity, ignoring it"
                    );
                }
                let gateway = Arc::clone(self);
                let _ = self.in_flight.spawn(async move {
                    let _ = gateway.handle_query(&user_id, &text).await;
                });
            }
            Ok(Inbound::Unknown { kind }) => {
                info!(user_id = %user_id, kind = %kind, "ignoring unknown message type");
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "rejecting inbound message");
                let gateway = Arc::clone(self);
                let reply = OutboundMessage::error(INVALID_MESSAGE);
                let _ = self.in_flight.spawn(async move {
                    let _ = gateway.deliver(&user_id, reply).await;
                });
            }
        }
    }

    /// Process one query end to end and push the reply to `user_id`.
    pub async fn handle_query(&self, user_id: &UserId, text: &str) -> Result<(), DeliveryError> {
        if !self.pipeline.is_ready() {
            warn!(user_id = %user_id, pipeline = self.pipeline.name(), "pipeline not ready, refusing query");
            return self.deliver(user_id, OutboundMessage::error(NOT_READY_MESSAGE)).await;
        }

        let mut request = self.invoker.admit(Some(user_id.clone()), text);
        if let Some(profile) = self.profiles.profile(user_id) {
            request = request.with_profile(profile);
        }
        let request_id = request.id().clone();
        let started = Instant::now();

        let outcome = self.invoker.invoke(request, Arc::clone(&self.pipeline)).await;
        info!(
            request_id = %request_id,
            user_id = %user_id,
            outcome = outcome.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query finished"
        );

        let message = render_outcome(&outcome, self.invoker.deadline());
        self.deliver(user_id, message).await
    }

    /// Send to one user, logging the result. No retry.
    async fn deliver(&self, user_id: &UserId, message: OutboundMessage) -> Result<(), DeliveryError> {
        let result = self.registry.send_to(user_id, &message).await;
        match &result {
            Ok(()) => debug!(user_id = %user_id, kind = message.kind(), "reply delivered"),
            Err(DeliveryError::NotConnected) => debug!(
                user_id = %user_id,
                kind = message.kind(),
                "user disconnected before reply was ready, dropping it"
            ),
            Err(e) => warn!(
                user_id = %user_id,
                kind = message.kind(),
                error_kind = e.error_kind(),
                error = %e,
                "reply could not be delivered"
            ),
        }
        result
    }

    /// Stop accepting tracked work and wait up to `timeout` for in-flight
    /// queries. Returns `true` if everything finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let _ = self.in_flight.close();
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(pending, timeout_secs = timeout.as_secs(), "waiting for in-flight queries");
        }
        let finished = tokio::time::timeout(timeout, self.in_flight.wait()).await.is_ok();
        if !finished {
            warn!(remaining = self.in_flight.len(), "drain timed out, abandoning in-flight queries");
        }
        finished
    }
}
