//! Stand-in pipelines for running the gateway without a reasoning backend.

use crate::error::PipelineError;
use crate::pipeline::{InvocationRequest, Pipeline};

/// Replies with the query text. Useful for smoke-testing a deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoPipeline;

impl Pipeline for EchoPipeline {
    fn name(&self) -> &str {
        "echo"
    }

    fn compute(&self, request: &InvocationRequest) -> Result<String, PipelineError> {
        Ok(format!("You said: {}", request.text()))
    }
}

/// A pipeline that never became ready. Queries get the initializing notice.
#[derive(Clone, Debug)]
pub struct UnconfiguredPipeline {
    reason: String,
}

impl UnconfiguredPipeline {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Pipeline for UnconfiguredPipeline {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn compute(&self, _request: &InvocationRequest) -> Result<String, PipelineError> {
        Err(PipelineError::Unavailable(self.reason.clone()))
    }

    fn is_ready(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn echo_repeats_text() {
        let request = InvocationRequest::new(None, "hi there", Duration::from_secs(1));
        assert_eq!(EchoPipeline.compute(&request).unwrap(), "You said: hi there");
        assert!(EchoPipeline.is_ready());
    }

    #[test]
    fn unconfigured_is_never_ready() {
        let pipeline = UnconfiguredPipeline::new("no model configured");
        let request = InvocationRequest::new(None, "hi", Duration::from_secs(1));
        assert!(!pipeline.is_ready());
        assert_matches!(
            pipeline.compute(&request),
            Err(PipelineError::Unavailable(reason)) if reason == "no model configured"
        );
    }
}
