/// Errors a reasoning pipeline may report from `compute`.
///
/// The contents are for logs only. Callers of the invoker see a
/// [`FailureReason`](crate::invoker::FailureReason), never this text.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline unavailable: {0}")]
    Unavailable(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}
