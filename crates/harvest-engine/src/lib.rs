pub mod error;
pub mod invoker;
pub mod pipeline;
pub mod pipelines;

pub use error::PipelineError;
pub use invoker::{BoundedInvoker, FailureReason, InvocationOutcome, InvokerConfig};
pub use pipeline::{InvocationRequest, Pipeline, MAX_DEADLINE};
