pub mod error;
pub mod retry;
pub mod token_estimator;

pub use error::{AgentError, ApiError};
pub use retry::{with_timeout, Backoff};
