use thiserror::Error;

/// Failure reported by an external model collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// The model could not be reached or admitted in time; retrying the
    /// next frame may succeed.
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
}
