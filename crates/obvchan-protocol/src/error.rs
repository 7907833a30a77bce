use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message too large: {0} bytes (max 1048576)")]
    MessageTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}
