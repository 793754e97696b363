use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    /// The store could not be reached (network, timeout). State of the
    /// affected entity is unknown — retry, never treat as absent.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A consumer group referenced by a stream read does not exist.
    #[error("missing consumer group: {0}")]
    MissingGroup(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
