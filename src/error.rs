use thiserror::Error;

use crate::cache::ObjectId;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown object id {0}")]
    UnknownObject(ObjectId),

    #[error("Unknown object id 0 (object ids are nonzero)")]
    NullObject,

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Submission rejected by device: {0}")]
    Submission(String),

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Device fault: {0}")]
    Device(String),
}

impl StreamError {
    /// Whether the caller can reconfigure and retry after this error.
    ///
    /// Submission and device faults poison the owning scheduler/cache pair.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::Configuration(_)
                | StreamError::Capacity(_)
                | StreamError::UnknownObject(_)
                | StreamError::NullObject
        )
    }

    /// Copy of this error for a second recipient (the failed call's future).
    pub(crate) fn duplicate(&self) -> StreamError {
        match self {
            StreamError::Io(e) => StreamError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StreamError::Json(e) => StreamError::Configuration(e.to_string()),
            StreamError::Configuration(s) => StreamError::Configuration(s.clone()),
            StreamError::UnknownObject(id) => StreamError::UnknownObject(*id),
            StreamError::NullObject => StreamError::NullObject,
            StreamError::Capacity(s) => StreamError::Capacity(s.clone()),
            StreamError::Submission(s) => StreamError::Submission(s.clone()),
            StreamError::ResourceExhaustion(s) => StreamError::ResourceExhaustion(s.clone()),
            StreamError::Device(s) => StreamError::Device(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
