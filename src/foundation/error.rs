/// Convenience result alias used across the crate.
pub type RenderResultT<T> = Result<T, RenderError>;

/// Every failure a render can settle with.
///
/// Cancellation ([`RenderError::Aborted`]), hangs ([`RenderError::Timeout`]) and a faulted
/// worker thread ([`RenderError::WorkerCrashed`]) are separate variants so callers can tell
/// "user cancelled" apart from "something broke".
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no usable tracks: every track is missing an audio source")]
    NoUsableTracks,

    #[error("zero duration: the mixed audio contains no samples")]
    ZeroDuration,

    #[error("network error: failed to fetch {resource}: HTTP {status}")]
    Network { resource: String, status: u16 },

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("render aborted")]
    Aborted,

    #[error("render timed out after {0:?} without a response from the encoder")]
    Timeout(std::time::Duration),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RenderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        Self::WorkerCrashed(msg.into())
    }

    /// `true` for the cancellation outcome.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
