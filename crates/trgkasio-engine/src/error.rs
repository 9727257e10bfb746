//! Error types for the audio data path.

use thiserror::Error;

/// Errors that can occur while bringing the data path up or talking to the
/// system audio layer.
///
/// Failures *inside* the real-time loops (ring overflow, sink underflow,
/// loopback underrun) are deliberately not represented here: they are
/// recovered locally with silence or a dropped block and surface only through
/// the log and the sink statistics.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Format negotiation exhausted every candidate for an endpoint.
    #[error("no suitable stream format for endpoint '{0}'")]
    FormatUnsupported(String),

    /// The system audio layer rejected an operation on an endpoint.
    #[error("endpoint '{id}': {reason}")]
    Endpoint {
        /// Identifier of the endpoint involved.
        id: String,
        /// What the system audio layer reported.
        reason: String,
    },

    /// No endpoint with the given identifier or friendly name exists.
    #[error("endpoint not found: '{0}'")]
    EndpointNotFound(String),

    /// The active audio system cannot perform this operation at all.
    #[error("unsupported by this audio system: {0}")]
    Unsupported(&'static str),

    /// A worker thread could not be spawned or failed during initialization.
    #[error("audio thread failed to start: {0}")]
    ThreadStart(String),
}

impl EngineError {
    /// Convenience constructor for endpoint-scoped failures.
    pub fn endpoint(id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Endpoint {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
