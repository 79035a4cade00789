//! Error types for audio-echo.
//!
//! Errors are split into two categories:
//! - **Host-facing errors** ([`EchoError`]): returned by the engine's control
//!   surface when a create/start/stop call cannot complete
//! - **Endpoint errors** ([`EndpointError`]): reported by the hardware/codec
//!   collaborator behind an [`Endpoint`](crate::Endpoint)
//!
//! Queue full/empty conditions are not errors at all; they are ordinary
//! control-flow signals returned as `bool`/`Option`.

use std::fmt;

/// Which side of the echo path a component sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Microphone capture source.
    Capture,
    /// File/URI decode source.
    Decode,
    /// Playback sink.
    Playback,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Capture => "capture",
            Self::Decode => "decode",
            Self::Playback => "playback",
        };
        f.write_str(name)
    }
}

/// Errors returned by the engine's host-facing control surface.
///
/// Every variant is logged before it is returned. A failed `create_*` call
/// leaves the engine in the "not created" state for that component.
#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    /// The configuration cannot drive a pipeline.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The buffer pool could not be allocated.
    #[error("failed to allocate {count} buffers of {capacity} bytes")]
    AllocationFailed {
        /// Requested number of buffers.
        count: usize,
        /// Requested capacity of each buffer.
        capacity: usize,
    },

    /// The backend could not create or realize an endpoint.
    #[error("failed to create {role} endpoint: {source}")]
    EndpointCreation {
        /// Role of the endpoint being created.
        role: EndpointRole,
        /// The backend failure.
        #[source]
        source: EndpointError,
    },

    /// An endpoint rejected a submit or state change.
    #[error("{role} endpoint failed: {source}")]
    Endpoint {
        /// Role of the failing endpoint.
        role: EndpointRole,
        /// The backend failure.
        #[source]
        source: EndpointError,
    },

    /// A component was started before its queues were wired.
    #[error("{role} component started without free/ready queues")]
    MissingQueues {
        /// Role of the component.
        role: EndpointRole,
    },

    /// The operation needs a playback sink and none has been created.
    #[error("no playback sink created - call create_sink() first")]
    NoSink,

    /// The operation needs a source and none has been created.
    #[error("no source created - call create_source() first")]
    NoSource,

    /// A decoder restart was requested but no decode URI is known.
    #[error("no decode URI to restart from")]
    NoDecodeUri,

    /// A component of this role already exists.
    #[error("{role} component already created")]
    AlreadyCreated {
        /// Role of the existing component.
        role: EndpointRole,
    },
}

impl EchoError {
    pub(crate) fn endpoint(role: EndpointRole, source: EndpointError) -> Self {
        Self::Endpoint { role, source }
    }
}

/// Errors reported by an [`Endpoint`](crate::Endpoint) or
/// [`AudioBackend`](crate::AudioBackend) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The device rejected the buffer.
    #[error("buffer rejected by device")]
    Rejected,

    /// Failure from the underlying audio API.
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl EndpointError {
    /// Creates a backend error with the given message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_error_display() {
        let err = EchoError::AllocationFailed {
            count: 16,
            capacity: 480,
        };
        assert_eq!(err.to_string(), "failed to allocate 16 buffers of 480 bytes");
    }

    #[test]
    fn test_endpoint_creation_display_includes_role() {
        let err = EchoError::EndpointCreation {
            role: EndpointRole::Decode,
            source: EndpointError::backend("unsupported container"),
        };
        assert_eq!(
            err.to_string(),
            "failed to create decode endpoint: audio backend error: unsupported container"
        );
    }

    #[test]
    fn test_endpoint_error_source_chain() {
        use std::error::Error;

        let err = EchoError::endpoint(EndpointRole::Playback, EndpointError::Rejected);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("buffer rejected by device"));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(EndpointRole::Capture.to_string(), "capture");
        assert_eq!(EndpointRole::Playback.to_string(), "playback");
    }
}
