//! The hardware/codec collaborator behind each component.
//!
//! An [`Endpoint`] accepts buffers for I/O and later signals completion
//! through a callback invoked on a thread the audio service owns. The
//! engine never drives hardware directly; an [`AudioBackend`] creates
//! endpoints for each role.
//!
//! [`MockBackend`] provides endpoints that complete only when told to, so
//! the whole pipeline can be exercised without audio hardware.

mod clock;
mod mock;

pub use clock::DeviceClock;
pub use mock::{MockBackend, MockEndpoint};

use std::sync::Arc;

use crate::buffer::BufferHandle;
use crate::config::SampleFormat;
use crate::error::{EndpointError, EndpointRole};

/// Transport state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    /// Not running. Pending submissions are discarded.
    #[default]
    Stopped,
    /// Suspended. Pending submissions are kept but do not complete.
    Paused,
    /// Running. Submissions complete in order.
    Playing,
}

/// Callback invoked by an endpoint on its own thread.
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks a component registers with its endpoint.
#[derive(Clone, Default)]
pub struct EndpointCallbacks {
    /// Invoked once per completed buffer, in submission order.
    pub on_buffer_complete: Option<CompletionCallback>,
    /// Invoked once when decoded content is exhausted (decoders only).
    pub on_end_of_stream: Option<CompletionCallback>,
}

impl std::fmt::Debug for EndpointCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCallbacks")
            .field("on_buffer_complete", &self.on_buffer_complete.is_some())
            .field("on_end_of_stream", &self.on_end_of_stream.is_some())
            .finish()
    }
}

/// An audio device or codec that performs buffer I/O asynchronously.
///
/// # Contract
///
/// - `submit` only queues the buffer; the device fills (capture/decode) or
///   drains (playback) it later and then invokes `on_buffer_complete`.
/// - Completions are delivered in submission order.
/// - Once `set_state(PlayState::Stopped)` returns, no further completions
///   fire for buffers submitted before it.
/// - Callbacks must be invoked without any endpoint-internal lock held; the
///   handlers call straight back into `submit` and `set_state`.
pub trait Endpoint: Send + Sync {
    /// Which side of the echo path this endpoint serves.
    fn role(&self) -> EndpointRole;

    /// Hands a buffer to the device.
    fn submit(&self, buffer: BufferHandle) -> Result<(), EndpointError>;

    /// Requests a transport state change.
    fn set_state(&self, state: PlayState) -> Result<(), EndpointError>;

    /// Current transport state.
    fn state(&self) -> PlayState;

    /// Replaces the registered callbacks.
    fn register_callbacks(&self, callbacks: EndpointCallbacks);
}

impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn role(&self) -> EndpointRole {
        (**self).role()
    }

    fn submit(&self, buffer: BufferHandle) -> Result<(), EndpointError> {
        (**self).submit(buffer)
    }

    fn set_state(&self, state: PlayState) -> Result<(), EndpointError> {
        (**self).set_state(state)
    }

    fn state(&self) -> PlayState {
        (**self).state()
    }

    fn register_callbacks(&self, callbacks: EndpointCallbacks) {
        (**self).register_callbacks(callbacks);
    }
}

/// Factory for endpoints, one per platform audio API.
///
/// Creation covers everything the platform needs (object creation,
/// realization, interface lookup); any failure is reported as an error and
/// the engine leaves the component uncreated.
pub trait AudioBackend: Send + Sync {
    /// Creates a microphone capture endpoint.
    fn create_capture(&self, format: &SampleFormat) -> Result<Box<dyn Endpoint>, EndpointError>;

    /// Creates an endpoint that decodes `uri` to PCM.
    fn create_decoder(
        &self,
        format: &SampleFormat,
        uri: &str,
    ) -> Result<Box<dyn Endpoint>, EndpointError>;

    /// Creates a playback endpoint.
    fn create_player(&self, format: &SampleFormat) -> Result<Box<dyn Endpoint>, EndpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_state_default_is_stopped() {
        assert_eq!(PlayState::default(), PlayState::Stopped);
    }

    #[test]
    fn test_endpoint_is_object_safe_and_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn Endpoint>();
        assert_send_sync::<Box<dyn Endpoint>>();
        assert_send_sync::<Arc<dyn AudioBackend>>();
    }

    #[test]
    fn test_callbacks_debug_shows_registration() {
        let callbacks = EndpointCallbacks {
            on_buffer_complete: Some(Arc::new(|| {})),
            on_end_of_stream: None,
        };
        let debug = format!("{callbacks:?}");
        assert!(debug.contains("on_buffer_complete: true"));
        assert!(debug.contains("on_end_of_stream: false"));
    }
}
