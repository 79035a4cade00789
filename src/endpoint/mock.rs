//! Mock endpoints for testing without audio hardware.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use super::{AudioBackend, CompletionCallback, Endpoint, EndpointCallbacks, PlayState};
use crate::buffer::BufferHandle;
use crate::config::SampleFormat;
use crate::error::{EndpointError, EndpointRole};

/// An endpoint whose "hardware" completes buffers only when asked.
///
/// Capture and decode endpoints stamp each completed buffer with a
/// sequence number (starting at 1, little-endian `u32` repeated across the
/// buffer); playback endpoints log every payload they play. Together these
/// let tests check that audio comes out in the order it went in.
///
/// [`complete_next()`](Self::complete_next) plays the role of the audio
/// service thread: call it from any thread to deliver one completion.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_echo::{Endpoint, MockEndpoint, PlayState, SampleBuffer};
/// use audio_echo::EndpointRole;
///
/// let mic = MockEndpoint::new(EndpointRole::Capture);
/// mic.submit(Arc::new(SampleBuffer::new(0, 8))).unwrap();
///
/// assert!(!mic.complete_next()); // not playing yet
/// mic.set_state(PlayState::Playing).unwrap();
/// assert!(mic.complete_next());
/// assert_eq!(mic.pending_len(), 0);
/// ```
pub struct MockEndpoint {
    role: EndpointRole,
    // Held while callbacks run so a stop from another thread waits for
    // the completion in progress; reentrant because handlers change state
    delivery: ReentrantMutex<()>,
    inner: Mutex<MockState>,
    callbacks: RwLock<EndpointCallbacks>,
}

#[derive(Default)]
struct MockState {
    state: PlayState,
    pending: VecDeque<BufferHandle>,
    submitted_total: usize,
    completed_total: usize,
    state_log: Vec<PlayState>,
    played: Vec<Vec<u8>>,
    next_sequence: u32,
    remaining: Option<usize>,
    end_of_stream_sent: bool,
    reject_submits: bool,
}

impl MockEndpoint {
    /// Creates an endpoint with unlimited content.
    pub fn new(role: EndpointRole) -> Self {
        Self {
            role,
            delivery: ReentrantMutex::new(()),
            inner: Mutex::new(MockState {
                next_sequence: 1,
                ..MockState::default()
            }),
            callbacks: RwLock::new(EndpointCallbacks::default()),
        }
    }

    /// Creates a decoder that produces `buffers` buffers, then signals
    /// end-of-stream.
    pub fn decoder(buffers: usize) -> Self {
        let endpoint = Self::new(EndpointRole::Decode);
        endpoint.inner.lock().remaining = Some(buffers);
        endpoint
    }

    /// Simulates the device finishing the oldest submitted buffer.
    ///
    /// Returns `false` without doing anything if the endpoint is not
    /// playing or has nothing pending. A decoder that just completed its
    /// last buffer also fires end-of-stream.
    pub fn complete_next(&self) -> bool {
        let _delivery = self.delivery.lock();
        let end_of_stream = {
            let mut inner = self.inner.lock();
            if inner.state != PlayState::Playing || inner.remaining == Some(0) {
                return false;
            }
            let Some(buffer) = inner.pending.pop_front() else {
                return false;
            };

            match self.role {
                EndpointRole::Capture | EndpointRole::Decode => {
                    let sequence = inner.next_sequence;
                    inner.next_sequence = inner.next_sequence.wrapping_add(1);
                    stamp(&buffer, sequence);
                }
                EndpointRole::Playback => inner.played.push(buffer.to_vec()),
            }
            inner.completed_total += 1;

            if let Some(remaining) = inner.remaining.as_mut() {
                *remaining -= 1;
            }
            let finished = inner.remaining == Some(0) && !inner.end_of_stream_sent;
            if finished {
                inner.end_of_stream_sent = true;
            }
            finished
        };

        let callbacks = self.callbacks.read().clone();
        fire(callbacks.on_buffer_complete.as_ref());
        if end_of_stream {
            fire(callbacks.on_end_of_stream.as_ref());
        }
        true
    }

    /// Delivers up to `max` completions, stopping early when idle.
    ///
    /// Returns how many were delivered.
    pub fn complete(&self, max: usize) -> usize {
        (0..max).take_while(|_| self.complete_next()).count()
    }

    /// Number of buffers the device currently holds.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Total buffers ever accepted by `submit`.
    pub fn submitted_total(&self) -> usize {
        self.inner.lock().submitted_total
    }

    /// Total completions delivered.
    pub fn completed_total(&self) -> usize {
        self.inner.lock().completed_total
    }

    /// Every state requested through `set_state`, in order.
    pub fn state_log(&self) -> Vec<PlayState> {
        self.inner.lock().state_log.clone()
    }

    /// Number of times `state` was requested.
    pub fn state_requests(&self, state: PlayState) -> usize {
        self.inner
            .lock()
            .state_log
            .iter()
            .filter(|s| **s == state)
            .count()
    }

    /// Payloads played so far (playback endpoints only).
    pub fn played(&self) -> Vec<Vec<u8>> {
        self.inner.lock().played.clone()
    }

    /// Sequence numbers of the non-silent payloads played so far.
    pub fn played_sequences(&self) -> Vec<u32> {
        self.inner
            .lock()
            .played
            .iter()
            .filter(|payload| payload.iter().any(|&b| b != 0))
            .filter_map(|payload| payload.get(..4))
            .map(|head| u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
            .collect()
    }

    /// Makes every subsequent `submit` fail with [`EndpointError::Rejected`].
    pub fn reject_submits(&self, reject: bool) {
        self.inner.lock().reject_submits = reject;
    }
}

impl Endpoint for MockEndpoint {
    fn role(&self) -> EndpointRole {
        self.role
    }

    fn submit(&self, buffer: BufferHandle) -> Result<(), EndpointError> {
        let mut inner = self.inner.lock();
        if inner.reject_submits {
            return Err(EndpointError::Rejected);
        }
        inner.pending.push_back(buffer);
        inner.submitted_total += 1;
        Ok(())
    }

    fn set_state(&self, state: PlayState) -> Result<(), EndpointError> {
        let _delivery = self.delivery.lock();
        let mut inner = self.inner.lock();
        inner.state_log.push(state);
        inner.state = state;
        if state == PlayState::Stopped {
            inner.pending.clear();
        }
        Ok(())
    }

    fn state(&self) -> PlayState {
        self.inner.lock().state
    }

    fn register_callbacks(&self, callbacks: EndpointCallbacks) {
        *self.callbacks.write() = callbacks;
    }
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MockEndpoint")
            .field("role", &self.role)
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .finish()
    }
}

fn stamp(buffer: &BufferHandle, sequence: u32) {
    let bytes = sequence.to_le_bytes();
    buffer.with_storage_mut(|storage| {
        for (dst, src) in storage.iter_mut().zip(bytes.iter().cycle()) {
            *dst = *src;
        }
    });
}

fn fire(callback: Option<&CompletionCallback>) {
    if let Some(callback) = callback {
        callback();
    }
}

/// Backend that hands out [`MockEndpoint`]s and keeps them for inspection.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_echo::{EchoEngine, EngineConfig, EndpointRole, MockBackend};
///
/// let backend = Arc::new(MockBackend::new());
/// let engine = EchoEngine::initialize(EngineConfig::default(), backend.clone()).unwrap();
/// engine.create_sink().unwrap();
///
/// assert!(backend.latest(EndpointRole::Playback).is_some());
/// ```
#[derive(Default)]
pub struct MockBackend {
    decode_buffers: Option<usize>,
    failing: Mutex<HashSet<EndpointRole>>,
    created: Mutex<Vec<Arc<MockEndpoint>>>,
}

impl MockBackend {
    /// Creates a backend whose decoders never run out of content.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoders created by this backend produce `buffers` buffers each.
    pub fn with_decode_length(buffers: usize) -> Self {
        Self {
            decode_buffers: Some(buffers),
            ..Self::default()
        }
    }

    /// Makes creation of `role` endpoints fail (or succeed again).
    pub fn fail_creation(&self, role: EndpointRole, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(role);
        } else {
            failing.remove(&role);
        }
    }

    /// Every endpoint created so far, oldest first.
    pub fn endpoints(&self) -> Vec<Arc<MockEndpoint>> {
        self.created.lock().clone()
    }

    /// Endpoints still owned by a component (dropped ones are pruned).
    pub fn live_endpoints(&self) -> Vec<Arc<MockEndpoint>> {
        let mut created = self.created.lock();
        created.retain(|ep| Arc::strong_count(ep) > 1);
        created.clone()
    }

    /// The most recently created endpoint for `role`.
    pub fn latest(&self, role: EndpointRole) -> Option<Arc<MockEndpoint>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|ep| ep.role() == role)
            .cloned()
    }

    /// Number of endpoints created for `role`.
    pub fn created_count(&self, role: EndpointRole) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|ep| ep.role() == role)
            .count()
    }

    fn create(&self, endpoint: MockEndpoint) -> Result<Box<dyn Endpoint>, EndpointError> {
        let role = endpoint.role();
        if self.failing.lock().contains(&role) {
            return Err(EndpointError::backend(format!("mock {role} creation disabled")));
        }
        let endpoint = Arc::new(endpoint);
        self.created.lock().push(Arc::clone(&endpoint));
        Ok(Box::new(endpoint))
    }
}

impl AudioBackend for MockBackend {
    fn create_capture(&self, _format: &SampleFormat) -> Result<Box<dyn Endpoint>, EndpointError> {
        self.create(MockEndpoint::new(EndpointRole::Capture))
    }

    fn create_decoder(
        &self,
        _format: &SampleFormat,
        uri: &str,
    ) -> Result<Box<dyn Endpoint>, EndpointError> {
        if uri.is_empty() {
            return Err(EndpointError::backend("empty decode URI"));
        }
        let endpoint = match self.decode_buffers {
            Some(buffers) => MockEndpoint::decoder(buffers),
            None => MockEndpoint::new(EndpointRole::Decode),
        };
        self.create(endpoint)
    }

    fn create_player(&self, _format: &SampleFormat) -> Result<Box<dyn Endpoint>, EndpointError> {
        self.create(MockEndpoint::new(EndpointRole::Playback))
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("decode_buffers", &self.decode_buffers)
            .field("created", &self.created.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn buf(id: usize) -> BufferHandle {
        Arc::new(SampleBuffer::new(id, 8))
    }

    #[test]
    fn test_completes_in_submission_order() {
        let mic = MockEndpoint::new(EndpointRole::Capture);
        let a = buf(0);
        let b = buf(1);
        mic.submit(a.clone()).unwrap();
        mic.submit(b.clone()).unwrap();
        mic.set_state(PlayState::Playing).unwrap();

        assert_eq!(mic.complete(10), 2);
        a.mark_full();
        b.mark_full();
        assert_eq!(&a.to_vec()[..4], &1u32.to_le_bytes());
        assert_eq!(&b.to_vec()[..4], &2u32.to_le_bytes());
    }

    #[test]
    fn test_paused_endpoint_keeps_pending() {
        let mic = MockEndpoint::new(EndpointRole::Capture);
        mic.submit(buf(0)).unwrap();
        mic.set_state(PlayState::Paused).unwrap();

        assert!(!mic.complete_next());
        assert_eq!(mic.pending_len(), 1);
    }

    #[test]
    fn test_stop_discards_pending() {
        let mic = MockEndpoint::new(EndpointRole::Capture);
        mic.submit(buf(0)).unwrap();
        mic.set_state(PlayState::Playing).unwrap();
        mic.set_state(PlayState::Stopped).unwrap();

        assert_eq!(mic.pending_len(), 0);
        assert!(!mic.complete_next());
        assert_eq!(
            mic.state_log(),
            vec![PlayState::Playing, PlayState::Stopped]
        );
    }

    #[test]
    fn test_callback_can_resubmit() {
        let mic = Arc::new(MockEndpoint::new(EndpointRole::Capture));
        let count = Arc::new(AtomicUsize::new(0));
        let resubmit = {
            let mic = Arc::downgrade(&mic);
            let count = Arc::clone(&count);
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(mic) = mic.upgrade() {
                    mic.submit(buf(9)).unwrap();
                }
            })
        };
        mic.register_callbacks(EndpointCallbacks {
            on_buffer_complete: Some(resubmit),
            on_end_of_stream: None,
        });

        mic.submit(buf(0)).unwrap();
        mic.set_state(PlayState::Playing).unwrap();
        assert_eq!(mic.complete(3), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(mic.pending_len(), 1);
    }

    #[test]
    fn test_decoder_signals_end_of_stream_once() {
        let decoder = MockEndpoint::decoder(2);
        let eos = Arc::new(AtomicUsize::new(0));
        let eos_clone = Arc::clone(&eos);
        decoder.register_callbacks(EndpointCallbacks {
            on_buffer_complete: None,
            on_end_of_stream: Some(Arc::new(move || {
                eos_clone.fetch_add(1, Ordering::SeqCst);
            })),
        });

        for id in 0..3 {
            decoder.submit(buf(id)).unwrap();
        }
        decoder.set_state(PlayState::Playing).unwrap();

        assert_eq!(decoder.complete(10), 2);
        assert_eq!(eos.load(Ordering::SeqCst), 1);
        assert_eq!(decoder.pending_len(), 1);
    }

    #[test]
    fn test_player_logs_payloads() {
        let player = MockEndpoint::new(EndpointRole::Playback);
        let b = buf(0);
        b.write(&7u32.to_le_bytes());
        player.submit(b).unwrap();
        player.submit(Arc::new(SampleBuffer::silent(8))).unwrap();
        player.set_state(PlayState::Playing).unwrap();

        assert_eq!(player.complete(5), 2);
        assert_eq!(player.played().len(), 2);
        assert_eq!(player.played_sequences(), vec![7]);
    }

    #[test]
    fn test_rejected_submit() {
        let player = MockEndpoint::new(EndpointRole::Playback);
        player.reject_submits(true);
        assert_eq!(player.submit(buf(0)), Err(EndpointError::Rejected));
        assert_eq!(player.submitted_total(), 0);
    }

    #[test]
    fn test_backend_failure_and_tracking() {
        let backend = MockBackend::new();
        let format = SampleFormat::default();

        backend.fail_creation(EndpointRole::Capture, true);
        assert!(backend.create_capture(&format).is_err());

        backend.fail_creation(EndpointRole::Capture, false);
        let endpoint = backend.create_capture(&format).unwrap();
        assert_eq!(endpoint.role(), EndpointRole::Capture);
        assert_eq!(backend.created_count(EndpointRole::Capture), 1);
        assert_eq!(backend.live_endpoints().len(), 1);

        drop(endpoint);
        assert!(backend.live_endpoints().is_empty());
    }

    #[test]
    fn test_backend_rejects_empty_uri() {
        let backend = MockBackend::with_decode_length(4);
        assert!(backend.create_decoder(&SampleFormat::default(), "").is_err());
        assert!(backend
            .create_decoder(&SampleFormat::default(), "file:///tmp/a.wav")
            .is_ok());
    }
}
