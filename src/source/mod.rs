//! Capture/decode source component.
//!
//! An [`AudioSource`] keeps its endpoint fed with empty buffers from the
//! free pool and moves every completed buffer into the ready queue. It
//! fires the one-shot player kickstart and parks its endpoint when either
//! side of the pipeline backs up.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::endpoint::{CompletionCallback, Endpoint, EndpointCallbacks, PlayState};
use crate::error::{EchoError, EndpointRole};
use crate::event::{EngineEvent, EventEmitter, PauseReason};
use crate::pipeline::{AudioQueue, BufferQueues, EngineMessage, ServiceCallback, ServiceReply};

/// Where a source's audio comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Live microphone capture.
    Capture,
    /// PCM decoded from a file or URI.
    Decode {
        /// The content being decoded.
        uri: String,
    },
}

impl SourceKind {
    /// The endpoint role serving this kind of source.
    pub fn role(&self) -> EndpointRole {
        match self {
            Self::Capture => EndpointRole::Capture,
            Self::Decode { .. } => EndpointRole::Decode,
        }
    }
}

/// Producer side of the echo path.
///
/// Buffers flow `free → shadow → ready`. The shadow queue mirrors exactly
/// what the endpoint holds, in submission order, so each completion pops
/// the buffer the device just filled.
///
/// # Lifecycle
///
/// 1. [`new()`](Self::new) registers completion callbacks with the endpoint
/// 2. [`set_buf_queues()`](Self::set_buf_queues) and
///    [`register_service()`](Self::register_service) wire it to the engine
/// 3. [`start()`](Self::start) seeds the endpoint and begins producing
/// 4. [`stop()`](Self::stop) halts the endpoint and returns every in-flight
///    buffer to the free pool; dropping the source does the same
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_echo::{
///     AudioQueue, AudioSource, EngineConfig, EndpointRole, MockEndpoint, SampleBuffer,
///     SourceKind,
/// };
///
/// let config = EngineConfig::low_latency(48000, 96);
/// let free = Arc::new(AudioQueue::new(config.buffer_count));
/// let ready = Arc::new(AudioQueue::new(config.buffer_count));
/// for id in 0..config.buffer_count {
///     free.push(Arc::new(SampleBuffer::new(id, 192)));
/// }
///
/// let mic = Arc::new(MockEndpoint::new(EndpointRole::Capture));
/// let source = AudioSource::new(SourceKind::Capture, Box::new(mic.clone()), &config);
/// source.set_buf_queues(free.clone(), ready.clone());
/// source.start().unwrap();
///
/// mic.complete(2);
/// assert_eq!(ready.size(), 2);
/// assert_eq!(source.in_flight(), 2);
///
/// source.stop().unwrap();
/// assert_eq!(free.size(), config.buffer_count - 2);
/// ```
pub struct AudioSource {
    kind: SourceKind,
    endpoint: Box<dyn Endpoint>,
    shadow: AudioQueue,
    queues: OnceLock<BufferQueues>,
    service: OnceLock<ServiceCallback>,
    events: EventEmitter,
    // Serializes free → endpoint → shadow so the shadow queue keeps
    // submission order
    feed_lock: Mutex<()>,
    source_kickstart: usize,
    play_kickstart: usize,
    delivered: AtomicUsize,
    kickstart_fired: AtomicBool,
    buffers_captured: AtomicU64,
    pauses: AtomicU64,
}

impl AudioSource {
    /// Creates a source around `endpoint`.
    pub fn new(kind: SourceKind, endpoint: Box<dyn Endpoint>, config: &EngineConfig) -> Arc<Self> {
        Self::with_events(kind, endpoint, config, EventEmitter::default())
    }

    pub(crate) fn with_events(
        kind: SourceKind,
        endpoint: Box<dyn Endpoint>,
        config: &EngineConfig,
        events: EventEmitter,
    ) -> Arc<Self> {
        let source = Arc::new(Self {
            kind,
            endpoint,
            shadow: AudioQueue::new(config.shadow_queue_len),
            queues: OnceLock::new(),
            service: OnceLock::new(),
            events,
            feed_lock: Mutex::new(()),
            source_kickstart: config.source_kickstart_buffers,
            play_kickstart: config.play_kickstart_buffers,
            delivered: AtomicUsize::new(0),
            kickstart_fired: AtomicBool::new(false),
            buffers_captured: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
        });

        let on_complete: CompletionCallback = {
            let source: Weak<Self> = Arc::downgrade(&source);
            Arc::new(move || {
                if let Some(source) = source.upgrade() {
                    source.on_buffer_complete();
                }
            })
        };
        let on_end_of_stream: Option<CompletionCallback> = match source.kind {
            SourceKind::Capture => None,
            SourceKind::Decode { .. } => {
                let source: Weak<Self> = Arc::downgrade(&source);
                Some(Arc::new(move || {
                    if let Some(source) = source.upgrade() {
                        source.on_end_of_stream();
                    }
                }))
            }
        };
        source.endpoint.register_callbacks(EndpointCallbacks {
            on_buffer_complete: Some(on_complete),
            on_end_of_stream,
        });

        source
    }

    /// Wires the shared free pool and ready queue. Only the first call counts.
    pub fn set_buf_queues(&self, free: Arc<AudioQueue>, ready: Arc<AudioQueue>) {
        if self.queues.set(BufferQueues { free, ready }).is_err() {
            tracing::warn!(role = %self.role(), "buffer queues already wired, ignoring");
        }
    }

    /// Registers the engine callback for control messages. Only the first
    /// call counts.
    pub fn register_service(&self, service: ServiceCallback) {
        if self.service.set(service).is_err() {
            tracing::warn!(role = %self.role(), "service callback already registered, ignoring");
        }
    }

    /// What this source produces.
    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Role of the underlying endpoint.
    pub fn role(&self) -> EndpointRole {
        self.kind.role()
    }

    /// Starts a fresh session.
    ///
    /// Submits up to `source_kickstart_buffers` free buffers and sets the
    /// endpoint playing. Fewer buffers are submitted (and
    /// [`EngineEvent::SourceStarved`] emitted) if the free pool runs short.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::MissingQueues`] if the queues were never wired,
    /// or [`EchoError::Endpoint`] if the endpoint refuses to start.
    pub fn start(&self) -> Result<(), EchoError> {
        let queues = self.wired_queues()?;
        self.stop()?;

        self.delivered.store(0, Ordering::SeqCst);
        self.kickstart_fired.store(false, Ordering::SeqCst);

        let seeded = self.feed(queues, self.source_kickstart);
        if seeded < self.source_kickstart {
            tracing::warn!(
                role = %self.role(),
                seeded,
                wanted = self.source_kickstart,
                "free pool short at start"
            );
            self.events.emit(EngineEvent::SourceStarved);
        }

        self.play(queues)?;
        tracing::info!(role = %self.role(), seeded, "source started");
        Ok(())
    }

    /// Starts without re-arming the player kickstart.
    ///
    /// Used when a decoder is recreated while playback keeps running: only
    /// one buffer is seeded and the delivered count starts past the
    /// kickstart threshold.
    ///
    /// # Errors
    ///
    /// Same as [`start()`](Self::start).
    pub fn soft_start(&self) -> Result<(), EchoError> {
        let queues = self.wired_queues()?;
        self.stop()?;

        self.delivered
            .store(self.play_kickstart + 1, Ordering::SeqCst);
        self.kickstart_fired.store(true, Ordering::SeqCst);

        if self.feed(queues, 1) == 0 {
            tracing::warn!(role = %self.role(), "free pool empty at soft start");
            self.events.emit(EngineEvent::SourceStarved);
        }

        self.play(queues)?;
        tracing::info!(role = %self.role(), "source soft-started");
        Ok(())
    }

    /// Resumes a parked source once buffers are available again.
    ///
    /// Refills the shadow queue first; a source that still has nothing to
    /// submit stays parked. Stopped sources and sources already producing
    /// are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::Endpoint`] if a state change is refused.
    pub fn resume(&self) -> Result<(), EchoError> {
        let Some(queues) = self.queues.get() else {
            return Ok(());
        };

        match self.endpoint.state() {
            PlayState::Stopped => return Ok(()),
            PlayState::Playing if !self.shadow.is_empty() => return Ok(()),
            // Playing with nothing submitted: park it so the refill below
            // cannot race a completion
            PlayState::Playing => self.set_state(PlayState::Paused)?,
            PlayState::Paused => {}
        }

        self.feed(queues, self.shadow.capacity());
        if self.shadow.is_empty() {
            tracing::debug!(role = %self.role(), "no free buffers, source stays paused");
            return Ok(());
        }

        self.set_state(PlayState::Playing)?;
        tracing::debug!(role = %self.role(), in_flight = self.shadow.size(), "source resumed");
        self.events.emit(EngineEvent::SourceResumed);
        Ok(())
    }

    /// Stops the endpoint and returns every in-flight buffer to the free pool.
    ///
    /// Stopping an already stopped source is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::Endpoint`] if the endpoint refuses to stop; the
    /// in-flight buffers stay where they are in that case.
    pub fn stop(&self) -> Result<(), EchoError> {
        if self.endpoint.state() != PlayState::Stopped {
            self.set_state(PlayState::Stopped)?;
            tracing::debug!(role = %self.role(), "source stopped");
        }
        self.drain_shadow();
        Ok(())
    }

    /// Buffers currently held by the endpoint.
    pub fn in_flight(&self) -> usize {
        self.shadow.size()
    }

    /// Current endpoint state.
    pub fn state(&self) -> PlayState {
        self.endpoint.state()
    }

    /// Returns `true` if a backpressure valve has parked the endpoint.
    pub fn is_paused(&self) -> bool {
        self.endpoint.state() == PlayState::Paused
    }

    /// Buffers moved to the ready queue since creation.
    pub fn buffers_captured(&self) -> u64 {
        self.buffers_captured.load(Ordering::Relaxed)
    }

    /// Times a backpressure valve parked the endpoint.
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    fn on_buffer_complete(&self) {
        let Some(queues) = self.queues.get() else {
            return;
        };
        let Some(buffer) = self.shadow.pop() else {
            tracing::warn!(role = %self.role(), "completion with no buffer in flight");
            return;
        };

        buffer.mark_full();
        let id = buffer.id();
        if queues.ready.push(Arc::clone(&buffer)) {
            self.buffers_captured.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(role = %self.role(), buffer = id, "ready queue full, dropping audio");
            queues.recycle(buffer);
        }

        self.feed(queues, self.shadow.capacity());

        let delivered = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        if delivered >= self.play_kickstart && !self.kickstart_fired.swap(true, Ordering::SeqCst) {
            tracing::debug!(role = %self.role(), delivered, "kickstarting player");
            if self.post(EngineMessage::KickstartPlayer) == ServiceReply::Continue {
                // Not taken up; ask again on the next completion
                self.kickstart_fired.store(false, Ordering::SeqCst);
            }
        }

        if self.shadow.is_empty() {
            self.pause(PauseReason::FreePoolExhausted);
        } else if queues.ready.size() + self.shadow.capacity() >= queues.ready.capacity() {
            self.pause(PauseReason::ReadyQueueSaturated);
        }
    }

    fn on_end_of_stream(&self) {
        tracing::info!(
            role = %self.role(),
            delivered = self.delivered.load(Ordering::Relaxed),
            "end of stream"
        );
        self.post(EngineMessage::DecodingFinished);
    }

    /// Moves up to `max` free buffers into the endpoint. Returns how many.
    fn feed(&self, queues: &BufferQueues, max: usize) -> usize {
        let _guard = self.feed_lock.lock();
        let mut fed = 0;

        while fed < max && !self.shadow.is_full() {
            let Some(buffer) = queues.free.pop() else {
                break;
            };
            if let Err(e) = self.endpoint.submit(Arc::clone(&buffer)) {
                tracing::error!(role = %self.role(), error = %e, "submit failed");
                queues.recycle(buffer);
                break;
            }
            if !self.shadow.push(buffer) {
                tracing::error!(role = %self.role(), "shadow queue overflow");
                break;
            }
            fed += 1;
        }
        fed
    }

    fn pause(&self, reason: PauseReason) {
        if self.endpoint.state() != PlayState::Playing {
            return;
        }
        if let Err(e) = self.endpoint.set_state(PlayState::Paused) {
            tracing::error!(role = %self.role(), error = %e, "failed to pause source");
            return;
        }
        self.pauses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(role = %self.role(), ?reason, "source paused");
        self.events.emit(EngineEvent::SourcePaused { reason });
    }

    fn play(&self, queues: &BufferQueues) -> Result<(), EchoError> {
        if let Err(e) = self.set_state(PlayState::Playing) {
            self.drain_shadow_into(queues);
            return Err(e);
        }
        Ok(())
    }

    fn drain_shadow(&self) {
        if let Some(queues) = self.queues.get() {
            self.drain_shadow_into(queues);
        }
    }

    fn drain_shadow_into(&self, queues: &BufferQueues) {
        while let Some(buffer) = self.shadow.pop() {
            queues.recycle(buffer);
        }
    }

    fn set_state(&self, state: PlayState) -> Result<(), EchoError> {
        self.endpoint.set_state(state).map_err(|e| {
            tracing::error!(role = %self.role(), ?state, error = %e, "state change refused");
            EchoError::endpoint(self.role(), e)
        })
    }

    fn wired_queues(&self) -> Result<&BufferQueues, EchoError> {
        self.queues.get().ok_or_else(|| {
            tracing::error!(role = %self.role(), "source started without buffer queues");
            EchoError::MissingQueues { role: self.role() }
        })
    }

    fn post(&self, msg: EngineMessage) -> ServiceReply {
        match self.service.get() {
            Some(service) => service(msg),
            None => ServiceReply::Unavailable,
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(role = %self.role(), error = %e, "stop failed during drop");
            self.drain_shadow();
        }
    }
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("kind", &self.kind)
            .field("state", &self.endpoint.state())
            .field("in_flight", &self.shadow.size())
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .finish()
    }
}
