//! The engine coordinator and host-facing control surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::config::{EngineConfig, SampleFormat};
use crate::endpoint::{AudioBackend, PlayState};
use crate::error::{EchoError, EndpointRole};
use crate::event::{event_callback, EngineEvent, EventEmitter};
use crate::pipeline::{
    AudioQueue, BufferDistribution, BufferQueues, EngineMessage, ServiceCallback, ServiceReply,
};
use crate::sink::PlaybackSink;
use crate::source::{AudioSource, SourceKind};

/// Counters accumulated over the engine's life.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Buffers moved from a source into the ready queue.
    pub buffers_captured: u64,
    /// Pool buffers played and returned to the free pool.
    pub buffers_played: u64,
    /// Times the player ran dry and played silence.
    pub underruns: u64,
    /// Times a source was parked by backpressure.
    pub source_pauses: u64,
    /// Times the decoder was recreated while playback continued.
    pub restarts: u64,
}

/// A fixed-latency echo pipeline: one source, one player, one buffer pool.
///
/// The engine owns the buffer pool and both shared queues for its whole
/// life; sources and sinks come and go and only borrow the queues. Control
/// messages from components arrive on endpoint callback threads and are
/// handled synchronously.
///
/// # Lifecycle
///
/// 1. [`initialize()`](Self::initialize) allocates the pool
/// 2. [`create_sink()`](Self::create_sink) and
///    [`create_source()`](Self::create_source) build the components
/// 3. [`start()`](Self::start) primes the player and starts the source
/// 4. [`stop()`](Self::stop) halts and destroys both components
/// 5. [`teardown()`](Self::teardown) (or drop) releases the pool
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_echo::{EchoEngine, EngineConfig, EndpointRole, MockBackend};
///
/// let backend = Arc::new(MockBackend::new());
/// let engine = EchoEngine::initialize(EngineConfig::low_latency(48000, 96), backend.clone())?;
/// engine.create_sink()?;
/// engine.create_source(None)?;
/// engine.start()?;
///
/// let mic = backend.latest(EndpointRole::Capture).unwrap();
/// mic.complete(2); // kickstart threshold reached
///
/// let dist = engine.buffer_distribution();
/// assert!(dist.is_balanced());
/// assert_eq!(dist.sink_in_flight, 2);
///
/// engine.stop()?;
/// # Ok::<(), audio_echo::EchoError>(())
/// ```
pub struct EchoEngine {
    core: Arc<EngineCore>,
}

struct EngineCore {
    config: EngineConfig,
    format: SampleFormat,
    backend: Arc<dyn AudioBackend>,
    pool: Mutex<Option<BufferPool>>,
    total: usize,
    queues: BufferQueues,
    source: Mutex<Option<Arc<AudioSource>>>,
    sink: Mutex<Option<Arc<PlaybackSink>>>,
    decode_uri: Mutex<Option<String>>,
    // Held while a session is torn down or the decoder is replaced
    lifecycle: Mutex<()>,
    events: EventEmitter,
    restarts: AtomicU64,
    // Counters of components that have been destroyed
    retired: Mutex<EngineStats>,
}

impl EchoEngine {
    /// Allocates the buffer pool and fills the free queue.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::InvalidConfig`] for an unusable configuration or
    /// [`EchoError::AllocationFailed`] if the pool cannot be allocated.
    pub fn initialize(
        config: EngineConfig,
        backend: Arc<dyn AudioBackend>,
    ) -> Result<Self, EchoError> {
        config.validate().map_err(|e| {
            tracing::error!(error = %e, "rejected engine configuration");
            e
        })?;

        let format = config.sample_format();
        let pool = BufferPool::allocate(config.buffer_count, format.buffer_size_bytes())
            .map_err(|e| {
                tracing::error!(error = %e, "buffer pool allocation failed");
                e
            })?;

        let free = Arc::new(AudioQueue::new(config.buffer_count));
        let ready = Arc::new(AudioQueue::new(config.buffer_count));
        for buffer in pool.handles() {
            free.push(Arc::clone(buffer));
        }

        tracing::info!(
            sample_rate = format.sample_rate_hz,
            frames_per_buffer = format.frames_per_buffer,
            buffers = config.buffer_count,
            buffer_bytes = format.buffer_size_bytes(),
            "echo engine initialized"
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                total: pool.len(),
                config,
                format,
                backend,
                pool: Mutex::new(Some(pool)),
                queues: BufferQueues { free, ready },
                source: Mutex::new(None),
                sink: Mutex::new(None),
                decode_uri: Mutex::new(None),
                lifecycle: Mutex::new(()),
                events: EventEmitter::default(),
                restarts: AtomicU64::new(0),
                retired: Mutex::new(EngineStats::default()),
            }),
        })
    }

    /// Registers a callback for runtime events, replacing any previous one.
    ///
    /// The callback runs on endpoint callback threads and must not block.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        self.core.events.set(event_callback(callback));
    }

    /// Creates the playback sink.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::AlreadyCreated`] if a sink exists, or
    /// [`EchoError::EndpointCreation`] if the backend fails; the engine is
    /// left without a sink either way.
    pub fn create_sink(&self) -> Result<(), EchoError> {
        let core = &self.core;
        let mut slot = core.sink.lock();
        if slot.is_some() {
            return Err(EchoError::AlreadyCreated {
                role: EndpointRole::Playback,
            });
        }

        let endpoint = core
            .backend
            .create_player(&core.format)
            .map_err(|source| creation_failed(EndpointRole::Playback, source))?;

        let sink = PlaybackSink::with_events(endpoint, &core.config, core.events.clone());
        sink.set_buf_queues(
            Arc::clone(&core.queues.free),
            Arc::clone(&core.queues.ready),
        );
        sink.register_service(service_callback(core));
        *slot = Some(sink);

        tracing::info!("playback sink created");
        Ok(())
    }

    /// Stops and destroys the playback sink, if any.
    pub fn destroy_sink(&self) {
        let sink = self.core.sink.lock().take();
        if let Some(sink) = sink {
            if let Err(e) = self.core.retire_sink(&sink) {
                tracing::warn!(error = %e, "sink did not stop cleanly");
            }
            tracing::info!("playback sink destroyed");
        }
    }

    /// Creates the source: a decoder for `uri`, or microphone capture when
    /// `uri` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::AlreadyCreated`] if a source exists, or
    /// [`EchoError::EndpointCreation`] if the backend fails; the engine is
    /// left without a source either way.
    pub fn create_source(&self, uri: Option<&str>) -> Result<(), EchoError> {
        let core = &self.core;
        let mut slot = core.source.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(EchoError::AlreadyCreated {
                role: existing.role(),
            });
        }

        let kind = match uri {
            Some(uri) => SourceKind::Decode {
                uri: uri.to_string(),
            },
            None => SourceKind::Capture,
        };
        let source = core.build_source(kind)?;
        *core.decode_uri.lock() = uri.map(str::to_string);
        tracing::info!(role = %source.role(), "source created");
        *slot = Some(source);
        Ok(())
    }

    /// Stops and destroys the source, if any.
    ///
    /// Its in-flight buffers are returned to the free pool first. The
    /// decoder URI is forgotten, so a later restart request is ignored.
    pub fn destroy_source(&self) {
        let _lifecycle = self.core.lifecycle.lock();
        self.core.decode_uri.lock().take();
        let source = self.core.source.lock().take();
        if let Some(source) = source {
            if let Err(e) = self.core.retire_source(&source) {
                tracing::warn!(error = %e, "source did not stop cleanly");
            }
            tracing::info!(role = %source.role(), "source destroyed");
        }
    }

    /// Starts a session: the player enters its waiting state, then the
    /// source starts producing.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::NoSink`] or [`EchoError::NoSource`] if a
    /// component is missing, or the component's own start error. A failed
    /// start leaves both components stopped; retry explicitly if desired.
    pub fn start(&self) -> Result<(), EchoError> {
        let sink = self.core.current_sink().ok_or_else(|| {
            tracing::error!("start requested without a playback sink");
            EchoError::NoSink
        })?;
        let source = self.core.current_source().ok_or_else(|| {
            tracing::error!("start requested without a source");
            EchoError::NoSource
        })?;

        sink.start()?;
        if let Err(e) = source.start() {
            if let Err(stop_err) = sink.stop() {
                tracing::warn!(error = %stop_err, "failed to stop sink after source start failure");
            }
            return Err(e);
        }

        tracing::info!(
            role = %source.role(),
            distribution = %self.core.census(),
            "echo session started"
        );
        Ok(())
    }

    /// Stops the session and destroys both components.
    ///
    /// The source is stopped before the sink. Every in-flight and queued
    /// buffer ends up back in the free pool. Calling `stop` with nothing
    /// running is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns the first endpoint error hit while stopping; the components
    /// are destroyed regardless.
    pub fn stop(&self) -> Result<(), EchoError> {
        let core = &self.core;
        let _lifecycle = core.lifecycle.lock();
        core.decode_uri.lock().take();
        let source = core.source.lock().take();
        let sink = core.sink.lock().take();
        if source.is_none() && sink.is_none() {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(source) = source {
            result = core.retire_source(&source);
        }
        if let Some(sink) = sink {
            result = result.and(core.retire_sink(&sink));
        }

        // Unplayed audio goes back to the pool for the next session.
        let mut flushed = 0;
        while let Some(buffer) = core.queues.ready.pop() {
            core.queues.recycle(buffer);
            flushed += 1;
        }

        tracing::info!(flushed, distribution = %core.census(), "echo session stopped");
        result
    }

    /// Stops everything and releases the buffer pool.
    pub fn teardown(self) {
        self.shutdown();
    }

    /// Delivers a control message as if a component had posted it.
    pub fn post(&self, msg: EngineMessage) -> ServiceReply {
        self.core.handle(msg)
    }

    /// Where every pooled buffer currently sits.
    pub fn buffer_distribution(&self) -> BufferDistribution {
        self.core.distribution()
    }

    /// Lifetime counters, including components already destroyed.
    pub fn stats(&self) -> EngineStats {
        let core = &self.core;
        let mut stats = core.retired.lock().clone();
        if let Some(source) = core.current_source() {
            stats.buffers_captured += source.buffers_captured();
            stats.source_pauses += source.pause_count();
        }
        if let Some(sink) = core.current_sink() {
            stats.buffers_played += sink.buffers_played();
            stats.underruns += sink.underrun_count();
        }
        stats.restarts = core.restarts.load(Ordering::Relaxed);
        stats
    }

    /// Endpoint state of the current source, if one exists.
    pub fn source_state(&self) -> Option<PlayState> {
        self.core.current_source().map(|source| source.state())
    }

    /// Endpoint state of the current sink, if one exists.
    pub fn sink_state(&self) -> Option<PlayState> {
        self.core.current_sink().map(|sink| sink.state())
    }

    /// The configuration the engine was initialized with.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// The PCM format shared by every buffer and endpoint.
    pub fn sample_format(&self) -> SampleFormat {
        self.core.format
    }

    fn shutdown(&self) {
        let Some(pool) = self.core.pool.lock().take() else {
            return;
        };
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "stop failed during teardown");
        }
        while self.core.queues.free.pop().is_some() {}
        pool.release();
        tracing::info!("echo engine torn down");
    }
}

impl Drop for EchoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EchoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoEngine")
            .field("config", &self.core.config)
            .field("distribution", &self.core.distribution())
            .finish()
    }
}

fn service_callback(core: &Arc<EngineCore>) -> ServiceCallback {
    let core = Arc::downgrade(core);
    Arc::new(move |msg| match core.upgrade() {
        Some(core) => core.handle(msg),
        None => ServiceReply::Unavailable,
    })
}

fn creation_failed(role: EndpointRole, source: crate::EndpointError) -> EchoError {
    tracing::error!(%role, error = %source, "endpoint creation failed");
    EchoError::EndpointCreation { role, source }
}

impl EngineCore {
    fn handle(self: &Arc<Self>, msg: EngineMessage) -> ServiceReply {
        match msg {
            EngineMessage::KickstartPlayer => {
                let Some(sink) = self.current_sink() else {
                    tracing::warn!("kickstart with no playback sink");
                    return ServiceReply::Continue;
                };
                let buffers = sink.play_audio_buffers(self.config.play_kickstart_buffers);
                tracing::info!(buffers, "playback kickstarted");
                self.events.emit(EngineEvent::PlaybackKickstarted { buffers });
                ServiceReply::Unsubscribe
            }
            EngineMessage::RetrieveDumpBufs => ServiceReply::BufferCount(self.census().found()),
            EngineMessage::ContinueDecoding => {
                if let Some(source) = self.current_source() {
                    if let Err(e) = source.resume() {
                        tracing::error!(error = %e, "failed to resume source");
                    }
                }
                ServiceReply::Continue
            }
            EngineMessage::DecodingFinished => {
                self.events.emit(EngineEvent::DecodingFinished);
                if let Some(sink) = self.current_sink() {
                    sink.decoding_finished();
                }
                ServiceReply::Continue
            }
            EngineMessage::RestartDecoding => {
                if let Err(e) = self.restart_decoding() {
                    tracing::error!(error = %e, "decoder restart failed");
                }
                ServiceReply::Continue
            }
        }
    }

    /// Replaces the decoder with a fresh one and soft-starts it.
    ///
    /// Only a running decoder is replaced; a request that arrives while
    /// the session is being stopped, or after it ended, is dropped.
    fn restart_decoding(self: &Arc<Self>) -> Result<(), EchoError> {
        let Some(_lifecycle) = self.lifecycle.try_lock() else {
            tracing::debug!("session is being torn down, decoder restart skipped");
            return Ok(());
        };
        if self.current_source().is_none() {
            tracing::debug!("no decoder running, restart skipped");
            return Ok(());
        }
        let uri = self.decode_uri.lock().clone().ok_or(EchoError::NoDecodeUri)?;
        tracing::debug!(distribution = %self.census(), "restarting decoder");

        // Stale in-flight buffers go back to the pool before the old
        // decoder is released
        let old = self.source.lock().take();
        if let Some(old) = old {
            if let Err(e) = self.retire_source(&old) {
                tracing::warn!(error = %e, "old decoder did not stop cleanly");
            }
        }

        let source = self.build_source(SourceKind::Decode { uri })?;
        *self.source.lock() = Some(Arc::clone(&source));
        source.soft_start()?;

        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(restarts, distribution = %self.census(), "decoder restarted");
        self.events.emit(EngineEvent::SourceRestarted);
        Ok(())
    }

    fn build_source(self: &Arc<Self>, kind: SourceKind) -> Result<Arc<AudioSource>, EchoError> {
        let role = kind.role();
        let endpoint = match &kind {
            SourceKind::Capture => self.backend.create_capture(&self.format),
            SourceKind::Decode { uri } => self.backend.create_decoder(&self.format, uri),
        }
        .map_err(|source| creation_failed(role, source))?;

        let source = AudioSource::with_events(kind, endpoint, &self.config, self.events.clone());
        source.set_buf_queues(
            Arc::clone(&self.queues.free),
            Arc::clone(&self.queues.ready),
        );
        source.register_service(service_callback(self));
        Ok(source)
    }

    fn current_source(&self) -> Option<Arc<AudioSource>> {
        self.source.lock().clone()
    }

    fn current_sink(&self) -> Option<Arc<PlaybackSink>> {
        self.sink.lock().clone()
    }

    /// Stops a source leaving the engine and banks its counters.
    fn retire_source(&self, source: &AudioSource) -> Result<(), EchoError> {
        let result = source.stop();
        let mut retired = self.retired.lock();
        retired.buffers_captured += source.buffers_captured();
        retired.source_pauses += source.pause_count();
        result
    }

    fn retire_sink(&self, sink: &PlaybackSink) -> Result<(), EchoError> {
        let result = sink.stop();
        let mut retired = self.retired.lock();
        retired.buffers_played += sink.buffers_played();
        retired.underruns += sink.underrun_count();
        result
    }

    fn distribution(&self) -> BufferDistribution {
        BufferDistribution {
            free: self.queues.free.size(),
            ready: self.queues.ready.size(),
            source_in_flight: self.current_source().map_or(0, |s| s.in_flight()),
            sink_in_flight: self.current_sink().map_or(0, |s| s.in_flight()),
            total: self.total,
        }
    }

    /// Counts every buffer and reports a leak if the sum is off.
    fn census(&self) -> BufferDistribution {
        let dist = self.distribution();
        if dist.is_balanced() {
            tracing::debug!(%dist, "buffer census");
        } else {
            tracing::error!(%dist, "lost buffers among the queues");
            self.events.emit(EngineEvent::BufferLeak {
                expected: dist.total,
                found: dist.found(),
            });
        }
        dist
    }
}
