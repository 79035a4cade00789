//! Playback sink component.
//!
//! A [`PlaybackSink`] pulls filled buffers from the ready queue, keeps its
//! endpoint fed, and returns every played buffer to the free pool. It plays
//! silence whenever it runs dry so the completion stream never stalls.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::buffer::{BufferHandle, SampleBuffer};
use crate::config::EngineConfig;
use crate::endpoint::{CompletionCallback, Endpoint, EndpointCallbacks, PlayState};
use crate::error::{EchoError, EndpointRole};
use crate::event::{EngineEvent, EventEmitter};
use crate::pipeline::{AudioQueue, BufferQueues, EngineMessage, ServiceCallback, ServiceReply};

/// Consumer side of the echo path.
///
/// Buffers flow `ready → shadow → free`. Playback does not begin with the
/// first ready buffer: the sink idles on a silent prime buffer until the
/// source has delivered the kickstart count and the engine calls
/// [`play_audio_buffers()`](Self::play_audio_buffers). That bounds startup
/// latency to exactly the kickstart buffer count.
///
/// The silent buffer belongs to the sink, not the pool, and is tracked
/// apart from the shadow queue.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_echo::{
///     AudioQueue, EngineConfig, EndpointRole, MockEndpoint, PlaybackSink, SampleBuffer,
/// };
///
/// let config = EngineConfig::low_latency(48000, 96);
/// let free = Arc::new(AudioQueue::new(config.buffer_count));
/// let ready = Arc::new(AudioQueue::new(config.buffer_count));
/// for id in 0..2 {
///     let buf = Arc::new(SampleBuffer::new(id, 192));
///     buf.mark_full();
///     ready.push(buf);
/// }
///
/// let speaker = Arc::new(MockEndpoint::new(EndpointRole::Playback));
/// let sink = PlaybackSink::new(Box::new(speaker.clone()), &config);
/// sink.set_buf_queues(free.clone(), ready.clone());
/// sink.start().unwrap();
///
/// assert_eq!(sink.play_audio_buffers(2), 2);
/// speaker.complete(3); // prime silence + two buffers
/// assert_eq!(free.size(), 2);
/// ```
pub struct PlaybackSink {
    endpoint: Box<dyn Endpoint>,
    shadow: AudioQueue,
    silence: BufferHandle,
    silence_in_flight: AtomicUsize,
    queues: OnceLock<BufferQueues>,
    service: OnceLock<ServiceCallback>,
    events: EventEmitter,
    feed_lock: Mutex<()>,
    low_water: usize,
    loop_decoding: bool,
    kickstarted: AtomicBool,
    decoding_finished: AtomicBool,
    buffers_played: AtomicU64,
    underruns: AtomicU64,
}

impl PlaybackSink {
    /// Creates a sink around `endpoint`.
    pub fn new(endpoint: Box<dyn Endpoint>, config: &EngineConfig) -> Arc<Self> {
        Self::with_events(endpoint, config, EventEmitter::default())
    }

    pub(crate) fn with_events(
        endpoint: Box<dyn Endpoint>,
        config: &EngineConfig,
        events: EventEmitter,
    ) -> Arc<Self> {
        let buffer_size = config.sample_format().buffer_size_bytes().max(1);
        let sink = Arc::new(Self {
            endpoint,
            shadow: AudioQueue::new(config.shadow_queue_len),
            silence: Arc::new(SampleBuffer::silent(buffer_size)),
            silence_in_flight: AtomicUsize::new(0),
            queues: OnceLock::new(),
            service: OnceLock::new(),
            events,
            feed_lock: Mutex::new(()),
            low_water: config.play_kickstart_buffers,
            loop_decoding: config.loop_decoding,
            kickstarted: AtomicBool::new(false),
            decoding_finished: AtomicBool::new(false),
            buffers_played: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        });

        let on_complete: CompletionCallback = {
            let sink: Weak<Self> = Arc::downgrade(&sink);
            Arc::new(move || {
                if let Some(sink) = sink.upgrade() {
                    sink.on_buffer_complete();
                }
            })
        };
        sink.endpoint.register_callbacks(EndpointCallbacks {
            on_buffer_complete: Some(on_complete),
            on_end_of_stream: None,
        });

        sink
    }

    /// Wires the shared free pool and ready queue. Only the first call counts.
    pub fn set_buf_queues(&self, free: Arc<AudioQueue>, ready: Arc<AudioQueue>) {
        if self.queues.set(BufferQueues { free, ready }).is_err() {
            tracing::warn!("sink buffer queues already wired, ignoring");
        }
    }

    /// Registers the engine callback for control messages. Only the first
    /// call counts.
    pub fn register_service(&self, service: ServiceCallback) {
        if self.service.set(service).is_err() {
            tracing::warn!("sink service callback already registered, ignoring");
        }
    }

    /// Puts the endpoint into its waiting state.
    ///
    /// Submits one silent buffer and sets the endpoint playing. No pool
    /// buffer is touched until [`play_audio_buffers()`](Self::play_audio_buffers).
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::MissingQueues`] if the queues were never wired,
    /// or [`EchoError::Endpoint`] if the endpoint rejects the prime buffer
    /// or refuses to start.
    pub fn start(&self) -> Result<(), EchoError> {
        if self.queues.get().is_none() {
            tracing::error!("sink started without buffer queues");
            return Err(EchoError::MissingQueues {
                role: EndpointRole::Playback,
            });
        }
        self.stop()?;

        self.kickstarted.store(false, Ordering::SeqCst);
        self.decoding_finished.store(false, Ordering::SeqCst);

        self.silence_in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.endpoint.submit(Arc::clone(&self.silence)) {
            self.silence_in_flight.store(0, Ordering::SeqCst);
            tracing::error!(error = %e, "prime buffer rejected");
            return Err(EchoError::endpoint(EndpointRole::Playback, e));
        }

        self.set_state(PlayState::Playing)?;
        tracing::info!("sink started, waiting for kickstart");
        Ok(())
    }

    /// Hands up to `count` ready buffers to the endpoint and marks playback
    /// as kicked off. Returns how many were submitted.
    pub fn play_audio_buffers(&self, count: usize) -> usize {
        self.kickstarted.store(true, Ordering::SeqCst);
        let Some(queues) = self.queues.get() else {
            return 0;
        };
        let submitted = self.feed(queues, count);
        tracing::debug!(submitted, requested = count, "playback kickstarted");
        submitted
    }

    /// Tells the sink no further buffers will arrive.
    ///
    /// The sink plays out what is queued and then either stops or, with
    /// `loop_decoding`, asks the engine to restart the decoder. A decode
    /// shorter than the kickstart count is played right away. A stopped
    /// sink ignores the call.
    pub fn decoding_finished(&self) {
        if self.endpoint.state() == PlayState::Stopped {
            tracing::debug!("decode finished with the sink stopped, ignoring");
            return;
        }
        self.decoding_finished.store(true, Ordering::SeqCst);
        tracing::debug!("sink draining after end of decode");

        // Once playing, the completion path drains when ready and shadow
        // both run dry
        if self.kickstarted.load(Ordering::SeqCst) {
            return;
        }

        self.play_audio_buffers(self.shadow.capacity());
        let ready_empty = self.queues.get().map_or(true, |q| q.ready.is_empty());
        if ready_empty && self.is_idle() {
            self.finish_drain();
        }
    }

    /// Stops the endpoint and returns every in-flight buffer to the free pool.
    ///
    /// Stopping an already stopped sink is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::Endpoint`] if the endpoint refuses to stop; the
    /// in-flight buffers stay where they are in that case.
    pub fn stop(&self) -> Result<(), EchoError> {
        if self.endpoint.state() != PlayState::Stopped {
            self.set_state(PlayState::Stopped)?;
            tracing::debug!("sink stopped");
        }
        self.drain_shadow();
        self.silence_in_flight.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Pool buffers currently held by the endpoint.
    pub fn in_flight(&self) -> usize {
        self.shadow.size()
    }

    /// Current endpoint state.
    pub fn state(&self) -> PlayState {
        self.endpoint.state()
    }

    /// Returns `true` once [`play_audio_buffers()`](Self::play_audio_buffers)
    /// has been called this session.
    pub fn is_kickstarted(&self) -> bool {
        self.kickstarted.load(Ordering::SeqCst)
    }

    /// Pool buffers played and recycled since creation.
    pub fn buffers_played(&self) -> u64 {
        self.buffers_played.load(Ordering::Relaxed)
    }

    /// Times the sink ran dry and played silence.
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn on_buffer_complete(&self) {
        let Some(queues) = self.queues.get() else {
            return;
        };

        // Silence is always queued ahead of pool buffers
        if !self.take_silence() {
            let Some(buffer) = self.shadow.pop() else {
                let census = self.post(EngineMessage::RetrieveDumpBufs);
                tracing::warn!(?census, "playback completion with nothing in flight");
                return;
            };
            queues.recycle(buffer);
            self.buffers_played.fetch_add(1, Ordering::Relaxed);
        }

        if !self.kickstarted.load(Ordering::SeqCst) {
            return;
        }

        self.feed(queues, self.shadow.capacity());

        let finished = self.decoding_finished.load(Ordering::SeqCst);
        if self.is_idle() {
            if finished {
                self.finish_drain();
                return;
            }
            self.underruns.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("playback underrun, playing silence");
            self.events.emit(EngineEvent::Underrun);
            self.submit_silence();
        }

        if !finished && queues.ready.size() <= self.low_water {
            self.post(EngineMessage::ContinueDecoding);
        }
    }

    /// Moves up to `max` ready buffers into the endpoint. Returns how many.
    fn feed(&self, queues: &BufferQueues, max: usize) -> usize {
        let _guard = self.feed_lock.lock();
        let mut fed = 0;

        while fed < max && !self.shadow.is_full() {
            let Some(buffer) = queues.ready.pop() else {
                break;
            };
            if let Err(e) = self.endpoint.submit(Arc::clone(&buffer)) {
                tracing::error!(
                    error = %e,
                    buffer = buffer.id(),
                    "playback submit failed, dropping audio"
                );
                queues.recycle(buffer);
                break;
            }
            if !self.shadow.push(buffer) {
                tracing::error!("sink shadow queue overflow");
                break;
            }
            fed += 1;
        }
        fed
    }

    fn finish_drain(&self) {
        if !self.decoding_finished.swap(false, Ordering::SeqCst) {
            return;
        }

        if self.loop_decoding {
            tracing::info!("decode drained, restarting decoder");
            self.post(EngineMessage::RestartDecoding);
            self.submit_silence();
            return;
        }

        if let Err(e) = self.endpoint.set_state(PlayState::Stopped) {
            tracing::error!(error = %e, "failed to stop drained sink");
            return;
        }
        self.silence_in_flight.store(0, Ordering::SeqCst);
        tracing::info!(played = self.buffers_played(), "decode drained, playback stopped");
        self.events.emit(EngineEvent::PlaybackDrained);
    }

    fn submit_silence(&self) {
        self.silence_in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.endpoint.submit(Arc::clone(&self.silence)) {
            self.silence_in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(error = %e, "silence buffer rejected");
        }
    }

    fn take_silence(&self) -> bool {
        self.silence_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn is_idle(&self) -> bool {
        self.shadow.is_empty() && self.silence_in_flight.load(Ordering::SeqCst) == 0
    }

    fn drain_shadow(&self) {
        if let Some(queues) = self.queues.get() {
            while let Some(buffer) = self.shadow.pop() {
                queues.recycle(buffer);
            }
        }
    }

    fn set_state(&self, state: PlayState) -> Result<(), EchoError> {
        self.endpoint.set_state(state).map_err(|e| {
            tracing::error!(?state, error = %e, "sink state change refused");
            EchoError::endpoint(EndpointRole::Playback, e)
        })
    }

    fn post(&self, msg: EngineMessage) -> ServiceReply {
        match self.service.get() {
            Some(service) => service(msg),
            None => ServiceReply::Unavailable,
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "sink stop failed during drop");
            self.drain_shadow();
        }
    }
}

impl std::fmt::Debug for PlaybackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSink")
            .field("state", &self.endpoint.state())
            .field("in_flight", &self.shadow.size())
            .field("kickstarted", &self.is_kickstarted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MockEndpoint;

    struct Rig {
        free: Arc<AudioQueue>,
        ready: Arc<AudioQueue>,
        endpoint: Arc<MockEndpoint>,
        sink: Arc<PlaybackSink>,
        messages: Arc<Mutex<Vec<EngineMessage>>>,
        events: Arc<Mutex<Vec<EngineEvent>>>,
    }

    fn rig(config: &EngineConfig) -> Rig {
        let free = Arc::new(AudioQueue::new(config.buffer_count));
        let ready = Arc::new(AudioQueue::new(config.buffer_count));
        for id in 0..config.buffer_count {
            free.push(Arc::new(SampleBuffer::new(id, 8)));
        }

        let endpoint = Arc::new(MockEndpoint::new(EndpointRole::Playback));
        let emitter = EventEmitter::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        emitter.set(crate::event::event_callback(move |e| log.lock().push(e)));

        let sink = PlaybackSink::with_events(Box::new(Arc::clone(&endpoint)), config, emitter);
        sink.set_buf_queues(Arc::clone(&free), Arc::clone(&ready));

        let messages = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&messages);
        sink.register_service(Arc::new(move |msg| {
            log.lock().push(msg);
            ServiceReply::Continue
        }));

        Rig {
            free,
            ready,
            endpoint,
            sink,
            messages,
            events,
        }
    }

    /// Moves `count` buffers from free to ready, stamped like a capture.
    fn produce(rig: &Rig, count: usize) {
        for _ in 0..count {
            let buffer = rig.free.pop().unwrap();
            buffer.write(&(buffer.id() as u32 + 100).to_le_bytes());
            buffer.mark_full();
            rig.ready.push(buffer);
        }
    }

    fn posted(rig: &Rig, msg: EngineMessage) -> usize {
        rig.messages.lock().iter().filter(|m| **m == msg).count()
    }

    fn total(rig: &Rig) -> usize {
        rig.free.size() + rig.ready.size() + rig.sink.in_flight()
    }

    fn low_latency() -> EngineConfig {
        EngineConfig::low_latency(48000, 4)
    }

    #[test]
    fn test_start_primes_with_silence() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();

        assert_eq!(rig.endpoint.pending_len(), 1);
        assert_eq!(rig.endpoint.state(), PlayState::Playing);
        assert_eq!(rig.sink.in_flight(), 0);
        assert_eq!(rig.free.size(), 8);

        // Prime completes; nothing else happens before kickstart.
        assert!(rig.endpoint.complete_next());
        assert_eq!(rig.endpoint.pending_len(), 0);
        assert!(rig.events.lock().is_empty());
        assert!(rig.endpoint.played_sequences().is_empty());
    }

    #[test]
    fn test_start_without_queues_fails() {
        let sink = PlaybackSink::new(
            Box::new(MockEndpoint::new(EndpointRole::Playback)),
            &EngineConfig::default(),
        );
        assert!(matches!(
            sink.start(),
            Err(EchoError::MissingQueues {
                role: EndpointRole::Playback
            })
        ));
    }

    #[test]
    fn test_play_audio_buffers_moves_ready_into_shadow() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 2);

        assert_eq!(rig.sink.play_audio_buffers(2), 2);
        assert_eq!(rig.ready.size(), 0);
        assert_eq!(rig.sink.in_flight(), 2);
        assert_eq!(total(&rig), 8);
    }

    #[test]
    fn test_play_audio_buffers_is_bounded_by_shadow() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 5);

        assert_eq!(rig.sink.play_audio_buffers(5), 2);
        assert_eq!(rig.ready.size(), 3);
    }

    #[test]
    fn test_completions_recycle_and_refill() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 4);
        rig.sink.play_audio_buffers(2);

        // prime + first buffer
        assert_eq!(rig.endpoint.complete(2), 2);
        assert_eq!(rig.sink.in_flight(), 2);
        assert_eq!(rig.ready.size(), 1);
        assert_eq!(rig.sink.buffers_played(), 1);
        assert_eq!(total(&rig), 8);

        let recycled = rig.free.front().unwrap();
        assert_eq!(recycled.filled_size(), 0);
        assert_eq!(rig.endpoint.played_sequences(), vec![100]);
    }

    #[test]
    fn test_underrun_plays_silence_and_recovers() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 1);
        rig.sink.play_audio_buffers(2);

        // prime, then the only buffer: nothing left to play
        rig.endpoint.complete(2);
        assert_eq!(rig.sink.underrun_count(), 1);
        assert!(rig.events.lock().contains(&EngineEvent::Underrun));
        assert_eq!(rig.endpoint.pending_len(), 1);

        // A late buffer is picked up when the silence completes.
        produce(&rig, 1);
        rig.endpoint.complete_next();
        assert_eq!(rig.sink.in_flight(), 1);
        assert_eq!(rig.sink.underrun_count(), 1);
        assert_eq!(total(&rig), 8);
    }

    #[test]
    fn test_low_ready_queue_requests_more_input() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 2);
        rig.sink.play_audio_buffers(2);

        rig.endpoint.complete(2);
        assert!(posted(&rig, EngineMessage::ContinueDecoding) >= 1);
    }

    #[test]
    fn test_completion_with_nothing_in_flight_requests_census() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        rig.endpoint.complete_next();

        // A stray buffer the sink never tracked.
        rig.endpoint.submit(Arc::new(SampleBuffer::new(99, 8))).unwrap();
        rig.endpoint.complete_next();

        assert_eq!(posted(&rig, EngineMessage::RetrieveDumpBufs), 1);
    }

    #[test]
    fn test_decoding_finished_drains_then_stops() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 3);
        rig.sink.play_audio_buffers(2);
        rig.sink.decoding_finished();

        rig.endpoint.complete(10);
        assert_eq!(rig.endpoint.state(), PlayState::Stopped);
        assert_eq!(rig.endpoint.played_sequences(), vec![100, 101, 102]);
        assert!(rig.events.lock().contains(&EngineEvent::PlaybackDrained));
        assert_eq!(rig.sink.underrun_count(), 0);
        assert_eq!(posted(&rig, EngineMessage::ContinueDecoding), 0);
        assert_eq!(rig.free.size(), 8);
    }

    #[test]
    fn test_short_decode_plays_without_kickstart() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 1);

        rig.sink.decoding_finished();
        assert!(rig.sink.is_kickstarted());
        assert_eq!(rig.sink.in_flight(), 1);

        rig.endpoint.complete(5);
        assert_eq!(rig.endpoint.played_sequences(), vec![100]);
        assert!(rig.events.lock().contains(&EngineEvent::PlaybackDrained));
    }

    #[test]
    fn test_decoding_finished_leaves_drain_to_playing_sink() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        rig.endpoint.complete_next();

        // Kickstarted with nothing in flight yet, audio still queued.
        rig.sink.play_audio_buffers(2);
        produce(&rig, 2);
        rig.sink.decoding_finished();

        assert_eq!(rig.endpoint.state(), PlayState::Playing);
        assert_eq!(rig.ready.size(), 2);
        assert_eq!(rig.endpoint.state_requests(PlayState::Stopped), 0);
        assert!(!rig.events.lock().contains(&EngineEvent::PlaybackDrained));
    }

    #[test]
    fn test_decoding_finished_after_drain_is_ignored() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 1);
        rig.sink.play_audio_buffers(2);
        rig.sink.decoding_finished();
        rig.endpoint.complete(5);
        assert_eq!(rig.endpoint.state(), PlayState::Stopped);

        rig.sink.decoding_finished();
        let drained = rig
            .events
            .lock()
            .iter()
            .filter(|e| **e == EngineEvent::PlaybackDrained)
            .count();
        assert_eq!(drained, 1);
        assert_eq!(rig.endpoint.state_requests(PlayState::Stopped), 1);
    }

    #[test]
    fn test_looping_decode_requests_restart() {
        let config = EngineConfig {
            loop_decoding: true,
            ..low_latency()
        };
        let rig = rig(&config);
        rig.sink.start().unwrap();
        produce(&rig, 2);
        rig.sink.play_audio_buffers(2);
        rig.sink.decoding_finished();

        rig.endpoint.complete(3);
        assert_eq!(posted(&rig, EngineMessage::RestartDecoding), 1);
        assert_eq!(rig.endpoint.state(), PlayState::Playing);
        // Silence keeps the endpoint ticking for the new decoder.
        assert_eq!(rig.endpoint.pending_len(), 1);
        assert!(!rig.events.lock().contains(&EngineEvent::PlaybackDrained));
    }

    #[test]
    fn test_stop_is_idempotent_and_returns_buffers() {
        let rig = rig(&low_latency());
        rig.sink.start().unwrap();
        produce(&rig, 2);
        rig.sink.play_audio_buffers(2);

        rig.sink.stop().unwrap();
        rig.sink.stop().unwrap();
        assert_eq!(rig.sink.in_flight(), 0);
        assert_eq!(rig.free.size(), 8);
        assert_eq!(rig.endpoint.state_requests(PlayState::Stopped), 1);
    }
}
