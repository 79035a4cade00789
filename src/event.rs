//! Runtime events for monitoring the echo pipeline.
//!
//! Events are non-fatal notifications about buffer circulation. The
//! pipeline keeps running after any event; they're for logging/metrics,
//! not error handling.

use std::sync::Arc;

/// Why a source endpoint was parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// The free pool had nothing left to refill the source with.
    FreePoolExhausted,
    /// The ready queue is within one shadow queue of being full.
    ReadyQueueSaturated,
}

/// Runtime events emitted by the engine and its components.
///
/// Most events are emitted from endpoint completion callbacks, so the
/// registered [`EventCallback`] must return quickly and never block.
///
/// # Example
///
/// ```
/// use audio_echo::EngineEvent;
///
/// fn handle_event(event: EngineEvent) {
///     match event {
///         EngineEvent::BufferLeak { expected, found } => {
///             eprintln!("lost buffers: expected {expected}, found {found}");
///         }
///         EngineEvent::Underrun => eprintln!("player ran dry"),
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Enough buffers were captured/decoded and playback was started.
    PlaybackKickstarted {
        /// Buffers handed to the player.
        buffers: usize,
    },

    /// The source endpoint was paused for backpressure.
    SourcePaused {
        /// Which valve tripped.
        reason: PauseReason,
    },

    /// A paused source endpoint was resumed.
    SourceResumed,

    /// The source needed a buffer and the free pool was empty.
    ///
    /// Expected under backpressure; starting with fewer buffers than the
    /// kickstart target also reports this.
    SourceStarved,

    /// The player had nothing queued and played silence.
    Underrun,

    /// The decoder reached the end of its content.
    DecodingFinished,

    /// Playback of a finished decode has drained and the player stopped.
    PlaybackDrained,

    /// The decoder was recreated and soft-started.
    SourceRestarted,

    /// The buffer census did not add up to the pool size.
    BufferLeak {
        /// Buffers allocated in the pool.
        expected: usize,
        /// Buffers found across all queues.
        found: usize,
    },
}

/// Callback type for receiving runtime events.
///
/// Register an event callback via [`EchoEngine::on_event()`].
///
/// [`EchoEngine::on_event()`]: crate::EchoEngine::on_event
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use audio_echo::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// callback(EngineEvent::Underrun);
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Shared, swappable event slot handed to components.
///
/// Components hold a clone of the slot so a callback registered after
/// they were created still receives their events.
#[derive(Clone, Default)]
pub(crate) struct EventEmitter {
    callback: Arc<parking_lot::RwLock<Option<EventCallback>>>,
}

impl EventEmitter {
    pub fn set(&self, callback: EventCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn emit(&self, event: EngineEvent) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("registered", &self.callback.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_engine_event_debug() {
        let event = EngineEvent::BufferLeak {
            expected: 16,
            found: 15,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("BufferLeak"));
        assert!(debug.contains("15"));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(EngineEvent::SourceResumed);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_emitter_without_callback_is_silent() {
        let emitter = EventEmitter::default();
        emitter.emit(EngineEvent::Underrun);
    }

    #[test]
    fn test_emitter_clones_share_registration() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let emitter = EventEmitter::default();
        let component_copy = emitter.clone();
        emitter.set(event_callback(move |e| seen_clone.lock().push(e)));

        component_copy.emit(EngineEvent::SourcePaused {
            reason: PauseReason::FreePoolExhausted,
        });
        assert_eq!(
            *seen.lock(),
            vec![EngineEvent::SourcePaused {
                reason: PauseReason::FreePoolExhausted
            }]
        );
    }
}
