//! Control messages passed from components to the engine coordinator.

use std::sync::Arc;

/// Control messages a component posts to the engine.
///
/// Messages are delivered synchronously on whichever thread posts them,
/// usually an endpoint completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMessage {
    /// The source has buffered enough; start the player.
    KickstartPlayer,
    /// Count the buffers in every queue and report leaks.
    RetrieveDumpBufs,
    /// Resume a paused source.
    ContinueDecoding,
    /// The decoder reached end-of-stream; tell the player.
    DecodingFinished,
    /// Recreate the decoder and soft-start it while playback continues.
    RestartDecoding,
}

/// The engine's answer to an [`EngineMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceReply {
    /// Handled; the sender may post this message again.
    Continue,
    /// Handled; the sender must not post this message again this session.
    Unsubscribe,
    /// Census result for [`EngineMessage::RetrieveDumpBufs`].
    BufferCount(usize),
    /// No engine is listening any more.
    Unavailable,
}

/// Callback a component uses to post control messages.
pub type ServiceCallback = Arc<dyn Fn(EngineMessage) -> ServiceReply + Send + Sync>;

/// Where every pooled buffer currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDistribution {
    /// Buffers waiting in the free pool.
    pub free: usize,
    /// Filled buffers waiting for the player.
    pub ready: usize,
    /// Buffers owned by the source endpoint.
    pub source_in_flight: usize,
    /// Buffers owned by the playback endpoint.
    pub sink_in_flight: usize,
    /// Buffers allocated in the pool.
    pub total: usize,
}

impl BufferDistribution {
    /// Sum of all buffers found in queues.
    pub fn found(&self) -> usize {
        self.free + self.ready + self.source_in_flight + self.sink_in_flight
    }

    /// Returns `true` if no buffer is lost or duplicated.
    pub fn is_balanced(&self) -> bool {
        self.found() == self.total
    }
}

impl std::fmt::Display for BufferDistribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "free={} ready={} source_dev={} sink_dev={} ({}/{})",
            self.free,
            self.ready,
            self.source_in_flight,
            self.sink_in_flight,
            self.found(),
            self.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_balance() {
        let dist = BufferDistribution {
            free: 4,
            ready: 2,
            source_in_flight: 2,
            sink_in_flight: 0,
            total: 8,
        };
        assert!(dist.is_balanced());
        assert_eq!(dist.to_string(), "free=4 ready=2 source_dev=2 sink_dev=0 (8/8)");
    }

    #[test]
    fn test_distribution_detects_leak() {
        let dist = BufferDistribution {
            free: 3,
            total: 4,
            ..Default::default()
        };
        assert!(!dist.is_balanced());
    }
}
