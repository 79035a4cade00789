//! Buffer circulation primitives.
//!
//! Buffers move between queues by handle and are never copied:
//!
//! ```text
//! Free Queue → Source endpoint (shadow) → Ready Queue → Player endpoint (shadow) → Free Queue
//! ```
//!
//! - **AudioQueue**: bounded FIFO used for the free pool, the ready queue
//!   and each endpoint's shadow queue
//! - **Service**: control messages components post to the engine
//!
//! The queues are the only mutable state shared across callback threads.

mod queue;
mod service;

pub use queue::AudioQueue;
pub(crate) use queue::BufferQueues;
pub use service::{BufferDistribution, EngineMessage, ServiceCallback, ServiceReply};
