//! # audio-echo
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Fixed-latency audio echo: capture (or decode) into pre-allocated buffers
//! and play them back with a bounded, configurable delay.
//!
//! `audio-echo` circulates a fixed pool of sample buffers between a source
//! endpoint and a playback endpoint. Nothing is allocated or copied while a
//! session runs, and playback starts only after a fixed number of buffers
//! has been captured, so the echo delay is known up front.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use audio_echo::{EchoEngine, EngineConfig};
//!
//! let backend = Arc::new(MyPlatformBackend::new());
//! let engine = EchoEngine::initialize(EngineConfig::new(48000, 240), backend)?;
//!
//! engine.on_event(|e| tracing::warn!(?e, "echo event"));
//! engine.create_sink()?;
//! engine.create_source(None)?;          // microphone; Some(uri) decodes a file
//! engine.start()?;
//!
//! // Audio flows on the platform's callback threads...
//!
//! engine.stop()?;
//! engine.teardown();
//! ```
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────── free pool ◄──────────────┐
//!            ▼                                        │
//!   source endpoint (shadow)  ──►  ready queue  ──►  player endpoint (shadow)
//! ```
//!
//! - **Endpoints**: platform devices/codecs behind the [`Endpoint`] trait;
//!   they complete buffers asynchronously on their own threads
//! - **Components**: [`AudioSource`] and [`PlaybackSink`] react to each
//!   completion with a few constant-time queue operations and never block
//! - **Engine**: [`EchoEngine`] owns the pool and queues and handles the
//!   control messages components post (kickstart, resume, restart, census)
//!
//! The sum of buffers across the free pool, the ready queue and both shadow
//! queues always equals the pool size; [`EchoEngine::buffer_distribution()`]
//! checks it.

#![warn(missing_docs)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod buffer;
mod config;
mod endpoint;
mod engine;
mod error;
mod event;
mod pipeline;
mod sink;
mod source;

pub use buffer::{BufferHandle, BufferPool, SampleBuffer};
pub use config::{EngineConfig, SampleFormat};
pub use endpoint::{
    AudioBackend, CompletionCallback, DeviceClock, Endpoint, EndpointCallbacks, MockBackend,
    MockEndpoint, PlayState,
};
pub use engine::{EchoEngine, EngineStats};
pub use error::{EchoError, EndpointError, EndpointRole};
pub use event::{event_callback, EngineEvent, EventCallback, PauseReason};
pub use pipeline::{AudioQueue, BufferDistribution, EngineMessage, ServiceCallback, ServiceReply};
pub use sink::PlaybackSink;
pub use source::{AudioSource, SourceKind};
