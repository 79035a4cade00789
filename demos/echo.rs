//! Echo demo on mock endpoints.
//!
//! Runs a microphone echo session for two seconds, then loops a short
//! decoded clip, with a device clock standing in for the audio hardware.
//!
//! Run with: cargo run --example echo
//! More detail: RUST_LOG=audio_echo=debug cargo run --example echo

use std::sync::Arc;
use std::time::Duration;

use audio_echo::{DeviceClock, EchoEngine, EngineConfig, EndpointRole, MockBackend};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("audio_echo=info")),
        )
        .init();

    // Echo delay is the play kickstart count times the buffer duration.
    let config = EngineConfig::low_latency(48000, 240);
    let period = config.sample_format().buffer_duration();
    println!(
        "Buffer: {} bytes, {:?}; echo delay about {:?}",
        config.sample_format().buffer_size_bytes(),
        period,
        period * config.play_kickstart_buffers as u32
    );

    // Decoded clips are 40 buffers long.
    let backend = Arc::new(MockBackend::with_decode_length(40));
    let engine = EchoEngine::initialize(config.clone(), backend.clone())?;
    engine.on_event(|e| tracing::debug!(?e, "echo event"));
    let clock = DeviceClock::spawn(backend.clone(), period);

    println!("Microphone echo for 2 seconds...");
    engine.create_sink()?;
    engine.create_source(None)?;
    engine.start()?;
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        println!("  {}", engine.buffer_distribution());
    }
    engine.stop()?;

    let played = backend
        .latest(EndpointRole::Playback)
        .map_or(0, |player| player.played_sequences().len());
    println!("Played {played} captured buffers");

    println!("Looping a decoded clip for 1 second...");
    let engine = {
        engine.teardown();
        EchoEngine::initialize(
            EngineConfig {
                loop_decoding: true,
                ..config
            },
            backend.clone(),
        )?
    };
    engine.create_sink()?;
    engine.create_source(Some("file:///demo/clip.wav"))?;
    engine.start()?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("  {}", engine.buffer_distribution());
    engine.stop()?;

    println!("Stats: {:?}", engine.stats());
    engine.teardown();
    clock.stop().await;

    Ok(())
}
