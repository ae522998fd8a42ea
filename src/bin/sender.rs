//! Voice Sender Application
//!
//! Records the configured microphone and streams encoded voice to a peer over UDP.
//!
//! Usage: `sender [peer_addr] [config_path]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use proximity_voice::{
    audio::{list_devices, CpalBackend},
    config::AppConfig,
    network::UdpTransport,
    session::{LocalVoice, SessionStatus},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice sender");

    let mut args = std::env::args().skip(1);
    let peer: Option<SocketAddr> = args
        .next()
        .map(|addr| addr.parse())
        .transpose()
        .context("Invalid peer address")?;
    let mut config = match args.next().map(PathBuf::from) {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::load_or_default()?,
    };
    if peer.is_some() {
        config.network.peer_address = peer;
    }
    // The receiver listens on the default port; bind an ephemeral one
    config.network.bind_address.set_port(0);

    println!("\n=== Input Devices ===");
    for device in list_devices().iter().filter(|d| d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  [{}] {}{}", device.index, device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let mut transport = UdpTransport::bind(&config.network)?;
    let participant = Uuid::new_v4();
    let backend = CpalBackend::new();

    let mut voice = LocalVoice::open(participant, &backend, &config)?;
    voice.start_recording()?;
    tracing::info!(
        "Streaming as {} from driver {} to {:?}",
        participant,
        voice.driver_index(),
        transport.peer()
    );

    let mut interval = tokio::time::interval(Duration::from_millis(config.session.tick_interval_ms));
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                voice.tick(&mut transport)?;
                ticks += 1;

                if voice.status() == SessionStatus::Unavailable {
                    anyhow::bail!("Recording unavailable");
                }

                if ticks % 1000 == 0 {
                    let stats = voice.encoder().stats();
                    tracing::info!(
                        "Stats: {} frames encoded, {} dropped, avg frame {:.0} bytes",
                        stats.frames_encoded,
                        stats.frames_dropped,
                        stats.average_frame_size()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping");
                voice.stop_recording(&mut transport)?;
                break;
            }
        }
    }

    Ok(())
}
