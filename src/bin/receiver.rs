//! Voice Receiver Application
//!
//! Receives voice over UDP and plays every participant through its own
//! playback buffer on the default output device.
//!
//! Usage: `receiver [config_path]`

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proximity_voice::{
    audio::{list_devices, CpalBackend},
    config::AppConfig,
    network::UdpTransport,
    session::{SessionStatus, VoiceRoom},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice receiver");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::load_or_default()?,
    };

    println!("\n=== Output Devices ===");
    for device in list_devices().iter().filter(|d| !d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let mut transport = UdpTransport::bind(&config.network)?;
    tracing::info!("Listening on {}", transport.local_addr()?);

    let tick_interval = Duration::from_millis(config.session.tick_interval_ms);
    let mut room = VoiceRoom::new(CpalBackend::new(), config);
    let mut interval = tokio::time::interval(tick_interval);
    let mut last_stats_time = std::time::Instant::now();

    tracing::info!("Waiting for voice...");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                room.tick(&mut transport)?;

                let gone: Vec<_> = room
                    .participants()
                    .filter(|id| {
                        room.session(*id).map(|s| s.status()) == Some(SessionStatus::Unavailable)
                    })
                    .collect();
                for id in gone {
                    tracing::warn!("Playback for {} unavailable, removing", id);
                    room.leave(id);
                }

                if last_stats_time.elapsed() >= Duration::from_secs(10) {
                    tracing::info!("{} active participants", room.participants().count());
                    last_stats_time = std::time::Instant::now();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping");
                break;
            }
        }
    }

    Ok(())
}
