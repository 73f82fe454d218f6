use std::sync::Arc;

use anyhow::Context;
use antspeed::{
    Bridge, BridgeConfig, ChannelConfig, SimulatedRadioDriver, SpeedUnit, TimingModel,
    WheelConfig, DEFAULT_DEVICE_NUMBER, DEFAULT_WHEEL_CIRCUMFERENCE_M,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bridge HTTP-posted speed to a simulated ANT+ bike speed sensor
#[derive(Parser, Debug)]
#[command(name = "antspeed")]
#[command(version)]
#[command(about = "Broadcast treadmill speed as an ANT+ bike speed sensor", long_about = None)]
struct Args {
    /// Address the HTTP ingest binds to
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// Port the HTTP ingest listens on
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Log filter used when RUST_LOG is not set (e.g. info, debug, antspeed=trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Unit of the posted `speed` value: mm-per-s, m-per-s or km-per-h
    #[arg(long, default_value = "mm-per-s")]
    speed_unit: SpeedUnit,

    /// How tick length enters event time and distance: legacy or physical
    #[arg(long, default_value = "legacy")]
    timing_model: TimingModel,

    /// Wheel circumference in meters
    #[arg(long, default_value_t = DEFAULT_WHEEL_CIRCUMFERENCE_M)]
    wheel_circumference: f64,

    /// ANT+ device number broadcast in the channel ID
    #[arg(long, default_value_t = DEFAULT_DEVICE_NUMBER)]
    device_number: u16,
}

impl Args {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        if !(self.wheel_circumference.is_finite() && self.wheel_circumference > 0.0) {
            anyhow::bail!(
                "wheel circumference must be a positive number of meters, got {}",
                self.wheel_circumference
            );
        }

        Ok(BridgeConfig {
            channel: ChannelConfig {
                device_number: self.device_number,
                ..ChannelConfig::default()
            },
            wheel: WheelConfig {
                circumference_m: self.wheel_circumference,
                timing_model: self.timing_model,
            },
            speed_unit: self.speed_unit,
            ..BridgeConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = args.bridge_config()?;
    let addr = format!("{}:{}", args.ip, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP ingest on {addr}"))?;

    info!(
        "antspeed {} listening on http://{} (speed unit {}, {} timing, device {})",
        antspeed::VERSION,
        addr,
        config.speed_unit,
        config.wheel.timing_model,
        config.channel.device_number
    );

    let bridge = Bridge::new(config, Arc::new(SimulatedRadioDriver));
    bridge
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Shutdown complete");
    Ok(())
}
