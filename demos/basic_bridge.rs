use antspeed::{Bridge, BridgeConfig, Result, SimulatedRadioDriver, SpeedUnit};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::sleep,
};
use tracing::info;

/// Post one speed sample the way the treadmill app does
async fn post_speed(addr: std::net::SocketAddr, speed_mm_s: u32) -> Result<String> {
    let body = format!(r#"{{"speed": {speed_mm_s}}}"#);
    let request = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply.lines().next().unwrap_or_default().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚲 antspeed basic bridge example");

    let config = BridgeConfig {
        speed_unit: SpeedUnit::MillimetersPerSecond,
        ..BridgeConfig::default()
    };
    let bridge = Arc::new(Bridge::new(config, Arc::new(SimulatedRadioDriver)));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            bridge
                .run(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    // Walk, jog, then slow down again
    for speed in [1400, 2780, 3300, 2000] {
        info!("📤 Posting {} mm/s: {}", speed, post_speed(addr, speed).await?);
        sleep(Duration::from_secs(2)).await;

        let snapshot = bridge.transmitter().snapshot();
        info!(
            "📊 {} frames, {:.1} wheel rotations, phase {}",
            snapshot.total_intervals,
            snapshot.total_wheel_rotations,
            bridge.transmitter().phase()
        );
    }

    info!("🛑 Shutting down...");
    let _ = stop_tx.send(());
    match runner.await {
        Ok(result) => result?,
        Err(e) => info!("Bridge task ended abnormally: {}", e),
    }

    info!("✅ Done");
    Ok(())
}
