use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use walkpad::{ConnectOptions, Result, WalkPad};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃 walkpad basic control example");
    info!("Searching for a treadmill...");

    let pad = WalkPad::new().await?;
    if let Err(e) = pad.connect(ConnectOptions::default()).await {
        error!("❌ Failed to connect: {}", e);
        return Err(e);
    }

    let session = pad.session_info().expect("connected");
    info!("✅ Connected, speaking {} protocol", session.protocol);

    // Start the belt and come up to speed
    info!("▶️  Starting belt...");
    pad.start().await?;
    sleep(Duration::from_secs(2)).await;

    info!("⚡ Setting speed to 2.5 km/h...");
    pad.set_speed(2.5).await?;
    sleep(Duration::from_secs(10)).await;

    let state = pad.latest_state();
    info!(
        "📊 Status: {:.1} km/h, {} s elapsed, {:.2} km, {} steps",
        state.speed_kmh, state.elapsed_secs, state.distance_km, state.steps
    );

    // Slow down and stop
    info!("⏹  Stopping belt...");
    pad.stop().await?;

    pad.disconnect().await;
    info!("✅ Disconnected");
    Ok(())
}
