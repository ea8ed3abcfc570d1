use tracing::{info, warn};
use walkpad::{ConnectOptions, ConnectionState, Result, WalkPad};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 walkpad status monitor");
    info!("Searching for a treadmill...");

    let pad = WalkPad::new().await?;
    pad.connect(ConnectOptions::default()).await?;
    info!(
        "✅ Connected, speaking {} protocol",
        pad.session_info().expect("connected").protocol
    );
    info!("Press Ctrl+C to stop monitoring");

    let events = pad.events();
    let mut states = events.subscribe_state();
    let mut errors = events.subscribe_errors();
    let mut changes = events.subscribe_connection_changes();

    loop {
        tokio::select! {
            state = states.recv() => match state {
                Ok(state) => info!(
                    "{:6.1} km/h | {:5} s | {:6.2} km | {:6} steps | running: {}",
                    state.speed_kmh,
                    state.elapsed_secs,
                    state.distance_km,
                    state.steps,
                    state.is_running
                ),
                Err(_) => break,
            },
            err = errors.recv() => {
                if let Ok(err) = err {
                    warn!("device error: {}", err);
                }
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    info!("connection: {} -> {}", change.from, change.to);
                    if change.to == ConnectionState::Disconnected {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }

    pad.disconnect().await;
    Ok(())
}
