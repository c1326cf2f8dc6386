use smartwindow::{
    BtleplugTransport, ConnectionParams, FileStore, LiveDeviceState, Result, SmartWindowError,
    StaticPermissions, WindowController, WriteOutcome,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🪟 Smart window open/close example");

    let live = Arc::new(LiveDeviceState::new());
    let controller = Arc::new(WindowController::new(
        Arc::new(BtleplugTransport::new().await?),
        Arc::new(StaticPermissions::granted()),
        Arc::new(FileStore::open_default().await?),
        live.clone(),
        ConnectionParams::default(),
    ));
    controller.spawn_connection_watch().await?;

    info!("Looking for '{}'...", controller.params().target_name);
    match controller.on_focus().await {
        Ok(device) => info!("✅ Connected to {}", device.id),
        Err(SmartWindowError::ScanTimeout { .. }) => {
            info!("Status: {}", controller.status().await);
            info!("🔍 Searching manually...");

            let devices = controller.discover_devices(Duration::from_secs(5)).await?;
            for device in &devices {
                info!(
                    "  {} {}",
                    device.id,
                    device.advertised_name.as_deref().unwrap_or("?")
                );
            }

            let Some(first) = devices.first() else {
                warn!("No windows nearby");
                return Ok(());
            };
            let device = controller.connect(&first.id).await?;
            info!("✅ Connected to {}", device.id);
        }
        Err(e) => {
            error!("❌ {}", e);
            info!("Status: {}", controller.status().await);
            return Err(e);
        }
    }

    // Slider dragged, then released at 73%
    for value in [10.0, 35.0, 60.0] {
        controller.slider_change(value).await;
    }
    report(controller.slider_commit(73.0).await, &live);
    sleep(Duration::from_secs(3)).await;

    // Swipe the pane fully open
    let width = controller.params().pane_width;
    controller.drag_move(width / 2.0).await;
    report(controller.drag_release(width).await, &live);
    sleep(Duration::from_secs(3)).await;

    // And closed again
    report(controller.slider_commit(0.0).await, &live);
    sleep(Duration::from_secs(1)).await;

    // Leave the binding in place so the next run reconnects directly
    controller.on_blur().await;
    info!("Status: {}", controller.status().await);

    Ok(())
}

fn report(outcome: WriteOutcome, live: &LiveDeviceState) {
    let percentage = live
        .open_percentage()
        .map_or_else(|| "-".to_string(), |p| p.to_string());

    match outcome {
        WriteOutcome::Sent => info!("📤 Sent {}", percentage),
        WriteOutcome::NotConnected => warn!("Not connected, {} not sent", percentage),
        WriteOutcome::Failed => warn!("Write of {} failed", percentage),
    }
}
