use smartwindow::{ApiClient, ApiConfig, FileStore, Result, SessionManager, StartupRoute};
use std::{env, sync::Arc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔑 Smart window session example");

    let config = match env::var("SMARTWINDOW_API_URL") {
        Ok(base_url) => ApiConfig {
            base_url,
            ..ApiConfig::default()
        },
        Err(_) => ApiConfig::default(),
    };
    info!("Backend: {}", config.base_url);

    let store = Arc::new(FileStore::open_default().await?);
    let session = Arc::new(SessionManager::new(store.clone()));
    let client = ApiClient::with_config(config, session, store)?;

    let user = match client.validate_on_startup().await {
        StartupRoute::Home(user) => user,
        StartupRoute::Login => {
            // Tokens handed over by the OAuth redirect
            let (Ok(access), Ok(refresh)) = (
                env::var("SMARTWINDOW_ACCESS_TOKEN"),
                env::var("SMARTWINDOW_REFRESH_TOKEN"),
            ) else {
                warn!("No saved session; set SMARTWINDOW_ACCESS_TOKEN and SMARTWINDOW_REFRESH_TOKEN");
                return Ok(());
            };

            client.login(access, refresh).await?;
            match client.me().await {
                Ok(user) => user,
                Err(e) => {
                    error!("❌ Login rejected: {}", e);
                    client.logout().await;
                    return Err(e);
                }
            }
        }
    };

    info!("✅ Signed in as {} <{}>", user.nickname, user.email);

    let devices = client.devices().await?;
    info!("📋 {} registered window(s)", devices.len());
    for device in &devices {
        info!(
            "  [{}] {} power={} open={} mode={:?}",
            device.device_id,
            device.device_name,
            if device.power_status { "ON" } else { "OFF" },
            device.open_status,
            device.mode_status
        );
    }

    if env::var("SMARTWINDOW_LOGOUT").is_ok() {
        client.logout().await;
        info!("👋 Logged out");
    }

    Ok(())
}
