//! doorsync - Winker portal door lock synchronization service
//!
//! Polls the Winker cloud portal for door lock devices, mirrors them into a
//! local accessory registry, and drives commanded open transitions until
//! local and remote state converge.

mod accessory;
mod config;
mod error;
mod lock;
mod models;
mod portal;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::accessory::{AccessoryRegistry, LogBridge, StateSink};
use crate::models::default_identity;
use crate::portal::{Credentials, HttpTransport, PortalClient, PortalTransport, Session};
use crate::sync::{DeviceRegistry, PollScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doorsync=info".into()),
        )
        .init();

    tracing::info!("Starting doorsync...");

    // Load configuration
    let config = config::Config::load()?;
    tracing::info!("Configuration loaded");

    // Portal client over the HTTP transport
    let transport = Arc::new(HttpTransport::new(&config.portal.base_url)?);
    let session = Session::new(Credentials {
        username: config.portal.username.clone(),
        password: config.portal.password.clone(),
        client_key: config.portal.client_key.clone(),
        portal: config.portal.portal,
    });
    let client = Arc::new(PortalClient::new(
        transport as Arc<dyn PortalTransport>,
        session,
    ));

    // Accessory boundary; replace with a real backend to expose the locks
    let bridge = Arc::new(LogBridge);

    // Scheduler and device registry
    let (scheduler, driver) =
        PollScheduler::new(Duration::from_secs(config.sync.check_frequency_secs));
    let registry = Arc::new(DeviceRegistry::new(
        client,
        Arc::clone(&bridge) as Arc<dyn AccessoryRegistry>,
        bridge as Arc<dyn StateSink>,
        scheduler.clone(),
        default_identity(),
        config.devices.clone(),
    ));

    // Initial discovery, then background refresh at the configured cadence
    registry.discover().await?;
    tracing::info!("Initial discovery complete ({} devices)", registry.len().await);

    tokio::spawn(driver.run(registry.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    scheduler.shutdown();

    Ok(())
}
