use anyhow::Result;
use rollcall_core::FrameSource;
use rollcall_hw::V4lFrameSource;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod event_log;
mod journal;
mod kiosk;
mod recognition;

use config::{Bus, Config};
use dbus_interface::KioskService;
use journal::SqliteJournal;
use kiosk::Kiosk;
use recognition::HttpRecognitionService;

const BUS_NAME: &str = "org.rollcall.Kiosk1";
const OBJECT_PATH: &str = "/org/rollcall/Kiosk1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        device = %config.camera.device,
        recognition_url = %config.recognition_url,
        db = %config.db_path.display(),
        "rollcalld starting"
    );

    let journal = Arc::new(SqliteJournal::open(&config.db_path, config.late_after()?)?);
    let marked_today = journal.count_on(chrono::Local::now().date_naive()).await?;
    let service = Arc::new(HttpRecognitionService::new(&config.recognition_url)?);
    tracing::info!(endpoint = service.endpoint(), marked_today, "adapters ready");

    let (events, _) = broadcast::channel(256);
    let logger = tokio::spawn(event_log::run(events.subscribe()));

    let camera = config.camera.clone();
    let kiosk = Arc::new(Kiosk::new(
        config.kiosk.clone(),
        Box::new(move || Box::new(V4lFrameSource::new(camera.clone())) as Box<dyn FrameSource>),
        service,
        journal,
        events,
    ));

    let builder = match config.bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, KioskService::new(Arc::clone(&kiosk)))?
        .build()
        .await?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, bus = ?config.bus, "control interface registered");

    if config.autostart {
        if let Err(err) = kiosk.start().await {
            tracing::error!(error = %err, hint = %err.user_message(), "initial session failed; waiting for Start");
        }
    }

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    kiosk.stop().await;
    logger.abort();

    Ok(())
}
