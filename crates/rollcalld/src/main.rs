use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        match_threshold = config.match_threshold,
        motion_threshold = config.motion_threshold,
        "configuration loaded"
    );

    let store = store::SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let gallery = store.gallery().await.context("loading gallery")?;
    tracing::info!(entries = gallery.len(), "gallery loaded");

    let engine = engine::spawn_engine(&config, store.clone()).context("starting engine")?;

    let session_bus = config.session_bus;
    let service = dbus_interface::AttendanceService {
        state: Arc::new(dbus_interface::AppState {
            config,
            engine,
            store,
            gallery: RwLock::new(Arc::new(gallery)),
        }),
    };

    let builder = if session_bus {
        tracing::info!("using session bus");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
