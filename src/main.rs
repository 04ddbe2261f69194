mod config;
mod controller;
mod db;
mod provider;
mod sensor;
mod state;
mod valve;
mod web;

use anyhow::Result;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::error;
use tracing_subscriber::EnvFilter;

use controller::WateringController;
use db::Db;
use provider::{ScheduleProvider, ThresholdProvider};
use sensor::SensorSource;
use state::{SharedState, SystemState};
use valve::{Actuator, TimedValve, Valve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| cfg.db_url.clone());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Shared state ────────────────────────────────────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new(
        OffsetDateTime::now_utc().date(),
    )));
    shared
        .write()
        .await
        .record_system("daemon started".to_string());

    // ── Actuator (fail-safe: closed before anything runs) ───────────
    let valve = build_valve()?;
    valve.close();
    let actuator = Actuator::Timed(TimedValve::new(valve));

    // ── Providers & controller ──────────────────────────────────────
    let timeout = Duration::from_millis(cfg.provider_timeout_ms);
    let controller = WateringController::new(
        build_sensors(),
        actuator.clone(),
        ThresholdProvider::new(db.clone(), timeout),
        ScheduleProvider::new(db.clone(), timeout),
        shared.clone(),
        cfg.controller.fallback_thresholds(),
    );

    // ── Control plane ───────────────────────────────────────────────
    let app = web::AppState {
        shared,
        db,
        actuator,
    };
    let port = cfg.web_port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, port).await {
            error!("web server exited: {e:#}");
        }
    });

    // ── Driver loop ─────────────────────────────────────────────────
    controller::run(controller, Duration::from_secs(cfg.tick_interval_sec)).await;
    Ok(())
}

#[cfg(feature = "gpio")]
fn build_valve() -> Result<Arc<dyn Valve>> {
    let pin: u8 = env::var("VALVE_GPIO_PIN")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(17);
    // Many common relay boards are active-low. If yours is active-high, set
    // RELAY_ACTIVE_LOW=0.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    Ok(Arc::new(valve::GpioValve::new(pin, active_low)?))
}

#[cfg(not(feature = "gpio"))]
fn build_valve() -> Result<Arc<dyn Valve>> {
    Ok(Arc::new(valve::MockValve::new()))
}

#[cfg(feature = "sim")]
fn build_sensors() -> Box<dyn SensorSource> {
    Box::new(sensor::SimSensors::new())
}

#[cfg(not(feature = "sim"))]
fn build_sensors() -> Box<dyn SensorSource> {
    Box::new(sensor::NullSensors)
}
