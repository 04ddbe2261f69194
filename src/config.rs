//! TOML config file loading, validation, and defaults. The file carries the
//! static fallback threshold set (used when the database has never been
//! reachable), the tick interval, and process-level settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::db::ThresholdSet;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tick_interval_sec: u64,
    pub db_url: String,
    pub web_port: u16,
    pub provider_timeout_ms: u64,
    pub controller: ControllerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_sec: 5,
            db_url: "sqlite:irrigation.db?mode=rwc".to_string(),
            web_port: 8080,
            provider_timeout_ms: 2000,
            controller: ControllerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub threshold_low: f64,
    pub threshold_high: f64,
    pub watering_seconds: i64,
    pub soak_minutes: i64,
    /// Accepted for config-file compatibility; no transition consumes it.
    pub max_cycle_minutes: i64,
    pub daily_budget_minutes: i64,
    pub window: WindowConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            threshold_low: 0.38,
            threshold_high: 0.45,
            watering_seconds: 90,
            soak_minutes: 8,
            max_cycle_minutes: 30,
            daily_budget_minutes: 20,
            window: WindowConfig::default(),
        }
    }
}

/// Hours of day during which moisture-triggered watering is permitted.
/// `end_hour` is exclusive (3..6 means 03:00-05:59).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            start_hour: 3,
            end_hour: 6,
        }
    }
}

impl ControllerConfig {
    /// The static threshold set the controller falls back to when no
    /// database-backed set has ever been fetched.
    pub fn fallback_thresholds(&self) -> ThresholdSet {
        ThresholdSet {
            moisture_low: self.threshold_low,
            moisture_high: self.threshold_high,
            watering_sec: self.watering_seconds,
            soak_min: self.soak_minutes,
            daily_budget_min: self.daily_budget_minutes,
            window_start_hour: self.window.start_hour,
            window_end_hour: self.window.end_hour,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config values. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.tick_interval_sec == 0 {
            errors.push("tick_interval_sec must be positive".to_string());
        }
        if self.provider_timeout_ms == 0 {
            errors.push("provider_timeout_ms must be positive".to_string());
        }
        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }

        let c = &self.controller;

        // ── Moisture bounds ─────────────────────────────────────
        if !(0.0..=1.0).contains(&c.threshold_low) {
            errors.push(format!(
                "threshold_low {} out of range [0.0, 1.0]",
                c.threshold_low
            ));
        }
        if !(0.0..=1.0).contains(&c.threshold_high) {
            errors.push(format!(
                "threshold_high {} out of range [0.0, 1.0]",
                c.threshold_high
            ));
        }
        if c.threshold_low >= c.threshold_high {
            errors.push(format!(
                "threshold_high ({}) must be greater than threshold_low ({})",
                c.threshold_high, c.threshold_low
            ));
        }

        // ── Timing values (all must be positive) ────────────────
        if c.watering_seconds <= 0 {
            errors.push(format!(
                "watering_seconds must be positive, got {}",
                c.watering_seconds
            ));
        }
        if c.soak_minutes <= 0 {
            errors.push(format!(
                "soak_minutes must be positive, got {}",
                c.soak_minutes
            ));
        }
        if c.max_cycle_minutes <= 0 {
            errors.push(format!(
                "max_cycle_minutes must be positive, got {}",
                c.max_cycle_minutes
            ));
        }
        if c.daily_budget_minutes <= 0 {
            errors.push(format!(
                "daily_budget_minutes must be positive, got {}",
                c.daily_budget_minutes
            ));
        }

        // ── Watering window ─────────────────────────────────────
        if c.window.start_hour >= 24 {
            errors.push(format!(
                "window.start_hour {} out of range [0, 24)",
                c.window.start_hour
            ));
        }
        if c.window.end_hour >= 24 {
            errors.push(format!(
                "window.end_hour {} out of range [0, 24)",
                c.window.end_hour
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file is not an
/// error: every key has a default, so the daemon can run unconfigured.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
