//! Shared runtime state: latest readings, valve flag, operating mode, the
//! published controller state, and the daily watered-seconds counter. Read
//! and written by the control loop and concurrently by API handlers; every
//! access goes through one lock acquisition.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AirReading {
    pub temperature_c: f64,
    pub humidity_rel: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SoilReading {
    pub temperature_c: f64,
    /// Relative moisture, 0.0 (bone dry) to 1.0 (saturated).
    pub moisture_rel: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Mode::Auto),
            "manual" => Some(Mode::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual => "manual",
        }
    }
}

/// The label published after each step. Guard outcomes (`NoSoilData`,
/// `BudgetExceeded`) appear here without being machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Watering,
    Soak,
    Manual,
    NoSoilData,
    BudgetExceeded,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Watering => "watering",
            ControllerState::Soak => "soak",
            ControllerState::Manual => "manual",
            ControllerState::NoSoilData => "no_soil_data",
            ControllerState::BudgetExceeded => "budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Valve,
    Controller,
    Error,
    System,
}

pub struct SystemState {
    pub started_at: Instant,
    last_air: Option<AirReading>,
    last_soil: Option<SoilReading>,
    valve_open: bool,
    mode: Mode,
    controller_state: ControllerState,
    daily_watered_seconds: u32,
    last_reset_date: Date,
    events: VecDeque<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Snapshot / status
// ---------------------------------------------------------------------------

/// Consistent copy of every data field, taken under one lock acquisition.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub air: Option<AirReading>,
    pub soil: Option<SoilReading>,
    pub valve_open: bool,
    pub mode: Mode,
    pub controller_state: ControllerState,
    pub daily_watered_seconds: u32,
    #[serde(with = "iso_date")]
    pub last_reset_date: Date,
}

/// What the status API returns: the snapshot plus uptime and recent events
/// (newest first).
#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(today: Date) -> Self {
        Self {
            started_at: Instant::now(),
            last_air: None,
            last_soil: None,
            valve_open: false,
            mode: Mode::Auto,
            controller_state: ControllerState::Idle,
            daily_watered_seconds: 0,
            last_reset_date: today,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn set_air(&mut self, air: AirReading) {
        self.last_air = Some(air);
    }

    pub fn set_soil(&mut self, soil: SoilReading) {
        self.last_soil = Some(soil);
    }

    /// Mirror the actuator's actual state. Records an event only when the
    /// flag flips, so the per-tick mirroring stays quiet.
    pub fn set_valve_open(&mut self, open: bool) {
        if self.valve_open != open {
            self.valve_open = open;
            let detail = if open { "valve OPEN" } else { "valve CLOSED" };
            self.push_event(EventKind::Valve, detail.to_string());
        }
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.mode = mode;
            self.push_event(EventKind::System, format!("mode set to {}", mode.as_str()));
        }
    }

    pub fn set_controller_state(&mut self, state: ControllerState) {
        if self.controller_state != state {
            self.push_event(
                EventKind::Controller,
                format!("{} -> {}", self.controller_state.as_str(), state.as_str()),
            );
            self.controller_state = state;
        }
    }

    /// Additive only; saturates instead of wrapping.
    pub fn add_watered_seconds(&mut self, seconds: u32) {
        self.daily_watered_seconds = self.daily_watered_seconds.saturating_add(seconds);
    }

    /// Zero the daily counter exactly once per calendar date change.
    pub fn reset_daily_if_needed(&mut self, now: OffsetDateTime) {
        if self.last_reset_date != now.date() {
            self.last_reset_date = now.date();
            self.daily_watered_seconds = 0;
            self.push_event(EventKind::System, "daily watering counter reset".to_string());
        }
    }

    /// Record an error event (provider failures and the like).
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            air: self.last_air,
            soil: self.last_soil,
            valve_open: self.valve_open,
            mode: self.mode,
            controller_state: self.controller_state,
            daily_watered_seconds: self.daily_watered_seconds,
            last_reset_date: self.last_reset_date,
        }
    }

    /// Build the JSON-serialisable status payload.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            snapshot: self.snapshot(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn events(&self) -> &VecDeque<SystemEvent> {
        &self.events
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
