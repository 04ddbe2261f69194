//! Watering decision core: a single-valve pulse/soak state machine driven
//! by a periodic step.
//!
//! ```text
//! Idle ──[moisture < low in window, or schedule hit]──▶ Watering
//!  ▲                                                       │
//!  │                                          [pulse elapsed]
//!  │                                                       ▼
//!  └──────[soak elapsed, moisture recovered]────────── Soaking
//!                  (still dry: another pulse)
//! ```
//!
//! Hard operational limits (daily budget, missing soil data) are checked
//! before the machine runs and publish their own labels without touching
//! the phase; the too-wet safety override runs after the machine and always
//! wins, even over a transition made in the same step.

use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::ThresholdSet;
use crate::provider::{ScheduleProvider, ThresholdProvider};
use crate::sensor::SensorSource;
use crate::state::{ControllerState, Mode, SharedState};
use crate::valve::Actuator;

/// How long a fetched threshold set stays fresh before the next step
/// re-fetches it.
const THRESHOLD_TTL_SEC: i64 = 60;

// ---------------------------------------------------------------------------
// The machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for moisture to drop below the low threshold (in window) or
    /// for a schedule hit.
    Idle,
    /// Valve open; waiting for the pulse deadline.
    Watering { until: OffsetDateTime },
    /// Valve closed; waiting out the soak before re-checking moisture.
    Soak { until: OffsetDateTime },
    /// Mode is manual; the machine does not advance.
    Manual,
}

struct Fsm {
    phase: Phase,
}

impl Fsm {
    fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    /// The manual-to-auto boundary: back to Idle, any pending watering or
    /// soak deadline discarded. Nothing resumes.
    fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    fn label(&self) -> ControllerState {
        match self.phase {
            Phase::Idle => ControllerState::Idle,
            Phase::Watering { .. } => ControllerState::Watering,
            Phase::Soak { .. } => ControllerState::Soak,
            Phase::Manual => ControllerState::Manual,
        }
    }
}

struct ThresholdCache {
    value: Option<ThresholdSet>,
    fetched_at: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct WateringController {
    sensors: Box<dyn SensorSource>,
    actuator: Actuator,
    thresholds: ThresholdProvider,
    schedules: ScheduleProvider,
    shared: SharedState,
    fallback: ThresholdSet,
    fsm: Fsm,
    cache: ThresholdCache,
}

impl WateringController {
    pub fn new(
        sensors: Box<dyn SensorSource>,
        actuator: Actuator,
        thresholds: ThresholdProvider,
        schedules: ScheduleProvider,
        shared: SharedState,
        fallback: ThresholdSet,
    ) -> Self {
        Self {
            sensors,
            actuator,
            thresholds,
            schedules,
            shared,
            fallback,
            fsm: Fsm::new(),
            cache: ThresholdCache {
                value: None,
                fetched_at: None,
            },
        }
    }

    /// One control decision. Infallible: every collaborator failure
    /// degrades to a defined fallback. Effects land in SharedState and the
    /// actuator.
    pub async fn step(&mut self, now: OffsetDateTime) {
        let soil = self.sensors.read_soil();
        let air = self.sensors.read_air();

        // Counter rollover, sensor publishing, and actuator mirroring
        // happen in every mode.
        let snap = {
            let mut st = self.shared.write().await;
            st.reset_daily_if_needed(now);
            if let Some(a) = air {
                st.set_air(a);
            }
            if let Some(s) = soil {
                st.set_soil(s);
            }
            st.set_valve_open(self.actuator.is_open());
            st.snapshot()
        };

        if snap.mode == Mode::Manual {
            self.fsm.phase = Phase::Manual;
            self.publish().await;
            return;
        }

        // Mode just switched back to auto: the machine restarts from Idle,
        // whatever was mid-flight.
        if self.fsm.phase == Phase::Manual {
            self.fsm.reset();
        }

        let thresholds = self.load_thresholds(now).await;
        let scheduled = self.scheduled_now(now).await;

        // ── Guard: daily budget exhausted ─────────────────────────
        if i64::from(snap.daily_watered_seconds) >= thresholds.daily_budget_sec() {
            self.force_closed().await;
            self.shared
                .write()
                .await
                .set_controller_state(ControllerState::BudgetExceeded);
            return;
        }

        // ── Guard: no usable soil reading this step ───────────────
        let Some(soil) = soil else {
            self.force_closed().await;
            self.shared
                .write()
                .await
                .set_controller_state(ControllerState::NoSoilData);
            return;
        };

        let moisture = soil.moisture_rel;

        // ── The machine ───────────────────────────────────────────
        match self.fsm.phase {
            Phase::Idle => {
                let dry = moisture < thresholds.moisture_low;
                if (dry && in_window(now, &thresholds)) || scheduled {
                    info!(
                        moisture = format!("{moisture:.3}"),
                        low = format!("{:.3}", thresholds.moisture_low),
                        scheduled,
                        pulse_sec = thresholds.watering_sec,
                        "starting watering pulse"
                    );
                    self.start_watering(now, &thresholds).await;
                }
            }
            Phase::Watering { until } => {
                if now >= until {
                    info!(soak_min = thresholds.soak_min, "pulse complete, soaking");
                    self.actuator.close();
                    self.shared.write().await.set_valve_open(false);
                    self.fsm.phase = Phase::Soak {
                        until: now + time::Duration::minutes(thresholds.soak_min),
                    };
                }
            }
            Phase::Soak { until } => {
                if now >= until {
                    if moisture < thresholds.moisture_low {
                        info!(
                            moisture = format!("{moisture:.3}"),
                            "soak done, still dry, another pulse"
                        );
                        self.start_watering(now, &thresholds).await;
                    } else {
                        info!(
                            moisture = format!("{moisture:.3}"),
                            "soak done, moisture recovered"
                        );
                        self.fsm.phase = Phase::Idle;
                    }
                }
            }
            // Handled above; the reset already ran.
            Phase::Manual => {}
        }

        // ── Safety override: too wet always forces closed/idle, even
        // over a transition made earlier in this same step ─────────
        if moisture > thresholds.moisture_high {
            self.force_closed().await;
            self.fsm.phase = Phase::Idle;
        }

        self.publish().await;
    }

    async fn start_watering(&mut self, now: OffsetDateTime, t: &ThresholdSet) {
        self.actuator.open();
        self.fsm.phase = Phase::Watering {
            until: now + time::Duration::seconds(t.watering_sec),
        };

        let mut st = self.shared.write().await;
        st.set_valve_open(true);
        // The full pulse duration is charged against the budget up front,
        // not by measured open time.
        st.add_watered_seconds(t.watering_sec.clamp(0, i64::from(u32::MAX)) as u32);
    }

    async fn force_closed(&self) {
        self.actuator.close();
        self.shared.write().await.set_valve_open(false);
    }

    async fn publish(&self) {
        self.shared
            .write()
            .await
            .set_controller_state(self.fsm.label());
    }

    /// The active threshold set: cached value while fresh, else re-fetched.
    /// A failed fetch keeps serving the last good value (retrying every
    /// step); with nothing cached yet the static config set applies.
    async fn load_thresholds(&mut self, now: OffsetDateTime) -> ThresholdSet {
        let fresh = match self.cache.fetched_at {
            Some(at) => now - at < time::Duration::seconds(THRESHOLD_TTL_SEC),
            None => false,
        };
        if fresh {
            if let Some(t) = &self.cache.value {
                return t.clone();
            }
        }

        match self.thresholds.get_current().await {
            Ok(t) => {
                self.cache.value = Some(t.clone());
                self.cache.fetched_at = Some(now);
                t
            }
            Err(e) => {
                warn!("threshold fetch failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("threshold fetch failed: {e}"));
                self.cache
                    .value
                    .clone()
                    .unwrap_or_else(|| self.fallback.clone())
            }
        }
    }

    /// Whether any enabled schedule entry matches the current minute.
    /// Fetch failure counts as no match.
    async fn scheduled_now(&mut self, now: OffsetDateTime) -> bool {
        match self.schedules.get_enabled_for(now.date()).await {
            Ok(entries) => entries
                .iter()
                .any(|s| s.hour == now.hour() && s.minute == now.minute()),
            Err(e) => {
                warn!("schedule fetch failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("schedule fetch failed: {e}"));
                false
            }
        }
    }
}

fn in_window(now: OffsetDateTime, t: &ThresholdSet) -> bool {
    t.window_start_hour <= now.hour() && now.hour() < t.window_end_hour
}

// ---------------------------------------------------------------------------
// Driver loop
// ---------------------------------------------------------------------------

/// Run the control loop. Intended to be the main task of the process.
/// Steps never overlap: the interval is slept after each step completes, so
/// real cadence is interval plus step latency.
pub async fn run(mut controller: WateringController, tick: Duration) {
    info!(tick_sec = tick.as_secs(), "controller loop started");
    {
        let mut st = controller.shared.write().await;
        st.record_system(format!(
            "controller started (tick every {}s)",
            tick.as_secs()
        ));
    }

    loop {
        controller.step(OffsetDateTime::now_utc()).await;
        tokio::time::sleep(tick).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
