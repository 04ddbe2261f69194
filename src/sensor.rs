//! Sensor sources. Readings are optional per cycle: `None` means "no
//! reading this time", never an error.

#[cfg(feature = "sim")]
use time::OffsetDateTime;

use crate::state::{AirReading, SoilReading};

pub trait SensorSource: Send {
    fn read_air(&mut self) -> Option<AirReading>;
    fn read_soil(&mut self) -> Option<SoilReading>;
}

// ---------------------------------------------------------------------------
// Simulated sensors (development; no hardware)
// ---------------------------------------------------------------------------

/// Stateful soil/air simulator for local development.
///
/// Models the behaviour that matters to the controller: temporal coherence
/// via a random walk with mean reversion, gradual drying drift, per-reading
/// noise, and occasional dropouts (sensor flakiness).
#[cfg(feature = "sim")]
pub struct SimSensors {
    moisture: f64,
    /// Probability that a soil read returns nothing this cycle.
    dropout: f64,
}

#[cfg(feature = "sim")]
impl SimSensors {
    pub fn new() -> Self {
        Self {
            moisture: 0.35,
            dropout: 0.02,
        }
    }

    fn noise(scale: f64) -> f64 {
        (fastrand::f64() - 0.5) * scale
    }
}

#[cfg(feature = "sim")]
impl Default for SimSensors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "sim")]
impl SensorSource for SimSensors {
    fn read_air(&mut self) -> Option<AirReading> {
        Some(AirReading {
            temperature_c: 22.0 + Self::noise(2.0),
            humidity_rel: 50.0 + Self::noise(10.0),
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    fn read_soil(&mut self) -> Option<SoilReading> {
        // Mean reversion toward a mid-range value plus a slow drying drift,
        // so the controller sees plausible multi-hour dynamics.
        let reversion = (0.33 - self.moisture) * 0.01;
        self.moisture = (self.moisture + reversion - 0.0005 + Self::noise(0.01)).clamp(0.0, 1.0);

        if fastrand::f64() < self.dropout {
            return None;
        }

        Some(SoilReading {
            temperature_c: 18.0 + Self::noise(2.0),
            moisture_rel: (self.moisture + Self::noise(0.005)).clamp(0.0, 1.0),
            timestamp: OffsetDateTime::now_utc(),
        })
    }
}

// ---------------------------------------------------------------------------
// No-hardware stub
// ---------------------------------------------------------------------------

/// Produces no readings at all. Used when the crate is built without the
/// `sim` feature and no hardware backend is wired in; the controller then
/// fails safe into its no-soil-data state with the valve closed.
pub struct NullSensors;

impl SensorSource for NullSensors {
    fn read_air(&mut self) -> Option<AirReading> {
        None
    }

    fn read_soil(&mut self) -> Option<SoilReading> {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
