//! Valve actuation. The `gpio` feature gates the real rppal driver; without
//! it, an in-memory mock stands in. The actuator handed to the rest of the
//! process is one of two named variants: base (open/close/is_open) or timed
//! (adds `open_for`); callers pick behaviour by matching the variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[cfg(feature = "gpio")]
use anyhow::Result;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Base capability
// ---------------------------------------------------------------------------

/// Open/close with interior mutability so the handle can be shared between
/// the control loop, command handlers, and timed-close tasks. `close` must
/// be idempotent.
pub trait Valve: Send + Sync {
    fn open(&self);
    fn close(&self);
    fn is_open(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Mock valve (development and tests)
// ---------------------------------------------------------------------------

pub struct MockValve {
    open: AtomicBool,
}

impl MockValve {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
        }
    }
}

impl Default for MockValve {
    fn default() -> Self {
        Self::new()
    }
}

impl Valve for MockValve {
    fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// GPIO valve (production; requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioValve {
    pin: Mutex<OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioValve {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(pin_num)?.into_output();

        // Fail-safe: ensure closed at startup.
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }

        Ok(Self {
            pin: Mutex::new(pin),
            active_low,
        })
    }

    fn set(&self, on: bool) {
        let mut pin = self.pin.lock().expect("gpio pin mutex poisoned");
        // active-low relay: LOW = open, HIGH = closed
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

#[cfg(feature = "gpio")]
impl Valve for GpioValve {
    fn open(&self) {
        self.set(true);
    }

    fn close(&self) {
        self.set(false);
    }

    fn is_open(&self) -> bool {
        let pin = self.pin.lock().expect("gpio pin mutex poisoned");
        pin.is_set_high() != self.active_low
    }
}

// ---------------------------------------------------------------------------
// Timed variant
// ---------------------------------------------------------------------------

/// Adds self-timed closing on top of a base valve. Each `open_for` spawns
/// an independent close task; a new request does not cancel an outstanding
/// one, so several tasks may race to close. `close` being idempotent makes
/// that harmless.
#[derive(Clone)]
pub struct TimedValve {
    inner: Arc<dyn Valve>,
}

impl TimedValve {
    pub fn new(inner: Arc<dyn Valve>) -> Self {
        Self { inner }
    }

    pub fn open_for(&self, seconds: u64) {
        self.inner.open();
        info!(seconds, "valve opened with timed close");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            inner.close();
            info!(seconds, "timed close elapsed");
        });
    }
}

impl Valve for TimedValve {
    fn open(&self) {
        self.inner.open();
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

// ---------------------------------------------------------------------------
// The two named variants
// ---------------------------------------------------------------------------

/// The actuator wired at startup. Command handlers match on the variant to
/// decide whether timed opening is available; nothing probes capabilities
/// at runtime.
#[derive(Clone)]
pub enum Actuator {
    Basic(Arc<dyn Valve>),
    Timed(TimedValve),
}

impl Actuator {
    pub fn open(&self) {
        match self {
            Actuator::Basic(v) => v.open(),
            Actuator::Timed(v) => v.open(),
        }
    }

    pub fn close(&self) {
        match self {
            Actuator::Basic(v) => v.close(),
            Actuator::Timed(v) => v.close(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Actuator::Basic(v) => v.is_open(),
            Actuator::Timed(v) => v.is_open(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- MockValve --------------------------------------------------------

    #[test]
    fn mock_valve_starts_closed() {
        let v = MockValve::new();
        assert!(!v.is_open());
    }

    #[test]
    fn mock_valve_open_close() {
        let v = MockValve::new();
        v.open();
        assert!(v.is_open());
        v.close();
        assert!(!v.is_open());
    }

    #[test]
    fn close_on_closed_valve_is_noop() {
        let v = MockValve::new();
        v.close();
        v.close();
        assert!(!v.is_open());
    }

    // -- Actuator variants -------------------------------------------------

    #[test]
    fn basic_actuator_delegates() {
        let inner = Arc::new(MockValve::new());
        let actuator = Actuator::Basic(inner.clone());
        actuator.open();
        assert!(inner.is_open());
        assert!(actuator.is_open());
        actuator.close();
        assert!(!inner.is_open());
    }

    // -- TimedValve --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn open_for_closes_after_duration() {
        let inner: Arc<dyn Valve> = Arc::new(MockValve::new());
        let timed = TimedValve::new(Arc::clone(&inner));

        timed.open_for(30);
        assert!(inner.is_open());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(inner.is_open(), "closed too early");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!inner.is_open(), "timed close did not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_open_for_requests_are_not_cancelled() {
        let inner: Arc<dyn Valve> = Arc::new(MockValve::new());
        let timed = TimedValve::new(Arc::clone(&inner));

        timed.open_for(10);
        timed.open_for(100);

        // The earlier task closes first; the later one is still pending.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!inner.is_open());

        // The second task's close on an already-closed valve is a no-op.
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(!inner.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_close_during_timed_open_stays_closed() {
        let inner: Arc<dyn Valve> = Arc::new(MockValve::new());
        let timed = TimedValve::new(Arc::clone(&inner));

        timed.open_for(60);
        timed.close();
        assert!(!timed.is_open());

        // The pending task fires later and closes again; still fine.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!timed.is_open());
    }
}
