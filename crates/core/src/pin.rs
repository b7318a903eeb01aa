//! Pin model.
//!
//! A [`Pin`] combines two drivers: the external state set by test harnesses
//! or debug tools, and the internal state derived from [`PinControls`].
//! The resolved state is recomputed on every change and announced on the
//! pin's [`Signal`].
//!
//! ## Driver slots
//!
//! Every peripheral driving a pin owns a slot keyed by its [`CtlId`]. Slots
//! stack in attach order and the most recently attached one decides the
//! internal state: a GPIO port attaches at reset, an alternate function
//! (USART transmitter, SPI master outputs...) attaches on top when enabled
//! and releases its slot when disabled, uncovering the port again. A slot
//! updated in place keeps its position. Device reset detaches every slot.
//!
//! ## Resolution
//!
//! | external \ gpio | Floating | PullUp   | PullDown | High     | Low      |
//! |-----------------|----------|----------|----------|----------|----------|
//! | Floating        | Floating | PullUp   | PullDown | High     | Low      |
//! | PullUp          | PullUp   | PullUp   | Floating | High     | Low      |
//! | PullDown        | PullDown | Floating | PullDown | High     | Low      |
//! | High            | High     | High     | High     | High     | Shorted  |
//! | Low             | Low      | Low      | Low      | Shorted  | Low      |
//!
//! An analog level behaves like a driven level against pulls and floating,
//! and shorts against any other driven level unless both are equal.

use serde::{Deserialize, Serialize};

use crate::signal::Signal;
use crate::types::{id_to_str, str_to_id, CtlId, PinId, VarData};

/// Electrical state of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum PinState {
    #[default]
    Floating,
    PullDown,
    PullUp,
    Low,
    High,
    Shorted,
    /// Driven analog level, as a fraction of VCC in `[0, 1]`.
    Analog(f64),
}

impl PinState {
    #[inline(always)]
    pub fn is_driven(self) -> bool {
        matches!(self, PinState::Low | PinState::High | PinState::Analog(_))
    }

    #[inline(always)]
    pub fn is_pull(self) -> bool {
        matches!(self, PinState::PullUp | PinState::PullDown)
    }

    /// Numeric code used in signal payloads.
    pub fn code(self) -> u64 {
        match self {
            PinState::Floating => 0,
            PinState::PullDown => 1,
            PinState::PullUp => 2,
            PinState::Low => 3,
            PinState::High => 4,
            PinState::Shorted => 5,
            PinState::Analog(_) => 6,
        }
    }

    /// Logic level seen by a digital input.
    pub fn digital(self) -> bool {
        match self {
            PinState::High | PinState::PullUp => true,
            PinState::Analog(v) => v > 0.5,
            _ => false,
        }
    }

    /// Level as a fraction of VCC. Floating and shorted pins sit at mid-rail.
    pub fn voltage(self) -> f64 {
        match self {
            PinState::Low | PinState::PullDown => 0.0,
            PinState::High | PinState::PullUp => 1.0,
            PinState::Floating | PinState::Shorted => 0.5,
            PinState::Analog(v) => v,
        }
    }
}

/// Combine two drivers of the same pin.
pub fn resolve(a: PinState, b: PinState) -> PinState {
    use PinState::*;
    match (a, b) {
        (Shorted, _) | (_, Shorted) => Shorted,
        (Floating, x) | (x, Floating) => x,
        (PullUp, PullDown) | (PullDown, PullUp) => Floating,
        (x, y) if x.is_pull() && y.is_pull() => x,
        (x, y) if x.is_pull() => y,
        (x, y) if y.is_pull() => x,
        (Analog(u), Analog(v)) => {
            if u == v {
                Analog(u)
            } else {
                Shorted
            }
        }
        (Analog(_), _) | (_, Analog(_)) => Shorted,
        (x, y) if x == y => x,
        _ => Shorted,
    }
}

/// Controls set by a peripheral driving a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PinControls {
    /// Output enable.
    pub dir: bool,
    /// Output level.
    pub drive: bool,
    pub inverted: bool,
    pub pull_up: bool,
}

impl PinControls {
    pub fn state(&self) -> PinState {
        if self.dir {
            if self.drive ^ self.inverted {
                PinState::High
            } else {
                PinState::Low
            }
        } else if self.pull_up {
            PinState::PullUp
        } else {
            PinState::Floating
        }
    }
}

/// Signal ids raised by a pin.
pub mod sig {
    /// Resolved state changed; data = [`PinState::code`](super::PinState::code).
    pub const STATE_CHANGE: u16 = 0;
    /// Digital level changed; data = 0 or 1.
    pub const DIGITAL_CHANGE: u16 = 1;
    /// Voltage changed; data = level as a fraction of VCC.
    pub const VOLTAGE_CHANGE: u16 = 2;
}

/// One peripheral's hold on a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDriver {
    pub owner: CtlId,
    pub controls: PinControls,
}

/// Persistent part of a pin, for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinSnapshot {
    pub external: PinState,
    /// Bottom to top.
    pub drivers: Vec<PinDriver>,
}

#[derive(Debug)]
pub struct Pin {
    id: PinId,
    name: String,
    external: PinState,
    drivers: Vec<PinDriver>,
    state: PinState,
    signal: Signal,
}

impl Pin {
    pub fn new(name: &str) -> Self {
        Pin {
            id: str_to_id(name),
            name: name.to_string(),
            external: PinState::Floating,
            drivers: Vec::new(),
            state: PinState::Floating,
            signal: Signal::new(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> PinId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    #[inline(always)]
    pub fn state(&self) -> PinState {
        self.state
    }

    #[inline(always)]
    pub fn digital_state(&self) -> bool {
        self.state.digital()
    }

    #[inline(always)]
    pub fn voltage(&self) -> f64 {
        self.state.voltage()
    }

    pub fn external_state(&self) -> PinState {
        self.external
    }

    /// Controls of the top driver, the ones in effect.
    pub fn controls(&self) -> PinControls {
        self.drivers.last().map(|d| d.controls).unwrap_or_default()
    }

    /// Controls held by `owner`, if it drives the pin.
    pub fn controls_of(&self, owner: CtlId) -> Option<PinControls> {
        self.drivers.iter().find(|d| d.owner == owner).map(|d| d.controls)
    }

    /// Owner of the driver in effect.
    pub fn driver(&self) -> Option<CtlId> {
        self.drivers.last().map(|d| d.owner)
    }

    pub fn set_external_state(&mut self, state: PinState) {
        self.external = state;
        self.update();
    }

    /// Update the slot of `owner`, attaching it on top if it is new.
    pub fn set_controls(&mut self, owner: CtlId, controls: PinControls) {
        match self.drivers.iter_mut().find(|d| d.owner == owner) {
            Some(slot) => slot.controls = controls,
            None => {
                tracing::trace!("{} driven by {}", self.name, id_to_str(owner));
                self.drivers.push(PinDriver { owner, controls });
            }
        }
        self.update();
    }

    /// Detach the slot of `owner`. Returns false if it held none.
    pub fn release(&mut self, owner: CtlId) -> bool {
        let Some(pos) = self.drivers.iter().position(|d| d.owner == owner) else {
            return false;
        };
        self.drivers.remove(pos);
        self.update();
        true
    }

    pub(crate) fn release_all(&mut self) {
        self.drivers.clear();
        self.update();
    }

    fn resolved(&self) -> PinState {
        resolve(self.external, self.controls().state())
    }

    fn update(&mut self) {
        let new = self.resolved();
        let old = std::mem::replace(&mut self.state, new);
        if new == old {
            return;
        }
        self.signal.raise(sig::STATE_CHANGE, 0, new.code());
        if new.voltage() != old.voltage() {
            self.signal.raise(sig::VOLTAGE_CHANGE, 0, new.voltage());
        }
        if new.digital() != old.digital() {
            self.signal.raise(sig::DIGITAL_CHANGE, 0, VarData::Uint(new.digital() as u64));
        }
    }

    pub fn snapshot(&self) -> PinSnapshot {
        PinSnapshot { external: self.external, drivers: self.drivers.clone() }
    }

    /// Restore drivers without raising any signal.
    pub fn restore(&mut self, snap: &PinSnapshot) {
        self.external = snap.external;
        self.drivers = snap.drivers.clone();
        self.state = self.resolved();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalRecorder;
    use crate::types::ctl_id;

    const PORT: CtlId = ctl_id(b"IOGB");
    const USART: CtlId = ctl_id(b"UAR0");

    #[test]
    fn test_external_high_raises_one_digital_change() {
        let mut pin = Pin::new("PB0");
        let rec = SignalRecorder::new();
        pin.signal().connect(rec.clone(), 0);

        pin.set_external_state(PinState::High);
        assert!(pin.digital_state());
        assert_eq!(rec.count(sig::DIGITAL_CHANGE), 1);
        assert_eq!(rec.count(sig::STATE_CHANGE), 1);
    }

    #[test]
    fn test_floating_with_pull_up_reads_high() {
        let mut pin = Pin::new("PB1");
        pin.set_controls(PORT, PinControls { pull_up: true, ..Default::default() });
        pin.set_external_state(PinState::High);
        let rec = SignalRecorder::new();
        pin.signal().connect(rec.clone(), 0);

        pin.set_external_state(PinState::Floating);
        assert_eq!(pin.state(), PinState::PullUp);
        assert!(pin.digital_state());
        assert_eq!(rec.count(sig::DIGITAL_CHANGE), 0);
    }

    #[test]
    fn test_opposing_drive_shorts() {
        let mut pin = Pin::new("PD2");
        pin.set_external_state(PinState::Low);
        pin.set_controls(PORT, PinControls { dir: true, drive: true, ..Default::default() });
        assert_eq!(pin.state(), PinState::Shorted);
    }

    #[test]
    fn test_inverted_drive() {
        let c = PinControls { dir: true, drive: true, inverted: true, pull_up: false };
        assert_eq!(c.state(), PinState::Low);
    }

    #[test]
    fn test_resolve_rules() {
        use PinState::*;
        assert_eq!(resolve(PullUp, PullDown), Floating);
        assert_eq!(resolve(PullDown, High), High);
        assert_eq!(resolve(Analog(0.3), PullUp), Analog(0.3));
        assert_eq!(resolve(Analog(0.3), Low), Shorted);
        assert_eq!(resolve(Analog(0.3), Analog(0.3)), Analog(0.3));
        assert_eq!(resolve(Analog(0.3), Analog(0.4)), Shorted);
        assert_eq!(resolve(Shorted, Floating), Shorted);
        assert_eq!(resolve(Low, Low), Low);
    }

    #[test]
    fn test_restore_is_silent() {
        let mut pin = Pin::new("PC0");
        let rec = SignalRecorder::new();
        pin.signal().connect(rec.clone(), 0);
        pin.restore(&PinSnapshot { external: PinState::High, drivers: Vec::new() });
        assert_eq!(pin.state(), PinState::High);
        assert!(rec.is_empty());
    }

    #[test]
    fn test_top_driver_overrides_port() {
        let mut pin = Pin::new("PD1");
        let low = PinControls { dir: true, drive: false, ..Default::default() };
        let high = PinControls { dir: true, drive: true, ..Default::default() };
        pin.set_controls(PORT, low);
        assert_eq!(pin.state(), PinState::Low);

        pin.set_controls(USART, high);
        assert_eq!(pin.state(), PinState::High);
        assert_eq!(pin.driver(), Some(USART));

        // port writes land in its own slot, under the alternate function
        pin.set_controls(PORT, PinControls { pull_up: true, ..Default::default() });
        assert_eq!(pin.state(), PinState::High);
        assert_eq!(pin.controls_of(PORT).map(|c| c.pull_up), Some(true));

        assert!(pin.release(USART));
        assert!(!pin.release(USART));
        assert_eq!(pin.state(), PinState::PullUp);
        assert_eq!(pin.driver(), Some(PORT));
    }

    #[test]
    fn test_snapshot_keeps_driver_order() {
        let mut pin = Pin::new("PD1");
        pin.set_controls(PORT, PinControls { dir: true, drive: true, ..Default::default() });
        pin.set_controls(USART, PinControls { dir: true, drive: false, ..Default::default() });
        let snap = pin.snapshot();

        let mut other = Pin::new("PD1");
        other.restore(&snap);
        assert_eq!(other.state(), PinState::Low);
        other.release_all();
        assert_eq!(other.state(), PinState::Floating);
    }
}
