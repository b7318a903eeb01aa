//! Interrupt controller and the [`InterruptFlag`] helper.
//!
//! Vector states:
//!
//! - `Unused`: no peripheral registered the vector, raises are ignored
//! - `Idle`: registered, not pending
//! - `Raised`: pending, waiting for the CPU
//!
//! Priority is fixed by index: the lowest raised vector is serviced first.
//! Vector 0 (reset) is always `Idle` and cannot be registered.
//!
//! Vectors being serviced are tracked on a stack, pushed on acknowledge and
//! popped on RETI.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::peripheral::Ctx;
use crate::signal::Signal;
use crate::types::{RegBit, VectorIndex};

/// Signal ids of the interrupt controller. The signal index is the vector.
pub mod sig {
    pub const RAISED: u16 = 0;
    pub const CANCELLED: u16 = 1;
    pub const ACKNOWLEDGED: u16 = 2;
    pub const RETURNED: u16 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorState {
    #[default]
    Unused,
    Idle,
    Raised,
}

#[derive(Debug, Clone, Copy, Default)]
struct Vector {
    state: VectorState,
    /// Peripheral slot notified on acknowledge.
    owner: Option<usize>,
}

/// Snapshot of the vector table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptState {
    states: Vec<VectorState>,
    service: Vec<VectorIndex>,
}

impl InterruptState {
    pub fn vector_count(&self) -> usize {
        self.states.len()
    }
}

#[derive(Debug)]
pub struct InterruptController {
    vectors: Vec<Vector>,
    service: Vec<VectorIndex>,
    signal: Signal,
}

impl InterruptController {
    pub fn new(count: usize) -> Self {
        let mut vectors = vec![Vector::default(); count.max(1)];
        vectors[0].state = VectorState::Idle;
        InterruptController { vectors, service: Vec::new(), signal: Signal::new() }
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Enable `vector` on behalf of peripheral slot `owner`.
    pub fn register(&mut self, vector: VectorIndex, owner: Option<usize>) -> Result<(), ConfigError> {
        if vector == 0 || vector >= self.vectors.len() {
            return Err(ConfigError::BadVector { vector, count: self.vectors.len() });
        }
        let v = &mut self.vectors[vector];
        if v.state != VectorState::Unused {
            return Err(ConfigError::VectorInUse(vector));
        }
        v.state = VectorState::Idle;
        v.owner = owner;
        Ok(())
    }

    pub fn state(&self, vector: VectorIndex) -> VectorState {
        self.vectors.get(vector).map_or(VectorState::Unused, |v| v.state)
    }

    pub fn owner(&self, vector: VectorIndex) -> Option<usize> {
        self.vectors.get(vector).and_then(|v| v.owner)
    }

    /// Mark `vector` pending. No-op if unused or already raised.
    pub fn raise(&mut self, vector: VectorIndex) -> bool {
        match self.vectors.get_mut(vector) {
            Some(v) if v.state == VectorState::Idle => {
                v.state = VectorState::Raised;
                self.signal.raise(sig::RAISED, vector as i64, 0u64);
                true
            }
            _ => false,
        }
    }

    /// Withdraw a pending request.
    pub fn cancel(&mut self, vector: VectorIndex) -> bool {
        match self.vectors.get_mut(vector) {
            Some(v) if v.state == VectorState::Raised => {
                v.state = VectorState::Idle;
                self.signal.raise(sig::CANCELLED, vector as i64, 0u64);
                true
            }
            _ => false,
        }
    }

    /// Highest priority pending vector.
    pub fn next_vector(&self) -> Option<VectorIndex> {
        self.vectors.iter().position(|v| v.state == VectorState::Raised)
    }

    pub fn has_pending(&self) -> bool {
        self.next_vector().is_some()
    }

    /// CPU entering `vector`. Returns the owner to notify.
    pub fn ack(&mut self, vector: VectorIndex) -> Option<usize> {
        let v = self.vectors.get_mut(vector)?;
        v.state = VectorState::Idle;
        let owner = v.owner;
        self.service.push(vector);
        self.signal.raise(sig::ACKNOWLEDGED, vector as i64, 0u64);
        owner
    }

    /// CPU returning from the current handler.
    pub fn reti(&mut self) -> Option<VectorIndex> {
        let vector = self.service.pop();
        let index = vector.map_or(-1, |v| v as i64);
        self.signal.raise(sig::RETURNED, index, 0u64);
        vector
    }

    /// Vector currently being serviced, innermost first.
    pub fn servicing(&self) -> Option<VectorIndex> {
        self.service.last().copied()
    }

    pub fn reset(&mut self) {
        for v in &mut self.vectors {
            if v.state != VectorState::Unused {
                v.state = VectorState::Idle;
            }
        }
        self.service.clear();
    }

    /// Announce every pending vector again. Called on sleep entry so a
    /// pending request can wake the core.
    pub fn resignal_pending(&self) {
        for (i, v) in self.vectors.iter().enumerate() {
            if v.state == VectorState::Raised {
                self.signal.raise(sig::RAISED, i as i64, 1u64);
            }
        }
    }

    pub fn snapshot(&self) -> InterruptState {
        InterruptState {
            states: self.vectors.iter().map(|v| v.state).collect(),
            service: self.service.clone(),
        }
    }

    pub fn restore(&mut self, state: &InterruptState) -> bool {
        if state.states.len() != self.vectors.len() {
            return false;
        }
        for (v, &s) in self.vectors.iter_mut().zip(state.states.iter()) {
            if v.state != VectorState::Unused {
                v.state = s;
            }
        }
        self.service = state.service.clone();
        true
    }
}

// ─── Flag/enable helper ─────────────────────────────────────────────────────

/// Binds a flag field and an enable field to a vector.
///
/// The interrupt is raised while `flag & enable` is non-zero. With
/// `clear_on_ack` the flag field is cleared when the CPU enters the vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptFlag {
    vector: VectorIndex,
    enable: RegBit,
    flag: RegBit,
    clear_on_ack: bool,
    raised: bool,
}

impl InterruptFlag {
    /// Vector 0 means "no interrupt": flags are kept but nothing is raised.
    pub fn new(vector: VectorIndex, enable: RegBit, flag: RegBit, clear_on_ack: bool) -> Self {
        InterruptFlag { vector, enable, flag, clear_on_ack, raised: false }
    }

    pub fn vector(&self) -> VectorIndex {
        self.vector
    }

    pub fn raised(&self) -> bool {
        self.raised
    }

    /// Register the vector with the controller.
    pub fn init(&self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        if self.vector > 0 {
            ctx.register_interrupt(self.vector)?;
        }
        Ok(())
    }

    fn active(&self, ctx: &Ctx) -> bool {
        let en = ctx.read_regbit(self.enable);
        let fl = ctx.read_regbit(self.flag);
        en & fl != 0
    }

    fn sync(&mut self, ctx: &mut Ctx) -> i8 {
        let active = self.active(ctx);
        match (self.raised, active) {
            (false, true) => {
                self.raised = true;
                if self.vector > 0 {
                    ctx.raise_interrupt(self.vector);
                }
                1
            }
            (true, false) => {
                self.raised = false;
                if self.vector > 0 {
                    ctx.cancel_interrupt(self.vector);
                }
                -1
            }
            _ => 0,
        }
    }

    /// Re-evaluate after the enable or flag register changed.
    /// Returns 1 if raised, -1 if cancelled, 0 if unchanged.
    pub fn update_from_ioreg(&mut self, ctx: &mut Ctx) -> i8 {
        self.sync(ctx)
    }

    /// Set the flag bits in `mask` (aligned on the field). Returns true if
    /// this raised the interrupt.
    pub fn set_flag(&mut self, mask: u8, ctx: &mut Ctx) -> bool {
        let fl = ctx.read_regbit(self.flag);
        ctx.write_regbit(self.flag, fl | mask);
        self.sync(ctx) > 0
    }

    /// Clear the flag bits in `mask`. Returns true if this cancelled the interrupt.
    pub fn clear_flag(&mut self, mask: u8, ctx: &mut Ctx) -> bool {
        let fl = ctx.read_regbit(self.flag);
        ctx.write_regbit(self.flag, fl & !mask);
        self.sync(ctx) < 0
    }

    pub fn flag_set(&self, ctx: &Ctx) -> bool {
        ctx.read_regbit(self.flag) != 0
    }

    pub fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        if vector == self.vector && self.clear_on_ack {
            ctx.write_regbit(self.flag, 0);
            self.raised = false;
            ctx.cancel_interrupt(self.vector);
        }
    }

    /// Forget the raised state, for device reset.
    pub fn reset(&mut self) {
        self.raised = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalRecorder;

    fn controller() -> InterruptController {
        let mut ic = InterruptController::new(8);
        for v in 1..8 {
            ic.register(v, None).unwrap();
        }
        ic
    }

    #[test]
    fn test_priority_by_index() {
        let mut ic = controller();
        ic.raise(5);
        ic.raise(2);
        assert_eq!(ic.next_vector(), Some(2));
        ic.ack(2);
        assert_eq!(ic.next_vector(), Some(5));
        ic.ack(5);
        assert_eq!(ic.next_vector(), None);
        assert_eq!(ic.servicing(), Some(5));
        assert_eq!(ic.reti(), Some(5));
        assert_eq!(ic.reti(), Some(2));
    }

    #[test]
    fn test_unused_vector_ignored() {
        let mut ic = InterruptController::new(4);
        assert!(!ic.raise(3));
        assert_eq!(ic.next_vector(), None);
    }

    #[test]
    fn test_registration_errors() {
        let mut ic = InterruptController::new(4);
        assert!(matches!(ic.register(0, None), Err(ConfigError::BadVector { .. })));
        assert!(matches!(ic.register(4, None), Err(ConfigError::BadVector { .. })));
        ic.register(1, Some(3)).unwrap();
        assert!(matches!(ic.register(1, None), Err(ConfigError::VectorInUse(1))));
        assert_eq!(ic.owner(1), Some(3));
    }

    #[test]
    fn test_signals() {
        let mut ic = controller();
        let rec = SignalRecorder::new();
        ic.signal().connect(rec.clone(), 0);
        ic.raise(3);
        ic.raise(3);
        ic.cancel(3);
        ic.raise(4);
        ic.resignal_pending();
        ic.ack(4);
        ic.reti();
        assert_eq!(rec.count(sig::RAISED), 3);
        assert_eq!(rec.count(sig::CANCELLED), 1);
        assert_eq!(rec.count(sig::ACKNOWLEDGED), 1);
        assert_eq!(rec.count(sig::RETURNED), 1);
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut ic = controller();
        ic.raise(1);
        ic.reset();
        assert_eq!(ic.state(1), VectorState::Idle);
        assert_eq!(ic.state(0), VectorState::Idle);
    }
}
