//! Peripheral framework.
//!
//! Every on-chip peripheral implements [`Peripheral`]. The device owns the
//! peripherals as boxed trait objects, in attach order, and calls them with a
//! [`Ctx`]: a borrow of the device parts a peripheral may touch (I/O
//! registers, timers, interrupts, pins, NVM) plus access to the other
//! peripherals for control requests.
//!
//! Peripherals never mutate the device state directly. They queue a
//! [`CoreRequest`] which the device applies right after the callback returns.
//!
//! Signal notifications destined to a peripheral go through a relay: the hook
//! returned by [`Ctx::hook`] queues the notification, and the device delivers
//! it to [`Peripheral::raised`] once the current callback is done.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cycle::TimerId;
use crate::device::{Bus, CrashReason, DeviceOptions, DeviceState, ResetFlags, TimerOwner};
use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptController;
use crate::ioreg::IoRegWrite;
use crate::memory::{Area, NonVolatileMemory};
use crate::pin::{Pin, PinControls};
use crate::signal::{HookTag, Signal, SignalData, SignalHook};
use crate::sleep::SleepMode;
use crate::types::{id_to_str, CtlId, CycleCount, PinId, RegAddr, RegBit, VarData, VectorIndex, ID_INTR};

/// Control request codes shared by all peripherals.
pub mod req {
    /// Answer with the peripheral's signal in `data` (`VarData::Signal`).
    pub const GET_SIGNAL: u16 = 0;

    // Codes below are local to their target peripheral.

    /// SLEEP instruction (sleep controller).
    pub const SLEEP_CALL: u16 = 1;
    /// Self loop detected by the CPU (sleep controller).
    pub const SLEEP_PSEUDO: u16 = 2;
    /// WDR instruction (watchdog).
    pub const WATCHDOG_RESET: u16 = 1;
    /// SPM instruction: index = Z, data = R1:R0 (NVM controller).
    pub const NVM_WRITE: u16 = 1;
    /// Queue a byte for the next SPI transfer to shift in (SPI).
    pub const SPI_PUSH_MISO: u16 = 1;
    /// Queue frames for the receiver (USART). `data` is one frame or a
    /// byte string.
    pub const USART_PUSH_RX: u16 = 1;
}

/// Payload of a control request, updated in place by the handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CtlReqData {
    pub index: i64,
    pub data: VarData,
}

impl CtlReqData {
    pub fn new(index: i64, data: impl Into<VarData>) -> Self {
        CtlReqData { index, data: data.into() }
    }
}

/// Requests from a peripheral to the device, applied after the callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreRequest {
    /// Stop in the Break state (debug probe attached only).
    Break,
    /// Enter a sleep mode.
    Sleep(SleepMode),
    Wakeup,
    /// A pin is shorted.
    Shorting(PinId),
    Crash(CrashReason, String),
    Reset(ResetFlags),
    /// Stall the CPU (`true`) or release it.
    Halt(bool),
    /// Program flash bytes from a byte address. Breakpoints over the
    /// written words are kept.
    ProgramFlash { addr: u32, data: Vec<u8> },
}

/// Register value tables indexed by a register field value, as found in
/// peripheral configurations (prescaler selections, sleep modes...).
pub trait RegConfig {
    fn reg_value(&self) -> u8;
}

/// Index of the entry matching `value`.
pub fn find_reg_config<T: RegConfig>(configs: &[T], value: u8) -> Option<usize> {
    configs.iter().position(|c| c.reg_value() == value)
}

/// On-chip peripheral.
///
/// All callbacks have empty defaults except [`id`](Self::id).
pub trait Peripheral: Send {
    fn id(&self) -> CtlId;

    fn name(&self) -> String {
        id_to_str(self.id())
    }

    /// Allocate registers, interrupt vectors, timers and hooks.
    fn init(&mut self, _ctx: &mut Ctx) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Device reset. I/O registers are already cleared.
    fn reset(&mut self, _ctx: &mut Ctx) {}

    /// CPU read of an owned register. `value` is the stored value; the
    /// returned value is stored and handed to the CPU.
    fn ioreg_read(&mut self, _addr: RegAddr, value: u8, _ctx: &mut Ctx) -> u8 {
        value
    }

    /// CPU write of an owned register, after storage.
    fn ioreg_write(&mut self, _addr: RegAddr, _write: IoRegWrite, _ctx: &mut Ctx) {}

    /// Called once per device step, in attach order.
    fn update(&mut self, _ctx: &mut Ctx) {}

    /// Side channel request. Returns true if handled.
    fn ctlreq(&mut self, _req: u16, _data: &mut CtlReqData, _ctx: &mut Ctx) -> bool {
        false
    }

    /// Entering (`on`) or leaving a sleep mode.
    fn sleep(&mut self, _on: bool, _mode: SleepMode, _ctx: &mut Ctx) {}

    /// A timer allocated by this peripheral fired. Returning `Some(delay)`
    /// reschedules it relative to `when`.
    fn timer_fired(&mut self, _timer: TimerId, _when: CycleCount, _ctx: &mut Ctx) -> Option<CycleCount> {
        None
    }

    /// A signal connected through [`Ctx::hook`] was raised.
    fn raised(&mut self, _data: &SignalData, _tag: HookTag, _ctx: &mut Ctx) {}

    /// The CPU entered one of this peripheral's vectors.
    fn interrupt_ack(&mut self, _vector: VectorIndex, _ctx: &mut Ctx) {}

    /// Private state for device snapshots. Register values are saved by
    /// the device and need not be included.
    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(Vec::new())
    }

    fn load_state(&mut self, _data: &[u8]) -> Result<(), StateError> {
        Ok(())
    }
}

// ─── Relay ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct Relayed {
    pub(crate) target: usize,
    pub(crate) data: SignalData,
    pub(crate) tag: HookTag,
}

type RelayQueue = Arc<Mutex<VecDeque<Relayed>>>;

fn lock_queue(queue: &RelayQueue) -> MutexGuard<'_, VecDeque<Relayed>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

struct RelayHook {
    target: usize,
    queue: RelayQueue,
}

impl SignalHook for RelayHook {
    fn raised(&self, data: &SignalData, tag: HookTag) {
        lock_queue(&self.queue).push_back(Relayed { target: self.target, data: data.clone(), tag });
    }
}

/// Queue of signal notifications waiting for delivery to peripherals.
#[derive(Default)]
pub(crate) struct Relay {
    queue: RelayQueue,
    hooks: Vec<Option<Arc<dyn SignalHook>>>,
}

impl Relay {
    /// Hook delivering to peripheral `target`. The same hook is returned on
    /// every call, so it can be disconnected later.
    pub(crate) fn hook(&mut self, target: usize) -> Arc<dyn SignalHook> {
        if self.hooks.len() <= target {
            self.hooks.resize(target + 1, None);
        }
        let queue = &self.queue;
        self.hooks[target]
            .get_or_insert_with(|| {
                let hook: Arc<dyn SignalHook> = Arc::new(RelayHook { target, queue: queue.clone() });
                hook
            })
            .clone()
    }

    pub(crate) fn pop(&self) -> Option<Relayed> {
        lock_queue(&self.queue).pop_front()
    }

    pub(crate) fn clear(&self) {
        lock_queue(&self.queue).clear();
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Device access handed to peripheral callbacks.
pub struct Ctx<'a> {
    index: usize,
    owner: CtlId,
    bus: &'a mut Bus,
    before: &'a mut [Box<dyn Peripheral>],
    after: &'a mut [Box<dyn Peripheral>],
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        index: usize,
        owner: CtlId,
        bus: &'a mut Bus,
        before: &'a mut [Box<dyn Peripheral>],
        after: &'a mut [Box<dyn Peripheral>],
    ) -> Self {
        Ctx { index, owner, bus, before, after }
    }

    /// Attach index of the peripheral being called.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the peripheral being called.
    pub fn owner(&self) -> CtlId {
        self.owner
    }

    #[inline(always)]
    pub fn cycle(&self) -> CycleCount {
        self.bus.cycles.cycle()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.bus.span
    }

    pub fn state(&self) -> DeviceState {
        self.bus.state
    }

    pub fn sleep_mode(&self) -> SleepMode {
        self.bus.sleep_mode
    }

    pub fn options(&self) -> DeviceOptions {
        self.bus.options
    }

    /// MCU clock frequency in Hz, 0 before firmware load.
    pub fn frequency(&self) -> u64 {
        self.bus.frequency
    }

    pub fn vcc(&self) -> f64 {
        self.bus.vcc
    }

    pub fn aref(&self) -> f64 {
        self.bus.aref
    }

    /// Causes of the reset being processed.
    pub fn reset_flags(&self) -> ResetFlags {
        self.bus.reset_flags
    }

    // --- I/O registers ---

    /// Take ownership of the bits of `rb`. Invalid regbits are skipped.
    pub fn add_ioreg(&mut self, rb: RegBit, readonly: bool) -> Result<(), ConfigError> {
        let Some(addr) = rb.addr.filter(|_| rb.valid()) else {
            return Ok(());
        };
        let mask = rb.shifted();
        self.add_ioreg_mask(addr, mask, if readonly { mask } else { 0 })
    }

    pub fn add_ioreg_mask(&mut self, addr: RegAddr, mask: u8, ro_mask: u8) -> Result<(), ConfigError> {
        tracing::trace!(parent: &self.bus.span, "register handler for I/O {:#04x}", addr);
        self.bus.ioregs.add(addr, self.index, mask, ro_mask)
    }

    /// Stored value of any register, without side effects.
    #[inline(always)]
    pub fn read_ioreg(&self, addr: RegAddr) -> u8 {
        self.bus.ioregs.value(addr)
    }

    #[inline(always)]
    pub fn write_ioreg(&mut self, addr: RegAddr, value: u8) {
        self.bus.ioregs.set_value(addr, value);
    }

    /// Field value of `rb`, 0 for an invalid regbit.
    #[inline(always)]
    pub fn read_regbit(&self, rb: RegBit) -> u8 {
        rb.addr.map_or(0, |a| rb.extract(self.read_ioreg(a)))
    }

    #[inline(always)]
    pub fn write_regbit(&mut self, rb: RegBit, field: u8) {
        if let Some(a) = rb.addr {
            let v = rb.replace(self.read_ioreg(a), field);
            self.write_ioreg(a, v);
        }
    }

    #[inline(always)]
    pub fn test_regbit(&self, rb: RegBit) -> bool {
        self.read_regbit(rb) != 0
    }

    pub fn set_regbit(&mut self, rb: RegBit) {
        if let Some(a) = rb.addr {
            let v = rb.set_to(self.read_ioreg(a));
            self.write_ioreg(a, v);
        }
    }

    pub fn clear_regbit(&mut self, rb: RegBit) {
        if let Some(a) = rb.addr {
            let v = rb.clear_from(self.read_ioreg(a));
            self.write_ioreg(a, v);
        }
    }

    // --- Timers ---

    /// Allocate a timer whose firings go to this peripheral.
    pub fn new_timer(&mut self) -> TimerId {
        let id = self.bus.cycles.allocate();
        self.bus.timer_owners.push(TimerOwner::Peripheral(self.index));
        id
    }

    pub fn schedule(&mut self, timer: TimerId, delay: CycleCount) {
        self.bus.cycles.schedule(timer, delay);
    }

    pub fn schedule_at(&mut self, timer: TimerId, when: CycleCount) {
        self.bus.cycles.schedule_at(timer, when);
    }

    pub fn cancel(&mut self, timer: TimerId) {
        self.bus.cycles.cancel(timer);
    }

    pub fn pause(&mut self, timer: TimerId) {
        self.bus.cycles.pause(timer);
    }

    pub fn resume(&mut self, timer: TimerId) {
        self.bus.cycles.resume(timer);
    }

    pub fn timer_when(&self, timer: TimerId) -> Option<CycleCount> {
        self.bus.cycles.when(timer)
    }

    pub fn is_scheduled(&self, timer: TimerId) -> bool {
        self.bus.cycles.is_scheduled(timer)
    }

    // --- Interrupts ---

    /// Register `vector`; acknowledges are delivered to this peripheral.
    pub fn register_interrupt(&mut self, vector: VectorIndex) -> Result<(), ConfigError> {
        self.bus.interrupts.register(vector, Some(self.index))
    }

    pub fn raise_interrupt(&mut self, vector: VectorIndex) -> bool {
        self.bus.interrupts.raise(vector)
    }

    pub fn cancel_interrupt(&mut self, vector: VectorIndex) -> bool {
        self.bus.interrupts.cancel(vector)
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.bus.interrupts
    }

    // --- Pins ---

    pub fn find_pin(&self, name: &str) -> Option<PinId> {
        self.bus.pins.iter().find(|p| p.name() == name).map(|p| p.id())
    }

    pub fn pin(&self, id: PinId) -> Option<&Pin> {
        self.bus.pins.iter().find(|p| p.id() == id)
    }

    /// Drive pin `id` from this peripheral's slot. The first call attaches
    /// the slot on top of the pin's other drivers.
    pub fn set_pin_controls(&mut self, id: PinId, controls: PinControls) {
        let owner = self.owner;
        if let Some(pin) = self.bus.pins.iter_mut().find(|p| p.id() == id) {
            pin.set_controls(owner, controls);
        }
    }

    /// Detach this peripheral's slot from pin `id`, giving the pin back to
    /// the drivers below it.
    pub fn release_pin(&mut self, id: PinId) {
        let owner = self.owner;
        if let Some(pin) = self.bus.pins.iter_mut().find(|p| p.id() == id) {
            pin.release(owner);
        }
    }

    // --- NVM ---

    pub fn nvm(&self, area: Area) -> Option<&NonVolatileMemory> {
        self.bus.nvm.get(area)
    }

    pub fn nvm_mut(&mut self, area: Area) -> Option<&mut NonVolatileMemory> {
        self.bus.nvm.get_mut(area)
    }

    // --- Core and other peripherals ---

    pub fn request(&mut self, request: CoreRequest) {
        self.bus.requests.push_back(request);
    }

    /// Relay hook delivering signal notifications to [`Peripheral::raised`].
    pub fn hook(&mut self) -> Arc<dyn SignalHook> {
        self.bus.relay.hook(self.index)
    }

    /// Send a control request to another peripheral.
    pub fn ctlreq(&mut self, id: CtlId, req: u16, data: &mut CtlReqData) -> bool {
        if id == ID_INTR && req == req::GET_SIGNAL {
            data.data = VarData::Signal(self.bus.interrupts.signal().clone());
            return true;
        }
        let split = self.before.len();
        let target = self
            .before
            .iter_mut()
            .enumerate()
            .chain(self.after.iter_mut().enumerate().map(|(i, p)| (split + 1 + i, p)))
            .find(|(_, p)| p.id() == id);
        match target {
            Some((index, per)) => {
                let mut ctx = Ctx { index, owner: id, bus: &mut *self.bus, before: &mut [], after: &mut [] };
                per.ctlreq(req, data, &mut ctx)
            }
            None => {
                tracing::warn!(parent: &self.bus.span, "request {} to missing peripheral {}", req, id_to_str(id));
                false
            }
        }
    }

    /// Signal of another peripheral, obtained with `GET_SIGNAL`.
    pub fn signal_of(&mut self, id: CtlId, index: i64) -> Option<Signal> {
        let mut data = CtlReqData::new(index, VarData::None);
        if self.ctlreq(id, req::GET_SIGNAL, &mut data) {
            data.data.as_signal().cloned()
        } else {
            None
        }
    }
}
