//! The simulated device.
//!
//! A [`Device`] ties together the CPU core, the I/O register file, the cycle
//! manager, the interrupt controller, the pins, the non-volatile memories and
//! the attached peripherals. It is built from a [`DeviceConfig`] and a list
//! of peripherals, loaded with a [`Firmware`], then advanced one instruction
//! at a time with [`Device::step`].
//!
//! ## Step
//!
//! 1. CPU step: enter a pending interrupt or execute one instruction (one
//!    idle cycle when sleeping or halted).
//! 2. `update` on every peripheral, in attach order.
//! 3. Advance the clock and fire due timers.
//!
//! Requests queued by peripherals (sleep, reset, crash...) and relayed
//! signal notifications are applied after every callback, so a step always
//! ends in a consistent state. A pending reset is performed inside the step.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::cpu::{sreg, Core};
use crate::cycle::{CycleManager, TimerId};
use crate::debug::DebugState;
use crate::error::{ConfigError, FirmwareError};
use crate::firmware::Firmware;
use crate::interrupt::InterruptController;
use crate::ioreg::IoRegisters;
use crate::memory::{Area, DataLayout, NonVolatileMemory, NvmBank};
use crate::peripheral::{req, CoreRequest, CtlReqData, Ctx, Peripheral, Relay};
use crate::pin::{Pin, PinState};
use crate::signal::{panic_message, Signal};
use crate::sleep::SleepMode;
use crate::types::{id_to_str, str_to_id, CtlId, CycleCount, PinId, RegAddr, VarData, VectorIndex, ID_CORE, ID_INTR};

/// Signal ids of the device signal.
pub mod sig {
    /// State changed; data = new state code.
    pub const STATE_CHANGE: u16 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Being built.
    Limbo,
    /// Built, waiting for firmware.
    Ready,
    Running,
    Sleeping,
    /// CPU stalled by a peripheral, the rest of the device runs.
    Halted,
    /// Reset pending, performed at the next step boundary.
    Reset,
    /// Stopped by a breakpoint or watchpoint.
    Break,
    /// The program ended.
    Done,
    /// Stopped by the simulation (pin shorting...).
    Stopped,
    Crashed,
}

impl DeviceState {
    pub fn code(self) -> u8 {
        match self {
            DeviceState::Limbo => 0,
            DeviceState::Ready => 1,
            DeviceState::Running => 2,
            DeviceState::Sleeping => 3,
            DeviceState::Halted => 4,
            DeviceState::Reset => 5,
            DeviceState::Break => 6,
            DeviceState::Done => 7,
            DeviceState::Stopped => 8,
            DeviceState::Crashed => 9,
        }
    }

    /// States in which stepping advances the clock.
    #[inline(always)]
    pub fn is_active(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::Sleeping | DeviceState::Halted)
    }
}

bitflags! {
    /// Behaviour switches, all off by default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DeviceOptions: u32 {
        /// Reset the device on a pin short instead of stopping it.
        const RESET_ON_PIN_SHORTING = 0x01;
        /// Unmapped I/O accesses read 0 and ignore writes.
        const IGNORE_BAD_CPU_IO     = 0x02;
        /// LPM from unprogrammed flash reads 0xFF.
        const IGNORE_BAD_CPU_LPM    = 0x04;
        /// Spin on `RJMP .-2` instead of idling in pseudo sleep.
        const DISABLE_PSEUDO_SLEEP  = 0x08;
        /// End the run on a sleep or self loop with interrupts disabled.
        const INFINITE_LOOP_DETECT  = 0x10;
    }
}

bitflags! {
    /// Causes of a reset, as seen by peripherals during `reset`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ResetFlags: u8 {
        const POWER_ON = 0x01;
        const EXTERNAL = 0x02;
        const BROWNOUT = 0x04;
        const WATCHDOG = 0x08;
        const SOFTWARE = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrashReason {
    PcOverflow,
    SpOverflow,
    BadCpuIo,
    BadCtlIo,
    InvalidOpcode,
    InvalidConfig,
    FlashAddrOverflow,
}

impl CrashReason {
    /// Stable numeric code, for reports.
    pub fn code(self) -> u16 {
        match self {
            CrashReason::PcOverflow => 1,
            CrashReason::SpOverflow => 2,
            CrashReason::BadCpuIo => 3,
            CrashReason::BadCtlIo => 4,
            CrashReason::InvalidOpcode => 5,
            CrashReason::InvalidConfig => 6,
            CrashReason::FlashAddrOverflow => 7,
        }
    }
}

/// Post-mortem of a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashInfo {
    pub reason: CrashReason,
    /// Word address of the faulting instruction.
    pub pc: u32,
    pub cycle: CycleCount,
    pub message: String,
}

type TimerFn = Box<dyn FnMut(CycleCount) -> Option<CycleCount> + Send>;

/// Who handles a timer firing.
pub(crate) enum TimerOwner {
    Peripheral(usize),
    External(TimerFn),
}

/// Device parts shared with peripheral callbacks through [`Ctx`].
pub(crate) struct Bus {
    pub(crate) cycles: CycleManager,
    pub(crate) span: tracing::Span,
    pub(crate) state: DeviceState,
    pub(crate) sleep_mode: SleepMode,
    pub(crate) options: DeviceOptions,
    pub(crate) frequency: u64,
    pub(crate) vcc: f64,
    pub(crate) aref: f64,
    pub(crate) reset_flags: ResetFlags,
    pub(crate) ioregs: IoRegisters,
    /// Indexed by timer id.
    pub(crate) timer_owners: Vec<TimerOwner>,
    pub(crate) interrupts: InterruptController,
    pub(crate) pins: Vec<Pin>,
    pub(crate) nvm: NvmBank,
    pub(crate) requests: VecDeque<CoreRequest>,
    pub(crate) relay: Relay,
}

/// Line buffered output of the firmware console register.
#[derive(Debug, Default)]
pub(crate) struct Console {
    pub(crate) register: Option<RegAddr>,
    line: Vec<u8>,
    lines: Vec<String>,
}

pub struct Device {
    pub(crate) config: DeviceConfig,
    pub(crate) layout: DataLayout,
    pub(crate) core: Core,
    pub(crate) bus: Bus,
    pub(crate) peripherals: Vec<Box<dyn Peripheral>>,
    pub(crate) debug: DebugState,
    pub(crate) console: Console,
    pub(crate) signal: Signal,
    pub(crate) crash_info: Option<CrashInfo>,
    /// Control requests already reported as unrouted.
    unrouted: HashSet<(CtlId, u16)>,
}

impl Device {
    /// Build a device and initialise its peripherals. The device is left in
    /// the `Ready` state, waiting for [`load_firmware`](Self::load_firmware).
    pub fn new(config: DeviceConfig, peripherals: Vec<Box<dyn Peripheral>>) -> Result<Self, ConfigError> {
        config.core.validate()?;
        let span = tracing::info_span!("device", name = %config.name);
        let core_cfg = &config.core;

        let mut nvm = NvmBank::new();
        nvm.add(Area::Flash, core_cfg.flash_size());
        nvm.add(Area::Eeprom, core_cfg.eeprom_size());
        nvm.add(Area::Fuses, core_cfg.fusesize);
        nvm.add(Area::UserRow, core_cfg.userrowsize);
        nvm.add(Area::Lockbit, 1);
        if let Some(fuses) = nvm.get_mut(Area::Fuses) {
            fuses.program(&core_cfg.fuses, 0);
        }

        let mut ioregs = IoRegisters::new(core_cfg.io_size());
        let regs = core_cfg.registers;
        for addr in [Some(regs.sreg), Some(regs.spl), Some(regs.sph), regs.rampz, regs.eind].into_iter().flatten() {
            ioregs.add_core(addr)?;
        }

        let mut pins: Vec<Pin> = Vec::with_capacity(config.pins.len());
        for name in &config.pins {
            if pins.iter().any(|p| p.name() == name || p.id() == str_to_id(name)) {
                return Err(ConfigError::DuplicatePin(name.clone()));
            }
            pins.push(Pin::new(name));
        }

        let mut ids: Vec<CtlId> = Vec::with_capacity(peripherals.len());
        for p in &peripherals {
            let id = p.id();
            if ids.contains(&id) {
                return Err(ConfigError::DuplicatePeripheral(id_to_str(id)));
            }
            ids.push(id);
        }

        let bus = Bus {
            cycles: CycleManager::new(),
            span,
            state: DeviceState::Limbo,
            sleep_mode: SleepMode::Active,
            options: DeviceOptions::empty(),
            frequency: 0,
            vcc: 0.0,
            aref: 0.0,
            reset_flags: ResetFlags::POWER_ON,
            ioregs,
            timer_owners: Vec::new(),
            interrupts: InterruptController::new(core_cfg.vector_count),
            pins,
            nvm,
            requests: VecDeque::new(),
            relay: Relay::default(),
        };

        let mut dev = Device {
            layout: core_cfg.layout(),
            core: Core::new(core_cfg.sram_size()),
            config,
            bus,
            peripherals,
            debug: DebugState::default(),
            console: Console::default(),
            signal: Signal::new(),
            crash_info: None,
            unrouted: HashSet::new(),
        };

        for i in 0..dev.peripherals.len() {
            match dev.with_peripheral(i, |p, ctx| p.init(ctx)) {
                Some(res) => res?,
                None => {
                    return Err(ConfigError::Peripheral {
                        id: dev.peripherals[i].name(),
                        reason: "panicked during init".to_string(),
                    })
                }
            }
        }
        dev.flush_events();
        tracing::debug!(parent: &dev.bus.span, "{} peripherals attached", dev.peripherals.len());
        dev.set_state(DeviceState::Ready);
        dev.reset_now();
        Ok(dev)
    }

    /// Program the NVMs from `fw`, apply its run parameters and start the
    /// device.
    pub fn load_firmware(&mut self, fw: &Firmware) -> Result<(), FirmwareError> {
        if self.bus.state != DeviceState::Ready {
            return Err(FirmwareError::NotReady(format!("{:?}", self.bus.state)));
        }
        if fw.frequency == 0 {
            return Err(FirmwareError::NoFrequency);
        }
        if !fw.has(Area::Flash) {
            return Err(FirmwareError::NoFlash);
        }

        for area in fw.areas() {
            let Some(mem) = self.bus.nvm.get_mut(area) else {
                return Err(FirmwareError::MissingArea { area: area.to_string() });
            };
            for block in fw.blocks(area) {
                let end = block.base as usize + block.buf.len();
                if end > mem.size() {
                    return Err(FirmwareError::Overflow {
                        area: area.to_string(),
                        base: block.base,
                        len: block.buf.len(),
                        size: mem.size(),
                    });
                }
                mem.program(&block.buf, block.base as usize);
            }
            tracing::debug!(parent: &self.bus.span, "programmed {} bytes of {}", fw.size(area), area);
        }

        self.bus.frequency = fw.frequency;
        self.bus.vcc = fw.vcc;
        self.bus.aref = fw.aref;

        self.console.register = None;
        if let Some(addr) = fw.console_register {
            if addr >= self.layout.iostart && addr <= self.layout.ioend {
                self.console.register = Some(addr - self.layout.iostart);
            } else {
                tracing::warn!(parent: &self.bus.span, "console register {:#06x} outside of I/O space", addr);
            }
        }

        tracing::info!(parent: &self.bus.span, "firmware loaded, {} Hz", fw.frequency);
        self.set_state(DeviceState::Running);
        Ok(())
    }

    // --- Accessors ---

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline(always)]
    pub fn state(&self) -> DeviceState {
        self.bus.state
    }

    #[inline(always)]
    pub fn cycle(&self) -> CycleCount {
        self.bus.cycles.cycle()
    }

    /// Device signal, raised on every state change.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn options(&self) -> DeviceOptions {
        self.bus.options
    }

    pub fn set_options(&mut self, options: DeviceOptions) {
        self.bus.options = options;
    }

    /// Clock frequency in Hz, 0 before firmware load.
    pub fn frequency(&self) -> u64 {
        self.bus.frequency
    }

    pub fn sleep_mode(&self) -> SleepMode {
        self.bus.sleep_mode
    }

    pub fn crash_info(&self) -> Option<&CrashInfo> {
        self.crash_info.as_ref()
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.bus.interrupts
    }

    pub fn nvm(&self, area: Area) -> Option<&NonVolatileMemory> {
        self.bus.nvm.get(area)
    }

    pub fn span(&self) -> &tracing::Span {
        &self.bus.span
    }

    // --- Execution ---

    /// Advance the device by one instruction. Returns the resulting state.
    pub fn step(&mut self) -> DeviceState {
        if self.bus.state == DeviceState::Reset {
            self.reset_now();
        }
        if !self.bus.state.is_active() {
            return self.bus.state;
        }

        let cycles = if self.bus.state == DeviceState::Running { self.cpu_step() } else { 1 };
        self.flush_events();

        if self.bus.state.is_active() {
            for i in 0..self.peripherals.len() {
                self.with_peripheral(i, |p, ctx| p.update(ctx));
            }
            self.flush_events();
        }

        self.bus.cycles.increment_cycle(cycles);
        self.process_timers();

        if self.bus.state == DeviceState::Reset {
            self.reset_now();
        }
        self.bus.state
    }

    /// Skip `n` cycles without executing anything. Used by the simulation
    /// loop to jump over idle sleep.
    pub(crate) fn increment_cycle(&mut self, n: CycleCount) {
        self.bus.cycles.increment_cycle(n);
    }

    fn process_timers(&mut self) {
        let now = self.bus.cycles.cycle();
        let limit = self.bus.cycles.begin(now);
        while let Some((id, when)) = self.bus.cycles.pop_due(limit) {
            let next = match self.bus.timer_owners.get_mut(id.index()) {
                Some(TimerOwner::External(f)) => f(when),
                Some(TimerOwner::Peripheral(index)) => {
                    let index = *index;
                    let next = self.with_peripheral(index, |p, ctx| p.timer_fired(id, when, ctx)).flatten();
                    self.flush_events();
                    next
                }
                None => None,
            };
            self.bus.cycles.complete(id, when, next);
        }
    }

    /// Request a reset; performed immediately.
    pub fn reset(&mut self, flags: ResetFlags) {
        self.bus.reset_flags |= flags;
        self.reset_now();
    }

    pub(crate) fn reset_now(&mut self) {
        tracing::info!(parent: &self.bus.span, flags = ?self.bus.reset_flags, "reset");
        self.bus.cycles.cancel_all();
        self.bus.ioregs.reset();
        self.bus.interrupts.reset();
        self.bus.relay.clear();
        self.bus.requests.clear();
        self.core.reset(self.config.core.ramend);
        for pin in &mut self.bus.pins {
            pin.release_all();
        }
        for i in 0..self.peripherals.len() {
            self.with_peripheral(i, |p, ctx| p.reset(ctx));
        }
        self.flush_events();
        self.debug.resume_from_break = false;
        self.console.line.clear();
        if !matches!(self.bus.state, DeviceState::Limbo | DeviceState::Ready) {
            self.set_state(DeviceState::Running);
        }
        self.bus.reset_flags = ResetFlags::empty();
        self.bus.sleep_mode = SleepMode::Active;
    }

    pub(crate) fn set_state(&mut self, state: DeviceState) {
        let old = self.bus.state;
        if old == state {
            return;
        }
        self.bus.state = state;
        tracing::debug!(parent: &self.bus.span, "state {:?} -> {:?}", old, state);
        self.signal.raise(sig::STATE_CHANGE, 0, state.code());
    }

    pub(crate) fn crash(&mut self, reason: CrashReason, message: String) {
        let cycle = self.bus.cycles.cycle();
        tracing::error!(
            parent: &self.bus.span,
            code = reason.code(),
            pc = self.core.pc * 2,
            cycle,
            "device crashed: {}",
            message
        );
        self.crash_info = Some(CrashInfo { reason, pc: self.core.pc, cycle, message });
        self.set_state(DeviceState::Crashed);
    }

    // --- Peripherals ---

    /// Call `f` on peripheral `index` with a context borrowing the rest of
    /// the device.
    ///
    /// A panic inside the peripheral is caught and logged, and `None` is
    /// returned as for a missing peripheral. The device keeps running.
    pub(crate) fn with_peripheral<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn Peripheral, &mut Ctx) -> R,
    ) -> Option<R> {
        if index >= self.peripherals.len() {
            return None;
        }
        let (before, rest) = self.peripherals.split_at_mut(index);
        let (per, after) = rest.split_first_mut()?;
        let name = per.name();
        let mut ctx = Ctx::new(index, per.id(), &mut self.bus, before, after);
        match catch_unwind(AssertUnwindSafe(|| f(per.as_mut(), &mut ctx))) {
            Ok(r) => Some(r),
            Err(payload) => {
                tracing::error!(
                    parent: &self.bus.span,
                    cycle = self.bus.cycles.cycle(),
                    "peripheral {} panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                );
                None
            }
        }
    }

    /// Apply queued core requests and deliver relayed notifications until
    /// both queues are empty.
    pub(crate) fn flush_events(&mut self) {
        loop {
            if let Some(r) = self.bus.relay.pop() {
                self.with_peripheral(r.target, |p, ctx| p.raised(&r.data, r.tag, ctx));
            } else if let Some(request) = self.bus.requests.pop_front() {
                self.apply_request(request);
            } else {
                break;
            }
        }
    }

    fn apply_request(&mut self, request: CoreRequest) {
        match request {
            CoreRequest::Break => {
                if self.debug.attached {
                    self.set_state(DeviceState::Break);
                } else {
                    tracing::debug!(parent: &self.bus.span, "break ignored, no probe attached");
                }
            }
            CoreRequest::Sleep(mode) => {
                if self.bus.options.contains(DeviceOptions::INFINITE_LOOP_DETECT) && !self.core.flag(sreg::I) {
                    tracing::warn!(parent: &self.bus.span, "sleep with interrupts disabled, stopping");
                    self.set_state(DeviceState::Done);
                } else if self.bus.state == DeviceState::Running {
                    tracing::trace!(parent: &self.bus.span, "sleep {:?}", mode);
                    self.bus.sleep_mode = mode;
                    self.set_state(DeviceState::Sleeping);
                    for i in 0..self.peripherals.len() {
                        self.with_peripheral(i, |p, ctx| p.sleep(true, mode, ctx));
                    }
                    self.bus.interrupts.resignal_pending();
                }
            }
            CoreRequest::Wakeup => {
                if self.bus.state == DeviceState::Sleeping {
                    let mode = self.bus.sleep_mode;
                    tracing::trace!(parent: &self.bus.span, "wake up from {:?}", mode);
                    for i in 0..self.peripherals.len() {
                        self.with_peripheral(i, |p, ctx| p.sleep(false, mode, ctx));
                    }
                    self.bus.sleep_mode = SleepMode::Active;
                    self.set_state(DeviceState::Running);
                }
            }
            CoreRequest::Shorting(pin) => {
                tracing::warn!(parent: &self.bus.span, "pin {} shorted", id_to_str(pin));
                if self.bus.options.contains(DeviceOptions::RESET_ON_PIN_SHORTING) {
                    self.bus.reset_flags |= ResetFlags::BROWNOUT;
                    self.set_state(DeviceState::Reset);
                } else {
                    self.set_state(DeviceState::Stopped);
                }
            }
            CoreRequest::Crash(reason, message) => self.crash(reason, message),
            CoreRequest::Reset(flags) => {
                self.bus.reset_flags |= flags;
                self.set_state(DeviceState::Reset);
            }
            CoreRequest::Halt(on) => match (on, self.bus.state) {
                (true, DeviceState::Running) => self.set_state(DeviceState::Halted),
                (false, DeviceState::Halted) => self.set_state(DeviceState::Running),
                _ => {}
            },
            CoreRequest::ProgramFlash { addr, data } => {
                let n = self.program_flash(addr, &data);
                tracing::debug!(parent: &self.bus.span, "programmed {} flash bytes at {:#07x}", n, addr);
            }
        }
    }

    /// Route a control request without applying its side effects. The CPU
    /// uses this mid-instruction; the step flushes afterwards.
    pub(crate) fn route_ctlreq(&mut self, id: CtlId, req: u16, data: &mut CtlReqData) -> bool {
        if req == req::GET_SIGNAL {
            if id == ID_INTR {
                data.data = VarData::Signal(self.bus.interrupts.signal().clone());
                return true;
            }
            if id == ID_CORE {
                data.data = VarData::Signal(self.signal.clone());
                return true;
            }
        }
        match self.peripherals.iter().position(|p| p.id() == id) {
            Some(index) => self.with_peripheral(index, |p, ctx| p.ctlreq(req, data, ctx)).unwrap_or(false),
            None => {
                if self.unrouted.insert((id, req)) {
                    tracing::warn!(parent: &self.bus.span, "request {} to missing peripheral {}", req, id_to_str(id));
                }
                false
            }
        }
    }

    /// Send a control request to peripheral `id`. Returns false if nobody
    /// handled it.
    pub fn ctlreq(&mut self, id: CtlId, req: u16, data: &mut CtlReqData) -> bool {
        let handled = self.route_ctlreq(id, req, data);
        self.flush_events();
        handled
    }

    /// Signal of peripheral `id` (or of the core, or the interrupt
    /// controller).
    pub fn signal_of(&mut self, id: CtlId) -> Option<Signal> {
        let mut data = CtlReqData::new(0, VarData::None);
        if self.ctlreq(id, req::GET_SIGNAL, &mut data) {
            data.data.as_signal().cloned()
        } else {
            None
        }
    }

    // --- I/O registers ---

    /// CPU read of I/O register `addr`.
    pub(crate) fn io_read(&mut self, addr: RegAddr) -> u8 {
        let regs = self.config.core.registers;
        if addr == regs.sreg {
            return self.core.sreg;
        }
        if addr == regs.spl {
            return self.core.sp as u8;
        }
        if addr == regs.sph {
            return (self.core.sp >> 8) as u8;
        }
        if self.console.register == Some(addr) {
            return 0;
        }
        let Some(reg) = self.bus.ioregs.get(addr) else {
            self.bad_data_access(self.layout.iostart + addr, "read");
            return 0;
        };
        let mut value = reg.value();
        if reg.is_core() {
            return value;
        }
        for owner in self.bus.ioregs.owners(addr) {
            if let Some(v) = self.with_peripheral(owner, |p, ctx| p.ioreg_read(addr, value, ctx)) {
                value = v;
            }
        }
        self.bus.ioregs.set_value(addr, value);
        value
    }

    /// CPU write of I/O register `addr`.
    pub(crate) fn io_write(&mut self, addr: RegAddr, value: u8) {
        let regs = self.config.core.registers;
        if addr == regs.sreg {
            self.core.sreg = value;
            return;
        }
        if addr == regs.spl {
            self.core.sp = (self.core.sp & 0xFF00) | value as u16;
            return;
        }
        if addr == regs.sph {
            self.core.sp = (self.core.sp & 0x00FF) | (value as u16) << 8;
            return;
        }
        if self.console.register == Some(addr) {
            self.console_write(value);
            return;
        }
        let Some(write) = self.bus.ioregs.cpu_write(addr, value) else {
            self.bad_data_access(self.layout.iostart + addr, "write");
            return;
        };
        for owner in self.bus.ioregs.owners(addr) {
            self.with_peripheral(owner, |p, ctx| p.ioreg_write(addr, write, ctx));
        }
    }

    /// True if `addr` is a core register, a peripheral register or the
    /// console register.
    pub(crate) fn io_mapped(&self, addr: RegAddr) -> bool {
        self.console.register == Some(addr) || self.io_raw_read(addr).is_some()
    }

    /// Stored value of a register, without side effects. `None` if unmapped.
    pub(crate) fn io_raw_read(&self, addr: RegAddr) -> Option<u8> {
        let regs = self.config.core.registers;
        if addr == regs.sreg {
            Some(self.core.sreg)
        } else if addr == regs.spl {
            Some(self.core.sp as u8)
        } else if addr == regs.sph {
            Some((self.core.sp >> 8) as u8)
        } else {
            self.bus.ioregs.get(addr).map(|r| r.value())
        }
    }

    /// Store a register value, without side effects. False if unmapped.
    pub(crate) fn io_raw_write(&mut self, addr: RegAddr, value: u8) -> bool {
        let regs = self.config.core.registers;
        if addr == regs.sreg {
            self.core.sreg = value;
            true
        } else if addr == regs.spl {
            self.core.sp = (self.core.sp & 0xFF00) | value as u16;
            true
        } else if addr == regs.sph {
            self.core.sp = (self.core.sp & 0x00FF) | (value as u16) << 8;
            true
        } else {
            self.bus.ioregs.set_value(addr, value)
        }
    }

    // --- Console ---

    fn console_write(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                let line = String::from_utf8_lossy(&self.console.line).into_owned();
                self.console.line.clear();
                tracing::info!(parent: &self.bus.span, "[{}] {}", self.bus.cycles.cycle(), line);
                self.console.lines.push(line);
            }
            b'\r' => {}
            b => self.console.line.push(b),
        }
    }

    /// Lines printed on the console register since the last call.
    pub fn take_console_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.console.lines)
    }

    // --- Timers ---

    /// Allocate a timer calling `f` when it fires. `f` receives the due
    /// cycle and may return a delay to fire again.
    pub fn add_timer<F>(&mut self, f: F) -> TimerId
    where
        F: FnMut(CycleCount) -> Option<CycleCount> + Send + 'static,
    {
        let id = self.bus.cycles.allocate();
        self.bus.timer_owners.push(TimerOwner::External(Box::new(f)));
        id
    }

    pub fn schedule_timer(&mut self, timer: TimerId, delay: CycleCount) {
        self.bus.cycles.schedule(timer, delay);
    }

    pub fn cancel_timer(&mut self, timer: TimerId) {
        self.bus.cycles.cancel(timer);
    }

    /// Due cycle of the soonest timer.
    pub fn next_timer_when(&self) -> Option<CycleCount> {
        self.bus.cycles.next_when()
    }

    // --- Interrupts ---

    pub fn raise_interrupt(&mut self, vector: VectorIndex) -> bool {
        let raised = self.bus.interrupts.raise(vector);
        self.flush_events();
        raised
    }

    pub fn cancel_interrupt(&mut self, vector: VectorIndex) -> bool {
        let cancelled = self.bus.interrupts.cancel(vector);
        self.flush_events();
        cancelled
    }

    // --- Pins ---

    pub fn find_pin(&self, name: &str) -> Option<PinId> {
        self.bus.pins.iter().find(|p| p.name() == name).map(|p| p.id())
    }

    pub fn pin(&self, id: PinId) -> Option<&Pin> {
        self.bus.pins.iter().find(|p| p.id() == id)
    }

    /// Drive a pin from outside the device. Returns false for an unknown pin.
    pub fn set_pin_external_state(&mut self, id: PinId, state: PinState) -> bool {
        let Some(pin) = self.bus.pins.iter_mut().find(|p| p.id() == id) else {
            return false;
        };
        pin.set_external_state(state);
        self.flush_events();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::peripherals::testutil::{self, asm, Stub};
    use crate::signal::SignalRecorder;
    use crate::types::ctl_id;

    #[test]
    fn test_new_is_ready_with_power_on_state() {
        let dev = Device::new(DeviceConfig::atmega328(), Vec::new()).unwrap();
        assert_eq!(dev.state(), DeviceState::Ready);
        assert_eq!(dev.core().sp, 0x8FF);
        assert_eq!(dev.cycle(), 0);
        assert_eq!(dev.nvm(Area::Fuses).unwrap().read(1), 0xD9);
        assert_eq!(dev.nvm(Area::Flash).unwrap().size(), 32 * 1024);
        assert!(dev.nvm(Area::UserRow).is_none());
    }

    #[test]
    fn test_duplicate_pin() {
        let mut cfg = DeviceConfig::atmega328();
        cfg.pins.push("PB3".to_string());
        assert!(matches!(Device::new(cfg, Vec::new()), Err(ConfigError::DuplicatePin(n)) if n == "PB3"));
    }

    #[test]
    fn test_duplicate_peripheral() {
        let id = ctl_id(b"STUB");
        let pers: Vec<Box<dyn Peripheral>> = vec![Box::new(Stub::new(id)), Box::new(Stub::new(id))];
        assert!(matches!(Device::new(DeviceConfig::atmega328(), pers), Err(ConfigError::DuplicatePeripheral(_))));
    }

    #[test]
    fn test_init_errors_are_returned() {
        let stub = Stub::new(ctl_id(b"STUB")).with_vectors(&[40]);
        let res = Device::new(DeviceConfig::atmega328(), vec![Box::new(stub)]);
        assert!(matches!(res, Err(ConfigError::BadVector { vector: 40, .. })));
    }

    #[test]
    fn test_load_firmware_checks() {
        let mut dev = Device::new(DeviceConfig::atmega328(), Vec::new()).unwrap();
        let mut fw = Firmware::from_words(&[asm::NOP]);
        assert!(matches!(dev.load_firmware(&fw), Err(FirmwareError::NoFrequency)));

        fw.frequency = 8_000_000;
        fw.add_block(Area::Eeprom, 0x3FE, &[1, 2, 3]);
        assert!(matches!(dev.load_firmware(&fw), Err(FirmwareError::Overflow { size: 1024, .. })));

        let mut fw = Firmware::from_words(&[asm::NOP]);
        fw.frequency = 8_000_000;
        fw.add_block(Area::UserRow, 0, &[1]);
        assert!(matches!(dev.load_firmware(&fw), Err(FirmwareError::MissingArea { .. })));

        let fw = testutil::firmware(&[asm::NOP]);
        dev.load_firmware(&fw).unwrap();
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.frequency(), 16_000_000);
        assert!(matches!(dev.load_firmware(&fw), Err(FirmwareError::NotReady(_))));
    }

    #[test]
    fn test_step_counts_cycles() {
        let mut dev = testutil::device_with(&[asm::NOP, asm::NOP, asm::rjmp(-3)], Vec::new());
        for _ in 0..3 {
            dev.step();
        }
        assert_eq!(dev.cycle(), 4);
        assert_eq!(dev.core().pc, 0);
    }

    #[test]
    fn test_state_change_signal() {
        let mut dev = testutil::device_with(&[asm::NOP], Vec::new());
        let rec = SignalRecorder::new();
        dev.signal().connect(rec.clone(), 0);
        dev.reset(ResetFlags::EXTERNAL);
        dev.crash(CrashReason::BadCtlIo, "test".into());
        assert_eq!(rec.count(sig::STATE_CHANGE), 1);
        assert_eq!(rec.last().map(|d| d.data), Some(VarData::Uint(DeviceState::Crashed.code() as u64)));
        assert_eq!(dev.crash_info().map(|c| c.reason.code()), Some(4));
        assert_eq!(dev.step(), DeviceState::Crashed);
    }

    #[test]
    fn test_external_timer_fires_on_due_cycle() {
        let mut dev = testutil::device_with(&[asm::NOP; 64], Vec::new());
        let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = fired.clone();
        let t = dev.add_timer(move |when| {
            log.lock().unwrap().push(when);
            Some(10)
        });
        dev.schedule_timer(t, 5);
        assert_eq!(dev.next_timer_when(), Some(5));
        for _ in 0..25 {
            dev.step();
        }
        assert_eq!(*fired.lock().unwrap(), vec![5, 15, 25]);
        dev.cancel_timer(t);
        assert_eq!(dev.next_timer_when(), None);
    }

    #[test]
    fn test_peripheral_timer_and_update() {
        let stub = Stub::new(ctl_id(b"STUB")).with_period(3);
        let log = stub.log();
        let mut dev = testutil::device_with(&[asm::NOP; 16], vec![Box::new(stub)]);
        for _ in 0..7 {
            dev.step();
        }
        let log = log.lock().unwrap();
        assert_eq!(log.updates, 7);
        assert_eq!(log.fired, vec![3, 6]);
    }

    #[test]
    fn test_ioreg_dispatch_masks_and_owners() {
        // LDI r16, 0xFF; OUT 0x05, r16; IN r17, 0x05
        let stub = Stub::new(ctl_id(b"STUB")).with_reg(0x05, 0x0F, 0x01);
        let log = stub.log();
        let mut dev = testutil::device_with(
            &[asm::ldi(16, 0xFF), asm::out(0x05, 16), asm::in_(17, 0x05)],
            vec![Box::new(stub)],
        );
        dev.step();
        dev.step();
        dev.step();
        // bit 0 read-only, high nibble unused
        assert_eq!(dev.core().regs[17], 0x0E);
        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 1);
        assert_eq!(log.writes[0].posedge, 0x0E);
        assert_eq!(log.reads, 1);
    }

    #[test]
    fn test_unmapped_io_crashes_unless_ignored() {
        // OUT 0x01, r0 maps to data address 0x21, unused on this device
        let mut dev = testutil::device_with(&[asm::out(0x01, 0), asm::out(0x01, 0)], Vec::new());
        dev.set_options(DeviceOptions::IGNORE_BAD_CPU_IO);
        dev.step();
        assert_eq!(dev.state(), DeviceState::Running);
        dev.set_options(DeviceOptions::empty());
        dev.step();
        assert_eq!(dev.state(), DeviceState::Crashed);
        assert_eq!(dev.crash_info().map(|c| c.reason), Some(CrashReason::BadCpuIo));
    }

    #[test]
    fn test_sreg_and_sp_through_io() {
        // LDI r16, 0x12; OUT SPH, r16; IN r17, SPL
        let mut dev = testutil::device_with(&[asm::ldi(16, 0x12), asm::out(0x3E, 16), asm::in_(17, 0x3D)], Vec::new());
        dev.step();
        dev.step();
        dev.step();
        assert_eq!(dev.core().sp, 0x12FF);
        assert_eq!(dev.core().regs[17], 0xFF);
    }

    #[test]
    fn test_console_lines() {
        let mut fw = testutil::firmware(&[
            asm::ldi(16, b'h'),
            asm::out(0x1A, 16),
            asm::ldi(16, b'i'),
            asm::out(0x1A, 16),
            asm::ldi(16, b'\n'),
            asm::out(0x1A, 16),
        ]);
        fw.console_register = Some(0x3A);
        let mut dev = Device::new(DeviceConfig::atmega328(), Vec::new()).unwrap();
        dev.load_firmware(&fw).unwrap();
        for _ in 0..6 {
            dev.step();
        }
        assert_eq!(dev.take_console_output(), vec!["hi".to_string()]);
        assert!(dev.take_console_output().is_empty());
    }

    #[test]
    fn test_reset_request_restarts_program() {
        let stub = Stub::new(ctl_id(b"STUB"));
        let log = stub.log();
        let mut dev = testutil::device_with(&[asm::NOP; 8], vec![Box::new(stub)]);
        dev.step();
        dev.step();
        assert_eq!(dev.core().pc, 2);
        log.lock().unwrap().requests.push(CoreRequest::Reset(ResetFlags::WATCHDOG));
        dev.step();
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.core().pc, 0);
        assert_eq!(log.lock().unwrap().reset_flags.last(), Some(&ResetFlags::WATCHDOG));
    }

    #[test]
    fn test_halt_stalls_cpu_only() {
        let stub = Stub::new(ctl_id(b"STUB"));
        let log = stub.log();
        let mut dev = testutil::device_with(&[asm::NOP; 8], vec![Box::new(stub)]);
        log.lock().unwrap().requests.push(CoreRequest::Halt(true));
        dev.step();
        assert_eq!(dev.state(), DeviceState::Halted);
        let pc = dev.core().pc;
        dev.step();
        dev.step();
        assert_eq!(dev.core().pc, pc);
        log.lock().unwrap().requests.push(CoreRequest::Halt(false));
        dev.step();
        assert_eq!(dev.state(), DeviceState::Running);
        dev.step();
        assert_eq!(dev.core().pc, pc + 1);
    }

    #[test]
    fn test_shorting_stops_or_resets() {
        let stub = Stub::new(ctl_id(b"STUB"));
        let log = stub.log();
        let mut dev = testutil::device_with(&[asm::NOP; 8], vec![Box::new(stub)]);
        dev.set_options(DeviceOptions::RESET_ON_PIN_SHORTING);
        log.lock().unwrap().requests.push(CoreRequest::Shorting(0));
        dev.step();
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(log.lock().unwrap().reset_flags.last(), Some(&ResetFlags::BROWNOUT));

        dev.set_options(DeviceOptions::empty());
        log.lock().unwrap().requests.push(CoreRequest::Shorting(0));
        assert_eq!(dev.step(), DeviceState::Stopped);
    }

    #[test]
    fn test_core_signal_through_ctlreq() {
        let mut dev = testutil::device_with(&[asm::NOP], Vec::new());
        let sig = dev.signal_of(ID_CORE).unwrap();
        assert!(sig.same_as(dev.signal()));
        assert!(dev.signal_of(ID_INTR).is_some());
        assert!(dev.signal_of(ctl_id(b"NONE")).is_none());
    }

    /// Panics on every update.
    struct Faulty;

    impl Peripheral for Faulty {
        fn id(&self) -> CtlId {
            ctl_id(b"FLTY")
        }

        fn update(&mut self, _ctx: &mut Ctx) {
            panic!("update failed");
        }
    }

    #[test]
    fn test_peripheral_panic_is_contained() {
        let stub = Stub::new(ctl_id(b"STUB"));
        let log = stub.log();
        let mut dev = testutil::device_with(&[asm::NOP; 8], vec![Box::new(Faulty), Box::new(stub)]);
        for _ in 0..3 {
            assert_eq!(dev.step(), DeviceState::Running);
        }
        assert_eq!(dev.cycle(), 3);
        assert_eq!(dev.core().pc, 3);
        assert_eq!(log.lock().unwrap().updates, 3);
    }

    #[test]
    fn test_external_pin_drive() {
        let mut dev = testutil::device_with(&[asm::NOP], Vec::new());
        let pb0 = dev.find_pin("PB0").unwrap();
        assert!(dev.set_pin_external_state(pb0, PinState::High));
        assert!(dev.pin(pb0).unwrap().digital_state());
        assert!(!dev.set_pin_external_state(ctl_id(b"XX99"), PinState::Low));
    }
}
