//! Watchdog timer.
//!
//! Clocked from the 128 kHz watchdog oscillator, the timeout is `2048 << WDP`
//! oscillator cycles (16 ms to 8 s). The WDR instruction restarts the count.
//! On timeout, with:
//!
//! - WDIE set: WDIF is set and the interrupt raised. When WDE is also set,
//!   entering the vector clears WDIE so the next timeout resets the device.
//! - WDE set and WDIE clear: a watchdog system reset.
//!
//! Clearing WDE or changing the prescaler takes the timed sequence: write
//! WDCE and WDE together, then the new value within 4 cycles. WDE cannot be
//! cleared while WDRF is set in MCUSR.
//!
//! MCUSR keeps the reset causes across resets, a power-on reset clears the
//! others. Firmware clears flags by writing zeros.

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::device::ResetFlags;
use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptFlag;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{req, CoreRequest, CtlReqData, Ctx, Peripheral};
use crate::types::{CtlId, CycleCount, RegAddr, RegBit, VectorIndex, ID_WATCHDOG};

const WDIF: u8 = 1 << 7;
const WDIE: u8 = 1 << 6;
const WDP3: u8 = 1 << 5;
const WDCE: u8 = 1 << 4;
const WDE: u8 = 1 << 3;
const WDP: u8 = WDP3 | 0x07;

const WDRF: u8 = ResetFlags::WATCHDOG.bits();

/// Cycles during which a protected change is accepted after WDCE.
const CHANGE_WINDOW: CycleCount = 4;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub wdtcsr: RegAddr,
    pub mcusr: RegAddr,
    pub vector: VectorIndex,
    /// Watchdog oscillator frequency in Hz.
    pub clock_hz: u64,
}

impl WatchdogConfig {
    pub fn atmega328() -> Self {
        WatchdogConfig { wdtcsr: 0x40, mcusr: 0x34, vector: 6, clock_hz: 128_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WatchdogState {
    change_enabled: bool,
    /// Prescaler the running count was started with.
    prescaler: Option<u8>,
    mcusr: u8,
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    timeout: TimerId,
    change: TimerId,
}

pub struct Watchdog {
    config: WatchdogConfig,
    state: WatchdogState,
    timers: Option<Timers>,
    wdif: InterruptFlag,
}

fn prescaler(wdtcsr: u8) -> u8 {
    ((wdtcsr & WDP3) >> 2) | (wdtcsr & 0x07)
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let wdif = InterruptFlag::new(config.vector, RegBit::bit(config.wdtcsr, 6), RegBit::bit(config.wdtcsr, 7), true);
        Watchdog { config, state: WatchdogState::default(), timers: None, wdif }
    }

    /// Timeout in CPU cycles for prescaler `wdp`.
    fn timeout_cycles(&self, wdp: u8, ctx: &Ctx) -> CycleCount {
        let osc_cycles = 2048u64 << wdp.min(9);
        (osc_cycles * ctx.frequency() / self.config.clock_hz).max(1)
    }

    /// Start, restart or stop the count to follow WDTCSR.
    fn sync_timer(&mut self, restart: bool, ctx: &mut Ctx) {
        let Some(timers) = self.timers else { return };
        let v = ctx.read_ioreg(self.config.wdtcsr);
        if v & (WDE | WDIE) == 0 {
            if self.state.prescaler.take().is_some() {
                tracing::debug!(parent: ctx.span(), "watchdog: stopped");
            }
            ctx.cancel(timers.timeout);
            return;
        }
        let wdp = prescaler(v);
        if restart || self.state.prescaler != Some(wdp) {
            let delay = self.timeout_cycles(wdp, ctx);
            if self.state.prescaler.is_none() {
                tracing::debug!(parent: ctx.span(), "watchdog: started, timeout {} cycles", delay);
            }
            self.state.prescaler = Some(wdp);
            ctx.schedule(timers.timeout, delay);
        }
    }

    fn write_wdtcsr(&mut self, write: IoRegWrite, ctx: &mut Ctx) {
        let Some(timers) = self.timers else { return };
        let (old, new) = (write.old, write.value);
        // WDIF is cleared by writing a one
        let wdif = old & WDIF & !(new & WDIF);
        let mut value = wdif | (new & WDIE);

        if self.state.change_enabled {
            value |= new & (WDE | WDP);
            self.state.change_enabled = false;
            ctx.cancel(timers.change);
        } else {
            value |= (old | new) & WDE;
            value |= old & WDP;
            if new & (WDCE | WDE) == WDCE | WDE {
                value |= WDCE;
                self.state.change_enabled = true;
                ctx.schedule(timers.change, CHANGE_WINDOW);
            }
        }
        if self.state.mcusr & WDRF != 0 {
            value |= WDE;
        }
        ctx.write_ioreg(self.config.wdtcsr, value);
        self.wdif.update_from_ioreg(ctx);
        self.sync_timer(false, ctx);
    }

    fn timeout(&mut self, ctx: &mut Ctx) -> Option<CycleCount> {
        let v = ctx.read_ioreg(self.config.wdtcsr);
        if v & WDIE != 0 {
            tracing::trace!(parent: ctx.span(), "watchdog: timeout interrupt");
            self.wdif.set_flag(1, ctx);
        } else if v & WDE != 0 {
            tracing::info!(parent: ctx.span(), "watchdog: system reset");
            self.state.prescaler = None;
            ctx.request(CoreRequest::Reset(ResetFlags::WATCHDOG));
            return None;
        } else {
            self.state.prescaler = None;
            return None;
        }
        Some(self.timeout_cycles(prescaler(v), ctx))
    }
}

impl Peripheral for Watchdog {
    fn id(&self) -> CtlId {
        ID_WATCHDOG
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        ctx.add_ioreg_mask(self.config.wdtcsr, 0xFF, 0)?;
        ctx.add_ioreg_mask(self.config.mcusr, 0x0F, 0)?;
        self.wdif.init(ctx)?;
        self.timers = Some(Timers { timeout: ctx.new_timer(), change: ctx.new_timer() });
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        let flags = ctx.reset_flags().bits() & 0x0F;
        if flags & ResetFlags::POWER_ON.bits() != 0 {
            self.state.mcusr = flags;
        } else {
            self.state.mcusr |= flags;
        }
        self.state.change_enabled = false;
        self.state.prescaler = None;
        self.wdif.reset();
        ctx.write_ioreg(self.config.mcusr, self.state.mcusr);
        // WDRF keeps the watchdog enabled, with the shortest timeout
        if self.state.mcusr & WDRF != 0 {
            ctx.write_ioreg(self.config.wdtcsr, WDE);
        }
        self.sync_timer(true, ctx);
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        if addr == self.config.wdtcsr {
            self.write_wdtcsr(write, ctx);
        } else if addr == self.config.mcusr {
            // flags only clear
            self.state.mcusr &= write.value;
            ctx.write_ioreg(addr, self.state.mcusr);
        }
    }

    fn timer_fired(&mut self, timer: TimerId, _when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        let timers = self.timers?;
        if timer == timers.change {
            self.state.change_enabled = false;
            let v = ctx.read_ioreg(self.config.wdtcsr);
            ctx.write_ioreg(self.config.wdtcsr, v & !WDCE);
            None
        } else {
            self.timeout(ctx)
        }
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        if vector != self.config.vector {
            return;
        }
        self.wdif.interrupt_ack(vector, ctx);
        let v = ctx.read_ioreg(self.config.wdtcsr);
        if v & WDE != 0 {
            // interrupt and reset mode falls back to reset mode
            ctx.write_ioreg(self.config.wdtcsr, v & !WDIE);
        }
    }

    fn ctlreq(&mut self, req: u16, _data: &mut CtlReqData, ctx: &mut Ctx) -> bool {
        if req != req::WATCHDOG_RESET {
            return false;
        }
        if self.state.prescaler.is_some() {
            self.sync_timer(true, ctx);
        }
        true
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(&self.state, &self.wdif))?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (state, wdif) = bincode::deserialize(data)?;
        self.state = state;
        self.wdif = wdif;
        Ok(())
    }
}
