//! Flash self-programming controller (SPMCSR).
//!
//! The firmware writes a command into SPMCSR together with SPMEN, then
//! executes SPM within 4 cycles. The SPM instruction reaches this controller
//! as a [`req::NVM_WRITE`] request carrying Z and R1:R0.
//!
//! | SPMCSR bits     | SPM action                                    |
//! |-----------------|-----------------------------------------------|
//! | SPMEN           | store R1:R0 in the page buffer at Z           |
//! | PGERS + SPMEN   | erase the page containing Z                   |
//! | PGWRT + SPMEN   | write the page buffer to the page containing Z|
//! | RWWSRE + SPMEN  | re-enable the RWW section, clear the buffer   |
//! | BLBSET + SPMEN  | program the lock bits from R0                 |
//!
//! Erase and write take the configured programming time. A page in the NRWW
//! section stalls the CPU for that time; a page in the RWW section leaves it
//! running with RWWSB set until RWWSRE is issued. The SPM ready interrupt is
//! level triggered: pending while SPMIE is set and SPMEN is clear.

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::error::{ConfigError, StateError};
use crate::ioreg::IoRegWrite;
use crate::memory::Area;
use crate::peripheral::{req, CoreRequest, CtlReqData, Ctx, Peripheral};
use crate::types::{CtlId, CycleCount, RegAddr, VectorIndex, ID_NVM};

const SPMEN: u8 = 1 << 0;
const PGERS: u8 = 1 << 1;
const PGWRT: u8 = 1 << 2;
const BLBSET: u8 = 1 << 3;
const RWWSRE: u8 = 1 << 4;
const SIGRD: u8 = 1 << 5;
const RWWSB: u8 = 1 << 6;
const SPMIE: u8 = 1 << 7;

const COMMAND: u8 = PGERS | PGWRT | BLBSET | RWWSRE | SIGRD;

/// Cycles during which SPM accepts the command written with SPMEN.
const SPM_WINDOW: CycleCount = 4;

#[derive(Debug, Clone)]
pub struct NvmConfig {
    pub spmcsr: RegAddr,
    pub vector: VectorIndex,
    /// Page size in bytes.
    pub page_size: usize,
    /// Byte address where the NRWW section starts.
    pub nrww_start: u32,
    /// Page erase or page write time in microseconds.
    pub page_time_us: u64,
}

impl NvmConfig {
    pub fn atmega328() -> Self {
        NvmConfig { spmcsr: 0x37, vector: 25, page_size: 128, nrww_start: 0x7000, page_time_us: 4000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum PageOp {
    Erase,
    Write,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Pending {
    op: PageOp,
    page: u32,
    halted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NvmState {
    /// Page buffer, `None` for erased bytes.
    buffer: Vec<Option<u8>>,
    window_open: bool,
    pending: Option<Pending>,
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    window: TimerId,
    prog: TimerId,
}

pub struct NvmController {
    config: NvmConfig,
    state: NvmState,
    timers: Option<Timers>,
    flash_size: usize,
}

impl NvmController {
    pub fn new(config: NvmConfig) -> Self {
        NvmController { config, state: NvmState::default(), timers: None, flash_size: 0 }
    }

    fn clear_buffer(&mut self) {
        self.state.buffer = vec![None; self.config.page_size];
    }

    fn spmcsr(&self, ctx: &Ctx) -> u8 {
        ctx.read_ioreg(self.config.spmcsr)
    }

    /// Raise or cancel the ready interrupt from SPMIE and SPMEN.
    fn update_ready(&self, ctx: &mut Ctx) {
        let v = self.spmcsr(ctx);
        if v & SPMIE != 0 && v & SPMEN == 0 {
            ctx.raise_interrupt(self.config.vector);
        } else {
            ctx.cancel_interrupt(self.config.vector);
        }
    }

    /// End of an SPM command: the command bits and SPMEN clear.
    fn complete(&mut self, ctx: &mut Ctx) {
        let v = self.spmcsr(ctx);
        ctx.write_ioreg(self.config.spmcsr, v & !(COMMAND | SPMEN));
        self.update_ready(ctx);
    }

    fn close_window(&mut self, timers: Timers, ctx: &mut Ctx) {
        self.state.window_open = false;
        ctx.cancel(timers.window);
    }

    fn page_of(&self, z: u32) -> u32 {
        z & !(self.config.page_size as u32 - 1)
    }

    fn start_page_op(&mut self, op: PageOp, z: u32, timers: Timers, ctx: &mut Ctx) {
        let page = self.page_of(z);
        if page as usize >= self.flash_size {
            tracing::warn!(parent: ctx.span(), "spm: page {:#07x} outside of flash", page);
            self.complete(ctx);
            return;
        }
        let halted = page >= self.config.nrww_start;
        if halted {
            ctx.request(CoreRequest::Halt(true));
        } else {
            let v = self.spmcsr(ctx);
            ctx.write_ioreg(self.config.spmcsr, v | RWWSB);
        }
        let delay = (ctx.frequency() * self.config.page_time_us / 1_000_000).max(1);
        tracing::debug!(parent: ctx.span(), "spm: page {:?} at {:#07x}, {} cycles", op, page, delay);
        self.state.pending = Some(Pending { op, page, halted });
        ctx.schedule(timers.prog, delay);
    }

    fn finish_page_op(&mut self, ctx: &mut Ctx) {
        let Some(p) = self.state.pending.take() else { return };
        let size = self.config.page_size;
        let data = match p.op {
            PageOp::Erase => vec![0xFF; size],
            PageOp::Write => {
                let data = self.state.buffer.iter().map(|b| b.unwrap_or(0xFF)).collect();
                self.clear_buffer();
                data
            }
        };
        ctx.request(CoreRequest::ProgramFlash { addr: p.page, data });
        if p.halted {
            ctx.request(CoreRequest::Halt(false));
        }
        self.complete(ctx);
    }

    fn spm(&mut self, z: u32, data: u16, ctx: &mut Ctx) {
        let Some(timers) = self.timers else { return };
        let v = self.spmcsr(ctx);
        if !self.state.window_open || v & SPMEN == 0 {
            tracing::debug!(parent: ctx.span(), "spm: no command armed, ignored");
            return;
        }
        if self.state.pending.is_some() {
            tracing::debug!(parent: ctx.span(), "spm: programming in progress, ignored");
            return;
        }
        self.close_window(timers, ctx);

        match v & COMMAND {
            0 => {
                let offset = (z as usize & (self.config.page_size - 1)) & !1;
                let [lo, hi] = data.to_le_bytes();
                self.state.buffer[offset] = Some(lo);
                self.state.buffer[offset + 1] = Some(hi);
                self.complete(ctx);
            }
            PGERS => self.start_page_op(PageOp::Erase, z, timers, ctx),
            PGWRT => self.start_page_op(PageOp::Write, z, timers, ctx),
            RWWSRE => {
                let v = self.spmcsr(ctx);
                ctx.write_ioreg(self.config.spmcsr, v & !RWWSB);
                self.clear_buffer();
                self.complete(ctx);
            }
            BLBSET => {
                // lock bits only go from 1 to 0
                if let Some(lock) = ctx.nvm_mut(Area::Lockbit) {
                    let value = lock.read(0) & (data as u8 | 0xC0);
                    lock.write(value, 0);
                }
                self.complete(ctx);
            }
            cmd => {
                tracing::debug!(parent: ctx.span(), "spm: unsupported command {:#04x}", cmd);
                self.complete(ctx);
            }
        }
    }
}

impl Peripheral for NvmController {
    fn id(&self) -> CtlId {
        ID_NVM
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let page = self.config.page_size;
        if page < 2 || !page.is_power_of_two() {
            return Err(ConfigError::Peripheral { id: self.name(), reason: format!("bad page size {}", page) });
        }
        self.flash_size = ctx.nvm(Area::Flash).map_or(0, |m| m.size());
        ctx.add_ioreg_mask(self.config.spmcsr, 0xFF, RWWSB)?;
        ctx.register_interrupt(self.config.vector)?;
        self.timers = Some(Timers { window: ctx.new_timer(), prog: ctx.new_timer() });
        self.clear_buffer();
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut Ctx) {
        self.state.window_open = false;
        self.state.pending = None;
        self.clear_buffer();
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        if addr != self.config.spmcsr {
            return;
        }
        let Some(timers) = self.timers else { return };
        if self.state.pending.is_some() {
            // SPMEN and the command stay locked while programming
            let locked = write.old & (COMMAND | SPMEN | RWWSB);
            ctx.write_ioreg(addr, (write.value & SPMIE) | locked);
        } else if write.value & SPMEN != 0 {
            self.state.window_open = true;
            ctx.schedule(timers.window, SPM_WINDOW);
        } else {
            self.close_window(timers, ctx);
        }
        self.update_ready(ctx);
    }

    fn timer_fired(&mut self, timer: TimerId, _when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        let timers = self.timers?;
        if timer == timers.window {
            if self.state.window_open {
                self.state.window_open = false;
                self.complete(ctx);
            }
        } else if timer == timers.prog {
            self.finish_page_op(ctx);
        }
        None
    }

    fn ctlreq(&mut self, req: u16, data: &mut CtlReqData, ctx: &mut Ctx) -> bool {
        if req != req::NVM_WRITE {
            return false;
        }
        self.spm(data.index as u32, data.data.as_uint() as u16, ctx);
        true
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        if vector == self.config.vector {
            self.update_ready(ctx);
        }
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&self.state)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        self.state = bincode::deserialize(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::Access;
    use crate::device::{Device, DeviceState};
    use crate::peripherals::testutil::{self, asm};

    const SPM: u16 = 0x95E8;

    fn nvm_device(words: &[u16]) -> Device {
        let mut prog = words.to_vec();
        prog.resize(32, asm::NOP);
        prog.push(asm::rjmp(-1));
        testutil::device_with(&prog, vec![Box::new(NvmController::new(NvmConfig::atmega328()))])
    }

    fn run_until(dev: &mut Device, cycle: CycleCount) {
        while dev.cycle() < cycle {
            dev.step();
        }
    }

    /// Z = `z`, R1:R0 = `data`, SPMCSR = `cmd`, SPM.
    fn spm_sequence(z: u16, data: u16, cmd: u8) -> Vec<u16> {
        vec![
            asm::ldi(30, z as u8),
            asm::ldi(31, (z >> 8) as u8),
            asm::ldi(16, data as u8),
            asm::mov(0, 16),
            asm::ldi(16, (data >> 8) as u8),
            asm::mov(1, 16),
            asm::ldi(16, cmd),
            asm::out(0x37, 16),
            SPM,
        ]
    }

    #[test]
    fn test_fill_buffer_then_write_page() {
        let mut prog = spm_sequence(0x0102, 0xBEEF, SPMEN);
        prog.extend(spm_sequence(0x0100, 0, PGWRT | SPMEN));
        let mut dev = nvm_device(&prog);
        for _ in 0..prog.len() {
            dev.step();
        }
        // RWW page: the CPU keeps running, RWWSB is set
        assert_eq!(dev.state(), DeviceState::Running);
        let spmcsr = dev.probe().read_ioreg(0x37, Access::Raw);
        assert_eq!(spmcsr & (RWWSB | PGWRT | SPMEN), RWWSB | PGWRT | SPMEN);

        run_until(&mut dev, 64_000 + 40);
        assert_eq!(dev.probe().read_ioreg(0x37, Access::Raw), RWWSB);
        let page = dev.probe().read_flash(0x100, 4);
        assert_eq!(page, vec![0xFF, 0xFF, 0xEF, 0xBE]);
    }

    #[test]
    fn test_page_erase() {
        let prog = spm_sequence(0x0400, 0, PGERS | SPMEN);
        let mut dev = nvm_device(&prog);
        assert_eq!(dev.probe().write_flash(0x47E, &[0x12, 0x34]), 2);
        run_until(&mut dev, 64_000 + 40);
        assert_eq!(dev.probe().read_flash(0x47E, 2), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_nrww_page_halts_cpu() {
        let prog = spm_sequence(0x7000, 0, PGERS | SPMEN);
        let mut dev = nvm_device(&prog);
        for _ in 0..prog.len() {
            dev.step();
        }
        assert_eq!(dev.state(), DeviceState::Halted);
        run_until(&mut dev, 64_000 + 40);
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.probe().read_ioreg(0x37, Access::Raw) & RWWSB, 0);
    }

    #[test]
    fn test_spm_after_window_is_ignored() {
        let mut prog = spm_sequence(0x0100, 0, PGERS | SPMEN);
        let spm = prog.pop().unwrap_or(SPM);
        prog.extend([asm::NOP, asm::NOP, asm::NOP, asm::NOP, spm]);
        let mut dev = nvm_device(&prog);
        for _ in 0..prog.len() {
            dev.step();
        }
        assert_eq!(dev.probe().read_ioreg(0x37, Access::Raw), 0);
        assert_eq!(dev.next_timer_when(), None);
    }

    #[test]
    fn test_ready_interrupt_and_rww_enable() {
        let prog = spm_sequence(0, 0, SPMIE | RWWSRE | SPMEN);
        let mut dev = nvm_device(&prog);
        dev.probe().write_ioreg(0x37, SPMIE, Access::Bus);
        assert_eq!(dev.interrupts().next_vector(), Some(25));
        for _ in 0..prog.len() {
            dev.step();
        }
        assert_eq!(dev.probe().read_ioreg(0x37, Access::Raw), SPMIE);
        assert_eq!(dev.interrupts().next_vector(), Some(25));
    }

    #[test]
    fn test_page_write_keeps_breakpoints() {
        let mut prog = spm_sequence(0x0100, asm::ldi(17, 5), SPMEN);
        prog.extend(spm_sequence(0x0100, 0, PGWRT | SPMEN));
        let mut dev = nvm_device(&prog);
        {
            let mut dbg = dev.probe();
            dbg.attach();
            assert!(dbg.insert_breakpoint(0x100));
        }
        run_until(&mut dev, 64_000 + 40);
        assert_eq!(dev.probe().read_flash(0x100, 2), asm::BREAK.to_le_bytes().to_vec());
        let mut dbg = dev.probe();
        assert!(dbg.remove_breakpoint(0x100));
        assert_eq!(dbg.read_flash(0x100, 2), asm::ldi(17, 5).to_le_bytes().to_vec());
    }
}
