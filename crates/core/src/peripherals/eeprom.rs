//! EEPROM controller.
//!
//! Drives the device EEPROM memory through EECR, EEDR and EEAR.
//!
//! - Read: setting EERE copies the addressed byte to EEDR and stalls the
//!   CPU for 4 cycles.
//! - Write: setting EEMPE opens a 4 cycle window during which setting EEPE
//!   starts programming, in the mode selected by EEPM1:0 (erase and write,
//!   erase only, write only). EEPE stays set for the programming time and
//!   the memory is updated when it clears.
//!
//! The ready interrupt is level triggered: pending while EERIE is set and no
//! programming is in progress.

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::error::{ConfigError, StateError};
use crate::ioreg::IoRegWrite;
use crate::memory::Area;
use crate::peripheral::{CoreRequest, Ctx, Peripheral};
use crate::types::{CtlId, CycleCount, RegAddr, VectorIndex, ID_EEPROM};

const EERE: u8 = 1 << 0;
const EEPE: u8 = 1 << 1;
const EEMPE: u8 = 1 << 2;
const EERIE: u8 = 1 << 3;
const EEPM: u8 = 0x30;

/// Cycles the CPU is stalled by a read.
const READ_HALT: CycleCount = 4;
/// Length of the master write enable window.
const MPE_WINDOW: CycleCount = 4;

#[derive(Debug, Clone)]
pub struct EepromConfig {
    pub eecr: RegAddr,
    pub eedr: RegAddr,
    pub eearl: RegAddr,
    /// High address byte, absent on small devices.
    pub eearh: Option<RegAddr>,
    pub vector: VectorIndex,
    /// Erase and write time in microseconds.
    pub atomic_time_us: u64,
    /// Erase only or write only time in microseconds.
    pub split_time_us: u64,
}

impl EepromConfig {
    pub fn atmega328() -> Self {
        EepromConfig {
            eecr: 0x1F,
            eedr: 0x20,
            eearl: 0x21,
            eearh: Some(0x22),
            vector: 22,
            atomic_time_us: 3400,
            split_time_us: 1800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum ProgMode {
    Atomic,
    Erase,
    Write,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Programming {
    mode: ProgMode,
    addr: usize,
    data: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EepromState {
    mpe_open: bool,
    halted: bool,
    programming: Option<Programming>,
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    mpe: TimerId,
    halt: TimerId,
    prog: TimerId,
}

pub struct Eeprom {
    config: EepromConfig,
    state: EepromState,
    timers: Option<Timers>,
    addr_mask: usize,
}

impl Eeprom {
    pub fn new(config: EepromConfig) -> Self {
        Eeprom { config, state: EepromState::default(), timers: None, addr_mask: 0 }
    }

    fn address(&self, ctx: &Ctx) -> usize {
        let high = self.config.eearh.map_or(0, |a| ctx.read_ioreg(a));
        ((high as usize) << 8 | ctx.read_ioreg(self.config.eearl) as usize) & self.addr_mask
    }

    fn delay_cycles(&self, mode: ProgMode, ctx: &Ctx) -> CycleCount {
        let us = match mode {
            ProgMode::Atomic => self.config.atomic_time_us,
            ProgMode::Erase | ProgMode::Write => self.config.split_time_us,
        };
        (ctx.frequency() * us / 1_000_000).max(1)
    }

    /// Raise or cancel the ready interrupt from EERIE and EEPE.
    fn update_ready(&self, ctx: &mut Ctx) {
        let eecr = ctx.read_ioreg(self.config.eecr);
        if eecr & EERIE != 0 && eecr & EEPE == 0 {
            ctx.raise_interrupt(self.config.vector);
        } else {
            ctx.cancel_interrupt(self.config.vector);
        }
    }

    fn start_read(&mut self, timers: Timers, ctx: &mut Ctx) {
        let addr = self.address(ctx);
        let value = ctx.nvm(Area::Eeprom).map_or(0xFF, |m| m.read(addr));
        ctx.write_ioreg(self.config.eedr, value);
        tracing::trace!(parent: ctx.span(), "eeprom: read {:#05x} = {:#04x}", addr, value);
        self.state.halted = true;
        ctx.request(CoreRequest::Halt(true));
        // counted from the end of the strobe instruction
        ctx.schedule(timers.halt, READ_HALT + 1);
    }

    fn start_write(&mut self, eecr: u8, timers: Timers, ctx: &mut Ctx) -> bool {
        let mode = match (eecr & EEPM) >> 4 {
            0 => ProgMode::Atomic,
            1 => ProgMode::Erase,
            2 => ProgMode::Write,
            _ => {
                tracing::warn!(parent: ctx.span(), "eeprom: reserved programming mode");
                return false;
            }
        };
        let prog = Programming { mode, addr: self.address(ctx), data: ctx.read_ioreg(self.config.eedr) };
        let delay = self.delay_cycles(mode, ctx);
        tracing::debug!(parent: ctx.span(), "eeprom: {:?} {:#05x} <- {:#04x}, {} cycles", mode, prog.addr, prog.data, delay);
        self.state.programming = Some(prog);
        ctx.schedule(timers.prog, delay);
        true
    }

    fn finish_write(&mut self, ctx: &mut Ctx) {
        let Some(prog) = self.state.programming.take() else { return };
        if let Some(mem) = ctx.nvm_mut(Area::Eeprom) {
            let value = match prog.mode {
                ProgMode::Atomic => prog.data,
                ProgMode::Erase => 0xFF,
                ProgMode::Write => mem.read(prog.addr) & prog.data,
            };
            mem.write(value, prog.addr);
        }
        let eecr = ctx.read_ioreg(self.config.eecr);
        ctx.write_ioreg(self.config.eecr, eecr & !EEPE);
        self.update_ready(ctx);
    }
}

impl Peripheral for Eeprom {
    fn id(&self) -> CtlId {
        ID_EEPROM
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let size = ctx.nvm(Area::Eeprom).map_or(0, |m| m.size());
        if size == 0 {
            return Err(ConfigError::Peripheral { id: self.name(), reason: "device has no EEPROM".into() });
        }
        self.addr_mask = size.next_power_of_two() - 1;
        let c = &self.config;
        ctx.add_ioreg_mask(c.eecr, EEPM | EERIE | EEMPE | EEPE | EERE, 0)?;
        ctx.add_ioreg_mask(c.eedr, 0xFF, 0)?;
        ctx.add_ioreg_mask(c.eearl, (self.addr_mask & 0xFF) as u8, 0)?;
        if let Some(eearh) = c.eearh {
            ctx.add_ioreg_mask(eearh, (self.addr_mask >> 8) as u8, 0)?;
        }
        ctx.register_interrupt(c.vector)?;
        self.timers = Some(Timers { mpe: ctx.new_timer(), halt: ctx.new_timer(), prog: ctx.new_timer() });
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut Ctx) {
        self.state = EepromState::default();
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        if addr != self.config.eecr {
            return;
        }
        let Some(timers) = self.timers else { return };
        let busy = self.state.programming.is_some();
        let mut eecr = write.value & !(EERE | EEPE);
        if busy {
            // mode locked while programming
            eecr = (eecr & !EEPM) | (write.old & EEPM) | EEPE;
        }

        // EEMPE is only cleared by hardware, once the window closes
        let was_open = self.state.mpe_open;
        if write.value & EEMPE != 0 && !was_open {
            self.state.mpe_open = true;
            ctx.schedule(timers.mpe, MPE_WINDOW);
        }
        if self.state.mpe_open {
            eecr |= EEMPE;
        } else {
            eecr &= !EEMPE;
        }

        if write.value & EEPE != 0 && !busy {
            if was_open {
                if self.start_write(eecr, timers, ctx) {
                    eecr |= EEPE;
                }
                self.state.mpe_open = false;
                eecr &= !EEMPE;
                ctx.cancel(timers.mpe);
            } else {
                tracing::debug!(parent: ctx.span(), "eeprom: EEPE without EEMPE ignored");
            }
        }
        ctx.write_ioreg(addr, eecr);

        if write.value & EERE != 0 && !busy {
            self.start_read(timers, ctx);
        }
        self.update_ready(ctx);
    }

    fn timer_fired(&mut self, timer: TimerId, _when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        let timers = self.timers?;
        if timer == timers.mpe {
            self.state.mpe_open = false;
            let eecr = ctx.read_ioreg(self.config.eecr);
            ctx.write_ioreg(self.config.eecr, eecr & !EEMPE);
        } else if timer == timers.halt {
            if std::mem::take(&mut self.state.halted) {
                ctx.request(CoreRequest::Halt(false));
            }
        } else if timer == timers.prog {
            self.finish_write(ctx);
        }
        None
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

    fn eeprom_device(words: &[u16]) -> Device {
        let mut prog = words.to_vec();
        prog.resize(64, asm::NOP);
        prog.push(asm::rjmp(-1));
        testutil::device_with(&prog, vec![Box::new(Eeprom::new(EepromConfig::atmega328()))])
    }

    fn eeprom_byte(dev: &mut Device, addr: u16) -> u8 {
        dev.probe().read_nvm(Area::Eeprom, addr as u32, 1).map_or(0, |v| v[0])
    }

    #[test]
    fn test_programmed_write_after_delay() {
        // EEAR = 0x123, EEDR = 0xA5, EECR = EEMPE, EECR = EEPE
        let mut dev = eeprom_device(&[
            asm::ldi(16, 0x23),
            asm::out(0x21, 16),
            asm::ldi(16, 0x01),
            asm::out(0x22, 16),
            asm::ldi(16, 0xA5),
            asm::out(0x20, 16),
            asm::ldi(16, EEMPE),
            asm::out(0x1F, 16),
            asm::ldi(16, EEPE),
            asm::out(0x1F, 16),
        ]);
        for _ in 0..10 {
            dev.step();
        }
        assert_eq!(dev.probe().read_ioreg(0x1F, Access::Raw) & EEPE, EEPE);
        assert_eq!(eeprom_byte(&mut dev, 0x123), 0xFF);

        // 3.4 ms at 16 MHz
        while dev.cycle() < 54_400 + 20 {
            dev.step();
        }
        assert_eq!(dev.probe().read_ioreg(0x1F, Access::Raw) & EEPE, 0);
        assert_eq!(eeprom_byte(&mut dev, 0x123), 0xA5);
    }

    #[test]
    fn test_write_enable_window_expires() {
        let mut dev = eeprom_device(&[
            asm::ldi(16, EEMPE),
            asm::out(0x1F, 16),
            asm::NOP,
            asm::NOP,
            asm::NOP,
            asm::NOP,
            asm::ldi(16, EEPE),
            asm::out(0x1F, 16),
        ]);
        for _ in 0..3 {
            dev.step();
        }
        assert_eq!(dev.probe().read_ioreg(0x1F, Access::Raw) & EEMPE, EEMPE);
        for _ in 0..5 {
            dev.step();
        }
        assert_eq!(dev.probe().read_ioreg(0x1F, Access::Raw), 0);
        assert_eq!(dev.next_timer_when(), None);
    }

    #[test]
    fn test_read_strobe_halts_cpu() {
        let mut fw = testutil::firmware(&[asm::ldi(16, EERE), asm::out(0x1F, 16), asm::in_(17, 0x20)]);
        fw.add_block(Area::Eeprom, 0x10, &[0x3C]);
        let eeprom = Eeprom::new(EepromConfig::atmega328());
        let mut dev = Device::new(crate::config::DeviceConfig::atmega328(), vec![Box::new(eeprom)]).unwrap();
        dev.load_firmware(&fw).unwrap();
        dev.probe().write_ioreg(0x21, 0x10, Access::Raw);

        dev.step();
        assert_eq!(dev.step(), DeviceState::Halted);
        assert_eq!(dev.probe().read_ioreg(0x20, Access::Raw), 0x3C);
        assert_eq!(dev.probe().read_ioreg(0x1F, Access::Raw) & EERE, 0);
        while dev.state() == DeviceState::Halted {
            dev.step();
        }
        assert_eq!(dev.cycle(), 2 + READ_HALT);
        dev.step();
        assert_eq!(dev.core().regs[17], 0x3C);
    }

    #[test]
    fn test_erase_and_write_only_modes() {
        let mut dev = eeprom_device(&[]);
        assert_eq!(dev.probe().write_nvm(Area::Eeprom, 4, &[0x0F]), 1);
        fn program(dev: &mut Device, eecr: u8, data: u8) {
            dev.probe().write_ioreg(0x21, 4, Access::Bus);
            dev.probe().write_ioreg(0x20, data, Access::Bus);
            dev.probe().write_ioreg(0x1F, eecr | EEMPE, Access::Bus);
            dev.probe().write_ioreg(0x1F, eecr | EEMPE | EEPE, Access::Bus);
            let end = dev.cycle() + 30_000;
            while dev.cycle() < end {
                dev.step();
            }
        }
        // write only ANDs the old content
        program(&mut dev, 0x20, 0x3C);
        assert_eq!(eeprom_byte(&mut dev, 4), 0x0C);
        program(&mut dev, 0x10, 0x00);
        assert_eq!(eeprom_byte(&mut dev, 4), 0xFF);
    }

    #[test]
    fn test_ready_interrupt_is_level_triggered() {
        let mut dev = eeprom_device(&[]);
        dev.probe().write_ioreg(0x1F, EERIE, Access::Bus);
        assert_eq!(dev.interrupts().next_vector(), Some(22));

        dev.probe().write_ioreg(0x1F, EERIE | EEMPE, Access::Bus);
        dev.probe().write_ioreg(0x1F, EERIE | EEMPE | EEPE, Access::Bus);
        assert_eq!(dev.interrupts().next_vector(), None);

        dev.probe().write_ioreg(0x1F, 0, Access::Bus);
        assert_eq!(dev.probe().read_ioreg(0x1F, Access::Raw), EEPE);
    }
}
