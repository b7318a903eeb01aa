//! Placeholder registers.
//!
//! Claims registers of peripherals that are not simulated, so that firmware
//! touching them reads back what it wrote instead of crashing the device.
//! Each register is restored to its reset value on device reset.

use crate::error::ConfigError;
use crate::peripheral::{Ctx, Peripheral};
use crate::types::{ctl_id, CtlId, RegAddr};

pub struct DummyController {
    id: CtlId,
    /// (address, reset value)
    regs: Vec<(RegAddr, u8)>,
}

impl DummyController {
    pub fn new(id: CtlId, regs: Vec<(RegAddr, u8)>) -> Self {
        DummyController { id, regs }
    }

    /// Registers of the ATmega328 peripherals without a model: TWI,
    /// timer 1 and power reduction.
    pub fn atmega328() -> Self {
        let mut regs: Vec<(RegAddr, u8)> = Vec::new();
        // TWI, TWSR reads 0xF8 and TWAR 0xFE when idle
        regs.extend([(0x98, 0x00), (0x99, 0xF8), (0x9A, 0xFE), (0x9B, 0xFF), (0x9C, 0x00), (0x9D, 0x00)]);
        // timer 1
        regs.extend((0x60..=0x6B).map(|a| (a, 0)));
        regs.extend([(0x16, 0x00), (0x4F, 0x00)]);
        // PRR
        regs.push((0x44, 0x00));
        DummyController::new(ctl_id(b"DMMY"), regs)
    }
}

impl Peripheral for DummyController {
    fn id(&self) -> CtlId {
        self.id
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        for &(addr, _) in &self.regs {
            ctx.add_ioreg_mask(addr, 0xFF, 0)?;
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        for &(addr, value) in &self.regs {
            ctx.write_ioreg(addr, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::Access;
    use crate::device::{DeviceState, ResetFlags};
    use crate::peripherals::testutil::{self, asm};

    #[test]
    fn test_registers_hold_values_and_reset() {
        let dummy = DummyController::new(ctl_id(b"DMMY"), vec![(0x01, 0x5A)]);
        // IN r17, 0x01; LDI r16, 7; OUT 0x01, r16; IN r18, 0x01
        let mut dev = testutil::device_with(
            &[asm::in_(17, 0x01), asm::ldi(16, 7), asm::out(0x01, 16), asm::in_(18, 0x01)],
            vec![Box::new(dummy)],
        );
        for _ in 0..4 {
            dev.step();
        }
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.core().regs[17], 0x5A);
        assert_eq!(dev.core().regs[18], 7);

        dev.reset(ResetFlags::EXTERNAL);
        assert_eq!(dev.probe().read_ioreg(0x01, Access::Raw), 0x5A);
    }

    #[test]
    fn test_atmega328_twi_status() {
        let mut dev = testutil::device_with(&[asm::NOP], vec![Box::new(DummyController::atmega328())]);
        assert_eq!(dev.probe().read_ioreg(0x99, Access::Bus), 0xF8);
        // modelled peripherals keep their own registers
        assert!(!dev.probe().write_ioreg(0xA0, 0x40, Access::Bus));
        assert!(!dev.probe().write_ioreg(0x40, 0x08, Access::Bus));
    }
}
