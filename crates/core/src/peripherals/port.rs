//! GPIO port.
//!
//! PORT, DDR and PIN registers of one 8-bit port. PORT and DDR set the GPIO
//! controls of the pins (output level, direction, pull-up); PIN reflects the
//! resolved digital level of each pin. Writing a 1 to a PIN bit toggles the
//! matching PORT bit.
//!
//! The port listens to its pins through relayed hooks: a level change
//! updates PIN, a short is reported to the core.

use crate::error::ConfigError;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{req, CoreRequest, CtlReqData, Ctx, Peripheral};
use crate::pin::{sig as pinsig, PinControls, PinState};
use crate::signal::{HookTag, Signal, SignalData};
use crate::types::{port_id, CtlId, PinId, RegAddr, VarData};

/// Signal ids of the port signal.
pub mod sig {
    /// PORT register written; data = new PORT value.
    pub const PORT: u16 = 0;
    /// A pin level changed; index = bit, data = new PIN value.
    pub const PIN: u16 = 1;
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port letter; pins are named `P<name><bit>`.
    pub name: char,
    pub reg_port: RegAddr,
    pub reg_dir: RegAddr,
    pub reg_pin: RegAddr,
    /// Bits implemented by this port.
    pub pin_mask: u8,
}

impl PortConfig {
    /// Ports B, C and D of the ATmega328.
    pub fn atmega328(name: char) -> Self {
        let (base, mask) = match name {
            'B' => (0x03, 0xFF),
            'C' => (0x06, 0x7F),
            _ => (0x09, 0xFF),
        };
        PortConfig { name, reg_pin: base, reg_dir: base + 1, reg_port: base + 2, pin_mask: mask }
    }
}

pub struct Port {
    config: PortConfig,
    pins: [Option<PinId>; 8],
    signal: Signal,
}

impl Port {
    pub fn new(config: PortConfig) -> Self {
        Port { config, pins: [None; 8], signal: Signal::new() }
    }

    /// PIN value from the pin levels.
    fn pin_value(&self, ctx: &Ctx) -> u8 {
        self.pins.iter().enumerate().fold(0u8, |acc, (bit, id)| {
            match id.and_then(|id| ctx.pin(id)) {
                Some(pin) if pin.digital_state() => acc | (1 << bit),
                _ => acc,
            }
        })
    }

    fn apply_controls(&self, ctx: &mut Ctx) {
        let port = ctx.read_ioreg(self.config.reg_port);
        let dir = ctx.read_ioreg(self.config.reg_dir);
        for (bit, id) in self.pins.iter().enumerate() {
            let Some(id) = *id else { continue };
            let out = dir & (1 << bit) != 0;
            let level = port & (1 << bit) != 0;
            ctx.set_pin_controls(id, PinControls { dir: out, drive: level, inverted: false, pull_up: !out && level });
        }
    }
}

impl Peripheral for Port {
    fn id(&self) -> CtlId {
        port_id(self.config.name)
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let mask = self.config.pin_mask;
        ctx.add_ioreg_mask(self.config.reg_port, mask, 0)?;
        ctx.add_ioreg_mask(self.config.reg_dir, mask, 0)?;
        ctx.add_ioreg_mask(self.config.reg_pin, mask, 0)?;

        let hook = ctx.hook();
        for bit in (0..8u8).filter(|b| mask & (1 << b) != 0) {
            let name = format!("P{}{}", self.config.name, bit);
            let id = ctx.find_pin(&name).ok_or(ConfigError::PinNotFound(name))?;
            if let Some(pin) = ctx.pin(id) {
                pin.signal().connect(hook.clone(), bit as HookTag);
            }
            self.pins[bit as usize] = Some(id);
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        self.apply_controls(ctx);
        let v = self.pin_value(ctx);
        ctx.write_ioreg(self.config.reg_pin, v);
    }

    fn ioreg_read(&mut self, addr: RegAddr, value: u8, ctx: &mut Ctx) -> u8 {
        if addr == self.config.reg_pin {
            self.pin_value(ctx)
        } else {
            value
        }
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        if addr == self.config.reg_pin {
            // PIN is not writable, ones toggle PORT
            let pin = self.pin_value(ctx);
            ctx.write_ioreg(self.config.reg_pin, pin);
            if write.value == 0 {
                return;
            }
            let port = ctx.read_ioreg(self.config.reg_port) ^ write.value;
            ctx.write_ioreg(self.config.reg_port, port);
        } else if addr == self.config.reg_dir {
            self.apply_controls(ctx);
            return;
        }
        self.apply_controls(ctx);
        let port = ctx.read_ioreg(self.config.reg_port);
        tracing::trace!(parent: ctx.span(), "port {} = {:#04x}", self.config.name, port);
        self.signal.raise(sig::PORT, 0, port);
    }

    fn raised(&mut self, data: &SignalData, tag: HookTag, ctx: &mut Ctx) {
        let bit = tag as usize;
        match data.sigid {
            pinsig::DIGITAL_CHANGE => {
                let v = self.pin_value(ctx);
                ctx.write_ioreg(self.config.reg_pin, v);
                self.signal.raise(sig::PIN, bit as i64, v);
            }
            pinsig::STATE_CHANGE if data.data.as_uint() == PinState::Shorted.code() => {
                if let Some(id) = self.pins.get(bit).copied().flatten() {
                    ctx.request(CoreRequest::Shorting(id));
                }
            }
            _ => {}
        }
    }

    fn ctlreq(&mut self, req: u16, data: &mut CtlReqData, _ctx: &mut Ctx) -> bool {
        if req == req::GET_SIGNAL {
            data.data = VarData::Signal(self.signal.clone());
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceOptions, DeviceState};
    use crate::peripherals::testutil::{self, asm};
    use crate::signal::SignalRecorder;

    fn port_b(words: &[u16]) -> Device {
        testutil::device_with(words, vec![Box::new(Port::new(PortConfig::atmega328('B')))])
    }

    #[test]
    fn test_output_drives_pin() {
        // DDRB = 0x01; PORTB = 0x01
        let mut dev = port_b(&[asm::ldi(16, 1), asm::out(0x04, 16), asm::out(0x05, 16)]);
        let pb0 = dev.find_pin("PB0").unwrap();
        dev.step();
        dev.step();
        assert_eq!(dev.pin(pb0).unwrap().state(), PinState::Low);
        dev.step();
        assert_eq!(dev.pin(pb0).unwrap().state(), PinState::High);
    }

    #[test]
    fn test_pull_up_and_external_drive_show_in_pin() {
        // PORTB = 0x02 with DDRB = 0: pull-up on PB1; IN r17, PINB
        let mut dev = port_b(&[asm::ldi(16, 2), asm::out(0x05, 16), asm::in_(17, 0x03), asm::in_(18, 0x03)]);
        dev.step();
        dev.step();
        dev.step();
        assert_eq!(dev.core().regs[17], 0x02);

        let pb1 = dev.find_pin("PB1").unwrap();
        dev.set_pin_external_state(pb1, PinState::Low);
        dev.step();
        assert_eq!(dev.core().regs[18], 0x00);
    }

    #[test]
    fn test_pin_write_toggles_port() {
        // PORTB = 0x03; PINB = 0x01 -> PORTB = 0x02
        let mut dev = port_b(&[
            asm::ldi(16, 3),
            asm::out(0x05, 16),
            asm::ldi(16, 1),
            asm::out(0x03, 16),
            asm::in_(17, 0x05),
        ]);
        for _ in 0..5 {
            dev.step();
        }
        assert_eq!(dev.core().regs[17], 0x02);
    }

    #[test]
    fn test_external_change_updates_pin_register_and_signal() {
        let mut dev = port_b(&[asm::NOP; 4]);
        let rec = SignalRecorder::new();
        dev.signal_of(port_id('B')).unwrap().connect(rec.clone(), 0);
        let pb3 = dev.find_pin("PB3").unwrap();
        dev.set_pin_external_state(pb3, PinState::High);
        assert_eq!(dev.probe().read_ioreg(0x03, crate::debug::Access::Raw), 0x08);
        let last = rec.last().unwrap();
        assert_eq!(last.sigid, sig::PIN);
        assert_eq!(last.index, 3);
    }

    #[test]
    fn test_short_stops_device() {
        // DDRB = 0x01, PORTB = 0 drives PB0 low against an external high
        let mut dev = port_b(&[asm::ldi(16, 1), asm::out(0x04, 16), asm::NOP]);
        let pb0 = dev.find_pin("PB0").unwrap();
        dev.set_pin_external_state(pb0, PinState::High);
        dev.step();
        assert_eq!(dev.step(), DeviceState::Stopped);

        let mut dev = port_b(&[asm::ldi(16, 1), asm::out(0x04, 16), asm::NOP]);
        dev.set_options(DeviceOptions::RESET_ON_PIN_SHORTING);
        let pb0 = dev.find_pin("PB0").unwrap();
        dev.set_pin_external_state(pb0, PinState::High);
        dev.step();
        dev.step();
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.core().pc, 0);
    }

    #[test]
    fn test_missing_pin_is_a_config_error() {
        let mut cfg = PortConfig::atmega328('B');
        cfg.name = 'Z';
        let res = Device::new(crate::config::DeviceConfig::atmega328(), vec![Box::new(Port::new(cfg))]);
        assert!(matches!(res, Err(ConfigError::PinNotFound(n)) if n == "PZ0"));
    }
}
