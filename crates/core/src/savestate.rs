//! Device snapshots.
//!
//! [`Device::save_state`] captures everything needed to resume execution
//! later on a device built from the same configuration and peripheral set:
//! clock and timer schedule, core registers and SRAM, I/O register values,
//! NVM contents, interrupt table, pin drivers and the private state of each
//! peripheral.
//!
//! ## Format
//!
//! ```text
//! +------------------+
//! | Magic "AVRS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian
//! +------------------+
//! | Name length      |  u8
//! +------------------+
//! | Device name      |  UTF-8
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```
//!
//! Flash is saved without breakpoint patches; breakpoints set on the
//! restoring device are re-applied after loading.

use serde::{Deserialize, Serialize};

use crate::cpu::{Core, BREAK_OPCODE};
use crate::cycle::CycleState;
use crate::device::{CrashInfo, Device, DeviceState, ResetFlags};
use crate::error::StateError;
use crate::interrupt::InterruptState;
use crate::ioreg::RegValues;
use crate::memory::{Area, NvmBank};
use crate::pin::PinSnapshot;
use crate::sleep::SleepMode;
use crate::types::{id_to_str, CtlId};

/// Magic bytes identifying a snapshot.
const MAGIC: &[u8; 4] = b"AVRS";
/// Current snapshot format version.
const FORMAT_VERSION: u32 = 2;
/// Deflate level, as a size/speed trade-off.
const COMPRESSION_LEVEL: u8 = 6;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    cycles: CycleState,
    state: DeviceState,
    sleep_mode: SleepMode,
    reset_flags: ResetFlags,
    frequency: u64,
    vcc: f64,
    aref: f64,
    core: Core,
    ioregs: RegValues,
    nvm: NvmBank,
    interrupts: InterruptState,
    pins: Vec<PinSnapshot>,
    crash: Option<CrashInfo>,
    peripherals: Vec<(CtlId, Vec<u8>)>,
}

impl Device {
    /// Serialise the device state.
    pub fn save_state(&self) -> Result<Vec<u8>, StateError> {
        let mut nvm = self.bus.nvm.clone();
        if let Some(flash) = nvm.get_mut(Area::Flash) {
            for (&word, &original) in &self.debug.breakpoints {
                flash.program(&original.to_le_bytes(), word as usize * 2);
            }
        }
        let peripherals = self
            .peripherals
            .iter()
            .map(|p| Ok((p.id(), p.save_state()?)))
            .collect::<Result<Vec<_>, StateError>>()?;

        let snap = Snapshot {
            cycles: self.bus.cycles.state(),
            state: self.bus.state,
            sleep_mode: self.bus.sleep_mode,
            reset_flags: self.bus.reset_flags,
            frequency: self.bus.frequency,
            vcc: self.bus.vcc,
            aref: self.bus.aref,
            core: self.core.clone(),
            ioregs: self.bus.ioregs.values(),
            nvm,
            interrupts: self.bus.interrupts.snapshot(),
            pins: self.bus.pins.iter().map(|p| p.snapshot()).collect(),
            crash: self.crash_info.clone(),
            peripherals,
        };
        let payload = bincode::serialize(&snap)?;
        let compressed = miniz_oxide::deflate::compress_to_vec(&payload, COMPRESSION_LEVEL);

        let name = self.config.name.as_bytes();
        let name = &name[..name.len().min(u8::MAX as usize)];
        let mut out = Vec::with_capacity(9 + name.len() + compressed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&compressed);
        tracing::debug!(parent: &self.bus.span, "state saved, {} bytes ({} raw)", out.len(), payload.len());
        Ok(out)
    }

    /// Restore a state produced by [`save_state`](Self::save_state) on a
    /// device of the same configuration. On error the device is left
    /// untouched, unless a peripheral rejected its own state.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        if data.len() < 9 {
            return Err(StateError::Truncated);
        }
        if &data[0..4] != MAGIC {
            return Err(StateError::BadMagic);
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != FORMAT_VERSION {
            return Err(StateError::Version { found: version, expected: FORMAT_VERSION });
        }
        let name_len = data[8] as usize;
        let Some(name) = data.get(9..9 + name_len) else {
            return Err(StateError::Truncated);
        };
        let name = String::from_utf8_lossy(name);
        if name != self.config.name.as_str() {
            return Err(StateError::DeviceMismatch { found: name.into_owned(), expected: self.config.name.clone() });
        }
        let payload = miniz_oxide::inflate::decompress_to_vec(&data[9 + name_len..])
            .map_err(|e| StateError::Inflate(format!("{:?}", e.status)))?;
        let snap: Snapshot = bincode::deserialize(&payload)?;
        self.check_layout(&snap)?;

        // every check passed, nothing below can fail half way except peripherals
        self.bus.cycles.restore(&snap.cycles);
        self.bus.ioregs.restore(&snap.ioregs);
        self.bus.interrupts.restore(&snap.interrupts);
        for (pin, s) in self.bus.pins.iter_mut().zip(&snap.pins) {
            pin.restore(s);
        }
        self.bus.nvm = snap.nvm;
        let words: Vec<u32> = self.debug.breakpoints.keys().copied().collect();
        if let Some(flash) = self.bus.nvm.get_mut(Area::Flash) {
            for word in words {
                let addr = word as usize * 2;
                self.debug.breakpoints.insert(word, flash.read_word(addr));
                flash.program(&BREAK_OPCODE.to_le_bytes(), addr);
            }
        }
        self.core = snap.core;
        self.bus.sleep_mode = snap.sleep_mode;
        self.bus.reset_flags = snap.reset_flags;
        self.bus.frequency = snap.frequency;
        self.bus.vcc = snap.vcc;
        self.bus.aref = snap.aref;
        self.bus.requests.clear();
        self.bus.relay.clear();
        self.crash_info = snap.crash;
        self.debug.resume_from_break = false;

        for (p, (_, blob)) in self.peripherals.iter_mut().zip(&snap.peripherals) {
            p.load_state(blob)?;
        }
        self.set_state(snap.state);
        tracing::debug!(parent: &self.bus.span, "state loaded at cycle {}", self.bus.cycles.cycle());
        Ok(())
    }

    fn check_layout(&self, snap: &Snapshot) -> Result<(), StateError> {
        let ids: Vec<CtlId> = self.peripherals.iter().map(|p| p.id()).collect();
        let saved: Vec<CtlId> = snap.peripherals.iter().map(|(id, _)| *id).collect();
        if ids != saved {
            let names = |v: &[CtlId]| v.iter().map(|&id| id_to_str(id)).collect::<Vec<_>>().join(",");
            return Err(StateError::Layout(format!("peripherals [{}], saved [{}]", names(&ids), names(&saved))));
        }
        if snap.core.sram.len() != self.core.sram.len() {
            return Err(StateError::Layout(format!("SRAM of {} bytes, saved {}", self.core.sram.len(), snap.core.sram.len())));
        }
        if snap.ioregs.0.len() != self.bus.ioregs.size() {
            return Err(StateError::Layout("I/O register count".into()));
        }
        if snap.pins.len() != self.bus.pins.len() {
            return Err(StateError::Layout("pin count".into()));
        }
        if snap.cycles.timer_count() != self.bus.cycles.timer_count() {
            return Err(StateError::Layout("timer count".into()));
        }
        if snap.interrupts.vector_count() != self.bus.interrupts.vector_count() {
            return Err(StateError::Layout("vector count".into()));
        }
        for area in self.bus.nvm.areas() {
            let size = self.bus.nvm.get(area).map(|m| m.size());
            if snap.nvm.get(area).map(|m| m.size()) != size {
                return Err(StateError::Layout(format!("{} size", area)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::debug::Access;
    use crate::peripherals::testutil::{self, asm};
    use crate::peripherals::{atmega328_peripherals, Spi, SpiConfig};

    /// Timer 0 at clk/8 with the overflow interrupt counting in r20, main
    /// loop incrementing r21.
    fn counting_device() -> Device {
        let mut prog = vec![asm::rjmp(39)];
        prog.resize(32, asm::NOP);
        // timer 0 overflow vector (16)
        prog.push(0x9543); // INC r20
        prog.push(asm::RETI);
        prog.resize(40, asm::NOP);
        prog.extend([
            asm::ldi(16, 0x02),
            asm::out(0x25, 16), // TCCR0B = clk/8
            asm::ldi(16, 0x01),
            asm::sts(0x6E, 16)[0],
            asm::sts(0x6E, 16)[1], // TIMSK0 = TOIE0
            asm::SEI,
            0x9553, // INC r21
            asm::rjmp(-2),
        ]);
        let mut dev = Device::new(DeviceConfig::atmega328(), atmega328_peripherals()).unwrap();
        dev.load_firmware(&testutil::firmware(&prog)).unwrap();
        dev
    }

    fn run_to(dev: &mut Device, cycle: u64) {
        while dev.cycle() < cycle {
            dev.step();
        }
    }

    #[test]
    fn test_round_trip_resumes_identically() {
        let mut dev = counting_device();
        dev.probe().write_nvm(Area::Eeprom, 3, &[0x77]);
        run_to(&mut dev, 5000);
        assert!(dev.core().regs[20] > 0);
        let saved = dev.save_state().unwrap();
        assert_eq!(&saved[0..4], b"AVRS");

        run_to(&mut dev, 12_000);
        let expected = dev.core().clone();
        let expected_cycle = dev.cycle();
        let tcnt = dev.probe().read_ioreg(0x26, Access::Bus);

        let mut other = counting_device();
        run_to(&mut other, 100);
        other.load_state(&saved).unwrap();
        assert_eq!(other.probe().read_nvm(Area::Eeprom, 3, 1), Some(vec![0x77]));
        run_to(&mut other, 12_000);
        assert_eq!(other.cycle(), expected_cycle);
        assert_eq!(other.core(), &expected);
        assert_eq!(other.probe().read_ioreg(0x26, Access::Bus), tcnt);
    }

    #[test]
    fn test_header_checks() {
        let mut dev = counting_device();
        let saved = dev.save_state().unwrap();

        assert!(matches!(dev.load_state(&saved[..5]), Err(StateError::Truncated)));

        let mut bad = saved.clone();
        bad[0] = b'X';
        assert!(matches!(dev.load_state(&bad), Err(StateError::BadMagic)));

        let mut bad = saved.clone();
        bad[4] = 9;
        assert!(matches!(dev.load_state(&bad), Err(StateError::Version { found: 9, expected: 2 })));

        let mut bad = saved.clone();
        bad[9] = b'X';
        assert!(matches!(dev.load_state(&bad), Err(StateError::DeviceMismatch { .. })));

        let mut bad = saved.clone();
        bad.truncate(bad.len() - 4);
        assert!(matches!(dev.load_state(&bad), Err(StateError::Inflate(_)) | Err(StateError::Codec(_))));
    }

    #[test]
    fn test_peripheral_set_must_match() {
        let dev = counting_device();
        let saved = dev.save_state().unwrap();
        let mut other = Device::new(DeviceConfig::atmega328(), vec![Box::new(Spi::new(SpiConfig::atmega328()))]).unwrap();
        assert!(matches!(other.load_state(&saved), Err(StateError::Layout(_))));
        assert_eq!(other.state(), DeviceState::Ready);
    }

    #[test]
    fn test_breakpoints_are_not_saved() {
        let mut dev = counting_device();
        dev.probe().attach();
        assert!(dev.probe().insert_breakpoint(0x50));
        let saved = dev.save_state().unwrap();

        let mut other = counting_device();
        other.load_state(&saved).unwrap();
        assert_eq!(other.probe().read_flash(0x50, 2), asm::ldi(16, 0x02).to_le_bytes().to_vec());

        // the probe keeps its own breakpoint across a load
        dev.load_state(&saved).unwrap();
        assert_eq!(dev.probe().read_flash(0x50, 2), BREAK_OPCODE.to_le_bytes().to_vec());
        dev.probe().remove_breakpoint(0x50);
        assert_eq!(dev.probe().read_flash(0x50, 2), asm::ldi(16, 0x02).to_le_bytes().to_vec());
    }
}
