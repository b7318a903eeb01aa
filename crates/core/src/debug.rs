//! Debug probe.
//!
//! [`DebugProbe`] is the inspection and control interface used by debugger
//! front ends and tests. It reads and writes every part of the device state
//! without going through the CPU, and manages breakpoints and watchpoints.
//!
//! Breakpoints patch a BREAK opcode into flash and keep the original word.
//! When the CPU fetches a patched BREAK with a probe attached, the device
//! enters the `Break` state with the PC on the breakpoint; the original
//! instruction is executed when the device is resumed.
//!
//! Watchpoints are checked on every CPU data access. A matching access
//! raises the probe signal (`SIGNAL`) and/or breaks the device after the
//! instruction completes (`BREAK`).

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::cpu::BREAK_OPCODE;
use crate::device::{Device, DeviceState, ResetFlags};
use crate::memory::{data_space_map, Area, DataRegion};
use crate::peripheral::CoreRequest;
use crate::signal::Signal;
use crate::types::{CycleCount, FlashAddr, MemAddr, RegAddr};

/// Signal ids of the probe signal. The index is the data address, the data
/// the value read or written.
pub mod sig {
    pub const READ: u16 = 0;
    pub const WRITE: u16 = 1;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFlags: u8 {
        const READ   = 0x01;
        const WRITE  = 0x02;
        /// Raise the probe signal on a match.
        const SIGNAL = 0x04;
        /// Break the device on a match.
        const BREAK  = 0x08;
    }
}

/// I/O register access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Through the register dispatch, like the CPU (owners are called).
    Bus,
    /// Stored value only, no side effects.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub addr: MemAddr,
    pub len: u16,
    pub flags: WatchFlags,
}

impl Watchpoint {
    fn covers(&self, addr: MemAddr) -> bool {
        addr >= self.addr && (addr as u32) < self.addr as u32 + self.len as u32
    }
}

#[derive(Debug, Default)]
pub(crate) struct DebugState {
    pub(crate) attached: bool,
    /// Original flash word of each breakpoint, by word address.
    pub(crate) breakpoints: BTreeMap<u32, u16>,
    pub(crate) watchpoints: Vec<Watchpoint>,
    /// Set when the device stopped on a breakpoint, so that the next fetch
    /// executes the original instruction.
    pub(crate) resume_from_break: bool,
    pub(crate) signal: Signal,
}

impl Device {
    /// Debug access to this device.
    pub fn probe(&mut self) -> DebugProbe<'_> {
        DebugProbe { dev: self }
    }

    /// Program flash bytes from `addr`, keeping breakpoints over the written
    /// words in place with their saved originals updated.
    pub(crate) fn program_flash(&mut self, addr: u32, bytes: &[u8]) -> usize {
        let Some(mem) = self.bus.nvm.get_mut(Area::Flash) else {
            return 0;
        };
        if bytes.is_empty() {
            return 0;
        }
        let words = addr / 2..=addr.saturating_add(bytes.len() as u32 - 1) / 2;
        let breakpoints = &mut self.debug.breakpoints;
        for (&word, &original) in breakpoints.range(words.clone()) {
            mem.program(&original.to_le_bytes(), word as usize * 2);
        }
        let n = mem.program(bytes, addr as usize);
        for (&word, original) in breakpoints.range_mut(words) {
            *original = mem.read_word(word as usize * 2);
            mem.program(&BREAK_OPCODE.to_le_bytes(), word as usize * 2);
        }
        n
    }

    pub(crate) fn check_watchpoint(&mut self, addr: MemAddr, value: u8, write: bool) {
        let kind = if write { WatchFlags::WRITE } else { WatchFlags::READ };
        let mut brk = false;
        for wp in self.debug.watchpoints.iter().filter(|w| w.flags.contains(kind) && w.covers(addr)) {
            if wp.flags.contains(WatchFlags::SIGNAL) {
                let sigid = if write { sig::WRITE } else { sig::READ };
                self.debug.signal.raise(sigid, addr as i64, value);
            }
            brk |= wp.flags.contains(WatchFlags::BREAK);
        }
        if brk {
            tracing::debug!(parent: &self.bus.span, "watchpoint hit at {:#06x}", addr);
            self.bus.requests.push_back(CoreRequest::Break);
        }
    }
}

pub struct DebugProbe<'a> {
    dev: &'a mut Device,
}

impl<'a> DebugProbe<'a> {
    /// Enable BREAK handling and watchpoint breaks.
    pub fn attach(&mut self) {
        self.dev.debug.attached = true;
        tracing::debug!(parent: &self.dev.bus.span, "probe attached");
    }

    /// Disable the probe, removing every breakpoint and watchpoint.
    pub fn detach(&mut self) {
        let words: Vec<u32> = self.dev.debug.breakpoints.keys().copied().collect();
        for w in words {
            self.remove_breakpoint(w * 2);
        }
        self.dev.debug.watchpoints.clear();
        self.dev.debug.attached = false;
        tracing::debug!(parent: &self.dev.bus.span, "probe detached");
    }

    pub fn is_attached(&self) -> bool {
        self.dev.debug.attached
    }

    /// Signal raised by watchpoints with `SIGNAL` set.
    pub fn signal(&self) -> &Signal {
        &self.dev.debug.signal
    }

    pub fn cycle(&self) -> CycleCount {
        self.dev.cycle()
    }

    pub fn state(&self) -> DeviceState {
        self.dev.state()
    }

    // --- Core registers ---

    pub fn read_gpreg(&self, n: usize) -> u8 {
        self.dev.core.regs[n & 31]
    }

    pub fn write_gpreg(&mut self, n: usize, value: u8) {
        self.dev.core.regs[n & 31] = value;
    }

    pub fn read_sreg(&self) -> u8 {
        self.dev.core.sreg
    }

    pub fn write_sreg(&mut self, value: u8) {
        self.dev.core.sreg = value;
    }

    pub fn read_sp(&self) -> u16 {
        self.dev.core.sp
    }

    pub fn write_sp(&mut self, value: u16) {
        self.dev.core.sp = value;
    }

    /// Program counter, word address.
    pub fn read_pc(&self) -> u32 {
        self.dev.core.pc
    }

    pub fn write_pc(&mut self, pc: u32) {
        self.dev.core.pc = pc;
        self.dev.debug.resume_from_break = false;
    }

    // --- I/O registers ---

    /// Read I/O register `addr`. Unmapped registers read 0 and leave the
    /// device untouched.
    pub fn read_ioreg(&mut self, addr: RegAddr, access: Access) -> u8 {
        if !self.dev.io_mapped(addr) {
            return 0;
        }
        match access {
            Access::Raw => self.dev.io_raw_read(addr).unwrap_or(0),
            Access::Bus => {
                let v = self.dev.io_read(addr);
                self.dev.flush_events();
                v
            }
        }
    }

    /// Write I/O register `addr`. Returns false for an unmapped register.
    pub fn write_ioreg(&mut self, addr: RegAddr, value: u8, access: Access) -> bool {
        if !self.dev.io_mapped(addr) {
            return false;
        }
        match access {
            Access::Raw => self.dev.io_raw_write(addr, value),
            Access::Bus => {
                self.dev.io_write(addr, value);
                self.dev.flush_events();
                true
            }
        }
    }

    // --- Memories ---

    /// Flash bytes from `addr`, clamped to the flash size.
    pub fn read_flash(&self, addr: FlashAddr, len: usize) -> Vec<u8> {
        self.read_nvm(Area::Flash, addr, len).unwrap_or_default()
    }

    /// Program flash bytes at `addr`. Returns the count actually written.
    pub fn write_flash(&mut self, addr: FlashAddr, bytes: &[u8]) -> usize {
        self.write_nvm(Area::Flash, addr, bytes)
    }

    /// Program bytes of an NVM area. Returns the count written, 0 if the
    /// device has no such area.
    ///
    /// Breakpoints over written flash stay in place and resume into the new
    /// content.
    pub fn write_nvm(&mut self, area: Area, addr: u32, bytes: &[u8]) -> usize {
        if area == Area::Flash {
            return self.dev.program_flash(addr, bytes);
        }
        self.dev.bus.nvm.get_mut(area).map_or(0, |mem| mem.program(bytes, addr as usize))
    }

    /// Bytes of an NVM area, `None` if the device has no such area.
    pub fn read_nvm(&self, area: Area, addr: u32, len: usize) -> Option<Vec<u8>> {
        self.dev.bus.nvm.get(area).map(|m| m.block(addr as usize, len).buf)
    }

    /// Data space bytes from `addr`. I/O registers are read raw, unmapped
    /// addresses read 0.
    pub fn read_data(&self, addr: MemAddr, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let a = addr.wrapping_add(i as MemAddr);
                match data_space_map(&self.dev.layout, a) {
                    DataRegion::Register(r) => self.dev.core.regs[r as usize],
                    DataRegion::Io(io) => self.dev.io_raw_read(io).unwrap_or(0),
                    DataRegion::Sram(off) => self.dev.core.sram[off],
                    DataRegion::Unmapped => 0,
                }
            })
            .collect()
    }

    /// Write data space bytes, I/O registers raw. Unmapped bytes are dropped.
    pub fn write_data(&mut self, addr: MemAddr, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let a = addr.wrapping_add(i as MemAddr);
            match data_space_map(&self.dev.layout, a) {
                DataRegion::Register(r) => self.dev.core.regs[r as usize] = b,
                DataRegion::Io(io) => {
                    self.dev.io_raw_write(io, b);
                }
                DataRegion::Sram(off) => self.dev.core.sram[off] = b,
                DataRegion::Unmapped => {}
            }
        }
    }

    /// Hex and ASCII dump of data space, 16 bytes per line.
    pub fn dump_ram(&self, start: MemAddr, len: usize) -> String {
        let data = self.read_data(start, len);
        let mut s = String::new();
        for (n, line) in data.chunks(16).enumerate() {
            s.push_str(&format!("{:04X}: ", start as usize + n * 16));
            for i in 0..16 {
                match line.get(i) {
                    Some(b) => s.push_str(&format!("{:02X} ", b)),
                    None => s.push_str("   "),
                }
                if i == 7 {
                    s.push(' ');
                }
            }
            s.push(' ');
            s.extend(line.iter().map(|&c| if (0x20..0x7F).contains(&c) { c as char } else { '.' }));
            s.push('\n');
        }
        s
    }

    // --- Breakpoints ---

    /// Set a breakpoint at flash byte address `addr`. Returns false if the
    /// address is odd or beyond the flash.
    pub fn insert_breakpoint(&mut self, addr: FlashAddr) -> bool {
        if addr % 2 != 0 || addr as usize + 1 >= self.dev.config.core.flash_size() {
            return false;
        }
        let word = addr / 2;
        if self.dev.debug.breakpoints.contains_key(&word) {
            return true;
        }
        let Some(flash) = self.dev.bus.nvm.get_mut(Area::Flash) else {
            return false;
        };
        let original = flash.read_word(addr as usize);
        flash.program(&BREAK_OPCODE.to_le_bytes(), addr as usize);
        self.dev.debug.breakpoints.insert(word, original);
        tracing::debug!(parent: &self.dev.bus.span, "breakpoint set at {:#07x}", addr);
        true
    }

    /// Remove a breakpoint and restore the original word.
    pub fn remove_breakpoint(&mut self, addr: FlashAddr) -> bool {
        let Some(original) = self.dev.debug.breakpoints.remove(&(addr / 2)) else {
            return false;
        };
        if let Some(flash) = self.dev.bus.nvm.get_mut(Area::Flash) {
            flash.program(&original.to_le_bytes(), addr as usize);
        }
        true
    }

    pub fn breakpoints(&self) -> Vec<FlashAddr> {
        self.dev.debug.breakpoints.keys().map(|w| w * 2).collect()
    }

    // --- Watchpoints ---

    /// Watch `len` bytes of data space from `addr`. Flags are merged into an
    /// existing watchpoint on the same range.
    pub fn insert_watchpoint(&mut self, addr: MemAddr, len: u16, flags: WatchFlags) {
        let wps = &mut self.dev.debug.watchpoints;
        match wps.iter_mut().find(|w| w.addr == addr && w.len == len) {
            Some(w) => w.flags |= flags,
            None => wps.push(Watchpoint { addr, len, flags }),
        }
    }

    /// Clear `flags` from the watchpoints starting at `addr`. Watchpoints
    /// left without READ or WRITE are removed.
    pub fn remove_watchpoint(&mut self, addr: MemAddr, flags: WatchFlags) {
        let wps = &mut self.dev.debug.watchpoints;
        for w in wps.iter_mut().filter(|w| w.addr == addr) {
            w.flags.remove(flags);
        }
        wps.retain(|w| w.flags.intersects(WatchFlags::READ | WatchFlags::WRITE));
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.dev.debug.watchpoints
    }

    // --- Device control ---

    pub fn reset_device(&mut self) {
        self.dev.reset(ResetFlags::EXTERNAL);
    }

    /// Force the device state, typically `Running` to resume from `Break`.
    pub fn set_device_state(&mut self, state: DeviceState) {
        self.dev.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::peripherals::testutil::{self, asm, Stub};
    use crate::signal::SignalRecorder;
    use crate::types::{ctl_id, VarData};

    #[test]
    fn test_raw_and_bus_reads() {
        let stub = Stub::new(ctl_id(b"STUB")).with_reg(0x05, 0xFF, 0).counting_reads();
        let mut dev = testutil::device_with(&[asm::NOP], vec![Box::new(stub)]);
        let mut probe = dev.probe();
        assert_eq!(probe.read_ioreg(0x05, Access::Bus), 1);
        assert_eq!(probe.read_ioreg(0x05, Access::Bus), 2);
        assert_eq!(probe.read_ioreg(0x05, Access::Raw), 2);
        assert_eq!(probe.read_ioreg(0x05, Access::Raw), 2);
        assert!(probe.write_ioreg(0x05, 0x40, Access::Raw));
        assert_eq!(probe.read_ioreg(0x05, Access::Bus), 0x41);
        assert!(!probe.write_ioreg(0x01, 0, Access::Raw));
    }

    #[test]
    fn test_unmapped_register_access_leaves_device_alone() {
        let mut dev = testutil::device_with(&[asm::NOP], Vec::new());
        let mut probe = dev.probe();
        assert_eq!(probe.read_ioreg(0x01, Access::Bus), 0);
        assert!(!probe.write_ioreg(0x01, 0x55, Access::Bus));
        assert_eq!(dev.state(), DeviceState::Running);
        assert!(dev.crash_info().is_none());
    }

    #[test]
    fn test_flash_write_under_breakpoint() {
        let mut dev = testutil::device_with(&[asm::NOP, asm::NOP, asm::ldi(16, 7), asm::NOP], Vec::new());
        let mut probe = dev.probe();
        probe.attach();
        probe.insert_breakpoint(4);
        // odd address, high byte only: LDI r16,7 becomes LDI r16,0x17
        assert_eq!(probe.write_flash(5, &[0xE1]), 1);
        assert_eq!(probe.read_flash(4, 2), BREAK_OPCODE.to_le_bytes().to_vec());
        assert!(probe.remove_breakpoint(4));
        assert_eq!(probe.read_flash(4, 2), asm::ldi(16, 0x17).to_le_bytes().to_vec());

        probe.insert_breakpoint(4);
        probe.write_flash(4, &asm::ldi(16, 9).to_le_bytes());
        dev.step();
        dev.step();
        assert_eq!(dev.step(), DeviceState::Break);
        dev.probe().set_device_state(DeviceState::Running);
        dev.step();
        assert_eq!(dev.core().regs[16], 9);
    }

    #[test]
    fn test_firmware_round_trip() {
        let mut fw = testutil::firmware(&[0x1234, 0x5678]);
        fw.add_block(Area::Eeprom, 0x10, &[0xAA, 0xBB]);
        fw.add_block(Area::Fuses, 0, &[0x11]);
        let mut dev = Device::new(DeviceConfig::atmega328(), Vec::new()).unwrap();
        dev.load_firmware(&fw).unwrap();
        let probe = dev.probe();
        assert_eq!(probe.read_flash(0, 4), vec![0x34, 0x12, 0x78, 0x56]);
        assert_eq!(probe.read_nvm(Area::Eeprom, 0x10, 2), Some(vec![0xAA, 0xBB]));
        assert_eq!(probe.read_nvm(Area::Eeprom, 0x12, 1), Some(vec![0xFF]));
        assert_eq!(probe.read_nvm(Area::Fuses, 0, 3), Some(vec![0x11, 0xD9, 0xFF]));
        assert_eq!(probe.read_nvm(Area::UserRow, 0, 1), None);
        // clamped
        assert_eq!(probe.read_flash(0x7FFE, 8).len(), 2);
    }

    #[test]
    fn test_breakpoint_stops_and_resumes() {
        let mut dev = testutil::device_with(&[asm::NOP, asm::NOP, asm::ldi(16, 7), asm::NOP], Vec::new());
        {
            let mut probe = dev.probe();
            probe.attach();
            assert!(probe.insert_breakpoint(4));
            assert!(!probe.insert_breakpoint(5));
            assert_eq!(probe.read_flash(4, 2), BREAK_OPCODE.to_le_bytes().to_vec());
        }
        dev.step();
        dev.step();
        assert_eq!(dev.step(), DeviceState::Break);
        assert_eq!(dev.core().pc, 2);
        assert_eq!(dev.core().regs[16], 0);

        dev.probe().set_device_state(DeviceState::Running);
        dev.step();
        assert_eq!(dev.core().pc, 3);
        assert_eq!(dev.core().regs[16], 7);

        let mut probe = dev.probe();
        assert!(probe.remove_breakpoint(4));
        assert_eq!(probe.read_flash(4, 2), asm::ldi(16, 7).to_le_bytes().to_vec());
        assert!(!probe.remove_breakpoint(4));
    }

    #[test]
    fn test_break_opcode_detached_is_nop() {
        let mut dev = testutil::device_with(&[asm::BREAK, asm::NOP], Vec::new());
        assert_eq!(dev.step(), DeviceState::Running);
        assert_eq!(dev.core().pc, 1);
    }

    #[test]
    fn test_detach_restores_flash() {
        let mut dev = testutil::device_with(&[asm::NOP, asm::NOP], Vec::new());
        let mut probe = dev.probe();
        probe.attach();
        probe.insert_breakpoint(2);
        probe.detach();
        assert!(probe.breakpoints().is_empty());
        assert_eq!(probe.read_flash(2, 2), vec![0, 0]);
        assert!(!probe.is_attached());
    }

    #[test]
    fn test_write_watchpoint_signals_and_breaks() {
        let [sts0, sts1] = asm::sts(0x0100, 16);
        let mut dev = testutil::device_with(&[asm::ldi(16, 0x55), sts0, sts1, asm::NOP], Vec::new());
        let rec = SignalRecorder::new();
        {
            let mut probe = dev.probe();
            probe.attach();
            probe.signal().connect(rec.clone(), 0);
            probe.insert_watchpoint(0x0100, 1, WatchFlags::WRITE | WatchFlags::SIGNAL);
            probe.insert_watchpoint(0x0100, 1, WatchFlags::BREAK);
            assert_eq!(probe.watchpoints().len(), 1);
        }
        dev.step();
        assert_eq!(dev.step(), DeviceState::Break);
        assert_eq!(dev.core().pc, 3);
        let hit = rec.last().unwrap();
        assert_eq!(hit.sigid, sig::WRITE);
        assert_eq!(hit.index, 0x0100);
        assert_eq!(hit.data, VarData::Uint(0x55));

        let mut probe = dev.probe();
        probe.remove_watchpoint(0x0100, WatchFlags::WRITE);
        assert!(probe.watchpoints().is_empty());
    }

    #[test]
    fn test_registers_and_data_access() {
        let mut dev = testutil::device_with(&[asm::NOP], Vec::new());
        let mut probe = dev.probe();
        probe.write_gpreg(3, 0x42);
        probe.write_sp(0x0800);
        probe.write_sreg(0x80);
        probe.write_pc(0x10);
        assert_eq!(probe.read_data(3, 1), vec![0x42]);
        // SPL, SPH, SREG through the data space
        assert_eq!(probe.read_data(0x5D, 3), vec![0x00, 0x08, 0x80]);
        probe.write_data(0x100, b"AVR!");
        assert_eq!(probe.read_data(0x100, 4), b"AVR!".to_vec());
        assert_eq!(probe.read_pc(), 0x10);

        let dump = probe.dump_ram(0x100, 16);
        assert!(dump.starts_with("0100: 41 56 52 21"));
        assert!(dump.contains("AVR!"));
    }

    #[test]
    fn test_reset_device() {
        let mut dev = testutil::device_with(&[asm::NOP; 4], Vec::new());
        dev.step();
        dev.probe().reset_device();
        assert_eq!(dev.core().pc, 0);
        assert_eq!(dev.state(), DeviceState::Running);
    }
}
