//! SPI controller, master mode.
//!
//! Writing SPDR with SPE and MSTR set shifts the byte out over `8 * div`
//! cycles, `div` being the SCK prescaler. When the transfer completes the
//! byte received on MISO is available in SPDR and SPIF is set. Received bytes
//! come from a queue filled by the host with [`req::SPI_PUSH_MISO`]; an empty
//! queue shifts in 0xFF.
//!
//! SPIF and WCOL are cleared by reading SPSR with SPIF set then accessing
//! SPDR, or by entering the interrupt vector.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptFlag;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{req, CtlReqData, Ctx, Peripheral};
use crate::signal::Signal;
use crate::types::{spi_id, CtlId, CycleCount, RegAddr, RegBit, VarData, VectorIndex};

/// Signal ids of the SPI signal.
pub mod sig {
    /// Transfer started; data = byte shifted out.
    pub const TRANSMIT: u16 = 0;
    /// Transfer done; data = byte shifted in.
    pub const RECEIVE: u16 = 1;
}

const SPE: u8 = 1 << 6;
const MSTR: u8 = 1 << 4;
const SPIF: u8 = 1 << 7;
const WCOL: u8 = 1 << 6;
const SPI2X: u8 = 1 << 0;

/// SCK division factors selected by SPR1:0.
const DIVIDERS: [u64; 4] = [4, 16, 64, 128];

#[derive(Debug, Clone)]
pub struct SpiConfig {
    pub index: char,
    pub spcr: RegAddr,
    pub spsr: RegAddr,
    pub spdr: RegAddr,
    pub vector: VectorIndex,
}

impl SpiConfig {
    pub fn atmega328() -> Self {
        SpiConfig { index: '0', spcr: 0x2C, spsr: 0x2D, spdr: 0x2E, vector: 17 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SpiState {
    busy: bool,
    /// Byte being shifted out.
    tx: u8,
    /// Receive buffer, what SPDR reads.
    rx: u8,
    /// SPSR was read with SPIF set.
    spsr_read: bool,
    miso: VecDeque<u8>,
}

pub struct Spi {
    config: SpiConfig,
    state: SpiState,
    timer: Option<TimerId>,
    spif: InterruptFlag,
    signal: Signal,
}

impl Spi {
    pub fn new(config: SpiConfig) -> Self {
        let spif = InterruptFlag::new(config.vector, RegBit::bit(config.spcr, 7), RegBit::bit(config.spsr, 7), true);
        Spi { config, state: SpiState::default(), timer: None, spif, signal: Signal::new() }
    }

    /// Transfer duration in CPU cycles.
    fn transfer_cycles(&self, ctx: &Ctx) -> CycleCount {
        let spcr = ctx.read_ioreg(self.config.spcr);
        let spsr = ctx.read_ioreg(self.config.spsr);
        let mut div = DIVIDERS[(spcr & 0x03) as usize];
        if spsr & SPI2X != 0 {
            div /= 2;
        }
        8 * div
    }

    /// Second half of the flag clearing sequence, on an SPDR access.
    fn spdr_access(&mut self, ctx: &mut Ctx) {
        if std::mem::take(&mut self.state.spsr_read) {
            let spsr = ctx.read_ioreg(self.config.spsr);
            ctx.write_ioreg(self.config.spsr, spsr & !WCOL);
            self.spif.clear_flag(1, ctx);
        }
    }
}

impl Peripheral for Spi {
    fn id(&self) -> CtlId {
        spi_id(self.config.index)
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        ctx.add_ioreg_mask(self.config.spcr, 0xFF, 0)?;
        ctx.add_ioreg_mask(self.config.spsr, SPIF | WCOL | SPI2X, SPIF | WCOL)?;
        ctx.add_ioreg_mask(self.config.spdr, 0xFF, 0)?;
        self.spif.init(ctx)?;
        self.timer = Some(ctx.new_timer());
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut Ctx) {
        // queued MISO bytes are host input and survive a reset
        let miso = std::mem::take(&mut self.state.miso);
        self.state = SpiState { miso, ..SpiState::default() };
        self.spif.reset();
    }

    fn ioreg_read(&mut self, addr: RegAddr, value: u8, ctx: &mut Ctx) -> u8 {
        if addr == self.config.spsr {
            if value & SPIF != 0 {
                self.state.spsr_read = true;
            }
        } else if addr == self.config.spdr {
            self.spdr_access(ctx);
            return self.state.rx;
        }
        value
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        if addr == self.config.spcr {
            self.spif.update_from_ioreg(ctx);
            if write.negedge & SPE != 0 && self.state.busy {
                if let Some(timer) = self.timer {
                    ctx.cancel(timer);
                }
                self.state.busy = false;
                tracing::debug!(parent: ctx.span(), "spi: disabled during transfer");
            }
            return;
        }
        if addr != self.config.spdr {
            return;
        }

        self.spdr_access(ctx);
        ctx.write_ioreg(addr, self.state.rx);
        if self.state.busy {
            let spsr = ctx.read_ioreg(self.config.spsr);
            ctx.write_ioreg(self.config.spsr, spsr | WCOL);
            tracing::debug!(parent: ctx.span(), "spi: write collision");
            return;
        }
        let spcr = ctx.read_ioreg(self.config.spcr);
        if spcr & (SPE | MSTR) != SPE | MSTR {
            return;
        }
        let Some(timer) = self.timer else { return };
        self.state.busy = true;
        self.state.tx = write.value;
        let cycles = self.transfer_cycles(ctx);
        ctx.schedule(timer, cycles);
        tracing::trace!(parent: ctx.span(), "spi: transmit {:#04x}, {} cycles", write.value, cycles);
        self.signal.raise(sig::TRANSMIT, 0, write.value);
    }

    fn timer_fired(&mut self, _timer: TimerId, _when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        if !self.state.busy {
            return None;
        }
        self.state.busy = false;
        let rx = self.state.miso.pop_front().unwrap_or(0xFF);
        self.state.rx = rx;
        ctx.write_ioreg(self.config.spdr, rx);
        self.spif.set_flag(1, ctx);
        self.signal.raise(sig::RECEIVE, 0, rx);
        None
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        self.spif.interrupt_ack(vector, ctx);
        self.state.spsr_read = false;
    }

    fn ctlreq(&mut self, req: u16, data: &mut CtlReqData, _ctx: &mut Ctx) -> bool {
        match req {
            req::GET_SIGNAL => {
                data.data = VarData::Signal(self.signal.clone());
                true
            }
            req::SPI_PUSH_MISO => {
                match &data.data {
                    VarData::Bytes(bytes) => self.state.miso.extend(bytes.iter().copied()),
                    other => self.state.miso.push_back(other.as_uint() as u8),
                }
                true
            }
            _ => false,
        }
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(&self.state, &self.spif))?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (state, spif) = bincode::deserialize(data)?;
        self.state = state;
        self.spif = spif;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::Access;
    use crate::device::Device;
    use crate::peripherals::testutil::{self, asm};
    use crate::signal::SignalRecorder;

    fn spi_device() -> Device {
        let mut prog = vec![asm::NOP; 200];
        prog.push(asm::rjmp(-1));
        testutil::device_with(&prog, vec![Box::new(Spi::new(SpiConfig::atmega328()))])
    }

    fn run_for(dev: &mut Device, cycles: CycleCount) {
        let end = dev.cycle() + cycles;
        while dev.cycle() < end {
            dev.step();
        }
    }

    fn push_miso(dev: &mut Device, byte: u8) {
        let mut data = CtlReqData::new(0, byte);
        assert!(dev.ctlreq(spi_id('0'), req::SPI_PUSH_MISO, &mut data));
    }

    #[test]
    fn test_master_transfer_exchanges_bytes() {
        let mut dev = spi_device();
        let rec = SignalRecorder::new();
        dev.signal_of(spi_id('0')).unwrap().connect(rec.clone(), 0);
        push_miso(&mut dev, 0x5A);

        // SPE | MSTR, fosc/4: 32 cycles per byte
        dev.probe().write_ioreg(0x2C, 0x50, Access::Bus);
        dev.probe().write_ioreg(0x2E, 0xA5, Access::Bus);
        assert_eq!(rec.last().map(|d| (d.sigid, d.data.as_uint())), Some((sig::TRANSMIT, 0xA5)));

        run_for(&mut dev, 30);
        assert_eq!(dev.probe().read_ioreg(0x2D, Access::Raw) & SPIF, 0);
        run_for(&mut dev, 4);
        assert_ne!(dev.probe().read_ioreg(0x2D, Access::Raw) & SPIF, 0);
        assert_eq!(dev.probe().read_ioreg(0x2E, Access::Raw), 0x5A);
        assert_eq!(rec.last().map(|d| (d.sigid, d.data.as_uint())), Some((sig::RECEIVE, 0x5A)));

        // empty queue shifts in 0xFF
        dev.probe().write_ioreg(0x2E, 0x00, Access::Bus);
        run_for(&mut dev, 40);
        assert_eq!(dev.probe().read_ioreg(0x2E, Access::Raw), 0xFF);
    }

    #[test]
    fn test_flag_cleared_by_status_then_data_access() {
        let mut dev = spi_device();
        // SPI2X halves the transfer to 16 cycles
        dev.probe().write_ioreg(0x2C, 0x50, Access::Bus);
        dev.probe().write_ioreg(0x2D, 0x01, Access::Bus);
        dev.probe().write_ioreg(0x2E, 0x11, Access::Bus);
        run_for(&mut dev, 20);
        assert_ne!(dev.probe().read_ioreg(0x2D, Access::Raw) & SPIF, 0);

        // SPDR access alone does not clear SPIF
        dev.probe().read_ioreg(0x2E, Access::Bus);
        assert_ne!(dev.probe().read_ioreg(0x2D, Access::Raw) & SPIF, 0);

        assert_ne!(dev.probe().read_ioreg(0x2D, Access::Bus) & SPIF, 0);
        assert_eq!(dev.probe().read_ioreg(0x2E, Access::Bus), 0xFF);
        assert_eq!(dev.probe().read_ioreg(0x2D, Access::Raw), SPI2X);
    }

    #[test]
    fn test_write_during_transfer_collides() {
        let mut dev = spi_device();
        dev.probe().write_ioreg(0x2C, 0x53, Access::Bus);
        dev.probe().write_ioreg(0x2E, 0x01, Access::Bus);
        run_for(&mut dev, 10);
        dev.probe().write_ioreg(0x2E, 0x02, Access::Bus);
        assert_eq!(dev.probe().read_ioreg(0x2D, Access::Raw) & WCOL, WCOL);
        // fosc/128: the first transfer still completes on time
        run_for(&mut dev, 8 * 128);
        assert_ne!(dev.probe().read_ioreg(0x2D, Access::Raw) & SPIF, 0);
    }

    #[test]
    fn test_slave_mode_does_not_transfer() {
        let mut dev = spi_device();
        dev.probe().write_ioreg(0x2C, 0x40, Access::Bus);
        dev.probe().write_ioreg(0x2E, 0x33, Access::Bus);
        assert_eq!(dev.next_timer_when(), None);
    }

    #[test]
    fn test_push_bytes_and_state_round_trip() {
        let mut dev = spi_device();
        push_miso(&mut dev, 1);
        let mut data = CtlReqData::new(0, VarData::Bytes(vec![2, 3]));
        assert!(dev.ctlreq(spi_id('0'), req::SPI_PUSH_MISO, &mut data));
        dev.probe().write_ioreg(0x2C, 0x50, Access::Bus);
        for expected in [1, 2, 3, 0xFF] {
            dev.probe().write_ioreg(0x2E, 0x00, Access::Bus);
            run_for(&mut dev, 40);
            assert_eq!(dev.probe().read_ioreg(0x2E, Access::Raw), expected);
        }

        let mut spi = Spi::new(SpiConfig::atmega328());
        spi.state.miso.extend([1, 2, 3]);
        spi.state.rx = 0x42;
        let blob = spi.save_state().unwrap();
        let mut other = Spi::new(SpiConfig::atmega328());
        other.load_state(&blob).unwrap();
        assert_eq!(other.state.miso, VecDeque::from(vec![1, 2, 3]));
        assert_eq!(other.state.rx, 0x42);
    }
}
