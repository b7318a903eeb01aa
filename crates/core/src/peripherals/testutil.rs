//! Helpers shared by the unit tests: a configurable stub peripheral, a few
//! instruction encoders and ready-to-run devices.

use std::sync::{Arc, Mutex};

use crate::config::DeviceConfig;
use crate::cycle::TimerId;
use crate::device::{Device, ResetFlags};
use crate::error::ConfigError;
use crate::firmware::Firmware;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{CoreRequest, Ctx, Peripheral};
use crate::sleep::SleepMode;
use crate::types::{CtlId, CycleCount, RegAddr, VectorIndex};

/// Instruction encoders.
pub mod asm {
    pub const NOP: u16 = 0x0000;
    pub const SEI: u16 = 0x9478;
    pub const CLI: u16 = 0x94F8;
    pub const SLEEP: u16 = 0x9588;
    pub const BREAK: u16 = 0x9598;
    pub const RETI: u16 = 0x9518;

    pub fn rjmp(k: i16) -> u16 {
        0xC000 | (k as u16 & 0x0FFF)
    }

    pub fn ldi(d: u8, k: u8) -> u16 {
        0xE000 | ((k as u16 & 0xF0) << 4) | (((d - 16) as u16) << 4) | (k as u16 & 0x0F)
    }

    pub fn mov(d: u8, r: u8) -> u16 {
        0x2C00 | ((r as u16 & 0x10) << 5) | ((d as u16) << 4) | (r as u16 & 0x0F)
    }

    pub fn out(a: u8, r: u8) -> u16 {
        0xB800 | ((a as u16 & 0x30) << 5) | ((r as u16) << 4) | (a as u16 & 0x0F)
    }

    pub fn in_(d: u8, a: u8) -> u16 {
        0xB000 | ((a as u16 & 0x30) << 5) | ((d as u16) << 4) | (a as u16 & 0x0F)
    }

    pub fn sts(k: u16, r: u8) -> [u16; 2] {
        [0x9200 | ((r as u16) << 4), k]
    }

    pub fn lds(d: u8, k: u16) -> [u16; 2] {
        [0x9000 | ((d as u16) << 4), k]
    }
}

/// What a [`Stub`] saw, shared with the test.
#[derive(Debug, Default)]
pub struct StubLog {
    pub updates: usize,
    pub fired: Vec<CycleCount>,
    pub writes: Vec<IoRegWrite>,
    pub reads: usize,
    pub acks: Vec<VectorIndex>,
    pub sleeps: Vec<(bool, SleepMode)>,
    pub reset_flags: Vec<ResetFlags>,
    /// Queued by the test, sent to the core on the next update.
    pub requests: Vec<CoreRequest>,
}

/// Peripheral recording every callback.
pub struct Stub {
    id: CtlId,
    vectors: Vec<VectorIndex>,
    regs: Vec<(RegAddr, u8, u8)>,
    period: Option<CycleCount>,
    timer: Option<TimerId>,
    count_reads: bool,
    log: Arc<Mutex<StubLog>>,
}

impl Stub {
    pub fn new(id: CtlId) -> Self {
        Stub {
            id,
            vectors: Vec::new(),
            regs: Vec::new(),
            period: None,
            timer: None,
            count_reads: false,
            log: Arc::default(),
        }
    }

    pub fn with_vectors(mut self, vectors: &[VectorIndex]) -> Self {
        self.vectors = vectors.to_vec();
        self
    }

    /// Own register `addr` with the given use and read-only masks.
    pub fn with_reg(mut self, addr: RegAddr, mask: u8, ro: u8) -> Self {
        self.regs.push((addr, mask, ro));
        self
    }

    /// Fire a timer every `period` cycles from reset.
    pub fn with_period(mut self, period: CycleCount) -> Self {
        self.period = Some(period);
        self
    }

    /// Increment owned registers on every CPU read.
    pub fn counting_reads(mut self) -> Self {
        self.count_reads = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<StubLog>> {
        self.log.clone()
    }
}

impl Peripheral for Stub {
    fn id(&self) -> CtlId {
        self.id
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        for &v in &self.vectors {
            ctx.register_interrupt(v)?;
        }
        for &(addr, mask, ro) in &self.regs {
            ctx.add_ioreg_mask(addr, mask, ro)?;
        }
        if self.period.is_some() {
            self.timer = Some(ctx.new_timer());
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        self.log.lock().unwrap().reset_flags.push(ctx.reset_flags());
        if let (Some(t), Some(p)) = (self.timer, self.period) {
            ctx.schedule(t, p);
        }
    }

    fn ioreg_read(&mut self, _addr: RegAddr, value: u8, _ctx: &mut Ctx) -> u8 {
        self.log.lock().unwrap().reads += 1;
        if self.count_reads {
            value.wrapping_add(1)
        } else {
            value
        }
    }

    fn ioreg_write(&mut self, _addr: RegAddr, write: IoRegWrite, _ctx: &mut Ctx) {
        self.log.lock().unwrap().writes.push(write);
    }

    fn update(&mut self, ctx: &mut Ctx) {
        let mut log = self.log.lock().unwrap();
        log.updates += 1;
        for r in log.requests.drain(..) {
            ctx.request(r);
        }
    }

    fn sleep(&mut self, on: bool, mode: SleepMode, _ctx: &mut Ctx) {
        self.log.lock().unwrap().sleeps.push((on, mode));
    }

    fn timer_fired(&mut self, _timer: TimerId, when: CycleCount, _ctx: &mut Ctx) -> Option<CycleCount> {
        self.log.lock().unwrap().fired.push(when);
        self.period
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, _ctx: &mut Ctx) {
        self.log.lock().unwrap().acks.push(vector);
    }
}

/// Flash image of `words` at 16 MHz.
pub fn firmware(words: &[u16]) -> Firmware {
    let mut fw = Firmware::from_words(words);
    fw.frequency = 16_000_000;
    fw
}

/// ATmega328 running `words` with the given peripherals.
pub fn device_with(words: &[u16], peripherals: Vec<Box<dyn Peripheral>>) -> Device {
    let mut dev = Device::new(DeviceConfig::atmega328(), peripherals).unwrap();
    dev.load_firmware(&firmware(words)).unwrap();
    dev
}
