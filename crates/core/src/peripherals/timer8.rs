//! 8-bit Timer/Counter.
//!
//! Normal, CTC and Fast PWM counting with the classic prescaler tables
//! (clk/1/8/64/256/1024, or the extended table of the asynchronous timer).
//! Overflow and compare-match flags raise their interrupts through
//! [`InterruptFlag`]s.
//!
//! Nothing runs per cycle: the counter value is derived from the cycle at
//! which it was last known, and a cycle timer is scheduled on the next
//! tick where a flag can change (compare A, compare B or wrap to 0).
//! Reading TCNT computes the live count, writing it restarts the count.
//!
//! Output compare pins are not driven.

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptFlag;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{find_reg_config, Ctx, Peripheral, RegConfig};
use crate::types::{timer_id, CtlId, CycleCount, RegAddr, RegBit, VectorIndex};

/// Clock select entry: CS field value and clock divider (0 = stopped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSelect {
    pub reg_value: u8,
    pub div: u64,
}

impl RegConfig for ClockSelect {
    fn reg_value(&self) -> u8 {
        self.reg_value
    }
}

#[derive(Debug, Clone)]
pub struct Timer8Config {
    /// Timer index, '0' or '2'.
    pub index: char,
    pub tccr_a: RegAddr,
    pub tccr_b: RegAddr,
    pub tcnt: RegAddr,
    pub ocr_a: RegAddr,
    pub ocr_b: RegAddr,
    pub timsk: RegAddr,
    pub tifr: RegAddr,
    pub clocks: Vec<ClockSelect>,
    pub vector_ovf: VectorIndex,
    pub vector_compa: VectorIndex,
    pub vector_compb: VectorIndex,
}

fn clocks(divs: &[u64]) -> Vec<ClockSelect> {
    divs.iter().enumerate().map(|(i, &div)| ClockSelect { reg_value: i as u8, div }).collect()
}

impl Timer8Config {
    /// Timer/Counter0 of the ATmega328.
    pub fn atmega328_timer0() -> Self {
        Timer8Config {
            index: '0',
            tccr_a: 0x24,
            tccr_b: 0x25,
            tcnt: 0x26,
            ocr_a: 0x27,
            ocr_b: 0x28,
            timsk: 0x4E,
            tifr: 0x15,
            // CS 6 and 7 select the external T0 pin, not emulated
            clocks: clocks(&[0, 1, 8, 64, 256, 1024]),
            vector_ovf: 16,
            vector_compa: 14,
            vector_compb: 15,
        }
    }

    /// Timer/Counter2 of the ATmega328, clocked from the system clock.
    pub fn atmega328_timer2() -> Self {
        Timer8Config {
            index: '2',
            tccr_a: 0x90,
            tccr_b: 0x91,
            tcnt: 0x92,
            ocr_a: 0x93,
            ocr_b: 0x94,
            timsk: 0x50,
            tifr: 0x17,
            clocks: clocks(&[0, 1, 8, 32, 64, 128, 256, 1024]),
            vector_ovf: 9,
            vector_compa: 7,
            vector_compb: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
enum WaveMode {
    #[default]
    Normal,
    Ctc,
    /// Fast PWM, TOP = 0xFF or OCRA.
    FastPwm { ocra_top: bool },
}

impl WaveMode {
    fn from_wgm(wgm: u8) -> Option<Self> {
        match wgm {
            0 => Some(WaveMode::Normal),
            2 => Some(WaveMode::Ctc),
            3 => Some(WaveMode::FastPwm { ocra_top: false }),
            7 => Some(WaveMode::FastPwm { ocra_top: true }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Timer8State {
    /// Counter value at cycle `base`.
    count: u8,
    base: CycleCount,
    div: u64,
    mode: WaveMode,
}

pub struct Timer8 {
    config: Timer8Config,
    state: Timer8State,
    timer: Option<TimerId>,
    ovf: InterruptFlag,
    compa: InterruptFlag,
    compb: InterruptFlag,
}

impl Timer8 {
    pub fn new(config: Timer8Config) -> Self {
        let c = &config;
        let ovf = InterruptFlag::new(c.vector_ovf, RegBit::bit(c.timsk, 0), RegBit::bit(c.tifr, 0), true);
        let compa = InterruptFlag::new(c.vector_compa, RegBit::bit(c.timsk, 1), RegBit::bit(c.tifr, 1), true);
        let compb = InterruptFlag::new(c.vector_compb, RegBit::bit(c.timsk, 2), RegBit::bit(c.tifr, 2), true);
        Timer8 { config, state: Timer8State::default(), timer: None, ovf, compa, compb }
    }

    fn top(&self, ctx: &Ctx) -> u8 {
        match self.state.mode {
            WaveMode::Ctc | WaveMode::FastPwm { ocra_top: true } => ctx.read_ioreg(self.config.ocr_a),
            _ => 0xFF,
        }
    }

    /// Advance `count` and `base` to the last tick at or before `now`.
    fn sync(&mut self, now: CycleCount, ctx: &Ctx) {
        let s = &mut self.state;
        if s.div == 0 || now <= s.base {
            return;
        }
        let mut ticks = (now - s.base) / s.div;
        s.base += ticks * s.div;
        let top = match s.mode {
            WaveMode::Ctc | WaveMode::FastPwm { ocra_top: true } => ctx.read_ioreg(self.config.ocr_a),
            _ => 0xFF,
        } as u64;
        let mut count = s.count as u64;
        if count > top {
            // above TOP the counter runs up to 0xFF first
            let to_wrap = 0x100 - count;
            if ticks < to_wrap {
                s.count = (count + ticks) as u8;
                return;
            }
            ticks -= to_wrap;
            count = 0;
        }
        s.count = ((count + ticks) % (top + 1)) as u8;
    }

    /// Ticks from the current count to the next flag event.
    fn ticks_to_event(&self, ctx: &Ctx) -> u64 {
        let top = self.top(ctx) as u64;
        let count = self.state.count as u64;
        let distance = |target: u64| {
            if count > top {
                0x100 - count + target
            } else if target > count {
                target - count
            } else {
                top + 1 - count + target
            }
        };
        [ctx.read_ioreg(self.config.ocr_a) as u64, ctx.read_ioreg(self.config.ocr_b) as u64, 0]
            .into_iter()
            .filter(|&t| t <= top)
            .map(distance)
            .min()
            .unwrap_or(top + 1)
    }

    fn reschedule(&mut self, ctx: &mut Ctx) {
        let Some(timer) = self.timer else { return };
        if self.state.div == 0 {
            ctx.cancel(timer);
            return;
        }
        let when = self.state.base + self.ticks_to_event(ctx) * self.state.div;
        ctx.schedule_at(timer, when);
    }

    fn update_mode(&mut self, ctx: &mut Ctx) {
        let wgm = (ctx.read_ioreg(self.config.tccr_a) & 0x03) | ((ctx.read_ioreg(self.config.tccr_b) >> 1) & 0x04);
        self.state.mode = WaveMode::from_wgm(wgm).unwrap_or_else(|| {
            tracing::warn!(parent: ctx.span(), "timer{}: WGM {} not supported, counting in normal mode", self.config.index, wgm);
            WaveMode::Normal
        });
    }

    fn update_clock(&mut self, ctx: &mut Ctx) {
        let cs = ctx.read_ioreg(self.config.tccr_b) & 0x07;
        let div = match find_reg_config(&self.config.clocks, cs) {
            Some(i) => self.config.clocks[i].div,
            None => {
                tracing::warn!(parent: ctx.span(), "timer{}: clock select {} not supported, stopped", self.config.index, cs);
                0
            }
        };
        if div != self.state.div {
            tracing::debug!(parent: ctx.span(), "timer{}: clock /{}", self.config.index, div);
            self.state.div = div;
            self.state.base = ctx.cycle();
        }
    }

    fn update_flags(&mut self, ctx: &mut Ctx) {
        self.ovf.update_from_ioreg(ctx);
        self.compa.update_from_ioreg(ctx);
        self.compb.update_from_ioreg(ctx);
    }
}

impl Peripheral for Timer8 {
    fn id(&self) -> CtlId {
        timer_id('8', self.config.index)
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let c = &self.config;
        ctx.add_ioreg_mask(c.tccr_a, 0xF3, 0)?;
        ctx.add_ioreg_mask(c.tccr_b, 0x0F, 0)?;
        for addr in [c.tcnt, c.ocr_a, c.ocr_b] {
            ctx.add_ioreg_mask(addr, 0xFF, 0)?;
        }
        ctx.add_ioreg_mask(c.timsk, 0x07, 0)?;
        ctx.add_ioreg_mask(c.tifr, 0x07, 0)?;
        self.ovf.init(ctx)?;
        self.compa.init(ctx)?;
        self.compb.init(ctx)?;
        self.timer = Some(ctx.new_timer());
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut Ctx) {
        self.state = Timer8State::default();
        self.ovf.reset();
        self.compa.reset();
        self.compb.reset();
    }

    fn ioreg_read(&mut self, addr: RegAddr, value: u8, ctx: &mut Ctx) -> u8 {
        if addr == self.config.tcnt {
            self.sync(ctx.cycle(), ctx);
            self.state.count
        } else {
            value
        }
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        let c = &self.config;
        if addr == c.tifr {
            // write one to clear
            ctx.write_ioreg(c.tifr, write.old & !write.value);
            self.update_flags(ctx);
            return;
        }
        if addr == c.timsk {
            self.update_flags(ctx);
            return;
        }
        let now = ctx.cycle();
        if addr == c.tcnt {
            self.sync(now, ctx);
            self.state.count = write.value;
            self.state.base = now;
        } else if addr == c.tccr_a || addr == c.tccr_b {
            self.sync(now, ctx);
            self.update_mode(ctx);
            self.update_clock(ctx);
        } else {
            // OCRA/OCRB, TOP or compare points moved
            self.sync(now, ctx);
        }
        self.reschedule(ctx);
    }

    fn timer_fired(&mut self, _timer: TimerId, when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        if self.state.div == 0 {
            return None;
        }
        self.sync(when, ctx);
        let count = self.state.count;
        let top = self.top(ctx);
        if count <= top {
            if count == ctx.read_ioreg(self.config.ocr_a) {
                self.compa.set_flag(1, ctx);
            }
            if count == ctx.read_ioreg(self.config.ocr_b) {
                self.compb.set_flag(1, ctx);
            }
        }
        if count == 0 {
            let tov = match self.state.mode {
                WaveMode::Ctc => top == 0xFF,
                _ => true,
            };
            if tov {
                self.ovf.set_flag(1, ctx);
            }
        }
        let next = self.state.base + self.ticks_to_event(ctx) * self.state.div;
        Some(next.saturating_sub(when).max(1))
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        self.ovf.interrupt_ack(vector, ctx);
        self.compa.interrupt_ack(vector, ctx);
        self.compb.interrupt_ack(vector, ctx);
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(&self.state, &self.ovf, &self.compa, &self.compb))?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (state, ovf, compa, compb) = bincode::deserialize(data)?;
        self.state = state;
        self.ovf = ovf;
        self.compa = compa;
        self.compb = compb;
        Ok(())
    }
}
