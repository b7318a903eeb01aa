//! External interrupts.
//!
//! INTn pins trigger on a level or an edge chosen per pin in EICRA:
//!
//! | ISCn | trigger      |
//! |------|--------------|
//! | 00   | low level    |
//! | 01   | any change   |
//! | 10   | falling edge |
//! | 11   | rising edge  |
//!
//! Edges set the EIFR flag; the low level raises the vector for as long as
//! the pin stays low and leaves EIFR alone. Pin change interrupts come in
//! banks of eight pins: a change on a pin selected in PCMSKn sets PCIFn.
//! All flags clear on a written one or when the CPU enters the vector.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptFlag;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{req, CtlReqData, Ctx, Peripheral};
use crate::pin::sig as pinsig;
use crate::signal::{HookTag, Signal, SignalData};
use crate::types::{CtlId, PinId, RegAddr, RegBit, VarData, VectorIndex, ID_EXTINT};

pub const EXTINT_PIN_COUNT: usize = 2;
pub const PCINT_BANK_COUNT: usize = 3;

/// Signal ids of the external interrupt signal.
pub mod sig {
    /// INTn condition detected; index = n, data = pin level.
    pub const EXTINT: u16 = 0;
    /// Change on a selected pin change input; index = bank, data = PCINT number.
    pub const PIN_CHANGE: u16 = 1;
}

#[derive(Debug, Clone)]
pub struct ExtIntConfig {
    /// INTn pin names.
    pub extint_pins: [String; EXTINT_PIN_COUNT],
    /// PCINTn pin names, by PCINT number. `None` for unbonded inputs.
    pub pcint_pins: Vec<Option<String>>,
    pub eicra: RegAddr,
    pub eimsk: RegAddr,
    pub eifr: RegAddr,
    pub pcicr: RegAddr,
    pub pcifr: RegAddr,
    pub pcmsk: [RegAddr; PCINT_BANK_COUNT],
    pub extint_vectors: [VectorIndex; EXTINT_PIN_COUNT],
    pub pcint_vectors: [VectorIndex; PCINT_BANK_COUNT],
}

impl ExtIntConfig {
    pub fn atmega328() -> Self {
        let mut pcint_pins = Vec::with_capacity(8 * PCINT_BANK_COUNT);
        pcint_pins.extend((0..8).map(|b| Some(format!("PB{b}"))));
        pcint_pins.extend((0..8).map(|b| (b < 7).then(|| format!("PC{b}"))));
        pcint_pins.extend((0..8).map(|b| Some(format!("PD{b}"))));
        ExtIntConfig {
            extint_pins: ["PD2".to_string(), "PD3".to_string()],
            pcint_pins,
            eicra: 0x49,
            eimsk: 0x1D,
            eifr: 0x1C,
            pcicr: 0x48,
            pcifr: 0x1B,
            pcmsk: [0x4B, 0x4C, 0x4D],
            extint_vectors: [1, 2],
            pcint_vectors: [3, 4, 5],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sense {
    Low,
    Change,
    Falling,
    Rising,
}

/// A pin feeding INTn, PCINTn or both; the hook tag indexes this list.
#[derive(Debug, Clone, Copy)]
struct Watched {
    pin: PinId,
    extint: Option<usize>,
    pcint: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExtIntState {
    /// Last seen level of each watched pin, by watch index.
    levels: Vec<bool>,
    /// INTn vectors currently raised.
    raised: [bool; EXTINT_PIN_COUNT],
}

pub struct ExtInt {
    config: ExtIntConfig,
    watched: Vec<Watched>,
    state: ExtIntState,
    pcint: Vec<InterruptFlag>,
    signal: Signal,
}

impl ExtInt {
    pub fn new(config: ExtIntConfig) -> Self {
        let pcint = (0..PCINT_BANK_COUNT)
            .map(|i| {
                let bit = i as u8;
                InterruptFlag::new(
                    config.pcint_vectors[i],
                    RegBit::bit(config.pcicr, bit),
                    RegBit::bit(config.pcifr, bit),
                    true,
                )
            })
            .collect();
        ExtInt { config, watched: Vec::new(), state: ExtIntState::default(), pcint, signal: Signal::new() }
    }

    fn sense(&self, n: usize, ctx: &Ctx) -> Sense {
        match (ctx.read_ioreg(self.config.eicra) >> (2 * n)) & 0x03 {
            0 => Sense::Low,
            1 => Sense::Change,
            2 => Sense::Falling,
            _ => Sense::Rising,
        }
    }

    fn level_of(&self, n: usize) -> Option<bool> {
        let i = self.watched.iter().position(|w| w.extint == Some(n))?;
        self.state.levels.get(i).copied()
    }

    /// Raise or cancel INTn from its enable bit, its flag and, in low level
    /// mode, the pin level.
    fn update_extint(&mut self, n: usize, ctx: &mut Ctx) {
        let bit = 1u8 << n;
        let enabled = ctx.read_ioreg(self.config.eimsk) & bit != 0;
        let flagged = ctx.read_ioreg(self.config.eifr) & bit != 0;
        let low = self.sense(n, ctx) == Sense::Low && self.level_of(n) == Some(false);
        let active = enabled && (flagged || low);
        let vector = self.config.extint_vectors[n];
        if active && !self.state.raised[n] {
            ctx.raise_interrupt(vector);
        } else if !active && self.state.raised[n] {
            ctx.cancel_interrupt(vector);
        }
        self.state.raised[n] = active;
    }

    fn extint_change(&mut self, n: usize, level: bool, ctx: &mut Ctx) {
        let hit = match self.sense(n, ctx) {
            Sense::Low => !level,
            Sense::Change => true,
            Sense::Falling => !level,
            Sense::Rising => level,
        };
        if !hit {
            self.update_extint(n, ctx);
            return;
        }
        tracing::trace!(parent: ctx.span(), "INT{} triggered, level {}", n, level as u8);
        if self.sense(n, ctx) != Sense::Low {
            let flags = ctx.read_ioreg(self.config.eifr);
            ctx.write_ioreg(self.config.eifr, flags | (1 << n));
        }
        self.update_extint(n, ctx);
        self.signal.raise(sig::EXTINT, n as i64, level as u64);
    }

    fn pcint_change(&mut self, num: usize, ctx: &mut Ctx) {
        let (bank, bit) = (num / 8, num % 8);
        if ctx.read_ioreg(self.config.pcmsk[bank]) & (1 << bit) == 0 {
            return;
        }
        tracing::trace!(parent: ctx.span(), "PCINT{} changed", num);
        self.pcint[bank].set_flag(1, ctx);
        self.signal.raise(sig::PIN_CHANGE, bank as i64, num as u64);
    }

    fn refresh_levels(&mut self, ctx: &Ctx) {
        self.state.levels =
            self.watched.iter().map(|w| ctx.pin(w.pin).is_some_and(|p| p.digital_state())).collect();
    }
}

impl Peripheral for ExtInt {
    fn id(&self) -> CtlId {
        ID_EXTINT
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let c = &self.config;
        let ext_mask = (1u8 << EXTINT_PIN_COUNT) - 1;
        let bank_mask = (1u8 << PCINT_BANK_COUNT) - 1;
        ctx.add_ioreg_mask(c.eicra, (1 << (2 * EXTINT_PIN_COUNT)) - 1, 0)?;
        ctx.add_ioreg_mask(c.eimsk, ext_mask, 0)?;
        ctx.add_ioreg_mask(c.eifr, ext_mask, 0)?;
        ctx.add_ioreg_mask(c.pcicr, bank_mask, 0)?;
        ctx.add_ioreg_mask(c.pcifr, bank_mask, 0)?;
        for (bank, &addr) in c.pcmsk.iter().enumerate() {
            let mask = (0..8).fold(0u8, |m, b| match c.pcint_pins.get(bank * 8 + b) {
                Some(Some(_)) => m | (1 << b),
                _ => m,
            });
            ctx.add_ioreg_mask(addr, mask, 0)?;
        }
        for &v in &c.extint_vectors {
            ctx.register_interrupt(v)?;
        }
        for flag in &self.pcint {
            flag.init(ctx)?;
        }

        let mut watched: Vec<Watched> = Vec::new();
        let extint = c.extint_pins.iter().enumerate().map(|(n, name)| (name, Some(n), None));
        let pcint = c.pcint_pins.iter().enumerate().filter_map(|(n, name)| Some((name.as_ref()?, None, Some(n))));
        for (name, ext, pc) in extint.chain(pcint) {
            let id = ctx.find_pin(name).ok_or_else(|| ConfigError::PinNotFound(name.clone()))?;
            match watched.iter_mut().find(|w| w.pin == id) {
                Some(w) => {
                    w.extint = w.extint.or(ext);
                    w.pcint = w.pcint.or(pc);
                }
                None => watched.push(Watched { pin: id, extint: ext, pcint: pc }),
            }
        }
        let hook = ctx.hook();
        for (tag, w) in watched.iter().enumerate() {
            if let Some(pin) = ctx.pin(w.pin) {
                pin.signal().connect(hook.clone(), tag as HookTag);
            }
        }
        self.watched = watched;
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        self.state.raised = [false; EXTINT_PIN_COUNT];
        for flag in &mut self.pcint {
            flag.reset();
        }
        self.refresh_levels(ctx);
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        let c = &self.config;
        if addr == c.eifr || addr == c.pcifr {
            // flags are cleared by writing a one
            ctx.write_ioreg(addr, write.old & !write.value);
        }
        if addr == c.eicra || addr == c.eimsk || addr == c.eifr {
            for n in 0..EXTINT_PIN_COUNT {
                self.update_extint(n, ctx);
            }
        } else if addr == c.pcicr || addr == c.pcifr {
            for flag in &mut self.pcint {
                flag.update_from_ioreg(ctx);
            }
        }
    }

    fn raised(&mut self, data: &SignalData, tag: HookTag, ctx: &mut Ctx) {
        if data.sigid != pinsig::DIGITAL_CHANGE {
            return;
        }
        let index = tag as usize;
        let Some(w) = self.watched.get(index).copied() else { return };
        let level = data.data.as_uint() != 0;
        if let Some(old) = self.state.levels.get_mut(index) {
            if *old == level {
                return;
            }
            *old = level;
        }
        if let Some(n) = w.extint {
            self.extint_change(n, level, ctx);
        }
        if let Some(num) = w.pcint {
            self.pcint_change(num, ctx);
        }
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        if let Some(n) = self.config.extint_vectors.iter().position(|&v| v == vector) {
            let flags = ctx.read_ioreg(self.config.eifr);
            ctx.write_ioreg(self.config.eifr, flags & !(1 << n));
            self.state.raised[n] = false;
            // a low level holds the request
            self.update_extint(n, ctx);
            return;
        }
        for flag in &mut self.pcint {
            flag.interrupt_ack(vector, ctx);
        }
    }

    fn ctlreq(&mut self, req: u16, data: &mut CtlReqData, _ctx: &mut Ctx) -> bool {
        if req == req::GET_SIGNAL {
            data.data = VarData::Signal(self.signal.clone());
            return true;
        }
        false
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(&self.state, &self.pcint))?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (state, pcint): (ExtIntState, Vec<InterruptFlag>) = bincode::deserialize(data)?;
        if pcint.len() != self.pcint.len() {
            return Err(StateError::Layout("pin change banks".to_string()));
        }
        self.state = state;
        self.pcint = pcint;
        Ok(())
    }
}
