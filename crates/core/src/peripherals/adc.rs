//! Analog-to-digital converter.
//!
//! 10-bit successive approximation converter. Setting ADSC (with ADEN) starts
//! a conversion of the input selected by ADMUX; the result lands in
//! ADCH:ADCL after 13 ADC clocks (25 for the first conversion after
//! enabling), then ADIF is set and ADSC cleared. ADLAR left adjusts the
//! result. With ADATE and the free running trigger a new conversion starts
//! as soon as one completes.
//!
//! Pin inputs read the pin voltage, a fraction of VCC. The reference is AREF,
//! AVCC or the internal bandgap reference.
//!
//! Entering ADC noise reduction sleep with the converter enabled starts a
//! conversion.

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptFlag;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{find_reg_config, req, CtlReqData, Ctx, Peripheral, RegConfig};
use crate::signal::Signal;
use crate::sleep::SleepMode;
use crate::types::{adc_id, CtlId, CycleCount, PinId, RegAddr, RegBit, VarData, VectorIndex};

/// Signal ids of the ADC signal.
pub mod sig {
    /// Conversion done; index = mux value, data = 10-bit result.
    pub const SAMPLE: u16 = 0;
}

/// Internal bandgap reference voltage.
pub const BANDGAP_VOLTS: f64 = 1.1;

const ADEN: u8 = 1 << 7;
const ADSC: u8 = 1 << 6;
const ADATE: u8 = 1 << 5;
const ADIF: u8 = 1 << 4;
const ADLAR: u8 = 1 << 5;

/// Division factors selected by ADPS2:0.
const PRESCALERS: [u64; 8] = [2, 2, 4, 8, 16, 32, 64, 128];

#[derive(Debug, Clone, PartialEq)]
pub enum AdcInput {
    /// Single ended pin input, by pin name.
    Pin(String),
    Bandgap,
    Ground,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdcMux {
    pub reg_value: u8,
    pub input: AdcInput,
}

impl RegConfig for AdcMux {
    fn reg_value(&self) -> u8 {
        self.reg_value
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdcReference {
    Aref,
    Avcc,
    Internal(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcRefSelect {
    pub reg_value: u8,
    pub reference: AdcReference,
}

impl RegConfig for AdcRefSelect {
    fn reg_value(&self) -> u8 {
        self.reg_value
    }
}

#[derive(Debug, Clone)]
pub struct AdcConfig {
    pub index: char,
    pub admux: RegAddr,
    pub adcsra: RegAddr,
    pub adcsrb: RegAddr,
    pub adcl: RegAddr,
    pub adch: RegAddr,
    pub muxes: Vec<AdcMux>,
    pub refs: Vec<AdcRefSelect>,
    pub vector: VectorIndex,
}

impl AdcConfig {
    /// ADC of the ATmega328: ADC0..ADC5 on PC0..PC5, bandgap on 14, GND on 15.
    pub fn atmega328() -> Self {
        let mut muxes: Vec<AdcMux> =
            (0..6).map(|i| AdcMux { reg_value: i, input: AdcInput::Pin(format!("PC{}", i)) }).collect();
        muxes.push(AdcMux { reg_value: 14, input: AdcInput::Bandgap });
        muxes.push(AdcMux { reg_value: 15, input: AdcInput::Ground });
        AdcConfig {
            index: '0',
            admux: 0x5C,
            adcsra: 0x5A,
            adcsrb: 0x5B,
            adcl: 0x58,
            adch: 0x59,
            muxes,
            refs: vec![
                AdcRefSelect { reg_value: 0, reference: AdcReference::Aref },
                AdcRefSelect { reg_value: 1, reference: AdcReference::Avcc },
                AdcRefSelect { reg_value: 3, reference: AdcReference::Internal(BANDGAP_VOLTS) },
            ],
            vector: 21,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AdcState {
    converting: bool,
    /// Next conversion is the first since the ADC was enabled.
    first: bool,
}

pub struct Adc {
    config: AdcConfig,
    /// Pin of each mux entry, resolved at init.
    pins: Vec<Option<PinId>>,
    state: AdcState,
    timer: Option<TimerId>,
    adif: InterruptFlag,
    signal: Signal,
}

impl Adc {
    pub fn new(config: AdcConfig) -> Self {
        let adif = InterruptFlag::new(config.vector, RegBit::bit(config.adcsra, 3), RegBit::bit(config.adcsra, 4), true);
        Adc {
            config,
            pins: Vec::new(),
            state: AdcState { converting: false, first: true },
            timer: None,
            adif,
            signal: Signal::new(),
        }
    }

    fn start(&mut self, ctx: &mut Ctx) {
        let Some(timer) = self.timer else { return };
        let adcsra = ctx.read_ioreg(self.config.adcsra);
        let clocks = if self.state.first { 25 } else { 13 };
        let delay = clocks * PRESCALERS[(adcsra & 0x07) as usize];
        ctx.write_ioreg(self.config.adcsra, adcsra | ADSC);
        ctx.schedule(timer, delay);
        self.state.converting = true;
        tracing::trace!(parent: ctx.span(), "adc: conversion started, {} cycles", delay);
    }

    fn abort(&mut self, ctx: &mut Ctx) {
        if let Some(timer) = self.timer {
            ctx.cancel(timer);
        }
        self.state.converting = false;
        self.state.first = true;
        let adcsra = ctx.read_ioreg(self.config.adcsra);
        ctx.write_ioreg(self.config.adcsra, adcsra & !ADSC);
    }

    /// Input voltage of mux entry `index`, in volts.
    fn input_volts(&self, index: usize, ctx: &Ctx) -> f64 {
        match &self.config.muxes[index].input {
            AdcInput::Pin(_) => self.pins[index].and_then(|id| ctx.pin(id)).map_or(0.0, |p| p.voltage() * ctx.vcc()),
            AdcInput::Bandgap => BANDGAP_VOLTS,
            AdcInput::Ground => 0.0,
        }
    }

    fn sample(&self, ctx: &Ctx) -> Option<(u8, u16)> {
        let admux = ctx.read_ioreg(self.config.admux);
        let mux = admux & 0x0F;
        let index = find_reg_config(&self.config.muxes, mux)?;
        let reference = match find_reg_config(&self.config.refs, admux >> 6) {
            Some(i) => match self.config.refs[i].reference {
                AdcReference::Aref => ctx.aref(),
                AdcReference::Avcc => ctx.vcc(),
                AdcReference::Internal(v) => v,
            },
            None => return None,
        };
        if reference <= 0.0 {
            return Some((mux, 0));
        }
        let value = (self.input_volts(index, ctx) / reference * 1024.0).round().clamp(0.0, 1023.0) as u16;
        Some((mux, value))
    }
}

impl Peripheral for Adc {
    fn id(&self) -> CtlId {
        adc_id(self.config.index)
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let c = &self.config;
        ctx.add_ioreg_mask(c.admux, 0xEF, 0)?;
        ctx.add_ioreg_mask(c.adcsra, 0xFF, 0)?;
        ctx.add_ioreg_mask(c.adcsrb, 0x07, 0)?;
        ctx.add_ioreg_mask(c.adcl, 0xFF, 0xFF)?;
        ctx.add_ioreg_mask(c.adch, 0xFF, 0xFF)?;
        self.adif.init(ctx)?;

        let mut pins = Vec::with_capacity(c.muxes.len());
        for m in &c.muxes {
            pins.push(match &m.input {
                AdcInput::Pin(name) => Some(ctx.find_pin(name).ok_or_else(|| ConfigError::PinNotFound(name.clone()))?),
                _ => None,
            });
        }
        self.pins = pins;
        self.timer = Some(ctx.new_timer());
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut Ctx) {
        self.state = AdcState { converting: false, first: true };
        self.adif.reset();
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        if addr != self.config.adcsra {
            return;
        }
        // ADIF is cleared by writing one, ADSC cannot be cleared by software
        let mut v = (write.value & !ADIF) | if write.value & ADIF != 0 { 0 } else { write.old & ADIF };
        if self.state.converting {
            v |= ADSC;
        }
        ctx.write_ioreg(addr, v);
        self.adif.update_from_ioreg(ctx);

        if write.negedge & ADEN != 0 {
            self.abort(ctx);
        } else if v & ADEN != 0 && write.value & ADSC != 0 && !self.state.converting {
            self.start(ctx);
        }
    }

    fn timer_fired(&mut self, _timer: TimerId, _when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        if !self.state.converting {
            return None;
        }
        self.state.converting = false;
        self.state.first = false;
        let (mux, value) = self.sample(ctx).unwrap_or_else(|| {
            tracing::warn!(parent: ctx.span(), "adc: invalid ADMUX selection, result 0");
            (0, 0)
        });
        let (high, low) = if ctx.read_ioreg(self.config.admux) & ADLAR != 0 {
            ((value >> 2) as u8, ((value & 0x03) << 6) as u8)
        } else {
            ((value >> 8) as u8, value as u8)
        };
        ctx.write_ioreg(self.config.adch, high);
        ctx.write_ioreg(self.config.adcl, low);
        let adcsra = ctx.read_ioreg(self.config.adcsra);
        ctx.write_ioreg(self.config.adcsra, adcsra & !ADSC);
        self.adif.set_flag(1, ctx);
        tracing::trace!(parent: ctx.span(), "adc: mux {} = {}", mux, value);
        self.signal.raise(sig::SAMPLE, mux as i64, value as u64);

        // free running
        let adcsrb = ctx.read_ioreg(self.config.adcsrb);
        if adcsra & (ADEN | ADATE) == ADEN | ADATE && adcsrb & 0x07 == 0 {
            self.start(ctx);
        }
        None
    }

    fn sleep(&mut self, on: bool, mode: SleepMode, ctx: &mut Ctx) {
        if on && mode == SleepMode::Adc && ctx.read_ioreg(self.config.adcsra) & ADEN != 0 && !self.state.converting {
            self.start(ctx);
        }
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        self.adif.interrupt_ack(vector, ctx);
    }

    fn ctlreq(&mut self, req: u16, data: &mut CtlReqData, _ctx: &mut Ctx) -> bool {
        if req == req::GET_SIGNAL {
            data.data = VarData::Signal(self.signal.clone());
            return true;
        }
        false
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(&self.state, &self.adif))?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (state, adif) = bincode::deserialize(data)?;
        self.state = state;
        self.adif = adif;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::Access;
    use crate::device::{Device, DeviceState};
    use crate::peripherals::testutil::{self, asm};
    use crate::pin::PinState;
    use crate::sleep::{SleepConfig, SleepController};
    use crate::signal::SignalRecorder;

    fn adc_device(words: &[u16]) -> Device {
        let mut prog = words.to_vec();
        prog.resize(64, asm::NOP);
        prog.push(asm::rjmp(-1));
        testutil::device_with(
            &prog,
            vec![Box::new(SleepController::new(SleepConfig::atmega328())), Box::new(Adc::new(AdcConfig::atmega328()))],
        )
    }

    fn run_for(dev: &mut Device, cycles: CycleCount) {
        let end = dev.cycle() + cycles;
        while dev.cycle() < end {
            dev.step();
        }
    }

    #[test]
    fn test_first_conversion_of_pin_voltage() {
        let mut dev = adc_device(&[]);
        let pc0 = dev.find_pin("PC0").unwrap();
        dev.set_pin_external_state(pc0, PinState::Analog(0.5));
        let rec = SignalRecorder::new();
        dev.signal_of(adc_id('0')).unwrap().connect(rec.clone(), 0);

        // AVCC reference, ADC0; enable and start at clk/128
        dev.probe().write_ioreg(0x5C, 0x40, Access::Bus);
        dev.probe().write_ioreg(0x5A, 0xC7, Access::Bus);
        assert_ne!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADSC, 0);

        run_for(&mut dev, 25 * 128 - 8);
        assert_eq!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADIF, 0);
        run_for(&mut dev, 10);
        let adcsra = dev.probe().read_ioreg(0x5A, Access::Raw);
        assert_eq!(adcsra & (ADSC | ADIF), ADIF);
        assert_eq!(dev.probe().read_ioreg(0x59, Access::Raw), 0x02);
        assert_eq!(dev.probe().read_ioreg(0x58, Access::Raw), 0x00);
        assert_eq!(rec.last().map(|d| d.data.as_uint()), Some(512));
    }

    #[test]
    fn test_left_adjust_and_second_conversion_time() {
        let mut dev = adc_device(&[]);
        // internal 1.1 V reference, bandgap input, ADLAR, clk/2
        dev.probe().write_ioreg(0x5C, 0xEE, Access::Bus);
        dev.probe().write_ioreg(0x5A, 0xC1, Access::Bus);
        run_for(&mut dev, 50);
        // full scale clamps to 1023
        assert_eq!(dev.probe().read_ioreg(0x59, Access::Raw), 0xFF);
        assert_eq!(dev.probe().read_ioreg(0x58, Access::Raw), 0xC0);

        // clear ADIF, start again: 13 clocks
        dev.probe().write_ioreg(0x5A, 0xD1, Access::Bus);
        assert_eq!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADIF, 0);
        run_for(&mut dev, 20);
        assert_eq!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADIF, 0);
        run_for(&mut dev, 10);
        assert_ne!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADIF, 0);
    }

    #[test]
    fn test_disable_aborts_conversion() {
        let mut dev = adc_device(&[]);
        dev.probe().write_ioreg(0x5A, 0xC7, Access::Bus);
        run_for(&mut dev, 10);
        dev.probe().write_ioreg(0x5A, 0x07, Access::Bus);
        assert_eq!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADSC, 0);
        assert_eq!(dev.next_timer_when(), None);
    }

    #[test]
    fn test_noise_reduction_sleep_starts_and_wakes() {
        // ADCSRA = ADEN|ADIE|clk/2 (0x89); SMCR = ADC mode + SE (0x03); SEI; SLEEP
        let [sts0, sts1] = asm::sts(0x7A, 16);
        let prog = [
            asm::ldi(16, 0x89),
            sts0,
            sts1,
            asm::ldi(16, 0x03),
            asm::out(0x33, 16),
            asm::SEI,
            asm::SLEEP,
        ];
        let mut dev = adc_device(&prog);
        for _ in 0..6 {
            dev.step();
        }
        assert_eq!(dev.state(), DeviceState::Sleeping);
        assert!(dev.next_timer_when().is_some());
        run_for(&mut dev, 60);
        assert_eq!(dev.state(), DeviceState::Running);
        assert_eq!(dev.interrupts().servicing(), Some(21));
        // ADIF cleared when the vector was entered
        assert_eq!(dev.probe().read_ioreg(0x5A, Access::Raw) & ADIF, 0);
    }
}
