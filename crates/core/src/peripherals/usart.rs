//! USART, asynchronous mode.
//!
//! Frames take `bits * (UBRR + 1) * 16` cycles, 8 with U2X, where `bits`
//! counts the start bit, 5 to 9 data bits, the parity bit and the stop bits.
//!
//! Transmitter: UDR writes go to the shift register when it is idle, to the
//! one-frame buffer otherwise (UDRE clears). Every frame sent is announced
//! on the USART signal; TXC sets once the shift register and the buffer are
//! both empty. While TXEN is set the transmitter drives TXD high over the
//! port.
//!
//! Receiver: frames come from a host queue filled with
//! [`req::USART_PUSH_RX`]. With RXEN set, one frame is received at a time
//! into a two-frame FIFO read through UDR; a frame arriving with the FIFO
//! full is lost and sets DOR.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::cycle::TimerId;
use crate::error::{ConfigError, StateError};
use crate::interrupt::InterruptFlag;
use crate::ioreg::IoRegWrite;
use crate::peripheral::{req, CtlReqData, Ctx, Peripheral};
use crate::pin::PinControls;
use crate::signal::Signal;
use crate::types::{usart_id, CtlId, CycleCount, PinId, RegAddr, RegBit, VarData, VectorIndex};

/// Signal ids of the USART signal.
pub mod sig {
    /// Frame sent; data = frame value, 9 bits at most.
    pub const TX: u16 = 0;
    /// Frame received into the FIFO; data = frame value.
    pub const RX: u16 = 1;
    /// Frame lost to an overrun; data = frame value.
    pub const OVERRUN: u16 = 2;
}

// UCSRnA
const RXC: u8 = 1 << 7;
const TXC: u8 = 1 << 6;
const UDRE: u8 = 1 << 5;
const FE: u8 = 1 << 4;
const DOR: u8 = 1 << 3;
const UPE: u8 = 1 << 2;
const U2X: u8 = 1 << 1;
// UCSRnB
const RXEN: u8 = 1 << 4;
const TXEN: u8 = 1 << 3;
const UCSZ2: u8 = 1 << 2;
const RXB8: u8 = 1 << 1;
const TXB8: u8 = 1 << 0;
// UCSRnC
const UMSEL: u8 = 0xC0;
const UPM: u8 = 0x30;
const USBS: u8 = 1 << 3;

const RX_FIFO_DEPTH: usize = 2;

#[derive(Debug, Clone)]
pub struct UsartConfig {
    pub index: char,
    pub ucsra: RegAddr,
    pub ucsrb: RegAddr,
    pub ucsrc: RegAddr,
    pub ubrrl: RegAddr,
    pub ubrrh: RegAddr,
    pub udr: RegAddr,
    pub rx_vector: VectorIndex,
    pub udre_vector: VectorIndex,
    pub tx_vector: VectorIndex,
    /// Pin driven by the transmitter.
    pub txd: Option<String>,
}

impl UsartConfig {
    pub fn atmega328() -> Self {
        UsartConfig {
            index: '0',
            ucsra: 0xA0,
            ucsrb: 0xA1,
            ucsrc: 0xA2,
            ubrrl: 0xA4,
            ubrrh: 0xA5,
            udr: 0xA6,
            rx_vector: 18,
            udre_vector: 19,
            tx_vector: 20,
            txd: Some("PD1".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsartState {
    /// Frame in the shift register.
    tx_shift: Option<u16>,
    /// Frame waiting in the transmit buffer.
    tx_buffer: Option<u16>,
    /// Frame being received.
    rx_shift: Option<u16>,
    rx_fifo: VecDeque<u16>,
    /// Host frames not yet received.
    rx_queue: VecDeque<u16>,
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    tx: TimerId,
    rx: TimerId,
}

pub struct Usart {
    config: UsartConfig,
    state: UsartState,
    timers: Option<Timers>,
    txd: Option<PinId>,
    rxc: InterruptFlag,
    udre: InterruptFlag,
    txc: InterruptFlag,
    signal: Signal,
}

impl Usart {
    pub fn new(config: UsartConfig) -> Self {
        let (a, b) = (config.ucsra, config.ucsrb);
        let rxc = InterruptFlag::new(config.rx_vector, RegBit::bit(b, 7), RegBit::bit(a, 7), false);
        let txc = InterruptFlag::new(config.tx_vector, RegBit::bit(b, 6), RegBit::bit(a, 6), true);
        let udre = InterruptFlag::new(config.udre_vector, RegBit::bit(b, 5), RegBit::bit(a, 5), false);
        Usart { config, state: UsartState::default(), timers: None, txd: None, rxc, udre, txc, signal: Signal::new() }
    }

    fn data_bits(&self, ctx: &Ctx) -> u64 {
        let ucsz = (ctx.read_ioreg(self.config.ucsrb) & UCSZ2) | ((ctx.read_ioreg(self.config.ucsrc) >> 1) & 0x03);
        match ucsz {
            0 => 5,
            1 => 6,
            2 => 7,
            7 => 9,
            _ => 8,
        }
    }

    fn frame_mask(&self, ctx: &Ctx) -> u16 {
        ((1u32 << self.data_bits(ctx)) - 1) as u16
    }

    /// Duration of one frame in CPU cycles.
    fn frame_cycles(&self, ctx: &Ctx) -> CycleCount {
        let ucsrc = ctx.read_ioreg(self.config.ucsrc);
        let bits = 1 + self.data_bits(ctx) + u64::from(ucsrc & UPM != 0) + if ucsrc & USBS != 0 { 2 } else { 1 };
        let ubrr = (ctx.read_ioreg(self.config.ubrrh) as u64 & 0x0F) << 8 | ctx.read_ioreg(self.config.ubrrl) as u64;
        let per_bit = if ctx.read_ioreg(self.config.ucsra) & U2X != 0 { 8 } else { 16 };
        bits * (ubrr + 1) * per_bit
    }

    fn update_udre(&mut self, ctx: &mut Ctx) {
        if self.state.tx_buffer.is_none() {
            self.udre.set_flag(1, ctx);
        } else {
            self.udre.clear_flag(1, ctx);
        }
    }

    fn update_rxc(&mut self, ctx: &mut Ctx) {
        match self.state.rx_fifo.front() {
            Some(&frame) => {
                let b = ctx.read_ioreg(self.config.ucsrb);
                let rxb8 = if frame & 0x100 != 0 { RXB8 } else { 0 };
                ctx.write_ioreg(self.config.ucsrb, (b & !RXB8) | rxb8);
                ctx.write_ioreg(self.config.udr, frame as u8);
                self.rxc.set_flag(1, ctx);
            }
            None => {
                self.rxc.clear_flag(1, ctx);
            }
        }
    }

    fn start_tx(&mut self, frame: u16, ctx: &mut Ctx) {
        let Some(timers) = self.timers else { return };
        let cycles = self.frame_cycles(ctx);
        self.state.tx_shift = Some(frame);
        ctx.schedule(timers.tx, cycles);
        tracing::trace!(parent: ctx.span(), "usart{}: transmit {:#05x}, {} cycles", self.config.index, frame, cycles);
    }

    fn end_tx(&mut self, ctx: &mut Ctx) {
        let Some(frame) = self.state.tx_shift.take() else { return };
        self.signal.raise(sig::TX, 0, frame as u64);
        match self.state.tx_buffer.take() {
            Some(next) => {
                self.update_udre(ctx);
                self.start_tx(next, ctx);
            }
            None => {
                self.txc.set_flag(1, ctx);
            }
        }
    }

    /// Start receiving the next host frame if the receiver is idle.
    fn start_rx(&mut self, ctx: &mut Ctx) {
        let Some(timers) = self.timers else { return };
        if self.state.rx_shift.is_some() || ctx.read_ioreg(self.config.ucsrb) & RXEN == 0 {
            return;
        }
        let Some(frame) = self.state.rx_queue.pop_front() else { return };
        self.state.rx_shift = Some(frame & self.frame_mask(ctx));
        let cycles = self.frame_cycles(ctx);
        ctx.schedule(timers.rx, cycles);
    }

    fn end_rx(&mut self, ctx: &mut Ctx) {
        let Some(frame) = self.state.rx_shift.take() else { return };
        if self.state.rx_fifo.len() < RX_FIFO_DEPTH {
            self.state.rx_fifo.push_back(frame);
            self.signal.raise(sig::RX, 0, frame as u64);
        } else {
            tracing::debug!(parent: ctx.span(), "usart{}: overrun, frame {:#05x} lost", self.config.index, frame);
            let a = ctx.read_ioreg(self.config.ucsra);
            ctx.write_ioreg(self.config.ucsra, a | DOR);
            self.signal.raise(sig::OVERRUN, 0, frame as u64);
        }
        self.update_rxc(ctx);
        self.start_rx(ctx);
    }

    fn write_udr(&mut self, value: u8, ctx: &mut Ctx) {
        let b = ctx.read_ioreg(self.config.ucsrb);
        if b & TXEN == 0 {
            tracing::debug!(parent: ctx.span(), "usart{}: UDR write with TXEN clear ignored", self.config.index);
            return;
        }
        let ninth = if b & TXB8 != 0 { 0x100 } else { 0 };
        let frame = (value as u16 | ninth) & self.frame_mask(ctx);
        if self.state.tx_shift.is_none() {
            self.start_tx(frame, ctx);
        } else if self.state.tx_buffer.is_none() {
            self.state.tx_buffer = Some(frame);
            self.update_udre(ctx);
        } else {
            tracing::debug!(parent: ctx.span(), "usart{}: transmit buffer full, {:#04x} dropped", self.config.index, value);
        }
    }

    fn read_udr(&mut self, ctx: &mut Ctx) -> u8 {
        let Some(frame) = self.state.rx_fifo.pop_front() else {
            return ctx.read_ioreg(self.config.udr);
        };
        let a = ctx.read_ioreg(self.config.ucsra);
        ctx.write_ioreg(self.config.ucsra, a & !DOR);
        self.update_rxc(ctx);
        self.start_rx(ctx);
        frame as u8
    }

    fn write_ucsrb(&mut self, write: IoRegWrite, ctx: &mut Ctx) {
        let Some(timers) = self.timers else { return };
        if write.posedge & TXEN != 0 {
            if let Some(pin) = self.txd {
                ctx.set_pin_controls(pin, PinControls { dir: true, drive: true, ..Default::default() });
            }
        } else if write.negedge & TXEN != 0 {
            self.state.tx_shift = None;
            self.state.tx_buffer = None;
            ctx.cancel(timers.tx);
            self.update_udre(ctx);
            if let Some(pin) = self.txd {
                ctx.release_pin(pin);
            }
        }
        if write.posedge & RXEN != 0 {
            self.start_rx(ctx);
        } else if write.negedge & RXEN != 0 {
            self.state.rx_shift = None;
            self.state.rx_fifo.clear();
            ctx.cancel(timers.rx);
            self.update_rxc(ctx);
        }
        self.rxc.update_from_ioreg(ctx);
        self.udre.update_from_ioreg(ctx);
        self.txc.update_from_ioreg(ctx);
    }
}

impl Peripheral for Usart {
    fn id(&self) -> CtlId {
        usart_id(self.config.index)
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        let c = &self.config;
        ctx.add_ioreg_mask(c.ucsra, 0xFF, RXC | UDRE | FE | DOR | UPE)?;
        ctx.add_ioreg_mask(c.ucsrb, 0xFF, RXB8)?;
        ctx.add_ioreg_mask(c.ucsrc, 0xFF, 0)?;
        ctx.add_ioreg_mask(c.ubrrl, 0xFF, 0)?;
        ctx.add_ioreg_mask(c.ubrrh, 0x0F, 0)?;
        ctx.add_ioreg_mask(c.udr, 0xFF, 0)?;
        self.rxc.init(ctx)?;
        self.udre.init(ctx)?;
        self.txc.init(ctx)?;
        if let Some(name) = &c.txd {
            let id = ctx.find_pin(name).ok_or_else(|| ConfigError::PinNotFound(name.clone()))?;
            self.txd = Some(id);
        }
        self.timers = Some(Timers { tx: ctx.new_timer(), rx: ctx.new_timer() });
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        // host frames survive a reset
        let rx_queue = std::mem::take(&mut self.state.rx_queue);
        self.state = UsartState { rx_queue, ..UsartState::default() };
        self.rxc.reset();
        self.udre.reset();
        self.txc.reset();
        ctx.write_ioreg(self.config.ucsra, UDRE);
        ctx.write_ioreg(self.config.ucsrc, 0x06);
    }

    fn ioreg_read(&mut self, addr: RegAddr, value: u8, ctx: &mut Ctx) -> u8 {
        if addr == self.config.udr {
            self.read_udr(ctx)
        } else {
            value
        }
    }

    fn ioreg_write(&mut self, addr: RegAddr, write: IoRegWrite, ctx: &mut Ctx) {
        let c = &self.config;
        if addr == c.udr {
            // UDR reads back the receive buffer
            let rx = self.state.rx_fifo.front().map_or(0, |&f| f as u8);
            ctx.write_ioreg(addr, rx);
            self.write_udr(write.value, ctx);
        } else if addr == c.ucsra {
            // TXC is cleared by writing a one
            let txc = write.old & TXC & !(write.value & TXC);
            ctx.write_ioreg(addr, (write.value & !TXC) | txc);
            self.txc.update_from_ioreg(ctx);
        } else if addr == c.ucsrb {
            self.write_ucsrb(write, ctx);
        } else if addr == c.ucsrc && write.value & UMSEL != 0 {
            tracing::warn!(parent: ctx.span(), "usart{}: synchronous modes are not supported", c.index);
        }
    }

    fn timer_fired(&mut self, timer: TimerId, _when: CycleCount, ctx: &mut Ctx) -> Option<CycleCount> {
        let timers = self.timers?;
        if timer == timers.tx {
            self.end_tx(ctx);
        } else if timer == timers.rx {
            self.end_rx(ctx);
        }
        None
    }

    fn interrupt_ack(&mut self, vector: VectorIndex, ctx: &mut Ctx) {
        self.txc.interrupt_ack(vector, ctx);
    }

    fn ctlreq(&mut self, req: u16, data: &mut CtlReqData, ctx: &mut Ctx) -> bool {
        match req {
            req::GET_SIGNAL => {
                data.data = VarData::Signal(self.signal.clone());
                true
            }
            req::USART_PUSH_RX => {
                match &data.data {
                    VarData::Bytes(bytes) => self.state.rx_queue.extend(bytes.iter().map(|&b| b as u16)),
                    VarData::Str(s) => self.state.rx_queue.extend(s.bytes().map(u16::from)),
                    other => self.state.rx_queue.push_back(other.as_uint() as u16),
                }
                self.start_rx(ctx);
                true
            }
            _ => false,
        }
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(&self.state, &self.rxc, &self.udre, &self.txc))?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (state, rxc, udre, txc) = bincode::deserialize(data)?;
        self.state = state;
        self.rxc = rxc;
        self.udre = udre;
        self.txc = txc;
        Ok(())
    }
}
