//! # avrsim-core
//!
//! Cycle-accurate simulation core for 8-bit AVR microcontrollers.
//!
//! A [`Device`] is assembled from a [`DeviceConfig`] (memory layout, core
//! attributes, pins) and a set of [`Peripheral`]s, loaded with a
//! [`Firmware`] image, then stepped one instruction at a time or driven by a
//! [`SimLoop`] / [`AsyncSimLoop`]. All timing is expressed in CPU cycles;
//! peripherals schedule work on the cycle manager instead of polling.
//!
//! ## Architecture
//!
//! - [`types`]: identifiers, register addresses, [`RegBit`], [`VarData`]
//! - [`signal`]: publish/subscribe bus used by pins, peripherals and the core
//! - [`cycle`]: cycle counter and timer scheduling
//! - [`memory`]: data space layout and non-volatile memories
//! - [`ioreg`]: I/O register file with owner dispatch
//! - [`interrupt`]: interrupt controller and [`InterruptFlag`] helper
//! - [`pin`]: pin driver slots and level resolution
//! - [`config`]: device descriptions, ATmega328 built in
//! - [`peripheral`]: the [`Peripheral`] trait and its callback context
//! - [`opcodes`] / [`cpu`]: instruction decoder and execution core
//! - [`device`]: the assembled device and its step
//! - [`sleep`]: sleep controller
//! - [`peripherals`]: GPIO ports, external interrupts, timers, ADC, SPI,
//!   USART, EEPROM, flash self-programming, watchdog
//! - [`debug`]: debug probe, breakpoints and watchpoints
//! - [`firmware`]: firmware images and Intel HEX parsing
//! - [`savestate`]: device snapshots
//! - [`simloop`]: synchronous and threaded simulation drivers
//!
//! ## Logging
//!
//! Everything logs through `tracing`. Each device owns a span named after the
//! device and events are emitted under it; install a subscriber to see them.

pub mod config;
pub mod cpu;
pub mod cycle;
pub mod debug;
pub mod device;
pub mod error;
pub mod firmware;
pub mod interrupt;
pub mod ioreg;
pub mod memory;
pub mod opcodes;
pub mod peripheral;
pub mod peripherals;
pub mod pin;
pub mod savestate;
pub mod signal;
pub mod simloop;
pub mod sleep;
pub mod types;

pub use config::{CoreAttributes, CoreConfig, DeviceConfig};
pub use cycle::{CycleManager, TimerId};
pub use debug::{Access, DebugProbe, WatchFlags};
pub use device::{CrashInfo, CrashReason, Device, DeviceOptions, DeviceState, ResetFlags};
pub use error::{ConfigError, FirmwareError, StateError};
pub use firmware::Firmware;
pub use interrupt::{InterruptController, InterruptFlag};
pub use memory::Area;
pub use peripheral::{CoreRequest, CtlReqData, Ctx, Peripheral};
pub use pin::{PinControls, PinState};
pub use signal::{Signal, SignalData, SignalHook};
pub use simloop::{AsyncSimLoop, Command, LoopState, RunMode, RunReport, SimLoop, Termination};
pub use sleep::SleepMode;
pub use types::{CtlId, CycleCount, PinId, RegAddr, RegBit, VarData};
