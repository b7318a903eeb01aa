//! Error types.
//!
//! Build-time problems ([`ConfigError`]), firmware image problems
//! ([`FirmwareError`]) and snapshot problems ([`StateError`]) are returned as
//! `Result`s. Faults raised by the simulated program itself are not errors in
//! this sense: they move the device to the `Crashed` state and are reported as
//! a [`crate::device::CrashInfo`].

use crate::types::{RegAddr, VectorIndex};

/// Invalid device or peripheral configuration, detected before any cycle runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O register address {addr:#06x} outside of I/O space (ioend {ioend:#06x})")]
    BadIoRegister { addr: RegAddr, ioend: RegAddr },
    #[error("interrupt vector {vector} out of range (vector count {count})")]
    BadVector { vector: VectorIndex, count: usize },
    #[error("interrupt vector {0} registered twice")]
    VectorInUse(VectorIndex),
    #[error("pin '{0}' not found")]
    PinNotFound(String),
    #[error("duplicate pin '{0}'")]
    DuplicatePin(String),
    #[error("peripheral '{0}' attached twice")]
    DuplicatePeripheral(String),
    #[error("invalid memory layout: {0}")]
    MemoryLayout(String),
    #[error("peripheral '{id}': {reason}")]
    Peripheral { id: String, reason: String },
}

/// Problem with a firmware image or its loading into a device.
#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("line {line}: checksum mismatch")]
    Checksum { line: usize },
    #[error("firmware has no flash data")]
    NoFlash,
    #[error("MCU frequency not set")]
    NoFrequency,
    #[error("device is not ready for firmware loading (state {0})")]
    NotReady(String),
    #[error("{area} block at {base:#x} ({len} bytes) does not fit in memory of {size} bytes")]
    Overflow { area: String, base: u32, len: usize, size: usize },
    #[error("firmware targets {area} but the device has none")]
    MissingArea { area: String },
}

/// Problem while saving or restoring a device snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("snapshot too short")]
    Truncated,
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("snapshot taken on device '{found}', expected '{expected}'")]
    DeviceMismatch { found: String, expected: String },
    #[error("snapshot layout mismatch: {0}")]
    Layout(String),
    #[error("decompression failed: {0}")]
    Inflate(String),
    #[error(transparent)]
    Codec(#[from] bincode::Error),
}
