//! Firmware images.
//!
//! A [`Firmware`] is a set of memory blocks per NVM area plus the run
//! parameters the program expects (clock, supply voltages, console register).
//! It is built by hand or parsed from Intel HEX text with
//! [`Firmware::from_ihex`].
//!
//! Intel HEX record types 00 (data), 01 (EOF), 02 (extended segment
//! address), 03 (start segment), 04 (extended linear address) and 05 (start
//! linear) are understood. Addresses above the flash range follow the
//! avr-gcc section offsets:
//!
//! | offset     | area     |
//! |------------|----------|
//! | `0x810000` | EEPROM   |
//! | `0x820000` | fuses    |
//! | `0x830000` | lockbits |
//! | `0x850000` | user row |

use std::collections::BTreeMap;

use crate::error::FirmwareError;
use crate::memory::{Area, MemBlock};
use crate::types::MemAddr;

const EEPROM_OFFSET: u32 = 0x81_0000;
const FUSES_OFFSET: u32 = 0x82_0000;
const LOCKBIT_OFFSET: u32 = 0x83_0000;
const SIGNATURE_OFFSET: u32 = 0x84_0000;
const USERROW_OFFSET: u32 = 0x85_0000;
const AREA_SPAN: u32 = 0x1_0000;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Firmware {
    /// MCU model the image was built for, informational.
    pub variant: String,
    /// Clock frequency in Hz.
    pub frequency: u64,
    /// Supply voltage in volts.
    pub vcc: f64,
    /// Analog reference voltage in volts.
    pub aref: f64,
    /// Data space address of the console register.
    pub console_register: Option<MemAddr>,
    /// Size of the initialised data section.
    pub datasize: usize,
    /// Size of the zeroed data section.
    pub bsssize: usize,
    blocks: BTreeMap<Area, Vec<MemBlock>>,
}

impl Firmware {
    pub fn new() -> Self {
        Firmware { vcc: 5.0, aref: 5.0, ..Default::default() }
    }

    /// Add `bytes` at `base` in `area`. A block starting where the previous
    /// one of the same area ends is merged into it.
    pub fn add_block(&mut self, area: Area, base: u32, bytes: &[u8]) {
        let blocks = self.blocks.entry(area).or_default();
        if let Some(last) = blocks.last_mut() {
            if last.base as usize + last.buf.len() == base as usize {
                last.buf.extend_from_slice(bytes);
                return;
            }
        }
        blocks.push(MemBlock { base, buf: bytes.to_vec() });
    }

    /// Flash image from little-endian instruction words, at address 0.
    pub fn from_words(words: &[u16]) -> Self {
        let mut fw = Firmware::new();
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        fw.add_block(Area::Flash, 0, &bytes);
        fw
    }

    pub fn blocks(&self, area: Area) -> &[MemBlock] {
        self.blocks.get(&area).map(|b| b.as_slice()).unwrap_or(&[])
    }

    pub fn has(&self, area: Area) -> bool {
        !self.blocks(area).is_empty()
    }

    /// Areas holding at least one block.
    pub fn areas(&self) -> impl Iterator<Item = Area> + '_ {
        self.blocks.iter().filter(|(_, b)| !b.is_empty()).map(|(a, _)| *a)
    }

    /// Total byte count of an area.
    pub fn size(&self, area: Area) -> usize {
        self.blocks(area).iter().map(|b| b.buf.len()).sum()
    }

    /// Parse Intel HEX text. Run parameters are left at their defaults.
    pub fn from_ihex(text: &str) -> Result<Self, FirmwareError> {
        let mut fw = Firmware::new();
        let mut base_addr: u32 = 0;

        for (n, line) in text.lines().enumerate() {
            let line_no = n + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(body) = line.strip_prefix(':') else {
                return Err(FirmwareError::Parse { line: line_no, reason: "missing ':' start code".into() });
            };
            let bytes = hex_bytes(body).map_err(|reason| FirmwareError::Parse { line: line_no, reason })?;
            if bytes.len() < 5 {
                return Err(FirmwareError::Parse { line: line_no, reason: "record too short".into() });
            }
            let count = bytes[0] as usize;
            if bytes.len() != count + 5 {
                return Err(FirmwareError::Parse {
                    line: line_no,
                    reason: format!("byte count {} does not match record length", count),
                });
            }
            if bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
                return Err(FirmwareError::Checksum { line: line_no });
            }
            let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
            let data = &bytes[4..4 + count];

            match bytes[3] {
                0x00 => {
                    let addr = base_addr + offset;
                    let (area, base) = split_address(addr)
                        .ok_or_else(|| FirmwareError::Parse { line: line_no, reason: format!("address {:#x} outside of any memory", addr) })?;
                    if let Some(area) = area {
                        fw.add_block(area, base, data);
                    }
                }
                0x01 => break,
                0x02 if count == 2 => base_addr = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4,
                0x04 if count == 2 => base_addr = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16,
                0x03 | 0x05 => {}
                t => {
                    return Err(FirmwareError::Parse { line: line_no, reason: format!("unsupported record type {:02X}", t) });
                }
            }
        }

        if !fw.has(Area::Flash) {
            return Err(FirmwareError::NoFlash);
        }
        Ok(fw)
    }
}

/// Map a linear HEX address to its area and the offset within it.
/// The signature area is recognised but not loaded (`Some((None, _))`).
fn split_address(addr: u32) -> Option<(Option<Area>, u32)> {
    let area_of = |start: u32| addr >= start && addr < start + AREA_SPAN;
    if addr < EEPROM_OFFSET {
        Some((Some(Area::Flash), addr))
    } else if area_of(EEPROM_OFFSET) {
        Some((Some(Area::Eeprom), addr - EEPROM_OFFSET))
    } else if area_of(FUSES_OFFSET) {
        Some((Some(Area::Fuses), addr - FUSES_OFFSET))
    } else if area_of(LOCKBIT_OFFSET) {
        Some((Some(Area::Lockbit), addr - LOCKBIT_OFFSET))
    } else if area_of(SIGNATURE_OFFSET) {
        Some((None, addr - SIGNATURE_OFFSET))
    } else if area_of(USERROW_OFFSET) {
        Some((Some(Area::UserRow), addr - USERROW_OFFSET))
    } else {
        None
    }
}

fn hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(c: u8) -> Result<u8, String> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(format!("invalid hex digit '{}'", c as char)),
    }
}
