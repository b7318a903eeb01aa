//! Basic identifiers and value types shared by every simulation component.
//!
//! - [`CtlId`]: 4-character peripheral/pin identifiers packed into a `u32`
//! - [`BitMask`] / [`RegBit`]: sub-field descriptions of 8-bit I/O registers
//! - [`VarData`]: the variant payload carried by signals and control requests
//! - [`VectorMask`]: bitset over interrupt vector indexes

use crate::signal::Signal;

/// Global cycle counter type.
pub type CycleCount = u64;
/// I/O register address (data space address minus the I/O base).
pub type RegAddr = u16;
/// Data space address.
pub type MemAddr = u16;
/// Flash byte address.
pub type FlashAddr = u32;
/// Interrupt vector index (0 = reset).
pub type VectorIndex = usize;
/// Opaque peripheral / pin identifier.
pub type CtlId = u32;
/// Pin identifier, same packing as [`CtlId`].
pub type PinId = u32;

/// Pack four bytes into an identifier, first byte in the least significant position.
#[inline(always)]
pub const fn ctl_id(s: &[u8; 4]) -> CtlId {
    (s[0] as u32) | ((s[1] as u32) << 8) | ((s[2] as u32) << 16) | ((s[3] as u32) << 24)
}

/// Convert an identifier back to its string form, dropping trailing NUL bytes.
pub fn id_to_str(id: CtlId) -> String {
    id.to_le_bytes()
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

/// Pack up to four characters of `s` into an identifier.
pub fn str_to_id(s: &str) -> CtlId {
    let mut buf = [0u8; 4];
    for (dst, src) in buf.iter_mut().zip(s.bytes()) {
        *dst = src;
    }
    ctl_id(&buf)
}

// ─── Well-known identifiers ─────────────────────────────────────────────────

pub const ID_CORE: CtlId = ctl_id(b"CORE");
pub const ID_INTR: CtlId = ctl_id(b"INTR");
pub const ID_SLEEP: CtlId = ctl_id(b"SLP\0");
pub const ID_WATCHDOG: CtlId = ctl_id(b"WTDG");
pub const ID_EEPROM: CtlId = ctl_id(b"EPRM");
pub const ID_NVM: CtlId = ctl_id(b"NVM\0");
pub const ID_CONSOLE: CtlId = ctl_id(b"CSLE");
pub const ID_EXTINT: CtlId = ctl_id(b"EINT");

/// Port controller identifier, e.g. `port_id('B')` → "IOGB".
pub const fn port_id(name: char) -> CtlId {
    ctl_id(&[b'I', b'O', b'G', name as u8])
}

/// Timer/counter identifier, e.g. `timer_id('0', 'A')` → "TC0A".
pub const fn timer_id(kind: char, index: char) -> CtlId {
    ctl_id(&[b'T', b'C', kind as u8, index as u8])
}

pub const fn adc_id(index: char) -> CtlId {
    ctl_id(&[b'A', b'D', b'C', index as u8])
}

pub const fn spi_id(index: char) -> CtlId {
    ctl_id(&[b'S', b'P', b'I', index as u8])
}

pub const fn usart_id(index: char) -> CtlId {
    ctl_id(&[b'U', b'A', b'R', index as u8])
}

// ─── Register bit fields ────────────────────────────────────────────────────

/// Bit field inside an 8-bit value: `mask` is aligned on bit 0, `bit` is the shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct BitMask {
    pub bit: u8,
    pub mask: u8,
}

impl BitMask {
    pub const fn new(bit: u8, mask: u8) -> Self {
        BitMask { bit, mask }
    }

    /// Single bit field.
    pub const fn bit(bit: u8) -> Self {
        BitMask { bit, mask: 1 }
    }

    /// Mask in register position.
    #[inline(always)]
    pub fn shifted(&self) -> u8 {
        self.mask << self.bit
    }

    #[inline(always)]
    pub fn extract(&self, v: u8) -> u8 {
        (v >> self.bit) & self.mask
    }

    #[inline(always)]
    pub fn replace(&self, reg: u8, field: u8) -> u8 {
        (reg & !self.shifted()) | ((field & self.mask) << self.bit)
    }
}

/// A register address plus a bit field. `addr == None` marks an unused field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RegBit {
    pub addr: Option<RegAddr>,
    pub bit: u8,
    pub mask: u8,
}

impl RegBit {
    /// Whole register.
    pub const fn reg(addr: RegAddr) -> Self {
        RegBit { addr: Some(addr), bit: 0, mask: 0xFF }
    }

    /// Single bit.
    pub const fn bit(addr: RegAddr, bit: u8) -> Self {
        RegBit { addr: Some(addr), bit, mask: 1 }
    }

    /// Multi-bit field starting at `bit`, `mask` aligned on bit 0.
    pub const fn field(addr: RegAddr, bit: u8, mask: u8) -> Self {
        RegBit { addr: Some(addr), bit, mask }
    }

    pub const fn none() -> Self {
        RegBit { addr: None, bit: 0, mask: 0 }
    }

    #[inline(always)]
    pub fn valid(&self) -> bool {
        self.addr.is_some() && self.mask != 0
    }

    #[inline(always)]
    pub fn bitmask(&self) -> BitMask {
        BitMask::new(self.bit, self.mask)
    }

    /// Mask in register position.
    #[inline(always)]
    pub fn shifted(&self) -> u8 {
        self.mask << self.bit
    }

    #[inline(always)]
    pub fn extract(&self, v: u8) -> u8 {
        (v >> self.bit) & self.mask
    }

    /// Set every bit of the field in `v`.
    #[inline(always)]
    pub fn set_to(&self, v: u8) -> u8 {
        v | self.shifted()
    }

    /// Clear every bit of the field in `v`.
    #[inline(always)]
    pub fn clear_from(&self, v: u8) -> u8 {
        v & !self.shifted()
    }

    #[inline(always)]
    pub fn replace(&self, reg: u8, field: u8) -> u8 {
        (reg & !self.shifted()) | ((field & self.mask) << self.bit)
    }
}

// ─── Variant data ───────────────────────────────────────────────────────────

/// Payload of signals and control requests.
#[derive(Debug, Clone, Default)]
pub enum VarData {
    #[default]
    None,
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Handle to a signal, used to answer `GET_SIGNAL` requests.
    Signal(Signal),
}

impl VarData {
    pub fn is_none(&self) -> bool {
        matches!(self, VarData::None)
    }

    pub fn as_int(&self) -> i64 {
        match *self {
            VarData::Int(v) => v,
            VarData::Uint(v) => v as i64,
            VarData::Double(v) => v as i64,
            _ => 0,
        }
    }

    pub fn as_uint(&self) -> u64 {
        match *self {
            VarData::Int(v) => v as u64,
            VarData::Uint(v) => v,
            VarData::Double(v) => v as u64,
            _ => 0,
        }
    }

    pub fn as_double(&self) -> f64 {
        match *self {
            VarData::Int(v) => v as f64,
            VarData::Uint(v) => v as f64,
            VarData::Double(v) => v,
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            VarData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            VarData::Bytes(b) => Some(b),
            VarData::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_signal(&self) -> Option<&Signal> {
        match self {
            VarData::Signal(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for VarData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (VarData::None, VarData::None) => true,
            (VarData::Int(a), VarData::Int(b)) => a == b,
            (VarData::Uint(a), VarData::Uint(b)) => a == b,
            (VarData::Double(a), VarData::Double(b)) => a == b,
            (VarData::Str(a), VarData::Str(b)) => a == b,
            (VarData::Bytes(a), VarData::Bytes(b)) => a == b,
            (VarData::Signal(a), VarData::Signal(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl From<u8> for VarData {
    fn from(v: u8) -> Self {
        VarData::Uint(v as u64)
    }
}

impl From<u64> for VarData {
    fn from(v: u64) -> Self {
        VarData::Uint(v)
    }
}

impl From<i64> for VarData {
    fn from(v: i64) -> Self {
        VarData::Int(v)
    }
}

impl From<f64> for VarData {
    fn from(v: f64) -> Self {
        VarData::Double(v)
    }
}

impl From<&str> for VarData {
    fn from(v: &str) -> Self {
        VarData::Str(v.to_string())
    }
}

// ─── Vector bitset ──────────────────────────────────────────────────────────

/// Set of interrupt vector indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VectorMask {
    words: Vec<u64>,
}

impl VectorMask {
    pub fn new() -> Self {
        VectorMask { words: Vec::new() }
    }

    pub fn insert(&mut self, v: VectorIndex) {
        let w = v / 64;
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1 << (v % 64);
    }

    pub fn contains(&self, v: VectorIndex) -> bool {
        self.words
            .get(v / 64)
            .map_or(false, |w| w & (1 << (v % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

impl FromIterator<VectorIndex> for VectorMask {
    fn from_iter<I: IntoIterator<Item = VectorIndex>>(iter: I) -> Self {
        let mut m = VectorMask::new();
        for v in iter {
            m.insert(v);
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        let id = str_to_id("IOGB");
        assert_eq!(id, port_id('B'));
        assert_eq!(id_to_str(id), "IOGB");
        assert_eq!(id_to_str(ID_SLEEP), "SLP");
        assert_eq!(str_to_id("SLP"), ID_SLEEP);
    }

    #[test]
    fn test_id_truncates_long_names() {
        assert_eq!(str_to_id("CORE_EXTRA"), ID_CORE);
    }

    #[test]
    fn test_regbit_field_ops() {
        let rb = RegBit::field(0x33, 1, 0x07);
        assert_eq!(rb.shifted(), 0x0E);
        assert_eq!(rb.extract(0b0000_1010), 0b101);
        assert_eq!(rb.replace(0xFF, 0b010), 0b1111_0101);
        assert_eq!(rb.set_to(0x00), 0x0E);
        assert_eq!(rb.clear_from(0xFF), 0xF1);
        assert!(rb.valid());
        assert!(!RegBit::none().valid());
    }

    #[test]
    fn test_vector_mask() {
        let m: VectorMask = [2usize, 70].into_iter().collect();
        assert!(m.contains(2));
        assert!(m.contains(70));
        assert!(!m.contains(5));
        assert!(!m.is_empty());
        assert!(VectorMask::new().is_empty());
    }

    #[test]
    fn test_vardata_conversions() {
        assert_eq!(VarData::Uint(7).as_int(), 7);
        assert_eq!(VarData::Double(2.5).as_uint(), 2);
        assert_eq!(VarData::from("abc").as_str(), Some("abc"));
        assert_eq!(VarData::None.as_double(), 0.0);
    }
}
