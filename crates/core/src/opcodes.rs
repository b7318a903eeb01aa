//! AVR instruction decoder.
//!
//! Turns one or two 16-bit program words into a typed [`Instruction`].
//! Covers the AVRe+ instruction set generated by avr-gcc, plus the extended
//! addressing forms (EIJMP, EICALL, ELPM) and the XMEGA read-modify-write
//! instructions (XCH, LAS, LAC, LAT).
//!
//! I/O operands (`a`) are I/O addresses, not data space addresses: the CPU
//! adds the I/O base of the device.

/// Decoded instruction with operands.
///
/// Register fields `d` and `r` are 0–31, `k` is an immediate or an
/// address, `b` a bit number, `s` a SREG bit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    // Arithmetic and logic
    Add { d: u8, r: u8 },
    Adc { d: u8, r: u8 },
    Sub { d: u8, r: u8 },
    Subi { d: u8, k: u8 },
    Sbc { d: u8, r: u8 },
    Sbci { d: u8, k: u8 },
    And { d: u8, r: u8 },
    Andi { d: u8, k: u8 },
    Or { d: u8, r: u8 },
    Ori { d: u8, k: u8 },
    Eor { d: u8, r: u8 },
    Com { d: u8 },
    Neg { d: u8 },
    Inc { d: u8 },
    Dec { d: u8 },
    Mul { d: u8, r: u8 },
    Muls { d: u8, r: u8 },
    Mulsu { d: u8, r: u8 },
    Fmul { d: u8, r: u8 },
    Fmuls { d: u8, r: u8 },
    Fmulsu { d: u8, r: u8 },
    Adiw { d: u8, k: u8 },
    Sbiw { d: u8, k: u8 },
    Cp { d: u8, r: u8 },
    Cpc { d: u8, r: u8 },
    Cpi { d: u8, k: u8 },
    // Data transfer
    Mov { d: u8, r: u8 },
    Movw { d: u8, r: u8 },
    Ldi { d: u8, k: u8 },
    Lds { d: u8, k: u16 },
    Sts { k: u16, r: u8 },
    /// LD through a pointer register, see [`Pointer`] and [`PtrMode`].
    Ld { d: u8, ptr: Pointer, mode: PtrMode },
    St { r: u8, ptr: Pointer, mode: PtrMode },
    /// LDD Rd, Y+q / Z+q
    Ldd { d: u8, ptr: Pointer, q: u8 },
    Std { r: u8, ptr: Pointer, q: u8 },
    Push { r: u8 },
    Pop { d: u8 },
    Xch { d: u8 },
    Las { d: u8 },
    Lac { d: u8 },
    Lat { d: u8 },
    // Program memory
    /// LPM / ELPM. `d == None` is the implied R0 form, `extended` selects RAMPZ:Z.
    Lpm { d: Option<u8>, inc: bool, extended: bool },
    Spm { inc: bool },
    // Shift and bit
    Lsr { d: u8 },
    Asr { d: u8 },
    Ror { d: u8 },
    Swap { d: u8 },
    Bst { d: u8, b: u8 },
    Bld { d: u8, b: u8 },
    Sbi { a: u8, b: u8 },
    Cbi { a: u8, b: u8 },
    /// SEC, SEI, SET... (BSET s)
    Bset { s: u8 },
    /// CLC, CLI, CLT... (BCLR s)
    Bclr { s: u8 },
    // Flow control
    Rjmp { k: i16 },
    Rcall { k: i16 },
    Jmp { k: u32 },
    Call { k: u32 },
    Ijmp,
    Icall,
    Eijmp,
    Eicall,
    Ret,
    Reti,
    Cpse { d: u8, r: u8 },
    Sbrc { r: u8, b: u8 },
    Sbrs { r: u8, b: u8 },
    Sbic { a: u8, b: u8 },
    Sbis { a: u8, b: u8 },
    Brbs { s: u8, k: i8 },
    Brbc { s: u8, k: i8 },
    // I/O
    In { d: u8, a: u8 },
    Out { a: u8, r: u8 },
    // MCU control
    Sleep,
    Wdr,
    Break,
    /// XMEGA DES round, not supported by this core.
    Des { k: u8 },
    Unknown(u16),
}

/// Pointer register pair used by LD/ST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    X,
    Y,
    Z,
}

impl Pointer {
    /// Index of the low register of the pair.
    #[inline(always)]
    pub fn reg(self) -> usize {
        match self {
            Pointer::X => 26,
            Pointer::Y => 28,
            Pointer::Z => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMode {
    Plain,
    PostInc,
    PreDec,
}

/// True if `word` is the first word of a two-word instruction
/// (JMP, CALL, LDS, STS). Used to size skips.
#[inline(always)]
pub fn is_two_word(word: u16) -> bool {
    word & 0xFE0C == 0x940C || word & 0xFC0F == 0x9000
}

/// Decode `word`, with `next_word` used by two-word instructions.
/// Returns the instruction and its size in words.
pub fn decode(word: u16, next_word: u16) -> (Instruction, u8) {
    use Instruction::*;

    // JMP: 1001 010k kkkk 110k + k16
    if word & 0xFE0E == 0x940C {
        return (Jmp { k: long_address(word, next_word) }, 2);
    }
    // CALL: 1001 010k kkkk 111k + k16
    if word & 0xFE0E == 0x940E {
        return (Call { k: long_address(word, next_word) }, 2);
    }
    // LDS: 1001 000d dddd 0000 + k16
    if word & 0xFE0F == 0x9000 {
        return (Lds { d: reg5(word), k: next_word }, 2);
    }
    // STS: 1001 001r rrrr 0000 + k16
    if word & 0xFE0F == 0x9200 {
        return (Sts { k: next_word, r: reg5(word) }, 2);
    }

    let inst = match word {
        0x0000 => Nop,
        0x9409 => Ijmp,
        0x9419 => Eijmp,
        0x9509 => Icall,
        0x9519 => Eicall,
        0x9508 => Ret,
        0x9518 => Reti,
        0x9588 => Sleep,
        0x9598 => Break,
        0x95A8 => Wdr,
        0x95C8 => Lpm { d: None, inc: false, extended: false },
        0x95D8 => Lpm { d: None, inc: false, extended: true },
        0x95E8 => Spm { inc: false },
        0x95F8 => Spm { inc: true },
        // BSET: 1001 0100 0sss 1000, BCLR: 1001 0100 1sss 1000
        w if w & 0xFF8F == 0x9408 => Bset { s: ((w >> 4) & 7) as u8 },
        w if w & 0xFF8F == 0x9488 => Bclr { s: ((w >> 4) & 7) as u8 },
        // DES: 1001 0100 KKKK 1011
        w if w & 0xFF0F == 0x940B => Des { k: ((w >> 4) & 0xF) as u8 },
        _ => match word >> 12 {
            0x0 => decode_0000(word),
            0x1 | 0x2 => decode_alu(word),
            0x3 => imm(word, |d, k| Cpi { d, k }),
            0x4 => imm(word, |d, k| Sbci { d, k }),
            0x5 => imm(word, |d, k| Subi { d, k }),
            0x6 => imm(word, |d, k| Ori { d, k }),
            0x7 => imm(word, |d, k| Andi { d, k }),
            0x8 | 0xA => decode_displacement(word),
            0x9 => decode_1001(word),
            0xB => {
                let a = (((word >> 5) & 0x30) | (word & 0xF)) as u8;
                if word & 0x0800 == 0 {
                    In { d: reg5(word), a }
                } else {
                    Out { a, r: reg5(word) }
                }
            }
            0xC => Rjmp { k: sign_extend_12(word & 0x0FFF) },
            0xD => Rcall { k: sign_extend_12(word & 0x0FFF) },
            0xE => imm(word, |d, k| Ldi { d, k }),
            _ => decode_1111(word),
        },
    };
    (inst, 1)
}

/// 0000 xxxx: NOP, MOVW, signed multiplies, CPC, SBC, ADD.
fn decode_0000(word: u16) -> Instruction {
    use Instruction::*;
    let hi = (((word >> 4) & 0x7) + 16) as u8;
    let lo = ((word & 0x7) + 16) as u8;
    match word & 0xFF00 {
        0x0100 => {
            return Movw { d: (((word >> 4) & 0xF) * 2) as u8, r: ((word & 0xF) * 2) as u8 };
        }
        0x0200 => {
            return Muls { d: (((word >> 4) & 0xF) + 16) as u8, r: ((word & 0xF) + 16) as u8 };
        }
        0x0300 => {
            return match word & 0x0088 {
                0x0000 => Mulsu { d: hi, r: lo },
                0x0008 => Fmul { d: hi, r: lo },
                0x0080 => Fmuls { d: hi, r: lo },
                _ => Fmulsu { d: hi, r: lo },
            };
        }
        _ => {}
    }
    let (d, r) = decode_5_5(word);
    match word & 0xFC00 {
        0x0400 => Cpc { d, r },
        0x0800 => Sbc { d, r },
        0x0C00 => Add { d, r },
        _ => Unknown(word),
    }
}

/// 0001 xxxx and 0010 xxxx: two register ALU operations.
fn decode_alu(word: u16) -> Instruction {
    use Instruction::*;
    let (d, r) = decode_5_5(word);
    match word & 0xFC00 {
        0x1000 => Cpse { d, r },
        0x1400 => Cp { d, r },
        0x1800 => Sub { d, r },
        0x1C00 => Adc { d, r },
        0x2000 => And { d, r },
        0x2400 => Eor { d, r },
        0x2800 => Or { d, r },
        _ => Mov { d, r },
    }
}

/// 10q0 qqsd dddd bqqq: LDD/STD with displacement, q = 0 is plain LD/ST.
fn decode_displacement(word: u16) -> Instruction {
    let q = ((((word >> 13) & 1) << 5) | (((word >> 10) & 3) << 3) | (word & 7)) as u8;
    let reg = reg5(word);
    let ptr = if word & 0x0008 != 0 { Pointer::Y } else { Pointer::Z };
    let store = word & 0x0200 != 0;
    match (store, q) {
        (false, 0) => Instruction::Ld { d: reg, ptr, mode: PtrMode::Plain },
        (true, 0) => Instruction::St { r: reg, ptr, mode: PtrMode::Plain },
        (false, q) => Instruction::Ldd { d: reg, ptr, q },
        (true, q) => Instruction::Std { r: reg, ptr, q },
    }
}

/// 1001 xxxx: single register operations, pointer loads and stores,
/// PUSH/POP, ADIW/SBIW, bit I/O and MUL.
fn decode_1001(word: u16) -> Instruction {
    use Instruction::*;
    let d = reg5(word);
    match word & 0xFE00 {
        // 1001 000d dddd xxxx
        0x9000 => {
            return match word & 0xF {
                0x1 => Ld { d, ptr: Pointer::Z, mode: PtrMode::PostInc },
                0x2 => Ld { d, ptr: Pointer::Z, mode: PtrMode::PreDec },
                0x4 => Lpm { d: Some(d), inc: false, extended: false },
                0x5 => Lpm { d: Some(d), inc: true, extended: false },
                0x6 => Lpm { d: Some(d), inc: false, extended: true },
                0x7 => Lpm { d: Some(d), inc: true, extended: true },
                0x9 => Ld { d, ptr: Pointer::Y, mode: PtrMode::PostInc },
                0xA => Ld { d, ptr: Pointer::Y, mode: PtrMode::PreDec },
                0xC => Ld { d, ptr: Pointer::X, mode: PtrMode::Plain },
                0xD => Ld { d, ptr: Pointer::X, mode: PtrMode::PostInc },
                0xE => Ld { d, ptr: Pointer::X, mode: PtrMode::PreDec },
                0xF => Pop { d },
                _ => Unknown(word),
            };
        }
        // 1001 001r rrrr xxxx
        0x9200 => {
            let r = d;
            return match word & 0xF {
                0x1 => St { r, ptr: Pointer::Z, mode: PtrMode::PostInc },
                0x2 => St { r, ptr: Pointer::Z, mode: PtrMode::PreDec },
                0x4 => Xch { d },
                0x5 => Las { d },
                0x6 => Lac { d },
                0x7 => Lat { d },
                0x9 => St { r, ptr: Pointer::Y, mode: PtrMode::PostInc },
                0xA => St { r, ptr: Pointer::Y, mode: PtrMode::PreDec },
                0xC => St { r, ptr: Pointer::X, mode: PtrMode::Plain },
                0xD => St { r, ptr: Pointer::X, mode: PtrMode::PostInc },
                0xE => St { r, ptr: Pointer::X, mode: PtrMode::PreDec },
                0xF => Push { r },
                _ => Unknown(word),
            };
        }
        // 1001 010d dddd xxxx
        0x9400 => {
            return match word & 0xF {
                0x0 => Com { d },
                0x1 => Neg { d },
                0x2 => Swap { d },
                0x3 => Inc { d },
                0x5 => Asr { d },
                0x6 => Lsr { d },
                0x7 => Ror { d },
                0xA => Dec { d },
                _ => Unknown(word),
            };
        }
        _ => {}
    }

    // ADIW/SBIW: 1001 011x KKdd KKKK
    let pair = ((((word >> 4) & 3) * 2) + 24) as u8;
    let k6 = (((word >> 2) & 0x30) | (word & 0x0F)) as u8;
    // SBI/CBI/SBIC/SBIS: 1001 10xx AAAA Abbb
    let a = ((word >> 3) & 0x1F) as u8;
    let b = (word & 7) as u8;
    match word & 0xFF00 {
        0x9600 => Adiw { d: pair, k: k6 },
        0x9700 => Sbiw { d: pair, k: k6 },
        0x9800 => Cbi { a, b },
        0x9900 => Sbic { a, b },
        0x9A00 => Sbi { a, b },
        0x9B00 => Sbis { a, b },
        _ if word & 0xFC00 == 0x9C00 => {
            let (d, r) = decode_5_5(word);
            Mul { d, r }
        }
        _ => Unknown(word),
    }
}

/// 1111 xxxx: conditional branches, BLD/BST, SBRC/SBRS.
fn decode_1111(word: u16) -> Instruction {
    use Instruction::*;
    let s = (word & 7) as u8;
    if word & 0x0800 == 0 {
        // BRBS/BRBC: 1111 0Xkk kkkk ksss, 7-bit signed offset
        let k = ((((word >> 3) & 0x7F) as i8) << 1) >> 1;
        return if word & 0x0400 == 0 { Brbs { s, k } } else { Brbc { s, k } };
    }
    if word & 0x0008 != 0 {
        return Unknown(word);
    }
    let r = reg5(word);
    match word & 0xFE00 {
        0xF800 => Bld { d: r, b: s },
        0xFA00 => Bst { d: r, b: s },
        0xFC00 => Sbrc { r, b: s },
        _ => Sbrs { r, b: s },
    }
}

// --- Operand helpers ---

/// 22-bit word address of JMP/CALL.
#[inline(always)]
fn long_address(word: u16, next_word: u16) -> u32 {
    let hi = ((word as u32 >> 3) & 0x3E) | (word as u32 & 1);
    (hi << 16) | next_word as u32
}

/// Rd/Rr in bits 8:4.
#[inline(always)]
fn reg5(word: u16) -> u8 {
    ((word >> 4) & 0x1F) as u8
}

/// d in bits 8:4, r in bits 9 and 3:0.
#[inline(always)]
fn decode_5_5(word: u16) -> (u8, u8) {
    let r = ((word & 0x0F) | ((word >> 5) & 0x10)) as u8;
    (reg5(word), r)
}

/// KKKK dddd KKKK immediate form, d in R16–R31.
#[inline(always)]
fn imm(word: u16, f: impl FnOnce(u8, u8) -> Instruction) -> Instruction {
    let d = (((word >> 4) & 0x0F) + 16) as u8;
    let k = (((word >> 4) & 0xF0) | (word & 0x0F)) as u8;
    f(d, k)
}

#[inline(always)]
fn sign_extend_12(val: u16) -> i16 {
    ((val << 4) as i16) >> 4
}
