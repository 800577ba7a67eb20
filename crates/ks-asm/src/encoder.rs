//! Shared encoding infrastructure.
//!
//! [`InstrBytes`] is the inline buffer every architecture encoder fills, and
//! [`EncodeCtx`] carries the per-pass state they read: the symbol table, the
//! address of the statement being encoded, the current code mode, and the
//! relaxation flags the layout pass drives.

use core::fmt;

#[allow(unused_imports)]
use alloc::format;
use alloc::vec::Vec;

use crate::arch::Arch;
use crate::error::{ErrorCode, Fault, Span};
use crate::ir::{Expr, Instruction};
use crate::symbols::{SymbolTable, Value};

// ─── InstrBytes: stack-allocated instruction buffer ────────────────────

/// Capacity of [`InstrBytes`].
const CAPACITY: usize = 32;

/// Stack-allocated instruction byte buffer.
///
/// x86 instructions are at most 15 bytes and ARM/AArch64 instructions are
/// 2 or 4, so a single inline buffer covers every encoder without touching
/// the heap.
#[derive(Clone)]
pub(crate) struct InstrBytes {
    data: [u8; CAPACITY],
    len: u8,
}

impl InstrBytes {
    /// Create an empty buffer.
    #[inline]
    pub const fn new() -> Self {
        Self {
            data: [0; CAPACITY],
            len: 0,
        }
    }

    /// Append a single byte. Bytes beyond the capacity are dropped.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        let len = self.len as usize;
        debug_assert!(len < CAPACITY, "InstrBytes overflow");
        if len < CAPACITY {
            self.data[len] = byte;
            self.len += 1;
        }
    }

    /// Append a slice of bytes.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    /// Append a 16-bit value in the requested byte order.
    #[inline]
    pub fn push_u16(&mut self, value: u16, big_endian: bool) {
        if big_endian {
            self.extend_from_slice(&value.to_be_bytes());
        } else {
            self.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Append a 32-bit value in the requested byte order.
    #[inline]
    pub fn push_u32(&mut self, value: u32, big_endian: bool) {
        if big_endian {
            self.extend_from_slice(&value.to_be_bytes());
        } else {
            self.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl Default for InstrBytes {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for InstrBytes {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl core::ops::DerefMut for InstrBytes {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len as usize]
    }
}

impl fmt::Debug for InstrBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl PartialEq for InstrBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for InstrBytes {}

impl PartialEq<[u8]> for InstrBytes {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

impl PartialEq<Vec<u8>> for InstrBytes {
    fn eq(&self, other: &Vec<u8>) -> bool {
        **self == **other
    }
}

// ─── Value ranges ──────────────────────────────────────────

/// Values accepted by an `n`-bit field that may be read signed or unsigned.
#[inline]
pub(crate) fn any_range(bits: u32) -> (i128, i128) {
    (-(1i128 << (bits - 1)), (1i128 << bits) - 1)
}

/// Values accepted by an `n`-bit two's complement field.
#[inline]
pub(crate) fn signed_range(bits: u32) -> (i128, i128) {
    (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
}

/// Values accepted by an `n`-bit unsigned field.
#[inline]
pub(crate) fn unsigned_range(bits: u32) -> (i128, i128) {
    (0, (1i128 << bits) - 1)
}

#[inline]
pub(crate) fn fits(value: i128, (min, max): (i128, i128)) -> bool {
    (min..=max).contains(&value)
}

// ─── Encoding context ──────────────────────────────────────

/// State shared by the layout driver and the architecture encoders.
pub(crate) struct EncodeCtx<'r> {
    pub symbols: SymbolTable<'r>,
    /// Address of the statement being encoded.
    pub addr: u64,
    /// Final pass: every value must fit its field.
    pub strict: bool,
    /// The statement was promoted to its long form in an earlier pass.
    pub long: bool,
    /// Set by an encoder that had to pick the long form of a relaxable branch.
    pub wants_long: bool,
    /// Current x86 code width in bits.
    pub x86_bits: u8,
    /// ARM state is Thumb.
    pub thumb: bool,
    pub big_endian: bool,
}

impl<'r> EncodeCtx<'r> {
    pub fn new(symbols: SymbolTable<'r>, x86_bits: u8, thumb: bool, big_endian: bool) -> Self {
        Self {
            symbols,
            addr: 0,
            strict: false,
            long: false,
            wants_long: false,
            x86_bits,
            thumb,
            big_endian,
        }
    }

    /// Evaluate `expr` at the current address.
    ///
    /// Faults without a location (such as division by zero) take `span`.
    pub fn eval(&mut self, expr: &Expr, span: Span) -> Result<Value, Fault> {
        self.symbols.eval(expr, self.addr).map_err(|mut fault| {
            if fault.span == Span::dummy() {
                fault.span = span;
            }
            fault
        })
    }

    /// Check `value` against an inclusive range.
    ///
    /// Before the final pass a relocatable value may still move, so an
    /// out-of-range result is tolerated and truncated by the caller.
    pub fn fit(&self, value: Value, range: (i128, i128), span: Span) -> Result<i128, Fault> {
        if fits(value.value, range) || (!self.strict && value.relocatable) {
            Ok(value.value)
        } else {
            Err(Fault::range(value.value, range.0, range.1, span))
        }
    }

    /// Evaluate and range-check in one step.
    pub fn eval_in(&mut self, expr: &Expr, range: (i128, i128), span: Span) -> Result<i128, Fault> {
        let value = self.eval(expr, span)?;
        self.fit(value, range, span)
    }

    /// Check that `value` is a multiple of `align`.
    pub fn aligned(&self, value: Value, align: i128, span: Span) -> Result<(), Fault> {
        if value.value % align == 0 || (!self.strict && value.relocatable) {
            Ok(())
        } else {
            Err(Fault::new(
                ErrorCode::FixupInvalid,
                format!("value {} is not a multiple of {}", value.value, align),
                span,
            ))
        }
    }
}

// ─── Dispatch ──────────────────────────────────────────────

/// Encode one instruction for `arch`.
pub(crate) fn encode_instruction(
    arch: Arch,
    instr: &Instruction,
    ctx: &mut EncodeCtx<'_>,
) -> Result<InstrBytes, Fault> {
    match arch {
        #[cfg(feature = "x86")]
        Arch::X86 => crate::x86::encode(instr, ctx),
        #[cfg(feature = "arm")]
        Arch::Arm => crate::arm::encode(instr, ctx),
        #[cfg(feature = "arm64")]
        Arch::Arm64 => crate::aarch64::encode(instr, ctx),
        _ => Err(Fault::new(
            ErrorCode::Arch,
            format!("no encoder for {}", arch),
            instr.span,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instr_bytes_push_and_deref() {
        let mut buf = InstrBytes::new();
        assert_eq!(buf.len(), 0);
        buf.push(0x90);
        buf.extend_from_slice(&[0x0F, 0x05]);
        assert_eq!(buf.len(), 3);
        assert_eq!(&*buf, &[0x90, 0x0F, 0x05]);
    }

    #[test]
    fn instr_bytes_endianness() {
        let mut buf = InstrBytes::new();
        buf.push_u32(0xD503_201F, false);
        buf.push_u16(0xBF00, true);
        assert_eq!(&*buf, &[0x1F, 0x20, 0x03, 0xD5, 0xBF, 0x00]);
    }

    #[test]
    fn ranges() {
        assert_eq!(any_range(8), (-128, 255));
        assert_eq!(signed_range(8), (-128, 127));
        assert_eq!(unsigned_range(12), (0, 4095));
        assert!(fits(-1, any_range(16)));
        assert!(!fits(256, any_range(8)));
    }

    #[test]
    fn lenient_fit_tolerates_relocatable_values() {
        let mut ctx = EncodeCtx::new(SymbolTable::new(None, 16), 32, false, false);
        let moving = Value {
            value: 1000,
            relocatable: true,
        };
        assert_eq!(ctx.fit(moving, signed_range(8), Span::dummy()), Ok(1000));
        assert!(ctx.fit(Value::constant(1000), signed_range(8), Span::dummy()).is_err());
        ctx.strict = true;
        let err = ctx.fit(moving, signed_range(8), Span::dummy()).unwrap_err();
        assert_eq!(err.code, ErrorCode::FixupInvalid);
    }
}
