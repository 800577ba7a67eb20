//! ARM (A32) and Thumb instruction encoder.
//!
//! A32 instructions are 32-bit words whose top nibble is the condition
//! code. Thumb instructions are one or two 16-bit halfwords; a 32-bit
//! Thumb-2 instruction stores its first halfword first. Big-endian modes
//! store words and halfwords big-endian.
//!
//! The instruction set in use follows the engine mode (`Mode::Thumb`) and
//! the `.arm` / `.thumb` / `.code 16|32` directives.
//!
//! ## A32 classes
//!
//! - **Data processing**: AND..MVN with rotated 8-bit immediates or
//!   shifted registers, the LSL/LSR/ASR/ROR/RRX aliases, MOVW/MOVT
//! - **Multiply**: MUL, MLA
//! - **Branch**: B, BL, BLX (label or register), BX
//! - **Load/Store**: LDR/STR(B) with 12-bit or register offsets,
//!   LDRH/STRH/LDRSB/LDRSH with split 8-bit offsets, PC-relative labels
//! - **Block transfer**: LDM/STM (all addressing modes), PUSH/POP
//! - **Misc**: SVC, NOP, BKPT
//!
//! ## Thumb classes
//!
//! 16-bit forms are preferred; a 32-bit Thumb-2 form is chosen when an
//! operand does not fit or the mnemonic carries `.w`. `B` and `B<cond>`
//! start short and are promoted to their 32-bit forms by the layout
//! passes when the target is out of range.

use alloc::format;

use crate::encoder::{any_range, fits, signed_range, unsigned_range, EncodeCtx, InstrBytes};
use crate::error::{ErrorCode, Fault, Span};
use crate::ir::*;
use crate::symbols::Value;

// ── Mnemonic decoding ────────────────────────────────────────────────────

/// ARM condition code field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => Cond::Eq,
            "ne" => Cond::Ne,
            "cs" | "hs" => Cond::Cs,
            "cc" | "lo" => Cond::Cc,
            "mi" => Cond::Mi,
            "pl" => Cond::Pl,
            "vs" => Cond::Vs,
            "vc" => Cond::Vc,
            "hi" => Cond::Hi,
            "ls" => Cond::Ls,
            "ge" => Cond::Ge,
            "lt" => Cond::Lt,
            "gt" => Cond::Gt,
            "le" => Cond::Le,
            "al" => Cond::Al,
            _ => return None,
        })
    }

    #[inline]
    fn bits(self) -> u32 {
        self as u32
    }
}

/// Explicit encoding width suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Any,
    /// `.n`
    Narrow,
    /// `.w`
    Wide,
}

/// A mnemonic split into base, `s` flag and condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mnemonic<'a> {
    base: &'a str,
    cond: Cond,
    set_flags: bool,
    width: Width,
}

/// Base mnemonics, sorted for binary search.
const BASES: &[&str] = &[
    "adc", "add", "addw", "and", "asr", "b", "bic", "bkpt", "bl", "blx", "bx", "cbnz", "cbz",
    "cmn", "cmp", "eor", "ldm", "ldmda", "ldmdb", "ldmea", "ldmed", "ldmfa", "ldmfd", "ldmia",
    "ldmib", "ldr", "ldrb", "ldrh", "ldrsb", "ldrsh", "lsl", "lsr", "mla", "mov", "movt", "movw",
    "mul", "mvn", "neg", "nop", "orr", "pop", "push", "ror", "rrx", "rsb", "rsc", "sbc", "stm",
    "stmda", "stmdb", "stmea", "stmed", "stmfa", "stmfd", "stmia", "stmib", "str", "strb",
    "strh", "sub", "subw", "svc", "swi", "teq", "tst",
];

/// Bases that take an `s` suffix.
fn sets_flags(base: &str) -> bool {
    matches!(
        base,
        "and"
            | "eor"
            | "sub"
            | "rsb"
            | "add"
            | "adc"
            | "sbc"
            | "rsc"
            | "orr"
            | "mov"
            | "bic"
            | "mvn"
            | "lsl"
            | "lsr"
            | "asr"
            | "ror"
            | "rrx"
            | "mul"
            | "mla"
            | "neg"
    )
}

fn is_base(s: &str) -> bool {
    BASES.binary_search(&s).is_ok()
}

/// Split `addseq`, `bne`, `movs`, `b.w` and the like.
///
/// The whole word is tried as a base first, so `teq` and `bls` never lose
/// letters to a condition or flag suffix they only look like.
fn split_mnemonic(full: &str) -> Option<Mnemonic<'_>> {
    let (m, width) = if let Some(m) = full.strip_suffix(".w") {
        (m, Width::Wide)
    } else if let Some(m) = full.strip_suffix(".n") {
        (m, Width::Narrow)
    } else {
        (full, Width::Any)
    };

    let conditional = m.len().checked_sub(2).and_then(|at| {
        let cond = Cond::parse(m.get(at..)?)?;
        Some((m.get(..at)?, cond))
    });

    for (stem, cond) in core::iter::once((m, Cond::Al)).chain(conditional) {
        if is_base(stem) {
            return Some(Mnemonic {
                base: stem,
                cond,
                set_flags: false,
                width,
            });
        }
        if let Some(base) = stem.strip_suffix('s') {
            if is_base(base) && sets_flags(base) {
                return Some(Mnemonic {
                    base,
                    cond,
                    set_flags: true,
                    width,
                });
            }
        }
    }
    None
}

// ── Operand helpers ──────────────────────────────────────────────────────

fn invalid(instr: &Instruction, i: usize, detail: &str) -> Fault {
    Fault::operand(format!("{}: {}", instr.mnemonic, detail), instr.op_span(i))
}

fn count(instr: &Instruction, min: usize, max: usize) -> Result<(), Fault> {
    let n = instr.operands.len();
    if (min..=max).contains(&n) {
        Ok(())
    } else if min == max {
        Err(instr.error(format!("'{}' expects {} operands", instr.mnemonic, min)))
    } else {
        Err(instr.error(format!(
            "'{}' expects {} to {} operands",
            instr.mnemonic, min, max
        )))
    }
}

fn reg(instr: &Instruction, i: usize) -> Result<u32, Fault> {
    match instr.operands.get(i) {
        Some(Operand::Reg(Register::Arm(r))) => Ok(u32::from(*r)),
        _ => Err(invalid(instr, i, "expected register")),
    }
}

/// A register in R0-R7.
fn lo(instr: &Instruction, i: usize) -> Result<u32, Fault> {
    let r = reg(instr, i)?;
    if r > 7 {
        return Err(invalid(instr, i, "expected a low register (r0-r7)"));
    }
    Ok(r)
}

/// Base register of a block transfer, with its `!` flag.
fn reg_writeback(instr: &Instruction, i: usize) -> Result<(u32, bool), Fault> {
    match instr.operands.get(i) {
        Some(Operand::Reg(Register::Arm(r))) => Ok((u32::from(*r), false)),
        Some(Operand::RegWriteback(Register::Arm(r))) => Ok((u32::from(*r), true)),
        _ => Err(invalid(instr, i, "expected register")),
    }
}

fn reg_list(instr: &Instruction, i: usize) -> Result<u32, Fault> {
    match instr.operands.get(i) {
        Some(Operand::RegList(0)) => Err(invalid(instr, i, "empty register list")),
        Some(Operand::RegList(mask)) => Ok(u32::from(*mask)),
        _ => Err(invalid(instr, i, "expected register list")),
    }
}

fn expr(instr: &Instruction, i: usize) -> Result<&Expr, Fault> {
    match instr.operands.get(i) {
        Some(Operand::Imm(e)) => Ok(e),
        _ => Err(invalid(instr, i, "expected immediate")),
    }
}

fn is_imm(instr: &Instruction, i: usize) -> bool {
    matches!(instr.operands.get(i), Some(Operand::Imm(_)))
}

/// Evaluate operand `i` as a 32-bit pattern.
///
/// The returned value still carries its `relocatable` flag so callers can
/// tolerate an unencodable constant before the final pass.
fn imm32(ctx: &mut EncodeCtx<'_>, instr: &Instruction, i: usize) -> Result<Value, Fault> {
    let span = instr.op_span(i);
    let value = ctx.eval(expr(instr, i)?, span)?;
    let v = ctx.fit(value, any_range(32), span)?;
    Ok(Value { value: v, ..value })
}

/// Whether `value` may still change in a later layout pass.
#[inline]
fn moving(ctx: &EncodeCtx<'_>, value: Value) -> bool {
    value.relocatable && !ctx.strict
}

fn no_encoding(instr: &Instruction, i: usize, value: u32) -> Fault {
    Fault::new(
        ErrorCode::FixupInvalid,
        format!("{}: immediate {:#x} cannot be encoded", instr.mnemonic, value),
        instr.op_span(i),
    )
}

/// `target - base` as a moving value.
fn pc_relative(
    ctx: &mut EncodeCtx<'_>,
    target: &Expr,
    base: u64,
    span: Span,
) -> Result<Value, Fault> {
    let target = ctx.eval(target, span)?;
    Ok(Value {
        value: target.value - i128::from(base),
        relocatable: true,
    })
}

/// Branch displacement from `pc`, aligned and range-checked.
fn branch_offset(
    ctx: &mut EncodeCtx<'_>,
    target: &Expr,
    pc: u64,
    bits: u32,
    align: i128,
    span: Span,
) -> Result<i128, Fault> {
    let offset = pc_relative(ctx, target, pc, span)?;
    ctx.aligned(offset, align, span)?;
    ctx.fit(offset, signed_range(bits), span)
}

// ── Immediates ───────────────────────────────────────────────────────────

/// A32 modified immediate: an 8-bit value rotated right by an even amount.
///
/// Returns the 12-bit `rotate:imm8` field.
pub(crate) fn encode_arm_imm(value: u32) -> Option<u32> {
    (0..16u32).find_map(|rot| {
        let unrotated = value.rotate_left(rot * 2);
        (unrotated <= 0xFF).then_some(rot << 8 | unrotated)
    })
}

/// Thumb-2 modified immediate, as the 12-bit `i:imm3:imm8` field.
pub(crate) fn encode_thumb_imm(value: u32) -> Option<u32> {
    let b = value & 0xFF;
    if value <= 0xFF {
        return Some(value);
    }
    if value == b << 16 | b {
        return Some(0x100 | b);
    }
    let x = value >> 8 & 0xFF;
    if value == x << 24 | x << 8 {
        return Some(0x200 | x);
    }
    if value == b.wrapping_mul(0x0101_0101) {
        return Some(0x300 | b);
    }
    (8..32u32).find_map(|rot| {
        let unrotated = value.rotate_left(rot);
        (unrotated <= 0xFF && unrotated & 0x80 != 0).then_some(rot << 7 | unrotated & 0x7F)
    })
}

/// Scatter a 12-bit Thumb-2 immediate into `(hw1 bits, hw2 bits)`.
#[inline]
fn t32_imm(enc: u32) -> (u32, u32) {
    ((enc >> 11 & 1) << 10, (enc >> 8 & 7) << 12 | enc & 0xFF)
}

// ── A32 ──────────────────────────────────────────────────────────────────

const OP_AND: u32 = 0;
const OP_SUB: u32 = 2;
const OP_RSB: u32 = 3;
const OP_ADD: u32 = 4;
const OP_ADC: u32 = 5;
const OP_SBC: u32 = 6;
const OP_TST: u32 = 8;
const OP_CMP: u32 = 10;
const OP_CMN: u32 = 11;
const OP_MOV: u32 = 13;
const OP_BIC: u32 = 14;
const OP_MVN: u32 = 15;

fn dp_opcode(base: &str) -> Option<u32> {
    Some(match base {
        "and" => OP_AND,
        "eor" => 1,
        "sub" => OP_SUB,
        "rsb" => OP_RSB,
        "add" => OP_ADD,
        "adc" => OP_ADC,
        "sbc" => OP_SBC,
        "rsc" => 7,
        "tst" => OP_TST,
        "teq" => 9,
        "cmp" => OP_CMP,
        "cmn" => OP_CMN,
        "orr" => 12,
        "mov" => OP_MOV,
        "bic" => OP_BIC,
        "mvn" => OP_MVN,
        _ => return None,
    })
}

/// Encode `value` for data-processing opcode `op`, switching to the
/// complementary opcode (MOV/MVN, ADD/SUB, ...) when only the inverted or
/// negated value is encodable.
fn dp_immediate(op: u32, value: u32) -> Option<(u32, u32)> {
    if let Some(imm12) = encode_arm_imm(value) {
        return Some((op, imm12));
    }
    let (alt, value) = match op {
        OP_MOV => (OP_MVN, !value),
        OP_MVN => (OP_MOV, !value),
        OP_AND => (OP_BIC, !value),
        OP_BIC => (OP_AND, !value),
        OP_ADC => (OP_SBC, !value),
        OP_SBC => (OP_ADC, !value),
        OP_ADD => (OP_SUB, value.wrapping_neg()),
        OP_SUB => (OP_ADD, value.wrapping_neg()),
        OP_CMP => (OP_CMN, value.wrapping_neg()),
        OP_CMN => (OP_CMP, value.wrapping_neg()),
        _ => return None,
    };
    encode_arm_imm(value).map(|imm12| (alt, imm12))
}

fn shift_type(kind: ShiftKind) -> Option<u32> {
    match kind {
        ShiftKind::Lsl => Some(0),
        ShiftKind::Lsr => Some(1),
        ShiftKind::Asr => Some(2),
        ShiftKind::Ror => Some(3),
        _ => None,
    }
}

/// Operand-2 register form: `rm{, <shift> #n | <shift> rs | rrx}`.
fn shifted_register(
    ctx: &mut EncodeCtx<'_>,
    instr: &Instruction,
    rm: u32,
    shift: Option<&Shift>,
    at: usize,
    register_amount: bool,
) -> Result<u32, Fault> {
    let Some(shift) = shift else {
        return Ok(rm);
    };
    if shift.kind == ShiftKind::Rrx {
        return match shift.amount {
            ShiftAmount::None => Ok(3 << 5 | rm),
            _ => Err(invalid(instr, at, "rrx takes no shift amount")),
        };
    }
    let ty = shift_type(shift.kind)
        .ok_or_else(|| invalid(instr, at, "extend operators are not available in ARM state"))?;
    match &shift.amount {
        ShiftAmount::Reg(Register::Arm(rs)) if register_amount => {
            Ok(u32::from(*rs) << 8 | ty << 5 | 1 << 4 | rm)
        }
        ShiftAmount::Imm(e) => {
            let span = instr.op_span(at);
            let n = ctx.eval_in(e, (0, 32), span)? as u32;
            let (ty, imm5) = match (ty, n) {
                (_, 0) => (0, 0),
                (0 | 3, 32) => return Err(Fault::range(32, 0, 31, span)),
                (_, n) => (ty, n & 31),
            };
            Ok(imm5 << 7 | ty << 5 | rm)
        }
        _ => Err(invalid(instr, at, "expected shift amount")),
    }
}

fn shift_at(instr: &Instruction, i: usize) -> Result<Option<&Shift>, Fault> {
    match instr.operands.get(i) {
        None => Ok(None),
        Some(Operand::Shift(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(instr, i, "expected shift")),
    }
}

fn a32_movw(cond: u32, rd: u32, value: u32, top: bool) -> u32 {
    cond | 0x0300_0000 | u32::from(top) << 22 | (value >> 12 & 0xF) << 16 | rd << 12 | value & 0xFFF
}

fn encode_a32(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<u32, Fault> {
    let cond = m.cond.bits() << 28;
    let s = u32::from(m.set_flags) << 20;

    if let Some(op) = dp_opcode(m.base) {
        return a32_data_processing(m, op, instr, ctx);
    }

    match m.base {
        "lsl" | "lsr" | "asr" | "ror" => {
            count(instr, 2, 3)?;
            let rd = reg(instr, 0)?;
            let (rm, at) = if instr.operands.len() == 3 {
                (reg(instr, 1)?, 2)
            } else {
                (rd, 1)
            };
            let kind = ShiftKind::parse(m.base).ok_or_else(|| instr.error("bad shift"))?;
            let amount = match &instr.operands[at] {
                Operand::Imm(e) => ShiftAmount::Imm(e.clone()),
                Operand::Reg(r) => ShiftAmount::Reg(*r),
                _ => return Err(invalid(instr, at, "expected register or immediate")),
            };
            let shift = Shift { kind, amount };
            let op2 = shifted_register(ctx, instr, rm, Some(&shift), at, true)?;
            Ok(cond | OP_MOV << 21 | s | rd << 12 | op2)
        }
        "rrx" => {
            count(instr, 2, 2)?;
            let (rd, rm) = (reg(instr, 0)?, reg(instr, 1)?);
            Ok(cond | OP_MOV << 21 | s | rd << 12 | 3 << 5 | rm)
        }
        "neg" => {
            count(instr, 2, 2)?;
            let (rd, rm) = (reg(instr, 0)?, reg(instr, 1)?);
            Ok(cond | 1 << 25 | OP_RSB << 21 | s | rm << 16 | rd << 12)
        }
        "mul" => {
            count(instr, 2, 3)?;
            let rd = reg(instr, 0)?;
            let (rm, rs) = if instr.operands.len() == 3 {
                (reg(instr, 1)?, reg(instr, 2)?)
            } else {
                (rd, reg(instr, 1)?)
            };
            Ok(cond | s | rd << 16 | rs << 8 | 0x90 | rm)
        }
        "mla" => {
            count(instr, 4, 4)?;
            let (rd, rm, rs, ra) = (
                reg(instr, 0)?,
                reg(instr, 1)?,
                reg(instr, 2)?,
                reg(instr, 3)?,
            );
            Ok(cond | 1 << 21 | s | rd << 16 | ra << 12 | rs << 8 | 0x90 | rm)
        }
        "movw" | "movt" => {
            count(instr, 2, 2)?;
            let rd = reg(instr, 0)?;
            let value = ctx.eval_in(expr(instr, 1)?, unsigned_range(16), instr.op_span(1))?;
            Ok(a32_movw(cond, rd, value as u32, m.base == "movt"))
        }
        "b" | "bl" => {
            count(instr, 1, 1)?;
            let pc = ctx.addr.wrapping_add(8);
            let off = branch_offset(ctx, expr(instr, 0)?, pc, 26, 4, instr.op_span(0))?;
            let link = u32::from(m.base == "bl") << 24;
            Ok(cond | 0x0A00_0000 | link | (off >> 2) as u32 & 0x00FF_FFFF)
        }
        "bx" => {
            count(instr, 1, 1)?;
            Ok(cond | 0x012F_FF10 | reg(instr, 0)?)
        }
        "blx" => {
            count(instr, 1, 1)?;
            if !is_imm(instr, 0) {
                return Ok(cond | 0x012F_FF30 | reg(instr, 0)?);
            }
            if m.cond != Cond::Al {
                return Err(instr.error("blx with a label cannot be conditional"));
            }
            let pc = ctx.addr.wrapping_add(8);
            let off = branch_offset(ctx, expr(instr, 0)?, pc, 26, 2, instr.op_span(0))?;
            let h = (off >> 1 & 1) as u32;
            Ok(0xFA00_0000 | h << 24 | (off >> 2) as u32 & 0x00FF_FFFF)
        }
        "ldr" | "str" | "ldrb" | "strb" | "ldrh" | "strh" | "ldrsb" | "ldrsh" => {
            a32_load_store(m, instr, ctx)
        }
        "push" | "pop" => {
            count(instr, 1, 1)?;
            let mask = reg_list(instr, 0)?;
            let push = m.base == "push";
            if mask.count_ones() == 1 {
                let rt = mask.trailing_zeros();
                // str rt, [sp, #-4]! / ldr rt, [sp], #4
                let word = if push { 0x052D_0004 } else { 0x049D_0004 };
                Ok(cond | word | rt << 12)
            } else {
                let word = if push { 0x092D_0000 } else { 0x08BD_0000 };
                Ok(cond | word | mask)
            }
        }
        "svc" | "swi" => {
            count(instr, 1, 1)?;
            let imm = ctx.eval_in(expr(instr, 0)?, unsigned_range(24), instr.op_span(0))?;
            Ok(cond | 0x0F00_0000 | imm as u32)
        }
        "nop" => {
            count(instr, 0, 0)?;
            Ok(cond | 0x0320_F000)
        }
        "bkpt" => {
            count(instr, 0, 1)?;
            if m.cond != Cond::Al {
                return Err(instr.error("bkpt cannot be conditional"));
            }
            let imm = match instr.operands.first() {
                Some(_) => ctx.eval_in(expr(instr, 0)?, unsigned_range(16), instr.op_span(0))? as u32,
                None => 0,
            };
            Ok(0xE120_0070 | (imm >> 4) << 8 | imm & 0xF)
        }
        base if block_mode(base).is_some() => a32_block(m, instr),
        _ => Err(Fault::new(
            ErrorCode::InsnUnsupported,
            format!("'{}' is only available in Thumb state", instr.mnemonic),
            instr.span,
        )),
    }
}

fn a32_data_processing(
    m: &Mnemonic<'_>,
    op: u32,
    instr: &Instruction,
    ctx: &mut EncodeCtx<'_>,
) -> Result<u32, Fault> {
    let cond = m.cond.bits() << 28;
    let compare = (OP_TST..=OP_CMN).contains(&op);
    let (rd, rn, at) = match op {
        OP_MOV | OP_MVN => {
            count(instr, 2, 3)?;
            (reg(instr, 0)?, 0, 1)
        }
        _ if compare => {
            count(instr, 2, 3)?;
            (0, reg(instr, 0)?, 1)
        }
        _ => {
            count(instr, 2, 4)?;
            let rd = reg(instr, 0)?;
            match instr.operands.get(2) {
                None | Some(Operand::Shift(_)) => (rd, rd, 1),
                Some(_) => (rd, reg(instr, 1)?, 2),
            }
        }
    };
    let s = u32::from(compare || m.set_flags);

    let (op, operand2) = match &instr.operands[at] {
        Operand::Imm(_) => {
            if instr.operands.len() > at + 1 {
                return Err(invalid(instr, at + 1, "unexpected operand"));
            }
            let value = imm32(ctx, instr, at)?;
            let bits = value.value as u32;
            match dp_immediate(op, bits) {
                Some((op, imm12)) => (op, 1 << 25 | imm12),
                None if op == OP_MOV && s == 0 && bits <= 0xFFFF => {
                    return Ok(a32_movw(cond, rd, bits, false));
                }
                None if moving(ctx, value) => (op, 1 << 25),
                None => return Err(no_encoding(instr, at, bits)),
            }
        }
        Operand::Reg(Register::Arm(rm)) => {
            if instr.operands.len() > at + 2 {
                return Err(invalid(instr, at + 2, "unexpected operand"));
            }
            let shift = shift_at(instr, at + 1)?;
            (op, shifted_register(ctx, instr, u32::from(*rm), shift, at + 1, true)?)
        }
        _ => return Err(invalid(instr, at, "expected register or immediate")),
    };
    Ok(cond | op << 21 | s << 20 | rn << 16 | rd << 12 | operand2)
}

// ── Addressing (shared) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Word,
    Byte,
    Half,
    SignedByte,
    SignedHalf,
}

fn access(base: &str) -> (Access, bool) {
    match base {
        "ldr" => (Access::Word, true),
        "str" => (Access::Word, false),
        "ldrb" => (Access::Byte, true),
        "strb" => (Access::Byte, false),
        "ldrh" => (Access::Half, true),
        "strh" => (Access::Half, false),
        "ldrsb" => (Access::SignedByte, true),
        _ => (Access::SignedHalf, true),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    Offset,
    Pre,
    Post,
}

#[derive(Clone, Copy)]
enum Offset<'a> {
    Imm(&'a Expr, Span),
    Reg {
        rm: u32,
        subtract: bool,
        shift: Option<&'a Shift>,
    },
}

struct Address<'a> {
    rn: u32,
    offset: Option<Offset<'a>>,
    index: Index,
}

/// Decode `[rn, offset]{!}` at operand 1, plus a post-index operand at 2.
fn address(instr: &Instruction) -> Result<Address<'_>, Fault> {
    let Some(Operand::ArmMem(mem)) = instr.operands.get(1) else {
        return Err(invalid(instr, 1, "expected memory operand"));
    };
    let Register::Arm(rn) = mem.base else {
        return Err(invalid(instr, 1, "expected base register"));
    };
    let in_brackets = match &mem.offset {
        ArmOffset::None => None,
        ArmOffset::Imm(e) => Some(Offset::Imm(e, instr.op_span(1))),
        ArmOffset::Reg {
            reg: Register::Arm(rm),
            subtract,
            shift,
        } => Some(Offset::Reg {
            rm: u32::from(*rm),
            subtract: *subtract,
            shift: shift.as_ref(),
        }),
        ArmOffset::Reg { .. } => return Err(invalid(instr, 1, "expected offset register")),
    };

    if instr.operands.len() == 2 {
        let index = if mem.writeback { Index::Pre } else { Index::Offset };
        return Ok(Address {
            rn: u32::from(rn),
            offset: in_brackets,
            index,
        });
    }

    if in_brackets.is_some() || mem.writeback {
        return Err(invalid(instr, 2, "unexpected operand after indexed address"));
    }
    let offset = match instr.operands.get(2) {
        Some(Operand::Imm(e)) => Offset::Imm(e, instr.op_span(2)),
        Some(Operand::Reg(Register::Arm(rm))) => Offset::Reg {
            rm: u32::from(*rm),
            subtract: false,
            shift: shift_at(instr, 3)?,
        },
        _ => return Err(invalid(instr, 2, "expected post-index offset")),
    };
    let max = if matches!(instr.operands.get(3), Some(Operand::Shift(_))) {
        4
    } else {
        3
    };
    if instr.operands.len() > max {
        return Err(invalid(instr, max, "unexpected operand"));
    }
    Ok(Address {
        rn: u32::from(rn),
        offset: Some(offset),
        index: Index::Post,
    })
}

fn a32_load_store(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<u32, Fault> {
    let cond = m.cond.bits() << 28;
    let (kind, load) = access(m.base);
    let wide_form = matches!(kind, Access::Word | Access::Byte);
    let limit: i128 = if wide_form { 4095 } else { 255 };
    let rt = reg(instr, 0)?;

    let (rn, p, w, u, offset_bits, register_offset): (u32, u32, u32, u32, u32, bool) = if is_imm(instr, 1) {
        count(instr, 2, 2)?;
        if !load {
            return Err(invalid(instr, 1, "stores need a memory operand"));
        }
        let span = instr.op_span(1);
        let pc = ctx.addr.wrapping_add(8);
        let offset = pc_relative(ctx, expr(instr, 1)?, pc, span)?;
        let v = ctx.fit(offset, (-limit, limit), span)?;
        (15, 1, 0, u32::from(v >= 0), v.unsigned_abs() as u32, false)
    } else {
        count(instr, 2, 4)?;
        let addr = address(instr)?;
        let (p, w) = match addr.index {
            Index::Offset => (1, 0),
            Index::Pre => (1, 1),
            Index::Post => (0, 0),
        };
        match addr.offset {
            None => (addr.rn, p, w, 1, 0, false),
            Some(Offset::Imm(e, span)) => {
                let v = ctx.eval_in(e, (-limit, limit), span)?;
                (addr.rn, p, w, u32::from(v >= 0), v.unsigned_abs() as u32, false)
            }
            Some(Offset::Reg { rm, subtract, shift }) => {
                if !wide_form && shift.is_some() {
                    return Err(invalid(instr, 1, "halfword transfers cannot shift the offset"));
                }
                let bits = shifted_register(ctx, instr, rm, shift, 1, false)?;
                (addr.rn, p, w, u32::from(!subtract), bits, true)
            }
        }
    };

    let l = u32::from(load);
    let common = cond | p << 24 | u << 23 | w << 21 | l << 20 | rn << 16 | rt << 12;
    if wide_form {
        let b = u32::from(kind == Access::Byte);
        let i = u32::from(register_offset);
        Ok(common | 0x0400_0000 | i << 25 | b << 22 | offset_bits)
    } else {
        let sh = match kind {
            Access::SignedByte => 0xD0,
            Access::SignedHalf => 0xF0,
            _ => 0xB0,
        };
        if register_offset {
            Ok(common | sh | offset_bits)
        } else {
            Ok(common | 1 << 22 | (offset_bits >> 4) << 8 | sh | offset_bits & 0xF)
        }
    }
}

/// `(load, P:U)` for a block-transfer mnemonic.
fn block_mode(base: &str) -> Option<(bool, u32)> {
    Some(match base {
        "ldm" | "ldmia" | "ldmfd" => (true, 0b01),
        "ldmib" | "ldmed" => (true, 0b11),
        "ldmda" | "ldmfa" => (true, 0b00),
        "ldmdb" | "ldmea" => (true, 0b10),
        "stm" | "stmia" | "stmea" => (false, 0b01),
        "stmib" | "stmfa" => (false, 0b11),
        "stmda" | "stmed" => (false, 0b00),
        "stmdb" | "stmfd" => (false, 0b10),
        _ => return None,
    })
}

fn a32_block(m: &Mnemonic<'_>, instr: &Instruction) -> Result<u32, Fault> {
    count(instr, 2, 2)?;
    let (load, pu) = block_mode(m.base).ok_or_else(|| instr.error("bad block transfer"))?;
    let (rn, writeback) = reg_writeback(instr, 0)?;
    let mask = reg_list(instr, 1)?;
    Ok(m.cond.bits() << 28
        | 0x0800_0000
        | pu << 23
        | u32::from(writeback) << 21
        | u32::from(load) << 20
        | rn << 16
        | mask)
}

// ── Thumb ────────────────────────────────────────────────────────────────

/// An encoded Thumb instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Thumb {
    Narrow(u16),
    Wide(u16, u16),
}

#[inline]
fn narrow(hw: u32) -> Thumb {
    Thumb::Narrow(hw as u16)
}

#[inline]
fn wide(hw1: u32, hw2: u32) -> Thumb {
    Thumb::Wide(hw1 as u16, hw2 as u16)
}

/// B.W / BL / BLX: 25-bit offset split into S, J1, J2, imm10, imm11.
fn t32_branch(offset: i128, second: u32) -> Thumb {
    let v = offset as u32;
    let s = v >> 24 & 1;
    let j1 = !(v >> 23 ^ s) & 1;
    let j2 = !(v >> 22 ^ s) & 1;
    wide(
        0xF000 | s << 10 | v >> 12 & 0x3FF,
        second | j1 << 13 | j2 << 11 | v >> 1 & 0x7FF,
    )
}

/// B<cond>.W: 21-bit offset split into S, J1, J2, imm6, imm11.
fn t32_cond_branch(offset: i128, cond: Cond) -> Thumb {
    let v = offset as u32;
    let s = v >> 20 & 1;
    let j2 = v >> 19 & 1;
    let j1 = v >> 18 & 1;
    wide(
        0xF000 | s << 10 | cond.bits() << 6 | v >> 12 & 0x3F,
        0x8000 | j1 << 13 | j2 << 11 | v >> 1 & 0x7FF,
    )
}

fn encode_thumb(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<Thumb, Fault> {
    if m.cond != Cond::Al && m.base != "b" {
        return Err(Fault::new(
            ErrorCode::InsnUnsupported,
            format!("conditional '{}' needs an IT block", instr.mnemonic),
            instr.span,
        ));
    }
    let short = m.width != Width::Wide;

    let form = match m.base {
        "nop" => {
            count(instr, 0, 0)?;
            if short {
                narrow(0xBF00)
            } else {
                wide(0xF3AF, 0x8000)
            }
        }
        "bkpt" | "svc" | "swi" => {
            count(instr, 0, 1)?;
            let imm = match instr.operands.first() {
                Some(_) => ctx.eval_in(expr(instr, 0)?, unsigned_range(8), instr.op_span(0))? as u32,
                None if m.base == "bkpt" => 0,
                None => return Err(instr.error("svc needs an immediate")),
            };
            narrow((if m.base == "bkpt" { 0xBE00 } else { 0xDF00 }) | imm)
        }
        "bx" => {
            count(instr, 1, 1)?;
            narrow(0x4700 | reg(instr, 0)? << 3)
        }
        "blx" if !is_imm(instr, 0) => {
            count(instr, 1, 1)?;
            narrow(0x4780 | reg(instr, 0)? << 3)
        }
        "blx" => {
            count(instr, 1, 1)?;
            let pc = ctx.addr.wrapping_add(4) & !3;
            let off = branch_offset(ctx, expr(instr, 0)?, pc, 25, 4, instr.op_span(0))?;
            t32_branch(off, 0xC000)
        }
        "bl" => {
            count(instr, 1, 1)?;
            let pc = ctx.addr.wrapping_add(4);
            let off = branch_offset(ctx, expr(instr, 0)?, pc, 25, 2, instr.op_span(0))?;
            t32_branch(off, 0xD000)
        }
        "b" => thumb_branch(m, instr, ctx)?,
        "cbz" | "cbnz" => {
            count(instr, 2, 2)?;
            let rn = lo(instr, 0)?;
            let span = instr.op_span(1);
            let pc = ctx.addr.wrapping_add(4);
            let offset = pc_relative(ctx, expr(instr, 1)?, pc, span)?;
            ctx.aligned(offset, 2, span)?;
            let v = ctx.fit(offset, (0, 126), span)? as u32;
            let op = if m.base == "cbz" { 0xB100 } else { 0xB900 };
            narrow(op | (v >> 6 & 1) << 9 | (v >> 1 & 0x1F) << 3 | rn)
        }
        "mov" => thumb_mov(m, instr, ctx, short)?,
        "movw" | "movt" => {
            count(instr, 2, 2)?;
            let rd = reg(instr, 0)?;
            let v = ctx.eval_in(expr(instr, 1)?, unsigned_range(16), instr.op_span(1))? as u32;
            let op = if m.base == "movw" { 0xF240 } else { 0xF2C0 };
            wide(
                op | (v >> 11 & 1) << 10 | v >> 12,
                (v >> 8 & 7) << 12 | rd << 8 | v & 0xFF,
            )
        }
        "mvn" => {
            count(instr, 2, 2)?;
            narrow(0x43C0 | lo(instr, 1)? << 3 | lo(instr, 0)?)
        }
        "add" | "sub" => thumb_add_sub(m, instr, ctx, short)?,
        "addw" | "subw" => {
            count(instr, 3, 3)?;
            let (rd, rn) = (reg(instr, 0)?, reg(instr, 1)?);
            let v = ctx.eval_in(expr(instr, 2)?, unsigned_range(12), instr.op_span(2))? as u32;
            let op = if m.base == "addw" { 0xF200 } else { 0xF2A0 };
            let (i, rest) = t32_imm(v);
            wide(op | i | rn, rest | rd << 8)
        }
        "cmp" | "cmn" | "tst" => thumb_compare(m, instr, ctx, short)?,
        "and" => thumb_alu(instr, 0x4000, true)?,
        "eor" => thumb_alu(instr, 0x4040, true)?,
        "adc" => thumb_alu(instr, 0x4140, true)?,
        "sbc" => thumb_alu(instr, 0x4180, false)?,
        "orr" => thumb_alu(instr, 0x4300, true)?,
        "bic" => thumb_alu(instr, 0x4380, false)?,
        "mul" => thumb_alu(instr, 0x4340, true)?,
        "neg" | "rsb" => {
            if m.base == "rsb" {
                count(instr, 3, 3)?;
                if ctx.eval_in(expr(instr, 2)?, any_range(32), instr.op_span(2))? != 0 {
                    return Err(invalid(instr, 2, "only #0 is encodable here"));
                }
            } else {
                count(instr, 2, 2)?;
            }
            narrow(0x4240 | lo(instr, 1)? << 3 | lo(instr, 0)?)
        }
        "lsl" | "lsr" | "asr" | "ror" => thumb_shift(m, instr, ctx)?,
        "ldr" | "str" | "ldrb" | "strb" | "ldrh" | "strh" | "ldrsb" | "ldrsh" => {
            thumb_load_store(m, instr, ctx, short)?
        }
        "push" | "pop" => {
            count(instr, 1, 1)?;
            let mask = reg_list(instr, 0)?;
            let push = m.base == "push";
            let extra = if push { 1 << 14 } else { 1 << 15 };
            if short && mask & !(0xFF | extra) == 0 {
                let op = if push { 0xB400 } else { 0xBC00 };
                narrow(op | u32::from(mask & extra != 0) << 8 | mask & 0xFF)
            } else if mask.count_ones() == 1 {
                let rt = mask.trailing_zeros();
                if push {
                    wide(0xF84D, rt << 12 | 0x0D04)
                } else {
                    wide(0xF85D, rt << 12 | 0x0B04)
                }
            } else if mask & (1 << 13) != 0 || (push && mask & (1 << 15) != 0) {
                return Err(invalid(instr, 0, "register list cannot contain sp or pc here"));
            } else if push {
                wide(0xE92D, mask)
            } else {
                wide(0xE8BD, mask)
            }
        }
        "ldm" | "ldmia" | "ldmfd" | "stm" | "stmia" | "stmea" => {
            count(instr, 2, 2)?;
            let (rn, writeback) = reg_writeback(instr, 0)?;
            let mask = reg_list(instr, 1)?;
            let load = m.base.starts_with("ldm");
            if rn > 7 || mask > 0xFF {
                return Err(invalid(instr, 1, "only low registers are supported"));
            }
            // Writeback is implied unless a load overwrites the base.
            if writeback == (load && mask & (1 << rn) != 0) {
                return Err(invalid(instr, 0, "base writeback does not match the register list"));
            }
            narrow((if load { 0xC800 } else { 0xC000 }) | rn << 8 | mask)
        }
        _ => {
            return Err(Fault::new(
                ErrorCode::InsnUnsupported,
                format!("'{}' is not available in Thumb state", instr.mnemonic),
                instr.span,
            ))
        }
    };

    if m.width == Width::Narrow && matches!(form, Thumb::Wide(..)) {
        return Err(instr.error(format!("'{}' has no 16-bit encoding for these operands", instr.mnemonic)));
    }
    Ok(form)
}

/// B and B<cond>: short form first, long form once promoted.
fn thumb_branch(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<Thumb, Fault> {
    count(instr, 1, 1)?;
    let span = instr.op_span(0);
    let pc = ctx.addr.wrapping_add(4);
    let offset = pc_relative(ctx, expr(instr, 0)?, pc, span)?;
    ctx.aligned(offset, 2, span)?;
    let conditional = m.cond != Cond::Al;
    let (short_bits, long_bits) = if conditional { (9, 21) } else { (12, 25) };

    let short = match m.width {
        Width::Narrow => true,
        Width::Wide => false,
        Width::Any => !ctx.long && fits(offset.value, signed_range(short_bits)),
    };
    if short {
        let v = ctx.fit(offset, signed_range(short_bits), span)? as u32;
        return Ok(if conditional {
            narrow(0xD000 | m.cond.bits() << 8 | v >> 1 & 0xFF)
        } else {
            narrow(0xE000 | v >> 1 & 0x7FF)
        });
    }

    if m.width == Width::Any {
        ctx.wants_long = true;
    }
    let v = ctx.fit(offset, signed_range(long_bits), span)?;
    Ok(if conditional {
        t32_cond_branch(v, m.cond)
    } else {
        t32_branch(v, 0x9000)
    })
}

fn thumb_mov(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>, short: bool) -> Result<Thumb, Fault> {
    count(instr, 2, 2)?;
    let rd = reg(instr, 0)?;
    match &instr.operands[1] {
        Operand::Imm(_) => {
            let value = imm32(ctx, instr, 1)?;
            let v = value.value as u32;
            let s = u32::from(m.set_flags) << 4;
            if short && rd < 8 && v <= 0xFF {
                return Ok(narrow(0x2000 | rd << 8 | v));
            }
            if let Some(enc) = encode_thumb_imm(v) {
                let (i, rest) = t32_imm(enc);
                return Ok(wide(0xF04F | s | i, rest | rd << 8));
            }
            if let Some(enc) = encode_thumb_imm(!v) {
                let (i, rest) = t32_imm(enc);
                return Ok(wide(0xF06F | s | i, rest | rd << 8));
            }
            if !m.set_flags && (v <= 0xFFFF || moving(ctx, value)) {
                let v = v & 0xFFFF;
                return Ok(wide(
                    0xF240 | (v >> 11 & 1) << 10 | v >> 12,
                    (v >> 8 & 7) << 12 | rd << 8 | v & 0xFF,
                ));
            }
            Err(no_encoding(instr, 1, v))
        }
        Operand::Reg(Register::Arm(rm)) => {
            let rm = u32::from(*rm);
            if m.set_flags && rd < 8 && rm < 8 {
                Ok(narrow(rm << 3 | rd))
            } else {
                Ok(narrow(0x4600 | (rd & 8) << 4 | rm << 3 | rd & 7))
            }
        }
        _ => Err(invalid(instr, 1, "expected register or immediate")),
    }
}

fn thumb_add_sub(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>, short: bool) -> Result<Thumb, Fault> {
    count(instr, 2, 3)?;
    let rd = reg(instr, 0)?;
    let (rn, at) = if instr.operands.len() == 3 {
        (reg(instr, 1)?, 2)
    } else {
        (rd, 1)
    };
    let mut sub = m.base == "sub";
    let s = u32::from(m.set_flags) << 4;

    match &instr.operands[at] {
        Operand::Imm(_) => {
            let value = imm32(ctx, instr, at)?;
            let mut v = value.value;
            if v < 0 {
                sub = !sub;
                v = -v;
            }
            let v = v as u32;
            if short {
                if rd == 13 && rn == 13 && v % 4 == 0 && v <= 508 {
                    return Ok(narrow((if sub { 0xB080 } else { 0xB000 }) | v / 4));
                }
                if !sub && rn == 13 && rd < 8 && v % 4 == 0 && v <= 1020 {
                    return Ok(narrow(0xA800 | rd << 8 | v / 4));
                }
                if rd < 8 && rn < 8 {
                    if rd == rn && v <= 0xFF {
                        return Ok(narrow((if sub { 0x3800 } else { 0x3000 }) | rd << 8 | v));
                    }
                    if v <= 7 {
                        return Ok(narrow((if sub { 0x1E00 } else { 0x1C00 }) | v << 6 | rn << 3 | rd));
                    }
                }
            }
            if let Some(enc) = encode_thumb_imm(v) {
                let (i, rest) = t32_imm(enc);
                return Ok(wide((if sub { 0xF1A0 } else { 0xF100 }) | i | s | rn, rest | rd << 8));
            }
            if !m.set_flags && (v <= 0xFFF || moving(ctx, value)) {
                let (i, rest) = t32_imm(v & 0xFFF);
                return Ok(wide((if sub { 0xF2A0 } else { 0xF200 }) | i | rn, rest | rd << 8));
            }
            Err(no_encoding(instr, at, v))
        }
        Operand::Reg(Register::Arm(rm)) => {
            let rm = u32::from(*rm);
            if short {
                if rd < 8 && rn < 8 && rm < 8 {
                    return Ok(narrow((if sub { 0x1A00 } else { 0x1800 }) | rm << 6 | rn << 3 | rd));
                }
                if !sub && rd == rn {
                    return Ok(narrow(0x4400 | (rd & 8) << 4 | rm << 3 | rd & 7));
                }
            }
            Ok(wide((if sub { 0xEBA0 } else { 0xEB00 }) | s | rn, rd << 8 | rm))
        }
        _ => Err(invalid(instr, at, "expected register or immediate")),
    }
}

fn thumb_compare(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>, short: bool) -> Result<Thumb, Fault> {
    count(instr, 2, 2)?;
    let rn = reg(instr, 0)?;
    match &instr.operands[1] {
        Operand::Imm(_) => {
            let value = imm32(ctx, instr, 1)?;
            let v = value.value;
            if short && m.base == "cmp" && rn < 8 && (0..=0xFF).contains(&v) {
                return Ok(narrow(0x2800 | rn << 8 | v as u32));
            }
            let (op, bits) = match m.base {
                "tst" => (0xF010, v as u32),
                "cmp" if v < 0 => (0xF110, v.wrapping_neg() as u32),
                "cmn" if v < 0 => (0xF1B0, v.wrapping_neg() as u32),
                "cmp" => (0xF1B0, v as u32),
                _ => (0xF110, v as u32),
            };
            match encode_thumb_imm(bits) {
                Some(enc) => {
                    let (i, rest) = t32_imm(enc);
                    Ok(wide(op | i | rn, rest | 0x0F00))
                }
                None if moving(ctx, value) => Ok(wide(op | rn, 0x0F00)),
                None => Err(no_encoding(instr, 1, bits)),
            }
        }
        Operand::Reg(Register::Arm(rm)) => {
            let rm = u32::from(*rm);
            match m.base {
                "cmp" if rn < 8 && rm < 8 => Ok(narrow(0x4280 | rm << 3 | rn)),
                "cmp" => Ok(narrow(0x4500 | (rn & 8) << 4 | rm << 3 | rn & 7)),
                _ if rn > 7 || rm > 7 => Err(invalid(instr, 0, "expected low registers (r0-r7)")),
                "cmn" => Ok(narrow(0x42C0 | rm << 3 | rn)),
                _ => Ok(narrow(0x4200 | rm << 3 | rn)),
            }
        }
        _ => Err(invalid(instr, 1, "expected register or immediate")),
    }
}

/// Two-operand low-register ALU form `op rdn, rm`.
///
/// The three-operand spelling is accepted when the destination repeats a
/// source (either source for commutative operations).
fn thumb_alu(instr: &Instruction, op: u32, commutative: bool) -> Result<Thumb, Fault> {
    count(instr, 2, 3)?;
    let rdn = lo(instr, 0)?;
    let rm = if instr.operands.len() == 2 {
        lo(instr, 1)?
    } else {
        let (a, b) = (lo(instr, 1)?, lo(instr, 2)?);
        if a == rdn {
            b
        } else if commutative && b == rdn {
            a
        } else {
            return Err(instr.error(format!(
                "'{}' needs the destination to repeat a source register",
                instr.mnemonic
            )));
        }
    };
    Ok(narrow(op | rm << 3 | rdn))
}

fn thumb_shift(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<Thumb, Fault> {
    let last = instr.operands.len().saturating_sub(1);
    if !is_imm(instr, last) {
        let op = match m.base {
            "lsl" => 0x4080,
            "lsr" => 0x40C0,
            "asr" => 0x4100,
            _ => 0x41C0,
        };
        return thumb_alu(instr, op, false);
    }
    count(instr, 2, 3)?;
    let rd = lo(instr, 0)?;
    let rm = if last == 2 { lo(instr, 1)? } else { rd };
    let span = instr.op_span(last);
    let (op, range) = match m.base {
        "lsl" => (0x0000, (0, 31)),
        "lsr" => (0x0800, (1, 32)),
        "asr" => (0x1000, (1, 32)),
        _ => return Err(invalid(instr, last, "ror takes a register amount in Thumb state")),
    };
    let n = ctx.eval_in(expr(instr, last)?, range, span)? as u32;
    Ok(narrow(op | (n & 31) << 6 | rm << 3 | rd))
}

fn thumb_load_store(m: &Mnemonic<'_>, instr: &Instruction, ctx: &mut EncodeCtx<'_>, short: bool) -> Result<Thumb, Fault> {
    let (kind, load) = access(m.base);
    let rt = reg(instr, 0)?;
    // 32-bit T4 form; T3 (positive imm12) sets bit 7.
    let t4: u32 = match (kind, load) {
        (Access::Word, true) => 0xF850,
        (Access::Word, false) => 0xF840,
        (Access::Byte, true) => 0xF810,
        (Access::Byte, false) => 0xF800,
        (Access::Half, true) => 0xF830,
        (Access::Half, false) => 0xF820,
        (Access::SignedByte, _) => 0xF910,
        (Access::SignedHalf, _) => 0xF930,
    };

    if is_imm(instr, 1) {
        count(instr, 2, 2)?;
        if !load {
            return Err(invalid(instr, 1, "stores need a memory operand"));
        }
        let span = instr.op_span(1);
        let pc = ctx.addr.wrapping_add(4) & !3;
        let offset = pc_relative(ctx, expr(instr, 1)?, pc, span)?;
        let narrow_ok = short
            && !ctx.long
            && kind == Access::Word
            && rt < 8
            && fits(offset.value, (0, 1020))
            && offset.value % 4 == 0;
        if narrow_ok {
            return Ok(narrow(0x4800 | rt << 8 | (offset.value / 4) as u32));
        }
        if short && m.width == Width::Any {
            ctx.wants_long = true;
        }
        let v = ctx.fit(offset, (-4095, 4095), span)?;
        let u = u32::from(v >= 0) << 7;
        return Ok(wide(t4 | 0xF | u, rt << 12 | v.unsigned_abs() as u32));
    }

    count(instr, 2, 4)?;
    let addr = address(instr)?;
    let rn = addr.rn;
    match (addr.index, addr.offset) {
        (Index::Offset, None | Some(Offset::Imm(..))) => {
            let v = match addr.offset {
                Some(Offset::Imm(e, span)) => ctx.eval_in(e, (-255, 4095), span)?,
                _ => 0,
            };
            if short && rt < 8 && v >= 0 {
                let v = v as u32;
                let form = match kind {
                    Access::Word if rn == 13 && v % 4 == 0 && v <= 1020 => {
                        Some((if load { 0x9800 } else { 0x9000 }) | rt << 8 | v / 4)
                    }
                    Access::Word if rn < 8 && v % 4 == 0 && v <= 124 => {
                        Some((if load { 0x6800 } else { 0x6000 }) | (v / 4) << 6 | rn << 3 | rt)
                    }
                    Access::Byte if rn < 8 && v <= 31 => {
                        Some((if load { 0x7800 } else { 0x7000 }) | v << 6 | rn << 3 | rt)
                    }
                    Access::Half if rn < 8 && v % 2 == 0 && v <= 62 => {
                        Some((if load { 0x8800 } else { 0x8000 }) | (v / 2) << 6 | rn << 3 | rt)
                    }
                    _ => None,
                };
                if let Some(hw) = form {
                    return Ok(narrow(hw));
                }
            }
            if v >= 0 {
                Ok(wide(t4 | 0x80 | rn, rt << 12 | v as u32))
            } else {
                Ok(wide(t4 | rn, rt << 12 | 0xC00 | v.unsigned_abs() as u32))
            }
        }
        (Index::Offset, Some(Offset::Reg { rm, subtract, shift })) => {
            if subtract {
                return Err(invalid(instr, 1, "negative register offsets are not available in Thumb state"));
            }
            if short && shift.is_none() && rt < 8 && rn < 8 && rm < 8 {
                let op = match (kind, load) {
                    (Access::Word, false) => 0x5000,
                    (Access::Half, false) => 0x5200,
                    (Access::Byte, false) => 0x5400,
                    (Access::SignedByte, _) => 0x5600,
                    (Access::Word, true) => 0x5800,
                    (Access::Half, true) => 0x5A00,
                    (Access::Byte, true) => 0x5C00,
                    (Access::SignedHalf, _) => 0x5E00,
                };
                return Ok(narrow(op | rm << 6 | rn << 3 | rt));
            }
            let amount = match shift {
                None => 0,
                Some(Shift {
                    kind: ShiftKind::Lsl,
                    amount: ShiftAmount::Imm(e),
                }) => ctx.eval_in(e, (0, 3), instr.op_span(1))? as u32,
                Some(_) => return Err(invalid(instr, 1, "only lsl #0-3 is allowed here")),
            };
            Ok(wide(t4 | rn, rt << 12 | amount << 4 | rm))
        }
        (index, Some(Offset::Imm(e, span))) => {
            let v = ctx.eval_in(e, (-255, 255), span)?;
            let p = u32::from(index == Index::Pre) << 10;
            let u = u32::from(v >= 0) << 9;
            Ok(wide(t4 | rn, rt << 12 | 0x800 | p | u | 0x100 | v.unsigned_abs() as u32))
        }
        (_, _) => Err(invalid(instr, 1, "unsupported Thumb addressing mode")),
    }
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Encode one ARM or Thumb instruction, depending on `ctx.thumb`.
pub(crate) fn encode(instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<InstrBytes, Fault> {
    let m = split_mnemonic(&instr.mnemonic)
        .ok_or_else(|| Fault::mnemonic(&instr.mnemonic, "arm", instr.span))?;
    let mut out = InstrBytes::new();
    if ctx.thumb {
        match encode_thumb(&m, instr, ctx)? {
            Thumb::Narrow(hw) => out.push_u16(hw, ctx.big_endian),
            Thumb::Wide(hw1, hw2) => {
                out.push_u16(hw1, ctx.big_endian);
                out.push_u16(hw2, ctx.big_endian);
            }
        }
    } else {
        let word = encode_a32(&m, instr, ctx)?;
        out.push_u32(word, ctx.big_endian);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::option::Syntax;
    use crate::parser::{parse_statement, ParseContext};
    use crate::symbols::SymbolTable;
    use alloc::vec::Vec;

    fn try_asm(src: &str, thumb: bool, big_endian: bool, addr: u64) -> Result<Vec<u8>, Fault> {
        let mut pctx = ParseContext {
            arch: Arch::Arm,
            dialect: Syntax::Gas,
            radix16: false,
        };
        let instr = match parse_statement(src, &mut pctx).body {
            Some(Ok(Body::Instruction(i))) => i,
            other => panic!("{}: {:?}", src, other),
        };
        let mut ctx = EncodeCtx::new(SymbolTable::new(None, 16), 32, thumb, big_endian);
        ctx.strict = true;
        ctx.addr = addr;
        encode(&instr, &mut ctx).map(|b| b.to_vec())
    }

    /// A32 word at address 0.
    fn arm(src: &str) -> u32 {
        arm_at(src, 0)
    }

    fn arm_at(src: &str, addr: u64) -> u32 {
        let bytes = try_asm(src, false, false, addr).unwrap_or_else(|e| panic!("{}: {:?}", src, e));
        assert_eq!(bytes.len(), 4, "{}", src);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Thumb halfwords at address 0.
    fn thumb(src: &str) -> Vec<u16> {
        thumb_at(src, 0)
    }

    fn thumb_at(src: &str, addr: u64) -> Vec<u16> {
        let bytes = try_asm(src, true, false, addr).unwrap_or_else(|e| panic!("{}: {:?}", src, e));
        bytes
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn arm_err(src: &str) -> ErrorCode {
        try_asm(src, false, false, 0).unwrap_err().code
    }

    fn thumb_err(src: &str) -> ErrorCode {
        try_asm(src, true, false, 0).unwrap_err().code
    }

    #[test]
    fn bases_are_sorted() {
        assert!(BASES.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn mnemonic_splitting() {
        let m = split_mnemonic("addseq").unwrap();
        assert_eq!((m.base, m.cond, m.set_flags), ("add", Cond::Eq, true));
        let m = split_mnemonic("bls").unwrap();
        assert_eq!((m.base, m.cond), ("b", Cond::Ls));
        let m = split_mnemonic("teq").unwrap();
        assert_eq!((m.base, m.cond), ("teq", Cond::Al));
        let m = split_mnemonic("bleq").unwrap();
        assert_eq!((m.base, m.cond), ("bl", Cond::Eq));
        let m = split_mnemonic("ldrsh").unwrap();
        assert_eq!(m.base, "ldrsh");
        let m = split_mnemonic("mov.w").unwrap();
        assert_eq!((m.base, m.width), ("mov", Width::Wide));
        assert!(split_mnemonic("blah").is_none());
        assert!(split_mnemonic("cmps").is_none());
    }

    #[test]
    fn modified_immediates() {
        assert_eq!(encode_arm_imm(0xFF), Some(0xFF));
        assert_eq!(encode_arm_imm(0xFF00_0000), Some(0x4FF));
        assert_eq!(encode_arm_imm(0x101), None);
        assert_eq!(encode_thumb_imm(0x100), Some(0xF80));
        assert_eq!(encode_thumb_imm(0x00AB_00AB), Some(0x1AB));
        assert_eq!(encode_thumb_imm(0xAB00_AB00), Some(0x2AB));
        assert_eq!(encode_thumb_imm(0xABAB_ABAB), Some(0x3AB));
        assert_eq!(encode_thumb_imm(0x101), None);
    }

    // ── A32 ──────────────────────────────────────────────────────────

    #[test]
    fn a32_data_processing() {
        assert_eq!(arm("mov r0, #1"), 0xE3A0_0001);
        assert_eq!(arm("add r0, r1, r2"), 0xE081_0002);
        assert_eq!(arm("add r0, r1, #0xFF000000"), 0xE281_04FF);
        assert_eq!(arm("sub r0, r0, #1"), 0xE240_0001);
        assert_eq!(arm("cmp r0, #0"), 0xE350_0000);
        assert_eq!(arm("addeq r0, r0, r1"), 0x0080_0001);
        assert_eq!(arm("add r0, r1"), 0xE080_0001);
        assert_eq!(arm("ands r0, r1, #15"), 0xE211_000F);
    }

    #[test]
    fn a32_immediate_fallbacks() {
        // mvn r0, #0
        assert_eq!(arm("mov r0, #-1"), 0xE3E0_0000);
        // sub r0, r0, #1
        assert_eq!(arm("add r0, r0, #-1"), 0xE240_0001);
        // movw r0, #0x1234
        assert_eq!(arm("mov r0, #0x1234"), 0xE301_0234);
        assert_eq!(arm("movt r0, #0x1234"), 0xE341_0234);
        assert_eq!(arm_err("add r0, r0, #0x101"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn a32_shifts() {
        assert_eq!(arm("movs r0, r1, lsl #2"), 0xE1B0_0101);
        assert_eq!(arm("mov r0, r1, lsl r2"), 0xE1A0_0211);
        assert_eq!(arm("lsl r0, r1, #2"), 0xE1A0_0101);
        assert_eq!(arm("lsr r0, r1, #32"), 0xE1A0_0021);
        assert_eq!(arm("asr r0, r1, r2"), 0xE1A0_0251);
        assert_eq!(arm("rrx r0, r1"), 0xE1A0_0061);
        assert_eq!(arm("add r0, r1, r2, lsl #3"), 0xE081_0182);
        assert_eq!(arm_err("lsl r0, r1, #32"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn a32_multiply() {
        assert_eq!(arm("mul r0, r1, r2"), 0xE000_0291);
        assert_eq!(arm("mla r0, r1, r2, r3"), 0xE020_3291);
        assert_eq!(arm("muls r0, r1, r2"), 0xE010_0291);
    }

    #[test]
    fn a32_branches() {
        assert_eq!(arm("b 0"), 0xEAFF_FFFE);
        assert_eq!(arm("bl 0x100"), 0xEB00_003E);
        assert_eq!(arm_at("bne 0x1000", 0x1000), 0x1AFF_FFFE);
        assert_eq!(arm("bx lr"), 0xE12F_FF1E);
        assert_eq!(arm("blx r3"), 0xE12F_FF33);
        assert_eq!(arm("blx 0x102"), 0xFB00_003E);
        assert_eq!(arm_err("b 2"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn a32_load_store() {
        assert_eq!(arm("ldr r0, [r1]"), 0xE591_0000);
        assert_eq!(arm("ldr r0, [r1, #4]"), 0xE591_0004);
        assert_eq!(arm("ldr r0, [r1, #-4]"), 0xE511_0004);
        assert_eq!(arm("str r0, [sp, #-4]!"), 0xE52D_0004);
        assert_eq!(arm("ldr r0, [r1], #4"), 0xE491_0004);
        assert_eq!(arm("ldrb r0, [r1, r2]"), 0xE7D1_0002);
        assert_eq!(arm("ldr r0, [r1, r2, lsl #2]"), 0xE791_0102);
        assert_eq!(arm("ldr r0, [r1, -r2]"), 0xE711_0002);
        assert_eq!(arm("ldr r0, 8"), 0xE59F_0000);
        assert_eq!(arm_err("ldr r0, [r1, #4096]"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn a32_halfword_load_store() {
        assert_eq!(arm("ldrh r0, [r1, #2]"), 0xE1D1_00B2);
        assert_eq!(arm("strh r0, [r1]"), 0xE1C1_00B0);
        assert_eq!(arm("ldrsb r0, [r1]"), 0xE1D1_00D0);
        assert_eq!(arm("ldrsh r0, [r1, #-0x12]"), 0xE151_01F2);
        assert_eq!(arm("ldrh r0, [r1, r2]"), 0xE191_00B2);
        assert_eq!(arm_err("ldrh r0, [r1, #256]"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn a32_block_transfer() {
        assert_eq!(arm("push {r4, lr}"), 0xE92D_4010);
        assert_eq!(arm("pop {r4, pc}"), 0xE8BD_8010);
        assert_eq!(arm("push {r0}"), 0xE52D_0004);
        assert_eq!(arm("pop {r0}"), 0xE49D_0004);
        assert_eq!(arm("ldm r0!, {r1, r2}"), 0xE8B0_0006);
        assert_eq!(arm("stmdb sp!, {r0}"), 0xE92D_0001);
        assert_eq!(arm("stmfd sp!, {r0}"), 0xE92D_0001);
        assert_eq!(arm("ldmib r3, {r0-r2}"), 0xE993_0007);
    }

    #[test]
    fn a32_misc() {
        assert_eq!(arm("svc #0"), 0xEF00_0000);
        assert_eq!(arm("swi 0x123456"), 0xEF12_3456);
        assert_eq!(arm("nop"), 0xE320_F000);
        assert_eq!(arm("bkpt #1"), 0xE120_0071);
        assert_eq!(arm_err("cbz r0, 0"), ErrorCode::InsnUnsupported);
        assert_eq!(arm_err("frob r0"), ErrorCode::MnemonicFail);
    }

    #[test]
    fn a32_big_endian() {
        assert_eq!(try_asm("nop", false, true, 0).unwrap(), [0xE3, 0x20, 0xF0, 0x00]);
    }

    // ── Thumb ────────────────────────────────────────────────────────

    #[test]
    fn thumb_moves() {
        assert_eq!(thumb("movs r0, #1"), [0x2001]);
        assert_eq!(thumb("mov r0, #1"), [0x2001]);
        assert_eq!(thumb("mov r0, r8"), [0x4640]);
        assert_eq!(thumb("movs r0, r1"), [0x0008]);
        assert_eq!(thumb("mov.w r0, #0x100"), [0xF44F, 0x7080]);
        assert_eq!(thumb("mov r0, #0x100"), [0xF44F, 0x7080]);
        assert_eq!(thumb("movw r0, #0x1234"), [0xF241, 0x2034]);
        assert_eq!(thumb("mov r0, #0x1234"), [0xF241, 0x2034]);
        assert_eq!(thumb("mvn r0, r1"), [0x43C8]);
    }

    #[test]
    fn thumb_arithmetic() {
        assert_eq!(thumb("adds r0, r1, #1"), [0x1C48]);
        assert_eq!(thumb("add r0, r1, r2"), [0x1888]);
        assert_eq!(thumb("adds r0, #1"), [0x3001]);
        assert_eq!(thumb("subs r0, r0, #1"), [0x3801]);
        assert_eq!(thumb("sub sp, sp, #8"), [0xB082]);
        assert_eq!(thumb("sub sp, #8"), [0xB082]);
        assert_eq!(thumb("add sp, #-8"), [0xB082]);
        assert_eq!(thumb("add r0, sp, #4"), [0xA801]);
        assert_eq!(thumb("add r8, r1"), [0x4488]);
        assert_eq!(thumb("add.w r0, r1, #1"), [0xF101, 0x0001]);
        assert_eq!(thumb("addw r0, r1, #0xFFF"), [0xF601, 0x70FF]);
    }

    #[test]
    fn thumb_compare_and_logic() {
        assert_eq!(thumb("cmp r0, #10"), [0x280A]);
        assert_eq!(thumb("cmp r0, r1"), [0x4288]);
        assert_eq!(thumb("cmp r8, r1"), [0x4588]);
        assert_eq!(thumb("tst r0, r1"), [0x4208]);
        assert_eq!(thumb("ands r0, r1"), [0x4008]);
        assert_eq!(thumb("orrs r0, r0, r1"), [0x4308]);
        assert_eq!(thumb("eors r0, r1, r0"), [0x4048]);
        assert_eq!(thumb("muls r0, r1, r0"), [0x4348]);
        assert_eq!(thumb("negs r0, r1"), [0x4248]);
        assert_eq!(thumb("lsls r0, r1, #2"), [0x0088]);
        assert_eq!(thumb("lsrs r0, r1, #32"), [0x0808]);
        assert_eq!(thumb("lsls r0, r1"), [0x4088]);
        assert_eq!(thumb_err("ands r0, r1, r2"), ErrorCode::InvalidOperand);
    }

    #[test]
    fn thumb_load_store() {
        assert_eq!(thumb("ldr r0, [r1, #4]"), [0x6848]);
        assert_eq!(thumb("str r0, [sp, #8]"), [0x9002]);
        assert_eq!(thumb("ldrb r0, [r1, r2]"), [0x5C88]);
        assert_eq!(thumb("strh r0, [r1, #2]"), [0x8048]);
        assert_eq!(thumb("ldr r0, [r1, #256]"), [0xF8D1, 0x0100]);
        assert_eq!(thumb("ldr r0, [r1, #-4]"), [0xF851, 0x0C04]);
        assert_eq!(thumb("ldr r0, [r1], #4"), [0xF851, 0x0B04]);
        assert_eq!(thumb("ldr r0, 8"), [0x4801]);
    }

    #[test]
    fn thumb_stack() {
        assert_eq!(thumb("push {r4, lr}"), [0xB510]);
        assert_eq!(thumb("pop {r4, pc}"), [0xBD10]);
        assert_eq!(thumb("push {r8}"), [0xF84D, 0x8D04]);
        assert_eq!(thumb("push {r4, r8, lr}"), [0xE92D, 0x4110]);
        assert_eq!(thumb("ldmia r0!, {r1, r2}"), [0xC806]);
        assert_eq!(thumb("stm r0!, {r1}"), [0xC002]);
    }

    #[test]
    fn thumb_branches() {
        assert_eq!(thumb("b 0"), [0xE7FE]);
        assert_eq!(thumb("beq 0"), [0xD0FE]);
        assert_eq!(thumb("bl 0"), [0xF7FF, 0xFFFE]);
        assert_eq!(thumb("b 0x1000"), [0xF000, 0xBFFE]);
        assert_eq!(thumb("b.w 0"), [0xF7FF, 0xBFFE]);
        assert_eq!(thumb("cbz r0, 0x10"), [0xB130]);
        assert_eq!(thumb("bx lr"), [0x4770]);
        assert_eq!(thumb("blx r3"), [0x4798]);
        assert_eq!(thumb_err("cbz r0, 0"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn thumb_conditional_branch_promotion() {
        // Out of range for the 8-bit form: T3 with cond in hw1.
        assert_eq!(thumb("bne 0x1000"), [0xF040, 0x87FE]);
    }

    #[test]
    fn thumb_misc() {
        assert_eq!(thumb("nop"), [0xBF00]);
        assert_eq!(thumb("svc #1"), [0xDF01]);
        assert_eq!(thumb("bkpt"), [0xBE00]);
        assert_eq!(thumb_err("moveq r0, r1"), ErrorCode::InsnUnsupported);
        assert_eq!(thumb_err("rsc r0, r1"), ErrorCode::InsnUnsupported);
        assert_eq!(thumb_err("mov.n r0, #0x100"), ErrorCode::InvalidOperand);
    }

    #[test]
    fn thumb_big_endian_halfwords() {
        assert_eq!(try_asm("bl 0", true, true, 0).unwrap(), [0xF7, 0xFF, 0xFF, 0xFE]);
    }
}
