//! AArch64 (ARM64) instruction encoder.
//!
//! All A64 instructions are 32 bits, stored little-endian. Register fields
//! are 5 bits wide and the `sf` bit selects between the 32-bit (W) and
//! 64-bit (X) register views.
//!
//! ## Encoding Classes
//!
//! - **Data processing (immediate)**: ADD/SUB with imm12, logical bitmask
//!   immediates, MOVZ/MOVN/MOVK, bitfield shifts
//! - **Data processing (register)**: shifted and extended register forms,
//!   variable shifts, multiply and divide
//! - **Branch**: B/BL (imm26), B.cond/CBZ/CBNZ (imm19), TBZ/TBNZ (imm14),
//!   BR/BLR/RET
//! - **Load/Store**: unsigned offset, unscaled, pre/post index, register
//!   offset and PC-relative literal; LDP/STP
//! - **System**: SVC/HVC/SMC/BRK/HLT, hints, barriers

use alloc::format;

use crate::encoder::{any_range, fits, signed_range, unsigned_range, EncodeCtx, InstrBytes};
use crate::error::{ErrorCode, Fault, Span};
use crate::ir::*;
use crate::symbols::Value;

// ── Helpers ──────────────────────────────────────────────────────────────

/// What register number 31 may mean in an operand slot.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// `xzr`/`wzr`
    Zr,
    /// `sp`/`wsp`
    Sp,
}

fn invalid(instr: &Instruction, i: usize, detail: &str) -> Fault {
    Fault::operand(
        format!("{}: {}", instr.mnemonic, detail),
        instr.op_span(i),
    )
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

fn reg(instr: &Instruction, i: usize, slot: Slot) -> Result<A64Reg, Fault> {
    match instr.operands.get(i) {
        Some(Operand::Reg(Register::A64(r))) => {
            if r.num == 31 && r.sp != (slot == Slot::Sp) {
                let detail = if r.sp {
                    "stack pointer not allowed here"
                } else {
                    "zero register not allowed here"
                };
                return Err(invalid(instr, i, detail));
            }
            Ok(*r)
        }
        _ => Err(invalid(instr, i, "expected register")),
    }
}

fn expr(instr: &Instruction, i: usize) -> Result<&Expr, Fault> {
    match instr.operands.get(i) {
        Some(Operand::Imm(e)) => Ok(e),
        _ => Err(invalid(instr, i, "expected immediate")),
    }
}

fn zr(wide: bool) -> A64Reg {
    A64Reg {
        num: 31,
        wide,
        sp: false,
    }
}

/// `sf` bit: 1 for 64-bit (X registers), 0 for 32-bit (W registers).
#[inline]
fn sf(reg: A64Reg) -> u32 {
    u32::from(reg.wide)
}

#[inline]
fn width(reg: A64Reg) -> u32 {
    if reg.wide {
        64
    } else {
        32
    }
}

#[inline]
fn r(reg: A64Reg) -> u32 {
    u32::from(reg.num)
}

fn same_width(instr: &Instruction, regs: &[A64Reg]) -> Result<(), Fault> {
    match regs.split_first() {
        Some((first, rest)) if rest.iter().any(|r| r.wide != first.wide) => {
            Err(instr.error("mixed W and X registers"))
        }
        _ => Ok(()),
    }
}

/// Evaluate a PC-relative target as a byte offset from the instruction.
fn pc_offset(
    ctx: &mut EncodeCtx<'_>,
    target: &Expr,
    bits: u32,
    align: i128,
    span: Span,
) -> Result<i128, Fault> {
    let target = ctx.eval(target, span)?;
    let offset = Value {
        value: target.value - i128::from(ctx.addr),
        relocatable: true,
    };
    ctx.aligned(offset, align, span)?;
    ctx.fit(offset, signed_range(bits), span)
}

/// Amount of an optional shift operand at index `i`.
fn shift_at(instr: &Instruction, i: usize) -> Result<Option<&Shift>, Fault> {
    match instr.operands.get(i) {
        None => Ok(None),
        Some(Operand::Shift(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(instr, i, "expected shift")),
    }
}

fn shift_amount(
    ctx: &mut EncodeCtx<'_>,
    shift: &Shift,
    max: i128,
    span: Span,
) -> Result<u32, Fault> {
    match &shift.amount {
        ShiftAmount::None if shift.kind.is_extend() => Ok(0),
        ShiftAmount::Imm(e) => Ok(ctx.eval_in(e, (0, max), span)? as u32),
        ShiftAmount::None => Err(Fault::operand("missing shift amount", span)),
        ShiftAmount::Reg(_) => Err(Fault::operand("register shift amounts are not supported", span)),
    }
}

fn shift_type(kind: ShiftKind, allow_ror: bool, span: Span) -> Result<u32, Fault> {
    match kind {
        ShiftKind::Lsl => Ok(0),
        ShiftKind::Lsr => Ok(1),
        ShiftKind::Asr => Ok(2),
        ShiftKind::Ror if allow_ror => Ok(3),
        _ => Err(Fault::operand("invalid shift type", span)),
    }
}

fn extend_option(kind: ShiftKind) -> Option<u32> {
    Some(match kind {
        ShiftKind::Uxtb => 0,
        ShiftKind::Uxth => 1,
        ShiftKind::Uxtw => 2,
        ShiftKind::Uxtx => 3,
        ShiftKind::Sxtb => 4,
        ShiftKind::Sxth => 5,
        ShiftKind::Sxtw => 6,
        ShiftKind::Sxtx => 7,
        _ => return None,
    })
}

// ── Condition codes ──────────────────────────────────────────────────────

fn cond_code(name: &str) -> Option<u32> {
    Some(match name {
        "eq" => 0,
        "ne" => 1,
        "cs" | "hs" => 2,
        "cc" | "lo" => 3,
        "mi" => 4,
        "pl" => 5,
        "vs" => 6,
        "vc" => 7,
        "hi" => 8,
        "ls" => 9,
        "ge" => 10,
        "lt" => 11,
        "gt" => 12,
        "le" => 13,
        "al" => 14,
        "nv" => 15,
        _ => return None,
    })
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Encode one A64 instruction.
pub(crate) fn encode(instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<InstrBytes, Fault> {
    let word = encode_word(instr, ctx)?;
    let mut buf = InstrBytes::new();
    buf.push_u32(word, false);
    Ok(buf)
}

fn encode_word(instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<u32, Fault> {
    let mnemonic = instr.mnemonic.as_str();

    if let Some(cond) = mnemonic.strip_prefix("b.") {
        let cc = cond_code(cond).ok_or_else(|| Fault::mnemonic(mnemonic, "arm64", instr.span))?;
        count(instr, 1, 1)?;
        let off = pc_offset(ctx, expr(instr, 0)?, 21, 4, instr.op_span(0))?;
        return Ok(0x5400_0000 | ((off >> 2) as u32 & 0x7_FFFF) << 5 | cc);
    }

    match mnemonic {
        // ── Hints / System ──────────────────────────────────
        "nop" => fixed(instr, 0xD503_201F),
        "yield" => fixed(instr, 0xD503_203F),
        "wfe" => fixed(instr, 0xD503_205F),
        "wfi" => fixed(instr, 0xD503_207F),
        "sev" => fixed(instr, 0xD503_209F),
        "sevl" => fixed(instr, 0xD503_20BF),
        "hint" => {
            count(instr, 1, 1)?;
            let n = ctx.eval_in(expr(instr, 0)?, unsigned_range(7), instr.op_span(0))?;
            Ok(0xD503_201F & !(0x7F << 5) | (n as u32) << 5)
        }
        "isb" => encode_barrier(ctx, instr, 0xD503_30DF),
        "dsb" => encode_barrier(ctx, instr, 0xD503_309F),
        "dmb" => encode_barrier(ctx, instr, 0xD503_30BF),
        "svc" => encode_exception(ctx, instr, 0xD400_0001),
        "hvc" => encode_exception(ctx, instr, 0xD400_0002),
        "smc" => encode_exception(ctx, instr, 0xD400_0003),
        "brk" => encode_exception(ctx, instr, 0xD420_0000),
        "hlt" => encode_exception(ctx, instr, 0xD440_0000),

        // ── Branch ──────────────────────────────────────────
        "b" | "bl" => {
            count(instr, 1, 1)?;
            let off = pc_offset(ctx, expr(instr, 0)?, 28, 4, instr.op_span(0))?;
            let op = if mnemonic == "bl" { 0x9400_0000 } else { 0x1400_0000 };
            Ok(op | ((off >> 2) as u32 & 0x03FF_FFFF))
        }
        "br" | "blr" | "ret" => encode_br(instr),
        "cbz" | "cbnz" => {
            count(instr, 2, 2)?;
            let rt = reg(instr, 0, Slot::Zr)?;
            let off = pc_offset(ctx, expr(instr, 1)?, 21, 4, instr.op_span(1))?;
            let op = u32::from(mnemonic == "cbnz");
            Ok(sf(rt) << 31 | 0x3400_0000 | op << 24 | ((off >> 2) as u32 & 0x7_FFFF) << 5 | r(rt))
        }
        "tbz" | "tbnz" => {
            count(instr, 3, 3)?;
            let rt = reg(instr, 0, Slot::Zr)?;
            let bit = ctx.eval_in(expr(instr, 1)?, (0, i128::from(width(rt)) - 1), instr.op_span(1))? as u32;
            let off = pc_offset(ctx, expr(instr, 2)?, 16, 4, instr.op_span(2))?;
            let op = u32::from(mnemonic == "tbnz");
            Ok((bit >> 5) << 31
                | 0x3600_0000
                | op << 24
                | (bit & 0x1F) << 19
                | ((off >> 2) as u32 & 0x3FFF) << 5
                | r(rt))
        }
        "adr" | "adrp" => encode_adr(ctx, instr),

        // ── Move ────────────────────────────────────────────
        "mov" => encode_mov(ctx, instr),
        "movz" => encode_move_wide(ctx, instr, 0x5280_0000),
        "movn" => encode_move_wide(ctx, instr, 0x1280_0000),
        "movk" => encode_move_wide(ctx, instr, 0x7280_0000),
        "mvn" => {
            count(instr, 2, 3)?;
            let rd = reg(instr, 0, Slot::Zr)?;
            logical(ctx, instr, 1, true, rd, zr(rd.wide), 1)
        }

        // ── Add / Sub ───────────────────────────────────────
        "add" | "adds" | "sub" | "subs" => {
            count(instr, 3, 4)?;
            let sub = mnemonic.starts_with("sub");
            let set_flags = mnemonic.ends_with('s');
            let rd_slot = if set_flags { Slot::Zr } else { Slot::Sp };
            let rd = reg_either(instr, 0, rd_slot)?;
            let rn = reg_either(instr, 1, Slot::Sp)?;
            addsub(ctx, instr, sub, set_flags, rd, rn, 2)
        }
        "cmp" | "cmn" => {
            count(instr, 2, 3)?;
            let rn = reg_either(instr, 0, Slot::Sp)?;
            addsub(ctx, instr, mnemonic == "cmp", true, zr(rn.wide), rn, 1)
        }
        "neg" | "negs" => {
            count(instr, 2, 3)?;
            let rd = reg(instr, 0, Slot::Zr)?;
            addsub(ctx, instr, true, mnemonic == "negs", rd, zr(rd.wide), 1)
        }

        // ── Logical ─────────────────────────────────────────
        "and" | "orr" | "eor" | "ands" | "bic" | "orn" | "eon" | "bics" => {
            count(instr, 3, 4)?;
            let (opc, negate) = match mnemonic {
                "and" => (0, false),
                "orr" => (1, false),
                "eor" => (2, false),
                "ands" => (3, false),
                "bic" => (0, true),
                "orn" => (1, true),
                "eon" => (2, true),
                _ => (3, true),
            };
            let rd_slot = if opc != 3 && matches!(instr.operands.get(2), Some(Operand::Imm(_))) {
                Slot::Sp
            } else {
                Slot::Zr
            };
            let rd = reg_either(instr, 0, rd_slot)?;
            let rn = reg(instr, 1, Slot::Zr)?;
            logical(ctx, instr, opc, negate, rd, rn, 2)
        }
        "tst" => {
            count(instr, 2, 3)?;
            let rn = reg(instr, 0, Slot::Zr)?;
            logical(ctx, instr, 3, false, zr(rn.wide), rn, 1)
        }

        // ── Shifts ──────────────────────────────────────────
        "lsl" | "lsr" | "asr" | "ror" => encode_shift(ctx, instr),

        // ── Multiply / Divide ───────────────────────────────
        "mul" | "mneg" => {
            count(instr, 3, 3)?;
            let (rd, rn, rm) = three_regs(instr)?;
            let o0 = u32::from(mnemonic == "mneg");
            Ok(sf(rd) << 31 | 0x1B00_0000 | r(rm) << 16 | o0 << 15 | 31 << 10 | r(rn) << 5 | r(rd))
        }
        "madd" | "msub" => {
            count(instr, 4, 4)?;
            let (rd, rn, rm) = three_regs(instr)?;
            let ra = reg(instr, 3, Slot::Zr)?;
            same_width(instr, &[rd, ra])?;
            let o0 = u32::from(mnemonic == "msub");
            Ok(sf(rd) << 31 | 0x1B00_0000 | r(rm) << 16 | o0 << 15 | r(ra) << 10 | r(rn) << 5 | r(rd))
        }
        "sdiv" | "udiv" => {
            count(instr, 3, 3)?;
            let (rd, rn, rm) = three_regs(instr)?;
            let op = if mnemonic == "sdiv" { 0x1AC0_0C00 } else { 0x1AC0_0800 };
            Ok(sf(rd) << 31 | op | r(rm) << 16 | r(rn) << 5 | r(rd))
        }

        // ── Load / Store ────────────────────────────────────
        "ldr" | "str" | "ldrb" | "strb" | "ldrh" | "strh" | "ldrsb" | "ldrsh" | "ldrsw"
        | "ldur" | "stur" | "ldurb" | "sturb" | "ldurh" | "sturh" | "ldursb" | "ldursh"
        | "ldursw" => encode_ldr_str(ctx, instr),
        "ldp" | "stp" => encode_ldp_stp(ctx, instr),

        _ => Err(Fault::mnemonic(mnemonic, "arm64", instr.span)),
    }
}

/// Register operand where either `sp` or the zero register is a valid
/// reading of number 31, depending on `slot`, and the other spelling is
/// rejected.
fn reg_either(instr: &Instruction, i: usize, slot: Slot) -> Result<A64Reg, Fault> {
    // Register-operand forms of ADD/SUB accept SP only through the extended
    // form, so the zero register is also tolerated here and checked later.
    match instr.operands.get(i) {
        Some(Operand::Reg(Register::A64(r))) if slot == Slot::Sp => Ok(*r),
        _ => reg(instr, i, slot),
    }
}

fn three_regs(instr: &Instruction) -> Result<(A64Reg, A64Reg, A64Reg), Fault> {
    let rd = reg(instr, 0, Slot::Zr)?;
    let rn = reg(instr, 1, Slot::Zr)?;
    let rm = reg(instr, 2, Slot::Zr)?;
    same_width(instr, &[rd, rn, rm])?;
    Ok((rd, rn, rm))
}

fn fixed(instr: &Instruction, word: u32) -> Result<u32, Fault> {
    count(instr, 0, 0)?;
    Ok(word)
}

// ── System ───────────────────────────────────────────────────────────────

fn encode_exception(ctx: &mut EncodeCtx<'_>, instr: &Instruction, base: u32) -> Result<u32, Fault> {
    count(instr, 1, 1)?;
    let imm = ctx.eval_in(expr(instr, 0)?, unsigned_range(16), instr.op_span(0))?;
    Ok(base | (imm as u32) << 5)
}

fn barrier_option(name: &str) -> Option<u32> {
    Some(match name {
        "oshld" => 1,
        "oshst" => 2,
        "osh" => 3,
        "nshld" => 5,
        "nshst" => 6,
        "nsh" => 7,
        "ishld" => 9,
        "ishst" => 10,
        "ish" => 11,
        "ld" => 13,
        "st" => 14,
        "sy" => 15,
        _ => return None,
    })
}

/// DMB/DSB/ISB; `base` carries CRm = SY.
fn encode_barrier(ctx: &mut EncodeCtx<'_>, instr: &Instruction, base: u32) -> Result<u32, Fault> {
    count(instr, 0, 1)?;
    let option = match instr.operands.first() {
        None => 15,
        Some(Operand::Imm(e)) => match e.as_symbol() {
            Some(name) => barrier_option(&name.to_ascii_lowercase())
                .ok_or_else(|| invalid(instr, 0, "unknown barrier option"))?,
            None => ctx.eval_in(e, unsigned_range(4), instr.op_span(0))? as u32,
        },
        Some(_) => return Err(invalid(instr, 0, "expected barrier option")),
    };
    Ok(base & !(0xF << 8) | option << 8)
}

// ── Branch ───────────────────────────────────────────────────────────────

fn encode_br(instr: &Instruction) -> Result<u32, Fault> {
    let base = match instr.mnemonic.as_str() {
        "br" => 0xD61F_0000,
        "blr" => 0xD63F_0000,
        _ => 0xD65F_0000,
    };
    let rn = if instr.mnemonic == "ret" && instr.operands.is_empty() {
        30
    } else {
        count(instr, 1, 1)?;
        let rn = reg(instr, 0, Slot::Zr)?;
        if !rn.wide {
            return Err(invalid(instr, 0, "expected 64-bit register"));
        }
        r(rn)
    };
    Ok(base | rn << 5)
}

fn encode_adr(ctx: &mut EncodeCtx<'_>, instr: &Instruction) -> Result<u32, Fault> {
    count(instr, 2, 2)?;
    let rd = reg(instr, 0, Slot::Zr)?;
    if !rd.wide {
        return Err(invalid(instr, 0, "expected 64-bit register"));
    }
    let span = instr.op_span(1);
    let (op, off) = if instr.mnemonic == "adrp" {
        let target = ctx.eval(expr(instr, 1)?, span)?;
        let pages = Value {
            value: (target.value >> 12) - (i128::from(ctx.addr) >> 12),
            relocatable: true,
        };
        (0x9000_0000, ctx.fit(pages, signed_range(21), span)?)
    } else {
        (0x1000_0000, pc_offset(ctx, expr(instr, 1)?, 21, 1, span)?)
    };
    let immlo = off as u32 & 3;
    let immhi = (off >> 2) as u32 & 0x7_FFFF;
    Ok(op | immlo << 29 | immhi << 5 | r(rd))
}

// ── Add / Sub ────────────────────────────────────────────────────────────

/// ADD/SUB family with the second source operand at index `at`.
fn addsub(
    ctx: &mut EncodeCtx<'_>,
    instr: &Instruction,
    sub: bool,
    set_flags: bool,
    rd: A64Reg,
    rn: A64Reg,
    at: usize,
) -> Result<u32, Fault> {
    let op = u32::from(sub) << 30 | u32::from(set_flags) << 29;
    let shift = shift_at(instr, at + 1)?;
    if instr.operands.len() > at + 2 {
        return Err(invalid(instr, at + 2, "unexpected operand"));
    }
    match instr.operands.get(at) {
        Some(Operand::Imm(e)) => {
            same_width(instr, &[rd, rn])?;
            if (!set_flags && rd.num == 31 && !rd.sp) || (rn.num == 31 && !rn.sp) {
                return Err(instr.error("zero register not allowed here"));
            }
            let span = instr.op_span(at);
            let mut value = ctx.eval(e, span)?.value;
            let mut op = op;
            let sh = match shift {
                Some(s) => {
                    if s.kind != ShiftKind::Lsl {
                        return Err(invalid(instr, at + 1, "expected 'lsl #0' or 'lsl #12'"));
                    }
                    match shift_amount(ctx, s, 12, instr.op_span(at + 1))? {
                        0 => 0,
                        12 => 1,
                        _ => return Err(invalid(instr, at + 1, "expected 'lsl #0' or 'lsl #12'")),
                    }
                }
                None => {
                    if value < 0 {
                        // add x0, x1, #-1 is sub x0, x1, #1
                        value = -value;
                        op ^= 1 << 30;
                    }
                    if value > 0xFFF && value & 0xFFF == 0 && value >> 12 <= 0xFFF {
                        value >>= 12;
                        1
                    } else {
                        0
                    }
                }
            };
            if !fits(value, unsigned_range(12)) {
                return Err(Fault::range(value, 0, 0xFFF, span));
            }
            Ok(sf(rd) << 31 | op | 0x1100_0000 | sh << 22 | (value as u32) << 10 | r(rn) << 5 | r(rd))
        }
        Some(Operand::Reg(Register::A64(rm))) => {
            let rm = *rm;
            if rm.num == 31 && rm.sp {
                return Err(invalid(instr, at, "stack pointer not allowed here"));
            }
            let uses_sp = (rd.num == 31 && rd.sp) || (rn.num == 31 && rn.sp);
            let extend = shift.and_then(|s| extend_option(s.kind));
            if extend.is_some() || uses_sp {
                let option = match (extend, shift) {
                    (Some(option), _) => option,
                    (None, Some(s)) if s.kind != ShiftKind::Lsl => {
                        return Err(invalid(instr, at + 1, "expected extend"));
                    }
                    _ if rd.wide => 3,
                    _ => 2,
                };
                if (!set_flags && rd.num == 31 && !rd.sp) || (rn.num == 31 && !rn.sp) {
                    return Err(instr.error("zero register not allowed here"));
                }
                let amount = match shift {
                    Some(s) => shift_amount(ctx, s, 4, instr.op_span(at + 1))?,
                    None => 0,
                };
                same_width(instr, &[rd, rn])?;
                return Ok(sf(rd) << 31
                    | op
                    | 0x0B20_0000
                    | r(rm) << 16
                    | option << 13
                    | amount << 10
                    | r(rn) << 5
                    | r(rd));
            }
            same_width(instr, &[rd, rn, rm])?;
            let (kind, amount) = match shift {
                Some(s) => (
                    shift_type(s.kind, false, instr.op_span(at + 1))?,
                    shift_amount(ctx, s, i128::from(width(rd)) - 1, instr.op_span(at + 1))?,
                ),
                None => (0, 0),
            };
            Ok(sf(rd) << 31
                | op
                | 0x0B00_0000
                | kind << 22
                | r(rm) << 16
                | amount << 10
                | r(rn) << 5
                | r(rd))
        }
        _ => Err(invalid(instr, at, "expected register or immediate")),
    }
}

// ── Logical ──────────────────────────────────────────────────────────────

/// Encode `value` as an A64 bitmask immediate: `(N, immr, imms)`.
///
/// A bitmask immediate is a run of ones rotated within an element of 2, 4,
/// 8, 16, 32 or 64 bits, replicated across the register.
fn bitmask_imm(value: u64, reg_width: u32) -> Option<(u32, u32, u32)> {
    let value = if reg_width == 32 {
        let w = u64::from(value as u32);
        w | (w << 32)
    } else {
        value
    };
    if value == 0 || value == u64::MAX {
        return None;
    }

    let mut size = 64u32;
    while size > 2 {
        let half = size / 2;
        let mask = (1u64 << half) - 1;
        if value & mask != (value >> half) & mask {
            break;
        }
        size = half;
    }

    let mask = if size == 64 { u64::MAX } else { (1u64 << size) - 1 };
    let elem = value & mask;
    let ones = elem.count_ones();
    let run = (1u64 << ones) - 1;
    let ror = |x: u64, n: u32| {
        if n == 0 {
            x
        } else {
            ((x >> n) | (x << (size - n))) & mask
        }
    };
    let rot = (0..size).find(|&n| ror(elem, n) == run)?;

    let immr = (size - rot) % size;
    let imms = (!(size * 2 - 1) & 0x3F) | (ones - 1);
    Some((u32::from(size == 64), immr, imms))
}

/// AND/ORR/EOR/ANDS family; `negate` selects BIC/ORN/EON/BICS.
fn logical(
    ctx: &mut EncodeCtx<'_>,
    instr: &Instruction,
    opc: u32,
    negate: bool,
    rd: A64Reg,
    rn: A64Reg,
    at: usize,
) -> Result<u32, Fault> {
    let shift = shift_at(instr, at + 1)?;
    match instr.operands.get(at) {
        Some(Operand::Imm(e)) => {
            if shift.is_some() {
                return Err(invalid(instr, at + 1, "unexpected shift"));
            }
            same_width(instr, &[rd, rn])?;
            let span = instr.op_span(at);
            let value = ctx.eval_in(e, any_range(width(rd)), span)? as u64;
            let value = if negate { !value } else { value };
            let (n, immr, imms) = bitmask_imm(value, width(rd)).ok_or_else(|| {
                Fault::new(
                    ErrorCode::FixupInvalid,
                    format!("{:#x} is not a valid logical immediate", value),
                    span,
                )
            })?;
            Ok(sf(rd) << 31
                | opc << 29
                | 0x1200_0000
                | n << 22
                | immr << 16
                | imms << 10
                | r(rn) << 5
                | r(rd))
        }
        Some(Operand::Reg(Register::A64(_))) => {
            let rm = reg(instr, at, Slot::Zr)?;
            same_width(instr, &[rd, rn, rm])?;
            let (kind, amount) = match shift {
                Some(s) => (
                    shift_type(s.kind, true, instr.op_span(at + 1))?,
                    shift_amount(ctx, s, i128::from(width(rd)) - 1, instr.op_span(at + 1))?,
                ),
                None => (0, 0),
            };
            Ok(sf(rd) << 31
                | opc << 29
                | 0x0A00_0000
                | kind << 22
                | u32::from(negate) << 21
                | r(rm) << 16
                | amount << 10
                | r(rn) << 5
                | r(rd))
        }
        _ => Err(invalid(instr, at, "expected register or immediate")),
    }
}

// ── Move ─────────────────────────────────────────────────────────────────

fn encode_mov(ctx: &mut EncodeCtx<'_>, instr: &Instruction) -> Result<u32, Fault> {
    count(instr, 2, 2)?;
    match &instr.operands[1] {
        Operand::Reg(Register::A64(rm)) => {
            let rd = reg_either(instr, 0, Slot::Sp)?;
            let rm = *rm;
            same_width(instr, &[rd, rm])?;
            if (rd.num == 31 && rd.sp) || (rm.num == 31 && rm.sp) {
                // mov to/from sp is add rd, rn, #0
                Ok(sf(rd) << 31 | 0x1100_0000 | r(rm) << 5 | r(rd))
            } else {
                Ok(sf(rd) << 31 | 0x2A00_0000 | r(rm) << 16 | 31 << 5 | r(rd))
            }
        }
        Operand::Imm(e) => {
            let rd = reg_either(instr, 0, Slot::Sp)?;
            let bits = width(rd);
            let span = instr.op_span(1);
            let mask = if rd.wide { u64::MAX } else { u64::from(u32::MAX) };
            let value = ctx.eval_in(e, any_range(bits), span)? as u64 & mask;
            let is_sp = rd.num == 31 && rd.sp;

            let single_chunk = |v: u64| (0..bits / 16).find(|&hw| v & !(0xFFFF << (hw * 16)) == 0);
            if !is_sp {
                if let Some(hw) = single_chunk(value) {
                    let imm = (value >> (hw * 16)) as u32 & 0xFFFF;
                    return Ok(sf(rd) << 31 | 0x5280_0000 | hw << 21 | imm << 5 | r(rd));
                }
                let inverted = !value & mask;
                if let Some(hw) = single_chunk(inverted) {
                    let imm = (inverted >> (hw * 16)) as u32 & 0xFFFF;
                    return Ok(sf(rd) << 31 | 0x1280_0000 | hw << 21 | imm << 5 | r(rd));
                }
            }
            match bitmask_imm(value, bits) {
                Some((n, immr, imms)) => Ok(sf(rd) << 31
                    | 0x3200_0000
                    | n << 22
                    | immr << 16
                    | imms << 10
                    | 31 << 5
                    | r(rd)),
                None => Err(Fault::new(
                    ErrorCode::FixupInvalid,
                    format!("{:#x} cannot be loaded with a single mov", value),
                    span,
                )),
            }
        }
        _ => Err(invalid(instr, 1, "expected register or immediate")),
    }
}

/// MOVZ/MOVN/MOVK `rd, #imm16{, lsl #n}`.
fn encode_move_wide(ctx: &mut EncodeCtx<'_>, instr: &Instruction, base: u32) -> Result<u32, Fault> {
    count(instr, 2, 3)?;
    let rd = reg(instr, 0, Slot::Zr)?;
    let imm = ctx.eval_in(expr(instr, 1)?, unsigned_range(16), instr.op_span(1))? as u32;
    let hw = match shift_at(instr, 2)? {
        Some(s) if s.kind == ShiftKind::Lsl => {
            let amount = shift_amount(ctx, s, i128::from(width(rd)) - 16, instr.op_span(2))?;
            if amount % 16 != 0 {
                return Err(invalid(instr, 2, "shift must be a multiple of 16"));
            }
            amount / 16
        }
        Some(_) => return Err(invalid(instr, 2, "expected 'lsl'")),
        None => 0,
    };
    Ok(sf(rd) << 31 | base | hw << 21 | imm << 5 | r(rd))
}

// ── Shifts ───────────────────────────────────────────────────────────────

fn encode_shift(ctx: &mut EncodeCtx<'_>, instr: &Instruction) -> Result<u32, Fault> {
    count(instr, 3, 3)?;
    let rd = reg(instr, 0, Slot::Zr)?;
    let rn = reg(instr, 1, Slot::Zr)?;
    same_width(instr, &[rd, rn])?;
    let mnemonic = instr.mnemonic.as_str();
    let bits = width(rd);
    let n = sf(rd);

    if let Some(Operand::Reg(_)) = instr.operands.get(2) {
        let rm = reg(instr, 2, Slot::Zr)?;
        same_width(instr, &[rd, rm])?;
        let op2 = match mnemonic {
            "lsl" => 0,
            "lsr" => 1,
            "asr" => 2,
            _ => 3,
        };
        return Ok(n << 31 | 0x1AC0_2000 | r(rm) << 16 | op2 << 10 | r(rn) << 5 | r(rd));
    }

    let s = ctx.eval_in(expr(instr, 2)?, (0, i128::from(bits) - 1), instr.op_span(2))? as u32;
    Ok(match mnemonic {
        "lsl" => {
            let immr = (bits - s) % bits;
            let imms = bits - 1 - s;
            n << 31 | 0x5300_0000 | n << 22 | immr << 16 | imms << 10 | r(rn) << 5 | r(rd)
        }
        "lsr" => n << 31 | 0x5300_0000 | n << 22 | s << 16 | (bits - 1) << 10 | r(rn) << 5 | r(rd),
        "asr" => n << 31 | 0x1300_0000 | n << 22 | s << 16 | (bits - 1) << 10 | r(rn) << 5 | r(rd),
        // ror #s is extr rd, rn, rn, #s
        _ => n << 31 | 0x1380_0000 | n << 22 | r(rn) << 16 | s << 10 | r(rn) << 5 | r(rd),
    })
}

// ── Load / Store ─────────────────────────────────────────────────────────

/// `(size, opc, unscaled_only)` of a load/store mnemonic for target `rt`.
fn ldst_kind(instr: &Instruction, rt: A64Reg) -> Result<(u32, u32, bool), Fault> {
    let mnemonic = instr.mnemonic.as_str();
    let unscaled = mnemonic.starts_with("ldur") || mnemonic.starts_with("stur");
    let base: &str = if unscaled {
        &mnemonic[4..]
    } else {
        &mnemonic[3..]
    };
    let load = mnemonic.starts_with("ld");
    let signed_opc = if rt.wide { 2 } else { 3 };
    let (size, opc, needs) = match base {
        "" => (2 + sf(rt), u32::from(load), None),
        "b" => (0, u32::from(load), Some(false)),
        "h" => (1, u32::from(load), Some(false)),
        "sb" => (0, signed_opc, None),
        "sh" => (1, signed_opc, None),
        "sw" => (2, 2, Some(true)),
        _ => return Err(Fault::mnemonic(mnemonic, "arm64", instr.span)),
    };
    if needs.map_or(false, |wide| wide != rt.wide) {
        return Err(invalid(instr, 0, "invalid register width for this access size"));
    }
    Ok((size, opc, unscaled))
}

fn mem_base(instr: &Instruction, i: usize, mem: &ArmMem) -> Result<A64Reg, Fault> {
    match mem.base {
        Register::A64(r) if r.wide && !(r.num == 31 && !r.sp) => Ok(r),
        _ => Err(invalid(instr, i, "memory base must be a 64-bit register or sp")),
    }
}

/// Literal immediate offset of a memory operand.
fn mem_offset(ctx: &mut EncodeCtx<'_>, offset: &ArmOffset, span: Span) -> Result<i128, Fault> {
    match offset {
        ArmOffset::None => Ok(0),
        ArmOffset::Imm(e) => ctx.eval_in(e, signed_range(32), span),
        ArmOffset::Reg { .. } => Err(Fault::operand("expected immediate offset", span)),
    }
}

fn encode_ldr_str(ctx: &mut EncodeCtx<'_>, instr: &Instruction) -> Result<u32, Fault> {
    count(instr, 2, 3)?;
    let rt = reg(instr, 0, Slot::Zr)?;
    let (size, opc, unscaled) = ldst_kind(instr, rt)?;
    let rt_bits = r(rt);
    let fixed = size << 30 | opc << 22;

    let mem = match &instr.operands[1] {
        Operand::ArmMem(mem) => mem,
        Operand::Imm(target) => {
            // LDR (literal)
            let lit_opc = match (instr.mnemonic.as_str(), rt.wide) {
                ("ldr", false) => 0,
                ("ldr", true) => 1,
                ("ldrsw", _) => 2,
                _ => return Err(invalid(instr, 1, "expected memory operand")),
            };
            count(instr, 2, 2)?;
            let off = pc_offset(ctx, target, 21, 4, instr.op_span(1))?;
            return Ok(lit_opc << 30 | 0x1800_0000 | ((off >> 2) as u32 & 0x7_FFFF) << 5 | rt_bits);
        }
        _ => return Err(invalid(instr, 1, "expected memory operand")),
    };
    let rn = r(mem_base(instr, 1, mem)?);
    let span = instr.op_span(1);

    // Post-index: [Xn], #imm
    if let Some(post) = instr.operands.get(2) {
        let Operand::Imm(e) = post else {
            return Err(invalid(instr, 2, "expected immediate"));
        };
        if mem.writeback || !matches!(mem.offset, ArmOffset::None) || unscaled {
            return Err(invalid(instr, 2, "invalid post-index form"));
        }
        let imm = ctx.eval_in(e, signed_range(9), instr.op_span(2))?;
        return Ok(fixed | 0x3800_0400 | (imm as u32 & 0x1FF) << 12 | rn << 5 | rt_bits);
    }

    if let ArmOffset::Reg {
        reg: index,
        subtract,
        shift,
    } = &mem.offset
    {
        let Register::A64(rm) = *index else {
            return Err(invalid(instr, 1, "expected index register"));
        };
        if *subtract || mem.writeback || unscaled {
            return Err(invalid(instr, 1, "invalid register offset form"));
        }
        let option = match shift.as_ref().map(|s| s.kind) {
            None | Some(ShiftKind::Lsl) if rm.wide => 3,
            Some(ShiftKind::Uxtw) if !rm.wide => 2,
            Some(ShiftKind::Sxtw) if !rm.wide => 6,
            Some(ShiftKind::Sxtx) if rm.wide => 7,
            _ => return Err(invalid(instr, 1, "invalid index extend")),
        };
        let s = match shift {
            Some(sh) => match shift_amount(ctx, sh, 4, span)? {
                0 => 0,
                n if n == size => 1,
                _ => return Err(invalid(instr, 1, "shift must be 0 or the access size")),
            },
            None => 0,
        };
        return Ok(fixed | 0x3820_0800 | r(rm) << 16 | option << 13 | s << 12 | rn << 5 | rt_bits);
    }

    let imm = mem_offset(ctx, &mem.offset, span)?;
    if mem.writeback {
        if unscaled {
            return Err(invalid(instr, 1, "invalid pre-index form"));
        }
        let imm = ctx.fit(Value::constant(imm), signed_range(9), span)?;
        return Ok(fixed | 0x3800_0C00 | (imm as u32 & 0x1FF) << 12 | rn << 5 | rt_bits);
    }
    let scale = 1i128 << size;
    if !unscaled && imm >= 0 && imm % scale == 0 && imm / scale <= 0xFFF {
        return Ok(fixed | 0x3900_0000 | ((imm / scale) as u32) << 10 | rn << 5 | rt_bits);
    }
    let imm = ctx.fit(Value::constant(imm), signed_range(9), span)?;
    Ok(fixed | 0x3800_0000 | (imm as u32 & 0x1FF) << 12 | rn << 5 | rt_bits)
}

fn encode_ldp_stp(ctx: &mut EncodeCtx<'_>, instr: &Instruction) -> Result<u32, Fault> {
    count(instr, 3, 4)?;
    let rt = reg(instr, 0, Slot::Zr)?;
    let rt2 = reg(instr, 1, Slot::Zr)?;
    same_width(instr, &[rt, rt2])?;
    let Operand::ArmMem(mem) = &instr.operands[2] else {
        return Err(invalid(instr, 2, "expected memory operand"));
    };
    let rn = r(mem_base(instr, 2, mem)?);
    let load = u32::from(instr.mnemonic == "ldp");
    let scale: i128 = if rt.wide { 8 } else { 4 };

    let (mode, imm, span) = match instr.operands.get(3) {
        Some(Operand::Imm(e)) => {
            if mem.writeback || !matches!(mem.offset, ArmOffset::None) {
                return Err(invalid(instr, 3, "invalid post-index form"));
            }
            let span = instr.op_span(3);
            (1, ctx.eval_in(e, signed_range(32), span)?, span)
        }
        Some(_) => return Err(invalid(instr, 3, "expected immediate")),
        None => {
            let span = instr.op_span(2);
            let mode = if mem.writeback { 3 } else { 2 };
            (mode, mem_offset(ctx, &mem.offset, span)?, span)
        }
    };
    ctx.aligned(Value::constant(imm), scale, span)?;
    let imm7 = ctx.fit(Value::constant(imm / scale), signed_range(7), span)?;
    let opc = if rt.wide { 2 } else { 0 };
    Ok(opc << 30
        | 0x2800_0000
        | mode << 23
        | load << 22
        | (imm7 as u32 & 0x7F) << 15
        | r(rt2) << 10
        | rn << 5
        | r(rt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::error::ErrorCode;
    use crate::option::Syntax;
    use crate::parser::{parse_statement, ParseContext};
    use crate::symbols::SymbolTable;

    fn try_word_at(src: &str, addr: u64) -> Result<u32, Fault> {
        let mut pctx = ParseContext {
            arch: Arch::Arm64,
            dialect: Syntax::Gas,
            radix16: false,
        };
        let instr = match parse_statement(src, &mut pctx).body {
            Some(Ok(Body::Instruction(i))) => i,
            other => panic!("{}: {:?}", src, other),
        };
        let mut ctx = EncodeCtx::new(SymbolTable::new(None, 16), 64, false, false);
        ctx.strict = true;
        ctx.addr = addr;
        let bytes = encode(&instr, &mut ctx)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn word(src: &str) -> u32 {
        try_word_at(src, 0).unwrap_or_else(|e| panic!("{}: {:?}", src, e))
    }

    fn err(src: &str) -> ErrorCode {
        try_word_at(src, 0).unwrap_err().code
    }

    #[test]
    fn system() {
        assert_eq!(word("nop"), 0xD503_201F);
        assert_eq!(word("ret"), 0xD65F_03C0);
        assert_eq!(word("svc #0"), 0xD400_0001);
        assert_eq!(word("brk #1"), 0xD420_0020);
        assert_eq!(word("isb"), 0xD503_3FDF);
        assert_eq!(word("dmb ish"), 0xD503_3BBF);
        assert_eq!(word("dsb sy"), 0xD503_3F9F);
        assert_eq!(word("wfi"), 0xD503_207F);
    }

    #[test]
    fn add_sub() {
        assert_eq!(word("add x0, x1, #1"), 0x9100_0420);
        assert_eq!(word("add x0, x1, #-1"), 0xD100_0420);
        assert_eq!(word("sub sp, sp, #16"), 0xD100_43FF);
        assert_eq!(word("add x0, x1, #1, lsl #12"), 0x9140_0420);
        assert_eq!(word("add x0, x1, #0x1000"), 0x9140_0420);
        assert_eq!(word("add w0, w1, w2"), 0x0B02_0020);
        assert_eq!(word("add x0, x1, x2, lsl #3"), 0x8B02_0C20);
        assert_eq!(word("subs x0, x1, x2"), 0xEB02_0020);
        assert_eq!(word("cmp x0, #5"), 0xF100_141F);
        assert_eq!(word("cmp w1, w2"), 0x6B02_003F);
        assert_eq!(word("add x0, sp, x1"), 0x8B21_63E0);
        assert_eq!(word("add x0, x1, w2, uxtw"), 0x8B22_4020);
        assert_eq!(err("add x0, x1, #0x1001"), ErrorCode::FixupInvalid);
        assert_eq!(err("add x0, w1, #1"), ErrorCode::InvalidOperand);
    }

    #[test]
    fn logical() {
        assert_eq!(word("and x0, x1, #0xff"), 0x9240_1C20);
        assert_eq!(word("orr w0, w1, #0xff00"), 0x3218_1C20);
        assert_eq!(word("eor x0, x1, x2"), 0xCA02_0020);
        assert_eq!(word("orr x0, x1, x2, lsl #4"), 0xAA02_1020);
        assert_eq!(word("bic w0, w1, w2"), 0x0A22_0020);
        assert_eq!(word("tst x0, #1"), 0xF240_001F);
        assert_eq!(word("mvn x0, x1"), 0xAA21_03E0);
        assert_eq!(err("and x0, x1, #0"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn bitmask_immediates() {
        assert_eq!(bitmask_imm(0xFF, 64), Some((1, 0, 7)));
        assert_eq!(bitmask_imm(0xFF00, 64), Some((1, 56, 7)));
        assert_eq!(bitmask_imm(0x5555_5555_5555_5555, 64), Some((0, 0, 0x3C)));
        assert_eq!(bitmask_imm(1, 32), Some((0, 0, 0)));
        assert_eq!(bitmask_imm(0, 64), None);
        assert_eq!(bitmask_imm(u64::MAX, 64), None);
        assert_eq!(bitmask_imm(0x1234, 64), None);
    }

    #[test]
    fn moves() {
        assert_eq!(word("mov x0, #1"), 0xD280_0020);
        assert_eq!(word("mov w0, #0x10000"), 0x52A0_0020);
        assert_eq!(word("mov x0, #-1"), 0x9280_0000);
        assert_eq!(word("mov w0, #-1"), 0x1280_0000);
        assert_eq!(word("mov x0, #0xff00ff00ff00ff00"), 0xB208_9FE0);
        assert_eq!(word("mov x0, x1"), 0xAA01_03E0);
        assert_eq!(word("mov x29, sp"), 0x9100_03FD);
        assert_eq!(word("movz x0, #0x1234, lsl #16"), 0xD2A2_4680);
        assert_eq!(word("movk x0, #0xbeef"), 0xF297_DDE0);
        assert_eq!(word("movn w0, #0"), 0x1280_0000);
        assert_eq!(err("mov x0, #0x1234567"), ErrorCode::FixupInvalid);
        assert_eq!(err("movz w0, #1, lsl #32"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn shifts_and_multiply() {
        assert_eq!(word("lsl x0, x1, #4"), 0xD37C_EC20);
        assert_eq!(word("lsr w0, w1, #3"), 0x5303_7C20);
        assert_eq!(word("asr x0, x1, #63"), 0x937F_FC20);
        assert_eq!(word("lsl x0, x1, x2"), 0x9AC2_2020);
        assert_eq!(word("mul x0, x1, x2"), 0x9B02_7C20);
        assert_eq!(word("madd w0, w1, w2, w3"), 0x1B02_0C20);
        assert_eq!(word("sdiv x0, x1, x2"), 0x9AC2_0C20);
        assert_eq!(word("udiv w0, w1, w2"), 0x1AC2_0820);
    }

    #[test]
    fn loads_and_stores() {
        assert_eq!(word("ldr x0, [x1, #8]"), 0xF940_0420);
        assert_eq!(word("ldr w0, [x1]"), 0xB940_0020);
        assert_eq!(word("str w0, [sp, #-4]!"), 0xB81F_CFE0);
        assert_eq!(word("ldr x0, [x1], #16"), 0xF841_0420);
        assert_eq!(word("ldur x0, [x1, #-8]"), 0xF85F_8020);
        assert_eq!(word("ldr x0, [x1, #3]"), 0xF840_3020);
        assert_eq!(word("ldrb w0, [x1, #1]"), 0x3940_0420);
        assert_eq!(word("strh w0, [x1, #2]"), 0x7900_0420);
        assert_eq!(word("ldrsw x0, [x1]"), 0xB980_0020);
        assert_eq!(word("ldr x0, [x1, x2, lsl #3]"), 0xF862_7820);
        assert_eq!(word("stp x29, x30, [sp, #-16]!"), 0xA9BF_7BFD);
        assert_eq!(word("ldp x29, x30, [sp], #16"), 0xA8C1_7BFD);
        assert_eq!(word("ldp w0, w1, [x2, #8]"), 0x2941_0440);
        assert_eq!(err("ldrb x0, [x1]"), ErrorCode::InvalidOperand);
        assert_eq!(err("stp x0, x1, [sp, #4]"), ErrorCode::FixupInvalid);
    }

    #[test]
    fn branches() {
        assert_eq!(word("b 0x100"), 0x1400_0040);
        assert_eq!(word("bl 0"), 0x9400_0000);
        assert_eq!(try_word_at("b 0", 8).unwrap(), 0x17FF_FFFE);
        assert_eq!(word("b.eq 0x20"), 0x5400_0100);
        assert_eq!(word("b.ne 0"), 0x5400_0001);
        assert_eq!(word("cbz x0, 0x10"), 0xB400_0080);
        assert_eq!(word("cbnz w1, 0x10"), 0x3500_0081);
        assert_eq!(word("tbz w0, #3, 0x10"), 0x3618_0080);
        assert_eq!(word("br x16"), 0xD61F_0200);
        assert_eq!(word("blr x1"), 0xD63F_0020);
        assert_eq!(word("ret x1"), 0xD65F_0020);
        assert_eq!(word("adr x0, 0x10"), 0x1000_0080);
        assert_eq!(try_word_at("adrp x0, 0x2000", 0x1234).unwrap(), 0xB000_0000);
        assert_eq!(err("b 2"), ErrorCode::FixupInvalid);
        assert_eq!(err("b.xx 0"), ErrorCode::MnemonicFail);
    }

    #[test]
    fn unknown_mnemonic() {
        assert_eq!(err("foo x0"), ErrorCode::MnemonicFail);
    }
}
