//! x86 instruction encoding for 16-, 32- and 64-bit code.
//!
//! ## Instruction Classes
//!
//! - **Fixed encoding** (zero-operand): binary search in a const table
//! - **ALU class**: `ADD`/`OR`/`ADC`/`SBB`/`AND`/`SUB`/`XOR`/`CMP`
//! - **Unary class**: `NOT`/`NEG`/`MUL`/`DIV`/`IDIV`
//! - **Shift class**: `ROL`/`ROR`/`RCL`/`RCR`/`SHL`/`SAL`/`SHR`/`SAR`
//! - **Condition classes**: `Jcc`, `SETcc`, `CMOVcc` with all aliases
//! - **Complex**: `MOV`/`LEA`/`PUSH`/`POP`/`CALL`/`JMP`/`IMUL`/`XCHG`/`MOVZX`/...
//!
//! AT&T mnemonics are accepted with their size suffix (`movl`, `pushq`) and
//! under their conversion aliases (`movzbl`, `cltq`).
//!
//! `jmp` and `jcc` to a label start in their rel8 form and are promoted to
//! rel32 by the layout pass when the target moves out of range.

use alloc::format;

use crate::encoder::{any_range, fits, signed_range, EncodeCtx, InstrBytes};
use crate::error::{ErrorCode, Fault, Span};
use crate::ir::*;
use crate::symbols::Value;

// ─── Fixed-encoding table ───────────────────────────────────────────────────

/// Operand-size attributes of fixed encodings.
const ANY: u8 = 0;
/// 16-bit operand size (`66` outside 16-bit code).
const O16: u8 = 1;
/// 32-bit operand size (`66` in 16-bit code).
const O32: u8 = 2;
/// 64-bit operand size (`REX.W`).
const O64: u8 = 4;
/// Invalid in 64-bit mode.
const NO64: u8 = 8;
/// Only valid in 64-bit mode.
const ONLY64: u8 = 16;

/// Zero-operand instruction table, sorted by mnemonic for binary search.
const FIXED_TABLE: &[(&str, &[u8], u8)] = &[
    ("cbw", &[0x98], O16),
    ("cdq", &[0x99], O32),
    ("cdqe", &[0x98], O64),
    ("clc", &[0xF8], ANY),
    ("cld", &[0xFC], ANY),
    ("cli", &[0xFA], ANY),
    ("cmc", &[0xF5], ANY),
    ("cmpsb", &[0xA6], ANY),
    ("cmpsd", &[0xA7], O32),
    ("cmpsq", &[0xA7], O64),
    ("cmpsw", &[0xA7], O16),
    ("cpuid", &[0x0F, 0xA2], ANY),
    ("cqo", &[0x99], O64),
    ("cwd", &[0x99], O16),
    ("cwde", &[0x98], O32),
    ("fwait", &[0x9B], ANY),
    ("hlt", &[0xF4], ANY),
    ("insb", &[0x6C], ANY),
    ("insd", &[0x6D], O32),
    ("insw", &[0x6D], O16),
    ("int1", &[0xF1], ANY),
    ("int3", &[0xCC], ANY),
    ("into", &[0xCE], NO64),
    ("iret", &[0xCF], ANY),
    ("iretd", &[0xCF], O32),
    ("iretq", &[0xCF], O64),
    ("lahf", &[0x9F], ANY),
    ("leave", &[0xC9], ANY),
    ("lfence", &[0x0F, 0xAE, 0xE8], ANY),
    ("lock", &[0xF0], ANY),
    ("lodsb", &[0xAC], ANY),
    ("lodsd", &[0xAD], O32),
    ("lodsq", &[0xAD], O64),
    ("lodsw", &[0xAD], O16),
    ("mfence", &[0x0F, 0xAE, 0xF0], ANY),
    ("movsb", &[0xA4], ANY),
    ("movsd", &[0xA5], O32),
    ("movsq", &[0xA5], O64),
    ("movsw", &[0xA5], O16),
    ("nop", &[0x90], ANY),
    ("outsb", &[0x6E], ANY),
    ("outsd", &[0x6F], O32),
    ("outsw", &[0x6F], O16),
    ("pause", &[0xF3, 0x90], ANY),
    ("popa", &[0x61], NO64),
    ("popad", &[0x61], NO64 | O32),
    ("popf", &[0x9D], ANY),
    ("popfd", &[0x9D], NO64 | O32),
    ("popfq", &[0x9D], ONLY64),
    ("pusha", &[0x60], NO64),
    ("pushad", &[0x60], NO64 | O32),
    ("pushf", &[0x9C], ANY),
    ("pushfd", &[0x9C], NO64 | O32),
    ("pushfq", &[0x9C], ONLY64),
    ("rdtsc", &[0x0F, 0x31], ANY),
    ("rdtscp", &[0x0F, 0x01, 0xF9], ANY),
    ("rep", &[0xF3], ANY),
    ("repe", &[0xF3], ANY),
    ("repne", &[0xF2], ANY),
    ("repnz", &[0xF2], ANY),
    ("repz", &[0xF3], ANY),
    ("sahf", &[0x9E], ANY),
    ("scasb", &[0xAE], ANY),
    ("scasd", &[0xAF], O32),
    ("scasq", &[0xAF], O64),
    ("scasw", &[0xAF], O16),
    ("sfence", &[0x0F, 0xAE, 0xF8], ANY),
    ("stc", &[0xF9], ANY),
    ("std", &[0xFD], ANY),
    ("sti", &[0xFB], ANY),
    ("stosb", &[0xAA], ANY),
    ("stosd", &[0xAB], O32),
    ("stosq", &[0xAB], O64),
    ("stosw", &[0xAB], O16),
    ("syscall", &[0x0F, 0x05], ANY),
    ("sysenter", &[0x0F, 0x34], ANY),
    ("sysret", &[0x0F, 0x07], ANY),
    ("ud2", &[0x0F, 0x0B], ANY),
    ("wait", &[0x9B], ANY),
    ("xlatb", &[0xD7], ANY),
];

fn lookup_fixed(mnemonic: &str) -> Option<(&'static [u8], u8)> {
    FIXED_TABLE
        .binary_search_by_key(&mnemonic, |&(name, _, _)| name)
        .ok()
        .map(|idx| (FIXED_TABLE[idx].1, FIXED_TABLE[idx].2))
}

/// Condition-code suffix to its 4-bit encoding.
fn cond(suffix: &str) -> Option<u8> {
    Some(match suffix {
        "o" => 0x0,
        "no" => 0x1,
        "b" | "c" | "nae" => 0x2,
        "ae" | "nb" | "nc" => 0x3,
        "e" | "z" => 0x4,
        "ne" | "nz" => 0x5,
        "be" | "na" => 0x6,
        "a" | "nbe" => 0x7,
        "s" => 0x8,
        "ns" => 0x9,
        "p" | "pe" => 0xA,
        "np" | "po" => 0xB,
        "l" | "nge" => 0xC,
        "ge" | "nl" => 0xD,
        "le" | "ng" => 0xE,
        "g" | "nle" => 0xF,
        _ => return None,
    })
}

/// AT&T names that are not a plain mnemonic plus size suffix.
///
/// Returns the Intel mnemonic and the implied memory operand size.
fn att_alias(mnemonic: &str) -> Option<(&'static str, Option<u8>)> {
    let size = |c: u8| match c {
        b'b' => Some(1),
        b'w' => Some(2),
        b'l' => Some(4),
        _ => None,
    };
    Some(match mnemonic {
        "cbtw" => ("cbw", None),
        "cwtl" => ("cwde", None),
        "cltq" => ("cdqe", None),
        "cwtd" => ("cwd", None),
        "cltd" => ("cdq", None),
        "cqto" => ("cqo", None),
        "movslq" => ("movsxd", Some(4)),
        "movsl" => ("movsd", None),
        "cmpsl" => ("cmpsd", None),
        "lodsl" => ("lodsd", None),
        "scasl" => ("scasd", None),
        "stosl" => ("stosd", None),
        "movabsq" => ("mov", Some(8)),
        _ => {
            // movzbl, movswq, ...: source size then destination size
            let b = mnemonic.as_bytes();
            if b.len() != 6 || !matches!(b[5], b'w' | b'l' | b'q') {
                return None;
            }
            let name = match &mnemonic[..4] {
                "movz" => "movzx",
                "movs" => "movsx",
                _ => return None,
            };
            (name, Some(size(b[4]).filter(|&s| s <= 2)?))
        }
    })
}

// ─── Encoding helpers ───────────────────────────────────────────────────────

/// Segment override prefix per segment register number.
const SEG_PREFIX: [u8; 6] = [0x26, 0x2E, 0x36, 0x3E, 0x64, 0x65];

#[inline]
fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

#[inline]
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    let ss = match scale {
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 0,
    };
    (ss << 6) | ((index & 7) << 3) | (base & 7)
}

const REX_W: u8 = 8;
const REX_R: u8 = 4;
const REX_X: u8 = 2;
const REX_B: u8 = 1;

/// Register or memory operand in a ModR/M r/m slot.
#[derive(Clone, Copy)]
enum Rm<'a> {
    Reg(X86Reg),
    Mem(&'a X86Mem),
}

fn as_reg(op: &Operand) -> Option<X86Reg> {
    match op {
        Operand::Reg(Register::X86(r)) => Some(*r),
        _ => None,
    }
}

fn as_gp(op: &Operand) -> Option<X86Reg> {
    as_reg(op).filter(|r| r.is_gp())
}

fn as_rm(op: &Operand) -> Option<Rm<'_>> {
    match op {
        Operand::Reg(Register::X86(r)) if r.is_gp() => Some(Rm::Reg(*r)),
        Operand::Mem(m) => Some(Rm::Mem(m)),
        _ => None,
    }
}

fn as_imm(op: &Operand) -> Option<&Expr> {
    match op {
        Operand::Imm(e) => Some(e),
        _ => None,
    }
}

fn imm_range(size: u8) -> (i128, i128) {
    match size {
        1 => any_range(8),
        2 => any_range(16),
        4 => any_range(32),
        _ => signed_range(32),
    }
}

/// One instruction under construction.
struct X86<'i> {
    instr: &'i Instruction,
    bits: u8,
    /// Memory operand size implied by an AT&T suffix or alias.
    hint: Option<u8>,
    seg: Option<u8>,
    opsize: bool,
    addrsize: bool,
    rex: u8,
    force_rex: bool,
    forbid_rex: bool,
    opcode: InstrBytes,
    modrm: Option<u8>,
    sib: Option<u8>,
    disp: InstrBytes,
    /// RIP-relative target; the displacement is fixed up once the length is known.
    rip: Option<(i128, Span)>,
    imm: InstrBytes,
}

/// Encode one x86 instruction.
pub(crate) fn encode(instr: &Instruction, ctx: &mut EncodeCtx<'_>) -> Result<InstrBytes, Fault> {
    let mnemonic = instr.mnemonic.as_str();
    if instr.att {
        if let Some((name, hint)) = att_alias(mnemonic) {
            if let Some(result) = X86::new(instr, ctx, hint).run(ctx, name) {
                return result;
            }
        }
    }
    if let Some(result) = X86::new(instr, ctx, None).run(ctx, mnemonic) {
        return result;
    }
    if instr.att && mnemonic.len() > 1 {
        let (stem, suffix) = mnemonic.split_at(mnemonic.len() - 1);
        let size = match suffix {
            "b" => Some(1),
            "w" => Some(2),
            "l" => Some(4),
            "q" => Some(8),
            _ => None,
        };
        if let Some(size) = size {
            if let Some(result) = X86::new(instr, ctx, Some(size)).run(ctx, stem) {
                return result;
            }
        }
    }
    Err(Fault::mnemonic(mnemonic, "x86", instr.span))
}

impl<'i> X86<'i> {
    fn new(instr: &'i Instruction, ctx: &EncodeCtx<'_>, hint: Option<u8>) -> Self {
        Self {
            instr,
            bits: ctx.x86_bits,
            hint,
            seg: None,
            opsize: false,
            addrsize: false,
            rex: 0,
            force_rex: false,
            forbid_rex: false,
            opcode: InstrBytes::new(),
            modrm: None,
            sib: None,
            disp: InstrBytes::new(),
            rip: None,
            imm: InstrBytes::new(),
        }
    }

    /// Encode as `mnemonic`; `None` if the mnemonic is unknown.
    fn run(mut self, ctx: &mut EncodeCtx<'_>, mnemonic: &str) -> Option<Result<InstrBytes, Fault>> {
        let result = self.dispatch(ctx, mnemonic)?;
        Some(result.and_then(|()| self.finish(ctx)))
    }

    fn dispatch(&mut self, ctx: &mut EncodeCtx<'_>, m: &str) -> Option<Result<(), Fault>> {
        Some(match m {
            // ── ALU class ───────────────────────────────────────────
            "add" => self.alu(ctx, 0),
            "or" => self.alu(ctx, 1),
            "adc" => self.alu(ctx, 2),
            "sbb" => self.alu(ctx, 3),
            "and" => self.alu(ctx, 4),
            "sub" => self.alu(ctx, 5),
            "xor" => self.alu(ctx, 6),
            "cmp" => self.alu(ctx, 7),
            "test" => self.test(ctx),

            // ── Data movement ───────────────────────────────────────
            "mov" | "movabs" => self.mov(ctx),
            "lea" => self.lea(ctx),
            "xchg" => self.xchg(ctx),
            "push" => self.push(ctx),
            "pop" => self.pop(ctx),
            "movzx" => self.extend(ctx, 0xB6),
            "movsx" => self.extend(ctx, 0xBE),
            "movsxd" => self.movsxd(ctx),
            "bswap" => self.bswap(),

            // ── Unary class ─────────────────────────────────────────
            "inc" => self.inc_dec(ctx, 0),
            "dec" => self.inc_dec(ctx, 1),
            "not" => self.unary(ctx, 2),
            "neg" => self.unary(ctx, 3),
            "mul" => self.unary(ctx, 4),
            "div" => self.unary(ctx, 6),
            "idiv" => self.unary(ctx, 7),
            "imul" => self.imul(ctx),

            // ── Shift class ─────────────────────────────────────────
            "rol" => self.shift(ctx, 0),
            "ror" => self.shift(ctx, 1),
            "rcl" => self.shift(ctx, 2),
            "rcr" => self.shift(ctx, 3),
            "shl" | "sal" => self.shift(ctx, 4),
            "shr" => self.shift(ctx, 5),
            "sar" => self.shift(ctx, 7),

            // ── Control flow ────────────────────────────────────────
            "jmp" => self.jump(ctx, 4),
            "call" => self.jump(ctx, 2),
            "loop" => self.short_branch(ctx, 0xE2, None),
            "loope" | "loopz" => self.short_branch(ctx, 0xE1, None),
            "loopne" | "loopnz" => self.short_branch(ctx, 0xE0, None),
            "jcxz" => self.short_branch(ctx, 0xE3, Some(16)),
            "jecxz" => self.short_branch(ctx, 0xE3, Some(32)),
            "jrcxz" => self.short_branch(ctx, 0xE3, Some(64)),
            "int" => self.int(ctx),
            "ret" | "retn" => self.ret(ctx, 0xC3),
            "retf" | "lret" => self.ret(ctx, 0xCB),

            _ => {
                if let Some(cc) = m.strip_prefix("cmov").and_then(cond) {
                    self.cmov(ctx, cc)
                } else if let Some(cc) = m.strip_prefix("set").and_then(cond) {
                    self.setcc(ctx, cc)
                } else if let Some(cc) = m.strip_prefix('j').and_then(cond) {
                    self.jcc(ctx, cc)
                } else if let Some((bytes, flags)) = lookup_fixed(m) {
                    self.fixed(bytes, flags)
                } else {
                    return None;
                }
            }
        })
    }

    // ── Building blocks ──────────────────────────────────────────────

    fn invalid(&self) -> Fault {
        Fault::operand(
            format!("invalid operands for '{}'", self.instr.mnemonic),
            self.instr.span,
        )
    }

    fn ops<const N: usize>(&self) -> Result<&'i [Operand; N], Fault> {
        let instr = self.instr;
        instr.operands.as_slice().try_into().map_err(|_| {
            Fault::operand(
                format!("'{}' expects {} operand(s)", self.instr.mnemonic, N),
                self.instr.span,
            )
        })
    }

    fn span(&self, i: usize) -> Span {
        self.instr.op_span(i)
    }

    /// Record the mode requirements of a register.
    fn note_reg(&mut self, reg: X86Reg, span: Span) -> Result<(), Fault> {
        if self.bits != 64 && (reg.class == X86Class::Gp64 || reg.is_extended() || reg.needs_rex_for_byte()) {
            return Err(Fault::new(
                ErrorCode::MissingFeature,
                format!("register '{}' requires 64-bit mode", reg),
                span,
            ));
        }
        if reg.needs_rex_for_byte() {
            self.force_rex = true;
        }
        if reg.class == X86Class::Gp8High {
            self.forbid_rex = true;
        }
        Ok(())
    }

    /// Apply the operand-size prefix or `REX.W` for `size`.
    fn size(&mut self, size: u8) {
        match size {
            2 => self.opsize = self.bits != 16,
            4 => self.opsize = self.bits == 16,
            8 => self.rex |= REX_W,
            _ => {}
        }
    }

    /// Size of an r/m operand, from the register, the `ptr` keyword or the
    /// mnemonic suffix.
    fn rm_size(&self, rm: Rm<'_>, span: Span) -> Result<u8, Fault> {
        match rm {
            Rm::Reg(r) => Ok(r.size()),
            Rm::Mem(m) => m.size.or(self.hint).ok_or_else(|| {
                Fault::operand("operand size not specified", span)
            }),
        }
    }

    /// Size shared by a register and an r/m operand.
    fn pair_size(&self, reg: X86Reg, rm: Rm<'_>, span: Span) -> Result<u8, Fault> {
        let size = reg.size();
        match rm {
            Rm::Reg(r) if r.size() != size => Err(Fault::operand("operand size mismatch", span)),
            Rm::Mem(m) if m.size.map_or(false, |s| s != size) => {
                Err(Fault::operand("operand size mismatch", span))
            }
            _ => Ok(size),
        }
    }

    fn op(&mut self, bytes: &[u8]) {
        self.opcode.extend_from_slice(bytes);
    }

    fn imm(&mut self, value: i128, size: u8) {
        let bytes = (value as i64).to_le_bytes();
        self.imm.extend_from_slice(&bytes[..size as usize]);
    }

    /// Emit ModR/M (and SIB/displacement) for `reg` and an r/m operand.
    fn rm(&mut self, ctx: &mut EncodeCtx<'_>, reg: u8, rm: Rm<'_>, span: Span) -> Result<(), Fault> {
        if reg & 8 != 0 {
            self.rex |= REX_R;
        }
        match rm {
            Rm::Reg(r) => {
                self.note_reg(r, span)?;
                if r.is_extended() {
                    self.rex |= REX_B;
                }
                self.modrm = Some(modrm(3, reg, r.code()));
                Ok(())
            }
            Rm::Mem(m) => self.mem(ctx, reg, m, span),
        }
    }

    fn mem(&mut self, ctx: &mut EncodeCtx<'_>, reg: u8, m: &X86Mem, span: Span) -> Result<(), Fault> {
        if let Some(seg) = m.seg {
            self.seg = Some(SEG_PREFIX[seg.num as usize % 6]);
        }
        for r in m.base.iter().chain(m.index.iter()) {
            if !(r.is_gp() || r.class == X86Class::Ip) || r.size() == 1 {
                return Err(Fault::operand(format!("invalid address register '{}'", r), span));
            }
        }
        let addr_size = match (m.base, m.index) {
            (Some(b), Some(i)) if b.size() != i.size() => {
                return Err(Fault::operand("mixed address register sizes", span))
            }
            (Some(r), _) | (None, Some(r)) => r.size() * 8,
            (None, None) => self.bits,
        };
        match (addr_size, self.bits) {
            (64, 64) | (32, 32) | (16, 16) => {}
            (64, _) => {
                return Err(Fault::new(
                    ErrorCode::MissingFeature,
                    "64-bit addressing requires 64-bit mode",
                    span,
                ))
            }
            (16, 64) => {
                return Err(Fault::operand(
                    "16-bit addressing is not available in 64-bit mode",
                    span,
                ))
            }
            _ => self.addrsize = true,
        }

        let disp = match &m.disp {
            Some(e) => Some(ctx.eval(e, span)?),
            None => None,
        };

        if m.base.map_or(false, |b| b.class == X86Class::Ip) {
            if m.index.is_some() {
                return Err(Fault::operand("RIP-relative address cannot have an index", span));
            }
            self.modrm = Some(modrm(0, reg, 5));
            match disp {
                Some(v) if v.relocatable => {
                    self.rip = Some((v.value, span));
                    self.disp.extend_from_slice(&[0; 4]);
                }
                Some(v) => {
                    let d = ctx.fit(v, signed_range(32), span)?;
                    self.disp.extend_from_slice(&(d as i32).to_le_bytes());
                }
                None => self.disp.extend_from_slice(&[0; 4]),
            }
            return Ok(());
        }

        if addr_size == 16 {
            return self.mem16(ctx, reg, m, disp, span);
        }

        let disp_range = if addr_size == 64 {
            signed_range(32)
        } else {
            any_range(32)
        };
        if let Some(index) = m.index {
            if index.num == 4 {
                return Err(Fault::operand(format!("'{}' cannot be an index register", index), span));
            }
            if index.is_extended() {
                self.rex |= REX_X;
            }
        }
        if let Some(base) = m.base {
            if base.is_extended() {
                self.rex |= REX_B;
            }
        }

        match (m.base, m.index) {
            (None, None) => {
                if self.bits == 64 {
                    self.modrm = Some(modrm(0, reg, 4));
                    self.sib = Some(sib(1, 4, 5));
                } else {
                    self.modrm = Some(modrm(0, reg, 5));
                }
                self.disp32(ctx, disp, disp_range, span)
            }
            (None, Some(index)) => {
                self.modrm = Some(modrm(0, reg, 4));
                self.sib = Some(sib(m.scale, index.code(), 5));
                self.disp32(ctx, disp, disp_range, span)
            }
            (Some(base), index) => {
                let mod_ = match disp {
                    None if base.code() != 5 => 0,
                    None => 1,
                    Some(v) if v.relocatable => 2,
                    Some(v) if v.value == 0 && base.code() != 5 => 0,
                    Some(v) if fits(v.value, signed_range(8)) => 1,
                    Some(_) => 2,
                };
                let rm = if index.is_some() || base.code() == 4 {
                    let idx = index.map_or(4, X86Reg::code);
                    self.sib = Some(sib(if index.is_some() { m.scale } else { 1 }, idx, base.code()));
                    4
                } else {
                    base.code()
                };
                self.modrm = Some(modrm(mod_, reg, rm));
                match mod_ {
                    1 => self.disp.push(disp.map_or(0, |v| v.value) as u8),
                    2 => self.disp32(ctx, disp, disp_range, span)?,
                    _ => {}
                }
                Ok(())
            }
        }
    }

    fn disp32(
        &mut self,
        ctx: &EncodeCtx<'_>,
        disp: Option<Value>,
        range: (i128, i128),
        span: Span,
    ) -> Result<(), Fault> {
        let d = match disp {
            Some(v) => ctx.fit(v, range, span)?,
            None => 0,
        };
        self.disp.extend_from_slice(&(d as i32).to_le_bytes());
        Ok(())
    }

    fn mem16(
        &mut self,
        ctx: &mut EncodeCtx<'_>,
        reg: u8,
        m: &X86Mem,
        disp: Option<Value>,
        span: Span,
    ) -> Result<(), Fault> {
        const BX: u8 = 3;
        const BP: u8 = 5;
        const SI: u8 = 6;
        const DI: u8 = 7;
        if m.index.is_some() && m.scale != 1 {
            return Err(Fault::operand("16-bit addressing cannot scale an index", span));
        }
        let rm = match (m.base.map(|r| r.num), m.index.map(|r| r.num)) {
            (Some(BX), Some(SI)) | (Some(SI), Some(BX)) => Some(0),
            (Some(BX), Some(DI)) | (Some(DI), Some(BX)) => Some(1),
            (Some(BP), Some(SI)) | (Some(SI), Some(BP)) => Some(2),
            (Some(BP), Some(DI)) | (Some(DI), Some(BP)) => Some(3),
            (Some(SI), None) | (None, Some(SI)) => Some(4),
            (Some(DI), None) | (None, Some(DI)) => Some(5),
            (Some(BP), None) | (None, Some(BP)) => Some(6),
            (Some(BX), None) | (None, Some(BX)) => Some(7),
            (None, None) => None,
            _ => return Err(Fault::operand("invalid 16-bit address registers", span)),
        };
        let Some(rm) = rm else {
            self.modrm = Some(modrm(0, reg, 6));
            let d = match disp {
                Some(v) => ctx.fit(v, any_range(16), span)?,
                None => 0,
            };
            self.disp.extend_from_slice(&(d as u16).to_le_bytes());
            return Ok(());
        };
        let mod_ = match disp {
            None if rm != 6 => 0,
            None => 1,
            Some(v) if v.relocatable => 2,
            Some(v) if v.value == 0 && rm != 6 => 0,
            Some(v) if fits(v.value, signed_range(8)) => 1,
            Some(_) => 2,
        };
        self.modrm = Some(modrm(mod_, reg, rm));
        let d = match disp {
            Some(v) => ctx.fit(v, any_range(16), span)?,
            None => 0,
        };
        match mod_ {
            1 => self.disp.push(d as u8),
            2 => self.disp.extend_from_slice(&(d as u16).to_le_bytes()),
            _ => {}
        }
        Ok(())
    }

    /// Assemble prefixes, REX, opcode, ModR/M, SIB, displacement and immediate.
    fn finish(self, ctx: &EncodeCtx<'_>) -> Result<InstrBytes, Fault> {
        let needs_rex = self.rex != 0 || self.force_rex;
        if needs_rex && self.bits != 64 {
            return Err(Fault::new(
                ErrorCode::MissingFeature,
                format!("'{}' requires 64-bit mode", self.instr.mnemonic),
                self.instr.span,
            ));
        }
        if needs_rex && self.forbid_rex {
            return Err(Fault::operand(
                "high byte register cannot be encoded with a REX prefix",
                self.instr.span,
            ));
        }
        let mut out = InstrBytes::new();
        for p in &self.instr.prefixes {
            out.push(p.byte());
        }
        if let Some(seg) = self.seg {
            out.push(seg);
        }
        if self.opsize {
            out.push(0x66);
        }
        if self.addrsize {
            out.push(0x67);
        }
        if needs_rex {
            out.push(0x40 | self.rex);
        }
        out.extend_from_slice(&self.opcode);
        if let Some(m) = self.modrm {
            out.push(m);
        }
        if let Some(s) = self.sib {
            out.push(s);
        }
        let disp_at = out.len();
        out.extend_from_slice(&self.disp);
        out.extend_from_slice(&self.imm);

        if let Some((target, span)) = self.rip {
            let next = i128::from(ctx.addr) + out.len() as i128;
            let disp = ctx.fit(
                Value {
                    value: target - next,
                    relocatable: true,
                },
                signed_range(32),
                span,
            )?;
            out[disp_at..disp_at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        }
        Ok(out)
    }

    // ── Instruction classes ──────────────────────────────────────────

    fn fixed(&mut self, bytes: &[u8], flags: u8) -> Result<(), Fault> {
        if !self.instr.operands.is_empty() {
            return Err(self.invalid());
        }
        if flags & NO64 != 0 && self.bits == 64 {
            return Err(Fault::new(
                ErrorCode::InsnUnsupported,
                format!("'{}' is not available in 64-bit mode", self.instr.mnemonic),
                self.instr.span,
            ));
        }
        if flags & ONLY64 != 0 && self.bits != 64 {
            return Err(Fault::new(
                ErrorCode::InsnUnsupported,
                format!("'{}' requires 64-bit mode", self.instr.mnemonic),
                self.instr.span,
            ));
        }
        if flags & O16 != 0 {
            self.size(2);
        } else if flags & O32 != 0 {
            self.size(4);
        } else if flags & O64 != 0 {
            self.size(8);
        }
        self.op(bytes);
        Ok(())
    }

    fn alu(&mut self, ctx: &mut EncodeCtx<'_>, n: u8) -> Result<(), Fault> {
        let [dst, src] = self.ops::<2>()?;
        let base = n * 8;
        if let (Some(rm), Some(reg)) = (as_rm(dst), as_gp(src)) {
            let size = self.pair_size(reg, rm, self.span(0))?;
            self.note_reg(reg, self.span(1))?;
            self.size(size);
            self.op(&[base + u8::from(size != 1)]);
            return self.rm(ctx, reg.num, rm, self.span(0));
        }
        if let (Some(reg), Some(rm @ Rm::Mem(_))) = (as_gp(dst), as_rm(src)) {
            let size = self.pair_size(reg, rm, self.span(1))?;
            self.note_reg(reg, self.span(0))?;
            self.size(size);
            self.op(&[base + 2 + u8::from(size != 1)]);
            return self.rm(ctx, reg.num, rm, self.span(1));
        }
        if let (Some(rm), Some(expr)) = (as_rm(dst), as_imm(src)) {
            let size = self.rm_size(rm, self.span(0))?;
            self.size(size);
            let value = ctx.eval(expr, self.span(1))?;
            let imm = ctx.fit(value, imm_range(size), self.span(1))?;
            let acc = matches!(rm, Rm::Reg(r) if r.num == 0 && r.class != X86Class::Gp8High);
            if size == 1 {
                if acc {
                    self.op(&[base + 4]);
                } else {
                    self.op(&[0x80]);
                    self.rm(ctx, n, rm, self.span(0))?;
                }
                self.imm(imm, 1);
            } else if !value.relocatable && fits(imm, signed_range(8)) {
                self.op(&[0x83]);
                self.rm(ctx, n, rm, self.span(0))?;
                self.imm(imm, 1);
            } else {
                if acc {
                    self.op(&[base + 5]);
                } else {
                    self.op(&[0x81]);
                    self.rm(ctx, n, rm, self.span(0))?;
                }
                self.imm(imm, size.min(4));
            }
            return Ok(());
        }
        Err(self.invalid())
    }

    fn test(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [a, b] = self.ops::<2>()?;
        let pair = match (as_rm(a), as_gp(b), as_gp(a), as_rm(b)) {
            (Some(rm), Some(reg), _, _) => Some((reg, rm)),
            (_, _, Some(reg), Some(rm @ Rm::Mem(_))) => Some((reg, rm)),
            _ => None,
        };
        if let Some((reg, rm)) = pair {
            let size = self.pair_size(reg, rm, self.span(0))?;
            self.note_reg(reg, self.span(1))?;
            self.size(size);
            self.op(&[0x84 + u8::from(size != 1)]);
            return self.rm(ctx, reg.num, rm, self.span(0));
        }
        if let (Some(rm), Some(expr)) = (as_rm(a), as_imm(b)) {
            let size = self.rm_size(rm, self.span(0))?;
            self.size(size);
            let imm = ctx.eval_in(expr, imm_range(size), self.span(1))?;
            let acc = matches!(rm, Rm::Reg(r) if r.num == 0 && r.class != X86Class::Gp8High);
            match (acc, size) {
                (true, 1) => self.op(&[0xA8]),
                (true, _) => self.op(&[0xA9]),
                (false, 1) => {
                    self.op(&[0xF6]);
                    self.rm(ctx, 0, rm, self.span(0))?;
                }
                (false, _) => {
                    self.op(&[0xF7]);
                    self.rm(ctx, 0, rm, self.span(0))?;
                }
            }
            self.imm(imm, size.min(4));
            return Ok(());
        }
        Err(self.invalid())
    }

    fn mov(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [dst, src] = self.ops::<2>()?;

        // Segment registers
        if let Some(seg) = as_reg(src).filter(|r| r.class == X86Class::Seg) {
            let rm = as_rm(dst).ok_or_else(|| self.invalid())?;
            if let Rm::Reg(r) = rm {
                if r.size() == 1 {
                    return Err(self.invalid());
                }
                self.size(r.size());
            }
            self.op(&[0x8C]);
            return self.rm(ctx, seg.num, rm, self.span(0));
        }
        if let Some(seg) = as_reg(dst).filter(|r| r.class == X86Class::Seg) {
            if seg.num == 1 {
                return Err(Fault::operand("cannot load CS with mov", self.span(0)));
            }
            let rm = as_rm(src).ok_or_else(|| self.invalid())?;
            if matches!(rm, Rm::Reg(r) if r.size() == 1) {
                return Err(self.invalid());
            }
            self.op(&[0x8E]);
            return self.rm(ctx, seg.num, rm, self.span(1));
        }

        if let (Some(rm), Some(reg)) = (as_rm(dst), as_gp(src)) {
            let size = self.pair_size(reg, rm, self.span(0))?;
            self.note_reg(reg, self.span(1))?;
            self.size(size);
            self.op(&[0x88 + u8::from(size != 1)]);
            return self.rm(ctx, reg.num, rm, self.span(0));
        }
        if let (Some(reg), Some(rm @ Rm::Mem(_))) = (as_gp(dst), as_rm(src)) {
            let size = self.pair_size(reg, rm, self.span(1))?;
            self.note_reg(reg, self.span(0))?;
            self.size(size);
            self.op(&[0x8A + u8::from(size != 1)]);
            return self.rm(ctx, reg.num, rm, self.span(1));
        }
        if let (Some(reg), Some(expr)) = (as_gp(dst), as_imm(src)) {
            self.note_reg(reg, self.span(0))?;
            let size = reg.size();
            self.size(size);
            if reg.is_extended() {
                self.rex |= REX_B;
            }
            let value = ctx.eval(expr, self.span(1))?;
            match size {
                1 => {
                    let imm = ctx.fit(value, any_range(8), self.span(1))?;
                    self.op(&[0xB0 + reg.code()]);
                    self.imm(imm, 1);
                }
                8 if !value.relocatable && fits(value.value, signed_range(32)) => {
                    self.rex &= !REX_B;
                    self.op(&[0xC7]);
                    self.rm(ctx, 0, Rm::Reg(reg), self.span(0))?;
                    self.imm(value.value, 4);
                }
                8 => {
                    let imm = ctx.fit(value, any_range(64), self.span(1))?;
                    self.op(&[0xB8 + reg.code()]);
                    self.imm(imm, 8);
                }
                _ => {
                    let imm = ctx.fit(value, imm_range(size), self.span(1))?;
                    self.op(&[0xB8 + reg.code()]);
                    self.imm(imm, size);
                }
            }
            return Ok(());
        }
        if let (Some(rm @ Rm::Mem(_)), Some(expr)) = (as_rm(dst), as_imm(src)) {
            let size = self.rm_size(rm, self.span(0))?;
            self.size(size);
            let imm = ctx.eval_in(expr, imm_range(size), self.span(1))?;
            self.op(&[0xC6 + u8::from(size != 1)]);
            self.rm(ctx, 0, rm, self.span(0))?;
            self.imm(imm, size.min(4));
            return Ok(());
        }
        Err(self.invalid())
    }

    fn lea(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [dst, src] = self.ops::<2>()?;
        match (as_gp(dst), src) {
            (Some(reg), Operand::Mem(m)) if reg.size() > 1 => {
                self.note_reg(reg, self.span(0))?;
                self.size(reg.size());
                self.op(&[0x8D]);
                self.mem(ctx, reg.num, m, self.span(1))?;
                if reg.num & 8 != 0 {
                    self.rex |= REX_R;
                }
                Ok(())
            }
            _ => Err(self.invalid()),
        }
    }

    fn xchg(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [a, b] = self.ops::<2>()?;
        if let (Some(ra), Some(rb)) = (as_gp(a), as_gp(b)) {
            if ra.size() != rb.size() {
                return Err(Fault::operand("operand size mismatch", self.span(1)));
            }
            let size = ra.size();
            let both_eax = ra.num == 0 && rb.num == 0 && size == 4 && self.bits == 64;
            if size > 1 && (ra.num == 0 || rb.num == 0) && !both_eax {
                let other = if ra.num == 0 { rb } else { ra };
                self.note_reg(ra, self.span(0))?;
                self.note_reg(rb, self.span(1))?;
                self.size(size);
                if other.is_extended() {
                    self.rex |= REX_B;
                }
                self.op(&[0x90 + other.code()]);
                return Ok(());
            }
        }
        let pair = match (as_rm(a), as_gp(b), as_gp(a), as_rm(b)) {
            (Some(rm), Some(reg), _, _) => Some((reg, rm, 0)),
            (_, _, Some(reg), Some(rm @ Rm::Mem(_))) => Some((reg, rm, 1)),
            _ => None,
        };
        let Some((reg, rm, rm_idx)) = pair else {
            return Err(self.invalid());
        };
        let size = self.pair_size(reg, rm, self.span(rm_idx))?;
        self.note_reg(reg, self.span(1 - rm_idx))?;
        self.size(size);
        self.op(&[0x86 + u8::from(size != 1)]);
        self.rm(ctx, reg.num, rm, self.span(rm_idx))
    }

    /// Operand size of `push`/`pop`; 64-bit mode defaults to 64 bits.
    fn stack_size(&mut self, size: u8, span: Span) -> Result<(), Fault> {
        match (self.bits, size) {
            (64, 8) | (16, 2) | (32, 4) => Ok(()),
            (64 | 32, 2) | (16, 4) => {
                self.opsize = true;
                Ok(())
            }
            _ => Err(Fault::operand(
                format!("{}-bit stack operand is not valid in {}-bit mode", size * 8, self.bits),
                span,
            )),
        }
    }

    fn push(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        if let Some(seg) = as_reg(op).filter(|r| r.class == X86Class::Seg) {
            return self.push_pop_seg(seg, true);
        }
        if let Some(expr) = as_imm(op) {
            let value = ctx.eval(expr, self.span(0))?;
            if let Some(hint) = self.hint {
                self.stack_size(hint, self.span(0))?;
            }
            let wide = if self.bits == 16 || self.opsize { 2 } else { 4 };
            let imm = ctx.fit(value, imm_range(wide), self.span(0))?;
            if !value.relocatable && fits(imm, signed_range(8)) {
                self.op(&[0x6A]);
                self.imm(imm, 1);
            } else {
                self.op(&[0x68]);
                self.imm(imm, wide);
            }
            return Ok(());
        }
        self.push_pop_rm(ctx, op, 0x50, 0xFF, 6)
    }

    fn pop(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        if let Some(seg) = as_reg(op).filter(|r| r.class == X86Class::Seg) {
            return self.push_pop_seg(seg, false);
        }
        self.push_pop_rm(ctx, op, 0x58, 0x8F, 0)
    }

    fn push_pop_rm(
        &mut self,
        ctx: &mut EncodeCtx<'_>,
        op: &Operand,
        short: u8,
        opcode: u8,
        digit: u8,
    ) -> Result<(), Fault> {
        match as_rm(op) {
            Some(Rm::Reg(reg)) => {
                self.note_reg(reg, self.span(0))?;
                self.stack_size(reg.size(), self.span(0))?;
                if reg.is_extended() {
                    self.rex |= REX_B;
                }
                self.op(&[short + reg.code()]);
                Ok(())
            }
            Some(rm @ Rm::Mem(m)) => {
                let default = self.bits / 8;
                self.stack_size(m.size.or(self.hint).unwrap_or(default), self.span(0))?;
                self.op(&[opcode]);
                self.rm(ctx, digit, rm, self.span(0))
            }
            None => Err(self.invalid()),
        }
    }

    fn push_pop_seg(&mut self, seg: X86Reg, push: bool) -> Result<(), Fault> {
        let bytes: &[u8] = match (seg.num, push) {
            (4, true) => &[0x0F, 0xA0],
            (4, false) => &[0x0F, 0xA1],
            (5, true) => &[0x0F, 0xA8],
            (5, false) => &[0x0F, 0xA9],
            (1, false) => return Err(Fault::operand("cannot pop into CS", self.span(0))),
            _ if self.bits == 64 => {
                return Err(Fault::new(
                    ErrorCode::InsnUnsupported,
                    format!("'{} {}' is not available in 64-bit mode", self.instr.mnemonic, seg),
                    self.instr.span,
                ));
            }
            (n, true) => &[[0x06, 0x0E, 0x16, 0x1E][n as usize % 4]],
            (n, false) => &[[0x07, 0x0F, 0x17, 0x1F][n as usize % 4]],
        };
        if let Some(hint) = self.hint {
            self.stack_size(hint, self.span(0))?;
        }
        self.op(bytes);
        Ok(())
    }

    fn inc_dec(&mut self, ctx: &mut EncodeCtx<'_>, digit: u8) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let rm = as_rm(op).ok_or_else(|| self.invalid())?;
        let size = self.rm_size(rm, self.span(0))?;
        self.size(size);
        match rm {
            Rm::Reg(reg) if size > 1 && self.bits != 64 => {
                self.note_reg(reg, self.span(0))?;
                self.op(&[0x40 + digit * 8 + reg.code()]);
                Ok(())
            }
            _ => {
                self.op(&[if size == 1 { 0xFE } else { 0xFF }]);
                self.rm(ctx, digit, rm, self.span(0))
            }
        }
    }

    fn unary(&mut self, ctx: &mut EncodeCtx<'_>, digit: u8) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let rm = as_rm(op).ok_or_else(|| self.invalid())?;
        let size = self.rm_size(rm, self.span(0))?;
        self.size(size);
        self.op(&[0xF6 + u8::from(size != 1)]);
        self.rm(ctx, digit, rm, self.span(0))
    }

    fn imul(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let instr = self.instr;
        match instr.operands.as_slice() {
            [_] => self.unary(ctx, 5),
            [dst, src] => {
                let reg = as_gp(dst).filter(|r| r.size() > 1).ok_or_else(|| self.invalid())?;
                if let Some(expr) = as_imm(src) {
                    return self.imul_imm(ctx, reg, Rm::Reg(reg), expr, 1);
                }
                let rm = as_rm(src).ok_or_else(|| self.invalid())?;
                let size = self.pair_size(reg, rm, self.span(1))?;
                self.note_reg(reg, self.span(0))?;
                self.size(size);
                self.op(&[0x0F, 0xAF]);
                self.rm(ctx, reg.num, rm, self.span(1))
            }
            [dst, src, imm] => {
                let reg = as_gp(dst).filter(|r| r.size() > 1).ok_or_else(|| self.invalid())?;
                let rm = as_rm(src).ok_or_else(|| self.invalid())?;
                let expr = as_imm(imm).ok_or_else(|| self.invalid())?;
                self.pair_size(reg, rm, self.span(1))?;
                self.imul_imm(ctx, reg, rm, expr, 2)
            }
            _ => Err(self.invalid()),
        }
    }

    fn imul_imm(
        &mut self,
        ctx: &mut EncodeCtx<'_>,
        reg: X86Reg,
        rm: Rm<'_>,
        expr: &Expr,
        imm_idx: usize,
    ) -> Result<(), Fault> {
        self.note_reg(reg, self.span(0))?;
        let size = reg.size();
        self.size(size);
        let value = ctx.eval(expr, self.span(imm_idx))?;
        let imm = ctx.fit(value, imm_range(size), self.span(imm_idx))?;
        let short = !value.relocatable && fits(imm, signed_range(8));
        self.op(&[if short { 0x6B } else { 0x69 }]);
        self.rm(ctx, reg.num, rm, self.span(imm_idx - 1))?;
        self.imm(imm, if short { 1 } else { size.min(4) });
        Ok(())
    }

    fn shift(&mut self, ctx: &mut EncodeCtx<'_>, digit: u8) -> Result<(), Fault> {
        let instr = self.instr;
        let (target, count) = match instr.operands.as_slice() {
            [t] => (t, None),
            [t, c] => (t, Some(c)),
            _ => return Err(self.invalid()),
        };
        let rm = as_rm(target).ok_or_else(|| self.invalid())?;
        let size = self.rm_size(rm, self.span(0))?;
        self.size(size);
        let wide = u8::from(size != 1);
        match count {
            None => self.op(&[0xD0 + wide]),
            Some(Operand::Reg(Register::X86(r))) if r.class == X86Class::Gp8 && r.num == 1 => {
                self.op(&[0xD2 + wide]);
            }
            Some(Operand::Imm(expr)) => {
                let value = ctx.eval(expr, self.span(1))?;
                let n = ctx.fit(value, any_range(8), self.span(1))?;
                if n == 1 && !value.relocatable {
                    self.op(&[0xD0 + wide]);
                } else {
                    self.op(&[0xC0 + wide]);
                    self.imm(n, 1);
                }
            }
            Some(_) => return Err(self.invalid()),
        }
        self.rm(ctx, digit, rm, self.span(0))
    }

    fn extend(&mut self, ctx: &mut EncodeCtx<'_>, opcode: u8) -> Result<(), Fault> {
        let [dst, src] = self.ops::<2>()?;
        let reg = as_gp(dst).ok_or_else(|| self.invalid())?;
        let rm = as_rm(src).ok_or_else(|| self.invalid())?;
        let src_size = self.rm_size(rm, self.span(1))?;
        if src_size > 2 || src_size >= reg.size() {
            return Err(Fault::operand("invalid extension source size", self.span(1)));
        }
        self.note_reg(reg, self.span(0))?;
        self.size(reg.size());
        self.op(&[0x0F, opcode + u8::from(src_size == 2)]);
        self.rm(ctx, reg.num, rm, self.span(1))
    }

    fn movsxd(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [dst, src] = self.ops::<2>()?;
        let reg = as_gp(dst).filter(|r| r.size() == 8).ok_or_else(|| self.invalid())?;
        let rm = as_rm(src).ok_or_else(|| self.invalid())?;
        if self.rm_size(rm, self.span(1)).unwrap_or(4) != 4 {
            return Err(Fault::operand("movsxd source must be 32-bit", self.span(1)));
        }
        self.note_reg(reg, self.span(0))?;
        self.size(8);
        self.op(&[0x63]);
        self.rm(ctx, reg.num, rm, self.span(1))
    }

    fn bswap(&mut self) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let reg = as_gp(op).filter(|r| r.size() >= 4).ok_or_else(|| self.invalid())?;
        self.note_reg(reg, self.span(0))?;
        self.size(reg.size());
        if reg.is_extended() {
            self.rex |= REX_B;
        }
        self.op(&[0x0F, 0xC8 + reg.code()]);
        Ok(())
    }

    fn setcc(&mut self, ctx: &mut EncodeCtx<'_>, cc: u8) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let rm = as_rm(op).ok_or_else(|| self.invalid())?;
        if self.rm_size(rm, self.span(0)).unwrap_or(1) != 1 {
            return Err(Fault::operand("setcc requires an 8-bit operand", self.span(0)));
        }
        self.op(&[0x0F, 0x90 + cc]);
        self.rm(ctx, 0, rm, self.span(0))
    }

    fn cmov(&mut self, ctx: &mut EncodeCtx<'_>, cc: u8) -> Result<(), Fault> {
        let [dst, src] = self.ops::<2>()?;
        let reg = as_gp(dst).filter(|r| r.size() > 1).ok_or_else(|| self.invalid())?;
        let rm = as_rm(src).ok_or_else(|| self.invalid())?;
        let size = self.pair_size(reg, rm, self.span(1))?;
        self.note_reg(reg, self.span(0))?;
        self.size(size);
        self.op(&[0x0F, 0x40 + cc]);
        self.rm(ctx, reg.num, rm, self.span(1))
    }

    // ── Branches ─────────────────────────────────────────────────────

    /// Displacement from the end of an instruction of `len` bytes to `target`.
    fn rel(&self, ctx: &EncodeCtx<'_>, target: i128, len: usize) -> i128 {
        let start = i128::from(ctx.addr) + self.instr.prefixes.len() as i128;
        target - (start + len as i128)
    }

    /// Relative branch with an optional rel8 form and a rel16/32 form.
    fn relative(
        &mut self,
        ctx: &mut EncodeCtx<'_>,
        short: Option<u8>,
        long: &[u8],
        expr: &Expr,
    ) -> Result<(), Fault> {
        let span = self.span(0);
        let target = ctx.eval(expr, span)?;
        if let Some(op) = short {
            if !ctx.long {
                let disp = self.rel(ctx, target.value, 2);
                if fits(disp, signed_range(8)) {
                    self.op(&[op]);
                    self.imm(disp, 1);
                    return Ok(());
                }
                ctx.wants_long = true;
            }
        }
        let width = if self.bits == 16 { 2 } else { 4 };
        let disp = self.rel(ctx, target.value, long.len() + width as usize);
        let disp = ctx.fit(
            Value {
                value: disp,
                relocatable: true,
            },
            signed_range(u32::from(width) * 8),
            span,
        )?;
        self.op(long);
        self.imm(disp, width);
        Ok(())
    }

    fn jump(&mut self, ctx: &mut EncodeCtx<'_>, digit: u8) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        if let Some(expr) = as_imm(op) {
            return if digit == 4 {
                self.relative(ctx, Some(0xEB), &[0xE9], expr)
            } else {
                self.relative(ctx, None, &[0xE8], expr)
            };
        }
        let rm = as_rm(op).ok_or_else(|| self.invalid())?;
        let size = match rm {
            Rm::Reg(r) => r.size(),
            Rm::Mem(m) => m.size.or(self.hint).unwrap_or(self.bits / 8),
        };
        match (self.bits, size) {
            (64, 8) | (32, 4) | (16, 2) => {}
            (32, 2) | (16, 4) => self.opsize = true,
            _ => {
                return Err(Fault::operand(
                    format!("{}-bit branch target is not valid in {}-bit mode", size * 8, self.bits),
                    self.span(0),
                ))
            }
        }
        self.op(&[0xFF]);
        self.rm(ctx, digit, rm, self.span(0))
    }

    fn jcc(&mut self, ctx: &mut EncodeCtx<'_>, cc: u8) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let expr = as_imm(op).ok_or_else(|| self.invalid())?;
        self.relative(ctx, Some(0x70 + cc), &[0x0F, 0x80 + cc], expr)
    }

    /// `loop*` and `j*cxz`: rel8 only. `counter` is the counter register width.
    fn short_branch(&mut self, ctx: &mut EncodeCtx<'_>, opcode: u8, counter: Option<u8>) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let expr = as_imm(op).ok_or_else(|| self.invalid())?;
        if let Some(width) = counter {
            match (width, self.bits) {
                (64, 64) | (32, 32) | (16, 16) => {}
                (32, _) | (16, 32) => self.addrsize = true,
                _ => {
                    return Err(Fault::new(
                        ErrorCode::InsnUnsupported,
                        format!("'{}' is not available in {}-bit mode", self.instr.mnemonic, self.bits),
                        self.instr.span,
                    ))
                }
            }
        }
        let len = 2 + usize::from(self.addrsize);
        let target = ctx.eval(expr, self.span(0))?;
        let disp = ctx.fit(
            Value {
                value: self.rel(ctx, target.value, len),
                relocatable: true,
            },
            signed_range(8),
            self.span(0),
        )?;
        self.op(&[opcode]);
        self.imm(disp, 1);
        Ok(())
    }

    fn int(&mut self, ctx: &mut EncodeCtx<'_>) -> Result<(), Fault> {
        let [op] = self.ops::<1>()?;
        let expr = as_imm(op).ok_or_else(|| self.invalid())?;
        let n = ctx.eval_in(expr, (0, 255), self.span(0))?;
        self.op(&[0xCD]);
        self.imm(n, 1);
        Ok(())
    }

    fn ret(&mut self, ctx: &mut EncodeCtx<'_>, opcode: u8) -> Result<(), Fault> {
        let instr = self.instr;
        match instr.operands.as_slice() {
            [] => {
                self.op(&[opcode]);
                Ok(())
            }
            [Operand::Imm(expr)] => {
                let n = ctx.eval_in(expr, (0, 0xFFFF), self.span(0))?;
                self.op(&[opcode - 1]);
                self.imm(n, 2);
                Ok(())
            }
            _ => Err(self.invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::option::Syntax;
    use crate::parser::{parse_statement, ParseContext};
    use crate::symbols::SymbolTable;
    use alloc::vec::Vec;

    fn parse(src: &str, dialect: Syntax) -> Instruction {
        let mut pctx = ParseContext {
            arch: Arch::X86,
            dialect,
            radix16: false,
        };
        match parse_statement(src, &mut pctx).body {
            Some(Ok(Body::Instruction(i))) => i,
            other => panic!("{}: {:?}", src, other),
        }
    }

    fn try_asm(src: &str, bits: u8, dialect: Syntax) -> Result<Vec<u8>, Fault> {
        let instr = parse(src, dialect);
        let mut ctx = EncodeCtx::new(SymbolTable::new(None, 16), bits, false, false);
        ctx.strict = true;
        encode(&instr, &mut ctx).map(|b| b.to_vec())
    }

    fn asm(src: &str, bits: u8) -> Vec<u8> {
        try_asm(src, bits, Syntax::Intel).unwrap_or_else(|e| panic!("{}: {:?}", src, e))
    }

    fn att(src: &str, bits: u8) -> Vec<u8> {
        try_asm(src, bits, Syntax::Att).unwrap_or_else(|e| panic!("{}: {:?}", src, e))
    }

    fn err(src: &str, bits: u8) -> ErrorCode {
        try_asm(src, bits, Syntax::Intel).unwrap_err().code
    }

    #[test]
    fn fixed_table_is_sorted() {
        for w in FIXED_TABLE.windows(2) {
            assert!(
                w[0].0 < w[1].0,
                "FIXED_TABLE not sorted: {:?} >= {:?}",
                w[0].0,
                w[1].0
            );
        }
    }

    #[test]
    fn fixed_encodings() {
        assert_eq!(asm("nop", 32), [0x90]);
        assert_eq!(asm("ret", 64), [0xC3]);
        assert_eq!(asm("cdqe", 64), [0x48, 0x98]);
        assert_eq!(asm("cwde", 16), [0x66, 0x98]);
        assert_eq!(asm("movsw", 32), [0x66, 0xA5]);
        assert_eq!(asm("syscall", 64), [0x0F, 0x05]);
        assert_eq!(err("pusha", 64), ErrorCode::InsnUnsupported);
        assert_eq!(err("cdqe", 32), ErrorCode::MissingFeature);
        assert_eq!(err("nop eax", 32), ErrorCode::InvalidOperand);
    }

    #[test]
    fn inc_dec_forms() {
        assert_eq!(asm("inc eax", 64), [0xFF, 0xC0]);
        assert_eq!(asm("dec eax", 64), [0xFF, 0xC8]);
        assert_eq!(asm("inc eax", 32), [0x40]);
        assert_eq!(asm("dec ecx", 32), [0x49]);
        assert_eq!(asm("inc ax", 16), [0x40]);
        assert_eq!(asm("inc byte ptr [eax]", 32), [0xFE, 0x00]);
        assert_eq!(asm("inc r8", 64), [0x49, 0xFF, 0xC0]);
    }

    #[test]
    fn alu_forms() {
        assert_eq!(asm("add eax, ebx", 32), [0x01, 0xD8]);
        assert_eq!(asm("add eax, 1", 32), [0x83, 0xC0, 0x01]);
        assert_eq!(asm("add eax, 0x1000", 32), [0x05, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(asm("add ecx, 0x1000", 32), [0x81, 0xC1, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(asm("add al, 5", 32), [0x04, 0x05]);
        assert_eq!(asm("xor rax, rax", 64), [0x48, 0x31, 0xC0]);
        assert_eq!(asm("sub rsp, 0x28", 64), [0x48, 0x83, 0xEC, 0x28]);
        assert_eq!(asm("cmp byte ptr [ebx], 0x41", 32), [0x80, 0x3B, 0x41]);
        assert_eq!(asm("add eax, [ebx + 4]", 32), [0x03, 0x43, 0x04]);
        assert_eq!(err("add eax, bx", 32), ErrorCode::InvalidOperand);
        assert_eq!(err("add [eax], 1", 32), ErrorCode::InvalidOperand);
    }

    #[test]
    fn mov_forms() {
        assert_eq!(asm("mov eax, ebx", 32), [0x89, 0xD8]);
        assert_eq!(asm("mov eax, 0x66", 32), [0xB8, 0x66, 0x00, 0x00, 0x00]);
        assert_eq!(asm("mov al, 1", 32), [0xB0, 0x01]);
        assert_eq!(asm("mov rax, 1", 64), [0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(
            asm("mov rax, 0x1122334455667788", 64),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(asm("mov r9d, 2", 64), [0x41, 0xB9, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(asm("mov dword ptr [esp + 8], 1", 32), [0xC7, 0x44, 0x24, 0x08, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(asm("mov eax, [ebp]", 32), [0x8B, 0x45, 0x00]);
        assert_eq!(asm("mov ds, ax", 32), [0x8E, 0xD8]);
        assert_eq!(asm("mov ax, ds", 32), [0x66, 0x8C, 0xD8]);
        assert_eq!(asm("mov sil, 1", 64), [0x40, 0xB6, 0x01]);
        assert_eq!(err("mov ah, sil", 64), ErrorCode::InvalidOperand);
        assert_eq!(err("mov rax, 1", 32), ErrorCode::MissingFeature);
    }

    #[test]
    fn addressing_modes() {
        assert_eq!(asm("mov eax, [ebx + esi*4 + 0x10]", 32), [0x8B, 0x44, 0xB3, 0x10]);
        assert_eq!(asm("lea eax, [ecx*8]", 32), [0x8D, 0x04, 0xCD, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(asm("mov eax, [0x1000]", 32), [0x8B, 0x05, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(asm("mov eax, [0x10]", 64), [0x8B, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(asm("mov rax, [r12]", 64), [0x49, 0x8B, 0x04, 0x24]);
        assert_eq!(asm("mov rax, [r13]", 64), [0x49, 0x8B, 0x45, 0x00]);
        assert_eq!(asm("mov eax, [eax]", 64), [0x67, 0x8B, 0x00]);
        assert_eq!(asm("mov ax, [bx + si]", 16), [0x8B, 0x00]);
        assert_eq!(asm("mov ax, [bp + 2]", 16), [0x8B, 0x46, 0x02]);
        assert_eq!(asm("mov eax, fs:[0x30]", 32), [0x64, 0x8B, 0x05, 0x30, 0x00, 0x00, 0x00]);
        assert_eq!(asm("mov rax, [rip + 0x10]", 64), [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(err("mov eax, [esp*2]", 32), ErrorCode::InvalidOperand);
        assert_eq!(err("mov ax, [si + di]", 16), ErrorCode::InvalidOperand);
    }

    #[test]
    fn stack_ops() {
        assert_eq!(asm("push rbp", 64), [0x55]);
        assert_eq!(asm("push r12", 64), [0x41, 0x54]);
        assert_eq!(asm("pop ebp", 32), [0x5D]);
        assert_eq!(asm("push 1", 32), [0x6A, 0x01]);
        assert_eq!(asm("push 0x1000", 32), [0x68, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(asm("push dword ptr [eax]", 32), [0xFF, 0x30]);
        assert_eq!(asm("push fs", 32), [0x0F, 0xA0]);
        assert_eq!(asm("push es", 32), [0x06]);
        assert_eq!(err("push eax", 64), ErrorCode::InvalidOperand);
        assert_eq!(err("push es", 64), ErrorCode::InsnUnsupported);
    }

    #[test]
    fn unary_shift_and_multiply() {
        assert_eq!(asm("neg eax", 32), [0xF7, 0xD8]);
        assert_eq!(asm("not byte ptr [ecx]", 32), [0xF6, 0x11]);
        assert_eq!(asm("shl eax, 1", 32), [0xD1, 0xE0]);
        assert_eq!(asm("shr eax, 4", 32), [0xC1, 0xE8, 0x04]);
        assert_eq!(asm("sar eax, cl", 32), [0xD3, 0xF8]);
        assert_eq!(asm("imul eax, ecx", 32), [0x0F, 0xAF, 0xC1]);
        assert_eq!(asm("imul eax, ecx, 10", 32), [0x6B, 0xC1, 0x0A]);
        assert_eq!(asm("imul eax, 1000", 32), [0x69, 0xC0, 0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(asm("movzx eax, byte ptr [ebx]", 32), [0x0F, 0xB6, 0x03]);
        assert_eq!(asm("movsx eax, cx", 32), [0x0F, 0xBF, 0xC1]);
        assert_eq!(asm("movsxd rax, ecx", 64), [0x48, 0x63, 0xC1]);
        assert_eq!(asm("bswap eax", 32), [0x0F, 0xC8]);
        assert_eq!(asm("sete al", 32), [0x0F, 0x94, 0xC0]);
        assert_eq!(asm("cmovne eax, ebx", 32), [0x0F, 0x45, 0xC3]);
        assert_eq!(asm("xchg eax, ebx", 32), [0x93]);
        assert_eq!(asm("xchg eax, eax", 64), [0x87, 0xC0]);
        assert_eq!(asm("test eax, eax", 32), [0x85, 0xC0]);
        assert_eq!(asm("test al, 1", 32), [0xA8, 0x01]);
        assert_eq!(asm("int 0x80", 32), [0xCD, 0x80]);
        assert_eq!(asm("ret 8", 32), [0xC2, 0x08, 0x00]);
    }

    #[test]
    fn branches_to_constants() {
        assert_eq!(asm("jmp 0x10", 32), [0xEB, 0x0E]);
        assert_eq!(asm("jmp 0x1000", 32), [0xE9, 0xFB, 0x0F, 0x00, 0x00]);
        assert_eq!(asm("je 0", 32), [0x74, 0xFE]);
        assert_eq!(asm("call 0x100", 32), [0xE8, 0xFB, 0x00, 0x00, 0x00]);
        assert_eq!(asm("jmp eax", 32), [0xFF, 0xE0]);
        assert_eq!(asm("call rax", 64), [0xFF, 0xD0]);
        assert_eq!(asm("loop 0", 32), [0xE2, 0xFE]);
        assert_eq!(asm("jecxz 0", 64), [0x67, 0xE3, 0xFD]);
        assert_eq!(err("loop 0x1000", 32), ErrorCode::FixupInvalid);
    }

    #[test]
    fn prefixes() {
        assert_eq!(asm("lock inc dword ptr [eax]", 32), [0xF0, 0xFF, 0x00]);
        assert_eq!(asm("rep stosb", 32), [0xF3, 0xAA]);
    }

    #[test]
    fn att_syntax() {
        assert_eq!(att("movl $1, %eax", 32), [0xB8, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(att("incl %ecx", 32), [0x41]);
        assert_eq!(att("addl $1, (%eax)", 32), [0x83, 0x00, 0x01]);
        assert_eq!(att("movzbl (%ebx), %eax", 32), [0x0F, 0xB6, 0x03]);
        assert_eq!(att("cltq", 64), [0x48, 0x98]);
        assert_eq!(att("pushq %rbp", 64), [0x55]);
        assert_eq!(att("movq %rsp, %rbp", 64), [0x48, 0x89, 0xE5]);
        assert_eq!(att("jmp *%eax", 32), [0xFF, 0xE0]);
    }

    #[test]
    fn unknown_mnemonic() {
        assert_eq!(err("unk", 32), ErrorCode::MnemonicFail);
        assert_eq!(err("jxx 0", 32), ErrorCode::MnemonicFail);
    }
}
