//! Intermediate representation types for the assembly pipeline.
//!
//! These types represent the structured output of the parser and serve
//! as input to the layout pass and the per-architecture encoders.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{Fault, Span};

// ── Registers ────────────────────────────────────────────────────────────

/// Register file of an x86 register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum X86Class {
    /// `al`..`r15b`, including `spl`/`bpl`/`sil`/`dil`.
    Gp8,
    /// `ah`, `ch`, `dh`, `bh` (numbers 4..=7).
    Gp8High,
    /// `ax`..`r15w`
    Gp16,
    /// `eax`..`r15d`
    Gp32,
    /// `rax`..`r15`
    Gp64,
    /// `es`, `cs`, `ss`, `ds`, `fs`, `gs`
    Seg,
    /// `eip` / `rip` (addressing base only)
    Ip,
}

/// x86 register: a register file plus a 0..=15 register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct X86Reg {
    pub class: X86Class,
    pub num: u8,
}

const X86_GP64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const X86_GP32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const X86_GP16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const X86_GP8: [&str; 8] = ["al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil"];
const X86_GP8_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];
const X86_SEG: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

impl X86Reg {
    /// Parse a lowercase register name.
    pub fn parse(name: &str) -> Option<Self> {
        let find = |table: &[&str]| table.iter().position(|r| *r == name).map(|i| i as u8);
        let reg = |class, num| Some(X86Reg { class, num });
        if let Some(n) = find(&X86_GP64) {
            return reg(X86Class::Gp64, n);
        }
        if let Some(n) = find(&X86_GP32) {
            return reg(X86Class::Gp32, n);
        }
        if let Some(n) = find(&X86_GP16) {
            return reg(X86Class::Gp16, n);
        }
        if let Some(n) = find(&X86_GP8) {
            return reg(X86Class::Gp8, n);
        }
        if let Some(n) = find(&X86_GP8_HIGH) {
            return reg(X86Class::Gp8High, n + 4);
        }
        if let Some(n) = find(&X86_SEG) {
            return reg(X86Class::Seg, n);
        }
        match name {
            "rip" => return reg(X86Class::Ip, 8),
            "eip" => return reg(X86Class::Ip, 4),
            _ => {}
        }
        // r8d / r8w / r8b / r8l
        let rest = name.strip_prefix('r')?;
        let digits = rest.trim_end_matches(|c: char| c.is_ascii_alphabetic());
        let n: u8 = digits.parse().ok()?;
        if !(8..=15).contains(&n) {
            return None;
        }
        match &rest[digits.len()..] {
            "d" => reg(X86Class::Gp32, n),
            "w" => reg(X86Class::Gp16, n),
            "b" | "l" => reg(X86Class::Gp8, n),
            _ => None,
        }
    }

    /// Operand size in bytes.
    pub fn size(self) -> u8 {
        match self.class {
            X86Class::Gp8 | X86Class::Gp8High => 1,
            X86Class::Gp16 | X86Class::Seg => 2,
            X86Class::Gp32 => 4,
            X86Class::Gp64 => 8,
            X86Class::Ip => {
                if self.num == 8 {
                    8
                } else {
                    4
                }
            }
        }
    }

    /// Low three bits used in ModR/M, SIB and opcode fields.
    pub fn code(self) -> u8 {
        self.num & 7
    }

    /// Register number needs REX.B/R/X.
    pub fn is_extended(self) -> bool {
        self.num >= 8 && self.class != X86Class::Ip
    }

    /// `spl`/`bpl`/`sil`/`dil` require an empty REX prefix.
    pub fn needs_rex_for_byte(self) -> bool {
        self.class == X86Class::Gp8 && (4..8).contains(&self.num)
    }

    pub fn is_gp(self) -> bool {
        !matches!(self.class, X86Class::Seg | X86Class::Ip)
    }
}

impl fmt::Display for X86Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.num as usize;
        match self.class {
            X86Class::Gp64 => f.write_str(X86_GP64[n]),
            X86Class::Gp32 if n < 8 => f.write_str(X86_GP32[n]),
            X86Class::Gp32 => write!(f, "r{}d", n),
            X86Class::Gp16 if n < 8 => f.write_str(X86_GP16[n]),
            X86Class::Gp16 => write!(f, "r{}w", n),
            X86Class::Gp8 if n < 8 => f.write_str(X86_GP8[n]),
            X86Class::Gp8 => write!(f, "r{}b", n),
            X86Class::Gp8High => f.write_str(X86_GP8_HIGH[n - 4]),
            X86Class::Seg => f.write_str(X86_SEG[n]),
            X86Class::Ip if n == 8 => f.write_str("rip"),
            X86Class::Ip => f.write_str("eip"),
        }
    }
}

/// AArch64 general-purpose register.
///
/// Number 31 is `sp`/`wsp` when `sp` is set and `xzr`/`wzr` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct A64Reg {
    pub num: u8,
    /// 64-bit `x` view (otherwise 32-bit `w`).
    pub wide: bool,
    pub sp: bool,
}

impl A64Reg {
    pub fn parse(name: &str) -> Option<Self> {
        let (num, wide, sp) = match name {
            "sp" => (31, true, true),
            "wsp" => (31, false, true),
            "xzr" => (31, true, false),
            "wzr" => (31, false, false),
            "lr" => (30, true, false),
            "fp" => (29, true, false),
            _ => {
                let wide = match name.as_bytes().first() {
                    Some(b'x') => true,
                    Some(b'w') => false,
                    _ => return None,
                };
                let digits = &name[1..];
                if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
                    return None;
                }
                let n: u8 = digits.parse().ok()?;
                if n > 30 {
                    return None;
                }
                (n, wide, false)
            }
        };
        Some(A64Reg { num, wide, sp })
    }
}

/// Parse an A32/T32 core register name (`r0`..`r15` and aliases).
pub(crate) fn parse_arm_reg(name: &str) -> Option<u8> {
    match name {
        "sb" => return Some(9),
        "sl" => return Some(10),
        "fp" => return Some(11),
        "ip" => return Some(12),
        "sp" => return Some(13),
        "lr" => return Some(14),
        "pc" => return Some(15),
        _ => {}
    }
    let digits = name.strip_prefix('r')?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    let n: u8 = digits.parse().ok()?;
    (n <= 15).then_some(n)
}

/// A register of any supported architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Register {
    X86(X86Reg),
    Arm(u8),
    A64(A64Reg),
}

// ── Expressions ──────────────────────────────────────────────────────────

/// Binary operator in a constant expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

/// Constant expression over numbers, symbols and the current address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expr {
    Num(i128),
    /// Label, constant or external symbol (case preserved).
    Sym(String, Span),
    /// Address of the current statement (`$` / `.`).
    Here,
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Bin(op, Box::new(lhs), Box::new(rhs))
    }

    /// Literal value if the expression contains no symbols.
    pub fn as_literal(&self) -> Option<i128> {
        match self {
            Expr::Num(n) => Some(*n),
            Expr::Neg(e) => e.as_literal().map(i128::wrapping_neg),
            Expr::Not(e) => e.as_literal().map(|v| !v),
            Expr::Bin(op, a, b) => {
                let (a, b) = (a.as_literal()?, b.as_literal()?);
                apply(*op, a, b).ok()
            }
            Expr::Sym(..) | Expr::Here => None,
        }
    }

    /// Symbol name if the expression is a bare symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Expr::Sym(name, _) => Some(name),
            _ => None,
        }
    }
}

/// Apply a binary operator with wrapping arithmetic.
pub(crate) fn apply(op: BinOp, a: i128, b: i128) -> Result<i128, &'static str> {
    Ok(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err("division by zero");
            }
            a.wrapping_div(b)
        }
        BinOp::Rem => {
            if b == 0 {
                return Err("division by zero");
            }
            a.wrapping_rem(b)
        }
        BinOp::Shl => a.wrapping_shl((b & 127) as u32),
        BinOp::Shr => a.wrapping_shr((b & 127) as u32),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
    })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(n) => write!(f, "{}", n),
            Expr::Sym(s, _) => f.write_str(s),
            Expr::Here => f.write_str("."),
            Expr::Neg(e) => write!(f, "-({})", e),
            Expr::Not(e) => write!(f, "~({})", e),
            Expr::Bin(op, a, b) => {
                let s = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Rem => "%",
                    BinOp::Shl => "<<",
                    BinOp::Shr => ">>",
                    BinOp::And => "&",
                    BinOp::Or => "|",
                    BinOp::Xor => "^",
                };
                write!(f, "({} {} {})", a, s, b)
            }
        }
    }
}

// ── Operands ─────────────────────────────────────────────────────────────

/// x86 memory operand `seg:[base + index*scale + disp]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct X86Mem {
    /// Access size in bytes from a `ptr` keyword, if given.
    pub size: Option<u8>,
    pub seg: Option<X86Reg>,
    pub base: Option<X86Reg>,
    pub index: Option<X86Reg>,
    pub scale: u8,
    pub disp: Option<Expr>,
}

/// Barrel-shifter / extend operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
    Rrx,
    Msl,
    Uxtb,
    Uxth,
    Uxtw,
    Uxtx,
    Sxtb,
    Sxth,
    Sxtw,
    Sxtx,
}

impl ShiftKind {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "lsl" | "asl" => ShiftKind::Lsl,
            "lsr" => ShiftKind::Lsr,
            "asr" => ShiftKind::Asr,
            "ror" => ShiftKind::Ror,
            "rrx" => ShiftKind::Rrx,
            "msl" => ShiftKind::Msl,
            "uxtb" => ShiftKind::Uxtb,
            "uxth" => ShiftKind::Uxth,
            "uxtw" => ShiftKind::Uxtw,
            "uxtx" => ShiftKind::Uxtx,
            "sxtb" => ShiftKind::Sxtb,
            "sxth" => ShiftKind::Sxth,
            "sxtw" => ShiftKind::Sxtw,
            "sxtx" => ShiftKind::Sxtx,
            _ => return None,
        })
    }

    pub fn is_extend(self) -> bool {
        !matches!(
            self,
            ShiftKind::Lsl | ShiftKind::Lsr | ShiftKind::Asr | ShiftKind::Ror | ShiftKind::Rrx
                | ShiftKind::Msl
        )
    }
}

/// Shift amount: immediate, register (A32 only) or omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShiftAmount {
    None,
    Imm(Expr),
    Reg(Register),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Shift {
    pub kind: ShiftKind,
    pub amount: ShiftAmount,
}

/// Offset part of an ARM `[base, offset]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ArmOffset {
    None,
    Imm(Expr),
    Reg {
        reg: Register,
        subtract: bool,
        shift: Option<Shift>,
    },
}

/// ARM / AArch64 memory operand `[base, offset]{!}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArmMem {
    pub base: Register,
    pub offset: ArmOffset,
    /// Pre-indexed with writeback (`!`).
    pub writeback: bool,
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operand {
    Reg(Register),
    /// Register followed by `!` (ARM `ldm r0!, {...}`).
    RegWriteback(Register),
    /// Immediate, branch target or symbolic name (e.g. a condition code).
    Imm(Expr),
    Mem(X86Mem),
    ArmMem(ArmMem),
    /// ARM register list as a bit mask.
    RegList(u16),
    Shift(Shift),
}

/// x86 legacy prefix written as a separate keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prefix {
    Lock,
    Rep,
    Repne,
}

impl Prefix {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "lock" => Some(Prefix::Lock),
            "rep" | "repe" | "repz" => Some(Prefix::Rep),
            "repne" | "repnz" => Some(Prefix::Repne),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Prefix::Lock => 0xF0,
            Prefix::Rep => 0xF3,
            Prefix::Repne => 0xF2,
        }
    }
}

/// One machine instruction as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Instruction {
    /// Lowercased mnemonic.
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    /// Span of each operand, parallel to `operands`.
    pub spans: Vec<Span>,
    pub prefixes: Vec<Prefix>,
    /// Written in AT&T grammar: the mnemonic may carry a size suffix.
    pub att: bool,
    /// Span of the mnemonic.
    pub span: Span,
}

impl Instruction {
    /// Span of operand `i`, falling back to the mnemonic.
    pub fn op_span(&self, i: usize) -> Span {
        self.spans.get(i).copied().unwrap_or(self.span)
    }

    pub fn error(&self, detail: impl Into<String>) -> Fault {
        Fault::operand(detail, self.span)
    }
}

// ── Directives ───────────────────────────────────────────────────────────

/// One item of a data directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataValue {
    Expr(Expr, Span),
    Bytes(Vec<u8>),
}

/// How `.align`-style directives interpret their argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlignKind {
    Bytes,
    Pow2,
}

/// Code mode selected by a mode-switch directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodeMode {
    X86(u8),
    Arm,
    Thumb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Directive {
    /// `.byte`, `.long`, `db`, ... with element size in bytes.
    Data { size: u8, values: Vec<DataValue> },
    /// `.ascii` / `.asciz` payload, already terminated where required.
    Bytes(Vec<u8>),
    Align {
        kind: AlignKind,
        amount: Expr,
        fill: Option<Expr>,
        span: Span,
    },
    Space {
        size: Expr,
        fill: Option<Expr>,
        span: Span,
    },
    Mode(CodeMode),
    /// Accepted without effect on the output (`.text`, `.globl`, dialect switches).
    Nop,
}

/// What a statement does once its labels are stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Body {
    Instruction(Instruction),
    Directive(Directive),
    /// `.equ name, expr` and friends.
    Constant { name: String, expr: Expr, span: Span },
}

/// Parser output for one statement.
///
/// Labels are kept even when the body fails to parse so that references
/// from earlier statements still resolve and the first failure in source
/// order is the one reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedStatement {
    pub labels: Vec<(String, Span)>,
    pub body: Option<Result<Body, Fault>>,
}
