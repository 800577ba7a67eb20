//! Runtime options: option types and the syntax dialect selector.

use core::fmt;

/// Which engine option [`Engine::set_option`](crate::Engine::set_option) changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OptionType {
    /// Input syntax dialect (value: [`SyntaxOption::value`] bits).
    Syntax,
    /// Symbol resolver slot. Only `0` (detach) is a valid raw value.
    SymbolResolver,
}

impl OptionType {
    /// Native integer code.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            OptionType::Syntax => 1,
            OptionType::SymbolResolver => 2,
        }
    }

    /// Decode a native integer code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(OptionType::Syntax),
            2 => Some(OptionType::SymbolResolver),
            _ => None,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Syntax => f.write_str("syntax"),
            OptionType::SymbolResolver => f.write_str("symbol-resolver"),
        }
    }
}

/// Textual grammar dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Syntax {
    /// Intel / LLVM-Intel: `mov eax, [ebx+4]`.
    Intel,
    /// AT&T: `movl 4(%ebx), %eax`.
    Att,
    /// NASM flavour of Intel syntax.
    Nasm,
    /// MASM flavour of Intel syntax.
    Masm,
    /// GNU as. AT&T on x86, unified syntax on ARM.
    Gas,
}

impl Syntax {
    /// Every dialect, in native-bit order.
    pub const ALL: [Syntax; 5] = [
        Syntax::Intel,
        Syntax::Att,
        Syntax::Nasm,
        Syntax::Masm,
        Syntax::Gas,
    ];

    /// Native bit of the dialect.
    #[must_use]
    pub fn bit(self) -> u32 {
        match self {
            Syntax::Intel => 1 << 0,
            Syntax::Att => 1 << 1,
            Syntax::Nasm => 1 << 2,
            Syntax::Masm => 1 << 3,
            Syntax::Gas => 1 << 4,
        }
    }

    /// Decode a single dialect bit.
    #[must_use]
    pub fn from_bit(bit: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.bit() == bit)
    }

    /// Whether x86 input in this dialect uses the AT&T grammar
    /// (`%reg`, `$imm`, source-first operand order).
    #[must_use]
    pub fn is_att_family(self) -> bool {
        matches!(self, Syntax::Att | Syntax::Gas)
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Syntax::Intel => "Intel",
            Syntax::Att => "AT&T",
            Syntax::Nasm => "NASM",
            Syntax::Masm => "MASM",
            Syntax::Gas => "GAS",
        };
        f.write_str(name)
    }
}

/// Native bit of the radix-16 modifier.
pub const RADIX16_BIT: u32 = 1 << 5;

/// Current syntax setting: a dialect plus the radix-16 modifier, under
/// which bare numbers (`10`, `ff0`) are read as hexadecimal.
///
/// ```
/// use ks_asm::{Syntax, SyntaxOption};
///
/// let opt = SyntaxOption::new(Syntax::Intel).radix16(true);
/// assert_eq!(opt.value(), 0x21);
/// assert_eq!(SyntaxOption::from_value(0x21), Some(opt));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SyntaxOption {
    /// Grammar dialect.
    pub dialect: Syntax,
    /// Bare numbers are hexadecimal.
    pub radix16: bool,
}

impl SyntaxOption {
    /// Dialect with decimal default radix.
    #[must_use]
    pub const fn new(dialect: Syntax) -> Self {
        Self {
            dialect,
            radix16: false,
        }
    }

    /// Builder-style radix-16 toggle.
    #[must_use]
    pub const fn radix16(mut self, on: bool) -> Self {
        self.radix16 = on;
        self
    }

    /// Native bit value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.dialect.bit() | if self.radix16 { RADIX16_BIT } else { 0 }
    }

    /// Decode a native value holding exactly one dialect bit and optionally
    /// the radix-16 bit. A bare radix-16 bit has no dialect and is rejected
    /// here; the engine handles it against its current dialect.
    #[must_use]
    pub fn from_value(value: i64) -> Option<Self> {
        let bits = u32::try_from(value).ok()?;
        let dialect_bits = bits & !RADIX16_BIT;
        if dialect_bits.count_ones() != 1 {
            return None;
        }
        let dialect = Syntax::from_bit(dialect_bits)?;
        Some(Self::new(dialect).radix16(bits & RADIX16_BIT != 0))
    }
}

impl fmt::Display for SyntaxOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.radix16 {
            write!(f, "{} (radix 16)", self.dialect)
        } else {
            write!(f, "{}", self.dialect)
        }
    }
}
