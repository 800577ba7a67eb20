//! Static architecture / mode / syntax validity table.

use crate::arch::{Arch, Mode, ModeFlags};
use crate::error::ErrorCode;
use crate::option::Syntax;

/// One row of the registry.
#[derive(Debug, Clone, Copy)]
pub struct ArchSpec {
    /// Architecture this row describes.
    pub arch: Arch,
    /// Mode flags that may appear in the mode bit set.
    pub allowed: &'static [Mode],
    /// Exactly one of these must be present (empty: no requirement).
    pub exactly_one_of: &'static [Mode],
    /// Accepted syntax dialects; the first one is the default.
    pub syntaxes: &'static [Syntax],
}

/// Registry of every architecture, in native-code order.
pub static REGISTRY: &[ArchSpec] = &[
    ArchSpec {
        arch: Arch::Arm,
        allowed: &[Mode::Arm, Mode::Thumb, Mode::V8, Mode::BigEndian],
        exactly_one_of: &[Mode::Arm, Mode::Thumb],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::Arm64,
        allowed: &[],
        exactly_one_of: &[],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::Mips,
        allowed: &[
            Mode::Micro,
            Mode::Mips3,
            Mode::Mips32R6,
            Mode::Mips32,
            Mode::Mips64,
            Mode::BigEndian,
        ],
        exactly_one_of: &[Mode::Mips32, Mode::Mips64],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::X86,
        allowed: &[Mode::Mode16, Mode::Mode32, Mode::Mode64],
        exactly_one_of: &[Mode::Mode16, Mode::Mode32, Mode::Mode64],
        syntaxes: &[
            Syntax::Intel,
            Syntax::Att,
            Syntax::Nasm,
            Syntax::Masm,
            Syntax::Gas,
        ],
    },
    ArchSpec {
        arch: Arch::Ppc,
        allowed: &[Mode::Ppc32, Mode::Ppc64, Mode::Qpx, Mode::BigEndian],
        exactly_one_of: &[Mode::Ppc32, Mode::Ppc64],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::Sparc,
        allowed: &[Mode::Sparc32, Mode::Sparc64, Mode::SparcV9, Mode::BigEndian],
        exactly_one_of: &[Mode::Sparc32, Mode::Sparc64, Mode::SparcV9],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::SystemZ,
        allowed: &[Mode::BigEndian],
        exactly_one_of: &[Mode::BigEndian],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::Hexagon,
        allowed: &[Mode::BigEndian],
        exactly_one_of: &[Mode::BigEndian],
        syntaxes: &[Syntax::Gas],
    },
    ArchSpec {
        arch: Arch::Evm,
        allowed: &[],
        exactly_one_of: &[],
        syntaxes: &[Syntax::Gas],
    },
];

/// Registry row for `arch`.
#[must_use]
pub fn spec(arch: Arch) -> &'static ArchSpec {
    // REGISTRY is indexed by native code order.
    &REGISTRY[arch.code() as usize - 1]
}

impl ArchSpec {
    /// Whether `mode` is a valid mode bit set for this architecture.
    #[must_use]
    pub fn accepts_mode(&self, mode: ModeFlags) -> bool {
        let allowed_bits = self.allowed.iter().fold(0u32, |acc, m| acc | m.code());
        if mode.bits() & !allowed_bits != 0 {
            return false;
        }
        if self.exactly_one_of.is_empty() {
            return true;
        }
        self.exactly_one_of
            .iter()
            .filter(|m| mode.contains(**m))
            .count()
            == 1
    }

    /// Whether `syntax` is accepted by this architecture.
    #[must_use]
    pub fn accepts_syntax(&self, syntax: Syntax) -> bool {
        self.syntaxes.contains(&syntax)
    }

    /// Default syntax dialect.
    #[must_use]
    pub fn default_syntax(&self) -> Syntax {
        self.syntaxes.first().copied().unwrap_or(Syntax::Gas)
    }

    /// Whether an encoder for this architecture is compiled in.
    #[must_use]
    pub fn is_built(&self) -> bool {
        match self.arch {
            Arch::X86 => cfg!(feature = "x86"),
            Arch::Arm => cfg!(feature = "arm"),
            Arch::Arm64 => cfg!(feature = "arm64"),
            _ => false,
        }
    }
}

/// Validate `(arch, mode)` for opening an engine: mode first, then build support.
pub(crate) fn validate(arch: Arch, mode: ModeFlags) -> Result<&'static ArchSpec, ErrorCode> {
    let row = spec(arch);
    if !row.accepts_mode(mode) {
        return Err(ErrorCode::Mode);
    }
    if !row.is_built() {
        return Err(ErrorCode::Arch);
    }
    Ok(row)
}
