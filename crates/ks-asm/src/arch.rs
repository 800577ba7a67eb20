//! Architectures, modes and their native integer codes.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Target instruction-set family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Arch {
    /// ARM (A32 and Thumb).
    Arm,
    /// ARMv8-A 64-bit.
    Arm64,
    /// MIPS.
    Mips,
    /// x86 (16, 32 and 64-bit).
    X86,
    /// PowerPC.
    Ppc,
    /// SPARC.
    Sparc,
    /// IBM z/Architecture.
    SystemZ,
    /// Qualcomm Hexagon.
    Hexagon,
    /// Ethereum virtual machine.
    Evm,
}

impl Arch {
    /// Every architecture, in native-code order.
    pub const ALL: [Arch; 9] = [
        Arch::Arm,
        Arch::Arm64,
        Arch::Mips,
        Arch::X86,
        Arch::Ppc,
        Arch::Sparc,
        Arch::SystemZ,
        Arch::Hexagon,
        Arch::Evm,
    ];

    /// Native integer code.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Arch::Arm => 1,
            Arch::Arm64 => 2,
            Arch::Mips => 3,
            Arch::X86 => 4,
            Arch::Ppc => 5,
            Arch::Sparc => 6,
            Arch::SystemZ => 7,
            Arch::Hexagon => 8,
            Arch::Evm => 9,
        }
    }

    /// Decode a native integer code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Arch::Arm),
            2 => Some(Arch::Arm64),
            3 => Some(Arch::Mips),
            4 => Some(Arch::X86),
            5 => Some(Arch::Ppc),
            6 => Some(Arch::Sparc),
            7 => Some(Arch::SystemZ),
            8 => Some(Arch::Hexagon),
            9 => Some(Arch::Evm),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::Arm => "ARM",
            Arch::Arm64 => "ARM64",
            Arch::Mips => "MIPS",
            Arch::X86 => "x86",
            Arch::Ppc => "PPC",
            Arch::Sparc => "SPARC",
            Arch::SystemZ => "SystemZ",
            Arch::Hexagon => "Hexagon",
            Arch::Evm => "EVM",
        };
        f.write_str(name)
    }
}

/// Architecture-scoped mode flag.
///
/// Several flags share a native bit (e.g. `Thumb`, `Micro`, `Qpx` and
/// `SparcV9` are all `1 << 4`); the architecture disambiguates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// Little-endian (the absence of `BigEndian`).
    LittleEndian,
    /// Big-endian.
    BigEndian,
    /// ARM A32 state.
    Arm,
    /// ARM Thumb state.
    Thumb,
    /// ARMv8 A32 encodings.
    V8,
    /// microMIPS.
    Micro,
    /// MIPS III.
    Mips3,
    /// MIPS32 release 6.
    Mips32R6,
    /// MIPS32.
    Mips32,
    /// MIPS64.
    Mips64,
    /// x86 16-bit real mode.
    Mode16,
    /// x86 32-bit protected mode.
    Mode32,
    /// x86 64-bit long mode.
    Mode64,
    /// 32-bit PowerPC.
    Ppc32,
    /// 64-bit PowerPC.
    Ppc64,
    /// PowerPC quad processing extensions.
    Qpx,
    /// 32-bit SPARC.
    Sparc32,
    /// 64-bit SPARC.
    Sparc64,
    /// SPARC V9.
    SparcV9,
}

/// Native code table, `(mode, bits, owning architectures)`. An empty owner
/// list means the flag applies to every architecture.
const MODE_TABLE: &[(Mode, u32, &[Arch])] = &[
    (Mode::LittleEndian, 0, &[]),
    (Mode::BigEndian, 1 << 30, &[]),
    (Mode::Arm, 1 << 0, &[Arch::Arm]),
    (Mode::Thumb, 1 << 4, &[Arch::Arm]),
    (Mode::V8, 1 << 6, &[Arch::Arm]),
    (Mode::Micro, 1 << 4, &[Arch::Mips]),
    (Mode::Mips3, 1 << 5, &[Arch::Mips]),
    (Mode::Mips32R6, 1 << 6, &[Arch::Mips]),
    (Mode::Mips32, 1 << 2, &[Arch::Mips]),
    (Mode::Mips64, 1 << 3, &[Arch::Mips]),
    (Mode::Mode16, 1 << 1, &[Arch::X86]),
    (Mode::Mode32, 1 << 2, &[Arch::X86]),
    (Mode::Mode64, 1 << 3, &[Arch::X86]),
    (Mode::Ppc32, 1 << 2, &[Arch::Ppc]),
    (Mode::Ppc64, 1 << 3, &[Arch::Ppc]),
    (Mode::Qpx, 1 << 4, &[Arch::Ppc]),
    (Mode::Sparc32, 1 << 2, &[Arch::Sparc]),
    (Mode::Sparc64, 1 << 3, &[Arch::Sparc]),
    (Mode::SparcV9, 1 << 4, &[Arch::Sparc]),
];

impl Mode {
    /// Native bit pattern of this flag.
    #[must_use]
    pub fn code(self) -> u32 {
        MODE_TABLE
            .iter()
            .find(|(m, _, _)| *m == self)
            .map_or(0, |&(_, bits, _)| bits)
    }

    /// Architectures this flag belongs to; `None` for the endianness flags,
    /// which apply everywhere.
    #[must_use]
    pub fn owners(self) -> Option<&'static [Arch]> {
        MODE_TABLE
            .iter()
            .find(|(m, _, _)| *m == self)
            .and_then(|&(_, _, owners)| (!owners.is_empty()).then_some(owners))
    }

    /// Decode a single native flag in the context of `arch`.
    #[must_use]
    pub fn from_code(arch: Arch, code: u32) -> Option<Self> {
        MODE_TABLE
            .iter()
            .find(|&&(_, bits, owners)| {
                bits == code && (owners.is_empty() || owners.contains(&arch))
            })
            .map(|&(m, _, _)| m)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Combined mode bits passed to [`Engine::open`](crate::Engine::open).
///
/// Built from one [`Mode`] or several joined with `|`:
///
/// ```
/// use ks_asm::{Mode, ModeFlags};
///
/// let flags = Mode::Arm | Mode::BigEndian;
/// assert!(flags.contains(Mode::BigEndian));
/// assert_eq!(ModeFlags::from(Mode::Mode64).bits(), 1 << 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModeFlags(u32);

impl ModeFlags {
    /// Wrap raw native bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw native bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether the flag's bits are set. `LittleEndian` is "contained" when
    /// `BigEndian` is not.
    #[must_use]
    pub fn contains(self, mode: Mode) -> bool {
        match mode {
            Mode::LittleEndian => !self.is_big_endian(),
            m => self.0 & m.code() == m.code(),
        }
    }

    /// Whether the big-endian bit is set.
    #[must_use]
    pub fn is_big_endian(self) -> bool {
        self.0 & Mode::BigEndian.code() != 0
    }
}

impl From<Mode> for ModeFlags {
    fn from(mode: Mode) -> Self {
        Self(mode.code())
    }
}

impl BitOr for Mode {
    type Output = ModeFlags;

    fn bitor(self, rhs: Mode) -> ModeFlags {
        ModeFlags(self.code() | rhs.code())
    }
}

impl BitOr<Mode> for ModeFlags {
    type Output = ModeFlags;

    fn bitor(self, rhs: Mode) -> ModeFlags {
        ModeFlags(self.0 | rhs.code())
    }
}

impl BitOrAssign<Mode> for ModeFlags {
    fn bitor_assign(&mut self, rhs: Mode) {
        self.0 |= rhs.code();
    }
}

impl fmt::Display for ModeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_codes_round_trip() {
        for arch in Arch::ALL {
            assert_eq!(Arch::from_code(arch.code()), Some(arch));
        }
        assert_eq!(Arch::from_code(0), None);
        assert_eq!(Arch::from_code(10), None);
    }

    #[test]
    fn shared_bits_decode_per_arch() {
        assert_eq!(Mode::from_code(Arch::Arm, 1 << 4), Some(Mode::Thumb));
        assert_eq!(Mode::from_code(Arch::Mips, 1 << 4), Some(Mode::Micro));
        assert_eq!(Mode::from_code(Arch::Ppc, 1 << 4), Some(Mode::Qpx));
        assert_eq!(Mode::from_code(Arch::Sparc, 1 << 4), Some(Mode::SparcV9));
        assert_eq!(Mode::from_code(Arch::X86, 1 << 4), None);
    }

    #[test]
    fn mode_codes_round_trip_within_owner() {
        for &(mode, bits, owners) in MODE_TABLE {
            let archs: &[Arch] = if owners.is_empty() { &Arch::ALL } else { owners };
            for &arch in archs {
                assert_eq!(Mode::from_code(arch, bits), Some(mode), "{:?}", arch);
            }
        }
    }

    #[test]
    fn endianness_flags() {
        let be = Mode::Arm | Mode::BigEndian;
        assert!(be.is_big_endian());
        assert!(!be.contains(Mode::LittleEndian));
        let le = ModeFlags::from(Mode::LittleEndian);
        assert_eq!(le.bits(), 0);
        assert!(le.contains(Mode::LittleEndian));
    }

    #[test]
    fn owners() {
        assert_eq!(Mode::BigEndian.owners(), None);
        assert_eq!(Mode::Mode64.owners(), Some(&[Arch::X86][..]));
    }
}
