//! # ks-asm: Multi-Architecture, Multi-Syntax Assembler Engine
//!
//! `ks-asm` turns assembly text into machine-code bytes for a chosen
//! architecture, mode and syntax dialect.
//!
//! ## Quick Start
//!
//! ```rust
//! use ks_asm::{Arch, Engine, Mode};
//!
//! let mut engine = Engine::open(Arch::X86, Mode::Mode64)?;
//! let out = engine.assemble("inc eax; dec eax", 0)?;
//! assert_eq!(out.machine_code(), &[0xFF, 0xC0, 0xFF, 0xC8]);
//! # Ok::<(), ks_asm::Error>(())
//! ```
//!
//! ## Features
//!
//! - **Engine lifecycle**: open for an `(arch, mode)`, set options, assemble, close.
//! - **Syntax dialects**: Intel, AT&T, NASM, MASM and GAS on x86, with a radix-16 modifier.
//! - **Symbol resolver**: a callback consulted for symbols the source does not define.
//! - **Labels & branch relaxation**: short branches grow to long forms until layout converges.
//! - **`no_std` + `alloc`**: embeddable in firmware, kernels, WASM.
//!
//! Encoders for x86, ARM/Thumb and AArch64 are compiled in behind the
//! `x86`, `arm` and `arm64` features. Every other [`Arch`] is known to the
//! registry but reports [`ErrorCode::Arch`] on [`Engine::open`].

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An assembler performs many narrowing / sign-changing casts between
// integer widths (i128→u8, u8→u32, etc.) and uses dense hex literals
// without separators (0xE3A00000, 0xD503201F).
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::redundant_closure_for_method_calls,
    clippy::bool_to_int_with_if,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::needless_raw_string_hashes,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::unnecessary_wraps,
    clippy::many_single_char_names,
    clippy::redundant_else,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::needless_continue
)]

extern crate alloc;

// Helpers in `encoder`, `ir` and `error` go unused when an encoder is compiled out.

#[cfg(feature = "arm64")]
pub(crate) mod aarch64;
#[cfg(feature = "arm")]
pub(crate) mod arm;
/// Architectures and mode flags.
pub mod arch;
#[cfg_attr(not(all(feature = "x86", feature = "arm", feature = "arm64")), allow(dead_code))]
pub(crate) mod encoder;
/// Engine handle, resource limits and results.
pub mod engine;
/// Error codes, engine errors and source spans.
#[cfg_attr(not(all(feature = "x86", feature = "arm", feature = "arm64")), allow(dead_code))]
pub mod error;
#[cfg_attr(not(all(feature = "x86", feature = "arm", feature = "arm64")), allow(dead_code))]
pub(crate) mod ir;
pub(crate) mod lexer;
pub(crate) mod linker;
/// Option types and syntax dialects.
pub mod option;
pub(crate) mod parser;
/// Static architecture / mode / syntax table.
pub mod registry;
pub(crate) mod splitter;
/// External symbol resolution.
pub mod symbols;
/// Engine version.
pub mod version;
#[cfg(feature = "x86")]
pub(crate) mod x86;

// Re-exports
pub use arch::{Arch, Mode, ModeFlags};
pub use engine::{EncodedResult, Engine, ResourceLimits};
pub use error::{Error, ErrorCode, Span};
pub use option::{OptionType, Syntax, SyntaxOption, RADIX16_BIT};
pub use symbols::SymbolResolver;
pub use version::Version;

use alloc::vec::Vec;

/// Version of this engine.
///
/// ```rust
/// assert_eq!(ks_asm::version(), ks_asm::Version::CURRENT);
/// ```
#[must_use]
pub fn version() -> Version {
    Version::CURRENT
}

/// Whether an encoder for `arch` is compiled into this build.
///
/// ```rust
/// use ks_asm::{is_architecture_supported, Arch};
///
/// assert!(is_architecture_supported(Arch::X86));
/// assert!(!is_architecture_supported(Arch::Evm));
/// ```
#[must_use]
pub fn is_architecture_supported(arch: Arch) -> bool {
    registry::spec(arch).is_built()
}

/// Assemble `source` at address 0 with a throwaway engine.
///
/// # Errors
///
/// Returns [`Error`] if the engine cannot be opened for `(arch, mode)` or
/// any statement fails to assemble.
///
/// # Examples
///
/// ```rust
/// use ks_asm::{assemble, Arch, Mode};
///
/// let code = assemble(Arch::Arm64, Mode::LittleEndian, "nop").unwrap();
/// assert_eq!(code, vec![0x1F, 0x20, 0x03, 0xD5]);
/// ```
pub fn assemble(arch: Arch, mode: impl Into<ModeFlags>, source: &str) -> Result<Vec<u8>, Error> {
    let mut engine = Engine::open(arch, mode)?;
    Ok(engine.assemble(source, 0)?.into_bytes())
}
