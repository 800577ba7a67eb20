//! The assembler engine: lifecycle, options, symbol resolver and limits.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::{Arch, ModeFlags};
use crate::error::{Error, ErrorCode};
use crate::linker::{self, Target};
use crate::option::{OptionType, SyntaxOption, RADIX16_BIT};
use crate::registry;
use crate::symbols::SymbolResolver;

/// Configurable resource limits for defense against denial-of-service.
///
/// Every limit has a generous default suitable for normal use. Tighten them
/// when assembling untrusted input.
///
/// ```
/// use ks_asm::{Arch, Engine, Mode, ResourceLimits};
///
/// let mut engine = Engine::open(Arch::X86, Mode::Mode64)?;
/// engine.set_limits(ResourceLimits {
///     max_output_bytes: 4,
///     ..ResourceLimits::default()
/// })?;
/// assert!(engine.assemble(".space 5", 0).is_err());
/// # Ok::<(), ks_asm::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceLimits {
    /// Maximum number of statements per call. Default: 1,000,000.
    pub max_statements: usize,
    /// Maximum input size in bytes per call. Default: 64 MiB.
    pub max_source_bytes: usize,
    /// Maximum output size in bytes. Default: 16 MiB.
    pub max_output_bytes: usize,
    /// Maximum number of layout passes before giving up. Default: 100.
    pub max_passes: usize,
    /// Maximum nesting of constant definitions. Default: 256.
    pub max_symbol_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_statements: 1_000_000,
            max_source_bytes: 64 * 1024 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
            max_passes: 100,
            max_symbol_depth: 256,
        }
    }
}

/// Output of a successful [`Engine::assemble`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncodedResult {
    machine_code: Vec<u8>,
    statement_count: usize,
    address: u64,
    labels: BTreeMap<String, u64>,
}

impl EncodedResult {
    /// Encoded bytes, in statement order.
    #[must_use]
    pub fn machine_code(&self) -> &[u8] {
        &self.machine_code
    }

    /// Consume the result, returning the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.machine_code
    }

    /// Number of statements that carried an instruction or directive.
    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.statement_count
    }

    /// Base address the code was assembled at.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Length of the encoded bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.machine_code.len()
    }

    /// Whether no bytes were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machine_code.is_empty()
    }

    /// Final address of every label defined in the source.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, u64> {
        &self.labels
    }

    /// Final address of one label.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<u64> {
        self.labels.get(name).copied()
    }
}

impl AsRef<[u8]> for EncodedResult {
    fn as_ref(&self) -> &[u8] {
        &self.machine_code
    }
}

/// An assembler instance for one architecture and mode.
///
/// ```
/// use ks_asm::{Arch, Engine, Mode};
///
/// let mut engine = Engine::open(Arch::X86, Mode::Mode64)?;
/// let out = engine.assemble("INC EAX; DEC EAX", 0)?;
/// assert_eq!(out.machine_code(), &[0xFF, 0xC0, 0xFF, 0xC8]);
/// assert_eq!(out.statement_count(), 2);
/// engine.close();
/// # Ok::<(), ks_asm::Error>(())
/// ```
pub struct Engine {
    arch: Arch,
    mode: ModeFlags,
    syntax: SyntaxOption,
    resolver: Option<Box<dyn SymbolResolver + Send>>,
    limits: ResourceLimits,
    closed: bool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("arch", &self.arch)
            .field("mode", &self.mode)
            .field("syntax", &self.syntax)
            .field("resolver", &self.resolver.is_some())
            .field("limits", &self.limits)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Engine {
    /// Open an engine for `arch` in `mode`.
    ///
    /// The mode is validated first (`ErrorCode::Mode`), then whether the
    /// architecture is compiled in (`ErrorCode::Arch`).
    pub fn open(arch: Arch, mode: impl Into<ModeFlags>) -> Result<Self, Error> {
        let mode = mode.into();
        let spec = registry::validate(arch, mode).map_err(|cause| {
            tracing::debug!(%arch, mode = mode.bits(), %cause, "open rejected");
            Error::Open { cause, arch, mode }
        })?;
        tracing::debug!(%arch, mode = mode.bits(), "engine opened");
        Ok(Self {
            arch,
            mode,
            syntax: SyntaxOption::new(spec.default_syntax()),
            resolver: None,
            limits: ResourceLimits::default(),
            closed: false,
        })
    }

    /// Architecture this engine was opened for.
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Mode flags this engine was opened with.
    #[must_use]
    pub fn mode(&self) -> ModeFlags {
        self.mode
    }

    /// Current syntax setting.
    #[must_use]
    pub fn syntax(&self) -> SyntaxOption {
        self.syntax
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current resource limits.
    #[must_use]
    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Replace the resource limits.
    pub fn set_limits(&mut self, limits: ResourceLimits) -> Result<(), Error> {
        self.ensure_open()?;
        self.limits = limits;
        Ok(())
    }

    /// Set an option from its native integer value.
    ///
    /// `OptionType::Syntax` takes a syntax bit value; a bare radix-16 bit
    /// keeps the current dialect. `OptionType::SymbolResolver` only accepts
    /// `0`, which detaches the resolver; install one with
    /// [`set_symbol_resolver`](Self::set_symbol_resolver).
    ///
    /// ```
    /// use ks_asm::{Arch, Engine, ErrorCode, Mode, OptionType, Syntax};
    ///
    /// let mut engine = Engine::open(Arch::X86, Mode::Mode32)?;
    /// engine.set_option(OptionType::Syntax, 2)?;
    /// assert_eq!(engine.syntax().dialect, Syntax::Att);
    /// let err = engine.set_option(OptionType::Syntax, -1).unwrap_err();
    /// assert_eq!(err.code(), ErrorCode::OptInvalid);
    /// # Ok::<(), ks_asm::Error>(())
    /// ```
    pub fn set_option(&mut self, option: OptionType, value: i64) -> Result<(), Error> {
        self.ensure_open()?;
        let invalid = || {
            tracing::debug!(%option, value, "option rejected");
            Error::SetOption {
                cause: ErrorCode::OptInvalid,
                option,
                value,
            }
        };
        match option {
            OptionType::Syntax => {
                let syntax = if value == i64::from(RADIX16_BIT) {
                    self.syntax.radix16(true)
                } else {
                    SyntaxOption::from_value(value).ok_or_else(invalid)?
                };
                if !registry::spec(self.arch).accepts_syntax(syntax.dialect) {
                    return Err(invalid());
                }
                self.syntax = syntax;
                tracing::debug!(%syntax, "syntax changed");
            }
            OptionType::SymbolResolver => {
                if value != 0 {
                    return Err(invalid());
                }
                self.resolver = None;
                tracing::debug!("symbol resolver detached");
            }
        }
        Ok(())
    }

    /// Typed form of `set_option(OptionType::Syntax, ..)`.
    pub fn set_syntax(&mut self, syntax: SyntaxOption) -> Result<(), Error> {
        self.set_option(OptionType::Syntax, i64::from(syntax.value()))
    }

    /// Install `resolver`, replacing any previous one.
    pub fn set_symbol_resolver<R>(&mut self, resolver: R) -> Result<(), Error>
    where
        R: SymbolResolver + Send + 'static,
    {
        self.ensure_open()?;
        self.resolver = Some(Box::new(resolver));
        tracing::debug!("symbol resolver installed");
        Ok(())
    }

    /// Detach the resolver. Later unknown symbols fail with
    /// `ErrorCode::SymbolMissing` without any callback.
    pub fn unset_symbol_resolver(&mut self) -> Result<(), Error> {
        self.set_option(OptionType::SymbolResolver, 0)
    }

    /// Assemble `source` as if its first byte were placed at `address`.
    ///
    /// Statements are separated by `;` or newlines. The call is
    /// all-or-nothing: the first failing statement aborts it.
    pub fn assemble(&mut self, source: &str, address: u64) -> Result<EncodedResult, Error> {
        self.ensure_open()?;
        if source.len() > self.limits.max_source_bytes {
            return Err(Error::ResourceLimitExceeded {
                resource: String::from("source bytes"),
                limit: self.limits.max_source_bytes,
            });
        }
        let target = Target {
            arch: self.arch,
            mode: self.mode,
            syntax: self.syntax,
        };
        let resolver = self
            .resolver
            .as_mut()
            .map(|r| &mut **r as &mut (dyn SymbolResolver + Send));

        match linker::assemble(source, address, target, &self.limits, resolver) {
            Ok(layout) => {
                tracing::debug!(
                    arch = %self.arch,
                    address,
                    statements = layout.statement_count,
                    bytes = layout.bytes.len(),
                    "assembled"
                );
                Ok(EncodedResult {
                    machine_code: layout.bytes,
                    statement_count: layout.statement_count,
                    address,
                    labels: layout.labels,
                })
            }
            Err(err) => {
                tracing::debug!(arch = %self.arch, error = %err, "assemble failed");
                Err(err)
            }
        }
    }

    /// Assemble a sequence of statements.
    ///
    /// Equivalent to joining the elements with `;` and calling
    /// [`assemble`](Self::assemble).
    pub fn assemble_statements<I, S>(&mut self, statements: I, address: u64) -> Result<EncodedResult, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut source = String::new();
        for (i, statement) in statements.into_iter().enumerate() {
            if i > 0 {
                source.push(';');
            }
            source.push_str(statement.as_ref());
        }
        self.assemble(&source, address)
    }

    /// Release the engine. Idempotent; later calls fail with
    /// [`Error::Closed`].
    pub fn close(&mut self) {
        if !self.closed {
            self.resolver = None;
            self.closed = true;
            tracing::debug!(arch = %self.arch, "engine closed");
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Mode;
    use crate::option::Syntax;

    fn assert_send<T: Send>() {}

    #[test]
    fn engine_is_send() {
        assert_send::<Engine>();
    }

    #[test]
    fn default_syntax_follows_registry() {
        let engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
        assert_eq!(engine.syntax(), SyntaxOption::new(Syntax::Intel));
        let engine = Engine::open(Arch::Arm64, Mode::LittleEndian).unwrap();
        assert_eq!(engine.syntax(), SyntaxOption::new(Syntax::Gas));
    }

    #[test]
    fn bare_radix16_keeps_dialect() {
        let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
        engine.set_syntax(SyntaxOption::new(Syntax::Nasm)).unwrap();
        engine
            .set_option(OptionType::Syntax, i64::from(RADIX16_BIT))
            .unwrap();
        assert_eq!(engine.syntax(), SyntaxOption::new(Syntax::Nasm).radix16(true));
        let out = engine.assemble("mov eax, 10", 0).unwrap();
        assert_eq!(out.machine_code(), &[0xB8, 0x10, 0, 0, 0]);
    }

    #[test]
    fn syntax_must_be_listed_for_arch() {
        let mut engine = Engine::open(Arch::Arm, Mode::Arm).unwrap();
        let err = engine.set_option(OptionType::Syntax, 1).unwrap_err();
        assert_eq!(
            err,
            Error::SetOption {
                cause: ErrorCode::OptInvalid,
                option: OptionType::Syntax,
                value: 1,
            }
        );
    }

    #[test]
    fn resolver_option_only_detaches() {
        let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
        assert!(engine.set_option(OptionType::SymbolResolver, 1).is_err());
        engine.set_symbol_resolver(|_: &str| Some(1_u64)).unwrap();
        engine.set_option(OptionType::SymbolResolver, 0).unwrap();
        let err = engine.assemble("push x", 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SymbolMissing);
    }

    #[test]
    fn close_is_idempotent() {
        let mut engine = Engine::open(Arch::X86, Mode::Mode16).unwrap();
        engine.close();
        engine.close();
        assert!(engine.is_closed());
        assert_eq!(engine.assemble("nop", 0), Err(Error::Closed));
        assert_eq!(engine.set_limits(ResourceLimits::default()), Err(Error::Closed));
    }

    #[test]
    fn source_limit() {
        let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
        engine
            .set_limits(ResourceLimits {
                max_source_bytes: 3,
                ..ResourceLimits::default()
            })
            .unwrap();
        assert!(engine.assemble("nop", 0).is_ok());
        let err = engine.assemble("nop;", 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoMem);
    }
}
