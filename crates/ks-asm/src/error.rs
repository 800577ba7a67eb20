//! Error types, native cause codes and source-span diagnostics.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
use core::fmt;

use crate::arch::{Arch, ModeFlags};
use crate::option::OptionType;

/// Source location for diagnostics.
///
/// Tracks the line, column, byte offset, and length of a token or construct
/// in the caller's assembly source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number (byte offset within line).
    pub col: u32,
    /// 0-based byte offset from start of source.
    pub offset: usize,
    /// Byte length of the spanned region.
    pub len: usize,
}

impl Span {
    /// Create a new span.
    #[must_use]
    pub fn new(line: u32, col: u32, offset: usize, len: usize) -> Self {
        Self {
            line,
            col,
            offset,
            len,
        }
    }

    /// A dummy span for generated/internal constructs.
    #[must_use]
    pub fn dummy() -> Self {
        Self::default()
    }

    /// Shift a statement-relative span so it points into the whole source.
    #[must_use]
    pub(crate) fn rebase(self, line: u32, col: u32, offset: usize) -> Self {
        Self {
            line: line + self.line.saturating_sub(1),
            col: if self.line <= 1 {
                col + self.col.saturating_sub(1)
            } else {
                self.col
            },
            offset: offset + self.offset,
            len: self.len,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Closed enumeration of failure causes.
///
/// Every cause carries a stable native integer code (see [`ErrorCode::code`])
/// so that a binding layer can translate errors without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// A configured resource limit was exceeded.
    NoMem,
    /// The architecture is not compiled into this build.
    Arch,
    /// The engine handle is closed.
    Handle,
    /// The mode is invalid for the requested architecture.
    Mode,
    /// The option type or value is invalid.
    OptInvalid,
    /// Unexpected token inside an expression.
    ExprToken,
    /// A directive value does not fit its field.
    DirectiveValueRange,
    /// A directive expected an identifier.
    DirectiveId,
    /// Unexpected token inside a directive.
    DirectiveToken,
    /// A directive expected a string literal.
    DirectiveStr,
    /// A directive expected a comma.
    DirectiveComma,
    /// The directive is not recognized.
    DirectiveUnknown,
    /// Invalid or cyclic constant definition.
    DirectiveEqu,
    /// Malformed bracketed memory expression.
    ExprBracket,
    /// A label or constant was defined twice.
    SymbolRedefined,
    /// A referenced symbol could not be resolved.
    SymbolMissing,
    /// Expected `)` to close a parenthesized expression.
    RParen,
    /// Unexpected token at the start of a statement.
    StatToken,
    /// Invalid escape sequence in a string or character literal.
    EscSequence,
    /// Unterminated string or character literal.
    EscStr,
    /// Invalid character or malformed token.
    TokenInvalid,
    /// The instruction is not available in the current mode.
    InsnUnsupported,
    /// A value or branch target does not fit the encoding field.
    FixupInvalid,
    /// Malformed label definition.
    LabelInvalid,
    /// Layout did not converge.
    FragmentInvalid,
    /// Invalid operand or operand combination.
    InvalidOperand,
    /// Register or feature unavailable in the current mode.
    MissingFeature,
    /// Unknown mnemonic.
    MnemonicFail,
}

/// Native code table, `(cause, code)`.
const CODE_TABLE: &[(ErrorCode, u32)] = &[
    (ErrorCode::NoMem, 1),
    (ErrorCode::Arch, 2),
    (ErrorCode::Handle, 3),
    (ErrorCode::Mode, 4),
    (ErrorCode::OptInvalid, 6),
    (ErrorCode::ExprToken, 128),
    (ErrorCode::DirectiveValueRange, 129),
    (ErrorCode::DirectiveId, 130),
    (ErrorCode::DirectiveToken, 131),
    (ErrorCode::DirectiveStr, 132),
    (ErrorCode::DirectiveComma, 133),
    (ErrorCode::DirectiveUnknown, 137),
    (ErrorCode::DirectiveEqu, 138),
    (ErrorCode::ExprBracket, 141),
    (ErrorCode::SymbolRedefined, 143),
    (ErrorCode::SymbolMissing, 144),
    (ErrorCode::RParen, 145),
    (ErrorCode::StatToken, 146),
    (ErrorCode::EscSequence, 157),
    (ErrorCode::EscStr, 158),
    (ErrorCode::TokenInvalid, 159),
    (ErrorCode::InsnUnsupported, 160),
    (ErrorCode::FixupInvalid, 161),
    (ErrorCode::LabelInvalid, 162),
    (ErrorCode::FragmentInvalid, 163),
    (ErrorCode::InvalidOperand, 512),
    (ErrorCode::MissingFeature, 513),
    (ErrorCode::MnemonicFail, 514),
];

impl ErrorCode {
    /// All causes, in native-code order.
    pub const ALL: [ErrorCode; 28] = [
        ErrorCode::NoMem,
        ErrorCode::Arch,
        ErrorCode::Handle,
        ErrorCode::Mode,
        ErrorCode::OptInvalid,
        ErrorCode::ExprToken,
        ErrorCode::DirectiveValueRange,
        ErrorCode::DirectiveId,
        ErrorCode::DirectiveToken,
        ErrorCode::DirectiveStr,
        ErrorCode::DirectiveComma,
        ErrorCode::DirectiveUnknown,
        ErrorCode::DirectiveEqu,
        ErrorCode::ExprBracket,
        ErrorCode::SymbolRedefined,
        ErrorCode::SymbolMissing,
        ErrorCode::RParen,
        ErrorCode::StatToken,
        ErrorCode::EscSequence,
        ErrorCode::EscStr,
        ErrorCode::TokenInvalid,
        ErrorCode::InsnUnsupported,
        ErrorCode::FixupInvalid,
        ErrorCode::LabelInvalid,
        ErrorCode::FragmentInvalid,
        ErrorCode::InvalidOperand,
        ErrorCode::MissingFeature,
        ErrorCode::MnemonicFail,
    ];

    /// Native integer code.
    #[must_use]
    pub fn code(self) -> u32 {
        CODE_TABLE
            .iter()
            .find(|(c, _)| *c == self)
            .map_or(0, |&(_, n)| n)
    }

    /// Decode a native integer code. `0` (success) and unknown codes yield `None`.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        CODE_TABLE
            .iter()
            .find(|&&(_, n)| n == code)
            .map(|&(c, _)| c)
    }

    /// Short human-readable description.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NoMem => "resource limit exceeded",
            ErrorCode::Arch => "unsupported architecture",
            ErrorCode::Handle => "invalid handle",
            ErrorCode::Mode => "invalid or unsupported mode",
            ErrorCode::OptInvalid => "invalid option",
            ErrorCode::ExprToken => "unknown token in expression",
            ErrorCode::DirectiveValueRange => "literal value out of range for directive",
            ErrorCode::DirectiveId => "expected identifier in directive",
            ErrorCode::DirectiveToken => "unexpected token in directive",
            ErrorCode::DirectiveStr => "expected string in directive",
            ErrorCode::DirectiveComma => "expected comma in directive",
            ErrorCode::DirectiveUnknown => "unknown directive",
            ErrorCode::DirectiveEqu => "invalid equal directive",
            ErrorCode::ExprBracket => "invalid bracketed expression",
            ErrorCode::SymbolRedefined => "invalid symbol redefinition",
            ErrorCode::SymbolMissing => "cannot find a symbol",
            ErrorCode::RParen => "expected ')' in parentheses expression",
            ErrorCode::StatToken => "unexpected token at start of statement",
            ErrorCode::EscSequence => "invalid escape sequence",
            ErrorCode::EscStr => "broken escape string",
            ErrorCode::TokenInvalid => "invalid token",
            ErrorCode::InsnUnsupported => "instruction is unsupported in this mode",
            ErrorCode::FixupInvalid => "invalid fixup",
            ErrorCode::LabelInvalid => "invalid label",
            ErrorCode::FragmentInvalid => "invalid fragment",
            ErrorCode::InvalidOperand => "invalid operand",
            ErrorCode::MissingFeature => "missing CPU feature",
            ErrorCode::MnemonicFail => "invalid mnemonic",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// `(arch, mode)` failed registry validation or the architecture is not built in.
    Open {
        /// `Mode` or `Arch`.
        cause: ErrorCode,
        /// Requested architecture.
        arch: Arch,
        /// Requested mode flags.
        mode: ModeFlags,
    },

    /// An option value was rejected.
    SetOption {
        /// Always `OptInvalid`.
        cause: ErrorCode,
        /// The option type passed in.
        option: OptionType,
        /// The raw value passed in.
        value: i64,
    },

    /// A statement failed to assemble.
    Assemble {
        /// What went wrong.
        cause: ErrorCode,
        /// Text of the failing statement.
        statement: String,
        /// 0-based index of the failing statement.
        index: usize,
        /// Location of the offending token within the source.
        span: Span,
        /// Additional detail.
        detail: String,
    },

    /// A configurable resource limit was exceeded.
    ResourceLimitExceeded {
        /// Human-readable name of the resource (e.g. "statements").
        resource: String,
        /// The configured limit that was exceeded.
        limit: usize,
    },

    /// Layout did not converge within the allowed number of passes.
    RelaxationLimit {
        /// Maximum number of passes allowed.
        max: usize,
    },

    /// The engine has been closed.
    Closed,
}

impl Error {
    /// Native cause for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Open { cause, .. }
            | Error::SetOption { cause, .. }
            | Error::Assemble { cause, .. } => *cause,
            Error::ResourceLimitExceeded { .. } => ErrorCode::NoMem,
            Error::RelaxationLimit { .. } => ErrorCode::FragmentInvalid,
            Error::Closed => ErrorCode::Handle,
        }
    }

    /// Text of the failing statement, for assemble errors.
    #[must_use]
    pub fn statement(&self) -> Option<&str> {
        match self {
            Error::Assemble { statement, .. } => Some(statement),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Open { cause, arch, mode } => {
                write!(f, "cannot open {} engine with mode {}: {}", arch, mode, cause)
            }
            Error::SetOption {
                cause,
                option,
                value,
            } => {
                write!(f, "cannot set option {} to {}: {}", option, value, cause)
            }
            Error::Assemble {
                cause,
                statement,
                span,
                detail,
                ..
            } => {
                if detail.is_empty() {
                    write!(f, "{}: {} in '{}'", span, cause, statement)
                } else {
                    write!(f, "{}: {}: {} in '{}'", span, cause, detail, statement)
                }
            }
            Error::ResourceLimitExceeded { resource, limit } => {
                write!(
                    f,
                    "resource limit exceeded: {} (limit: {})",
                    resource, limit
                )
            }
            Error::RelaxationLimit { max } => {
                write!(
                    f,
                    "assembly exceeded maximum of {} layout passes (possible oscillation)",
                    max
                )
            }
            Error::Closed => f.write_str("engine is closed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Statement-level failure raised by the lexer, parser, symbol table and
/// encoders. The engine attaches the statement text and index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
    pub code: ErrorCode,
    pub detail: String,
    pub span: Span,
}

impl Fault {
    pub(crate) fn new(code: ErrorCode, detail: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            detail: detail.into(),
            span,
        }
    }

    pub(crate) fn operand(detail: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorCode::InvalidOperand, detail, span)
    }

    pub(crate) fn mnemonic(mnemonic: &str, arch: &str, span: Span) -> Self {
        Self::new(
            ErrorCode::MnemonicFail,
            format!("unknown mnemonic '{}' for {}", mnemonic, arch),
            span,
        )
    }

    pub(crate) fn range(value: i128, min: i128, max: i128, span: Span) -> Self {
        Self::new(
            ErrorCode::FixupInvalid,
            format!("value {} out of range [{}..{}]", value, min, max),
            span,
        )
    }
}
