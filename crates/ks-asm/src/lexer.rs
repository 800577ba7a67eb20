//! Lexer for a single assembly statement.
//!
//! The lexer tokenizes one statement (already cut by the
//! [splitter](crate::splitter)) into [`Token`]s, each carrying its
//! [`Span`] relative to the statement so that error messages can point
//! back to the exact location in the caller's input.

use alloc::borrow::Cow;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::str;

use crate::error::{ErrorCode, Fault, Span};

/// A token produced by the lexer.
///
/// Token text is borrowed from the statement in the common case. String
/// literals with escape sequences are the only tokens that own their text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token<'src> {
    /// Token classification.
    pub kind: TokenKind,
    /// Source text of the token.
    pub text: Cow<'src, str>,
    /// Statement-relative location.
    pub span: Span,
}

/// The type of a token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Mnemonic, register name or symbol reference.
    Ident,
    /// Integer literal.
    Number(i128),
    /// String literal; the token text holds the unescaped bytes as UTF-8.
    StringLit(Vec<u8>),
    /// Character literal (`'A'`).
    CharLit(u8),
    /// Dot-prefixed name (`.byte`, `.Lloop`).
    Directive,
    /// Label definition (`name:`); the text excludes the colon.
    LabelDef,
    /// Lone `.` (current address).
    Dot,
    /// `,`
    Comma,
    /// `[`
    OpenBracket,
    /// `]`
    CloseBracket,
    /// `{`
    OpenBrace,
    /// `}`
    CloseBrace,
    /// `(`
    OpenParen,
    /// `)`
    CloseParen,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`: AT&T register prefix or remainder.
    Percent,
    /// `:` (segment override)
    Colon,
    /// `=` (constant assignment)
    Equals,
    /// `!` (ARM writeback)
    Bang,
    /// `$`: AT&T immediate prefix or Intel current address.
    Dollar,
    /// `#` (ARM immediate prefix)
    Hash,
    /// `&`
    Ampersand,
    /// `|`
    Pipe,
    /// `^`
    Caret,
    /// `~`
    Tilde,
    /// `<<`
    LShift,
    /// `>>`
    RShift,
    /// End of statement.
    Eof,
}

/// Number reading options.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LexOptions {
    /// Bare numbers are hexadecimal.
    pub radix16: bool,
}

const SEGMENT_REGS: [&str; 6] = ["cs", "ds", "es", "fs", "gs", "ss"];

/// Tokenize one statement.
///
/// # Errors
///
/// `TokenInvalid` for an unexpected character or malformed number,
/// `EscSequence` for a bad escape and `EscStr` for an unterminated literal.
pub(crate) fn tokenize(source: &str, opts: LexOptions) -> Result<Vec<Token<'_>>, Fault> {
    let mut tokens = Vec::with_capacity(source.len() / 3 + 1);
    let bytes = source.as_bytes();
    let len = bytes.len();
    let mut pos = 0;

    let span = |start: usize, end: usize| Span::new(1, start as u32 + 1, start, end - start);
    let punct = |s: &'static str| Cow::Borrowed(s);

    while pos < len {
        let ch = bytes[pos];

        if ch.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let single = match ch {
            b',' => Some((TokenKind::Comma, ",")),
            b'[' => Some((TokenKind::OpenBracket, "[")),
            b']' => Some((TokenKind::CloseBracket, "]")),
            b'{' => Some((TokenKind::OpenBrace, "{")),
            b'}' => Some((TokenKind::CloseBrace, "}")),
            b'(' => Some((TokenKind::OpenParen, "(")),
            b')' => Some((TokenKind::CloseParen, ")")),
            b'+' => Some((TokenKind::Plus, "+")),
            b'-' => Some((TokenKind::Minus, "-")),
            b'*' => Some((TokenKind::Star, "*")),
            b'/' => Some((TokenKind::Slash, "/")),
            b'%' => Some((TokenKind::Percent, "%")),
            b':' => Some((TokenKind::Colon, ":")),
            b'=' => Some((TokenKind::Equals, "=")),
            b'!' => Some((TokenKind::Bang, "!")),
            b'$' => Some((TokenKind::Dollar, "$")),
            b'#' => Some((TokenKind::Hash, "#")),
            b'&' => Some((TokenKind::Ampersand, "&")),
            b'|' => Some((TokenKind::Pipe, "|")),
            b'^' => Some((TokenKind::Caret, "^")),
            b'~' => Some((TokenKind::Tilde, "~")),
            _ => None,
        };
        if let Some((kind, text)) = single {
            tokens.push(Token {
                kind,
                text: punct(text),
                span: span(pos, pos + 1),
            });
            pos += 1;
            continue;
        }

        // Shift operators
        if (ch == b'<' || ch == b'>') && bytes.get(pos + 1) == Some(&ch) {
            let (kind, text) = if ch == b'<' {
                (TokenKind::LShift, "<<")
            } else {
                (TokenKind::RShift, ">>")
            };
            tokens.push(Token {
                kind,
                text: punct(text),
                span: span(pos, pos + 2),
            });
            pos += 2;
            continue;
        }

        // String literal
        if ch == b'"' {
            let start = pos;
            pos += 1;
            let mut content = Vec::new();
            loop {
                if pos >= len {
                    return Err(Fault::new(
                        ErrorCode::EscStr,
                        "unterminated string literal",
                        span(start, pos),
                    ));
                }
                match bytes[pos] {
                    b'"' => break,
                    b'\\' => content.push(read_escape(bytes, &mut pos)?),
                    b => {
                        content.push(b);
                        pos += 1;
                    }
                }
            }
            pos += 1;
            let text = Cow::Owned(String::from_utf8_lossy(&content).into_owned());
            tokens.push(Token {
                kind: TokenKind::StringLit(content),
                text,
                span: span(start, pos),
            });
            continue;
        }

        // Character literal
        if ch == b'\'' {
            let start = pos;
            pos += 1;
            let value = match bytes.get(pos) {
                None => {
                    return Err(Fault::new(
                        ErrorCode::EscStr,
                        "unterminated character literal",
                        span(start, pos),
                    ))
                }
                Some(&b'\\') => read_escape(bytes, &mut pos)?,
                Some(&b) => {
                    pos += 1;
                    b
                }
            };
            if bytes.get(pos) != Some(&b'\'') {
                return Err(Fault::new(
                    ErrorCode::EscStr,
                    "unterminated character literal",
                    span(start, pos),
                ));
            }
            pos += 1;
            tokens.push(Token {
                kind: TokenKind::CharLit(value),
                text: Cow::Borrowed(str::from_utf8(&bytes[start..pos]).unwrap_or("'?'")),
                span: span(start, pos),
            });
            continue;
        }

        // Directive, local label or lone dot
        if ch == b'.' {
            let start = pos;
            pos += 1;
            while pos < len && is_ident_byte(bytes[pos]) {
                pos += 1;
            }
            let text = Cow::Borrowed(str::from_utf8(&bytes[start..pos]).unwrap_or("."));
            if pos == start + 1 {
                tokens.push(Token {
                    kind: TokenKind::Dot,
                    text,
                    span: span(start, pos),
                });
                continue;
            }
            if bytes.get(pos) == Some(&b':') && only_labels(&tokens) {
                tokens.push(Token {
                    kind: TokenKind::LabelDef,
                    text,
                    span: span(start, pos + 1),
                });
                pos += 1;
                continue;
            }
            tokens.push(Token {
                kind: TokenKind::Directive,
                text,
                span: span(start, pos),
            });
            continue;
        }

        // Number
        if ch.is_ascii_digit() {
            let start = pos;
            while pos < len && bytes[pos].is_ascii_alphanumeric() {
                pos += 1;
            }
            let text = str::from_utf8(&bytes[start..pos]).unwrap_or("");
            let value = parse_number(text, opts).ok_or_else(|| {
                Fault::new(
                    ErrorCode::TokenInvalid,
                    format!("invalid number '{}'", text),
                    span(start, pos),
                )
            })?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                text: Cow::Borrowed(text),
                span: span(start, pos),
            });
            continue;
        }

        // Identifier, keyword or label definition
        if ch.is_ascii_alphabetic() || ch == b'_' || ch == b'@' {
            let start = pos;
            while pos < len && is_ident_byte(bytes[pos]) {
                pos += 1;
            }
            let text = Cow::Borrowed(str::from_utf8(&bytes[start..pos]).unwrap_or(""));

            // `name:` defines a label, except segment overrides (`fs:`) and
            // anything after the first non-label token.
            let is_segment = SEGMENT_REGS.iter().any(|s| text.eq_ignore_ascii_case(s));
            if bytes.get(pos) == Some(&b':')
                && bytes.get(pos + 1) != Some(&b':')
                && !is_segment
                && only_labels(&tokens)
            {
                tokens.push(Token {
                    kind: TokenKind::LabelDef,
                    text,
                    span: span(start, pos + 1),
                });
                pos += 1;
                continue;
            }
            tokens.push(Token {
                kind: TokenKind::Ident,
                text,
                span: span(start, pos),
            });
            continue;
        }

        return Err(Fault::new(
            ErrorCode::TokenInvalid,
            format!("unexpected character '{}'", char::from(ch)),
            span(pos, pos + 1),
        ));
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        text: Cow::Borrowed(""),
        span: span(len, len),
    });
    Ok(tokens)
}

/// Labels may only be defined before the first non-label token.
fn only_labels(tokens: &[Token<'_>]) -> bool {
    tokens.iter().all(|t| t.kind == TokenKind::LabelDef)
}

#[inline]
fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'@'
}

/// Read a backslash escape at `pos` (pointing at `\`), advancing past it.
fn read_escape(bytes: &[u8], pos: &mut usize) -> Result<u8, Fault> {
    let start = *pos;
    let esc_span = |end: usize| Span::new(1, start as u32 + 1, start, end - start);
    let Some(&c) = bytes.get(start + 1) else {
        return Err(Fault::new(
            ErrorCode::EscStr,
            "unterminated escape sequence",
            esc_span(start + 1),
        ));
    };
    *pos = start + 2;
    let value = match c {
        b'n' => b'\n',
        b't' => b'\t',
        b'r' => b'\r',
        b'b' => 0x08,
        b'f' => 0x0C,
        b'\\' => b'\\',
        b'"' => b'"',
        b'\'' => b'\'',
        b'x' | b'X' => {
            let mut value: u32 = 0;
            let mut digits = 0;
            while let Some(d) = bytes.get(*pos).and_then(|&b| hex_digit(b)) {
                value = (value << 4) | u32::from(d);
                digits += 1;
                *pos += 1;
                if digits == 2 {
                    break;
                }
            }
            if digits == 0 {
                return Err(Fault::new(
                    ErrorCode::EscSequence,
                    "invalid \\x escape sequence",
                    esc_span(*pos),
                ));
            }
            value as u8
        }
        b'0'..=b'7' => {
            let mut value: u32 = u32::from(c - b'0');
            let mut digits = 1;
            while digits < 3 {
                match bytes.get(*pos) {
                    Some(&d @ b'0'..=b'7') => {
                        value = (value << 3) | u32::from(d - b'0');
                        *pos += 1;
                        digits += 1;
                    }
                    _ => break,
                }
            }
            if value > 0xFF {
                return Err(Fault::new(
                    ErrorCode::EscSequence,
                    "octal escape out of range",
                    esc_span(*pos),
                ));
            }
            value as u8
        }
        other => {
            return Err(Fault::new(
                ErrorCode::EscSequence,
                format!("unknown escape sequence '\\{}'", char::from(other)),
                esc_span(*pos),
            ));
        }
    };
    Ok(value)
}

/// Parse an alphanumeric run that starts with a digit.
///
/// Accepts `0x`/`0b`/`0o` prefixes, an `h` suffix, and bare hexadecimal
/// under radix 16.
fn parse_number(text: &str, opts: LexOptions) -> Option<i128> {
    let lower = text.as_bytes();
    let radix_of = |prefix: u8| match prefix {
        b'x' | b'X' => Some(16),
        b'b' | b'B' if !opts.radix16 => Some(2),
        b'o' | b'O' => Some(8),
        _ => None,
    };
    if lower.len() > 2 && lower[0] == b'0' {
        if let Some(radix) = radix_of(lower[1]) {
            return i128::from_str_radix(&text[2..], radix).ok();
        }
    }
    if let Some(body) = text.strip_suffix(['h', 'H']) {
        if !body.is_empty() && body.bytes().all(|b| b.is_ascii_hexdigit()) {
            return i128::from_str_radix(body, 16).ok();
        }
    }
    let radix = if opts.radix16 { 16 } else { 10 };
    i128::from_str_radix(text, radix).ok()
}

#[inline]
fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src, LexOptions::default())
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn number(src: &str, radix16: bool) -> i128 {
        match tokenize(src, LexOptions { radix16 }).unwrap()[0].kind {
            TokenKind::Number(n) => n,
            ref other => panic!("expected number, got {:?}", other),
        }
    }

    #[test]
    fn empty_statement() {
        assert_eq!(kinds(""), [TokenKind::Eof]);
    }

    #[test]
    fn simple_instruction() {
        assert_eq!(
            kinds("mov eax, [ebx+4]"),
            [
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Comma,
                TokenKind::OpenBracket,
                TokenKind::Ident,
                TokenKind::Plus,
                TokenKind::Number(4),
                TokenKind::CloseBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn number_forms() {
        assert_eq!(number("0x1F", false), 31);
        assert_eq!(number("0b101", false), 5);
        assert_eq!(number("0o17", false), 15);
        assert_eq!(number("0FFh", false), 255);
        assert_eq!(number("10", false), 10);
        assert_eq!(number("10", true), 16);
        assert_eq!(number("0b1", true), 0xb1);
        assert_eq!(number("1f", true), 0x1f);
    }

    #[test]
    fn invalid_number() {
        let err = tokenize("12zz", LexOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenInvalid);
        assert_eq!(err.span.len, 4);
    }

    #[test]
    fn labels_only_at_start() {
        let toks = tokenize("a: b: nop", LexOptions::default()).unwrap();
        assert_eq!(toks[0].kind, TokenKind::LabelDef);
        assert_eq!(toks[0].text, "a");
        assert_eq!(toks[1].kind, TokenKind::LabelDef);
        assert_eq!(toks[2].kind, TokenKind::Ident);
    }

    #[test]
    fn segment_override_is_not_label() {
        assert_eq!(
            kinds("fs:"),
            [TokenKind::Ident, TokenKind::Colon, TokenKind::Eof]
        );
    }

    #[test]
    fn local_label_and_dot() {
        let toks = tokenize(".Lloop: b .", LexOptions::default()).unwrap();
        assert_eq!(toks[0].kind, TokenKind::LabelDef);
        assert_eq!(toks[0].text, ".Lloop");
        assert_eq!(toks[2].kind, TokenKind::Dot);
    }

    #[test]
    fn string_escapes() {
        let toks = tokenize(r#".ascii "a\n\x41\101\"""#, LexOptions::default()).unwrap();
        assert_eq!(
            toks[1].kind,
            TokenKind::StringLit(vec![b'a', b'\n', b'A', b'A', b'"'])
        );
    }

    #[test]
    fn string_errors() {
        let err = tokenize(r#".ascii "abc"#, LexOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::EscStr);
        let err = tokenize(r#".ascii "\q""#, LexOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::EscSequence);
    }

    #[test]
    fn char_literal() {
        assert_eq!(
            kinds("'A'"),
            [TokenKind::CharLit(b'A'), TokenKind::Eof]
        );
        assert_eq!(
            tokenize("'A", LexOptions::default()).unwrap_err().code,
            ErrorCode::EscStr
        );
    }

    #[test]
    fn shifts_and_operators() {
        assert_eq!(
            kinds("1<<2>>3"),
            [
                TokenKind::Number(1),
                TokenKind::LShift,
                TokenKind::Number(2),
                TokenKind::RShift,
                TokenKind::Number(3),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unexpected_character() {
        let err = tokenize("nop ?", LexOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenInvalid);
        assert_eq!(err.span.col, 5);
    }
}
