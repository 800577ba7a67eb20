//! Statement splitter.
//!
//! Partitions source text into statements on `;` and newline, respecting
//! string and character literals, and blanks out comments. Each statement
//! keeps the position of its first non-blank byte so diagnostics can point
//! into the caller's text.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::Arch;
use crate::error::{ErrorCode, Fault, Span};

/// One non-empty statement cut from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceStatement {
    /// Statement text with comments blanked out and surrounding whitespace trimmed.
    pub text: String,
    /// 1-based line of the first byte.
    pub line: u32,
    /// 1-based column of the first byte.
    pub col: u32,
    /// Byte offset of the first byte.
    pub offset: usize,
}

/// Comment introducers that run to end of line, per architecture.
fn line_comment_char(arch: Arch) -> Option<u8> {
    match arch {
        Arch::X86 => Some(b'#'),
        Arch::Arm => Some(b'@'),
        _ => None,
    }
}

/// Split `source` into statements.
///
/// Block comments may span lines; an unterminated `/*` is an error.
pub(crate) fn split(source: &str, arch: Arch) -> Result<Vec<SourceStatement>, Fault> {
    let bytes = source.as_bytes();
    let line_comment = line_comment_char(arch);
    let mut out = Vec::new();

    // Current statement buffer and where it started.
    let mut buf: Vec<u8> = Vec::new();
    let mut start: Option<(u32, u32, usize)> = None;

    let mut pos = 0usize;
    let mut line: u32 = 1;
    let mut col: u32 = 1;
    let mut quote: Option<u8> = None;

    while pos < bytes.len() {
        let ch = bytes[pos];

        if let Some(q) = quote {
            buf.push(ch);
            if ch == b'\\' && pos + 1 < bytes.len() && bytes[pos + 1] != b'\n' {
                buf.push(bytes[pos + 1]);
                pos += 2;
                col += 2;
                continue;
            }
            if ch == q {
                quote = None;
            }
            if ch == b'\n' {
                // Let the lexer report the unterminated literal.
                quote = None;
                buf.pop();
                flush(&mut out, &mut buf, &mut start);
                pos += 1;
                line += 1;
                col = 1;
                continue;
            }
            pos += 1;
            col += 1;
            continue;
        }

        match ch {
            b'\n' | b';' => {
                flush(&mut out, &mut buf, &mut start);
                pos += 1;
                if ch == b'\n' {
                    line += 1;
                    col = 1;
                } else {
                    col += 1;
                }
                continue;
            }
            b'"' | b'\'' => {
                quote = Some(ch);
            }
            b'/' if bytes.get(pos + 1) == Some(&b'/') => {
                pos = skip_to_eol(bytes, pos);
                col = 1 + column_of(bytes, pos);
                continue;
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                let (open_line, open_col, open_pos) = (line, col, pos);
                pos += 2;
                col += 2;
                loop {
                    if pos + 1 >= bytes.len() {
                        return Err(Fault::new(
                            ErrorCode::TokenInvalid,
                            "unterminated block comment",
                            Span::new(open_line, open_col, open_pos, 2),
                        ));
                    }
                    if bytes[pos] == b'*' && bytes[pos + 1] == b'/' {
                        pos += 2;
                        col += 2;
                        break;
                    }
                    if bytes[pos] == b'\n' {
                        line += 1;
                        col = 1;
                    } else {
                        col += 1;
                    }
                    pos += 1;
                }
                if start.is_some() {
                    buf.push(b' ');
                }
                continue;
            }
            c if Some(c) == line_comment => {
                pos = skip_to_eol(bytes, pos);
                col = 1 + column_of(bytes, pos);
                continue;
            }
            _ => {}
        }

        if start.is_none() {
            if ch.is_ascii_whitespace() {
                pos += 1;
                col += 1;
                continue;
            }
            start = Some((line, col, pos));
        }
        buf.push(ch);
        pos += 1;
        col += 1;
    }
    flush(&mut out, &mut buf, &mut start);
    Ok(out)
}

fn flush(
    out: &mut Vec<SourceStatement>,
    buf: &mut Vec<u8>,
    start: &mut Option<(u32, u32, usize)>,
) {
    if let Some((line, col, offset)) = start.take() {
        let text = String::from_utf8_lossy(buf);
        let text = text.trim_end();
        if !text.is_empty() {
            out.push(SourceStatement {
                text: String::from(text),
                line,
                col,
                offset,
            });
        }
    }
    buf.clear();
}

fn skip_to_eol(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos] != b'\n' {
        pos += 1;
    }
    pos
}

fn column_of(bytes: &[u8], pos: usize) -> u32 {
    let line_start = bytes[..pos]
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    (pos - line_start) as u32
}
