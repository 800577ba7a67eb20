//! Label resolution, branch relaxation and final layout.
//!
//! One assemble call runs the pipeline below over the whole source:
//!
//! 1. split into statements and parse each one,
//! 2. declare every label and constant so forward references resolve,
//! 3. run lenient layout passes, placing labels at the running address and
//!    promoting relaxable branches whose short form does not reach,
//! 4. once labels and promotions are stable, run one strict pass that
//!    range-checks every field and emits the bytes.
//!
//! Promotion is monotonic (a long branch never shrinks back), which is the
//! Szymanski argument for convergence: each pass either changes nothing or
//! grows at least one statement, and no statement grows twice.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::{Arch, Mode, ModeFlags};
use crate::encoder::{any_range, encode_instruction, EncodeCtx};
use crate::engine::ResourceLimits;
use crate::error::{Error, ErrorCode, Fault, Span};
use crate::ir::*;
use crate::option::SyntaxOption;
use crate::parser::{parse_statement, ParseContext};
use crate::splitter::{split, SourceStatement};
use crate::symbols::{SymbolResolver, SymbolTable};

/// What the engine hands to one assemble call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target {
    pub arch: Arch,
    pub mode: ModeFlags,
    pub syntax: SyntaxOption,
}

impl Target {
    fn x86_bits(&self) -> u8 {
        if self.mode.contains(Mode::Mode16) {
            16
        } else if self.mode.contains(Mode::Mode64) {
            64
        } else {
            32
        }
    }

    fn thumb(&self) -> bool {
        self.arch == Arch::Arm && self.mode.contains(Mode::Thumb)
    }
}

/// Output of a successful layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Layout {
    pub bytes: Vec<u8>,
    pub statement_count: usize,
    pub labels: BTreeMap<String, u64>,
}

/// A statement with its parse result.
struct Unit {
    source: SourceStatement,
    parsed: ParsedStatement,
}

impl Unit {
    fn span(&self) -> Span {
        Span::new(
            self.source.line,
            self.source.col,
            self.source.offset,
            self.source.text.len(),
        )
    }

    /// Attach this statement's text, index and position to `fault`.
    fn error(&self, index: usize, fault: Fault) -> Error {
        let span = if fault.span == Span::dummy() {
            self.span()
        } else {
            fault
                .span
                .rebase(self.source.line, self.source.col, self.source.offset)
        };
        Error::Assemble {
            cause: fault.code,
            statement: self.source.text.clone(),
            index,
            span,
            detail: fault.detail,
        }
    }
}

/// Assemble `source` at `base`.
pub(crate) fn assemble(
    source: &str,
    base: u64,
    target: Target,
    limits: &ResourceLimits,
    resolver: Option<&mut (dyn SymbolResolver + Send)>,
) -> Result<Layout, Error> {
    let statements = split(source, target.arch).map_err(|fault| split_error(source, fault))?;
    if statements.len() > limits.max_statements {
        return Err(Error::ResourceLimitExceeded {
            resource: String::from("statements"),
            limit: limits.max_statements,
        });
    }

    let mut pctx = ParseContext {
        arch: target.arch,
        dialect: target.syntax.dialect,
        radix16: target.syntax.radix16,
    };
    let units: Vec<Unit> = statements
        .into_iter()
        .map(|source| {
            let parsed = parse_statement(&source.text, &mut pctx);
            Unit { source, parsed }
        })
        .collect();

    let mut symbols = SymbolTable::new(resolver, limits.max_symbol_depth);
    // A declaration failure stays attached to its statement so the first
    // failure in source order is the one reported.
    let mut declared: Vec<Option<Fault>> = Vec::with_capacity(units.len());
    for unit in &units {
        declared.push(declare(&mut symbols, &unit.parsed).err());
    }

    let mut layout = Layouter {
        target,
        base,
        limits,
        units: &units,
        declared: &declared,
        long: vec![false; units.len()],
    };
    let mut ctx = EncodeCtx::new(
        symbols,
        target.x86_bits(),
        target.thumb(),
        target.mode.is_big_endian(),
    );

    let mut previous = ctx.symbols.label_addresses();
    let mut converged = false;
    for pass in 0..limits.max_passes {
        let promoted = layout.pass(&mut ctx, None)?;
        let labels = ctx.symbols.label_addresses();
        let stable = !promoted && labels == previous;
        tracing::trace!(pass, promoted, stable, "layout pass");
        previous = labels;
        // The first pass places labels for the first time, so it can only
        // confirm stability from the second pass on.
        if stable && pass > 0 {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(Error::RelaxationLimit {
            max: limits.max_passes,
        });
    }

    let mut bytes = Vec::new();
    ctx.strict = true;
    layout.pass(&mut ctx, Some(&mut bytes))?;

    let statement_count = units
        .iter()
        .filter(|u| matches!(u.parsed.body, Some(Ok(_))))
        .count();
    Ok(Layout {
        bytes,
        statement_count,
        labels: previous.into_iter().collect(),
    })
}

fn declare(symbols: &mut SymbolTable<'_>, parsed: &ParsedStatement) -> Result<(), Fault> {
    for (name, span) in &parsed.labels {
        symbols.declare_label(name, *span)?;
    }
    if let Some(Ok(Body::Constant { name, expr, span })) = &parsed.body {
        symbols.declare_constant(name, expr.clone(), *span)?;
    }
    Ok(())
}

/// A splitter failure has no statement yet; report the offending line.
fn split_error(source: &str, fault: Fault) -> Error {
    let statement = source
        .get(fault.span.offset..)
        .and_then(|rest| rest.lines().next())
        .unwrap_or_default();
    Error::Assemble {
        cause: fault.code,
        statement: String::from(statement.trim()),
        index: 0,
        span: fault.span,
        detail: fault.detail,
    }
}

struct Layouter<'a> {
    target: Target,
    base: u64,
    limits: &'a ResourceLimits,
    units: &'a [Unit],
    declared: &'a [Option<Fault>],
    /// Per statement: promoted to the long form of a relaxable branch.
    long: Vec<bool>,
}

impl Layouter<'_> {
    /// Lay out every statement once. Returns whether a branch was promoted.
    ///
    /// With `out`, the encoded bytes are appended to it.
    fn pass(&mut self, ctx: &mut EncodeCtx<'_>, mut out: Option<&mut Vec<u8>>) -> Result<bool, Error> {
        ctx.x86_bits = self.target.x86_bits();
        ctx.thumb = self.target.thumb();
        let mut addr = self.base;
        let mut size: usize = 0;
        let mut promoted = false;
        let mut data = Vec::new();

        for (index, unit) in self.units.iter().enumerate() {
            for (name, _) in &unit.parsed.labels {
                ctx.symbols.place_label(name, addr);
            }
            if let Some(fault) = &self.declared[index] {
                return Err(unit.error(index, fault.clone()));
            }
            let body = match &unit.parsed.body {
                None => continue,
                Some(Err(fault)) => return Err(unit.error(index, fault.clone())),
                Some(Ok(body)) => body,
            };

            ctx.addr = addr;
            data.clear();
            match body {
                Body::Instruction(instr) => {
                    ctx.long = self.long[index];
                    ctx.wants_long = false;
                    let bytes = encode_instruction(self.target.arch, instr, ctx)
                        .map_err(|fault| unit.error(index, fault))?;
                    if ctx.wants_long && !self.long[index] {
                        self.long[index] = true;
                        promoted = true;
                    }
                    data.extend_from_slice(&bytes);
                }
                Body::Directive(directive) => {
                    self.directive(ctx, directive, addr, size, &mut data)
                        .map_err(|fault| unit.error(index, fault))?;
                }
                Body::Constant { .. } => {}
            }

            size += data.len();
            if size > self.limits.max_output_bytes {
                return Err(output_limit(self.limits));
            }
            if let Some(out) = out.as_deref_mut() {
                out.extend_from_slice(&data);
            }
            addr = addr.wrapping_add(data.len() as u64);
        }
        Ok(promoted)
    }

    fn directive(
        &self,
        ctx: &mut EncodeCtx<'_>,
        directive: &Directive,
        addr: u64,
        size: usize,
        data: &mut Vec<u8>,
    ) -> Result<(), Fault> {
        match directive {
            Directive::Data { size: width, values } => {
                let width = usize::from(*width);
                for value in values {
                    match value {
                        DataValue::Bytes(bytes) => data.extend_from_slice(bytes),
                        DataValue::Expr(expr, span) => {
                            let range = if width == 8 {
                                (i128::from(i64::MIN), i128::from(u64::MAX))
                            } else {
                                any_range(8 * width as u32)
                            };
                            let v = ctx.eval_in(expr, range, *span)? as u64;
                            if ctx.big_endian {
                                data.extend_from_slice(&v.to_be_bytes()[8 - width..]);
                            } else {
                                data.extend_from_slice(&v.to_le_bytes()[..width]);
                            }
                        }
                    }
                }
            }
            Directive::Bytes(bytes) => data.extend_from_slice(bytes),
            Directive::Align {
                kind,
                amount,
                fill,
                span,
            } => {
                let n = ctx.eval_in(amount, (0, i128::from(u32::MAX)), *span)?;
                let align = match kind {
                    AlignKind::Bytes => n.max(1),
                    AlignKind::Pow2 if n < 32 => 1 << n,
                    AlignKind::Pow2 => return Err(value_range(*span, "alignment too large")),
                };
                if align & (align - 1) != 0 {
                    return Err(value_range(*span, "alignment must be a power of two"));
                }
                let pad = (align - i128::from(addr) % align) % align;
                let byte = self.fill(ctx, fill.as_ref(), *span)?;
                self.reserve(size, pad as usize)?;
                data.resize(pad as usize, byte);
            }
            Directive::Space { size: count, fill, span } => {
                let n = ctx.eval_in(count, (0, i128::from(u32::MAX)), *span)?;
                let byte = self.fill(ctx, fill.as_ref(), *span)?;
                self.reserve(size, n as usize)?;
                data.resize(n as usize, byte);
            }
            Directive::Mode(mode) => match (self.target.arch, mode) {
                (Arch::X86, CodeMode::X86(bits)) => ctx.x86_bits = *bits,
                (Arch::Arm, CodeMode::Arm) => ctx.thumb = false,
                (Arch::Arm, CodeMode::Thumb) => ctx.thumb = true,
                _ => {
                    return Err(Fault::new(
                        ErrorCode::DirectiveUnknown,
                        format!("mode switch not available for {}", self.target.arch),
                        Span::dummy(),
                    ))
                }
            },
            Directive::Nop => {}
        }
        Ok(())
    }

    /// Padding byte: explicit fill or the architecture default.
    fn fill(&self, ctx: &mut EncodeCtx<'_>, fill: Option<&Expr>, span: Span) -> Result<u8, Fault> {
        match fill {
            Some(expr) => Ok(ctx.eval_in(expr, any_range(8), span)? as u8),
            None if self.target.arch == Arch::X86 => Ok(0x90),
            None => Ok(0),
        }
    }

    /// Refuse to allocate past the output limit.
    fn reserve(&self, size: usize, extra: usize) -> Result<(), Fault> {
        if size.saturating_add(extra) > self.limits.max_output_bytes {
            return Err(Fault::new(
                ErrorCode::NoMem,
                format!(
                    "output would exceed {} bytes",
                    self.limits.max_output_bytes
                ),
                Span::dummy(),
            ));
        }
        Ok(())
    }
}

fn value_range(span: Span, detail: &str) -> Fault {
    Fault::new(ErrorCode::DirectiveValueRange, detail, span)
}

fn output_limit(limits: &ResourceLimits) -> Error {
    Error::ResourceLimitExceeded {
        resource: String::from("output bytes"),
        limit: limits.max_output_bytes,
    }
}
