//! Multi-dialect statement parser.
//!
//! Converts the tokens of one statement into a [`ParsedStatement`]: its
//! labels plus an instruction, directive or constant definition.
//! Architecture-aware register parsing resolves naming conflicts (`sp` is an
//! x86 16-bit register, ARM r13 and the AArch64 stack pointer) and the
//! dialect picks the operand grammar: Intel (also NASM and MASM), AT&T
//! (also GAS on x86), or the ARM unified syntax.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::ToString;
use alloc::vec::Vec;

use crate::arch::Arch;
use crate::error::{ErrorCode, Fault, Span};
use crate::ir::*;
use crate::lexer::{tokenize, LexOptions, Token, TokenKind};
use crate::option::Syntax;

/// Parser state carried from one statement to the next within a call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParseContext {
    pub arch: Arch,
    pub dialect: Syntax,
    pub radix16: bool,
}

/// Parse one statement produced by the splitter.
pub(crate) fn parse_statement(text: &str, ctx: &mut ParseContext) -> ParsedStatement {
    let tokens = match tokenize(text, LexOptions { radix16: ctx.radix16 }) {
        Ok(tokens) => tokens,
        Err(fault) => {
            return ParsedStatement {
                labels: Vec::new(),
                body: Some(Err(fault)),
            }
        }
    };
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };

    let mut labels = Vec::new();
    while parser.peek().kind == TokenKind::LabelDef {
        let tok = parser.advance();
        if parser.register(&tok.text.to_ascii_lowercase()).is_some() {
            return ParsedStatement {
                labels,
                body: Some(Err(Fault::new(
                    ErrorCode::LabelInvalid,
                    format!("register name '{}' cannot be a label", tok.text),
                    tok.span,
                ))),
            };
        }
        labels.push((tok.text.to_string(), tok.span));
    }

    let body = if parser.at_end() {
        None
    } else {
        Some(parser.parse_body())
    };
    ParsedStatement { labels, body }
}

/// x86 mnemonics whose bare operand is a branch target rather than memory
/// in AT&T syntax.
fn is_x86_branch(mnemonic: &str) -> bool {
    mnemonic.starts_with('j') || mnemonic.starts_with("call") || mnemonic.starts_with("loop")
}

fn size_keyword(name: &str) -> Option<u8> {
    match name {
        "byte" => Some(1),
        "word" => Some(2),
        "dword" => Some(4),
        "fword" => Some(6),
        "qword" => Some(8),
        "tbyte" | "tword" => Some(10),
        "oword" | "xmmword" => Some(16),
        _ => None,
    }
}

struct Parser<'t, 'c> {
    tokens: &'t [Token<'t>],
    pos: usize,
    ctx: &'c mut ParseContext,
}

impl<'t> Parser<'t, '_> {
    #[inline]
    fn peek(&self) -> &'t Token<'t> {
        self.peek_at(0)
    }

    #[inline]
    fn peek_at(&self, n: usize) -> &'t Token<'t> {
        let tokens = self.tokens;
        &tokens[(self.pos + n).min(tokens.len() - 1)]
    }

    #[inline]
    fn advance(&mut self) -> &'t Token<'t> {
        let tok = self.peek();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    #[inline]
    fn at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Span from token `start` through the last consumed token.
    fn span_from(&self, start: usize) -> Span {
        let first = self.tokens[start.min(self.tokens.len() - 1)].span;
        let last = self.tokens[self.pos.saturating_sub(1).max(start).min(self.tokens.len() - 1)].span;
        let end = (last.offset + last.len).max(first.offset);
        Span::new(first.line, first.col, first.offset, end - first.offset)
    }

    fn is_x86(&self) -> bool {
        self.ctx.arch == Arch::X86
    }

    fn is_att(&self) -> bool {
        self.is_x86() && self.ctx.dialect.is_att_family()
    }

    /// Register named `lower` on the current architecture.
    fn register(&self, lower: &str) -> Option<Register> {
        match self.ctx.arch {
            Arch::X86 => X86Reg::parse(lower).map(Register::X86),
            Arch::Arm => parse_arm_reg(lower).map(Register::Arm),
            Arch::Arm64 => A64Reg::parse(lower).map(Register::A64),
            _ => None,
        }
    }

    fn ident_register(&self, tok: &Token<'_>) -> Option<Register> {
        if tok.kind == TokenKind::Ident {
            self.register(&tok.text.to_ascii_lowercase())
        } else {
            None
        }
    }

    fn expect_end(&self, code: ErrorCode) -> Result<(), Fault> {
        if self.at_end() {
            Ok(())
        } else {
            let tok = self.peek();
            Err(Fault::new(
                code,
                format!("unexpected '{}'", tok.text),
                tok.span,
            ))
        }
    }

    // ── Statement bodies ─────────────────────────────────────────────

    fn parse_body(&mut self) -> Result<Body, Fault> {
        let tok = self.peek();
        match tok.kind {
            TokenKind::Directive => self.parse_directive(),
            TokenKind::Ident => {
                let next = self.peek_at(1);
                if next.kind == TokenKind::Equals
                    || (next.kind == TokenKind::Ident && next.text.eq_ignore_ascii_case("equ"))
                {
                    return self.parse_assignment();
                }
                let lower = tok.text.to_ascii_lowercase();
                if self.is_x86() {
                    let data_size = match lower.as_str() {
                        "db" => Some(1),
                        "dw" => Some(2),
                        "dd" => Some(4),
                        "dq" => Some(8),
                        _ => None,
                    };
                    if let Some(size) = data_size {
                        self.advance();
                        return self.parse_data(size);
                    }
                    if lower == "bits" || lower == "use16" || lower == "use32" || lower == "use64" {
                        return self.parse_bits(&lower);
                    }
                }
                self.parse_instruction()
            }
            _ => Err(Fault::new(
                ErrorCode::StatToken,
                format!("unexpected '{}' at start of statement", tok.text),
                tok.span,
            )),
        }
    }

    /// `name = expr` or `name equ expr`.
    fn parse_assignment(&mut self) -> Result<Body, Fault> {
        let name = self.advance();
        self.advance();
        let expr = self.parse_expr()?;
        self.expect_end(ErrorCode::DirectiveToken)?;
        Ok(Body::Constant {
            name: name.text.to_string(),
            expr,
            span: name.span,
        })
    }

    /// NASM `bits 16|32|64` and `use16`..`use64`.
    fn parse_bits(&mut self, keyword: &str) -> Result<Body, Fault> {
        let tok = self.advance();
        let bits = match keyword.strip_prefix("use") {
            Some(n) => n.parse::<i128>().unwrap_or(0),
            None => {
                let expr = self.parse_expr()?;
                expr.as_literal().ok_or_else(|| {
                    Fault::new(ErrorCode::DirectiveValueRange, "expected 16, 32 or 64", tok.span)
                })?
            }
        };
        self.expect_end(ErrorCode::DirectiveToken)?;
        match bits {
            16 | 32 | 64 => Ok(Body::Directive(Directive::Mode(CodeMode::X86(bits as u8)))),
            _ => Err(Fault::new(
                ErrorCode::DirectiveValueRange,
                format!("unsupported bit width {}", bits),
                tok.span,
            )),
        }
    }

    fn parse_instruction(&mut self) -> Result<Body, Fault> {
        let mut tok = self.advance();
        let mut mnemonic = tok.text.to_ascii_lowercase();
        let mut prefixes = Vec::new();
        if self.is_x86() {
            while let Some(prefix) = Prefix::parse(&mnemonic) {
                if self.peek().kind != TokenKind::Ident {
                    break;
                }
                prefixes.push(prefix);
                tok = self.advance();
                mnemonic = tok.text.to_ascii_lowercase();
            }
        }

        let mut operands = Vec::new();
        let mut spans = Vec::new();
        if !self.at_end() {
            loop {
                let start = self.pos;
                let op = self.parse_operand(&mnemonic)?;
                operands.push(op);
                spans.push(self.span_from(start));
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                if self.at_end() {
                    break;
                }
                let tok = self.peek();
                return Err(Fault::operand(
                    format!("unexpected '{}' after operand", tok.text),
                    tok.span,
                ));
            }
        }

        let att = self.is_att();
        if att {
            operands.reverse();
            spans.reverse();
        }
        Ok(Body::Instruction(Instruction {
            mnemonic,
            operands,
            spans,
            prefixes,
            att,
            span: tok.span,
        }))
    }

    fn parse_operand(&mut self, mnemonic: &str) -> Result<Operand, Fault> {
        match self.ctx.arch {
            Arch::X86 if self.is_att() => self.parse_att_operand(mnemonic),
            Arch::X86 => self.parse_intel_operand(),
            _ => self.parse_arm_operand(),
        }
    }

    // ── Intel operands ───────────────────────────────────────────────

    fn parse_intel_operand(&mut self) -> Result<Operand, Fault> {
        let mut size = None;
        let mut has_ptr = false;
        let tok = self.peek();
        if tok.kind == TokenKind::Ident {
            let lower = tok.text.to_ascii_lowercase();
            let next = &self.peek_at(1).kind;
            if let Some(s) = size_keyword(&lower) {
                if !matches!(next, TokenKind::Comma | TokenKind::Eof) {
                    self.advance();
                    size = Some(s);
                    if self.peek().kind == TokenKind::Ident
                        && self.peek().text.eq_ignore_ascii_case("ptr")
                    {
                        self.advance();
                        has_ptr = true;
                    }
                }
            }
        }
        let tok = self.peek();
        let bare = matches!(self.peek_at(1).kind, TokenKind::Comma | TokenKind::Eof);
        if tok.kind == TokenKind::Ident && !bare {
            let lower = tok.text.to_ascii_lowercase();
            if lower == "short" || lower == "near" {
                self.advance();
            } else if lower == "far" {
                return Err(Fault::operand("far operands are not supported", tok.span));
            }
        }

        if self.peek().kind == TokenKind::OpenBracket {
            return self.parse_intel_mem(size, None).map(Operand::Mem);
        }

        let tok = self.peek();
        if let Some(Register::X86(reg)) = self.ident_register(tok) {
            if reg.class == X86Class::Seg && self.peek_at(1).kind == TokenKind::Colon {
                self.advance();
                self.advance();
                if self.peek().kind == TokenKind::OpenBracket {
                    return self.parse_intel_mem(size, Some(reg)).map(Operand::Mem);
                }
                let disp = self.parse_expr()?;
                return Ok(Operand::Mem(X86Mem {
                    size,
                    seg: Some(reg),
                    scale: 1,
                    disp: Some(disp),
                    ..X86Mem::default()
                }));
            }
            self.advance();
            return Ok(Operand::Reg(Register::X86(reg)));
        }

        let expr = self.parse_expr()?;
        if has_ptr {
            // MASM `dword ptr label`
            return Ok(Operand::Mem(X86Mem {
                size,
                scale: 1,
                disp: Some(expr),
                ..X86Mem::default()
            }));
        }
        Ok(Operand::Imm(expr))
    }

    /// `[seg: base + index*scale + disp]`
    fn parse_intel_mem(&mut self, size: Option<u8>, seg: Option<X86Reg>) -> Result<X86Mem, Fault> {
        let open = self.advance();
        let mut mem = X86Mem {
            size,
            seg,
            scale: 1,
            ..X86Mem::default()
        };

        if let Some(Register::X86(reg)) = self.ident_register(self.peek()) {
            if reg.class == X86Class::Seg && self.peek_at(1).kind == TokenKind::Colon {
                self.advance();
                self.advance();
                mem.seg = Some(reg);
            }
        }

        let mut first = true;
        loop {
            let negate = match self.peek().kind {
                TokenKind::CloseBracket if !first => break,
                TokenKind::Plus => {
                    self.advance();
                    false
                }
                TokenKind::Minus => {
                    self.advance();
                    true
                }
                _ if first => false,
                _ => {
                    let tok = self.peek();
                    return Err(Fault::new(
                        ErrorCode::ExprBracket,
                        format!("unexpected '{}' in memory operand", tok.text),
                        tok.span,
                    ));
                }
            };
            first = false;

            let tok = self.peek();
            if let Some(Register::X86(reg)) = self.ident_register(tok) {
                if negate {
                    return Err(Fault::operand("cannot subtract a register", tok.span));
                }
                self.advance();
                if self.eat(&TokenKind::Star) {
                    let scale = self.parse_scale()?;
                    self.set_index(&mut mem, reg, scale, tok.span)?;
                } else if mem.base.is_none() {
                    mem.base = Some(reg);
                } else {
                    self.set_index(&mut mem, reg, 1, tok.span)?;
                }
                continue;
            }

            // `scale*reg`
            if matches!(tok.kind, TokenKind::Number(_))
                && self.peek_at(1).kind == TokenKind::Star
                && !negate
            {
                if let Some(Register::X86(reg)) = self.ident_register(self.peek_at(2)) {
                    let scale = self.parse_scale()?;
                    self.advance();
                    let reg_tok = self.advance();
                    self.set_index(&mut mem, reg, scale, reg_tok.span)?;
                    continue;
                }
            }

            let term = self.parse_mul()?;
            mem.disp = Some(match (mem.disp.take(), negate) {
                (None, false) => term,
                (None, true) => Expr::Neg(Box::new(term)),
                (Some(acc), false) => Expr::bin(BinOp::Add, acc, term),
                (Some(acc), true) => Expr::bin(BinOp::Sub, acc, term),
            });
        }

        if !self.eat(&TokenKind::CloseBracket) {
            return Err(Fault::new(
                ErrorCode::ExprBracket,
                "expected ']'",
                open.span,
            ));
        }
        Ok(mem)
    }

    fn parse_scale(&mut self) -> Result<u8, Fault> {
        let tok = self.peek();
        let value = self.parse_unary()?.as_literal();
        match value {
            Some(s @ (1 | 2 | 4 | 8)) => Ok(s as u8),
            _ => Err(Fault::operand("scale must be 1, 2, 4 or 8", tok.span)),
        }
    }

    fn set_index(&self, mem: &mut X86Mem, reg: X86Reg, scale: u8, span: Span) -> Result<(), Fault> {
        if mem.index.is_some() {
            return Err(Fault::operand("too many index registers", span));
        }
        mem.index = Some(reg);
        mem.scale = scale;
        Ok(())
    }

    // ── AT&T operands ────────────────────────────────────────────────

    fn parse_att_operand(&mut self, mnemonic: &str) -> Result<Operand, Fault> {
        let indirect = self.eat(&TokenKind::Star);
        match self.peek().kind {
            TokenKind::Dollar => {
                self.advance();
                Ok(Operand::Imm(self.parse_expr()?))
            }
            TokenKind::Percent => {
                let reg = self.parse_att_register()?;
                if reg.class == X86Class::Seg && self.eat(&TokenKind::Colon) {
                    return self.parse_att_mem(Some(reg)).map(Operand::Mem);
                }
                Ok(Operand::Reg(Register::X86(reg)))
            }
            _ if is_x86_branch(mnemonic) && !indirect && self.peek().kind != TokenKind::OpenParen => {
                Ok(Operand::Imm(self.parse_expr()?))
            }
            _ => self.parse_att_mem(None).map(Operand::Mem),
        }
    }

    fn parse_att_register(&mut self) -> Result<X86Reg, Fault> {
        let percent = self.advance();
        let tok = self.peek();
        match self.ident_register(tok) {
            Some(Register::X86(reg)) => {
                self.advance();
                Ok(reg)
            }
            _ => Err(Fault::operand(
                format!("invalid register name '{}'", tok.text),
                if tok.kind == TokenKind::Eof { percent.span } else { tok.span },
            )),
        }
    }

    /// `disp(base, index, scale)`
    fn parse_att_mem(&mut self, seg: Option<X86Reg>) -> Result<X86Mem, Fault> {
        let mut mem = X86Mem {
            seg,
            scale: 1,
            ..X86Mem::default()
        };
        let paren_follows = |p: &Self| {
            p.peek().kind == TokenKind::OpenParen
                && matches!(p.peek_at(1).kind, TokenKind::Percent | TokenKind::Comma)
        };
        if !paren_follows(self) {
            mem.disp = Some(self.parse_expr()?);
        }
        if paren_follows(self) {
            let open = self.advance();
            if self.peek().kind == TokenKind::Percent {
                mem.base = Some(self.parse_att_register()?);
            }
            if self.eat(&TokenKind::Comma) {
                mem.index = Some(self.parse_att_register()?);
                if self.eat(&TokenKind::Comma) {
                    mem.scale = self.parse_scale()?;
                }
            }
            if !self.eat(&TokenKind::CloseParen) {
                return Err(Fault::new(ErrorCode::ExprBracket, "expected ')'", open.span));
            }
        }
        Ok(mem)
    }

    // ── ARM / AArch64 operands ───────────────────────────────────────

    fn parse_arm_operand(&mut self) -> Result<Operand, Fault> {
        let tok = self.peek();
        match tok.kind {
            TokenKind::Hash => {
                self.advance();
                Ok(Operand::Imm(self.parse_expr()?))
            }
            TokenKind::OpenBracket => self.parse_arm_mem().map(Operand::ArmMem),
            TokenKind::OpenBrace => self.parse_reg_list(),
            TokenKind::Equals => Err(Fault::operand(
                "literal pool loads are not supported",
                tok.span,
            )),
            TokenKind::Ident => {
                let lower = tok.text.to_ascii_lowercase();
                if let Some(reg) = self.register(&lower) {
                    self.advance();
                    if self.eat(&TokenKind::Bang) {
                        return Ok(Operand::RegWriteback(reg));
                    }
                    return Ok(Operand::Reg(reg));
                }
                if let Some(kind) = ShiftKind::parse(&lower) {
                    self.advance();
                    return Ok(Operand::Shift(self.parse_shift_amount(kind)?));
                }
                Ok(Operand::Imm(self.parse_expr()?))
            }
            _ => Ok(Operand::Imm(self.parse_expr()?)),
        }
    }

    fn parse_shift_amount(&mut self, kind: ShiftKind) -> Result<Shift, Fault> {
        let amount = match self.peek().kind {
            TokenKind::Comma | TokenKind::Eof | TokenKind::CloseBracket => ShiftAmount::None,
            TokenKind::Hash => {
                self.advance();
                ShiftAmount::Imm(self.parse_expr()?)
            }
            _ => match self.ident_register(self.peek()) {
                Some(reg) => {
                    self.advance();
                    ShiftAmount::Reg(reg)
                }
                None => ShiftAmount::Imm(self.parse_expr()?),
            },
        };
        Ok(Shift { kind, amount })
    }

    /// `[base{, offset}]{!}`
    fn parse_arm_mem(&mut self) -> Result<ArmMem, Fault> {
        let open = self.advance();
        let tok = self.peek();
        let base = self.ident_register(tok).ok_or_else(|| {
            Fault::new(
                ErrorCode::ExprBracket,
                format!("expected base register, found '{}'", tok.text),
                tok.span,
            )
        })?;
        self.advance();

        let mut offset = ArmOffset::None;
        if self.eat(&TokenKind::Comma) {
            let subtract = self.peek().kind == TokenKind::Minus
                && self.ident_register(self.peek_at(1)).is_some();
            let plus = self.peek().kind == TokenKind::Plus
                && self.ident_register(self.peek_at(1)).is_some();
            if subtract || plus {
                self.advance();
            }
            offset = match self.ident_register(self.peek()) {
                Some(reg) => {
                    self.advance();
                    let mut shift = None;
                    if self.eat(&TokenKind::Comma) {
                        let tok = self.peek();
                        let kind = ShiftKind::parse(&tok.text.to_ascii_lowercase())
                            .filter(|_| tok.kind == TokenKind::Ident)
                            .ok_or_else(|| {
                                Fault::operand(format!("expected shift, found '{}'", tok.text), tok.span)
                            })?;
                        self.advance();
                        shift = Some(self.parse_shift_amount(kind)?);
                    }
                    ArmOffset::Reg {
                        reg,
                        subtract,
                        shift,
                    }
                }
                None => {
                    self.eat(&TokenKind::Hash);
                    ArmOffset::Imm(self.parse_expr()?)
                }
            };
        }

        if !self.eat(&TokenKind::CloseBracket) {
            return Err(Fault::new(ErrorCode::ExprBracket, "expected ']'", open.span));
        }
        let writeback = self.eat(&TokenKind::Bang);
        Ok(ArmMem {
            base,
            offset,
            writeback,
        })
    }

    /// `{r0, r4-r7, lr}`
    fn parse_reg_list(&mut self) -> Result<Operand, Fault> {
        let open = self.advance();
        if self.ctx.arch != Arch::Arm {
            return Err(Fault::operand("register lists are not supported here", open.span));
        }
        let mut mask: u16 = 0;
        loop {
            let tok = self.advance();
            let Some(Register::Arm(first)) = self.ident_register(tok) else {
                return Err(Fault::operand(
                    format!("expected register in list, found '{}'", tok.text),
                    tok.span,
                ));
            };
            let mut last = first;
            if self.eat(&TokenKind::Minus) {
                let tok = self.advance();
                match self.ident_register(tok) {
                    Some(Register::Arm(r)) if r >= first => last = r,
                    _ => return Err(Fault::operand("invalid register range", tok.span)),
                }
            }
            for r in first..=last {
                mask |= 1 << r;
            }
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            if self.eat(&TokenKind::CloseBrace) {
                break;
            }
            return Err(Fault::operand("expected '}'", open.span));
        }
        Ok(Operand::RegList(mask))
    }

    // ── Directives ───────────────────────────────────────────────────

    fn parse_directive(&mut self) -> Result<Body, Fault> {
        let tok = self.advance();
        let name = tok.text.to_ascii_lowercase();
        let arch = self.ctx.arch;
        let x86 = arch == Arch::X86;
        let arm = arch == Arch::Arm;

        let body = match name.as_str() {
            ".byte" => return self.parse_data(1),
            ".short" | ".hword" | ".2byte" | ".value" => return self.parse_data(2),
            ".word" => return self.parse_data(if x86 { 2 } else { 4 }),
            ".long" | ".int" | ".4byte" => return self.parse_data(4),
            ".quad" | ".8byte" => return self.parse_data(8),
            ".ascii" => return self.parse_strings(false),
            ".asciz" | ".string" => return self.parse_strings(true),
            ".align" => {
                let kind = if x86 { AlignKind::Bytes } else { AlignKind::Pow2 };
                return self.parse_align(kind, tok.span);
            }
            ".balign" => return self.parse_align(AlignKind::Bytes, tok.span),
            ".p2align" => return self.parse_align(AlignKind::Pow2, tok.span),
            ".space" | ".skip" | ".zero" => {
                let size = self.parse_expr()?;
                let fill = if self.eat(&TokenKind::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Directive::Space {
                    size,
                    fill,
                    span: tok.span,
                }
            }
            ".equ" | ".set" => return self.parse_equ(),
            ".code16" if x86 => Directive::Mode(CodeMode::X86(16)),
            ".code32" if x86 => Directive::Mode(CodeMode::X86(32)),
            ".code64" if x86 => Directive::Mode(CodeMode::X86(64)),
            ".code" if arm => {
                let width = self.peek();
                let mode = match self.parse_expr()?.as_literal() {
                    Some(16) => CodeMode::Thumb,
                    Some(32) => CodeMode::Arm,
                    _ => {
                        return Err(Fault::new(
                            ErrorCode::DirectiveValueRange,
                            "expected 16 or 32",
                            width.span,
                        ))
                    }
                };
                Directive::Mode(mode)
            }
            ".arm" if arm => Directive::Mode(CodeMode::Arm),
            ".thumb" if arm => Directive::Mode(CodeMode::Thumb),
            ".intel_syntax" | ".att_syntax" if x86 => {
                if self.peek().kind == TokenKind::Ident {
                    self.advance();
                }
                self.ctx.dialect = if name == ".intel_syntax" {
                    Syntax::Intel
                } else {
                    Syntax::Att
                };
                Directive::Nop
            }
            ".globl" | ".global" => {
                let sym = self.peek();
                if !matches!(sym.kind, TokenKind::Ident | TokenKind::Directive) {
                    return Err(Fault::new(
                        ErrorCode::DirectiveId,
                        "expected symbol name",
                        sym.span,
                    ));
                }
                self.advance();
                Directive::Nop
            }
            ".syntax" if arm => {
                if self.peek().kind == TokenKind::Ident {
                    self.advance();
                }
                Directive::Nop
            }
            ".text" | ".thumb_func" => Directive::Nop,
            _ => {
                return Err(Fault::new(
                    ErrorCode::DirectiveUnknown,
                    format!("unknown directive '{}'", tok.text),
                    tok.span,
                ))
            }
        };
        self.expect_end(ErrorCode::DirectiveToken)?;
        Ok(Body::Directive(body))
    }

    fn parse_data(&mut self, size: u8) -> Result<Body, Fault> {
        let mut values = Vec::new();
        while !self.at_end() {
            let tok = self.peek();
            if let TokenKind::StringLit(bytes) = &tok.kind {
                if size != 1 {
                    return Err(Fault::new(
                        ErrorCode::DirectiveValueRange,
                        "strings are only allowed in byte data",
                        tok.span,
                    ));
                }
                self.advance();
                values.push(DataValue::Bytes(bytes.clone()));
            } else {
                let start = self.pos;
                let expr = self.parse_expr()?;
                values.push(DataValue::Expr(expr, self.span_from(start)));
            }
            if self.at_end() {
                break;
            }
            if !self.eat(&TokenKind::Comma) {
                let tok = self.peek();
                return Err(Fault::new(
                    ErrorCode::DirectiveComma,
                    format!("expected ',' before '{}'", tok.text),
                    tok.span,
                ));
            }
            if self.at_end() {
                return Err(Fault::new(
                    ErrorCode::ExprToken,
                    "expected value after ','",
                    self.peek().span,
                ));
            }
        }
        Ok(Body::Directive(Directive::Data { size, values }))
    }

    fn parse_strings(&mut self, terminate: bool) -> Result<Body, Fault> {
        let mut out = Vec::new();
        loop {
            let tok = self.advance();
            let TokenKind::StringLit(bytes) = &tok.kind else {
                return Err(Fault::new(
                    ErrorCode::DirectiveStr,
                    "expected string literal",
                    tok.span,
                ));
            };
            out.extend_from_slice(bytes);
            if terminate {
                out.push(0);
            }
            if self.at_end() {
                break;
            }
            if !self.eat(&TokenKind::Comma) {
                let tok = self.peek();
                return Err(Fault::new(ErrorCode::DirectiveComma, "expected ','", tok.span));
            }
        }
        Ok(Body::Directive(Directive::Bytes(out)))
    }

    fn parse_align(&mut self, kind: AlignKind, span: Span) -> Result<Body, Fault> {
        let amount = self.parse_expr()?;
        let fill = if self.eat(&TokenKind::Comma) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_end(ErrorCode::DirectiveToken)?;
        Ok(Body::Directive(Directive::Align {
            kind,
            amount,
            fill,
            span,
        }))
    }

    /// `.equ name, expr` / `.set name, expr`
    fn parse_equ(&mut self) -> Result<Body, Fault> {
        let name = self.advance();
        if !matches!(name.kind, TokenKind::Ident | TokenKind::Directive) {
            return Err(Fault::new(
                ErrorCode::DirectiveId,
                "expected symbol name",
                name.span,
            ));
        }
        if !self.eat(&TokenKind::Comma) {
            return Err(Fault::new(
                ErrorCode::DirectiveComma,
                "expected ',' after symbol name",
                self.peek().span,
            ));
        }
        let expr = self.parse_expr()?;
        self.expect_end(ErrorCode::DirectiveToken)?;
        Ok(Body::Constant {
            name: name.text.to_string(),
            expr,
            span: name.span,
        })
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, Fault> {
        self.parse_binary(0)
    }

    /// Precedence climbing over `| ^ & << >> + -`; multiplicative operators
    /// are handled by [`Self::parse_mul`].
    fn parse_binary(&mut self, level: usize) -> Result<Expr, Fault> {
        const LEVELS: [&[(TokenKind, BinOp)]; 5] = [
            &[(TokenKind::Pipe, BinOp::Or)],
            &[(TokenKind::Caret, BinOp::Xor)],
            &[(TokenKind::Ampersand, BinOp::And)],
            &[(TokenKind::LShift, BinOp::Shl), (TokenKind::RShift, BinOp::Shr)],
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
        ];
        if level == LEVELS.len() {
            return self.parse_mul();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        'outer: loop {
            for (kind, op) in LEVELS[level] {
                if &self.peek().kind == kind {
                    self.advance();
                    let rhs = self.parse_binary(level + 1)?;
                    lhs = Expr::bin(*op, lhs, rhs);
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, Fault> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent if !self.is_att() => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::bin(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, Fault> {
        match self.peek().kind {
            TokenKind::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            TokenKind::Tilde => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            TokenKind::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, Fault> {
        let tok = self.peek();
        match &tok.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Num(*n))
            }
            TokenKind::CharLit(c) => {
                self.advance();
                Ok(Expr::Num(i128::from(*c)))
            }
            TokenKind::Dot => {
                self.advance();
                Ok(Expr::Here)
            }
            TokenKind::Dollar if self.is_x86() && !self.is_att() => {
                self.advance();
                Ok(Expr::Here)
            }
            TokenKind::Ident => {
                if self.ident_register(tok).is_some() {
                    return Err(Fault::operand(
                        format!("register '{}' is not allowed in an expression", tok.text),
                        tok.span,
                    ));
                }
                self.advance();
                Ok(Expr::Sym(tok.text.to_string(), tok.span))
            }
            // Local symbols such as `.Lloop`
            TokenKind::Directive => {
                self.advance();
                Ok(Expr::Sym(tok.text.to_string(), tok.span))
            }
            TokenKind::OpenParen => {
                self.advance();
                let inner = self.parse_expr()?;
                if !self.eat(&TokenKind::CloseParen) {
                    return Err(Fault::new(
                        ErrorCode::RParen,
                        "expected ')'",
                        self.peek().span,
                    ));
                }
                Ok(inner)
            }
            TokenKind::Eof => Err(Fault::new(
                ErrorCode::ExprToken,
                "expected expression",
                tok.span,
            )),
            _ => Err(Fault::new(
                ErrorCode::ExprToken,
                format!("unexpected '{}' in expression", tok.text),
                tok.span,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(arch: Arch, dialect: Syntax) -> ParseContext {
        ParseContext {
            arch,
            dialect,
            radix16: false,
        }
    }

    fn body(src: &str, arch: Arch, dialect: Syntax) -> Body {
        let mut c = ctx(arch, dialect);
        parse_statement(src, &mut c).body.unwrap().unwrap()
    }

    fn intel(src: &str) -> Instruction {
        match body(src, Arch::X86, Syntax::Intel) {
            Body::Instruction(i) => i,
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    fn att(src: &str) -> Instruction {
        match body(src, Arch::X86, Syntax::Att) {
            Body::Instruction(i) => i,
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    fn fault(src: &str, arch: Arch, dialect: Syntax) -> Fault {
        let mut c = ctx(arch, dialect);
        parse_statement(src, &mut c).body.unwrap().unwrap_err()
    }

    fn x86(name: &str) -> X86Reg {
        X86Reg::parse(name).unwrap()
    }

    #[test]
    fn mnemonic_is_lowercased_symbols_keep_case() {
        let i = intel("MOV EAX, TEST");
        assert_eq!(i.mnemonic, "mov");
        assert_eq!(i.operands[0], Operand::Reg(Register::X86(x86("eax"))));
        match &i.operands[1] {
            Operand::Imm(e) => assert_eq!(e.as_symbol(), Some("TEST")),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn intel_memory_operand() {
        let i = intel("mov eax, dword ptr fs:[ebx + esi*4 - 8]");
        let Operand::Mem(mem) = &i.operands[1] else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.size, Some(4));
        assert_eq!(mem.seg, Some(x86("fs")));
        assert_eq!(mem.base, Some(x86("ebx")));
        assert_eq!(mem.index, Some(x86("esi")));
        assert_eq!(mem.scale, 4);
        assert_eq!(mem.disp.as_ref().and_then(Expr::as_literal), Some(-8));
    }

    #[test]
    fn intel_scale_first() {
        let i = intel("lea eax, [8*ecx + 0x10]");
        let Operand::Mem(mem) = &i.operands[1] else {
            panic!("expected memory operand")
        };
        assert_eq!((mem.index, mem.scale), (Some(x86("ecx")), 8));
        assert_eq!(mem.base, None);
    }

    #[test]
    fn branch_distance_keywords_double_as_symbols() {
        let i = intel("jmp short done");
        match &i.operands[0] {
            Operand::Imm(e) => assert_eq!(e.as_symbol(), Some("done")),
            other => panic!("{:?}", other),
        }
        for name in ["short", "near", "far"] {
            let i = intel(&format!("jmp {name}"));
            match &i.operands[0] {
                Operand::Imm(e) => assert_eq!(e.as_symbol(), Some(name)),
                other => panic!("{:?}", other),
            }
        }
        assert_eq!(
            fault("jmp far target", Arch::X86, Syntax::Intel).code,
            ErrorCode::InvalidOperand
        );
    }

    #[test]
    fn att_operands_are_reversed() {
        let i = att("movl 4(%ebx,%ecx,2), %eax");
        assert_eq!(i.mnemonic, "movl");
        assert!(i.att);
        assert_eq!(i.operands[0], Operand::Reg(Register::X86(x86("eax"))));
        let Operand::Mem(mem) = &i.operands[1] else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.base, Some(x86("ebx")));
        assert_eq!(mem.index, Some(x86("ecx")));
        assert_eq!(mem.scale, 2);
    }

    #[test]
    fn att_branch_target_and_indirect() {
        let i = att("jmp target");
        assert!(matches!(i.operands[0], Operand::Imm(_)));
        let i = att("call *%eax");
        assert!(matches!(i.operands[0], Operand::Reg(_)));
        let i = att("movl target, %eax");
        assert!(matches!(i.operands[1], Operand::Mem(_)));
    }

    #[test]
    fn prefixes() {
        let i = intel("lock add dword ptr [eax], 1");
        assert_eq!(i.prefixes, [Prefix::Lock]);
        assert_eq!(i.mnemonic, "add");
        let i = intel("rep");
        assert!(i.prefixes.is_empty());
        assert_eq!(i.mnemonic, "rep");
    }

    #[test]
    fn labels_survive_body_errors() {
        let mut c = ctx(Arch::X86, Syntax::Intel);
        let stmt = parse_statement("start: mov eax, [ebx", &mut c);
        assert_eq!(stmt.labels.len(), 1);
        assert_eq!(stmt.labels[0].0, "start");
        assert_eq!(stmt.body.unwrap().unwrap_err().code, ErrorCode::ExprBracket);
    }

    #[test]
    fn register_label_rejected() {
        let mut c = ctx(Arch::X86, Syntax::Intel);
        let stmt = parse_statement("eax: nop", &mut c);
        assert_eq!(stmt.body.unwrap().unwrap_err().code, ErrorCode::LabelInvalid);
    }

    #[test]
    fn label_only_statement() {
        let mut c = ctx(Arch::X86, Syntax::Intel);
        let stmt = parse_statement("a: b:", &mut c);
        assert_eq!(stmt.labels.len(), 2);
        assert!(stmt.body.is_none());
    }

    #[test]
    fn constants() {
        for src in ["N = 4*2", ".equ N, 8", ".set N, 8", "N equ 8"] {
            match body(src, Arch::X86, Syntax::Intel) {
                Body::Constant { name, expr, .. } => {
                    assert_eq!(name, "N");
                    assert_eq!(expr.as_literal(), Some(8), "{}", src);
                }
                other => panic!("{}: {:?}", src, other),
            }
        }
        assert_eq!(fault(".equ N 8", Arch::X86, Syntax::Intel).code, ErrorCode::DirectiveComma);
        assert_eq!(fault(".equ , 8", Arch::X86, Syntax::Intel).code, ErrorCode::DirectiveId);
    }

    #[test]
    fn data_directives() {
        let Body::Directive(Directive::Data { size, values }) =
            body(".word 1, 2", Arch::X86, Syntax::Intel)
        else {
            panic!("expected data")
        };
        assert_eq!((size, values.len()), (2, 2));
        let Body::Directive(Directive::Data { size, .. }) =
            body(".word 1", Arch::Arm, Syntax::Gas)
        else {
            panic!("expected data")
        };
        assert_eq!(size, 4);
        let Body::Directive(Directive::Data { values, .. }) =
            body("db \"hi\", 0", Arch::X86, Syntax::Nasm)
        else {
            panic!("expected data")
        };
        assert_eq!(values[0], DataValue::Bytes(b"hi".to_vec()));
        assert_eq!(fault(".byte 1 2", Arch::X86, Syntax::Intel).code, ErrorCode::DirectiveComma);
        assert_eq!(fault("db 1,", Arch::X86, Syntax::Nasm).code, ErrorCode::ExprToken);
        assert_eq!(fault(".long 1, 2,", Arch::Arm, Syntax::Gas).code, ErrorCode::ExprToken);
    }

    #[test]
    fn strings() {
        let Body::Directive(Directive::Bytes(bytes)) =
            body(".asciz \"ab\", \"c\"", Arch::X86, Syntax::Intel)
        else {
            panic!("expected bytes")
        };
        assert_eq!(bytes, b"ab\0c\0");
        assert_eq!(fault(".ascii 5", Arch::X86, Syntax::Intel).code, ErrorCode::DirectiveStr);
    }

    #[test]
    fn unknown_directive() {
        assert_eq!(
            fault(".bogus 1", Arch::X86, Syntax::Intel).code,
            ErrorCode::DirectiveUnknown
        );
        assert_eq!(
            fault(".thumb", Arch::X86, Syntax::Intel).code,
            ErrorCode::DirectiveUnknown
        );
        assert_eq!(
            fault(".text extra", Arch::X86, Syntax::Intel).code,
            ErrorCode::DirectiveToken
        );
    }

    #[test]
    fn dialect_switch_carries_over() {
        let mut c = ctx(Arch::X86, Syntax::Intel);
        parse_statement(".att_syntax", &mut c);
        assert_eq!(c.dialect, Syntax::Att);
        let stmt = parse_statement("movl $1, %eax", &mut c);
        assert!(matches!(stmt.body, Some(Ok(Body::Instruction(_)))));
    }

    #[test]
    fn arm_operands() {
        let Body::Instruction(i) = body("ldr r0, [r1, #4]!", Arch::Arm, Syntax::Gas) else {
            panic!("expected instruction")
        };
        let Operand::ArmMem(mem) = &i.operands[1] else {
            panic!("expected memory")
        };
        assert_eq!(mem.base, Register::Arm(1));
        assert!(mem.writeback);
        assert!(matches!(&mem.offset, ArmOffset::Imm(e) if e.as_literal() == Some(4)));

        let Body::Instruction(i) = body("push {r0-r2, lr}", Arch::Arm, Syntax::Gas) else {
            panic!("expected instruction")
        };
        assert_eq!(i.operands[0], Operand::RegList(0b0100_0000_0000_0111));

        let Body::Instruction(i) = body("add r0, r1, r2, lsl #3", Arch::Arm, Syntax::Gas) else {
            panic!("expected instruction")
        };
        assert!(matches!(
            &i.operands[3],
            Operand::Shift(Shift { kind: ShiftKind::Lsl, amount: ShiftAmount::Imm(_) })
        ));
    }

    #[test]
    fn expressions() {
        let i = intel("mov eax, (1 + 2) * 3 - -1");
        let Operand::Imm(e) = &i.operands[1] else {
            panic!("expected immediate")
        };
        assert_eq!(e.as_literal(), Some(10));
        assert_eq!(fault("mov eax, (1 + 2", Arch::X86, Syntax::Intel).code, ErrorCode::RParen);
        assert_eq!(fault("mov eax, ]", Arch::X86, Syntax::Intel).code, ErrorCode::ExprToken);
        assert_eq!(fault("mov eax, ebx + 1", Arch::X86, Syntax::Intel).code, ErrorCode::InvalidOperand);
    }

    #[test]
    fn statement_start() {
        assert_eq!(fault("42", Arch::X86, Syntax::Intel).code, ErrorCode::StatToken);
    }

    #[test]
    fn operand_spans() {
        let i = intel("add eax, 0x10");
        assert_eq!(i.op_span(1).col, 10);
        assert_eq!(i.op_span(1).len, 4);
    }
}
