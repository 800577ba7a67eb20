//! x86 encodings in all three widths, checked against reference assembler output.
#![cfg(feature = "x86")]

use ks_asm::{assemble, Arch, Engine, Mode, OptionType, Syntax, SyntaxOption};

fn x16(source: &str) -> Vec<u8> {
    assemble(Arch::X86, Mode::Mode16, source)
        .unwrap_or_else(|e| panic!("`{source}` failed in 16-bit mode: {e}"))
}

fn x32(source: &str) -> Vec<u8> {
    assemble(Arch::X86, Mode::Mode32, source)
        .unwrap_or_else(|e| panic!("`{source}` failed in 32-bit mode: {e}"))
}

fn x64(source: &str) -> Vec<u8> {
    assemble(Arch::X86, Mode::Mode64, source)
        .unwrap_or_else(|e| panic!("`{source}` failed in 64-bit mode: {e}"))
}

fn att32(source: &str) -> Vec<u8> {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    engine.set_option(OptionType::Syntax, 2).unwrap();
    engine
        .assemble(source, 0)
        .unwrap_or_else(|e| panic!("`{source}` failed in AT&T: {e}"))
        .into_bytes()
}

// --- Core: NOP, RET, PUSH, POP ---

/// NOP: [0x90]
#[test]
fn nop() {
    assert_eq!(x32("nop"), [0x90]);
}

/// RET: [0xC3]
#[test]
fn ret() {
    assert_eq!(x64("ret"), [0xC3]);
}

/// PUSH RBP / PUSH R12: [0x55], [0x41, 0x54]
#[test]
fn push_registers() {
    assert_eq!(x64("push rbp"), [0x55]);
    assert_eq!(x64("push r12"), [0x41, 0x54]);
    assert_eq!(x32("pop ebp"), [0x5D]);
}

/// PUSH imm8 / imm32
#[test]
fn push_immediates() {
    assert_eq!(x32("push 1"), [0x6A, 0x01]);
    assert_eq!(x32("push 0x1000"), [0x68, 0x00, 0x10, 0x00, 0x00]);
}

// --- INC / DEC ---

/// 32-bit mode uses the one-byte 0x40+r forms; 64-bit mode needs ModR/M.
#[test]
fn inc_dec_width_dependent() {
    assert_eq!(x32("inc eax"), [0x40]);
    assert_eq!(x32("dec ecx"), [0x49]);
    assert_eq!(x16("inc ax"), [0x40]);
    assert_eq!(x64("inc eax"), [0xFF, 0xC0]);
    assert_eq!(x64("dec eax"), [0xFF, 0xC8]);
    assert_eq!(x64("inc r8"), [0x49, 0xFF, 0xC0]);
}

// --- ALU ---

#[test]
fn alu_register_and_immediate() {
    assert_eq!(x32("add eax, ebx"), [0x01, 0xD8]);
    assert_eq!(x32("add eax, 1"), [0x83, 0xC0, 0x01]);
    assert_eq!(x32("add eax, 0x1000"), [0x05, 0x00, 0x10, 0x00, 0x00]);
    assert_eq!(x32("add ecx, 0x1000"), [0x81, 0xC1, 0x00, 0x10, 0x00, 0x00]);
    assert_eq!(x32("add al, 5"), [0x04, 0x05]);
    assert_eq!(x64("xor rax, rax"), [0x48, 0x31, 0xC0]);
    assert_eq!(x64("sub rsp, 0x28"), [0x48, 0x83, 0xEC, 0x28]);
}

// --- MOV ---

#[test]
fn mov_forms() {
    assert_eq!(x32("mov eax, ebx"), [0x89, 0xD8]);
    assert_eq!(x32("mov eax, 0x66"), [0xB8, 0x66, 0x00, 0x00, 0x00]);
    assert_eq!(x32("mov al, 1"), [0xB0, 0x01]);
    assert_eq!(x64("mov rax, 1"), [0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]);
}

/// Operand-size prefix in 16-bit mode.
#[test]
fn mode16_operand_size() {
    assert_eq!(x16("cwde"), [0x66, 0x98]);
    assert_eq!(x64("cdqe"), [0x48, 0x98]);
    assert_eq!(x32("movsw"), [0x66, 0xA5]);
}

// --- Memory operands ---

#[test]
fn addressing_modes() {
    assert_eq!(x32("mov eax, [ebx + esi*4 + 0x10]"), [0x8B, 0x44, 0xB3, 0x10]);
    assert_eq!(x32("lea eax, [ecx*8]"), [0x8D, 0x04, 0xCD, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(x32("mov eax, [0x1000]"), [0x8B, 0x05, 0x00, 0x10, 0x00, 0x00]);
    assert_eq!(x64("mov rax, [r12]"), [0x49, 0x8B, 0x04, 0x24]);
    assert_eq!(x64("mov rax, [r13]"), [0x49, 0x8B, 0x45, 0x00]);
    assert_eq!(x64("mov eax, [eax]"), [0x67, 0x8B, 0x00]);
}

#[test]
fn sized_memory_operands() {
    assert_eq!(x32("inc byte ptr [eax]"), [0xFE, 0x00]);
    assert_eq!(x32("not byte ptr [ecx]"), [0xF6, 0x11]);
    assert_eq!(x32("push dword ptr [eax]"), [0xFF, 0x30]);
    assert_eq!(x32("lock inc dword ptr [eax]"), [0xF0, 0xFF, 0x00]);
}

// --- Shifts and multiply ---

#[test]
fn shifts_and_multiply() {
    assert_eq!(x32("shl eax, 1"), [0xD1, 0xE0]);
    assert_eq!(x32("shr eax, 4"), [0xC1, 0xE8, 0x04]);
    assert_eq!(x32("sar eax, cl"), [0xD3, 0xF8]);
    assert_eq!(x32("imul eax, ecx"), [0x0F, 0xAF, 0xC1]);
    assert_eq!(x32("imul eax, ecx, 10"), [0x6B, 0xC1, 0x0A]);
}

// --- Control flow ---

#[test]
fn branches_to_absolute_targets() {
    assert_eq!(x32("jmp 0x10"), [0xEB, 0x0E]);
    assert_eq!(x32("jmp 0x1000"), [0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    assert_eq!(x32("je 0"), [0x74, 0xFE]);
    assert_eq!(x32("call 0x100"), [0xE8, 0xFB, 0x00, 0x00, 0x00]);
    assert_eq!(x64("call rax"), [0xFF, 0xD0]);
}

#[test]
fn forward_branch_grows_when_target_is_far() {
    let code = x32("jmp done\n.space 200\ndone: ret");
    assert_eq!(&code[..5], &[0xE9, 0xC8, 0x00, 0x00, 0x00]);
    assert_eq!(code.len(), 5 + 200 + 1);
    assert_eq!(code[205], 0xC3);
}

#[test]
fn short_backward_loop() {
    assert_eq!(x32("top: dec ecx\njne top"), [0x49, 0x75, 0xFD]);
}

#[test]
fn syscall_and_string_ops() {
    assert_eq!(x64("syscall"), [0x0F, 0x05]);
    assert_eq!(x32("rep stosb"), [0xF3, 0xAA]);
}

// --- Dialects ---

#[test]
fn att_operand_order() {
    assert_eq!(att32("movl $1, %eax"), [0xB8, 0x01, 0x00, 0x00, 0x00]);
    assert_eq!(att32("addl $1, (%eax)"), [0x83, 0x00, 0x01]);
    assert_eq!(att32("movzbl (%ebx), %eax"), [0x0F, 0xB6, 0x03]);
}

#[test]
fn intel_family_dialects_agree_on_plain_forms() {
    let source = "push ebp; mov ebp, esp; add eax, 1; pop ebp; ret";
    let expected = x32(source);
    for dialect in [Syntax::Nasm, Syntax::Masm] {
        let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
        engine.set_syntax(SyntaxOption::new(dialect)).unwrap();
        assert_eq!(engine.assemble(source, 0).unwrap().into_bytes(), expected, "{dialect}");
    }
}

// --- Data ---

#[test]
fn data_directives() {
    assert_eq!(x32(".byte 1, 2"), [0x01, 0x02]);
    assert_eq!(x32(".word 0x1234"), [0x34, 0x12]);
    assert_eq!(x32(".long 0x12345678"), [0x78, 0x56, 0x34, 0x12]);
    assert_eq!(x32("nop\n.align 4"), [0x90, 0x90, 0x90, 0x90]);
}
