//! Performance benchmarks for `ks_asm`.
//!
//! Measures:
//! - Single instruction latency (per architecture)
//! - Multi-instruction throughput (bytes of source text)
//! - Label-heavy workloads
//! - Branch relaxation passes
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ks_asm::{Arch, Engine, Mode, ModeFlags};

fn engine(arch: Arch, mode: impl Into<ModeFlags>) -> Engine {
    Engine::open(arch, mode).unwrap()
}

// ─── Single-Instruction Latency ──────────────────────────────────────────────

fn bench_single_instruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_instruction");

    let mut x64 = engine(Arch::X86, Mode::Mode64);
    group.bench_function("x86_64_nop", |b| {
        b.iter(|| x64.assemble(black_box("nop"), 0).unwrap())
    });
    group.bench_function("x86_64_mov_mem", |b| {
        b.iter(|| x64.assemble(black_box("mov eax, [ebx + esi*4 + 0x10]"), 0).unwrap())
    });

    let mut a64 = engine(Arch::Arm64, ModeFlags::default());
    group.bench_function("aarch64_add", |b| {
        b.iter(|| a64.assemble(black_box("add x0, x1, x2"), 0).unwrap())
    });
    group.bench_function("aarch64_logical_imm", |b| {
        b.iter(|| a64.assemble(black_box("and x0, x1, #0xff"), 0).unwrap())
    });

    let mut a32 = engine(Arch::Arm, Mode::Arm);
    group.bench_function("arm_add", |b| {
        b.iter(|| a32.assemble(black_box("add r0, r1, r2"), 0).unwrap())
    });

    let mut t32 = engine(Arch::Arm, Mode::Thumb);
    group.bench_function("thumb_movw", |b| {
        b.iter(|| t32.assemble(black_box("movw r0, #0x1234"), 0).unwrap())
    });

    group.finish();
}

// ─── Multi-Instruction Throughput ─────────────────────────────────────────────

/// Generate a block of N x86-64 instructions (no labels).
fn gen_x86_64_block(n: usize) -> String {
    let mut s = String::with_capacity(n * 20);
    for i in 0..n {
        match i % 6 {
            0 => s.push_str("mov rax, rbx\n"),
            1 => s.push_str("add rcx, rdx\n"),
            2 => s.push_str("sub rsi, rdi\n"),
            3 => s.push_str("xor r8, r9\n"),
            4 => s.push_str("and r10, r11\n"),
            _ => s.push_str("or r12, r13\n"),
        }
    }
    s
}

/// Generate a block of N AArch64 instructions (no labels).
fn gen_aarch64_block(n: usize) -> String {
    let mut s = String::with_capacity(n * 20);
    for i in 0..n {
        match i % 4 {
            0 => s.push_str("add x0, x1, x2\n"),
            1 => s.push_str("ldr x3, [sp, #16]\n"),
            2 => s.push_str("eor w4, w5, w6\n"),
            _ => s.push_str("mov x7, #42\n"),
        }
    }
    s
}

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("throughput");

    for n in [100, 1000] {
        let src = gen_x86_64_block(n);
        let mut x64 = engine(Arch::X86, Mode::Mode64);
        group.throughput(Throughput::Bytes(src.len() as u64));
        group.bench_function(format!("x86_64_{n}"), |b| {
            b.iter(|| x64.assemble(black_box(&src), 0).unwrap())
        });

        let src = gen_aarch64_block(n);
        let mut a64 = engine(Arch::Arm64, ModeFlags::default());
        group.throughput(Throughput::Bytes(src.len() as u64));
        group.bench_function(format!("aarch64_{n}"), |b| {
            b.iter(|| a64.assemble(black_box(&src), 0).unwrap())
        });
    }

    group.finish();
}

// ─── Labels and Relaxation ───────────────────────────────────────────────────

/// N labelled blocks, each jumping to the next.
fn gen_label_chain(n: usize) -> String {
    let mut s = String::with_capacity(n * 32);
    for i in 0..n {
        s.push_str(&format!("l{i}: inc eax\njne l{}\n", i + 1));
    }
    s.push_str(&format!("l{n}: ret\n"));
    s
}

/// Branches whose targets sit just past short range, forcing promotion.
fn gen_relaxation(n: usize) -> String {
    let mut s = String::with_capacity(n * 48);
    for i in 0..n {
        s.push_str(&format!("jmp t{i}\n.space 126\nt{i}: nop\n"));
    }
    s
}

fn bench_labels(c: &mut Criterion) {
    let mut group = c.benchmark_group("labels");
    let mut x86 = engine(Arch::X86, Mode::Mode32);

    let chain = gen_label_chain(200);
    group.bench_function("label_chain_200", |b| {
        b.iter(|| x86.assemble(black_box(&chain), 0x1000).unwrap())
    });

    let relax = gen_relaxation(100);
    group.bench_function("relaxation_100", |b| {
        b.iter(|| x86.assemble(black_box(&relax), 0).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_single_instruction, bench_throughput, bench_labels);
criterion_main!(benches);
