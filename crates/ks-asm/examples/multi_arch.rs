//! Multi-architecture example: the same engine API across x86, ARM, Thumb
//! and AArch64.
//!
//! Run with: `cargo run --example multi_arch`

use ks_asm::{is_architecture_supported, Arch, Engine, Mode, ModeFlags};

fn main() -> Result<(), ks_asm::Error> {
    println!("=== ks_asm multi-architecture assembler ===\n");

    let targets: [(&str, Arch, ModeFlags, &str); 5] = [
        (
            "x86 (32-bit)",
            Arch::X86,
            Mode::Mode32.into(),
            "push ebp\nmov ebp, esp\nmov eax, 1\npop ebp\nret",
        ),
        (
            "AArch64 exit(0)",
            Arch::Arm64,
            ModeFlags::default(),
            "mov x0, #0      // exit code\nmov x8, #93     // SYS_exit\nsvc #0",
        ),
        (
            "ARM function",
            Arch::Arm,
            Mode::Arm.into(),
            "push {r4, lr}\nadd r0, r0, #1  @ increment\npop {r4, pc}",
        ),
        (
            "Thumb loop",
            Arch::Arm,
            Mode::Thumb.into(),
            "top: subs r0, r0, #1\nbne top\nbx lr",
        ),
        (
            "ARM big-endian",
            Arch::Arm,
            Mode::Arm | Mode::BigEndian,
            "nop\n.long 0x01020304",
        ),
    ];

    for (i, (title, arch, mode, source)) in targets.iter().enumerate() {
        println!("{}. {}:", i + 1, title);
        let mut engine = Engine::open(*arch, *mode)?;
        let out = engine.assemble(source, 0x1000)?;
        print_hex("   ", out.machine_code());
        println!("   Size: {} bytes", out.len());
        println!();
    }

    println!("Supported architectures:");
    for arch in [
        Arch::Arm,
        Arch::Arm64,
        Arch::Mips,
        Arch::X86,
        Arch::Ppc,
        Arch::Sparc,
        Arch::SystemZ,
        Arch::Hexagon,
        Arch::Evm,
    ] {
        println!("   {:<8} {}", arch.to_string(), is_architecture_supported(arch));
    }

    Ok(())
}

fn print_hex(prefix: &str, bytes: &[u8]) {
    print!("{}", prefix);
    for b in bytes {
        print!("{:02X} ", b);
    }
    println!();
}
