//! Basic assembly example: engine lifecycle, syntax options and the resolver.
//!
//! Run with: `cargo run --example basic`

use ks_asm::{Arch, Engine, Mode, OptionType, Syntax, SyntaxOption};

fn main() -> Result<(), ks_asm::Error> {
    // RUST_LOG-style output of the engine's tracing events.
    tracing_subscriber::fmt::init();

    println!("=== ks_asm basic example ===\n");

    let mut engine = Engine::open(Arch::X86, Mode::Mode64)?;

    // --- One call, several statements ---
    println!("1. INC EAX; DEC EAX:");
    let out = engine.assemble("INC EAX; DEC EAX", 0)?;
    print_hex("   ", out.machine_code());
    println!("   {} statements", out.statement_count());

    // --- Labels and base address ---
    println!("\n2. Function at 0x401000:");
    let out = engine.assemble(
        r#"
entry:
    push rbp
    mov rbp, rsp
    sub rsp, 0x20
    xor rax, rax        # return 0
    add rsp, 0x20
    pop rbp
    ret
"#,
        0x40_1000,
    )?;
    print_hex("   ", out.machine_code());
    for (name, addr) in out.labels() {
        println!("   {}: 0x{:X}", name, addr);
    }

    // --- Constants ---
    println!("\n3. Constants (.equ):");
    let out = engine.assemble(
        r#"
.equ SYS_EXIT, 60
    mov eax, SYS_EXIT
    syscall
"#,
        0,
    )?;
    print_hex("   ", out.machine_code());

    // --- AT&T syntax ---
    println!("\n4. AT&T syntax:");
    engine.set_option(OptionType::Syntax, i64::from(Syntax::Att.bit()))?;
    let out = engine.assemble("pushq %rbp; movq %rsp, %rbp", 0)?;
    print_hex("   ", out.machine_code());
    engine.set_syntax(SyntaxOption::new(Syntax::Intel))?;

    // --- Symbol resolver ---
    println!("\n5. External symbol via resolver:");
    engine.set_symbol_resolver(|name: &str| (name == "EXIT_CODE").then_some(0x2A_u64))?;
    let out = engine.assemble("mov eax, EXIT_CODE", 0)?;
    print_hex("   ", out.machine_code());

    // --- Errors ---
    println!("\n6. Error reporting:");
    if let Err(e) = engine.assemble("nop\nfrobnicate rax", 0) {
        println!("   {} ({:?})", e, e.code());
    }

    engine.close();
    println!("\n=== Done! ===");
    Ok(())
}

fn print_hex(prefix: &str, bytes: &[u8]) {
    print!("{}", prefix);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && i % 16 == 0 {
            println!();
            print!("{}", prefix);
        }
        print!("{:02X} ", b);
    }
    println!();
}
