//! Engine lifecycle, option and resolver behaviour through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ks_asm::{
    is_architecture_supported, version, Arch, Engine, Error, ErrorCode, Mode, ModeFlags,
    OptionType, Syntax, SyntaxOption, Version,
};

// ─── Open ───────────────────────────────────────────────────────────────────

#[test]
fn open_rejects_foreign_mode_before_arch() {
    let err = Engine::open(Arch::Ppc, Mode::SparcV9).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Mode);
    assert!(matches!(err, Error::Open { arch: Arch::Ppc, .. }));
}

#[test]
fn open_rejects_unbuilt_arch() {
    let err = Engine::open(Arch::Ppc, Mode::Ppc32 | Mode::BigEndian).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Arch);
}

#[test]
fn open_requires_exactly_one_x86_width() {
    assert_eq!(
        Engine::open(Arch::X86, ModeFlags::default()).unwrap_err().code(),
        ErrorCode::Mode
    );
    assert_eq!(
        Engine::open(Arch::X86, Mode::Mode32 | Mode::Mode64)
            .unwrap_err()
            .code(),
        ErrorCode::Mode
    );
    assert_eq!(
        Engine::open(Arch::X86, Mode::Mode32 | Mode::BigEndian)
            .unwrap_err()
            .code(),
        ErrorCode::Mode
    );
}

#[test]
fn open_arm_modes() {
    assert!(Engine::open(Arch::Arm, Mode::Arm).is_ok());
    assert!(Engine::open(Arch::Arm, Mode::Thumb | Mode::V8).is_ok());
    assert!(Engine::open(Arch::Arm, Mode::Arm | Mode::BigEndian).is_ok());
    assert_eq!(
        Engine::open(Arch::Arm, Mode::Arm | Mode::Thumb)
            .unwrap_err()
            .code(),
        ErrorCode::Mode
    );
}

#[test]
fn every_registry_mode_opens_when_built() {
    let combos: [(Arch, ModeFlags); 8] = [
        (Arch::X86, Mode::Mode16.into()),
        (Arch::X86, Mode::Mode32.into()),
        (Arch::X86, Mode::Mode64.into()),
        (Arch::Arm, Mode::Arm.into()),
        (Arch::Arm, Mode::Thumb.into()),
        (Arch::Arm, Mode::Arm | Mode::V8),
        (Arch::Arm, Mode::Thumb | Mode::BigEndian),
        (Arch::Arm64, Mode::LittleEndian.into()),
    ];
    for (arch, mode) in combos {
        assert!(ks_asm::registry::spec(arch).accepts_mode(mode), "{arch} {mode}");
        if is_architecture_supported(arch) {
            let engine = Engine::open(arch, mode).unwrap();
            assert_eq!((engine.arch(), engine.mode()), (arch, mode));
        }
    }
}

// ─── Assemble ───────────────────────────────────────────────────────────────

#[test]
fn inc_dec_x86_64() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode64).unwrap();
    let out = engine.assemble("INC EAX;DEC EAX", 0).unwrap();
    assert_eq!(out.machine_code(), &[0xFF, 0xC0, 0xFF, 0xC8]);
    assert_eq!(out.statement_count(), 2);
}

#[test]
fn base_address_is_reported() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let out = engine.assemble("NOP;NOP", 0x200).unwrap();
    assert_eq!(out.machine_code(), &[0x90, 0x90]);
    assert_eq!(out.address(), 0x200);
    assert_eq!(out.len(), 2);
}

#[test]
fn empty_source_is_empty_result() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let out = engine.assemble("", 0).unwrap();
    assert!(out.is_empty());
    assert_eq!(out.statement_count(), 0);
    let out = engine.assemble("  ; \n ; ", 0).unwrap();
    assert!(out.is_empty());
}

#[test]
fn unknown_mnemonic_names_statement() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let err = engine.assemble("UNK", 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MnemonicFail);
    assert_eq!(err.statement(), Some("UNK"));
}

#[test]
fn failure_is_all_or_nothing() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let err = engine.assemble("nop\nnop\nbogus eax", 0).unwrap_err();
    match err {
        Error::Assemble {
            cause,
            statement,
            index,
            span,
            ..
        } => {
            assert_eq!(cause, ErrorCode::MnemonicFail);
            assert_eq!(statement, "bogus eax");
            assert_eq!(index, 2);
            assert_eq!(span.line, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    // The engine stays usable.
    assert_eq!(engine.assemble("nop", 0).unwrap().machine_code(), &[0x90]);
}

#[test]
fn statement_list_matches_joined_source() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode64).unwrap();
    let joined = engine.assemble("push rbp; mov rbp, rsp; pop rbp; ret", 0x1000).unwrap();
    let listed = engine
        .assemble_statements(["push rbp", "mov rbp, rsp", "pop rbp", "ret"], 0x1000)
        .unwrap();
    assert_eq!(joined, listed);
    assert_eq!(listed.statement_count(), 4);
}

#[test]
fn labels_are_reported() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let out = engine.assemble("start: nop\nagain: jmp again\nend:", 0x400).unwrap();
    assert_eq!(out.machine_code(), &[0x90, 0xEB, 0xFE]);
    assert_eq!(out.label("start"), Some(0x400));
    assert_eq!(out.label("again"), Some(0x401));
    assert_eq!(out.label("end"), Some(0x403));
    assert_eq!(out.labels().len(), 3);
    assert_eq!(out.statement_count(), 2);
}

// ─── Syntax ─────────────────────────────────────────────────────────────────

#[test]
fn intel_and_att_agree() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let intel = engine.assemble("INC ECX; DEC EDX", 0).unwrap();
    engine.set_option(OptionType::Syntax, 2).unwrap();
    assert_eq!(engine.syntax(), SyntaxOption::new(Syntax::Att));
    let att = engine.assemble("INC %ecx; DEC %edx", 0).unwrap();
    assert_eq!(intel.machine_code(), att.machine_code());
    assert_eq!(intel.machine_code(), &[0x41, 0x4A]);
}

#[test]
fn invalid_syntax_value_echoes_inputs() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let err = engine.set_option(OptionType::Syntax, -1).unwrap_err();
    assert_eq!(
        err,
        Error::SetOption {
            cause: ErrorCode::OptInvalid,
            option: OptionType::Syntax,
            value: -1,
        }
    );
    assert_eq!(engine.syntax(), SyntaxOption::new(Syntax::Intel));
}

#[test]
fn radix16_reads_bare_numbers_as_hex() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    engine
        .set_syntax(SyntaxOption::new(Syntax::Intel).radix16(true))
        .unwrap();
    let out = engine.assemble("push 10", 0).unwrap();
    assert_eq!(out.machine_code(), &[0x6A, 0x10]);
}

#[test]
fn inline_dialect_switch_is_scoped_to_call() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let out = engine.assemble(".att_syntax\nincl %eax", 0).unwrap();
    assert_eq!(out.machine_code(), &[0x40]);
    assert_eq!(engine.syntax().dialect, Syntax::Intel);
    assert_eq!(engine.assemble("inc eax", 0).unwrap().machine_code(), &[0x40]);
}

// ─── Symbol resolver ────────────────────────────────────────────────────────

#[test]
fn resolver_supplies_unknown_symbols() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    engine
        .set_symbol_resolver(move |name: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
            (name == "TEST").then_some(0x66_u64)
        })
        .unwrap();

    let out = engine.assemble("mov eax, TEST", 0).unwrap();
    assert_eq!(out.machine_code(), &[0xB8, 0x66, 0x00, 0x00, 0x00]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let err = engine.assemble("mov eax, OTHER", 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SymbolMissing);

    engine.unset_symbol_resolver().unwrap();
    let before = calls.load(Ordering::SeqCst);
    let err = engine.assemble("mov eax, TEST", 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SymbolMissing);
    assert_eq!(calls.load(Ordering::SeqCst), before);
}

#[test]
fn source_labels_shadow_resolver() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    engine
        .set_symbol_resolver(|_: &str| Some(0xDEAD_u64))
        .unwrap();
    let out = engine.assemble("jmp here\nhere: ret", 0).unwrap();
    assert_eq!(out.machine_code(), &[0xEB, 0x00, 0xC3]);
}

// ─── Queries and lifecycle ──────────────────────────────────────────────────

#[test]
fn version_and_support() {
    assert_eq!(version(), Version::CURRENT);
    assert_eq!(version().compare_to(&Version::new(0, 9)), 0);
    assert_eq!(Version::new(1, 0).compare_to(&version()), 1);
    assert!(is_architecture_supported(Arch::X86));
    assert!(is_architecture_supported(Arch::Arm));
    assert!(is_architecture_supported(Arch::Arm64));
    for arch in [Arch::Mips, Arch::Ppc, Arch::Sparc, Arch::SystemZ, Arch::Hexagon, Arch::Evm] {
        assert!(!is_architecture_supported(arch), "{arch}");
    }
}

#[test]
fn arm64_nop() {
    let mut engine = Engine::open(Arch::Arm64, Mode::LittleEndian).unwrap();
    let out = engine.assemble("nop", 0).unwrap();
    assert_eq!(out.machine_code(), &[0x1F, 0x20, 0x03, 0xD5]);
}

#[test]
fn closed_engine_rejects_everything() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode64).unwrap();
    engine.close();
    assert_eq!(engine.assemble("nop", 0), Err(Error::Closed));
    assert_eq!(
        engine.set_option(OptionType::Syntax, 1),
        Err(Error::Closed)
    );
    assert_eq!(engine.set_symbol_resolver(|_: &str| None::<u64>), Err(Error::Closed));
    assert_eq!(Error::Closed.code(), ErrorCode::Handle);
}

#[test]
fn engines_are_independent() {
    let mut a = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    let mut b = Engine::open(Arch::X86, Mode::Mode32).unwrap();
    b.set_option(OptionType::Syntax, 2).unwrap();
    assert_eq!(a.assemble("inc eax", 0).unwrap().machine_code(), &[0x40]);
    assert_eq!(b.assemble("incl %eax", 0).unwrap().machine_code(), &[0x40]);
    a.close();
    assert!(b.assemble("nop", 0).is_ok());
}

#[test]
fn engine_moves_across_threads() {
    let mut engine = Engine::open(Arch::X86, Mode::Mode64).unwrap();
    let handle = std::thread::spawn(move || engine.assemble("ret", 0).map(|r| r.into_bytes()));
    assert_eq!(handle.join().unwrap().unwrap(), vec![0xC3]);
}

#[test]
fn one_shot_assemble() {
    let code = ks_asm::assemble(Arch::X86, Mode::Mode64, "syscall").unwrap();
    assert_eq!(code, vec![0x0F, 0x05]);
    assert_eq!(
        ks_asm::assemble(Arch::Evm, ModeFlags::default(), "stop")
            .unwrap_err()
            .code(),
        ErrorCode::Arch
    );
}
