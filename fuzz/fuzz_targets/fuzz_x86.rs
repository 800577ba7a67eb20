#![no_main]
use libfuzzer_sys::fuzz_target;
use ks_asm::{Arch, Engine, Mode, OptionType};

fuzz_target!(|data: &str| {
    // Every width and both grammars: must never panic, only return Ok/Err.
    for mode in [Mode::Mode16, Mode::Mode32, Mode::Mode64] {
        let Ok(mut engine) = Engine::open(Arch::X86, mode) else {
            return;
        };
        let _ = engine.assemble(data, 0);
        let _ = engine.assemble(data, 0x40_0000);
        if engine.set_option(OptionType::Syntax, 2).is_ok() {
            let _ = engine.assemble(data, 0);
        }
    }

    // The statement-list form splits on newlines.
    if let Ok(mut engine) = Engine::open(Arch::X86, Mode::Mode64) {
        let _ = engine.assemble_statements(data.lines(), 0);
    }
});
