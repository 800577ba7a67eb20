#![no_main]
use libfuzzer_sys::fuzz_target;
use ks_asm::{Arch, Engine, ModeFlags};

fuzz_target!(|data: &str| {
    if let Ok(mut engine) = Engine::open(Arch::Arm64, ModeFlags::default()) {
        let _ = engine.assemble(data, 0);
        let _ = engine.assemble(data, 0xFFFF_FFFF_FFFF_F000);
    }
});
