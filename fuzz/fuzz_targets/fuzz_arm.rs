#![no_main]
use libfuzzer_sys::fuzz_target;
use ks_asm::{Arch, Engine, Mode, ModeFlags};

fuzz_target!(|data: &str| {
    let modes: [ModeFlags; 3] = [Mode::Arm.into(), Mode::Thumb.into(), Mode::Arm | Mode::BigEndian];
    for mode in modes {
        if let Ok(mut engine) = Engine::open(Arch::Arm, mode) {
            let _ = engine.assemble(data, 0);
            let _ = engine.assemble(data, 0x8000);
        }
    }
});
