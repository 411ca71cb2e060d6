#![no_main]
use emuflow::{Architecture, ArtifactLog, EngineConfig, LoadedModule, VirtualAddress};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, code)) = data.split_first() else {
        return;
    };
    let arch = if selector & 1 == 0 {
        Architecture::X86
    } else {
        Architecture::X86_64
    };
    let Ok(module) = LoadedModule::from_shellcode(code, arch, VirtualAddress(0x1000)) else {
        return;
    };
    let mut config = EngineConfig::default();
    config.budget.max_steps = 10_000;
    config.budget.max_callee_steps = 1_000;
    let engine = module.engine(config);
    let _ = engine.explore_function(module.entry, &mut ArtifactLog::new());
    let _ = engine.emulate_basic_block(module.image.as_ref(), module.entry, &mut ArtifactLog::new());
});
