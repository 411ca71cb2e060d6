//! Function exploration: stack delta, step-over containment, artifacts.

mod common;

use common::{assemble, engine, engine_with, programs, shellcode, va, Recorder};
use emuflow::core::basic_block::BasicBlock;
use emuflow::core::reference::{CallXref, JumpXref, MemoryWriteXref};
use emuflow::core::symbol::SymbolTable;
use emuflow::{
    AnalysisError, Architecture, Artifact, ArtifactLog, Emulator, EngineConfig, JsonLinesCollection,
    VirtualAddress,
};

fn initial_sp() -> u64 {
    EngineConfig::default().stack.initial_pointer()
}

#[test]
fn test_stack_delta_x86() {
    let cases: [(&[u8], i64, u64); 3] = [
        (programs::PUSH_TWO, -8, 4),
        (programs::POP_TWO, 8, 2),
        (programs::BALANCED, 0, 4),
    ];
    for (code, delta, ret) in cases {
        let engine = engine(code);
        let mut log = ArtifactLog::new();
        let exploration = engine.explore_function(va(0), &mut log).unwrap();
        assert_eq!(exploration.stack_delta, delta);
        assert_eq!(exploration.stack_delta_words(4), delta / 4);
        assert_eq!(exploration.return_address, va(ret));
        assert_eq!(exploration.blocks, vec![BasicBlock::new(va(0), va(ret))]);
        assert_eq!(log.basic_blocks().count(), 1);
        assert_eq!(log.jump_xrefs().count(), 0);
    }
}

#[test]
fn test_stack_delta_x86_64_uses_eight_byte_words() {
    let module = shellcode(Architecture::X86_64, programs::PUSH_TWO);
    let engine = module.engine(EngineConfig::default());
    let exploration = engine.explore_function(va(0), &mut ArtifactLog::new()).unwrap();
    assert_eq!(exploration.stack_delta, -16);
    assert_eq!(exploration.stack_delta_words(8), -2);
}

#[test]
fn test_callee_is_stepped_over() {
    let mut engine = engine(programs::CALL_LEAF);
    let traced = Recorder::default();
    let jumps = Recorder::default();
    {
        let traced = traced.clone();
        engine.register_instruction_trace_handler(move |i| traced.push(i.address));
        let jumps = jumps.clone();
        engine.register_jump_trace_handler(move |x| jumps.push(*x));
    }

    let mut log = ArtifactLog::new();
    let exploration = engine.explore_function(va(0), &mut log).unwrap();

    let return_slot = VirtualAddress(initial_sp() - 4);
    assert_eq!(
        log.artifacts(),
        &[
            Artifact::Call(CallXref {
                from: va(0),
                to: Some(va(8)),
            }),
            Artifact::BasicBlock(BasicBlock::new(va(0), va(0))),
            Artifact::MemoryWrite(MemoryWriteXref {
                from: va(0),
                to: return_slot,
            }),
            Artifact::Jump(JumpXref {
                from: va(0),
                to: va(5),
            }),
            Artifact::BasicBlock(BasicBlock::new(va(5), va(7))),
        ]
    );
    assert_eq!(traced.values(), vec![va(0), va(5)]);
    assert_eq!(jumps.values(), vec![JumpXref { from: va(0), to: va(5) }]);
    assert_eq!(exploration.stack_delta, 0);
    // call, the three callee instructions, then the xor
    assert_eq!(exploration.steps, 5);
}

#[test]
fn test_memory_reads_are_reported() {
    let engine = engine(programs::POP_TWO);
    let mut log = ArtifactLog::new();
    engine.explore_function(va(0), &mut log).unwrap();
    let reads: Vec<(VirtualAddress, VirtualAddress)> =
        log.memory_read_xrefs().map(|x| (x.from, x.to)).collect();
    assert_eq!(
        reads,
        vec![
            (va(0), VirtualAddress(initial_sp())),
            (va(1), VirtualAddress(initial_sp() + 4)),
        ]
    );
}

#[test]
fn test_memory_tracing_can_be_disabled() {
    let module = shellcode(Architecture::X86, programs::CALL_LEAF);
    let mut config = EngineConfig::default();
    config.trace_memory_accesses = false;
    let engine = engine_with(&module, config, SymbolTable::new());
    let mut log = ArtifactLog::new();
    engine.explore_function(va(0), &mut log).unwrap();
    assert_eq!(log.memory_write_xrefs().count(), 0);
    assert_eq!(log.memory_read_xrefs().count(), 0);
    assert_eq!(log.call_xrefs().count(), 1);
}

#[test]
fn test_exploration_is_deterministic() {
    let engine = engine(programs::CALL_LEAF);
    let mut first = ArtifactLog::new();
    let mut second = ArtifactLog::new();
    let a = engine.explore_function(va(0), &mut first).unwrap();
    let b = engine.explore_function(va(0), &mut second).unwrap();
    assert_eq!(a, b);
    assert_eq!(first, second);
}

#[test]
fn test_spinning_function_exceeds_budget() {
    let module = shellcode(Architecture::X86, programs::SPIN);
    let mut config = EngineConfig::default();
    config.budget.max_steps = 100;
    let engine = engine_with(&module, config, SymbolTable::new());

    let err = engine.explore_function(va(0), &mut ArtifactLog::new()).unwrap_err();
    assert!(err.is_budget_exceeded());
    assert!(err.is_recoverable());
    match err {
        AnalysisError::BudgetExceeded { steps, .. } => assert_eq!(steps, 101),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_fault_stops_emission() {
    // xor eax, eax; call eax; ret
    let engine = engine(&[0x31, 0xc0, 0xff, 0xd0, 0xc3]);
    let mut log = ArtifactLog::new();
    let err = engine.explore_function(va(0), &mut log).unwrap_err();

    assert!(matches!(err, AnalysisError::InvalidFetch { .. }));
    assert_eq!(
        log.artifacts(),
        &[
            Artifact::Call(CallXref {
                from: va(2),
                to: None,
            }),
            Artifact::BasicBlock(BasicBlock::new(va(0), va(2))),
        ]
    );
}

#[test]
fn test_runaway_callee_restores_caller() {
    // call 0x1006; ret; jmp $
    let module = shellcode(Architecture::X86, &[0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xeb, 0xfe]);
    let mut config = EngineConfig::default();
    config.budget.max_callee_steps = 50;
    let engine = engine_with(&module, config, SymbolTable::new());

    let mut emu = engine.create_emulator().unwrap();
    let err = engine
        .explore_function_with(&mut emu, va(0), &mut ArtifactLog::new())
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Emulation { pc, .. } if pc == va(0)));
    assert_eq!(emu.instruction_pointer(), va(0));
    assert_eq!(emu.stack_pointer().value(), initial_sp());
}

#[test]
fn test_explore_functions_in_parallel() {
    let code = assemble(0x20, &[(0x00, programs::PUSH_TWO), (0x10, programs::BALANCED)]);
    let engine = engine(&code);
    let entries = [va(0x10), va(0), VirtualAddress(0x9000)];
    let results = engine.explore_functions(&entries);

    assert_eq!(results.len(), 3);
    let order: Vec<VirtualAddress> = results.iter().map(|(entry, _)| *entry).collect();
    assert_eq!(order, entries);

    let (balanced, log) = results[0].1.as_ref().unwrap();
    assert_eq!(balanced.stack_delta, 0);
    assert_eq!(log.basic_blocks().count(), 1);
    let (pushes, _) = results[1].1.as_ref().unwrap();
    assert_eq!(pushes.stack_delta, -8);
    assert!(results[2].1.is_err());
}

#[test]
fn test_json_lines_match_log() {
    let engine = engine(programs::CALL_LEAF);
    let mut log = ArtifactLog::new();
    engine.explore_function(va(0), &mut log).unwrap();

    let mut lines = JsonLinesCollection::new(Vec::new());
    engine.explore_function(va(0), &mut lines).unwrap();
    assert_eq!(lines.written(), log.len());

    let bytes = lines.into_inner().unwrap();
    let parsed: Vec<Artifact> = String::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(parsed, log.artifacts());
}
