use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use emuflow::{Architecture, ArtifactLog, EngineConfig, LoadedModule, VirtualAddress};

const BASE: VirtualAddress = VirtualAddress(0x1000);

fn counted_loop(iterations: u32) -> Vec<u8> {
    // mov ecx, n; dec ecx; jnz -3; ret
    let mut code = vec![0xb9];
    code.extend_from_slice(&iterations.to_le_bytes());
    code.extend_from_slice(&[0x49, 0x75, 0xfd, 0xc3]);
    code
}

fn bench_explore(c: &mut Criterion) {
    let mut group = c.benchmark_group("explore_function");
    for iterations in [100u32, 10_000] {
        let module = LoadedModule::from_shellcode(&counted_loop(iterations), Architecture::X86, BASE)
            .expect("shellcode loads");
        let engine = module.engine(EngineConfig::default());
        group.throughput(Throughput::Elements(iterations as u64 * 2));
        group.bench_function(format!("loop_{}", iterations), |b| {
            b.iter(|| {
                let mut log = ArtifactLog::new();
                engine.explore_function(BASE, &mut log).expect("loop returns")
            })
        });
    }
    group.finish();
}

fn bench_block(c: &mut Criterion) {
    // call +3; xor eax, eax; ret; push eax; pop eax; ret
    let code = [0xe8, 0x03, 0x00, 0x00, 0x00, 0x31, 0xc0, 0xc3, 0x50, 0x58, 0xc3];
    let module = LoadedModule::from_shellcode(&code, Architecture::X86, BASE).expect("shellcode loads");
    let engine = module.engine(EngineConfig::default());
    c.bench_function("emulate_basic_block", |b| {
        b.iter(|| {
            let mut log = ArtifactLog::new();
            engine
                .emulate_basic_block(module.image.as_ref(), BASE, &mut log)
                .expect("block steps")
        })
    });
}

criterion_group!(benches, bench_explore, bench_block);
criterion_main!(benches);
