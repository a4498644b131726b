use criterion::{criterion_group, criterion_main, Criterion};
use ledger_core::Chain;
use ledger_storage::SledStore;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

fn bench_append(c: &mut Criterion) {
    let store = Arc::new(SledStore::open_temporary().expect("temporary store"));
    let chain = Chain::open(store).expect("open chain");
    let mut rng = StdRng::seed_from_u64(42);

    c.bench_function("append_256b", |b| {
        b.iter(|| {
            let payload: Vec<u8> = (0..256).map(|_| rng.gen()).collect();
            chain.append(payload).expect("append");
        });
    });
}

fn bench_traverse(c: &mut Criterion) {
    let store = Arc::new(SledStore::open_temporary().expect("temporary store"));
    let chain = Chain::open(store).expect("open chain");
    for i in 0..1_000 {
        chain.append(format!("entry {i}")).expect("append");
    }

    c.bench_function("traverse_1000", |b| {
        b.iter(|| {
            let n = chain.iter().filter(|block| block.is_ok()).count();
            assert_eq!(n, 1_001);
        });
    });
}

criterion_group!(benches, bench_append, bench_traverse);
criterion_main!(benches);
