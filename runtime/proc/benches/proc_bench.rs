//! Benchmarks for the process lifecycle
//!
//! Run with: cargo bench -p kaal-proc

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use kaal_proc::mock::{MockPlatform, PageFlags, UserContext, PAGE_SIZE};
use kaal_proc::{ProcConfig, ProcessManager, TrapFrame, UserPtr};

const USER_BASE: usize = 0x40_0000;

fn bench_fork_exit_wait(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");

    for pages in [1, 16, 64] {
        let platform = MockPlatform::new();
        platform.set_program(|_| 0);
        let manager = ProcessManager::new(platform, ProcConfig::default());

        let mut space = manager.platform().new_address_space();
        space
            .map(USER_BASE, pages * PAGE_SIZE, PageFlags::READ | PageFlags::WRITE)
            .unwrap();
        manager.bootstrap("bench", space).unwrap();

        let mut ctx = UserContext::new(
            Arc::clone(&manager),
            TrapFrame::user(USER_BASE as u64, 0),
        );

        group.bench_function(format!("fork_exit_waitpid_{}_pages", pages), |b| {
            b.iter(|| {
                let child = ctx.fork();
                let waited = ctx.waitpid(child, UserPtr::new(USER_BASE), 0);
                // Reap the host thread so finished threads do not pile up
                manager.platform().join_all();
                black_box(waited)
            })
        });
    }

    group.finish();
}

fn bench_getpid(c: &mut Criterion) {
    let manager = ProcessManager::new(MockPlatform::new(), ProcConfig::default());
    manager
        .bootstrap("bench", manager.platform().new_address_space())
        .unwrap();
    let mut ctx = UserContext::new(Arc::clone(&manager), TrapFrame::new());

    c.bench_function("getpid", |b| b.iter(|| black_box(ctx.getpid())));
}

criterion_group!(benches, bench_fork_exit_wait, bench_getpid);
criterion_main!(benches);
