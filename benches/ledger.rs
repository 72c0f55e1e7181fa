// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Benchmarks for the ledger.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single-threaded loan/return cycles per strategy
//! - Parallel cycles on disjoint copies
//! - Parallel contention on one copy
//! - Scaling with number of threads

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use library_ledger::{BookId, CopyId, Ledger, LedgerConfig, MemberId, Strategy};
use rayon::prelude::*;

const STRATEGIES: [Strategy; 2] = [Strategy::Optimistic, Strategy::Pessimistic];

// =============================================================================
// Helper Functions
// =============================================================================

fn stocked(strategy: Strategy, copies: u32) -> Ledger {
    let ledger = Ledger::with_config(LedgerConfig::default().with_strategy(strategy));
    for id in 1..=copies {
        ledger.stock_copy(CopyId(id), BookId(id)).unwrap();
    }
    ledger
}

/// One borrow/return round; losing a race is not an error here.
fn cycle(ledger: &Ledger, member: u32, copy: u32) {
    if let Ok(loan_id) = ledger.register_loan(MemberId(member), CopyId(copy)) {
        while ledger.return_loan(loan_id).is_err() {}
    }
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_single_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_cycle");

    for strategy in STRATEGIES {
        group.bench_function(strategy.to_string(), |b| {
            let ledger = stocked(strategy, 1);
            b.iter(|| {
                let loan_id = ledger
                    .register_loan(black_box(MemberId(1)), black_box(CopyId(1)))
                    .unwrap();
                ledger.return_loan(loan_id).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_rejected_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("rejected_register");

    for strategy in STRATEGIES {
        group.bench_function(strategy.to_string(), |b| {
            let ledger = stocked(strategy, 1);
            ledger.register_loan(MemberId(1), CopyId(1)).unwrap();
            b.iter(|| {
                let _ = ledger.register_loan(black_box(MemberId(2)), black_box(CopyId(1)));
            })
        });
    }
    group.finish();
}

fn bench_list_active_loans(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_active_loans");

    for count in [100u32, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let ledger = stocked(Strategy::Optimistic, count);
            for id in 1..=count {
                ledger.register_loan(MemberId(id), CopyId(id)).unwrap();
            }
            b.iter(|| black_box(ledger.list_active_loans().unwrap()))
        });
    }
    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_parallel_disjoint_copies(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_disjoint_copies");
    let copies = 1_000u32;

    for strategy in STRATEGIES {
        group.throughput(Throughput::Elements(copies as u64));
        group.bench_function(strategy.to_string(), |b| {
            let ledger = stocked(strategy, copies);
            b.iter(|| {
                (1..=copies).into_par_iter().for_each(|id| cycle(&ledger, id, id));
            })
        });
    }
    group.finish();
}

fn bench_parallel_same_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_same_copy");
    let attempts = 1_000u32;

    for strategy in STRATEGIES {
        group.throughput(Throughput::Elements(attempts as u64));
        group.bench_function(strategy.to_string(), |b| {
            let ledger = stocked(strategy, 1);
            b.iter(|| {
                (0..attempts).into_par_iter().for_each(|member| cycle(&ledger, member, 1));
            })
        });
    }
    group.finish();
}

// =============================================================================
// Scaling Benchmarks
// =============================================================================

fn bench_thread_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_scaling");
    let total_cycles = 10_000u32;
    let copies = 16u32;

    for strategy in STRATEGIES {
        for num_threads in [1, 2, 4, 8].iter() {
            group.throughput(Throughput::Elements(total_cycles as u64));
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), num_threads),
                num_threads,
                |b, &num_threads| {
                    // Configure rayon thread pool for this benchmark
                    let pool = rayon::ThreadPoolBuilder::new()
                        .num_threads(num_threads)
                        .build()
                        .unwrap();
                    let ledger = stocked(strategy, copies);

                    b.iter(|| {
                        pool.install(|| {
                            (0..total_cycles).into_par_iter().for_each(|i| {
                                cycle(&ledger, i, i % copies + 1);
                            });
                        });
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_single_cycle,
    bench_rejected_register,
    bench_list_active_loans,
    bench_parallel_disjoint_copies,
    bench_parallel_same_copy,
    bench_thread_scaling,
);
criterion_main!(benches);
