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

//! Concurrency harness.
//!
//! Drives several OS threads against one copy so the two controllers'
//! guarantees can be observed:
//!
//! - [`race_register`]: N callers try to borrow the same copy at once.
//! - [`hold_and_contend`]: one caller sits inside its transaction while a
//!   second one asks for the same copy.
//! - [`race_cas`]: N raw compare-and-swaps from the same version.
//! - [`stress`]: free-running borrow/return cycles with a concurrent auditor.
//!
//! Interleavings are forced with barriers and the ledger's read hook rather
//! than sleeps, so the staged scenarios are deterministic.

use crate::base::{CopyId, LoanId, MemberId};
use crate::config::Strategy;
use crate::controller::{Operation, ReadPhase};
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::store::Store;
use crossbeam::channel;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// What one simulated caller got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerOutcome {
    pub caller: u32,
    pub member_id: MemberId,
    pub result: Result<LoanId, LedgerError>,
    /// Time from the caller's start signal to its result.
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RaceReport {
    pub strategy: Strategy,
    pub outcomes: Vec<CallerOutcome>,
}

impl RaceReport {
    pub fn winners(&self) -> Vec<&CallerOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok()).collect()
    }

    /// Number of callers that failed with `error`.
    pub fn count(&self, error: &LedgerError) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result.as_ref().err() == Some(error))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ContentionReport {
    pub strategy: Strategy,
    pub hold: Duration,
    pub holder: CallerOutcome,
    pub contender: CallerOutcome,
    /// Time from the holder entering its transaction to the contender
    /// getting its answer.
    pub contender_latency: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StressReport {
    pub loans_opened: usize,
    pub loans_returned: usize,
    pub conflicts: usize,
    pub unavailable: usize,
    pub timeouts: usize,
    /// Audits run by the background auditor while callers were active.
    pub audits: usize,
    /// Audits that found an inconsistent copy. Must stay zero.
    pub violations: usize,
}

/// Caller `n` borrows as member `n`.
fn member_for(caller: u32) -> MemberId {
    MemberId(caller)
}

/// Races `callers` threads to register a loan on `copy_id`.
///
/// Optimistic ledgers get a read hook that holds every caller until all of
/// them have read the copy, so every commit is computed from the same
/// version: one wins, the rest see [`LedgerError::ConcurrencyConflict`].
/// A caller that fails before its read phase still checks in at that
/// barrier, so the others are never left waiting for it.
/// Pessimistic ledgers only share a start line; the row lock admits one
/// caller at a time and the rest see [`LedgerError::CopyUnavailable`].
pub fn race_register<S: Store>(ledger: &Ledger<S>, copy_id: CopyId, callers: u32) -> RaceReport {
    let start = Barrier::new(callers as usize);
    let strategy = ledger.strategy();

    let after_read = (strategy == Strategy::Optimistic).then(|| {
        let barrier = Arc::new(Barrier::new(callers as usize));
        let reached: Arc<Vec<AtomicBool>> =
            Arc::new((0..callers).map(|_| AtomicBool::new(false)).collect());

        let (hook_barrier, hook_reached) = (barrier.clone(), reached.clone());
        ledger.set_read_hook(Some(Arc::new(move |phase: &ReadPhase| {
            if phase.operation != Operation::Register || phase.copy_id != copy_id {
                return;
            }
            let caller = usize::try_from(phase.member_id.0).ok();
            if let Some(flag) = caller.and_then(|i| hook_reached.get(i)) {
                flag.store(true, Ordering::SeqCst);
                hook_barrier.wait();
            }
        })));
        (barrier, reached)
    });

    let outcomes: Vec<CallerOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..callers)
            .map(|caller| {
                let start = &start;
                let after_read = &after_read;
                s.spawn(move || {
                    let member_id = member_for(caller);
                    start.wait();
                    let started = Instant::now();
                    let result = ledger.register_loan(member_id, copy_id);
                    let elapsed = started.elapsed();

                    if let Some((barrier, reached)) = after_read {
                        if !reached[caller as usize].load(Ordering::SeqCst) {
                            barrier.wait();
                        }
                    }
                    CallerOutcome {
                        caller,
                        member_id,
                        result,
                        elapsed,
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("caller thread panicked"))
            .collect()
    });

    ledger.set_read_hook(None);
    RaceReport { strategy, outcomes }
}

/// Caller 0 enters its register transaction and stays there for `hold`;
/// caller 1 asks for the same copy while caller 0 is inside.
///
/// Under the pessimistic controller the contender cannot finish before the
/// holder commits, so `contender_latency >= hold`. Under the optimistic
/// controller the contender commits straight away and the holder loses.
pub fn hold_and_contend<S: Store>(
    ledger: &Ledger<S>,
    copy_id: CopyId,
    hold: Duration,
) -> ContentionReport {
    let holder_member = member_for(0);
    let contender_member = member_for(1);
    let (entered_tx, entered_rx) = channel::bounded::<Instant>(1);

    ledger.set_read_hook(Some(Arc::new(move |phase: &ReadPhase| {
        if phase.member_id == holder_member && phase.operation == Operation::Register {
            let entered = Instant::now();
            let _ = entered_tx.send(entered);
            thread::sleep(hold);
        }
    })));

    let (holder, contender, contender_latency) = thread::scope(|s| {
        let holder = s.spawn(|| {
            let started = Instant::now();
            let result = ledger.register_loan(holder_member, copy_id);
            // Drops the hook's sender so a contender never waits on a
            // holder that failed before its read phase.
            ledger.set_read_hook(None);
            CallerOutcome {
                caller: 0,
                member_id: holder_member,
                result,
                elapsed: started.elapsed(),
            }
        });

        let contender = s.spawn(|| {
            // The holder may fail before reaching its read phase.
            let entered = entered_rx.recv().ok();
            let started = Instant::now();
            let result = ledger.register_loan(contender_member, copy_id);
            let finished = Instant::now();
            let outcome = CallerOutcome {
                caller: 1,
                member_id: contender_member,
                result,
                elapsed: finished - started,
            };
            let latency = finished - entered.unwrap_or(started);
            (outcome, latency)
        });

        let holder = holder.join().expect("holder thread panicked");
        let (contender, latency) = contender.join().expect("contender thread panicked");
        (holder, contender, latency)
    });

    ledger.set_read_hook(None);
    ContentionReport {
        strategy: ledger.strategy(),
        hold,
        holder,
        contender,
        contender_latency,
    }
}

/// Has `callers` threads read the copy, meet at a barrier, then
/// compare-and-swap it back unchanged from the version they read.
///
/// Returns whether each caller's swap landed. Exactly one should.
pub fn race_cas<S: Store>(store: &S, copy_id: CopyId, callers: u32) -> Result<Vec<bool>, LedgerError> {
    let after_read = Barrier::new(callers as usize);

    thread::scope(|s| {
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let after_read = &after_read;
                s.spawn(move || -> Result<bool, LedgerError> {
                    let read = store.read_copy(copy_id);
                    after_read.wait();
                    let read = read?.ok_or(LedgerError::CopyNotFound)?;
                    store.compare_and_swap(copy_id, read.version, read.value)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("cas thread panicked"))
            .collect()
    })
}

/// Free-running borrow/return cycles on one copy.
///
/// Each caller tries `rounds` times to borrow the copy and, on success,
/// returns it. Returns that lose an optimistic race are retried by the
/// caller; the ledger itself never retries. A background auditor checks
/// the availability invariant until every caller is done.
pub fn stress<S: Store>(
    ledger: &Ledger<S>,
    copy_id: CopyId,
    callers: u32,
    rounds: usize,
) -> StressReport {
    let opened = AtomicUsize::new(0);
    let returned = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);
    let unavailable = AtomicUsize::new(0);
    let timeouts = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    let tally = |e: &LedgerError| match e {
        LedgerError::ConcurrencyConflict => conflicts.fetch_add(1, Ordering::Relaxed),
        LedgerError::CopyUnavailable => unavailable.fetch_add(1, Ordering::Relaxed),
        LedgerError::LockTimeout => timeouts.fetch_add(1, Ordering::Relaxed),
        _ => 0,
    };

    let (audits, violations) = thread::scope(|s| {
        let auditor = s.spawn(|| {
            let mut audits = 0;
            let mut violations = 0;
            while !done.load(Ordering::SeqCst) {
                if let Ok(found) = ledger.audit() {
                    audits += 1;
                    if !found.is_empty() {
                        violations += 1;
                    }
                }
                thread::yield_now();
            }
            (audits, violations)
        });

        let workers: Vec<_> = (0..callers)
            .map(|caller| {
                let tally = &tally;
                let opened = &opened;
                let returned = &returned;
                s.spawn(move || {
                    let member_id = member_for(caller);
                    for _ in 0..rounds {
                        let loan_id = match ledger.register_loan(member_id, copy_id) {
                            Ok(loan_id) => loan_id,
                            Err(e) => {
                                tally(&e);
                                continue;
                            }
                        };
                        opened.fetch_add(1, Ordering::Relaxed);

                        loop {
                            match ledger.return_loan(loan_id) {
                                Ok(()) => {
                                    returned.fetch_add(1, Ordering::Relaxed);
                                    break;
                                }
                                Err(e @ (LedgerError::ConcurrencyConflict | LedgerError::LockTimeout)) => {
                                    tally(&e);
                                    thread::yield_now();
                                }
                                Err(e) => {
                                    tally(&e);
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker thread panicked");
        }
        done.store(true, Ordering::SeqCst);
        auditor.join().expect("auditor thread panicked")
    });

    StressReport {
        loans_opened: opened.into_inner(),
        loans_returned: returned.into_inner(),
        conflicts: conflicts.into_inner(),
        unavailable: unavailable.into_inner(),
        timeouts: timeouts.into_inner(),
        audits,
        violations,
    }
}
