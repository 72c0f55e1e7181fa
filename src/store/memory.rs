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

//! In-memory [`Store`] backed by [`DashMap`] tables.
//!
//! # Thread Safety
//!
//! Records live in sharded maps so unrelated reads never contend. Every
//! commit validates and applies its writes while holding the write side of
//! `commit_gate`, which makes multi-record commits atomic with respect to
//! each other and to [`Store::snapshot`].
//!
//! Row locks are an in-process lock map: one [`RowLock`] per copy, created
//! on first use. Acquisition waits on a [`Condvar`] with a deadline, so a
//! blocked transaction always gives up after its timeout.

use super::{Isolation, Snapshot, Store, Versioned, Write};
use crate::base::{CopyId, LoanId, Version};
use crate::copy::BookCopy;
use crate::error::LedgerError;
use crate::loan::Loan;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxnId(u64);

/// Exclusive lock on one copy row.
#[derive(Debug, Default)]
struct RowLock {
    holder: Mutex<Option<TxnId>>,
    released: Condvar,
}

impl RowLock {
    /// Waits up to `timeout` for the row. Re-entrant for the holder.
    fn acquire(&self, txn: TxnId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut holder = self.holder.lock();
        let mut timed_out = false;
        loop {
            match *holder {
                None => {
                    *holder = Some(txn);
                    return true;
                }
                Some(owner) if owner == txn => return true,
                Some(_) if timed_out => return false,
                Some(_) => {
                    timed_out = self.released.wait_until(&mut holder, deadline).timed_out();
                }
            }
        }
    }

    fn release(&self, txn: TxnId) {
        let mut holder = self.holder.lock();
        if *holder == Some(txn) {
            *holder = None;
            // Waiters race for the row; no FIFO ordering is promised.
            self.released.notify_one();
        }
    }

    /// `true` if some transaction other than `txn` holds the row.
    fn held_by_other(&self, txn: Option<TxnId>) -> bool {
        match *self.holder.lock() {
            Some(owner) => Some(owner) != txn,
            None => false,
        }
    }
}

/// Releases its row lock when dropped.
#[derive(Debug)]
struct RowGuard {
    lock: Arc<RowLock>,
    txn: TxnId,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        self.lock.release(self.txn);
    }
}

/// Transaction handle for [`MemoryStore`].
///
/// Holds the staged writes and any row locks taken so far. Dropping the
/// handle without committing discards the writes and releases the locks.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: TxnId,
    isolation: Isolation,
    writes: Vec<Write>,
    guards: Vec<RowGuard>,
}

impl MemoryTransaction {
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Number of writes staged so far.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

/// In-process implementation of the storage port.
#[derive(Debug)]
pub struct MemoryStore {
    copies: DashMap<CopyId, Versioned<BookCopy>>,
    loans: DashMap<LoanId, Versioned<Loan>>,
    row_locks: DashMap<CopyId, Arc<RowLock>>,
    /// Write side held by commits, read side by snapshots.
    commit_gate: RwLock<()>,
    next_loan_id: AtomicU64,
    next_txn_id: AtomicU64,
    online: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            copies: DashMap::new(),
            loans: DashMap::new(),
            row_locks: DashMap::new(),
            commit_gate: RwLock::new(()),
            next_loan_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the connection to the backend.
    ///
    /// While offline every operation fails with
    /// [`LedgerError::StorageUnavailable`]; open transactions keep their
    /// row locks until dropped.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), LedgerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::StorageUnavailable)
        }
    }

    fn row_lock(&self, id: CopyId) -> Arc<RowLock> {
        // Clone out of the shard so the map is not held while waiting.
        self.row_locks.entry(id).or_default().value().clone()
    }

    fn row_locked_by_other(&self, id: CopyId, txn: Option<TxnId>) -> bool {
        self.row_locks
            .get(&id)
            .is_some_and(|lock| lock.held_by_other(txn))
    }

    /// Checks every staged write against current state. Caller holds the gate.
    fn validate(&self, txn: &MemoryTransaction) -> Result<(), LedgerError> {
        for write in &txn.writes {
            match write {
                Write::PutCopy { expected, copy } => {
                    let current = self.copies.get(&copy.id()).ok_or(LedgerError::CopyNotFound)?;
                    if current.version != *expected
                        || self.row_locked_by_other(copy.id(), Some(txn.id))
                    {
                        return Err(LedgerError::ConcurrencyConflict);
                    }
                }
                Write::InsertLoan(loan) => {
                    if self.loans.contains_key(&loan.id())
                        || self.row_locked_by_other(loan.copy_id(), Some(txn.id))
                    {
                        return Err(LedgerError::ConcurrencyConflict);
                    }
                }
                Write::PutLoan { expected, loan } => {
                    let current = self.loans.get(&loan.id()).ok_or(LedgerError::LoanNotFound)?;
                    if current.version != *expected
                        || self.row_locked_by_other(loan.copy_id(), Some(txn.id))
                    {
                        return Err(LedgerError::ConcurrencyConflict);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(&self, write: Write) {
        match write {
            Write::PutCopy { expected, copy } => {
                self.copies.insert(
                    copy.id(),
                    Versioned {
                        value: copy,
                        version: expected.next(),
                    },
                );
            }
            Write::InsertLoan(loan) => {
                self.loans.insert(
                    loan.id(),
                    Versioned {
                        value: loan,
                        version: Version::INITIAL,
                    },
                );
            }
            Write::PutLoan { expected, loan } => {
                self.loans.insert(
                    loan.id(),
                    Versioned {
                        value: loan,
                        version: expected.next(),
                    },
                );
            }
        }
    }

    fn collect_snapshot(&self) -> Snapshot {
        let mut copies: Vec<_> = self.copies.iter().map(|r| r.value().clone()).collect();
        let mut loans: Vec<_> = self.loans.iter().map(|r| r.value().clone()).collect();
        copies.sort_by_key(|c| c.value.id());
        loans.sort_by_key(|l| l.value.id());
        Snapshot { copies, loans }
    }

    /// Caller holds the gate.
    fn assert_invariants(&self) {
        if cfg!(debug_assertions) {
            let violations = self.collect_snapshot().violations();
            debug_assert!(
                violations.is_empty(),
                "Invariant violated: availability disagrees with active loans for copies {:?}",
                violations
            );
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Txn = MemoryTransaction;

    fn read_copy(&self, id: CopyId) -> Result<Option<Versioned<BookCopy>>, LedgerError> {
        self.ensure_online()?;
        Ok(self.copies.get(&id).map(|r| r.value().clone()))
    }

    fn read_loan(&self, id: LoanId) -> Result<Option<Versioned<Loan>>, LedgerError> {
        self.ensure_online()?;
        Ok(self.loans.get(&id).map(|r| r.value().clone()))
    }

    fn compare_and_swap(
        &self,
        id: CopyId,
        expected: Version,
        copy: BookCopy,
    ) -> Result<bool, LedgerError> {
        self.ensure_online()?;
        debug_assert_eq!(id, copy.id(), "compare_and_swap key must match record id");

        let _gate = self.commit_gate.write();
        let Some(mut current) = self.copies.get_mut(&id) else {
            return Err(LedgerError::CopyNotFound);
        };
        if current.version != expected || self.row_locked_by_other(id, None) {
            return Ok(false);
        }
        current.value = copy;
        current.version = expected.next();
        Ok(true)
    }

    fn insert_copy(&self, copy: BookCopy) -> Result<Version, LedgerError> {
        self.ensure_online()?;
        let _gate = self.commit_gate.write();
        match self.copies.entry(copy.id()) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateCopy),
            Entry::Vacant(entry) => {
                entry.insert(Versioned {
                    value: copy,
                    version: Version::INITIAL,
                });
                Ok(Version::INITIAL)
            }
        }
    }

    fn next_loan_id(&self) -> Result<LoanId, LedgerError> {
        self.ensure_online()?;
        Ok(LoanId(self.next_loan_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn snapshot(&self) -> Result<Snapshot, LedgerError> {
        self.ensure_online()?;
        let _gate = self.commit_gate.read();
        Ok(self.collect_snapshot())
    }

    fn begin(&self, isolation: Isolation) -> Result<MemoryTransaction, LedgerError> {
        self.ensure_online()?;
        Ok(MemoryTransaction {
            id: TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst)),
            isolation,
            writes: Vec::new(),
            guards: Vec::new(),
        })
    }

    fn lock_copy(
        &self,
        txn: &mut MemoryTransaction,
        id: CopyId,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        debug_assert_eq!(
            txn.isolation,
            Isolation::Serializable,
            "row locks belong to serializable transactions"
        );
        self.ensure_online()?;
        if !self.copies.contains_key(&id) {
            return Err(LedgerError::CopyNotFound);
        }

        let lock = self.row_lock(id);
        if !lock.acquire(txn.id, timeout) {
            return Err(LedgerError::LockTimeout);
        }
        debug!(copy_id = %id, txn_id = txn.id.0, "row lock acquired");
        txn.guards.push(RowGuard { lock, txn: txn.id });
        Ok(())
    }

    fn stage(&self, txn: &mut MemoryTransaction, write: Write) {
        txn.writes.push(write);
    }

    fn commit(&self, mut txn: MemoryTransaction) -> Result<(), LedgerError> {
        self.ensure_online()?;
        {
            let _gate = self.commit_gate.write();
            self.validate(&txn)?;
            for write in txn.writes.drain(..) {
                self.apply(write);
            }
            self.assert_invariants();
        }
        // Row locks are released only once the writes are visible.
        drop(txn);
        Ok(())
    }

    fn rollback(&self, txn: MemoryTransaction) {
        debug!(txn_id = txn.id.0, writes = txn.writes.len(), "transaction rolled back");
        drop(txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{BookId, MemberId};
    use chrono::Utc;
    use std::thread;

    fn stocked(ids: &[u32]) -> MemoryStore {
        let store = MemoryStore::new();
        for id in ids {
            store.insert_copy(BookCopy::new(CopyId(*id), BookId(1))).unwrap();
        }
        store
    }

    fn open_loan(store: &MemoryStore, copy_id: CopyId) -> Loan {
        let loan_id = store.next_loan_id().unwrap();
        Loan::open(loan_id, MemberId(1), copy_id, Utc::now(), chrono::Duration::days(14)).unwrap()
    }

    #[test]
    fn insert_copy_rejects_duplicates() {
        let store = stocked(&[1]);
        assert_eq!(
            store.insert_copy(BookCopy::new(CopyId(1), BookId(2))),
            Err(LedgerError::DuplicateCopy)
        );
    }

    #[test]
    fn cas_succeeds_once_per_version() {
        let store = stocked(&[1]);
        let read = store.read_copy(CopyId(1)).unwrap().unwrap();

        assert!(store.compare_and_swap(CopyId(1), read.version, read.value.clone()).unwrap());
        assert!(!store.compare_and_swap(CopyId(1), read.version, read.value.clone()).unwrap());

        let after = store.read_copy(CopyId(1)).unwrap().unwrap();
        assert_eq!(after.version, read.version.next());
    }

    #[test]
    fn cas_on_missing_copy_fails() {
        let store = MemoryStore::new();
        let copy = BookCopy::new(CopyId(9), BookId(1));
        assert_eq!(
            store.compare_and_swap(CopyId(9), Version::INITIAL, copy),
            Err(LedgerError::CopyNotFound)
        );
    }

    #[test]
    fn commit_applies_all_writes_and_bumps_versions() {
        let store = stocked(&[1]);
        let copy = store.read_copy(CopyId(1)).unwrap().unwrap();
        let loan = open_loan(&store, CopyId(1));

        let mut txn = store.begin(Isolation::Default).unwrap();
        store.stage(&mut txn, Write::InsertLoan(loan.clone()));
        store.stage(
            &mut txn,
            Write::PutCopy {
                expected: copy.version,
                copy: copy.value.check_out().unwrap(),
            },
        );
        assert_eq!(txn.pending_writes(), 2);
        store.commit(txn).unwrap();

        let copy_after = store.read_copy(CopyId(1)).unwrap().unwrap();
        assert!(!copy_after.value.available());
        assert_eq!(copy_after.version, copy.version.next());
        let stored = store.read_loan(loan.id()).unwrap().unwrap();
        assert_eq!(stored.value, loan);
        assert_eq!(stored.version, Version::INITIAL);
    }

    #[test]
    fn stale_write_aborts_whole_commit() {
        let store = stocked(&[1]);
        let copy = store.read_copy(CopyId(1)).unwrap().unwrap();

        // Someone else moves the version first.
        assert!(store.compare_and_swap(CopyId(1), copy.version, copy.value.clone()).unwrap());

        let loan = open_loan(&store, CopyId(1));
        let mut txn = store.begin(Isolation::Default).unwrap();
        store.stage(&mut txn, Write::InsertLoan(loan.clone()));
        store.stage(
            &mut txn,
            Write::PutCopy {
                expected: copy.version,
                copy: copy.value.check_out().unwrap(),
            },
        );
        assert_eq!(store.commit(txn), Err(LedgerError::ConcurrencyConflict));

        // Neither write landed.
        assert!(store.read_loan(loan.id()).unwrap().is_none());
        assert!(store.read_copy(CopyId(1)).unwrap().unwrap().value.available());
    }

    #[test]
    fn row_lock_times_out_for_second_transaction() {
        let store = stocked(&[1]);
        let mut holder = store.begin(Isolation::Serializable).unwrap();
        store.lock_copy(&mut holder, CopyId(1), Duration::from_millis(10)).unwrap();

        let mut waiter = store.begin(Isolation::Serializable).unwrap();
        let started = Instant::now();
        assert_eq!(
            store.lock_copy(&mut waiter, CopyId(1), Duration::from_millis(50)),
            Err(LedgerError::LockTimeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn row_lock_is_reentrant_for_holder() {
        let store = stocked(&[1]);
        let mut txn = store.begin(Isolation::Serializable).unwrap();
        store.lock_copy(&mut txn, CopyId(1), Duration::from_millis(10)).unwrap();
        store.lock_copy(&mut txn, CopyId(1), Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn dropping_transaction_releases_row_lock() {
        let store = stocked(&[1]);
        let mut holder = store.begin(Isolation::Serializable).unwrap();
        store.lock_copy(&mut holder, CopyId(1), Duration::from_millis(10)).unwrap();
        drop(holder);

        let mut next = store.begin(Isolation::Serializable).unwrap();
        store.lock_copy(&mut next, CopyId(1), Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn waiter_acquires_after_holder_commits() {
        let store = stocked(&[1]);
        let mut holder = store.begin(Isolation::Serializable).unwrap();
        store.lock_copy(&mut holder, CopyId(1), Duration::from_millis(10)).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let mut txn = store.begin(Isolation::Serializable).unwrap();
                store.lock_copy(&mut txn, CopyId(1), Duration::from_secs(5))
            });
            thread::sleep(Duration::from_millis(20));
            store.commit(holder).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
    }

    #[test]
    fn locked_row_rejects_cas_and_foreign_commits() {
        let store = stocked(&[1]);
        let copy = store.read_copy(CopyId(1)).unwrap().unwrap();

        let mut holder = store.begin(Isolation::Serializable).unwrap();
        store.lock_copy(&mut holder, CopyId(1), Duration::from_millis(10)).unwrap();

        assert!(!store.compare_and_swap(CopyId(1), copy.version, copy.value.clone()).unwrap());

        let mut other = store.begin(Isolation::Default).unwrap();
        store.stage(
            &mut other,
            Write::PutCopy {
                expected: copy.version,
                copy: copy.value.clone(),
            },
        );
        assert_eq!(store.commit(other), Err(LedgerError::ConcurrencyConflict));

        store.rollback(holder);
        assert!(store.compare_and_swap(CopyId(1), copy.version, copy.value).unwrap());
    }

    #[test]
    fn lock_on_missing_copy_fails() {
        let store = MemoryStore::new();
        let mut txn = store.begin(Isolation::Serializable).unwrap();
        assert_eq!(
            store.lock_copy(&mut txn, CopyId(3), Duration::from_millis(10)),
            Err(LedgerError::CopyNotFound)
        );
    }

    #[test]
    fn offline_store_rejects_everything() {
        let store = stocked(&[1]);
        store.set_online(false);
        assert_eq!(store.read_copy(CopyId(1)), Err(LedgerError::StorageUnavailable));
        assert_eq!(store.next_loan_id(), Err(LedgerError::StorageUnavailable));
        assert!(matches!(
            store.begin(Isolation::Default),
            Err(LedgerError::StorageUnavailable)
        ));

        store.set_online(true);
        assert!(store.read_copy(CopyId(1)).unwrap().is_some());
    }

    #[test]
    fn loan_ids_are_strictly_increasing() {
        let store = MemoryStore::new();
        let a = store.next_loan_id().unwrap();
        let b = store.next_loan_id().unwrap();
        assert!(b > a);
    }
}
