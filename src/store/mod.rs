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

//! Storage port.
//!
//! The ledger is written against [`Store`], the minimum transactional
//! contract it needs from a backend:
//!
//! - versioned reads of copy and loan records,
//! - single-record compare-and-swap,
//! - transactions whose staged writes commit all-or-nothing, each write
//!   guarded by the version it was computed from,
//! - per-copy exclusive row locks with a bounded wait.
//!
//! [`MemoryStore`] is the in-process implementation.

mod memory;

pub use memory::{MemoryStore, MemoryTransaction};

use crate::base::{BookId, CopyId, LoanId, Version};
use crate::copy::BookCopy;
use crate::error::LedgerError;
use crate::loan::{ActiveLoan, Loan};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// A record paired with the version token it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Transaction isolation requested at [`Store::begin`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// Writes are validated against their read versions at commit.
    #[default]
    Default,
    /// Row locks are taken before reads and held until commit or rollback.
    Serializable,
}

/// A write staged inside a transaction.
///
/// Updates carry the version the new value was computed from; commit fails
/// with [`LedgerError::ConcurrencyConflict`] if any of them is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    PutCopy { expected: Version, copy: BookCopy },
    InsertLoan(Loan),
    PutLoan { expected: Version, loan: Loan },
}

/// A consistent point-in-time view of every record.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub copies: Vec<Versioned<BookCopy>>,
    pub loans: Vec<Versioned<Loan>>,
}

impl Snapshot {
    /// Active loans joined with their copy's book, ordered by loan id.
    ///
    /// An active loan on a copy that is not stocked cannot be joined; it is
    /// logged and left out here, and reported by [`Snapshot::violations`].
    pub fn active_loans(&self) -> Vec<ActiveLoan> {
        let books: HashMap<CopyId, BookId> = self
            .copies
            .iter()
            .map(|c| (c.value.id(), c.value.book_id()))
            .collect();

        let mut active: Vec<ActiveLoan> = self
            .loans
            .iter()
            .map(|l| &l.value)
            .filter(|loan| loan.is_active())
            .filter_map(|loan| {
                let Some(book_id) = books.get(&loan.copy_id()).copied() else {
                    warn!(
                        loan_id = %loan.id(),
                        copy_id = %loan.copy_id(),
                        "active loan references a copy that is not stocked"
                    );
                    return None;
                };
                Some(ActiveLoan {
                    loan_id: loan.id(),
                    copy_id: loan.copy_id(),
                    book_id,
                    member_id: loan.member_id(),
                    loan_date: loan.loan_date(),
                    due_date: loan.due_date(),
                })
            })
            .collect();
        active.sort_by_key(|l| l.loan_id);
        active
    }

    /// Copies whose availability disagrees with their loans.
    ///
    /// A copy is consistent when it has at most one active loan and is
    /// available exactly when it has none.
    pub fn violations(&self) -> Vec<CopyId> {
        let mut active: HashMap<CopyId, usize> = HashMap::new();
        for loan in self.loans.iter().filter(|l| l.value.is_active()) {
            *active.entry(loan.value.copy_id()).or_default() += 1;
        }

        let mut violations: Vec<CopyId> = self
            .copies
            .iter()
            .filter(|c| {
                let count = active.get(&c.value.id()).copied().unwrap_or(0);
                count > 1 || c.value.available() != (count == 0)
            })
            .map(|c| c.value.id())
            .collect();

        // Active loans pointing at copies that are not stocked at all.
        for copy_id in active.keys() {
            if !self.copies.iter().any(|c| c.value.id() == *copy_id) {
                violations.push(*copy_id);
            }
        }

        violations.sort();
        violations
    }
}

/// Transactional key-record store consumed by the ledger.
pub trait Store: Send + Sync {
    /// Open transaction handle. Dropping it uncommitted rolls it back.
    type Txn: Send;

    fn read_copy(&self, id: CopyId) -> Result<Option<Versioned<BookCopy>>, LedgerError>;

    fn read_loan(&self, id: LoanId) -> Result<Option<Versioned<Loan>>, LedgerError>;

    /// Replaces the copy iff its stored version is still `expected`.
    ///
    /// Returns `Ok(false)` when the version moved or the row is locked.
    fn compare_and_swap(
        &self,
        id: CopyId,
        expected: Version,
        copy: BookCopy,
    ) -> Result<bool, LedgerError>;

    /// Stocks a new copy at [`Version::INITIAL`].
    fn insert_copy(&self, copy: BookCopy) -> Result<Version, LedgerError>;

    fn next_loan_id(&self) -> Result<LoanId, LedgerError>;

    fn snapshot(&self) -> Result<Snapshot, LedgerError>;

    fn begin(&self, isolation: Isolation) -> Result<Self::Txn, LedgerError>;

    /// Takes the exclusive row lock on a copy for the rest of `txn`.
    ///
    /// Blocks while another transaction holds it, failing with
    /// [`LedgerError::LockTimeout`] once `timeout` has elapsed.
    fn lock_copy(
        &self,
        txn: &mut Self::Txn,
        id: CopyId,
        timeout: Duration,
    ) -> Result<(), LedgerError>;

    fn stage(&self, txn: &mut Self::Txn, write: Write);

    /// Applies every staged write atomically and releases row locks.
    fn commit(&self, txn: Self::Txn) -> Result<(), LedgerError>;

    /// Discards staged writes and releases row locks.
    fn rollback(&self, txn: Self::Txn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::MemberId;
    use chrono::{Duration, Utc};

    fn copy(id: u32, available: bool) -> Versioned<BookCopy> {
        let mut value = BookCopy::new(CopyId(id), BookId(1));
        if !available {
            value = value.check_out().unwrap();
        }
        Versioned {
            value,
            version: Version::INITIAL,
        }
    }

    fn active_loan(id: u64, copy_id: u32) -> Versioned<Loan> {
        Versioned {
            value: Loan::open(
                LoanId(id),
                MemberId(1),
                CopyId(copy_id),
                Utc::now(),
                Duration::days(14),
            )
            .unwrap(),
            version: Version::INITIAL,
        }
    }

    #[test]
    fn consistent_snapshot_has_no_violations() {
        let snapshot = Snapshot {
            copies: vec![copy(1, false), copy(2, true)],
            loans: vec![active_loan(1, 1)],
        };
        assert!(snapshot.violations().is_empty());
    }

    #[test]
    fn available_copy_with_active_loan_is_flagged() {
        let snapshot = Snapshot {
            copies: vec![copy(1, true)],
            loans: vec![active_loan(1, 1)],
        };
        assert_eq!(snapshot.violations(), vec![CopyId(1)]);
    }

    #[test]
    fn unavailable_copy_without_loan_is_flagged() {
        let snapshot = Snapshot {
            copies: vec![copy(1, false)],
            loans: vec![],
        };
        assert_eq!(snapshot.violations(), vec![CopyId(1)]);
    }

    #[test]
    fn double_loan_is_flagged() {
        let snapshot = Snapshot {
            copies: vec![copy(1, false)],
            loans: vec![active_loan(1, 1), active_loan(2, 1)],
        };
        assert_eq!(snapshot.violations(), vec![CopyId(1)]);
    }

    #[test]
    fn loan_on_unknown_copy_is_flagged() {
        let snapshot = Snapshot {
            copies: vec![],
            loans: vec![active_loan(1, 5)],
        };
        assert_eq!(snapshot.violations(), vec![CopyId(5)]);
    }

    #[test]
    fn active_loans_skip_unjoinable_loans() {
        let mut closed = active_loan(3, 2);
        closed.value = closed.value.close(Utc::now()).unwrap();
        let snapshot = Snapshot {
            copies: vec![copy(1, false), copy(2, true)],
            loans: vec![active_loan(4, 9), active_loan(1, 1), closed],
        };

        let active = snapshot.active_loans();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].loan_id, LoanId(1));
        assert_eq!(active[0].copy_id, CopyId(1));
        assert_eq!(active[0].book_id, BookId(1));
        // The orphan is still reported by the audit
        assert_eq!(snapshot.violations(), vec![CopyId(9)]);
    }
}
