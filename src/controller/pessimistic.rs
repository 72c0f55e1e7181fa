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

//! Pessimistic concurrency: lock the copy row, then read.
//!
//! ```text
//!  begin(serializable) ──lock copy──► read ──► stage ──► commit (unlock)
//!                          │
//!                          └──timeout──► LockTimeout (rollback)
//! ```
//!
//! A contender for the same copy waits on the row lock and, once admitted,
//! reads whatever the previous holder committed.

use super::{Operation, TxnEnv};
use crate::base::{CopyId, LoanId, MemberId};
use crate::error::LedgerError;
use crate::store::{Isolation, Store};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PessimisticController {
    lock_timeout: Duration,
}

impl PessimisticController {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn register_loan<S: Store>(
        &self,
        env: &TxnEnv<'_, S>,
        member_id: MemberId,
        copy_id: CopyId,
    ) -> Result<LoanId, LedgerError> {
        let mut txn = env.store.begin(Isolation::Serializable)?;
        if let Err(e) = env.store.lock_copy(&mut txn, copy_id, self.lock_timeout) {
            env.store.rollback(txn);
            return Err(e);
        }

        let staged = env.read_copy(copy_id).and_then(|copy| {
            env.read_phase(Operation::Register, member_id, &copy);
            env.stage_register(&mut txn, member_id, &copy)
        });
        env.finish(txn, staged)
    }

    pub fn return_loan<S: Store>(
        &self,
        env: &TxnEnv<'_, S>,
        loan_id: LoanId,
    ) -> Result<(), LedgerError> {
        // The copy id never changes, so it is safe to learn it before locking.
        let copy_id = env.read_loan(loan_id)?.value.copy_id();

        let mut txn = env.store.begin(Isolation::Serializable)?;
        if let Err(e) = env.store.lock_copy(&mut txn, copy_id, self.lock_timeout) {
            env.store.rollback(txn);
            return Err(e);
        }

        let staged = env.read_loan(loan_id).and_then(|loan| {
            if !loan.value.is_active() {
                return Err(LedgerError::AlreadyReturned);
            }
            let copy = env.read_copy(copy_id)?;
            env.read_phase(Operation::Return, loan.value.member_id(), &copy);
            env.stage_return(&mut txn, &loan, &copy)
        });
        env.finish(txn, staged)
    }
}
