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

//! Optimistic concurrency: read with version, validate on commit.
//!
//! No lock is held between the read and the commit. Every staged write
//! carries the version it was computed from; if any record moved in the
//! meantime the store refuses the whole commit and the caller gets
//! [`LedgerError::ConcurrencyConflict`]. There is no retry here.

use super::{Operation, TxnEnv};
use crate::base::{CopyId, LoanId, MemberId};
use crate::error::LedgerError;
use crate::store::{Isolation, Store};

#[derive(Debug, Clone, Default)]
pub struct OptimisticController;

impl OptimisticController {
    pub fn new() -> Self {
        Self
    }

    pub fn register_loan<S: Store>(
        &self,
        env: &TxnEnv<'_, S>,
        member_id: MemberId,
        copy_id: CopyId,
    ) -> Result<LoanId, LedgerError> {
        let copy = env.read_copy(copy_id)?;
        env.read_phase(Operation::Register, member_id, &copy);

        let mut txn = env.store.begin(Isolation::Default)?;
        let staged = env.stage_register(&mut txn, member_id, &copy);
        env.finish(txn, staged)
    }

    pub fn return_loan<S: Store>(
        &self,
        env: &TxnEnv<'_, S>,
        loan_id: LoanId,
    ) -> Result<(), LedgerError> {
        let loan = env.read_loan(loan_id)?;
        if !loan.value.is_active() {
            return Err(LedgerError::AlreadyReturned);
        }
        let copy = env.read_copy(loan.value.copy_id())?;
        env.read_phase(Operation::Return, loan.value.member_id(), &copy);

        let mut txn = env.store.begin(Isolation::Default)?;
        let staged = env.stage_return(&mut txn, &loan, &copy);
        env.finish(txn, staged)
    }
}
