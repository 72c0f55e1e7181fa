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

//! Concurrency controllers.
//!
//! Both controllers run the same two procedures; they differ only in how the
//! read and the commit are protected.
//!
//! | Procedure | Steps |
//! |-----------|-------|
//! | register  | read copy, reject if unavailable, open loan, mark copy out, commit |
//! | return    | read loan, reject if returned, close loan, mark copy in, commit |
//!
//! The loan write and the availability flip are always staged in the same
//! transaction, so they become visible together or not at all.

mod optimistic;
mod pessimistic;

pub use optimistic::OptimisticController;
pub use pessimistic::PessimisticController;

use crate::base::{CopyId, LoanId, MemberId, Version};
use crate::clock::Clock;
use crate::config::{LedgerConfig, Strategy};
use crate::copy::CopySnapshot;
use crate::error::LedgerError;
use crate::loan::Loan;
use crate::store::{Store, Versioned, Write};
use std::sync::Arc;

/// Which procedure reached its read phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Register,
    Return,
}

/// State observed by a controller once its reads are done and before it
/// commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPhase {
    pub operation: Operation,
    pub copy_id: CopyId,
    pub member_id: MemberId,
    /// Copy version the commit will be validated against.
    pub version: Version,
}

/// Callback run between the read phase and the commit.
///
/// Under the pessimistic controller it runs while the copy lock is held.
pub type ReadHook = Arc<dyn Fn(&ReadPhase) + Send + Sync>;

/// Everything a controller needs for one operation.
pub struct TxnEnv<'a, S: Store> {
    pub store: &'a S,
    pub clock: &'a dyn Clock,
    pub loan_period: chrono::Duration,
    pub hook: Option<ReadHook>,
}

impl<S: Store> TxnEnv<'_, S> {
    fn read_copy(&self, copy_id: CopyId) -> Result<CopySnapshot, LedgerError> {
        self.store
            .read_copy(copy_id)?
            .ok_or(LedgerError::CopyNotFound)
    }

    fn read_loan(&self, loan_id: LoanId) -> Result<Versioned<Loan>, LedgerError> {
        self.store
            .read_loan(loan_id)?
            .ok_or(LedgerError::LoanNotFound)
    }

    fn read_phase(&self, operation: Operation, member_id: MemberId, copy: &CopySnapshot) {
        if let Some(hook) = &self.hook {
            hook(&ReadPhase {
                operation,
                copy_id: copy.value.id(),
                member_id,
                version: copy.version,
            });
        }
    }

    /// Stages the register procedure against `copy`.
    fn stage_register(
        &self,
        txn: &mut S::Txn,
        member_id: MemberId,
        copy: &CopySnapshot,
    ) -> Result<LoanId, LedgerError> {
        let checked_out = copy.value.check_out()?;
        let loan_id = self.store.next_loan_id()?;
        let loan = Loan::open(
            loan_id,
            member_id,
            copy.value.id(),
            self.clock.now(),
            self.loan_period,
        )?;

        self.store.stage(txn, Write::InsertLoan(loan));
        self.store.stage(
            txn,
            Write::PutCopy {
                expected: copy.version,
                copy: checked_out,
            },
        );
        Ok(loan_id)
    }

    /// Stages the return procedure for `loan` against its `copy`.
    fn stage_return(
        &self,
        txn: &mut S::Txn,
        loan: &Versioned<Loan>,
        copy: &CopySnapshot,
    ) -> Result<(), LedgerError> {
        let closed = loan.value.close(self.clock.now())?;

        self.store.stage(
            txn,
            Write::PutLoan {
                expected: loan.version,
                loan: closed,
            },
        );
        self.store.stage(
            txn,
            Write::PutCopy {
                expected: copy.version,
                copy: copy.value.check_in(),
            },
        );
        Ok(())
    }

    /// Commits `txn` if staging succeeded, otherwise rolls it back.
    fn finish<T>(&self, txn: S::Txn, staged: Result<T, LedgerError>) -> Result<T, LedgerError> {
        match staged {
            Ok(value) => {
                self.store.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                self.store.rollback(txn);
                Err(e)
            }
        }
    }
}

/// The configured concurrency strategy.
#[derive(Debug, Clone)]
pub enum Controller {
    Optimistic(OptimisticController),
    Pessimistic(PessimisticController),
}

impl Controller {
    pub fn from_config(config: &LedgerConfig) -> Self {
        match config.strategy {
            Strategy::Optimistic => Controller::Optimistic(OptimisticController::new()),
            Strategy::Pessimistic => {
                Controller::Pessimistic(PessimisticController::new(config.lock_timeout()))
            }
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Controller::Optimistic(_) => Strategy::Optimistic,
            Controller::Pessimistic(_) => Strategy::Pessimistic,
        }
    }

    pub fn register_loan<S: Store>(
        &self,
        env: &TxnEnv<'_, S>,
        member_id: MemberId,
        copy_id: CopyId,
    ) -> Result<LoanId, LedgerError> {
        match self {
            Controller::Optimistic(c) => c.register_loan(env, member_id, copy_id),
            Controller::Pessimistic(c) => c.register_loan(env, member_id, copy_id),
        }
    }

    pub fn return_loan<S: Store>(
        &self,
        env: &TxnEnv<'_, S>,
        loan_id: LoanId,
    ) -> Result<(), LedgerError> {
        match self {
            Controller::Optimistic(c) => c.return_loan(env, loan_id),
            Controller::Pessimistic(c) => c.return_loan(env, loan_id),
        }
    }
}
