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

//! The lending ledger.
//!
//! The [`Ledger`] owns copy availability and loan state and is the only
//! writer of `available`, the record versions and `return_date`.
//!
//! # Operations
//!
//! - **register_loan**: opens a loan on an available copy and marks it out.
//! - **return_loan**: closes an active loan and puts its copy back.
//! - **list_active_loans**: lock-free snapshot of open loans.
//! - **get_copy**: copy state with its version token.
//!
//! Loan and return each commit as one unit through the configured
//! [`Controller`]; a failed call leaves the store exactly as it found it.
//!
//! # Thread Safety
//!
//! `Ledger` is `Send + Sync`. Share it behind an [`Arc`] (or borrow it from
//! scoped threads) and call it from as many threads as needed.

use crate::base::{BookId, CopyId, LoanId, MemberId};
use crate::clock::{Clock, SystemClock};
use crate::config::{LedgerConfig, Strategy};
use crate::controller::{Controller, ReadHook, TxnEnv};
use crate::copy::{BookCopy, CopySnapshot};
use crate::error::LedgerError;
use crate::loan::{ActiveLoan, Loan};
use crate::store::{MemoryStore, Store, Versioned};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Copy-availability and loan ledger over a [`Store`].
///
/// # Invariants
///
/// - A copy is available iff it has no active loan.
/// - A copy has at most one active loan.
/// - A loan's return date, once set, never changes.
pub struct Ledger<S: Store = MemoryStore> {
    store: Arc<S>,
    controller: Controller,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    read_hook: RwLock<Option<ReadHook>>,
}

impl Ledger<MemoryStore> {
    /// Creates an optimistic ledger over an empty in-memory store.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }
}

impl Default for Ledger<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> Ledger<S> {
    /// Creates a ledger over an existing store.
    ///
    /// Several ledgers may share one store, even with different strategies.
    pub fn with_store(store: Arc<S>, config: LedgerConfig) -> Self {
        Ledger {
            store,
            controller: Controller::from_config(&config),
            config,
            clock: Arc::new(SystemClock),
            read_hook: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Installs (or clears) the callback run between read and commit.
    pub fn set_read_hook(&self, hook: Option<ReadHook>) {
        *self.read_hook.write() = hook;
    }

    pub fn strategy(&self) -> Strategy {
        self.controller.strategy()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn env(&self) -> TxnEnv<'_, S> {
        TxnEnv {
            store: self.store.as_ref(),
            clock: self.clock.as_ref(),
            loan_period: self.config.loan_period(),
            hook: self.read_hook.read().clone(),
        }
    }

    /// Adds a newly stocked, available copy.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::DuplicateCopy`] - The copy id is already in use.
    /// - [`LedgerError::StorageUnavailable`] - The store cannot be reached.
    pub fn stock_copy(&self, copy_id: CopyId, book_id: BookId) -> Result<CopySnapshot, LedgerError> {
        let copy = BookCopy::new(copy_id, book_id);
        let version = self.store.insert_copy(copy.clone())?;
        info!(copy_id = %copy_id, book_id = %book_id, "copy stocked");
        Ok(Versioned {
            value: copy,
            version,
        })
    }

    /// Returns the copy and the version token it was read at.
    pub fn get_copy(&self, copy_id: CopyId) -> Result<CopySnapshot, LedgerError> {
        self.store
            .read_copy(copy_id)?
            .ok_or(LedgerError::CopyNotFound)
    }

    pub fn get_loan(&self, loan_id: LoanId) -> Result<Loan, LedgerError> {
        self.store
            .read_loan(loan_id)?
            .map(|loan| loan.value)
            .ok_or(LedgerError::LoanNotFound)
    }

    /// Lends `copy_id` to `member_id`.
    ///
    /// Creates the loan (due after the configured loan period) and marks the
    /// copy unavailable in one commit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::CopyNotFound`] - No such copy.
    /// - [`LedgerError::CopyUnavailable`] - The copy is already on loan.
    /// - [`LedgerError::ConcurrencyConflict`] - Optimistic commit lost a race.
    /// - [`LedgerError::LockTimeout`] - Pessimistic lock wait exceeded.
    /// - [`LedgerError::StorageUnavailable`] - The store cannot be reached.
    pub fn register_loan(&self, member_id: MemberId, copy_id: CopyId) -> Result<LoanId, LedgerError> {
        let result = self
            .controller
            .register_loan(&self.env(), member_id, copy_id);

        match &result {
            Ok(loan_id) => info!(
                loan_id = %loan_id,
                member_id = %member_id,
                copy_id = %copy_id,
                strategy = %self.strategy(),
                "loan registered"
            ),
            Err(e) => self.log_rejection("register_loan", &copy_id, e),
        }
        result
    }

    /// Closes an active loan and makes its copy available again, in one
    /// commit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LoanNotFound`] - No such loan.
    /// - [`LedgerError::AlreadyReturned`] - The loan was closed before.
    /// - [`LedgerError::ConcurrencyConflict`] - Optimistic commit lost a race.
    /// - [`LedgerError::LockTimeout`] - Pessimistic lock wait exceeded.
    /// - [`LedgerError::StorageUnavailable`] - The store cannot be reached.
    pub fn return_loan(&self, loan_id: LoanId) -> Result<(), LedgerError> {
        let result = self.controller.return_loan(&self.env(), loan_id);

        match &result {
            Ok(()) => info!(
                loan_id = %loan_id,
                strategy = %self.strategy(),
                "loan returned"
            ),
            Err(e) => self.log_rejection("return_loan", &loan_id, e),
        }
        result
    }

    /// Active loans ordered by loan id.
    ///
    /// Reads a snapshot without taking any row locks.
    pub fn list_active_loans(&self) -> Result<Vec<ActiveLoan>, LedgerError> {
        Ok(self.store.snapshot()?.active_loans())
    }

    /// Copies whose availability disagrees with their loans. Empty when the
    /// ledger is consistent.
    pub fn audit(&self) -> Result<Vec<CopyId>, LedgerError> {
        Ok(self.store.snapshot()?.violations())
    }

    /// Contention and outages are worth a warning; business rejections are not.
    fn log_rejection(&self, operation: &'static str, record: &dyn fmt::Display, e: &LedgerError) {
        match e {
            LedgerError::ConcurrencyConflict
            | LedgerError::LockTimeout
            | LedgerError::StorageUnavailable => warn!(
                operation,
                record = %record,
                strategy = %self.strategy(),
                error = %e,
                "ledger operation failed"
            ),
            _ => debug!(
                operation,
                record = %record,
                strategy = %self.strategy(),
                error = %e,
                "ledger operation rejected"
            ),
        }
    }
}
