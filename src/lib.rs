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

//! # Library Ledger
//!
//! This library tracks which physical book copies are out on loan and
//! guarantees that a copy is never lent to two members at once, no matter
//! how many callers issue loan and return requests concurrently.
//!
//! ## Core Components
//!
//! - [`Ledger`]: Owns copy availability and loan state
//! - [`OptimisticController`]: Version-checked commits, reports conflicts
//! - [`PessimisticController`]: Per-copy exclusive locks with a timeout
//! - [`Store`]: Transactional storage port, with [`MemoryStore`] in-process
//! - [`harness`]: Multi-threaded drivers that exercise both controllers
//! - [`LedgerError`]: Error types for ledger operations
//!
//! ## Example
//!
//! ```
//! use library_ledger::{BookId, CopyId, Ledger, LedgerError, MemberId};
//!
//! let ledger = Ledger::new();
//! ledger.stock_copy(CopyId(42), BookId(1)).unwrap();
//!
//! // Lend copy 42 to member 7
//! let loan_id = ledger.register_loan(MemberId(7), CopyId(42)).unwrap();
//! assert!(!ledger.get_copy(CopyId(42)).unwrap().value.available());
//!
//! // Nobody else can borrow it until it comes back
//! assert_eq!(
//!     ledger.register_loan(MemberId(8), CopyId(42)),
//!     Err(LedgerError::CopyUnavailable)
//! );
//!
//! ledger.return_loan(loan_id).unwrap();
//! assert!(ledger.get_copy(CopyId(42)).unwrap().value.available());
//! assert!(ledger.list_active_loans().unwrap().is_empty());
//! ```
//!
//! ## Thread Safety
//!
//! The ledger is `Send + Sync`. Under the optimistic strategy racing
//! writers are told to retry or abort; under the pessimistic strategy they
//! queue on the copy's lock.

mod base;
pub mod clock;
pub mod config;
pub mod controller;
pub mod copy;
pub mod error;
pub mod harness;
mod ledger;
pub mod loan;
pub mod store;

pub use base::{BookId, CopyId, LoanId, MemberId, Version};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LedgerConfig, Strategy};
pub use controller::{OptimisticController, PessimisticController, ReadHook, ReadPhase};
pub use copy::{BookCopy, CopySnapshot};
pub use error::LedgerError;
pub use ledger::Ledger;
pub use loan::{ActiveLoan, Loan};
pub use store::{MemoryStore, Store};
