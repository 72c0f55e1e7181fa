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

//! Error types for ledger operations.

use thiserror::Error;

/// Ledger operation errors.
///
/// Every variant is an expected outcome handed back to the caller. The ledger
/// never retries on its own; see [`LedgerError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Referenced copy does not exist
    #[error("book copy not found")]
    CopyNotFound,

    /// Copy is already out on an active loan
    #[error("book copy is not available")]
    CopyUnavailable,

    /// Referenced loan does not exist
    #[error("loan not found")]
    LoanNotFound,

    /// Loan already has a return date
    #[error("loan already returned")]
    AlreadyReturned,

    /// Another writer committed between our read and our write
    #[error("concurrent modification detected")]
    ConcurrencyConflict,

    /// Exclusive lock on the copy could not be acquired in time
    #[error("timed out waiting for copy lock")]
    LockTimeout,

    /// Storage backend could not be reached
    #[error("storage unavailable")]
    StorageUnavailable,

    /// Copy id is already stocked
    #[error("duplicate copy ID")]
    DuplicateCopy,

    /// Due date would fall outside the representable calendar
    #[error("loan period out of range")]
    InvalidLoanPeriod,
}

impl LedgerError {
    /// Returns `true` for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::StorageUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::LedgerError;

    #[test]
    fn error_display_messages() {
        assert_eq!(LedgerError::CopyNotFound.to_string(), "book copy not found");
        assert_eq!(
            LedgerError::CopyUnavailable.to_string(),
            "book copy is not available"
        );
        assert_eq!(LedgerError::LoanNotFound.to_string(), "loan not found");
        assert_eq!(LedgerError::AlreadyReturned.to_string(), "loan already returned");
        assert_eq!(
            LedgerError::ConcurrencyConflict.to_string(),
            "concurrent modification detected"
        );
        assert_eq!(
            LedgerError::LockTimeout.to_string(),
            "timed out waiting for copy lock"
        );
        assert_eq!(LedgerError::StorageUnavailable.to_string(), "storage unavailable");
        assert_eq!(LedgerError::DuplicateCopy.to_string(), "duplicate copy ID");
        assert_eq!(
            LedgerError::InvalidLoanPeriod.to_string(),
            "loan period out of range"
        );
    }

    #[test]
    fn only_storage_unavailable_is_transient() {
        assert!(LedgerError::StorageUnavailable.is_transient());
        assert!(!LedgerError::ConcurrencyConflict.is_transient());
        assert!(!LedgerError::LockTimeout.is_transient());
        assert!(!LedgerError::CopyUnavailable.is_transient());
    }

    #[test]
    fn errors_are_cloneable() {
        let error = LedgerError::ConcurrencyConflict;
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
