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

//! Loan records.
//!
//! A loan has a single transition:
//!
//! ```text
//!  Active (return_date = None) ──return──► Returned (return_date = Some(t))
//! ```
//!
//! Returned loans are never reopened or deleted.

use crate::base::{BookId, CopyId, LoanId, MemberId};
use crate::error::LedgerError;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A member's loan of one copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Loan {
    id: LoanId,
    member_id: MemberId,
    copy_id: CopyId,
    loan_date: DateTime<Utc>,
    due_date: DateTime<Utc>,
    return_date: Option<DateTime<Utc>>,
}

impl Loan {
    /// Opens a new active loan. Only the loan procedures create loans.
    ///
    /// Fails with [`LedgerError::InvalidLoanPeriod`] if the due date would
    /// overflow the calendar.
    pub(crate) fn open(
        id: LoanId,
        member_id: MemberId,
        copy_id: CopyId,
        now: DateTime<Utc>,
        loan_period: Duration,
    ) -> Result<Self, LedgerError> {
        let due_date = now
            .checked_add_signed(loan_period)
            .ok_or(LedgerError::InvalidLoanPeriod)?;
        Ok(Self {
            id,
            member_id,
            copy_id,
            loan_date: now,
            due_date,
            return_date: None,
        })
    }

    /// Returns the closed form of this loan.
    pub(crate) fn close(&self, now: DateTime<Utc>) -> Result<Self, LedgerError> {
        if self.return_date.is_some() {
            return Err(LedgerError::AlreadyReturned);
        }
        Ok(Self {
            return_date: Some(now),
            ..self.clone()
        })
    }

    pub fn id(&self) -> LoanId {
        self.id
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn copy_id(&self) -> CopyId {
        self.copy_id
    }

    pub fn loan_date(&self) -> DateTime<Utc> {
        self.loan_date
    }

    pub fn due_date(&self) -> DateTime<Utc> {
        self.due_date
    }

    pub fn return_date(&self) -> Option<DateTime<Utc>> {
        self.return_date
    }

    /// A loan is active until it has a return date.
    pub fn is_active(&self) -> bool {
        self.return_date.is_none()
    }
}

/// Read-only projection of an active loan, joined with its copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveLoan {
    pub loan_id: LoanId,
    pub copy_id: CopyId,
    pub book_id: BookId,
    pub member_id: MemberId,
    pub loan_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
}
