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

//! Physical book copies.
//!
//! # Example
//!
//! ```
//! use library_ledger::{BookCopy, BookId, CopyId};
//!
//! let copy = BookCopy::new(CopyId(42), BookId(1));
//! assert!(copy.available());
//! ```

use crate::base::{BookId, CopyId};
use crate::error::LedgerError;
use crate::store::Versioned;
use serde::Serialize;

/// A copy record together with the version token it was read at.
pub type CopySnapshot = Versioned<BookCopy>;

/// One physical copy of a catalog entry.
///
/// `available` is only ever flipped by the ledger, in the same commit that
/// opens or closes the loan on this copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookCopy {
    id: CopyId,
    book_id: BookId,
    available: bool,
}

impl BookCopy {
    /// Creates a freshly stocked, available copy.
    pub fn new(id: CopyId, book_id: BookId) -> Self {
        Self {
            id,
            book_id,
            available: true,
        }
    }

    pub fn id(&self) -> CopyId {
        self.id
    }

    pub fn book_id(&self) -> BookId {
        self.book_id
    }

    pub fn available(&self) -> bool {
        self.available
    }

    /// Returns the checked-out state of this copy.
    pub(crate) fn check_out(&self) -> Result<Self, LedgerError> {
        if !self.available {
            return Err(LedgerError::CopyUnavailable);
        }
        Ok(Self {
            available: false,
            ..self.clone()
        })
    }

    /// Returns the back-on-the-shelf state of this copy.
    pub(crate) fn check_in(&self) -> Self {
        Self {
            available: true,
            ..self.clone()
        }
    }
}
