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

//! Ledger configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Concurrency strategy used for loan and return mutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Read with version, compare-and-swap on commit.
    #[default]
    Optimistic,
    /// Exclusive per-copy lock held for the whole transaction.
    Pessimistic,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Optimistic => f.write_str("optimistic"),
            Strategy::Pessimistic => f.write_str("pessimistic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub strategy: Strategy,
    /// Days between loan date and due date.
    pub loan_period_days: u32,
    /// Upper bound on a pessimistic lock wait.
    pub lock_timeout_ms: u64,
}

impl LedgerConfig {
    pub const DEFAULT_LOAN_PERIOD_DAYS: u32 = 14;
    pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
    /// Longest period accepted on the command line. Larger periods are
    /// still rejected per loan if the due date leaves the calendar.
    pub const MAX_LOAN_PERIOD_DAYS: u32 = 36_500;

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_loan_period_days(mut self, days: u32) -> Self {
        self.loan_period_days = days;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn loan_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.loan_period_days))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            loan_period_days: Self::DEFAULT_LOAN_PERIOD_DAYS,
            lock_timeout_ms: Self::DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}
