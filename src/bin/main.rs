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

use clap::{Args, Parser, Subcommand, ValueEnum};
use csv::{ReaderBuilder, Trim, Writer};
use library_ledger::harness::{self, CallerOutcome};
use library_ledger::{
    BookId, CopyId, Ledger, LedgerConfig, LedgerError, LoanId, MemberId, Strategy,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Library Ledger - Concurrent book lending
///
/// Replays loan/return request files through the ledger, or runs the
/// concurrency harness against one copy.
#[derive(Parser, Debug)]
#[command(name = "library-ledger")]
#[command(about = "A concurrent lending ledger for library book copies", long_about = None)]
struct Cli {
    #[command(flatten)]
    ledger: LedgerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct LedgerArgs {
    /// Concurrency strategy for loan and return
    #[arg(long, value_enum, default_value_t = StrategyArg::Optimistic, global = true)]
    strategy: StrategyArg,

    /// Days until a new loan is due
    #[arg(
        long,
        default_value_t = LedgerConfig::DEFAULT_LOAN_PERIOD_DAYS,
        value_parser = clap::value_parser!(u32).range(..=i64::from(LedgerConfig::MAX_LOAN_PERIOD_DAYS)),
        global = true
    )]
    loan_period_days: u32,

    /// Maximum wait for a copy lock (pessimistic only)
    #[arg(long, default_value_t = LedgerConfig::DEFAULT_LOCK_TIMEOUT_MS, global = true)]
    lock_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    Optimistic,
    Pessimistic,
}

impl LedgerArgs {
    fn config(&self) -> LedgerConfig {
        let strategy = match self.strategy {
            StrategyArg::Optimistic => Strategy::Optimistic,
            StrategyArg::Pessimistic => Strategy::Pessimistic,
        };
        LedgerConfig::default()
            .with_strategy(strategy)
            .with_loan_period_days(self.loan_period_days)
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a CSV of stock/loan/return requests and print active loans
    ///
    /// Expected format: type,member,copy,book,loan
    /// Example: cargo run -- replay requests.csv > active_loans.csv
    Replay {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
    /// Race simulated callers on one copy and print each caller's outcome
    Simulate {
        /// Number of concurrent callers
        #[arg(long, default_value_t = 4)]
        callers: u32,

        /// How long the first caller stays inside its transaction
        #[arg(long, default_value_t = 200)]
        hold_ms: u64,
    },
}

fn main() {
    // Logs go to stderr; stdout carries CSV only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.ledger.config();

    let outcome = match cli.command {
        Command::Replay { input } => {
            let file = match File::open(&input) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Error opening file '{}': {}", input.display(), e);
                    process::exit(1);
                }
            };
            process_requests(BufReader::new(file), config)
                .and_then(|ledger| write_active_loans(&ledger, std::io::stdout()))
        }
        Command::Simulate { callers, hold_ms } => {
            simulate(config, callers, Duration::from_millis(hold_ms), std::io::stdout())
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// Raw CSV record matching the request format.
///
/// Fields: `type, member, copy, book, loan`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    request_type: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    member: Option<u32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    copy: Option<u32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    book: Option<u32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    loan: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Stock { copy_id: CopyId, book_id: BookId },
    Loan { member_id: MemberId, copy_id: CopyId },
    Return { loan_id: LoanId },
}

impl CsvRecord {
    /// Returns `None` for unknown types or missing required fields.
    fn into_request(self) -> Option<Request> {
        match self.request_type.to_lowercase().as_str() {
            "stock" => Some(Request::Stock {
                copy_id: CopyId(self.copy?),
                book_id: BookId(self.book?),
            }),
            "loan" => Some(Request::Loan {
                member_id: MemberId(self.member?),
                copy_id: CopyId(self.copy?),
            }),
            "return" => Some(Request::Return {
                loan_id: LoanId(self.loan?),
            }),
            _ => None,
        }
    }
}

/// Streams requests from a CSV reader through a fresh ledger.
///
/// Malformed rows and rejected requests are logged and skipped.
///
/// # CSV Format
///
/// ```csv
/// type,member,copy,book,loan
/// stock,,42,1,
/// loan,7,42,,
/// return,,,,1
/// ```
///
/// Loan ids are allocated in order starting at 1, so a `return` row can
/// refer to the loan opened by an earlier `loan` row.
fn process_requests<R: Read>(reader: R, config: LedgerConfig) -> Result<Ledger, CliError> {
    let ledger = Ledger::with_config(config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping malformed row");
                continue;
            }
        };
        let Some(request) = record.into_request() else {
            warn!("skipping invalid request record");
            continue;
        };

        let applied = match request {
            Request::Stock { copy_id, book_id } => ledger.stock_copy(copy_id, book_id).map(|_| ()),
            Request::Loan { member_id, copy_id } => {
                ledger.register_loan(member_id, copy_id).map(|_| ())
            }
            Request::Return { loan_id } => ledger.return_loan(loan_id),
        };
        match applied {
            Ok(()) => {}
            Err(LedgerError::StorageUnavailable) => return Err(LedgerError::StorageUnavailable.into()),
            Err(e) => debug!(?request, error = %e, "skipping rejected request"),
        }
    }

    Ok(ledger)
}

/// Writes active loans as CSV.
///
/// Columns: `loan_id, copy_id, book_id, member_id, loan_date, due_date`
fn write_active_loans<W: Write>(ledger: &Ledger, writer: W) -> Result<(), CliError> {
    let mut wtr = Writer::from_writer(writer);
    for loan in ledger.list_active_loans()? {
        wtr.serialize(&loan)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct OutcomeRow {
    scenario: &'static str,
    strategy: Strategy,
    caller: u32,
    member: MemberId,
    outcome: String,
    elapsed_ms: u128,
}

impl OutcomeRow {
    fn new(scenario: &'static str, strategy: Strategy, outcome: &CallerOutcome) -> Self {
        Self {
            scenario,
            strategy,
            caller: outcome.caller,
            member: outcome.member_id,
            outcome: match &outcome.result {
                Ok(loan_id) => format!("loan {loan_id}"),
                Err(e) => e.to_string(),
            },
            elapsed_ms: outcome.elapsed.as_millis(),
        }
    }
}

/// Runs the race and hold scenarios on a fresh copy each and writes one CSV
/// row per caller.
fn simulate<W: Write>(
    config: LedgerConfig,
    callers: u32,
    hold: Duration,
    writer: W,
) -> Result<(), CliError> {
    let strategy = config.strategy;
    let mut wtr = Writer::from_writer(writer);

    let ledger = Ledger::with_config(config.clone());
    ledger.stock_copy(CopyId(1), BookId(1))?;
    let race = harness::race_register(&ledger, CopyId(1), callers.max(1));
    for outcome in &race.outcomes {
        wtr.serialize(OutcomeRow::new("race", strategy, outcome))?;
    }

    let ledger = Ledger::with_config(config);
    ledger.stock_copy(CopyId(1), BookId(1))?;
    let contention = harness::hold_and_contend(&ledger, CopyId(1), hold);
    wtr.serialize(OutcomeRow::new("hold", strategy, &contention.holder))?;
    wtr.serialize(OutcomeRow::new("hold", strategy, &contention.contender))?;

    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}
