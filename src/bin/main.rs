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

use chrono::{DateTime, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use gem_ledger::{
    CodeType, CurrencyKind, EngineConfig, LogFormat, MemoryStore, Metadata, NewCode,
    RedemptionOrchestrator, RetryPolicy, UserId, init_logging,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Gem Ledger - Replay code redemptions from CSV files
///
/// Loads redemption codes, redeems every `user,code` request concurrently and
/// writes the resulting account balances to stdout.
#[derive(Parser, Debug)]
#[command(name = "gem-ledger")]
#[command(about = "Replays promotional code redemptions against an in-memory ledger", long_about = None)]
struct Args {
    /// Path to CSV file with code definitions
    ///
    /// Expected format: code,type,currency,amount,max_uses,valid_from,valid_until
    #[arg(long, value_name = "FILE", env = "GEM_LEDGER_CODES")]
    codes: PathBuf,

    /// Path to CSV file with redemption requests
    ///
    /// Expected format: user,code
    /// Example: gem-ledger --codes codes.csv requests.csv > accounts.csv
    #[arg(value_name = "FILE")]
    requests: PathBuf,

    /// Account write attempts per redemption (overrides GEM_LEDGER_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Log output format, "pretty" or "json" (overrides GEM_LEDGER_LOG_FORMAT)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(attempts) = args.max_attempts {
        config.retry = RetryPolicy::new(attempts, config.retry.base_delay());
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }

    if let Err(e) = init_logging(&config.log_level, config.log_format) {
        eprintln!("{}", e);
        process::exit(1);
    }

    let store = MemoryStore::new();
    let engine = Arc::new(
        RedemptionOrchestrator::new(Arc::new(store.clone()), Arc::new(store.clone()))
            .with_retry_policy(config.retry),
    );

    let codes = open(&args.codes);
    match load_codes(&engine, BufReader::new(codes)).await {
        Ok(created) => info!(created, "codes loaded"),
        Err(e) => {
            eprintln!("Error loading codes: {}", e);
            process::exit(1);
        }
    }

    let requests = open(&args.requests);
    match process_requests(Arc::clone(&engine), BufReader::new(requests)).await {
        Ok(summary) => info!(
            redeemed = summary.redeemed,
            rejected = summary.rejected,
            "requests processed"
        ),
        Err(e) => {
            eprintln!("Error processing requests: {}", e);
            process::exit(1);
        }
    }

    if let Err(e) = write_accounts(&store, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

fn open(path: &Path) -> File {
    match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

/// Raw CSV record of a code definition.
#[derive(Debug, Deserialize)]
struct CodeRecord {
    code: String,
    #[serde(rename = "type")]
    code_type: String,
    currency: String,
    amount: i64,
    max_uses: u32,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
}

impl CodeRecord {
    /// Returns `None` for unknown code types or currencies.
    fn into_new_code(self) -> Option<NewCode> {
        Some(NewCode {
            code: self.code,
            code_type: self.code_type.parse::<CodeType>().ok()?,
            currency: self.currency.parse::<CurrencyKind>().ok()?,
            amount: self.amount,
            max_uses: self.max_uses,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            metadata: Metadata::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RequestRecord {
    user: String,
    code: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    redeemed: usize,
    rejected: usize,
}

fn reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .has_headers(true)
        .from_reader(reader)
}

/// Create every valid code from a CSV reader.
///
/// Malformed rows and codes the orchestrator rejects are logged and skipped.
///
/// # CSV Format
///
/// ```csv
/// code,type,currency,amount,max_uses,valid_from,valid_until
/// WELCOME,promotion,free,100,0,2025-01-01T00:00:00Z,2030-01-01T00:00:00Z
/// ```
///
/// # Errors
///
/// Returns a CSV error if the header cannot be read.
async fn load_codes<R: Read>(
    engine: &RedemptionOrchestrator,
    reader: R,
) -> Result<usize, csv::Error> {
    let mut rdr = self::reader(reader);
    rdr.headers()?;

    let mut created = 0;
    for result in rdr.deserialize::<CodeRecord>() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping malformed code row");
                continue;
            }
        };
        let Some(new) = record.into_new_code() else {
            warn!("skipping code row with unknown type or currency");
            continue;
        };
        let code = new.code.clone();
        match engine.create_code(new).await {
            Ok(_) => created += 1,
            Err(e) => warn!(code = %code, error = %e, error_code = e.code(), "code rejected"),
        }
    }
    Ok(created)
}

/// Redeem every request from a CSV reader concurrently.
///
/// # Errors
///
/// Returns a CSV error if the header cannot be read. Malformed rows and
/// failed redemptions are logged and counted as rejected.
async fn process_requests<R: Read>(
    engine: Arc<RedemptionOrchestrator>,
    reader: R,
) -> Result<Summary, csv::Error> {
    let mut rdr = self::reader(reader);
    rdr.headers()?;

    let mut summary = Summary::default();
    let mut tasks = JoinSet::new();
    for result in rdr.deserialize::<RequestRecord>() {
        let request = match result {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "skipping malformed request row");
                summary.rejected += 1;
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        tasks.spawn(async move {
            let user = UserId::new(request.user);
            match engine.redeem(&request.code, &user).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(user = %user, code = %request.code, error = %e, error_code = e.code(), "redemption failed");
                    false
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => summary.redeemed += 1,
            Ok(false) => summary.rejected += 1,
            Err(e) => {
                error!(error = %e, "redemption task did not complete");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}

/// Write account states to a CSV writer.
///
/// # CSV Format
///
/// ```csv
/// owner,currency,balance,version
/// alice,free,100,1
/// ```
///
/// # Errors
///
/// Returns a CSV error if writing fails.
fn write_accounts<W: Write>(store: &MemoryStore, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for account in store.accounts() {
        wtr.serialize(&account)?;
    }
    wtr.flush()?;
    Ok(())
}
