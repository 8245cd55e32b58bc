use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use homeclean_ledger::application::engine::LedgerEngine;
use homeclean_ledger::config::AppConfig;
use homeclean_ledger::domain::ids::AppointmentId;
use homeclean_ledger::domain::ports::{AppealStoreRef, AuditStoreRef, LedgerStoreRef};
use homeclean_ledger::domain::reports::ReportPeriod;
use homeclean_ledger::infrastructure::in_memory::{
    InMemoryAppealStore, InMemoryAuditStore, InMemoryLedgerStore,
};
use homeclean_ledger::infrastructure::sandbox_gateway::SandboxGateway;
use homeclean_ledger::interfaces::csv::cancellation_reader::CancellationReader;
use homeclean_ledger::interfaces::csv::report_writer::ReportWriter;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Configuration file layered under HOMECLEAN__* environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Settle every cancellation in a CSV file and print one breakdown per row
    Settle {
        input: PathBuf,

        /// Run reconciliation afterwards and print the report
        #[arg(long)]
        reconcile: bool,
    },
    /// Print ledger entries
    Ledger {
        #[arg(long)]
        appointment: Option<u64>,
    },
    /// Print 1099 totals for a tax year or quarter
    TaxReport {
        #[arg(long)]
        year: i32,

        #[arg(long)]
        quarter: Option<u8>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,homeclean_ledger=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(
    db_path: Option<PathBuf>,
) -> Result<(LedgerStoreRef, AppealStoreRef, AuditStoreRef)> {
    use homeclean_ledger::infrastructure::rocksdb::RocksDBStore;

    if let Some(db_path) = db_path {
        let store = RocksDBStore::open(db_path).into_diagnostic()?;
        return Ok((
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store),
        ));
    }
    Ok(in_memory_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(
    db_path: Option<PathBuf>,
) -> Result<(LedgerStoreRef, AppealStoreRef, AuditStoreRef)> {
    if db_path.is_some() {
        miette::bail!("--db-path needs a build with the storage-rocksdb feature");
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> (LedgerStoreRef, AppealStoreRef, AuditStoreRef) {
    (
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemoryAppealStore::new()),
        Arc::new(InMemoryAuditStore::new()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).into_diagnostic()?;
    let (ledger, appeals, audit) = open_stores(cli.db_path)?;
    let engine = LedgerEngine::new(config, ledger, appeals, audit, Arc::new(SandboxGateway::new()));

    let stdout = io::stdout();

    match cli.command {
        Command::Settle { input, reconcile } => {
            let replay = engine.settlement().replay_pending(Utc::now()).await.into_diagnostic()?;
            if replay.replayed > 0 || replay.still_pending > 0 {
                warn!(
                    replayed = replay.replayed,
                    still_pending = replay.still_pending,
                    "pending postings"
                );
            }

            let file = File::open(input).into_diagnostic()?;
            let mut breakdowns = Vec::new();
            for (row, request) in CancellationReader::new(file).requests().enumerate() {
                match request {
                    Ok(request) => match engine.process_cancellation(&request).await {
                        Ok(breakdown) => breakdowns.push(breakdown),
                        Err(e) => {
                            warn!(
                                appointment = %request.appointment.id,
                                error = %e,
                                "settlement failed"
                            );
                            eprintln!(
                                "Error settling appointment {}: {}",
                                request.appointment.id,
                                e.user_message()
                            );
                        }
                    },
                    Err(e) => eprintln!("Error reading row {}: {}", row + 1, e),
                }
            }
            ReportWriter::new(stdout.lock())
                .write_breakdowns(&breakdowns)
                .into_diagnostic()?;

            if reconcile {
                let run = engine.reconciliation().run(Utc::now()).await.into_diagnostic()?;
                eprintln!(
                    "Reconciliation: {} checked, {} matched, {} discrepancies",
                    run.objects_checked, run.matched, run.discrepancies
                );
                let report = engine
                    .reconciliation()
                    .reconciliation_report(ReportPeriod::DateRange {
                        from: NaiveDate::MIN,
                        to: NaiveDate::MAX,
                    })
                    .await
                    .into_diagnostic()?;
                // Separate CSV block with its own header.
                ReportWriter::new(stdout.lock())
                    .write_reconciliation_report(&report)
                    .into_diagnostic()?;
            }
        }
        Command::Ledger { appointment } => {
            let entries = engine
                .entries(appointment.map(AppointmentId))
                .await
                .into_diagnostic()?;
            ReportWriter::new(stdout.lock())
                .write_entries(&entries)
                .into_diagnostic()?;
        }
        Command::TaxReport { year, quarter } => {
            let report = engine
                .reconciliation()
                .tax_report(year, quarter)
                .await
                .into_diagnostic()?;
            ReportWriter::new(stdout.lock())
                .write_tax_report(&report)
                .into_diagnostic()?;
        }
    }

    Ok(())
}
