#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use homeclean_ledger::application::engine::{CancellationRequest, LedgerEngine};
use homeclean_ledger::config::{AppConfig, RetryConfig};
use homeclean_ledger::domain::appointment::{Appointment, CancelledBy, CleanerAssignment};
use homeclean_ledger::domain::ids::{AppointmentId, UserId};
use homeclean_ledger::domain::money::Money;
use homeclean_ledger::domain::ports::LedgerStoreRef;
use homeclean_ledger::infrastructure::in_memory::{
    InMemoryAppealStore, InMemoryAuditStore, InMemoryLedgerStore,
};
use homeclean_ledger::infrastructure::sandbox_gateway::SandboxGateway;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub const HOMEOWNER: UserId = UserId(10);
pub const CLEANER: UserId = UserId(20);
pub const REVIEWER: UserId = UserId(900);

pub const CSV_HEADER: [&str; 14] = [
    "appointment_id",
    "homeowner_id",
    "cleaners",
    "date",
    "base_price",
    "linens",
    "time_window",
    "high_volume",
    "last_minute",
    "cancelled_by",
    "canceller_id",
    "booked_at",
    "cancelled_at",
    "payment_method",
];

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// Default configuration with retries fast enough for tests.
pub fn config() -> AppConfig {
    AppConfig {
        retry: RetryConfig {
            max_attempts: 3,
            min_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..AppConfig::default()
    }
}

pub struct Harness {
    pub engine: LedgerEngine,
    pub gateway: SandboxGateway,
    pub ledger: InMemoryLedgerStore,
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: AppConfig) -> Harness {
    let ledger = InMemoryLedgerStore::new();
    let gateway = SandboxGateway::new();
    let engine = engine_over(config, Arc::new(ledger.clone()), gateway.clone());
    Harness {
        engine,
        gateway,
        ledger,
    }
}

pub fn engine_over(
    config: AppConfig,
    ledger: LedgerStoreRef,
    gateway: SandboxGateway,
) -> LedgerEngine {
    LedgerEngine::new(
        config,
        ledger,
        Arc::new(InMemoryAppealStore::new()),
        Arc::new(InMemoryAuditStore::new()),
        Arc::new(gateway),
    )
}

/// A $150 cleaning on 2026-03-12 with a single cleaner.
pub fn appointment(id: u64) -> Appointment {
    Appointment {
        id: AppointmentId(id),
        homeowner_id: HOMEOWNER,
        date: NaiveDate::from_ymd_opt(2026, 3, 12).unwrap(),
        base_price: Money::from_cents(15000),
        add_ons: vec![],
        cleaners: vec![CleanerAssignment::new(CLEANER)],
        payment_method_label: "Visa 4242".to_string(),
    }
}

/// Homeowner cancellation of `appointment` two days out (penalty and fee apply).
pub fn late_cancellation(appointment: Appointment) -> CancellationRequest {
    CancellationRequest {
        cancelled_by: CancelledBy::Homeowner(appointment.homeowner_id),
        appointment,
        booked_at: at(2026, 3, 1, 9),
        cancelled_at: at(2026, 3, 10, 9),
    }
}

/// Writes a cancellation batch; each row is the 14 columns of `CSV_HEADER`.
pub fn write_cancellations(path: &Path, rows: &[[&str; 14]]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(CSV_HEADER)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes a cancellation batch from pre-joined CSV lines.
pub fn write_csv_rows(path: &Path, rows: &[&str]) -> Result<(), Error> {
    let mut text = CSV_HEADER.join(",");
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    std::fs::write(path, text)
}

/// Writes `rows` late homeowner cancellations of distinct $150 appointments.
pub fn generate_batch(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(CSV_HEADER)?;

    for i in 1..=rows {
        let id = i.to_string();
        let cleaner = (20 + i % 5).to_string();
        wtr.write_record([
            id.as_str(),
            "10",
            cleaner.as_str(),
            "2026-03-12",
            "150.00",
            "",
            "",
            "",
            "",
            "homeowner",
            "10",
            "2026-03-01T09:00:00Z",
            "2026-03-10T09:00:00Z",
            "Visa 4242",
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
