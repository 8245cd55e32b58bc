use crate::application::engine::CancellationRequest;
use crate::domain::appointment::{AddOn, AddOnKind, Appointment, CancelledBy, CleanerAssignment};
use crate::domain::ids::{AppointmentId, UserId};
use crate::domain::money::Money;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CancellerRole {
    Homeowner,
    Cleaner,
}

/// One CSV row, as written by the scheduling export.
#[derive(Debug, Deserialize)]
struct CancellationRecord {
    appointment_id: u64,
    homeowner_id: u64,
    /// `20;21`, or with recorded shares in basis points: `20:6000;21:4000`.
    cleaners: String,
    date: NaiveDate,
    base_price: Decimal,
    linens: Option<Decimal>,
    time_window: Option<Decimal>,
    high_volume: Option<Decimal>,
    last_minute: Option<Decimal>,
    cancelled_by: CancellerRole,
    canceller_id: u64,
    booked_at: DateTime<Utc>,
    cancelled_at: DateTime<Utc>,
    payment_method: Option<String>,
}

fn parse_cleaners(raw: &str) -> Result<Vec<CleanerAssignment>> {
    raw.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let invalid =
                || LedgerError::ValidationError(format!("invalid cleaner entry '{part}'"));
            let (id, share) = match part.split_once(':') {
                Some((id, share)) => {
                    let share = share.trim().parse::<u32>().map_err(|_| invalid())?;
                    (id, Some(share))
                }
                None => (part, None),
            };
            Ok(CleanerAssignment {
                cleaner_id: UserId(id.trim().parse().map_err(|_| invalid())?),
                share_basis_points: share,
            })
        })
        .collect()
}

impl TryFrom<CancellationRecord> for CancellationRequest {
    type Error = LedgerError;

    fn try_from(record: CancellationRecord) -> Result<Self> {
        let add_ons = [
            (AddOnKind::Linens, record.linens),
            (AddOnKind::TimeWindow, record.time_window),
            (AddOnKind::HighVolume, record.high_volume),
            (AddOnKind::LastMinute, record.last_minute),
        ]
        .into_iter()
        .filter_map(|(kind, amount)| amount.map(|a| (kind, a)))
        .map(|(kind, amount)| Ok(AddOn { kind, amount: Money::from_major(amount)? }))
        .collect::<Result<Vec<_>>>()?;

        let canceller = UserId(record.canceller_id);
        let cancelled_by = match record.cancelled_by {
            CancellerRole::Homeowner => CancelledBy::Homeowner(canceller),
            CancellerRole::Cleaner => CancelledBy::Cleaner(canceller),
        };
        if record.cancelled_at < record.booked_at {
            return Err(LedgerError::ValidationError(format!(
                "appointment {} was cancelled before it was booked",
                record.appointment_id
            )));
        }

        let appointment = Appointment {
            id: AppointmentId(record.appointment_id),
            homeowner_id: UserId(record.homeowner_id),
            date: record.date,
            base_price: Money::from_major(record.base_price)?,
            add_ons,
            cleaners: parse_cleaners(&record.cleaners)?,
            payment_method_label: record
                .payment_method
                .filter(|label| !label.is_empty())
                .unwrap_or_else(|| "card on file".to_string()),
        };
        if appointment.checked_total_charge().is_none() {
            return Err(LedgerError::ValidationError(format!(
                "appointment {} amounts are too large",
                record.appointment_id
            )));
        }

        Ok(CancellationRequest {
            appointment,
            cancelled_by,
            booked_at: record.booked_at,
            cancelled_at: record.cancelled_at,
        })
    }
}

/// Reads cancellation requests from a CSV source.
///
/// Whitespace is trimmed and short rows are accepted, so trailing optional
/// columns can be left off.
pub struct CancellationReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CancellationReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses each row. A malformed row yields an error and the iterator
    /// moves on to the next one.
    pub fn requests(self) -> impl Iterator<Item = Result<CancellationRequest>> {
        self.reader
            .into_deserialize::<CancellationRecord>()
            .map(|result| -> Result<CancellationRequest> {
                result.map_err(LedgerError::from)?.try_into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "appointment_id,homeowner_id,cleaners,date,base_price,linens,time_window,high_volume,last_minute,cancelled_by,canceller_id,booked_at,cancelled_at,payment_method";

    #[test]
    fn test_reader_valid_stream() {
        let data = format!(
            "{HEADER}\n\
             1, 10, 20, 2026-03-12, 150.00, , , , , homeowner, 10, 2026-03-01T09:00:00Z, 2026-03-10T09:00:00Z, Visa 4242\n\
             2, 11, 20:6000;21:4000, 2026-04-01, 100, 20.00, , , , cleaner, 21, 2026-03-01T09:00:00Z, 2026-03-20T09:00:00Z,"
        );
        let results: Vec<Result<CancellationRequest>> =
            CancellationReader::new(data.as_bytes()).requests().collect();

        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.appointment.id, AppointmentId(1));
        assert_eq!(first.appointment.base_price, Money::from_cents(15000));
        assert_eq!(first.cancelled_by, CancelledBy::Homeowner(UserId(10)));
        assert_eq!(first.appointment.payment_method_label, "Visa 4242");

        let second = results[1].as_ref().unwrap();
        assert_eq!(second.appointment.total_charge(), Money::from_cents(12000));
        assert_eq!(second.appointment.cleaners[1].share_basis_points, Some(4000));
        assert_eq!(second.cancelled_by, CancelledBy::Cleaner(UserId(21)));
        assert_eq!(second.appointment.payment_method_label, "card on file");
    }

    #[test]
    fn test_reader_malformed_lines() {
        let data = format!(
            "{HEADER}\n\
             1, 10, 20, 2026-03-12, -5, , , , , homeowner, 10, 2026-03-01T09:00:00Z, 2026-03-10T09:00:00Z,\n\
             2, 10, 20, not-a-date, 150, , , , , homeowner, 10, 2026-03-01T09:00:00Z, 2026-03-10T09:00:00Z,\n\
             3, 10, x:y, 2026-03-12, 150, , , , , homeowner, 10, 2026-03-01T09:00:00Z, 2026-03-10T09:00:00Z,\n\
             4, 10, 20, 2026-03-12, 150, , , , , homeowner, 10, 2026-03-01T09:00:00Z, 2026-03-10T09:00:00Z,"
        );
        let results: Vec<Result<CancellationRequest>> =
            CancellationReader::new(data.as_bytes()).requests().collect();

        assert_eq!(results.len(), 4);
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert!(results[2].is_err());
        assert!(results[3].is_ok());
    }

    #[test]
    fn test_cancelled_before_booking_is_rejected() {
        let data = format!(
            "{HEADER}\n1, 10, 20, 2026-03-12, 150, , , , , homeowner, 10, 2026-03-10T09:00:00Z, 2026-03-01T09:00:00Z,"
        );
        let results: Vec<_> = CancellationReader::new(data.as_bytes()).requests().collect();
        assert!(matches!(results[0], Err(LedgerError::ValidationError(_))));
    }

    #[test]
    fn test_amounts_beyond_range_are_rejected() {
        let data = format!(
            "{HEADER}\n1, 10, 20, 2026-03-12, 184467440737095516.15, 0.01, , , , homeowner, 10, 2026-03-01T09:00:00Z, 2026-03-10T09:00:00Z,"
        );
        let results: Vec<_> = CancellationReader::new(data.as_bytes()).requests().collect();
        assert!(matches!(results[0], Err(LedgerError::ValidationError(_))));
    }
}
