//! Cancellation policy: pure functions from appointment, canceller and time to money.

use crate::config::{CancellationFeePolicy, PolicyConfig};
use crate::domain::appointment::{Appointment, CancelledBy, CleanerAssignment};
use crate::domain::money::Money;
use crate::domain::settlement::{CancellationOutcome, CancellationWindow, CleanerShare};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;

const FULL_SHARE_BASIS_POINTS: u64 = 10_000;

/// Calendar days between the platform-local date of `now` and `date`.
pub fn days_until(config: &PolicyConfig, date: NaiveDate, now: DateTime<Utc>) -> Result<i64> {
    let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
        LedgerError::PolicyComputation(format!(
            "invalid UTC offset of {} minutes",
            config.utc_offset_minutes
        ))
    })?;
    let today = now.with_timezone(&offset).date_naive();
    Ok((date - today).num_days())
}

/// Computes refund, fee and payouts for a cancellation.
///
/// Windows use calendar-day granularity. A cancellation exactly
/// `penalty_window_days` out still gets the full refund; one day closer it does not.
/// The same boundary rule applies to the fee window.
pub fn compute_cancellation_outcome(
    config: &PolicyConfig,
    appointment: &Appointment,
    cancelled_by: CancelledBy,
    now: DateTime<Utc>,
) -> Result<CancellationOutcome> {
    if appointment.base_price.is_zero() {
        return Err(LedgerError::PolicyComputation(format!(
            "appointment {} has no base price",
            appointment.id
        )));
    }
    match cancelled_by {
        CancelledBy::Homeowner(id) if id != appointment.homeowner_id => {
            return Err(LedgerError::PolicyComputation(format!(
                "user {id} is not the homeowner of appointment {}",
                appointment.id
            )));
        }
        CancelledBy::Cleaner(id) if !appointment.is_assigned_cleaner(id) => {
            return Err(LedgerError::PolicyComputation(format!(
                "user {id} is not assigned to appointment {}",
                appointment.id
            )));
        }
        _ => {}
    }

    let days = days_until(config, appointment.date, now)?;
    if days < 0 {
        return Err(LedgerError::PolicyComputation(format!(
            "appointment {} was scheduled {} day(s) ago",
            appointment.id, -days
        )));
    }

    let total = appointment.checked_total_charge().ok_or_else(|| {
        LedgerError::PolicyComputation(format!(
            "appointment {} charges overflow the amount range",
            appointment.id
        ))
    })?;
    let window = if days < config.penalty_window_days {
        CancellationWindow::Penalty
    } else {
        CancellationWindow::Lenient
    };

    if let CancelledBy::Cleaner(_) = cancelled_by {
        return Ok(CancellationOutcome {
            days_until: days,
            window,
            total_charge: total,
            refund_amount: total,
            refund_percentage: Decimal::ONE_HUNDRED,
            cancellation_fee: Money::ZERO,
            cleaner_payout: Money::ZERO,
            cleaner_shares: Vec::new(),
            platform_revenue: Money::ZERO,
            rationale: "Cancelled by the cleaner: full refund, no fee".to_string(),
        });
    }

    let non_refundable: Money = appointment
        .add_ons
        .iter()
        .filter(|a| config.non_refundable_add_ons.contains(&a.kind))
        .map(|a| a.amount)
        .sum();
    let refundable = total.saturating_sub(non_refundable);

    let refund_percentage = match window {
        CancellationWindow::Penalty => config.penalty_refund_percentage,
        CancellationWindow::Lenient => Decimal::ONE_HUNDRED,
    };
    let refund_amount = refundable.percentage(refund_percentage)?;

    let cancellation_fee = if days < config.fee_window_days {
        match &config.cancellation_fee {
            CancellationFeePolicy::Flat { amount } => *amount,
            CancellationFeePolicy::Percentage { percent } => total.percentage(*percent)?,
        }
    } else {
        Money::ZERO
    };

    let retained = total.checked_sub(refund_amount).ok_or_else(|| {
        LedgerError::PolicyComputation("refund exceeds the amount charged".to_string())
    })?;
    let cleaner_payout = retained.percentage(config.cleaner_payout_percentage)?;
    let cleaner_shares = split_payout(cleaner_payout, &appointment.cleaners)?;
    let platform_revenue = retained.saturating_sub(cleaner_payout);

    let rationale = match window {
        CancellationWindow::Penalty => format!(
            "Cancelled {days} day(s) before the appointment, \
             inside the {}-day penalty window: {}% refund",
            config.penalty_window_days, refund_percentage
        ),
        CancellationWindow::Lenient => format!(
            "Cancelled {days} day(s) before the appointment, \
             outside the {}-day penalty window: full refund",
            config.penalty_window_days
        ),
    };

    Ok(CancellationOutcome {
        days_until: days,
        window,
        total_charge: total,
        refund_amount,
        refund_percentage,
        cancellation_fee,
        cleaner_payout,
        cleaner_shares,
        platform_revenue,
        rationale,
    })
}

/// Splits `total` across the assigned cleaners so the shares sum exactly to `total`.
///
/// Cleaners are ordered by id. If every cleaner carries a recorded share (basis
/// points summing to 10 000) the split is proportional, otherwise even. Each share is
/// floored and the leftover cents go to the first cleaner.
pub fn split_payout(total: Money, cleaners: &[CleanerAssignment]) -> Result<Vec<CleanerShare>> {
    if cleaners.is_empty() {
        return if total.is_zero() {
            Ok(Vec::new())
        } else {
            Err(LedgerError::PolicyComputation(
                "payout owed but no cleaner is assigned".to_string(),
            ))
        };
    }

    let mut ordered: Vec<&CleanerAssignment> = cleaners.iter().collect();
    ordered.sort_by_key(|c| c.cleaner_id);
    if ordered.windows(2).any(|w| w[0].cleaner_id == w[1].cleaner_id) {
        return Err(LedgerError::PolicyComputation(
            "a cleaner is assigned twice".to_string(),
        ));
    }

    let recorded = ordered.iter().filter(|c| c.share_basis_points.is_some()).count();
    let cents = total.cents();
    let mut amounts: Vec<u64> = if recorded == 0 {
        let n = ordered.len() as u64;
        vec![cents / n; ordered.len()]
    } else if recorded == ordered.len() {
        let points: Vec<u64> = ordered
            .iter()
            .map(|c| u64::from(c.share_basis_points.unwrap_or(0)))
            .collect();
        if points.iter().sum::<u64>() != FULL_SHARE_BASIS_POINTS {
            return Err(LedgerError::PolicyComputation(
                "recorded cleaner shares do not add up to 100%".to_string(),
            ));
        }
        points
            .iter()
            .map(|p| {
                let share =
                    u128::from(cents) * u128::from(*p) / u128::from(FULL_SHARE_BASIS_POINTS);
                u64::try_from(share).unwrap_or(0)
            })
            .collect()
    } else {
        return Err(LedgerError::PolicyComputation(
            "only some cleaners have a recorded share".to_string(),
        ));
    };

    let remainder = cents - amounts.iter().sum::<u64>();
    amounts[0] += remainder;

    Ok(ordered
        .iter()
        .zip(amounts)
        .map(|(c, amount)| CleanerShare {
            cleaner_id: c.cleaner_id,
            amount: Money::from_cents(amount),
        })
        .collect())
}

/// What each cleaner earns when the job is completed.
pub fn job_payout_shares(
    config: &PolicyConfig,
    appointment: &Appointment,
) -> Result<Vec<CleanerShare>> {
    let payout = appointment
        .total_charge()
        .percentage(config.cleaner_payout_percentage)?;
    split_payout(payout, &appointment.cleaners)
}
