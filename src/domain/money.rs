use crate::error::{LedgerError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// A monetary value in minor currency units (cents).
///
/// Always non-negative. Subtraction is only available in checked or saturating
/// form so a computation can never silently wrap into a negative amount.
/// `+` saturates at `u64::MAX`; inputs are bounded with `checked_add` where they
/// enter the system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Self = Self(0);

    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Builds an amount from a major-unit decimal (e.g. `12.34`).
    ///
    /// Rejects negative values and values with sub-cent precision.
    pub fn from_major(value: Decimal) -> Result<Self> {
        if value < Decimal::ZERO {
            return Err(LedgerError::ValidationError(
                "Amount must not be negative".to_string(),
            ));
        }
        let cents = value * Decimal::ONE_HUNDRED;
        if cents.fract() != Decimal::ZERO {
            return Err(LedgerError::ValidationError(format!(
                "Amount {value} has sub-cent precision"
            )));
        }
        cents
            .to_u64()
            .map(Self)
            .ok_or_else(|| LedgerError::ValidationError(format!("Amount {value} is out of range")))
    }

    pub fn cents(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_major(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::ONE_HUNDRED
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Applies a percentage in `[0, 100]`, rounding half away from zero to the cent.
    pub fn percentage(&self, pct: Decimal) -> Result<Self> {
        if pct < Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
            return Err(LedgerError::PolicyComputation(format!(
                "percentage {pct} outside [0, 100]"
            )));
        }
        let raw = Decimal::from(self.0) * pct / Decimal::ONE_HUNDRED;
        raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_u64()
            .map(Self)
            .ok_or_else(|| LedgerError::PolicyComputation(format!("{raw} is out of range")))
    }

    /// Signed difference `self - other` in cents.
    pub fn signed_diff(&self, other: Money) -> i64 {
        self.0 as i64 - other.0 as i64
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.copied().sum()
    }
}
