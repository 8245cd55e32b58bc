use crate::domain::appeal::Priority;
use crate::domain::appointment::AddOnKind;
use crate::domain::money::Money;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the cancellation fee is sized once the fee window applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CancellationFeePolicy {
    Flat { amount: Money },
    /// Percentage of the total booking charge.
    Percentage { percent: Decimal },
}

/// Platform-wide cancellation knobs, passed explicitly into every policy call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Cancellations fewer than this many calendar days out get the reduced refund.
    pub penalty_window_days: i64,
    pub penalty_refund_percentage: Decimal,
    /// Cancellations fewer than this many calendar days out pay the fee.
    pub fee_window_days: i64,
    pub cancellation_fee: CancellationFeePolicy,
    /// Share of retained revenue (or of a completed job) paid to cleaners.
    pub cleaner_payout_percentage: Decimal,
    pub non_refundable_add_ons: Vec<AddOnKind>,
    /// Offset of platform local time from UTC, used for calendar-day math.
    pub utc_offset_minutes: i32,
    /// How long after a cancellation an appeal may be filed.
    pub appeal_window_hours: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            penalty_window_days: 3,
            penalty_refund_percentage: dec!(50),
            fee_window_days: 7,
            cancellation_fee: CancellationFeePolicy::Flat {
                amount: Money::from_cents(2500),
            },
            cleaner_payout_percentage: dec!(90),
            non_refundable_add_ons: Vec::new(),
            utc_offset_minutes: 0,
            appeal_window_hours: 72,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppealConfig {
    pub sla_hours_urgent: i64,
    pub sla_hours_high: i64,
    pub sla_hours_normal: i64,
}

impl Default for AppealConfig {
    fn default() -> Self {
        Self {
            sla_hours_urgent: 12,
            sla_hours_high: 24,
            sla_hours_normal: 48,
        }
    }
}

impl AppealConfig {
    pub fn sla_hours(&self, priority: Priority) -> i64 {
        match priority {
            Priority::Urgent => self.sla_hours_urgent,
            Priority::High => self.sla_hours_high,
            Priority::Normal => self.sla_hours_normal,
        }
    }
}

/// Bounded exponential backoff for gateway calls and ledger writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub policy: PolicyConfig,
    pub appeals: AppealConfig,
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Loads defaults, then the optional file, then `HOMECLEAN__*` environment
    /// variables (e.g. `HOMECLEAN__POLICY__PENALTY_WINDOW_DAYS=2`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: AppConfig = builder
            .add_source(config::Environment::with_prefix("HOMECLEAN").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.policy;
        let pct_ok = |v: Decimal| v >= Decimal::ZERO && v <= Decimal::ONE_HUNDRED;
        if !pct_ok(p.penalty_refund_percentage) || !pct_ok(p.cleaner_payout_percentage) {
            return Err(invalid("policy percentages must be within [0, 100]"));
        }
        if let CancellationFeePolicy::Percentage { percent } = &p.cancellation_fee
            && !pct_ok(*percent)
        {
            return Err(invalid("cancellation fee percentage must be within [0, 100]"));
        }
        if p.penalty_window_days < 0 || p.fee_window_days < 0 {
            return Err(invalid("policy windows must not be negative"));
        }
        if p.appeal_window_hours <= 0 {
            return Err(invalid("appeal window must be positive"));
        }
        let a = &self.appeals;
        if !(0 < a.sla_hours_urgent
            && a.sla_hours_urgent < a.sla_hours_high
            && a.sla_hours_high < a.sla_hours_normal)
        {
            return Err(invalid("SLA hours must satisfy 0 < urgent < high < normal"));
        }
        if self.retry.max_attempts == 0 || self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry needs at least one attempt and min_delay <= max_delay"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> LedgerError {
    LedgerError::ValidationError(format!("invalid configuration: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.appeals.sla_hours(Priority::Urgent), 12);
        assert_eq!(cfg.appeals.sla_hours(Priority::High), 24);
        assert_eq!(cfg.appeals.sla_hours(Priority::Normal), 48);
    }

    #[test]
    fn test_sla_ordering_is_enforced() {
        let mut cfg = AppConfig::default();
        cfg.appeals.sla_hours_high = 12;
        assert!(matches!(cfg.validate(), Err(LedgerError::ValidationError(_))));
    }

    #[test]
    fn test_percentage_bounds_are_enforced() {
        let mut cfg = AppConfig::default();
        cfg.policy.penalty_refund_percentage = dec!(120);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"policy": {{"penalty_window_days": 2, "fee_window_days": 5}},
                "retry": {{"max_attempts": 5}}}}"#
        )
        .unwrap();

        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.policy.penalty_window_days, 2);
        assert_eq!(cfg.policy.fee_window_days, 5);
        assert_eq!(cfg.policy.penalty_refund_percentage, dec!(50));
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.appeals, AppealConfig::default());
    }
}
