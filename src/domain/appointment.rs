use super::ids::{AppointmentId, UserId};
use super::ledger::EntryType;
use super::money::Money;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Optional extras a homeowner can book on top of the base price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOnKind {
    Linens,
    TimeWindow,
    HighVolume,
    LastMinute,
}

impl AddOnKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            AddOnKind::Linens => EntryType::AddonLinens,
            AddOnKind::TimeWindow => EntryType::AddonTimeWindow,
            AddOnKind::HighVolume => EntryType::AddonHighVolume,
            AddOnKind::LastMinute => EntryType::AddonLastMinute,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AddOnKind::Linens => "Linens",
            AddOnKind::TimeWindow => "Time window",
            AddOnKind::HighVolume => "High volume",
            AddOnKind::LastMinute => "Last-minute booking",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    pub kind: AddOnKind,
    pub amount: Money,
}

/// A cleaner assigned to the job.
///
/// `share_basis_points` is the separately recorded share of the job payout, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerAssignment {
    pub cleaner_id: UserId,
    pub share_basis_points: Option<u32>,
}

impl CleanerAssignment {
    pub fn new(cleaner_id: UserId) -> Self {
        Self {
            cleaner_id,
            share_basis_points: None,
        }
    }
}

/// The financial view of an appointment, as provided by the scheduling system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub homeowner_id: UserId,
    /// Local calendar date the cleaning is scheduled for.
    pub date: NaiveDate,
    pub base_price: Money,
    pub add_ons: Vec<AddOn>,
    pub cleaners: Vec<CleanerAssignment>,
    /// Human-readable card label, e.g. "Visa •••• 4242".
    pub payment_method_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub entry_type: EntryType,
    pub label: String,
    pub amount: Money,
}

impl Appointment {
    pub fn total_charge(&self) -> Money {
        self.base_price + self.add_ons.iter().map(|a| a.amount).sum::<Money>()
    }

    /// `None` when the amounts cannot be summed without overflowing.
    pub fn checked_total_charge(&self) -> Option<Money> {
        self.add_ons
            .iter()
            .try_fold(self.base_price, |acc, a| acc.checked_add(a.amount))
    }

    /// Itemized charges, base price first, one item per add-on kind.
    ///
    /// Add-ons of the same kind are merged so each kind maps to exactly one
    /// ledger pair. Kinds that sum to zero are omitted.
    pub fn line_items(&self) -> Vec<LineItem> {
        let mut items = vec![LineItem {
            entry_type: EntryType::BookingRevenue,
            label: "Cleaning".to_string(),
            amount: self.base_price,
        }];
        for add_on in &self.add_ons {
            let entry_type = add_on.kind.entry_type();
            match items.iter_mut().find(|item| item.entry_type == entry_type) {
                Some(item) => item.amount += add_on.amount,
                None => items.push(LineItem {
                    entry_type,
                    label: add_on.kind.label().to_string(),
                    amount: add_on.amount,
                }),
            }
        }
        items.retain(|item| {
            item.entry_type == EntryType::BookingRevenue || !item.amount.is_zero()
        });
        items
    }

    pub fn is_assigned_cleaner(&self, user: UserId) -> bool {
        self.cleaners.iter().any(|c| c.cleaner_id == user)
    }
}

/// Who asked for the cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "user_id", rename_all = "snake_case")]
pub enum CancelledBy {
    Homeowner(UserId),
    Cleaner(UserId),
}

impl CancelledBy {
    pub fn user_id(&self) -> UserId {
        match self {
            CancelledBy::Homeowner(id) | CancelledBy::Cleaner(id) => *id,
        }
    }
}
