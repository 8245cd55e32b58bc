use super::ids::{AppointmentId, UserId};
use super::money::Money;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    Submitted,
    UnderReview,
    AwaitingDocuments,
    Approved,
    PartiallyApproved,
    Denied,
    Escalated,
    Closed,
}

impl AppealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealStatus::Submitted => "submitted",
            AppealStatus::UnderReview => "under_review",
            AppealStatus::AwaitingDocuments => "awaiting_documents",
            AppealStatus::Approved => "approved",
            AppealStatus::PartiallyApproved => "partially_approved",
            AppealStatus::Denied => "denied",
            AppealStatus::Escalated => "escalated",
            AppealStatus::Closed => "closed",
        }
    }

    /// Still waiting for a decision.
    pub fn is_active(&self) -> bool {
        match self {
            AppealStatus::Submitted
            | AppealStatus::UnderReview
            | AppealStatus::AwaitingDocuments => true,
            AppealStatus::Approved
            | AppealStatus::PartiallyApproved
            | AppealStatus::Denied
            | AppealStatus::Escalated
            | AppealStatus::Closed => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            AppealStatus::Approved
            | AppealStatus::PartiallyApproved
            | AppealStatus::Denied
            | AppealStatus::Escalated => true,
            AppealStatus::Submitted
            | AppealStatus::UnderReview
            | AppealStatus::AwaitingDocuments
            | AppealStatus::Closed => false,
        }
    }

    fn allows(&self, to: AppealStatus) -> bool {
        use AppealStatus::*;
        match (self, to) {
            (Submitted, UnderReview | Escalated) => true,
            (
                UnderReview,
                AwaitingDocuments | Approved | PartiallyApproved | Denied | Escalated,
            ) => true,
            (AwaitingDocuments, UnderReview | Escalated) => true,
            (Approved | PartiallyApproved | Denied | Escalated, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AppealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealerType {
    Homeowner,
    Cleaner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealCategory {
    MedicalEmergency,
    FamilyEmergency,
    NaturalDisaster,
    PropertyIssue,
    Transportation,
    SchedulingError,
    Other,
}

impl AppealCategory {
    fn is_emergency(&self) -> bool {
        matches!(
            self,
            AppealCategory::MedicalEmergency
                | AppealCategory::FamilyEmergency
                | AppealCategory::NaturalDisaster
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Normal,
}

impl Priority {
    pub fn from_category(category: AppealCategory, severity: Severity) -> Self {
        match (severity, category.is_emergency()) {
            (Severity::Critical, _) | (Severity::High, true) => Priority::Urgent,
            (Severity::High, false) | (Severity::Medium, true) => Priority::High,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestedItem {
    Penalty,
    Fee,
    Refund,
    Freeze,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportingDocument {
    pub url: String,
    pub doc_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Outcome of a review.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub penalty_waived: bool,
    pub fee_refunded: bool,
    /// Additional refund granted to the homeowner.
    pub refund_amount: Money,
    pub account_unfrozen: bool,
    pub rating_removed: bool,
    pub notes: Option<String>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        !self.penalty_waived
            && !self.fee_refunded
            && self.refund_amount.is_zero()
            && !self.account_unfrozen
            && !self.rating_removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Homeowner,
    Cleaner,
    Reviewer,
    Supervisor,
    System,
}

impl ActorRole {
    pub fn is_staff(&self) -> bool {
        matches!(self, ActorRole::Reviewer | ActorRole::Supervisor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<UserId>,
    pub role: ActorRole,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: None,
            role: ActorRole::System,
        }
    }

    pub fn reviewer(id: UserId) -> Self {
        Self {
            id: Some(id),
            role: ActorRole::Reviewer,
        }
    }

    pub fn supervisor(id: UserId) -> Self {
        Self {
            id: Some(id),
            role: ActorRole::Supervisor,
        }
    }

    pub fn homeowner(id: UserId) -> Self {
        Self {
            id: Some(id),
            role: ActorRole::Homeowner,
        }
    }

    pub fn cleaner(id: UserId) -> Self {
        Self {
            id: Some(id),
            role: ActorRole::Cleaner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EscalationReason {
    SlaBreach,
    ReviewerRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve { resolution: Resolution },
    PartiallyApprove { resolution: Resolution },
    Deny,
    Escalate { reason: EscalationReason },
}

impl Decision {
    pub fn target(&self) -> AppealStatus {
        match self {
            Decision::Approve { .. } => AppealStatus::Approved,
            Decision::PartiallyApprove { .. } => AppealStatus::PartiallyApproved,
            Decision::Deny => AppealStatus::Denied,
            Decision::Escalate { .. } => AppealStatus::Escalated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppealRequest {
    pub appointment_id: AppointmentId,
    pub appealer_id: UserId,
    pub appealer_type: AppealerType,
    pub category: AppealCategory,
    pub severity: Severity,
    pub description: String,
    pub supporting_documents: Vec<SupportingDocument>,
    pub contesting_items: BTreeSet<ContestedItem>,
    pub requested_relief: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appeal {
    pub id: Uuid,
    pub appointment_id: AppointmentId,
    pub appealer_id: UserId,
    pub appealer_type: AppealerType,
    pub category: AppealCategory,
    pub severity: Severity,
    pub description: String,
    pub supporting_documents: Vec<SupportingDocument>,
    pub contesting_items: BTreeSet<ContestedItem>,
    pub original_penalty_amount: Money,
    pub original_refund_withheld: Money,
    pub requested_relief: Money,
    pub status: AppealStatus,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub sla_deadline: DateTime<Utc>,
    pub assigned_to: Option<UserId>,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub escalation_reason: Option<EscalationReason>,
    pub resolution: Option<Resolution>,
    pub relief_settled: bool,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Appeal {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && now > self.sla_deadline
    }

    /// Checks whether `actor` may move the appeal to `to` at `now`.
    ///
    /// The stored appeal is never touched here; callers apply the change only
    /// after this returns `Ok`.
    pub fn check_transition(
        &self,
        to: AppealStatus,
        actor: &Actor,
        escalation: Option<&EscalationReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reject = |reason: String| LedgerError::InvalidAppealTransition {
            from: self.status,
            to,
            reason,
        };

        if !self.status.allows(to) {
            let reason = if self.status == AppealStatus::Closed {
                "appeal is closed".to_string()
            } else if self.status.is_terminal() && to != AppealStatus::Closed {
                format!("appeal is already {}", self.status)
            } else {
                format!("appeal cannot move from {} to {}", self.status, to)
            };
            return Err(reject(reason));
        }

        match actor.role {
            ActorRole::Reviewer | ActorRole::Supervisor => match (to, escalation) {
                (AppealStatus::Escalated, Some(EscalationReason::SlaBreach))
                    if !self.is_overdue(now) =>
                {
                    Err(reject("the SLA has not been breached".to_string()))
                }
                _ => Ok(()),
            },
            ActorRole::System => match (to, escalation) {
                (AppealStatus::Closed, _) => Ok(()),
                (AppealStatus::Escalated, Some(EscalationReason::SlaBreach))
                    if self.is_overdue(now) =>
                {
                    Ok(())
                }
                (AppealStatus::Escalated, _) => Err(reject(
                    "automatic escalation requires a breached SLA".to_string(),
                )),
                _ => Err(reject("only staff may review appeals".to_string())),
            },
            ActorRole::Homeowner | ActorRole::Cleaner => {
                Err(reject("only staff may change the status of an appeal".to_string()))
            }
        }
    }
}
