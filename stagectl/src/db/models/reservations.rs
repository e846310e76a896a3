use crate::{
    db::models::credits::CreditTransactionDBResponse,
    types::{ExternalTaskId, JobId, ReservationId, SettledBy, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Audit payload written alongside a confirmed reservation.
///
/// The schema is versioned: the tag is persisted with the row, and a new
/// shape gets a new variant so stored `v1` records stay decodable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum SettlementMetadata {
    #[serde(rename = "v1")]
    V1(SettlementMetadataV1),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementMetadataV1 {
    pub job_id: JobId,
    pub attempt: i32,
    pub external_task_id: Option<ExternalTaskId>,
    pub result_url: Option<String>,
    pub duration_ms: Option<i64>,
    pub settled_by: SettledBy,
}

impl SettlementMetadata {
    pub fn job_id(&self) -> JobId {
        match self {
            SettlementMetadata::V1(v1) => v1.job_id,
        }
    }

    pub fn settled_by(&self) -> SettledBy {
        match self {
            SettlementMetadata::V1(v1) => v1.settled_by,
        }
    }
}

/// Database request for opening a reservation
#[derive(Debug, Clone)]
pub struct ReservationCreateDBRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub operation_tag: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Database response for a reservation
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationDBResponse {
    pub id: ReservationId,
    pub user_id: UserId,
    pub amount: i64,
    pub operation_tag: String,
    pub status: ReservationStatus,
    pub metadata: Option<SettlementMetadata>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl ReservationDBResponse {
    /// A pending hold counts against available balance until it expires
    pub fn holds_credits(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.expires_at.is_none_or(|at| at > now)
    }
}

/// Result of an atomic check-and-hold
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved(ReservationDBResponse),
    Insufficient { available: i64 },
    /// Another pending hold already carries this operation tag
    TagHeld,
}

/// Result of a confirm or cancel call. Settling a reservation that already
/// left `pending` reports `AlreadySettled` instead of touching the ledger.
/// Confirming a hold past its `expires_at` cancels it and reports `Expired`.
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Confirmed {
        reservation: ReservationDBResponse,
        transaction: CreditTransactionDBResponse,
    },
    Cancelled {
        reservation: ReservationDBResponse,
    },
    AlreadySettled {
        reservation: ReservationDBResponse,
    },
    Expired {
        reservation: ReservationDBResponse,
    },
}

impl SettlementOutcome {
    pub fn reservation(&self) -> &ReservationDBResponse {
        match self {
            SettlementOutcome::Confirmed { reservation, .. }
            | SettlementOutcome::Cancelled { reservation }
            | SettlementOutcome::AlreadySettled { reservation }
            | SettlementOutcome::Expired { reservation } => reservation,
        }
    }

    /// True when this call performed the requested transition
    pub fn applied(&self) -> bool {
        matches!(self, SettlementOutcome::Confirmed { .. } | SettlementOutcome::Cancelled { .. })
    }
}
