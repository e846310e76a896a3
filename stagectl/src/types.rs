use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type ProjectId = Uuid;
pub type JobId = Uuid;
pub type ReservationId = Uuid;
pub type TransactionId = Uuid;

/// Opaque reference to a generation task owned by the AI provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalTaskId(pub String);

impl ExternalTaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalTaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExternalTaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who delivered the outcome that settled a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettledBy {
    /// The provider returned the result synchronously from submit.
    Immediate,
    Poll,
    Webhook,
    /// A user asked for a status refresh.
    Manual,
    Sweeper,
}

impl fmt::Display for SettledBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettledBy::Immediate => "immediate",
            SettledBy::Poll => "poll",
            SettledBy::Webhook => "webhook",
            SettledBy::Manual => "manual",
            SettledBy::Sweeper => "sweeper",
        };
        f.write_str(s)
    }
}
