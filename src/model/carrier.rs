//! Carrier-network submission records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::submission::SubmissionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarrierStatus {
    Pending,
    Accepted,
    Rejected,
    Error,
}

impl CarrierStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Submission status implied by a terminal carrier outcome.
    ///
    /// `Error` is a transport problem, not a decision, so it implies nothing.
    pub fn submission_outcome(&self) -> Option<SubmissionStatus> {
        match self {
            Self::Accepted => Some(SubmissionStatus::Approved),
            Self::Rejected => Some(SubmissionStatus::Rejected),
            Self::Pending | Self::Error => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for CarrierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CarrierStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "REJECTED" => Ok(Self::Rejected),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown carrier status: {other}")),
        }
    }
}

/// One submission to the carrier network. The most recent per submission is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierSubmission {
    pub id: Uuid,
    pub submission_id: Uuid,
    /// Identifier assigned by the carrier transport.
    pub carrier_submission_id: String,
    pub status: CarrierStatus,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CarrierSubmission {
    pub fn new(submission_id: Uuid, carrier_submission_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            submission_id,
            carrier_submission_id: carrier_submission_id.into(),
            status: CarrierStatus::Pending,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_submission_status() {
        assert_eq!(
            CarrierStatus::Accepted.submission_outcome(),
            Some(SubmissionStatus::Approved)
        );
        assert_eq!(
            CarrierStatus::Rejected.submission_outcome(),
            Some(SubmissionStatus::Rejected)
        );
        assert_eq!(CarrierStatus::Error.submission_outcome(), None);
        assert!(!CarrierStatus::Pending.is_terminal());
    }
}
