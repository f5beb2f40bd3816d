use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("data error: {0}")]
    Data(String),
}

/// Operation name tracked by the recorder audit trail for bonus writes.
pub const OPERATION_RECORD_BONUS: &str = "record_bonus";

/// Contract identifier stamped on every replay payload.
pub const AUDIT_REPLAY_CONTRACT_VERSION: &str = "audit_replay.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CorrectionId(pub i64);

impl Display for CorrectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Correction {
    pub id: CorrectionId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub score: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BonusInput {
    pub user_id: UserId,
    pub project_name: String,
    pub score: i64,
}

impl BonusInput {
    /// Validates a bonus request before any write is attempted.
    ///
    /// The user id and score deliberately carry no range checks: user
    /// existence is enforced by the store's foreign keys, and any integer
    /// score (including negative) is an accepted grade adjustment.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the project name is empty or
    /// whitespace-only.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.project_name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "project_name MUST be a non-empty string".to_string(),
            ));
        }

        Ok(())
    }
}

/// Result of one bonus write: the appended correction, the project it
/// references, and whether that project row was created by this call.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BonusReceipt {
    pub correction: Correction,
    pub project: Project,
    pub project_created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub operation: String,
    pub input_json: Value,
    pub output_json: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Replay report for one audited operation: the lifetime call counter plus
/// the per-call input/output history in append order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditReplay {
    pub contract_version: String,
    pub operation: String,
    pub calls_recorded: u64,
    pub entries: Vec<AuditEntry>,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Data`] when parsing fails or the timestamp is not
/// UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Data(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Data(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Data`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Data(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
