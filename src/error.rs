//! Error taxonomy and classifier (spec.md sections 4.8 and 7).
//!
//! Follows the shape of `idp-sync/src/error.rs`: a single `thiserror`
//! enum with named fields, plus pure helper methods. The classifier
//! itself never touches the database — it is a function from `(error,
//! directory_id, step)` to `Classification`.

use thiserror::Error;
use uuid::Uuid;

pub type IdpSyncResult<T> = Result<T, IdpSyncError>;

#[derive(Debug, Error)]
pub enum IdpSyncError {
    #[error("transport error contacting {host}: {reason}")]
    TransportError { host: String, reason: String },

    #[error("IdP returned {status} for {path}: {message}")]
    HttpClientError {
        status: u16,
        path: String,
        message: String
    },

    #[error("IdP returned {status} for {path}: {message}")]
    HttpServerError {
        status: u16,
        path: String,
        message: String
    },

    #[error("record missing required field {field} in {record_kind}")]
    ValidationError {
        record_kind: String,
        field: String
    },

    #[error("scope/authorization error: {message}")]
    ScopeError { message: String },

    #[error(
        "deletion threshold exceeded for {resource}: {to_delete} of {total} rows ({threshold_pct}%) would be removed"
    )]
    DeletionThresholdExceeded {
        resource: String,
        total: u64,
        to_delete: u64,
        threshold_pct: u8
    },

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("private key material could not be parsed: {0}")]
    KeyMaterialInvalid(String),

    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("scheduler error: {0}")]
    SchedulerError(String),

    #[error("sync run cancelled")]
    Cancelled
}

impl From<reqwest::Error> for IdpSyncError {
    fn from(err: reqwest::Error) -> Self {
        let host = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        IdpSyncError::TransportError {
            host,
            reason: err.to_string()
        }
    }
}

/// The step during which an error was raised, used by the classifier and
/// by the directory state machine to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    GetAccessToken,
    StreamUsers,
    StreamGroups,
    StreamGroupMembers,
    StreamOrgUnits,
    BatchUpsertIdentities,
    BatchUpsertGroups,
    BatchUpsertMemberships,
    CheckDeletionThreshold,
    ProcessUser,
    ProcessGroup
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::GetAccessToken => "get_access_token",
            SyncStep::StreamUsers => "stream_users",
            SyncStep::StreamGroups => "stream_groups",
            SyncStep::StreamGroupMembers => "stream_group_members",
            SyncStep::StreamOrgUnits => "stream_org_units",
            SyncStep::BatchUpsertIdentities => "batch_upsert_identities",
            SyncStep::BatchUpsertGroups => "batch_upsert_groups",
            SyncStep::BatchUpsertMemberships => "batch_upsert_memberships",
            SyncStep::CheckDeletionThreshold => "check_deletion_threshold",
            SyncStep::ProcessUser => "process_user",
            SyncStep::ProcessGroup => "process_group"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientError,
    Transient
}

/// The Error Classifier's output: how to treat the error plus the
/// human-readable message that gets written to `directory.error_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub directory_id: Uuid,
    pub step: SyncStep,
    pub message: String
}

/// An error paired with the run phase it surfaced from, so the caller can
/// hand the real `step` to `classify` instead of guessing one (spec.md 4.8
/// lists `step` as part of the classifier's input).
#[derive(Debug)]
pub struct StepFailure {
    pub error: IdpSyncError,
    pub step: SyncStep
}

impl IdpSyncError {
    /// Maps an error plus call-site context into a `Classification`.
    /// Pure: no I/O, no database access (spec.md 4.8).
    pub fn classify(&self, directory_id: Uuid, step: SyncStep) -> Classification {
        let kind = match self {
            IdpSyncError::HttpClientError { .. } => ErrorKind::ClientError,
            IdpSyncError::HttpServerError { .. } => ErrorKind::Transient,
            IdpSyncError::TransportError { .. } => ErrorKind::Transient,
            IdpSyncError::DatabaseError(e) => {
                if is_caller_constraint_bug(e) {
                    ErrorKind::ClientError
                } else {
                    ErrorKind::Transient
                }
            }
            IdpSyncError::ValidationError { .. } => ErrorKind::ClientError,
            IdpSyncError::ScopeError { .. } => ErrorKind::ClientError,
            IdpSyncError::DeletionThresholdExceeded { .. } => ErrorKind::ClientError,
            IdpSyncError::KeyMaterialInvalid(_) => ErrorKind::ClientError,
            IdpSyncError::RateLimited { .. } => ErrorKind::Transient,
            IdpSyncError::ConfigError(_) => ErrorKind::ClientError,
            IdpSyncError::SchedulerError(_) => ErrorKind::Transient,
            IdpSyncError::Cancelled => ErrorKind::Transient
        };

        Classification {
            kind,
            directory_id,
            step,
            message: self.format_message()
        }
    }

    /// Actionable, user-facing resolution text. Provider error codes map
    /// to specific resolutions; everything else falls back to a
    /// status-based message (spec.md 4.8).
    fn format_message(&self) -> String {
        match self {
            IdpSyncError::HttpClientError {
                status, message, ..
            } => okta_code_resolution(message)
                .unwrap_or_else(|| http_status_resolution(*status, message)),
            IdpSyncError::HttpServerError { status, .. } => format!(
                "The identity provider returned a server error (HTTP {status}); the next scheduled sync will retry automatically",
            ),
            IdpSyncError::TransportError { host, reason } => format!(
                "Could not reach {host}: {reason}. The next scheduled sync will retry automatically",
            ),
            IdpSyncError::ValidationError { record_kind, field } => format!(
                "A {record_kind} record from the identity provider is missing required field \"{field}\"; fix the record in the provider and it will sync on the next run",
            ),
            IdpSyncError::ScopeError { message } => format!(
                "The configured credentials are missing a required permission: {message}",
            ),
            IdpSyncError::DeletionThresholdExceeded {
                resource,
                total,
                to_delete,
                threshold_pct
            } => format!(
                "Sync aborted: {to_delete} of {total} {resource} rows would have been deleted, exceeding the {threshold_pct}% safety threshold. Verify the directory configuration before re-enabling sync",
            ),
            IdpSyncError::DatabaseError(e) => {
                format!("A database error occurred during sync: {e}")
            }
            IdpSyncError::KeyMaterialInvalid(reason) => {
                format!("The configured signing key could not be parsed: {reason}")
            }
            IdpSyncError::RateLimited {
                retry_after_seconds
            } => format!("Rate limited by the identity provider; retrying after {retry_after_seconds}s"),
            IdpSyncError::ConfigError(reason) => format!("Directory configuration error: {reason}"),
            IdpSyncError::SchedulerError(reason) => format!("Scheduler error: {reason}"),
            IdpSyncError::Cancelled => "Sync was cancelled".to_string()
        }
    }
}

fn is_caller_constraint_bug(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    matches!(
        db_err.kind(),
        sqlx::error::ErrorKind::UniqueViolation | sqlx::error::ErrorKind::ForeignKeyViolation | sqlx::error::ErrorKind::CheckViolation
    )
}

/// Okta error bodies carry a stable `errorCode`; map the well-known ones
/// to actionable text (spec.md 4.8).
fn okta_code_resolution(body: &str) -> Option<String> {
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("errorCode").and_then(|c| c.as_str()).map(str::to_string))?;

    let resolution = match code.as_str() {
        "E0000004" => "Authentication failed: the configured API credentials are invalid or expired",
        "E0000006" => "The configured credentials lack the privilege required for this operation; grant the directory read scopes",
        "E0000047" => "Okta API rate limit exceeded; the next scheduled sync will retry automatically",
        _ => return Some(format!("Okta error {code}: {body}"))
    };
    Some(resolution.to_string())
}

fn http_status_resolution(status: u16, body: &str) -> String {
    match status {
        401 => "Authentication failed: the configured credentials were rejected".to_string(),
        403 => "The configured credentials lack a required permission".to_string(),
        404 => "The requested resource no longer exists at the identity provider".to_string(),
        429 => "Rate limited by the identity provider; the next scheduled sync will retry automatically".to_string(),
        _ => format!("The identity provider returned HTTP {status}: {body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_4xx_classifies_as_client_error() {
        let err = IdpSyncError::HttpClientError {
            status: 403,
            path: "/users".to_string(),
            message: "forbidden".to_string()
        };
        let c = err.classify(Uuid::nil(), SyncStep::StreamUsers);
        assert_eq!(c.kind, ErrorKind::ClientError);
    }

    #[test]
    fn http_5xx_and_transport_classify_as_transient() {
        let server = IdpSyncError::HttpServerError {
            status: 503,
            path: "/users".to_string(),
            message: "unavailable".to_string()
        };
        assert_eq!(
            server.classify(Uuid::nil(), SyncStep::StreamUsers).kind,
            ErrorKind::Transient
        );

        let transport = IdpSyncError::TransportError {
            host: "admin.googleapis.com".to_string(),
            reason: "connection reset".to_string()
        };
        assert_eq!(
            transport.classify(Uuid::nil(), SyncStep::StreamUsers).kind,
            ErrorKind::Transient
        );
    }

    #[test]
    fn validation_scope_and_circuit_breaker_are_client_errors() {
        let validation = IdpSyncError::ValidationError {
            record_kind: "user".to_string(),
            field: "primaryEmail".to_string()
        };
        assert_eq!(
            validation.classify(Uuid::nil(), SyncStep::ProcessUser).kind,
            ErrorKind::ClientError
        );

        let scope = IdpSyncError::ScopeError {
            message: "missing admin.directory.user.readonly".to_string()
        };
        assert_eq!(
            scope.classify(Uuid::nil(), SyncStep::GetAccessToken).kind,
            ErrorKind::ClientError
        );

        let breaker = IdpSyncError::DeletionThresholdExceeded {
            resource: "identities".to_string(),
            total: 100,
            to_delete: 95,
            threshold_pct: 90
        };
        let c = breaker.classify(Uuid::nil(), SyncStep::CheckDeletionThreshold);
        assert_eq!(c.kind, ErrorKind::ClientError);
        assert!(c.message.contains("95 of 100"));
        assert!(c.message.contains("90%"));
    }

    #[test]
    fn okta_known_error_code_maps_to_actionable_text() {
        let err = IdpSyncError::HttpClientError {
            status: 401,
            path: "/users".to_string(),
            message: r#"{"errorCode":"E0000004","errorSummary":"bad creds"}"#.to_string()
        };
        let c = err.classify(Uuid::nil(), SyncStep::StreamUsers);
        assert!(c.message.contains("invalid or expired"));
    }
}
