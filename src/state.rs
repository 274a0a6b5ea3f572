//! Directory State Machine (spec.md 4.5): the per-directory lifecycle
//! with hysteresis on transient errors.
//!
//! Hand-rolled as a plain enum with a pure `apply` transition function,
//! in the style of `idp-sync/src/sync.rs`'s `SyncReport` — a plain data
//! type updated by explicit methods rather than a state-machine macro,
//! since nothing in the retrieval pack grounds a `statig`-style typestate
//! API.

use crate::error::{Classification, ErrorKind};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Enabled,
    EnabledErroredTransient,
    DisabledClientError,
    DisabledAccount,
    DisabledOperator
}

/// The subset of `Directory` fields the state machine reads and writes.
/// Mirrors spec.md 3's `Directory` entity fields relevant to lifecycle.
#[derive(Debug, Clone)]
pub struct DirectoryLifecycle {
    pub state: DirectoryState,
    pub errored_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_email_count: u32,
    pub is_disabled: bool,
    pub disabled_reason: Option<String>,
    pub is_verified: bool
}

impl DirectoryLifecycle {
    pub fn fresh() -> Self {
        Self {
            state: DirectoryState::Enabled,
            errored_at: None,
            error_message: None,
            error_email_count: 0,
            is_disabled: false,
            disabled_reason: None,
            is_verified: false
        }
    }

    /// A successful run clears every error field and (re)enables the
    /// directory (spec.md 4.5, "any successful sync").
    pub fn on_success(&mut self, first_successful_sync: bool) {
        self.state = DirectoryState::Enabled;
        self.errored_at = None;
        self.error_message = None;
        self.error_email_count = 0;
        self.is_disabled = false;
        self.disabled_reason = None;
        if first_successful_sync {
            self.is_verified = true;
        }
    }

    /// Applies a classified error, advancing state per spec.md 4.5.
    /// `now` is passed in rather than read from the clock so the 24h
    /// promotion can be tested deterministically.
    pub fn on_error(&mut self, classification: &Classification, now: DateTime<Utc>, transient_to_fatal_after: chrono::Duration) {
        self.error_message = Some(classification.message.clone());
        self.error_email_count += 1;

        match classification.kind {
            ErrorKind::ClientError => {
                self.state = DirectoryState::DisabledClientError;
                self.errored_at = Some(now);
                self.is_verified = false;
                self.is_disabled = true;
                self.disabled_reason = Some("Sync error".to_string());
            }
            ErrorKind::Transient => {
                if self.errored_at.is_none() {
                    self.errored_at = Some(now);
                }
                self.state = DirectoryState::EnabledErroredTransient;

                let errored_since = self.errored_at.expect("set above");
                if now - errored_since >= transient_to_fatal_after {
                    self.state = DirectoryState::DisabledClientError;
                    self.is_disabled = true;
                    self.disabled_reason = Some("Sync error".to_string());
                }
            }
        }
    }

    /// An account-level disable takes the directory out of scheduling
    /// without mutating its own state (spec.md 4.5, "account disabled").
    pub fn is_schedulable(&self, account_disabled: bool, account_idp_sync_enabled: bool) -> bool {
        !self.is_disabled && !account_disabled && account_idp_sync_enabled && self.state != DirectoryState::DisabledOperator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncStep;
    use uuid::Uuid;

    fn classify(kind: ErrorKind, message: &str) -> Classification {
        Classification {
            kind,
            directory_id: Uuid::nil(),
            step: SyncStep::StreamUsers,
            message: message.to_string()
        }
    }

    #[test]
    fn client_error_disables_immediately() {
        let mut lifecycle = DirectoryLifecycle::fresh();
        lifecycle.on_error(&classify(ErrorKind::ClientError, "bad creds"), Utc::now(), chrono::Duration::hours(24));
        assert_eq!(lifecycle.state, DirectoryState::DisabledClientError);
        assert!(lifecycle.is_disabled);
        assert_eq!(lifecycle.disabled_reason.as_deref(), Some("Sync error"));
        assert!(!lifecycle.is_verified);
    }

    #[test]
    fn transient_error_stays_enabled_until_24h_elapse() {
        let mut lifecycle = DirectoryLifecycle::fresh();
        let t0 = Utc::now();
        lifecycle.on_error(&classify(ErrorKind::Transient, "503"), t0, chrono::Duration::hours(24));
        assert_eq!(lifecycle.state, DirectoryState::EnabledErroredTransient);
        assert!(!lifecycle.is_disabled);

        lifecycle.on_error(&classify(ErrorKind::Transient, "503 again"), t0 + chrono::Duration::hours(23), chrono::Duration::hours(24));
        assert_eq!(lifecycle.state, DirectoryState::EnabledErroredTransient);

        lifecycle.on_error(&classify(ErrorKind::Transient, "503 still"), t0 + chrono::Duration::hours(25), chrono::Duration::hours(24));
        assert_eq!(lifecycle.state, DirectoryState::DisabledClientError);
        assert!(lifecycle.is_disabled);
    }

    #[test]
    fn success_after_transient_error_clears_everything() {
        let mut lifecycle = DirectoryLifecycle::fresh();
        let t0 = Utc::now();
        lifecycle.on_error(&classify(ErrorKind::Transient, "503"), t0, chrono::Duration::hours(24));
        lifecycle.on_success(false);

        assert_eq!(lifecycle.state, DirectoryState::Enabled);
        assert!(lifecycle.errored_at.is_none());
        assert!(lifecycle.error_message.is_none());
        assert!(!lifecycle.is_disabled);
    }

    #[test]
    fn account_disable_blocks_scheduling_without_mutating_directory() {
        let lifecycle = DirectoryLifecycle::fresh();
        assert!(lifecycle.is_schedulable(false, true));
        assert!(!lifecycle.is_schedulable(true, true));
        assert!(!lifecycle.is_schedulable(false, false));
        assert_eq!(lifecycle.state, DirectoryState::Enabled);
    }
}
