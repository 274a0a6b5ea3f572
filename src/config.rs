//! Service configuration (spec.md section 6).
//!
//! Shaped like `idp-sync/src/config.rs`: a `serde`-deserializable struct
//! with `#[serde(default = "...")]` tunables, loadable from a TOML file and
//! overridable from `IDP_SYNC_*` environment variables. This service has
//! no use for the workspace `config` crate's file-watching hot-reload or
//! precedence-merging machinery — directories are re-read from the
//! database on every scheduler tick, so config only needs to be read once
//! at process start.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpSyncConfig {
    pub database_url: String,

    #[serde(default = "default_scheduler_period_s")]
    pub sync_scheduler_period_s: u64,

    #[serde(default = "default_job_wall_clock_timeout_s")]
    pub sync_job_wall_clock_timeout_s: u64,

    #[serde(default = "default_deletion_threshold_ratio")]
    pub deletion_threshold_ratio: f64,

    #[serde(default = "default_deletion_threshold_min_rows")]
    pub deletion_threshold_min_rows: u64,

    #[serde(default = "default_transient_to_fatal_hours")]
    pub deletion_threshold_transient_to_fatal_hours: i64,

    #[serde(default = "default_batch_size_identities")]
    pub batch_size_identities: usize,

    #[serde(default = "default_batch_size_memberships")]
    pub batch_size_memberships: usize,

    #[serde(default = "default_groups_per_membership_chunk")]
    pub groups_per_membership_chunk: usize,

    #[serde(default = "default_http_max_concurrent_per_host")]
    pub http_max_concurrent_per_host: usize,

    #[serde(default = "default_http_per_request_timeout_s")]
    pub http_per_request_timeout_s: u64,

    #[serde(default = "default_workers_concurrency")]
    pub workers_concurrency: usize
}

fn default_scheduler_period_s() -> u64 {
    600
}
fn default_job_wall_clock_timeout_s() -> u64 {
    1800
}
fn default_deletion_threshold_ratio() -> f64 {
    0.90
}
fn default_deletion_threshold_min_rows() -> u64 {
    10
}
fn default_transient_to_fatal_hours() -> i64 {
    24
}
fn default_batch_size_identities() -> usize {
    100
}
fn default_batch_size_memberships() -> usize {
    100
}
fn default_groups_per_membership_chunk() -> usize {
    50
}
fn default_http_max_concurrent_per_host() -> usize {
    8
}
fn default_http_per_request_timeout_s() -> u64 {
    60
}
fn default_workers_concurrency() -> usize {
    10
}

impl Default for IdpSyncConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            sync_scheduler_period_s: default_scheduler_period_s(),
            sync_job_wall_clock_timeout_s: default_job_wall_clock_timeout_s(),
            deletion_threshold_ratio: default_deletion_threshold_ratio(),
            deletion_threshold_min_rows: default_deletion_threshold_min_rows(),
            deletion_threshold_transient_to_fatal_hours: default_transient_to_fatal_hours(),
            batch_size_identities: default_batch_size_identities(),
            batch_size_memberships: default_batch_size_memberships(),
            groups_per_membership_chunk: default_groups_per_membership_chunk(),
            http_max_concurrent_per_host: default_http_max_concurrent_per_host(),
            http_per_request_timeout_s: default_http_per_request_timeout_s(),
            workers_concurrency: default_workers_concurrency()
        }
    }
}

impl IdpSyncConfig {
    pub fn sync_scheduler_period(&self) -> Duration {
        Duration::from_secs(self.sync_scheduler_period_s)
    }

    pub fn sync_job_wall_clock_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_job_wall_clock_timeout_s)
    }

    pub fn http_per_request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_per_request_timeout_s)
    }

    /// Layers `IDP_SYNC_*` environment variables over the struct's
    /// defaults. Only the tunables that make sense to override without a
    /// restart-worthy schema change are read from the environment; the
    /// database URL always comes from `DATABASE_URL`.
    pub fn from_env() -> Result<Self, crate::error::IdpSyncError> {
        let mut config = IdpSyncConfig {
            database_url: std::env::var("DATABASE_URL").map_err(|_| {
                crate::error::IdpSyncError::ConfigError("DATABASE_URL is not set".to_string())
            })?,
            ..Default::default()
        };

        if let Ok(v) = std::env::var("IDP_SYNC_SCHEDULER_PERIOD_S") {
            config.sync_scheduler_period_s = v.parse().map_err(|_| {
                crate::error::IdpSyncError::ConfigError(
                    "IDP_SYNC_SCHEDULER_PERIOD_S must be an integer".to_string()
                )
            })?;
        }
        if let Ok(v) = std::env::var("IDP_SYNC_WORKERS_CONCURRENCY") {
            config.workers_concurrency = v.parse().map_err(|_| {
                crate::error::IdpSyncError::ConfigError(
                    "IDP_SYNC_WORKERS_CONCURRENCY must be an integer".to_string()
                )
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_section_6() {
        let config = IdpSyncConfig::default();
        assert_eq!(config.sync_scheduler_period_s, 600);
        assert_eq!(config.sync_job_wall_clock_timeout_s, 1800);
        assert_eq!(config.deletion_threshold_ratio, 0.90);
        assert_eq!(config.deletion_threshold_min_rows, 10);
        assert_eq!(config.deletion_threshold_transient_to_fatal_hours, 24);
        assert_eq!(config.batch_size_identities, 100);
        assert_eq!(config.batch_size_memberships, 100);
        assert_eq!(config.groups_per_membership_chunk, 50);
        assert_eq!(config.http_max_concurrent_per_host, 8);
        assert_eq!(config.http_per_request_timeout_s, 60);
        assert_eq!(config.workers_concurrency, 10);
    }

    #[test]
    fn deserializes_partial_toml_with_defaults() {
        let toml_str = r#"
            database_url = "postgres://localhost/idp"
            batch_size_identities = 250
        "#;
        let config: IdpSyncConfig = toml::from_str(toml_str).expect("valid toml");
        assert_eq!(config.batch_size_identities, 250);
        assert_eq!(config.batch_size_memberships, 100);
    }

    // `from_env` reads process-global environment state, so this test is
    // guarded with `serial_test::serial` to avoid racing other tests in
    // this binary that also set `IDP_SYNC_*`/`DATABASE_URL`.
    #[test]
    #[serial_test::serial]
    fn from_env_layers_overrides_over_defaults() {
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/idp_test");
            std::env::set_var("IDP_SYNC_SCHEDULER_PERIOD_S", "120");
            std::env::set_var("IDP_SYNC_WORKERS_CONCURRENCY", "4");
        }

        let config = IdpSyncConfig::from_env().expect("valid env");
        assert_eq!(config.database_url, "postgres://localhost/idp_test");
        assert_eq!(config.sync_scheduler_period_s, 120);
        assert_eq!(config.workers_concurrency, 4);
        assert_eq!(config.batch_size_identities, 100);

        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("IDP_SYNC_SCHEDULER_PERIOD_S");
            std::env::remove_var("IDP_SYNC_WORKERS_CONCURRENCY");
        }
    }

    #[test]
    #[serial_test::serial]
    fn from_env_rejects_missing_database_url() {
        unsafe {
            std::env::remove_var("DATABASE_URL");
        }
        assert!(IdpSyncConfig::from_env().is_err());
    }
}
