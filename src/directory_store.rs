//! Loads `Directory` rows. The provider-specific configuration
//! (`DirectoryConfig`'s tagged enum) is stored as a single JSONB column
//! rather than per-provider tables — the simpler of the two schema
//! shapes spec.md 6 calls out as acceptable ("per provider as separate
//! tables is acceptable, joined by id to a common `directories` row").

use crate::error::{IdpSyncError, IdpSyncResult};
use crate::model::{Directory, DirectoryConfig, Provider};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct DirectoryRow {
    id: Uuid,
    account_id: Uuid,
    provider: String,
    config: Json<DirectoryConfig>,
    synced_at: Option<DateTime<Utc>>,
    errored_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    is_disabled: bool,
    disabled_reason: Option<String>,
    is_verified: bool,
    error_email_count: i32
}

pub async fn load_directory(pool: &PgPool, directory_id: Uuid) -> IdpSyncResult<Directory> {
    let row: DirectoryRow = sqlx::query_as(
        "SELECT id, account_id, provider, config, synced_at, errored_at, error_message,
                is_disabled, disabled_reason, is_verified, error_email_count
         FROM directories WHERE id = $1"
    )
    .bind(directory_id)
    .fetch_one(pool)
    .await?;

    Ok(Directory {
        id: row.id,
        account_id: row.account_id,
        provider: parse_provider(&row.provider)?,
        config: row.config.0,
        synced_at: row.synced_at,
        errored_at: row.errored_at,
        error_message: row.error_message,
        is_disabled: row.is_disabled,
        disabled_reason: row.disabled_reason,
        is_verified: row.is_verified,
        error_email_count: row.error_email_count.max(0) as u32
    })
}

/// Directories eligible for scheduling right now (spec.md 4.6): not
/// disabled, and owned by an account with `idp_sync` enabled and not
/// disabled.
pub async fn eligible_directory_ids(pool: &PgPool) -> IdpSyncResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT d.id
         FROM directories d
         JOIN accounts a ON a.id = d.account_id
         WHERE d.is_disabled = false
           AND a.disabled_at IS NULL
           AND COALESCE((a.features->>'idp_sync')::boolean, false) = true"
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

fn parse_provider(value: &str) -> IdpSyncResult<Provider> {
    match value {
        "google" => Ok(Provider::Google),
        "entra" => Ok(Provider::Entra),
        "okta" => Ok(Provider::Okta),
        other => Err(IdpSyncError::ConfigError(format!("unknown provider '{other}' in directories row")))
    }
}
