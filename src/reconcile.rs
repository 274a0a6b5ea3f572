//! Reconciliation Engine (spec.md 4.4): consumes a provider adapter's
//! lazy record sequences and commits them against the `actors` /
//! `external_identities` / `groups` / `memberships` schema.
//!
//! Design Notes (spec.md 9) allow an equivalent multi-statement
//! transaction in place of the single giant multi-CTE upsert; this
//! engine takes that path — each phase runs a handful of raw `sqlx`
//! statements per batch inside one transaction, in the same
//! `sqlx::query`/`query_as` raw-SQL style as
//! `storage/src/postgres.rs` (including its `WITH RECURSIVE` / `ON
//! CONFLICT ... DO UPDATE` usage), rather than `idp-sync/src/sync.rs`'s
//! per-row loop — batching is required here, not a style choice.

use crate::error::{IdpSyncError, IdpSyncResult, StepFailure, SyncStep};
use crate::model::{Directory, EntityType};
use crate::providers::{GroupRecord, ProviderAdapter, UserRecord};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub identities_created: u64,
    pub identities_updated: u64,
    pub groups_upserted: u64,
    pub memberships_upserted: u64,
    pub groups_deleted: u64,
    pub identities_deleted: u64,
    pub memberships_deleted: u64,
    pub actors_deleted: u64
}

pub struct ReconciliationEngine {
    pool: PgPool,
    batch_size_identities: usize,
    batch_size_memberships: usize,
    groups_per_membership_chunk: usize,
    deletion_threshold_ratio: f64,
    deletion_threshold_min_rows: u64
}

struct NormalizedUser {
    idp_id: String,
    email: Option<String>,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    preferred_username: Option<String>
}

fn normalize_user(record: UserRecord) -> NormalizedUser {
    NormalizedUser {
        idp_id: record.idp_id,
        email: record.email.map(|e| e.trim().to_lowercase()),
        name: record.name,
        given_name: record.given_name,
        family_name: record.family_name,
        preferred_username: record.preferred_username
    }
}

/// Pure circuit-breaker predicate (spec.md 4.4 Phase 4), split out so it
/// is unit-testable without a database.
fn circuit_breaker_trips(total: u64, to_delete: u64, threshold_min_rows: u64, threshold_ratio: f64) -> bool {
    if total < threshold_min_rows {
        return false;
    }
    (to_delete as f64) / (total as f64) >= threshold_ratio
}

impl ReconciliationEngine {
    pub fn new(
        pool: PgPool,
        batch_size_identities: usize,
        batch_size_memberships: usize,
        groups_per_membership_chunk: usize,
        deletion_threshold_ratio: f64,
        deletion_threshold_min_rows: u64
    ) -> Self {
        Self {
            pool,
            batch_size_identities,
            batch_size_memberships,
            groups_per_membership_chunk,
            deletion_threshold_ratio,
            deletion_threshold_min_rows
        }
    }

    /// Runs the full ordered phase sequence for one directory and
    /// returns the committed row counts. `cancel` is polled at batch
    /// boundaries (spec.md 4.7, 5) — the current batch always finishes.
    #[tracing::instrument(skip(self, directory, adapter, cancel), fields(directory_id = %directory.id))]
    pub async fn run(&self, directory: &Directory, adapter: &dyn ProviderAdapter, cancel: &tokio_util::sync::CancellationToken) -> Result<RunOutcome, StepFailure> {
        let synced_at = Utc::now();
        let issuer = directory.issuer();
        let first_sync = directory.synced_at.is_none();
        let mut outcome = RunOutcome::default();

        let with_step = |step: SyncStep| move |error: IdpSyncError| StepFailure { error, step };

        self.sync_users(directory.id, &issuer, synced_at, adapter, &mut outcome, cancel)
            .await
            .map_err(with_step(SyncStep::StreamUsers))?;
        self.sync_groups(directory.id, synced_at, adapter, &mut outcome, cancel)
            .await
            .map_err(with_step(SyncStep::StreamGroups))?;
        self.sync_memberships(directory.id, &issuer, synced_at, adapter, &mut outcome, cancel)
            .await
            .map_err(with_step(SyncStep::StreamGroupMembers))?;

        if !first_sync {
            self.check_deletion_threshold(directory.id, synced_at)
                .await
                .map_err(with_step(SyncStep::CheckDeletionThreshold))?;
        }

        self.tombstone(directory.id, synced_at, &mut outcome)
            .await
            .map_err(with_step(SyncStep::ProcessUser))?;
        self.finalize_directory(directory.id, synced_at, directory.provider, first_sync)
            .await
            .map_err(with_step(SyncStep::ProcessUser))?;

        Ok(outcome)
    }

    /// Phase 6 (spec.md 4.4): clears every error field and, for Okta only,
    /// marks the directory verified on its first successful sync — every
    /// other provider's `is_verified` is set at operator-handshake time
    /// and must not be clobbered here.
    async fn finalize_directory(&self, directory_id: Uuid, synced_at: DateTime<Utc>, provider: crate::model::Provider, first_sync: bool) -> IdpSyncResult<()> {
        let mark_verified = provider == crate::model::Provider::Okta && first_sync;
        sqlx::query(
            "UPDATE directories SET
               synced_at = $2,
               error_message = NULL,
               errored_at = NULL,
               error_email_count = 0,
               is_disabled = false,
               disabled_reason = NULL,
               is_verified = CASE WHEN $3 THEN true ELSE is_verified END
             WHERE id = $1"
        )
        .bind(directory_id)
        .bind(synced_at)
        .bind(mark_verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_users(
        &self,
        directory_id: Uuid,
        issuer: &str,
        synced_at: DateTime<Utc>,
        adapter: &dyn ProviderAdapter,
        outcome: &mut RunOutcome,
        cancel: &tokio_util::sync::CancellationToken
    ) -> IdpSyncResult<()> {
        let account_id = self.account_id_for(directory_id).await?;
        let mut stream = adapter.stream_users();
        let mut batch = Vec::with_capacity(self.batch_size_identities);

        while let Some(record) = stream.next().await {
            let record = record?;
            if record.idp_id.is_empty() {
                return Err(IdpSyncError::ValidationError {
                    record_kind: "user".to_string(),
                    field: "idp_id".to_string()
                });
            }
            batch.push(normalize_user(record));

            if batch.len() >= self.batch_size_identities {
                self.upsert_user_batch(account_id, directory_id, issuer, synced_at, &batch, outcome).await?;
                batch.clear();
                if cancel.is_cancelled() {
                    return Err(IdpSyncError::Cancelled);
                }
            }
        }
        if !batch.is_empty() {
            self.upsert_user_batch(account_id, directory_id, issuer, synced_at, &batch, outcome).await?;
        }

        Ok(())
    }

    async fn upsert_user_batch(
        &self,
        account_id: Uuid,
        directory_id: Uuid,
        issuer: &str,
        synced_at: DateTime<Utc>,
        batch: &[NormalizedUser],
        outcome: &mut RunOutcome
    ) -> IdpSyncResult<()> {
        let mut tx = self.pool.begin().await?;

        let idp_ids: Vec<String> = batch.iter().map(|u| u.idp_id.clone()).collect();
        let existing: Vec<(String, Uuid)> = sqlx::query_as(
            "SELECT idp_id, actor_id FROM external_identities WHERE account_id = $1 AND issuer = $2 AND idp_id = ANY($3)"
        )
        .bind(account_id)
        .bind(issuer)
        .bind(&idp_ids)
        .fetch_all(&mut *tx)
        .await?;
        let mut actor_by_idp: HashMap<String, Uuid> = existing.into_iter().collect();

        let unmatched_emails: Vec<String> = batch
            .iter()
            .filter(|u| !actor_by_idp.contains_key(&u.idp_id))
            .filter_map(|u| u.email.clone())
            .collect();

        if !unmatched_emails.is_empty() {
            let rows: Vec<(String, Uuid)> = sqlx::query_as(
                "SELECT DISTINCT ON (lower(email)) lower(email), id FROM actors
                 WHERE account_id = $1 AND lower(email) = ANY($2)
                 ORDER BY lower(email), inserted_at ASC"
            )
            .bind(account_id)
            .bind(&unmatched_emails)
            .fetch_all(&mut *tx)
            .await?;
            let actor_by_email: HashMap<String, Uuid> = rows.into_iter().collect();

            for user in batch {
                if actor_by_idp.contains_key(&user.idp_id) {
                    continue;
                }
                if let Some(email) = &user.email {
                    if let Some(actor_id) = actor_by_email.get(email) {
                        actor_by_idp.insert(user.idp_id.clone(), *actor_id);
                    }
                }
            }
        }

        for user in batch {
            let actor_id = match actor_by_idp.get(&user.idp_id) {
                Some(id) => *id,
                None => {
                    let (new_id,): (Uuid,) = sqlx::query_as(
                        "INSERT INTO actors (id, account_id, actor_type, name, email, created_by_directory_id, inserted_at, updated_at)
                         VALUES (gen_random_uuid(), $1, 'user', $2, $3, $4, $5, $5)
                         RETURNING id"
                    )
                    .bind(account_id)
                    .bind(user.name.clone().or_else(|| user.email.clone()))
                    .bind(&user.email)
                    .bind(directory_id)
                    .bind(synced_at)
                    .fetch_one(&mut *tx)
                    .await?;
                    outcome.identities_created += 1;
                    actor_by_idp.insert(user.idp_id.clone(), new_id);
                    new_id
                }
            };

            let result = sqlx::query(
                "INSERT INTO external_identities
                   (id, account_id, actor_id, issuer, directory_id, idp_id, email, name, given_name, family_name, preferred_username, last_synced_at)
                 VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (account_id, issuer, idp_id) DO UPDATE SET
                   actor_id = EXCLUDED.actor_id,
                   directory_id = EXCLUDED.directory_id,
                   email = EXCLUDED.email,
                   name = EXCLUDED.name,
                   given_name = EXCLUDED.given_name,
                   family_name = EXCLUDED.family_name,
                   preferred_username = EXCLUDED.preferred_username,
                   last_synced_at = EXCLUDED.last_synced_at
                 WHERE external_identities.last_synced_at IS NULL
                    OR external_identities.last_synced_at <= EXCLUDED.last_synced_at"
            )
            .bind(account_id)
            .bind(actor_id)
            .bind(issuer)
            .bind(directory_id)
            .bind(&user.idp_id)
            .bind(&user.email)
            .bind(&user.name)
            .bind(&user.given_name)
            .bind(&user.family_name)
            .bind(&user.preferred_username)
            .bind(synced_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                outcome.identities_updated += 1;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn sync_groups(
        &self,
        directory_id: Uuid,
        synced_at: DateTime<Utc>,
        adapter: &dyn ProviderAdapter,
        outcome: &mut RunOutcome,
        cancel: &tokio_util::sync::CancellationToken
    ) -> IdpSyncResult<()> {
        let account_id = self.account_id_for(directory_id).await?;

        self.drain_group_stream(account_id, directory_id, synced_at, adapter.stream_groups(), EntityType::Group, outcome, cancel)
            .await?;
        self.drain_group_stream(
            account_id,
            directory_id,
            synced_at,
            adapter.stream_org_units(),
            EntityType::OrgUnit,
            outcome,
            cancel
        )
        .await
    }

    async fn drain_group_stream(
        &self,
        account_id: Uuid,
        directory_id: Uuid,
        synced_at: DateTime<Utc>,
        mut stream: futures_util::stream::BoxStream<'_, IdpSyncResult<GroupRecord>>,
        entity_type: EntityType,
        outcome: &mut RunOutcome,
        cancel: &tokio_util::sync::CancellationToken
    ) -> IdpSyncResult<()> {
        let mut batch = Vec::with_capacity(self.batch_size_identities);
        while let Some(record) = stream.next().await {
            batch.push(record?);
            if batch.len() >= self.batch_size_identities {
                self.upsert_group_batch(account_id, directory_id, synced_at, &batch, entity_type, outcome).await?;
                batch.clear();
                if cancel.is_cancelled() {
                    return Err(IdpSyncError::Cancelled);
                }
            }
        }
        if !batch.is_empty() {
            self.upsert_group_batch(account_id, directory_id, synced_at, &batch, entity_type, outcome).await?;
        }
        Ok(())
    }

    async fn upsert_group_batch(
        &self,
        account_id: Uuid,
        directory_id: Uuid,
        synced_at: DateTime<Utc>,
        batch: &[GroupRecord],
        entity_type: EntityType,
        outcome: &mut RunOutcome
    ) -> IdpSyncResult<()> {
        let entity_type_str = match entity_type {
            EntityType::Group => "group",
            EntityType::OrgUnit => "org_unit"
        };

        let mut tx = self.pool.begin().await?;
        for group in batch {
            let result = sqlx::query(
                "INSERT INTO groups (id, account_id, directory_id, idp_id, entity_type, name, kind, last_synced_at)
                 VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, 'static', $6)
                 ON CONFLICT (account_id, idp_id) DO UPDATE SET
                   name = EXCLUDED.name,
                   directory_id = EXCLUDED.directory_id,
                   last_synced_at = EXCLUDED.last_synced_at
                 WHERE groups.last_synced_at IS NULL OR groups.last_synced_at <= EXCLUDED.last_synced_at"
            )
            .bind(account_id)
            .bind(directory_id)
            .bind(&group.idp_id)
            .bind(entity_type_str)
            .bind(&group.name)
            .bind(synced_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                outcome.groups_upserted += 1;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn sync_memberships(
        &self,
        directory_id: Uuid,
        issuer: &str,
        synced_at: DateTime<Utc>,
        adapter: &dyn ProviderAdapter,
        outcome: &mut RunOutcome,
        cancel: &tokio_util::sync::CancellationToken
    ) -> IdpSyncResult<()> {
        let account_id = self.account_id_for(directory_id).await?;
        let group_idp_ids = self.synced_group_idp_ids(account_id, directory_id).await?;

        for chunk in group_idp_ids.chunks(self.groups_per_membership_chunk) {
            for group_idp_id in chunk {
                let mut members = adapter.stream_group_members(group_idp_id);
                let mut batch = Vec::with_capacity(self.batch_size_memberships);

                while let Some(member) = members.next().await {
                    batch.push(member?);
                    if batch.len() >= self.batch_size_memberships {
                        self.upsert_membership_batch(account_id, issuer, group_idp_id, synced_at, &batch, outcome).await?;
                        batch.clear();
                    }
                }
                if !batch.is_empty() {
                    self.upsert_membership_batch(account_id, issuer, group_idp_id, synced_at, &batch, outcome).await?;
                }
            }

            if cancel.is_cancelled() {
                return Err(IdpSyncError::Cancelled);
            }
        }

        Ok(())
    }

    async fn upsert_membership_batch(
        &self,
        account_id: Uuid,
        issuer: &str,
        group_idp_id: &str,
        synced_at: DateTime<Utc>,
        user_idp_ids: &[String],
        outcome: &mut RunOutcome
    ) -> IdpSyncResult<()> {
        let result = sqlx::query(
            "INSERT INTO memberships (account_id, actor_id, group_id, last_synced_at)
             SELECT $1, ei.actor_id, g.id, $2
             FROM UNNEST($3::text[]) AS member(user_idp_id)
             JOIN external_identities ei ON ei.account_id = $1 AND ei.issuer = $4 AND ei.idp_id = member.user_idp_id
             JOIN groups g ON g.account_id = $1 AND g.idp_id = $5
             ON CONFLICT (actor_id, group_id) DO UPDATE SET
               last_synced_at = GREATEST(memberships.last_synced_at, EXCLUDED.last_synced_at)"
        )
        .bind(account_id)
        .bind(synced_at)
        .bind(user_idp_ids)
        .bind(issuer)
        .bind(group_idp_id)
        .execute(&self.pool)
        .await?;

        outcome.memberships_upserted += result.rows_affected();
        Ok(())
    }

    async fn check_deletion_threshold(&self, directory_id: Uuid, synced_at: DateTime<Utc>) -> IdpSyncResult<()> {
        self.check_resource_threshold(directory_id, synced_at, "external_identities", "identities").await?;
        self.check_resource_threshold(directory_id, synced_at, "groups", "groups").await
    }

    async fn check_resource_threshold(&self, directory_id: Uuid, synced_at: DateTime<Utc>, table: &str, resource_label: &str) -> IdpSyncResult<()> {
        let query = format!(
            "SELECT
               COUNT(*) AS total,
               COUNT(*) FILTER (WHERE last_synced_at IS NULL OR last_synced_at < $2) AS to_delete
             FROM {table}
             WHERE directory_id = $1"
        );
        let (total, to_delete): (i64, i64) = sqlx::query_as(&query).bind(directory_id).bind(synced_at).fetch_one(&self.pool).await?;

        let total = total.max(0) as u64;
        let to_delete = to_delete.max(0) as u64;

        if circuit_breaker_trips(total, to_delete, self.deletion_threshold_min_rows, self.deletion_threshold_ratio) {
            return Err(IdpSyncError::DeletionThresholdExceeded {
                resource: resource_label.to_string(),
                total,
                to_delete,
                threshold_pct: (self.deletion_threshold_ratio * 100.0) as u8
            });
        }

        Ok(())
    }

    async fn tombstone(&self, directory_id: Uuid, synced_at: DateTime<Utc>, outcome: &mut RunOutcome) -> IdpSyncResult<()> {
        let groups_deleted = sqlx::query(
            "DELETE FROM groups WHERE directory_id = $1 AND (last_synced_at IS NULL OR last_synced_at < $2)"
        )
        .bind(directory_id)
        .bind(synced_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        outcome.groups_deleted += groups_deleted;

        let identities_deleted = sqlx::query(
            "DELETE FROM external_identities WHERE directory_id = $1 AND (last_synced_at IS NULL OR last_synced_at < $2)"
        )
        .bind(directory_id)
        .bind(synced_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        outcome.identities_deleted += identities_deleted;

        let memberships_deleted = sqlx::query(
            "DELETE FROM memberships m
             USING groups g
             WHERE m.group_id = g.id AND g.directory_id = $1
               AND (m.last_synced_at IS NULL OR m.last_synced_at < $2)"
        )
        .bind(directory_id)
        .bind(synced_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        outcome.memberships_deleted += memberships_deleted;

        let actors_deleted = sqlx::query(
            "DELETE FROM actors a
             WHERE a.created_by_directory_id = $1
               AND NOT EXISTS (SELECT 1 FROM external_identities ei WHERE ei.actor_id = a.id)"
        )
        .bind(directory_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        outcome.actors_deleted += actors_deleted;

        metrics::counter!("idp_sync_groups_deleted_total", groups_deleted);
        metrics::counter!("idp_sync_identities_deleted_total", identities_deleted);
        metrics::counter!("idp_sync_memberships_deleted_total", memberships_deleted);
        metrics::counter!("idp_sync_actors_deleted_total", actors_deleted);

        Ok(())
    }

    async fn account_id_for(&self, directory_id: Uuid) -> IdpSyncResult<Uuid> {
        let (account_id,): (Uuid,) = sqlx::query_as("SELECT account_id FROM directories WHERE id = $1")
            .bind(directory_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(account_id)
    }

    async fn synced_group_idp_ids(&self, account_id: Uuid, directory_id: Uuid) -> IdpSyncResult<Vec<String>> {
        let rows: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT idp_id FROM groups WHERE account_id = $1 AND directory_id = $2 AND idp_id IS NOT NULL")
                .bind(account_id)
                .bind(directory_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().filter_map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_requires_both_minimum_rows_and_ratio() {
        assert!(circuit_breaker_trips(100, 95, 10, 0.90));
        assert!(!circuit_breaker_trips(100, 89, 10, 0.90));
        assert!(!circuit_breaker_trips(5, 5, 10, 0.90));
    }

    #[test]
    fn circuit_breaker_skipped_below_minimum_rows_even_at_100_percent() {
        assert!(!circuit_breaker_trips(9, 9, 10, 0.90));
    }

    #[test]
    fn normalize_user_lowercases_and_trims_email() {
        let record = UserRecord {
            idp_id: "u1".to_string(),
            email: Some("  Alice@Example.COM ".to_string()),
            name: Some("Alice".to_string()),
            given_name: None,
            family_name: None,
            preferred_username: None
        };
        let normalized = normalize_user(record);
        assert_eq!(normalized.email.as_deref(), Some("alice@example.com"));
    }
}
