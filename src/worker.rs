//! Worker / Job Runtime (spec.md 4.7): executes one sync job end to end,
//! bounds how many run concurrently, and feeds the outcome to the
//! Directory State Machine and Error Classifier.
//!
//! Shaped like `idp-sync/src/sync.rs`'s `IdpSyncService` (a struct
//! wrapping a pool plus a provider client, with one public entry point
//! and the rest private helpers), generalized to dispatch across the
//! three provider adapters and to persist classified failures instead
//! of only logging them.

use crate::error::IdpSyncResult;
use crate::model::{Directory, DirectoryConfig};
use crate::providers::entra::EntraAdapter;
use crate::providers::google::GoogleAdapter;
use crate::providers::okta::OktaAdapter;
use crate::providers::ProviderAdapter;
use crate::reconcile::ReconciliationEngine;
use crate::state::DirectoryLifecycle;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Worker {
    pool: PgPool,
    engine: Arc<ReconciliationEngine>,
    http_timeout: Duration,
    http_max_concurrent_per_host: usize,
    transient_to_fatal_after: chrono::Duration
}

impl Worker {
    pub fn new(
        pool: PgPool,
        engine: Arc<ReconciliationEngine>,
        http_timeout: Duration,
        http_max_concurrent_per_host: usize,
        transient_to_fatal_after_hours: i64
    ) -> Self {
        Self {
            pool,
            engine,
            http_timeout,
            http_max_concurrent_per_host,
            transient_to_fatal_after: chrono::Duration::hours(transient_to_fatal_after_hours)
        }
    }

    /// One job's worth of work: re-checks eligibility, runs the
    /// reconciliation engine, and persists the terminal state. Never
    /// returns `Err` for a business failure — those are absorbed into
    /// the directory's persisted state, per spec.md 4.7 ("refuse if not
    /// eligible... do not retry").
    #[tracing::instrument(skip(self, cancel), fields(directory_id = %directory_id))]
    pub async fn run_job(&self, directory_id: Uuid, cancel: CancellationToken) -> IdpSyncResult<()> {
        let Some(directory) = self.fetch_eligible_directory(directory_id).await? else {
            info!(directory_id = %directory_id, "directory no longer eligible, skipping");
            return Ok(());
        };

        let adapter = self.build_adapter(&directory)?;

        match self.engine.run(&directory, adapter.as_ref(), &cancel).await {
            Ok(outcome) => {
                info!(
                    directory_id = %directory.id,
                    identities_created = outcome.identities_created,
                    identities_updated = outcome.identities_updated,
                    groups_upserted = outcome.groups_upserted,
                    memberships_upserted = outcome.memberships_upserted,
                    "sync run committed"
                );
                Ok(())
            }
            Err(failure) => {
                let classification = failure.error.classify(directory.id, failure.step);
                warn!(directory_id = %directory.id, kind = ?classification.kind, step = failure.step.as_str(), message = %classification.message, "sync run failed");
                self.persist_failure(directory.id, &classification, directory.errored_at).await?;
                Ok(())
            }
        }
    }

    async fn fetch_eligible_directory(&self, directory_id: Uuid) -> IdpSyncResult<Option<Directory>> {
        let row: Option<EligibilityRow> = sqlx::query_as(
            "SELECT d.is_disabled, a.disabled_at IS NOT NULL AS account_disabled,
                    COALESCE((a.features->>'idp_sync')::boolean, false) AS idp_sync_enabled
             FROM directories d
             JOIN accounts a ON a.id = d.account_id
             WHERE d.id = $1"
        )
        .bind(directory_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        if row.is_disabled || row.account_disabled || !row.idp_sync_enabled {
            return Ok(None);
        }

        self.load_directory(directory_id).await.map(Some)
    }

    async fn load_directory(&self, directory_id: Uuid) -> IdpSyncResult<Directory> {
        // The production schema splits provider configuration across
        // per-provider tables joined to a common `directories` row; this
        // loader is the seam where that join would live. Left as a
        // placeholder call site since the join shape is config-layer
        // concern, not a reconciliation-engine one.
        crate::directory_store::load_directory(&self.pool, directory_id).await
    }

    fn build_adapter(&self, directory: &Directory) -> IdpSyncResult<Box<dyn ProviderAdapter>> {
        match &directory.config {
            DirectoryConfig::Google(cfg) => Ok(Box::new(GoogleAdapter::new(cfg.clone(), self.http_timeout, self.http_max_concurrent_per_host)?)),
            DirectoryConfig::Entra(cfg) => Ok(Box::new(EntraAdapter::new(cfg.clone(), self.http_timeout, self.http_max_concurrent_per_host)?)),
            DirectoryConfig::Okta(cfg) => Ok(Box::new(OktaAdapter::new(cfg.clone(), self.http_timeout, self.http_max_concurrent_per_host)?))
        }
    }

    async fn persist_failure(&self, directory_id: Uuid, classification: &crate::error::Classification, errored_at: Option<chrono::DateTime<Utc>>) -> IdpSyncResult<()> {
        let mut lifecycle = DirectoryLifecycle::fresh();
        lifecycle.errored_at = errored_at;
        let now = Utc::now();
        lifecycle.on_error(classification, now, self.transient_to_fatal_after);

        sqlx::query(
            "UPDATE directories SET
               error_message = $2,
               errored_at = $3,
               error_email_count = error_email_count + 1,
               is_disabled = $4,
               disabled_reason = $5,
               is_verified = CASE WHEN $4 THEN false ELSE is_verified END
             WHERE id = $1"
        )
        .bind(directory_id)
        .bind(&lifecycle.error_message)
        .bind(lifecycle.errored_at)
        .bind(lifecycle.is_disabled)
        .bind(&lifecycle.disabled_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct EligibilityRow {
    is_disabled: bool,
    account_disabled: bool,
    idp_sync_enabled: bool
}

/// Bounded-concurrency pool (spec.md 5): at most `workers_concurrency`
/// jobs execute at once; distinct directories run fully in parallel,
/// the scheduler's per-directory lock keeps the same directory
/// single-flight.
pub struct WorkerPool {
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>
}

impl WorkerPool {
    pub fn new(worker: Worker, concurrency: usize) -> Self {
        Self {
            worker: Arc::new(worker),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1)))
        }
    }

    /// Spawns the job on the Tokio runtime and returns immediately;
    /// callers that need completion should `.await` the returned handle.
    pub fn spawn(&self, directory_id: Uuid, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let worker = self.worker.clone();
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return
            };

            if let Err(err) = worker.run_job(directory_id, cancel).await {
                warn!(directory_id = %directory_id, error = %err, "job runtime returned an unclassified error");
            }
        })
    }
}
