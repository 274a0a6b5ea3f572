//! Provider Adapters (spec.md 4.3): translate each IdP's REST pagination
//! and record shapes into the uniform lazy sequences the Reconciliation
//! Engine consumes. Variants share nothing beyond the `ProviderAdapter`
//! trait surface (Design Notes, "Polymorphism across providers").

pub mod entra;
pub mod google;
pub mod okta;

use crate::error::IdpSyncResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// A user record as read off the wire, before reconciliation. Field
/// names match spec.md 4.3's `stream_users` record shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub idp_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub preferred_username: Option<String>
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub idp_id: String,
    pub name: String
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The issuer URL that names this directory's tenant in the identity
    /// namespace (spec.md 3).
    fn issuer(&self) -> String;

    /// Obtains (and, where relevant, caches) an access token.
    async fn access_token(&self) -> IdpSyncResult<String>;

    /// Probes a minimal request against each scope this adapter requires
    /// (spec.md 4.3).
    async fn verify(&self) -> IdpSyncResult<()>;

    fn stream_users<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<UserRecord>>;

    fn stream_groups<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>>;

    /// USER-type members only; nested groups and external members are
    /// filtered out by the adapter before they reach this sequence
    /// (spec.md 4.3).
    fn stream_group_members<'a>(&'a self, group_idp_id: &'a str) -> BoxStream<'a, IdpSyncResult<String>>;

    /// Google only; returns an empty sequence for Entra and Okta.
    fn stream_org_units<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>>;
}
