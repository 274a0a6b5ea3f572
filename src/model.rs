//! Semantic entity types for the directory sync schema (spec.md section 3).
//!
//! These mirror database rows but are not themselves `sqlx::FromRow` —
//! each component that reads/writes them projects only the columns it
//! needs, the same way `idp-sync/src/sync.rs`'s `ExistingUser` projects a
//! narrow view of the `users` table rather than a full-row struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Entra,
    Okta
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Entra => "entra",
            Provider::Okta => "okta"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Admin,
    Service
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Group,
    OrgUnit
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Static,
    Dynamic
}

/// Tenant boundary. Directory sync only runs when
/// `features["idp_sync"]` is truthy and `disabled_at` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub disabled_at: Option<DateTime<Utc>>,
    pub features: HashMap<String, bool>
}

impl Account {
    pub fn idp_sync_eligible(&self) -> bool {
        self.disabled_at.is_none() && self.features.get("idp_sync").copied().unwrap_or(false)
    }
}

/// A per-account binding to one IdP tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    pub id: Uuid,
    pub account_id: Uuid,
    pub provider: Provider,
    pub config: DirectoryConfig,
    pub synced_at: Option<DateTime<Utc>>,
    pub errored_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub is_disabled: bool,
    pub disabled_reason: Option<String>,
    pub is_verified: bool,
    pub error_email_count: u32
}

impl Directory {
    pub fn issuer(&self) -> String {
        match &self.config {
            DirectoryConfig::Google(_) => "https://accounts.google.com".to_string(),
            DirectoryConfig::Entra(cfg) => {
                format!("https://login.microsoftonline.com/{}/v2.0", cfg.tenant_id)
            }
            DirectoryConfig::Okta(cfg) => format!("https://{}", cfg.domain)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum DirectoryConfig {
    Google(GoogleDirectoryConfig),
    Entra(EntraDirectoryConfig),
    Okta(OktaDirectoryConfig)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleDirectoryConfig {
    pub service_account_email: String,
    pub service_account_key_pem: String,
    pub impersonation_email: String,
    pub primary_domain: String,
    pub token_endpoint: String
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntraDirectoryConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub sync_all_groups: bool
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OktaDirectoryConfig {
    pub domain: String,
    pub client_id: String,
    pub private_jwk_pem: String,
    pub key_id: String
}

/// A person or service principal local to the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub account_id: Uuid,
    pub actor_type: ActorType,
    pub name: String,
    pub email: Option<String>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_by_directory_id: Option<Uuid>,
    pub inserted_at: DateTime<Utc>
}

/// A verified claim from one IdP that `idp_id` belongs to `actor_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub id: Uuid,
    pub account_id: Uuid,
    pub actor_id: Uuid,
    pub issuer: String,
    pub directory_id: Option<Uuid>,
    pub idp_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub preferred_username: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>
}

/// A grouping local to the account (IdP group or Google org unit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub account_id: Uuid,
    pub directory_id: Option<Uuid>,
    pub idp_id: Option<String>,
    pub entity_type: EntityType,
    pub name: String,
    pub kind: GroupKind,
    pub last_synced_at: Option<DateTime<Utc>>
}

/// `(actor_id, group_id)` with uniqueness on the pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub account_id: Uuid,
    pub actor_id: Uuid,
    pub group_id: Uuid,
    pub last_synced_at: Option<DateTime<Utc>>
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_requires_feature_flag_and_no_disable() {
        let mut features = HashMap::new();
        features.insert("idp_sync".to_string(), true);
        let account = Account {
            id: Uuid::new_v4(),
            disabled_at: None,
            features: features.clone()
        };
        assert!(account.idp_sync_eligible());

        let disabled = Account {
            id: Uuid::new_v4(),
            disabled_at: Some(Utc::now()),
            features
        };
        assert!(!disabled.idp_sync_eligible());
    }

    #[test]
    fn account_without_feature_flag_is_not_eligible() {
        let account = Account {
            id: Uuid::new_v4(),
            disabled_at: None,
            features: HashMap::new()
        };
        assert!(!account.idp_sync_eligible());
    }

    #[test]
    fn issuer_shapes_match_spec() {
        let base = Directory {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            provider: Provider::Entra,
            config: DirectoryConfig::Entra(EntraDirectoryConfig {
                tenant_id: "tenant-123".to_string(),
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                sync_all_groups: false
            }),
            synced_at: None,
            errored_at: None,
            error_message: None,
            is_disabled: false,
            disabled_reason: None,
            is_verified: false,
            error_email_count: 0
        };
        assert_eq!(
            base.issuer(),
            "https://login.microsoftonline.com/tenant-123/v2.0"
        );
    }
}
