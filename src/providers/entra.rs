//! Microsoft Entra ID adapter (spec.md 4.3): Graph API, client-credentials
//! auth, `@odata.nextLink` pagination, `$select` field reduction.

use crate::error::{IdpSyncError, IdpSyncResult};
use crate::http;
use crate::model::EntraDirectoryConfig;
use crate::providers::{GroupRecord, ProviderAdapter, UserRecord};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const MAX_RETRIES: u32 = 3;
const PAGE_SIZE: &str = "999";

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>
}

pub struct EntraAdapter {
    client: Client,
    config: EntraDirectoryConfig,
    token: RwLock<Option<CachedToken>>,
    /// Bounds concurrent in-flight requests to `graph.microsoft.com`
    /// (spec.md 5, `http_max_concurrent_per_host`).
    host_limiter: Arc<Semaphore>
}

impl EntraAdapter {
    pub fn new(config: EntraDirectoryConfig, per_request_timeout: std::time::Duration, max_concurrent_per_host: usize) -> IdpSyncResult<Self> {
        let client = Client::builder()
            .timeout(per_request_timeout)
            .build()
            .map_err(IdpSyncError::from)?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
            host_limiter: Arc::new(Semaphore::new(max_concurrent_per_host.max(1)))
        })
    }

    fn token_endpoint(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.config.tenant_id
        )
    }

    async fn fetch_access_token(&self) -> IdpSyncResult<String> {
        {
            let cached = self.token.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.expires_at > Utc::now() + chrono::Duration::minutes(2) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let token_endpoint = self.token_endpoint();
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", "https://graph.microsoft.com/.default")
        ];

        let response = {
            let _permit = self.host_limiter.acquire().await;
            http::post_form(&self.client, &token_endpoint, &form, vec![]).await?
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &token_endpoint, &body));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64
        }
        let token: TokenResponse = response.json().await?;

        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in)
        });

        Ok(token.access_token)
    }

    async fn get_page<T: for<'de> Deserialize<'de>>(&self, url: &str, query: &[(&str, &str)]) -> IdpSyncResult<GraphPage<T>> {
        let token = self.fetch_access_token().await?;
        let response = {
            let _permit = self.host_limiter.acquire().await;
            http::get_with_retry(
                &self.client,
                url,
                query,
                || Ok(vec![("authorization".to_string(), format!("Bearer {token}"))]),
                MAX_RETRIES
            )
            .await?
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, url, &body));
        }

        Ok(response.json::<GraphPage<T>>().await?)
    }

    /// Resolves this directory's app registration to its service
    /// principal object id, needed to list the groups assigned to it
    /// (spec.md 4.3's "only groups the app is assigned" toggle).
    async fn service_principal_id(&self) -> IdpSyncResult<String> {
        let url = format!("{GRAPH_BASE_URL}/servicePrincipals");
        let filter = format!("appId eq '{}'", self.config.client_id);
        let page: GraphPage<GraphServicePrincipal> = self.get_page(&url, &[("$filter", filter.as_str()), ("$select", "id")]).await?;
        page.value.into_iter().next().map(|sp| sp.id).ok_or_else(|| {
            IdpSyncError::ConfigError(format!(
                "no service principal found for application client id {}",
                self.config.client_id
            ))
        })
    }
}

#[async_trait]
impl ProviderAdapter for EntraAdapter {
    fn issuer(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/v2.0",
            self.config.tenant_id
        )
    }

    async fn access_token(&self) -> IdpSyncResult<String> {
        self.fetch_access_token().await
    }

    async fn verify(&self) -> IdpSyncResult<()> {
        let url = format!("{GRAPH_BASE_URL}/users");
        self.get_page::<GraphUser>(&url, &[("$top", "1")]).await?;
        Ok(())
    }

    fn stream_users<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<UserRecord>> {
        Box::pin(try_stream! {
            let mut url = format!("{GRAPH_BASE_URL}/users");
            let mut first = true;

            loop {
                let query: &[(&str, &str)] = if first {
                    &[
                        ("$select", "id,displayName,givenName,surname,userPrincipalName,mail"),
                        ("$top", PAGE_SIZE)
                    ]
                } else {
                    &[]
                };

                let page: GraphPage<GraphUser> = self.get_page(&url, query).await?;

                for user in page.value {
                    let Some(mail) = user.mail.clone().or(user.user_principal_name.clone()) else {
                        Err(IdpSyncError::ValidationError { record_kind: "entra user".to_string(), field: "mail".to_string() })?;
                        continue;
                    };

                    yield UserRecord {
                        idp_id: user.id,
                        email: Some(mail),
                        name: user.display_name,
                        given_name: user.given_name,
                        family_name: user.surname,
                        preferred_username: user.user_principal_name
                    };
                }

                match page.next_link {
                    Some(next) => url = next,
                    None => break
                }
                first = false;
            }
        })
    }

    fn stream_groups<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>> {
        Box::pin(try_stream! {
            if self.config.sync_all_groups {
                let mut url = format!("{GRAPH_BASE_URL}/groups");
                let mut first = true;

                loop {
                    let query: &[(&str, &str)] = if first {
                        &[("$select", "id,displayName"), ("$top", PAGE_SIZE)]
                    } else {
                        &[]
                    };
                    let page: GraphPage<GraphGroup> = self.get_page(&url, query).await?;

                    for group in page.value {
                        let Some(name) = group.display_name else {
                            Err(IdpSyncError::ValidationError { record_kind: "entra group".to_string(), field: "displayName".to_string() })?;
                            continue;
                        };
                        yield GroupRecord { idp_id: group.id, name };
                    }

                    match page.next_link {
                        Some(next) => url = next,
                        None => break
                    }
                    first = false;
                }
            } else {
                // "only groups the app is assigned" (spec.md 4.3): walk the
                // app's service principal's app role assignments rather than
                // filtering the tenant-wide group list.
                let sp_id = self.service_principal_id().await?;
                let mut url = format!("{GRAPH_BASE_URL}/servicePrincipals/{sp_id}/appRoleAssignedTo");
                let mut first = true;

                loop {
                    let query: &[(&str, &str)] = if first {
                        &[("$select", "principalId,principalType,principalDisplayName"), ("$top", PAGE_SIZE)]
                    } else {
                        &[]
                    };
                    let page: GraphPage<GraphAppRoleAssignment> = self.get_page(&url, query).await?;

                    for assignment in page.value {
                        if assignment.principal_type.as_deref() != Some("Group") {
                            continue;
                        }
                        let Some(name) = assignment.principal_display_name else {
                            Err(IdpSyncError::ValidationError { record_kind: "entra app role assignment".to_string(), field: "principalDisplayName".to_string() })?;
                            continue;
                        };
                        yield GroupRecord { idp_id: assignment.principal_id, name };
                    }

                    match page.next_link {
                        Some(next) => url = next,
                        None => break
                    }
                    first = false;
                }
            }
        })
    }

    fn stream_group_members<'a>(&'a self, group_idp_id: &'a str) -> BoxStream<'a, IdpSyncResult<String>> {
        Box::pin(try_stream! {
            let mut url = format!("{GRAPH_BASE_URL}/groups/{group_idp_id}/members");
            let mut first = true;

            loop {
                let query: &[(&str, &str)] = if first {
                    &[("$select", "id,accountEnabled"), ("$top", PAGE_SIZE)]
                } else {
                    &[]
                };

                let page: GraphPage<GraphMember> = self.get_page(&url, query).await?;

                for member in page.value {
                    let is_user = member.odata_type.as_deref() == Some("#microsoft.graph.user");
                    let enabled = member.account_enabled.unwrap_or(true);
                    if is_user && enabled {
                        yield member.id;
                    }
                }

                match page.next_link {
                    Some(next) => url = next,
                    None => break
                }
                first = false;
            }
        })
    }

    fn stream_org_units<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>> {
        Box::pin(futures_util::stream::empty())
    }
}

fn classify_http_error(status: reqwest::StatusCode, path: &str, body: &str) -> IdpSyncError {
    if status.as_u16() == 403 {
        return IdpSyncError::ScopeError {
            message: body.to_string()
        };
    }
    if status.is_client_error() {
        IdpSyncError::HttpClientError {
            status: status.as_u16(),
            path: path.to_string(),
            message: body.to_string()
        }
    } else {
        IdpSyncError::HttpServerError {
            status: status.as_u16(),
            path: path.to_string(),
            message: body.to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>
}

#[derive(Debug, Deserialize)]
struct GraphUser {
    id: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "givenName")]
    given_name: Option<String>,
    surname: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
    mail: Option<String>
}

#[derive(Debug, Deserialize)]
struct GraphGroup {
    id: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>
}

#[derive(Debug, Deserialize)]
struct GraphMember {
    id: String,
    #[serde(rename = "@odata.type")]
    odata_type: Option<String>,
    #[serde(rename = "accountEnabled")]
    account_enabled: Option<bool>
}

#[derive(Debug, Deserialize)]
struct GraphServicePrincipal {
    id: String
}

#[derive(Debug, Deserialize)]
struct GraphAppRoleAssignment {
    #[serde(rename = "principalId")]
    principal_id: String,
    #[serde(rename = "principalType")]
    principal_type: Option<String>,
    #[serde(rename = "principalDisplayName")]
    principal_display_name: Option<String>
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_page_deserializes_next_link() {
        let page: GraphPage<GraphUser> = serde_json::from_value(serde_json::json!({
            "value": [{"id": "u1", "mail": "a@example.com"}],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/users?$skiptoken=abc"
        }))
        .unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.next_link.is_some());
    }

    #[test]
    fn group_member_filters_non_user_types() {
        let member: GraphMember = serde_json::from_value(serde_json::json!({
            "id": "g1",
            "@odata.type": "#microsoft.graph.group"
        }))
        .unwrap();
        assert_ne!(member.odata_type.as_deref(), Some("#microsoft.graph.user"));
    }

    #[test]
    fn app_role_assignment_deserializes_and_filters_non_group_principals() {
        let page: GraphPage<GraphAppRoleAssignment> = serde_json::from_value(serde_json::json!({
            "value": [
                {"principalId": "g1", "principalType": "Group", "principalDisplayName": "Eng"},
                {"principalId": "u1", "principalType": "User", "principalDisplayName": "Ada"}
            ]
        }))
        .unwrap();
        let groups: Vec<_> = page.value.into_iter().filter(|a| a.principal_type.as_deref() == Some("Group")).collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].principal_id, "g1");
    }
}
