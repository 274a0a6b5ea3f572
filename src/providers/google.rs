//! Google Workspace adapter (spec.md 4.3): JWT-bearer service-account
//! auth, `nextPageToken` pagination, `admin.googleapis.com`.

use crate::error::{IdpSyncError, IdpSyncResult};
use crate::http;
use crate::model::GoogleDirectoryConfig;
use crate::providers::{GroupRecord, ProviderAdapter, UserRecord};
use crate::signer;
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

const BASE_URL: &str = "https://admin.googleapis.com";
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/admin.directory.customer.readonly",
    "https://www.googleapis.com/auth/admin.directory.orgunit.readonly",
    "https://www.googleapis.com/auth/admin.directory.group.readonly",
    "https://www.googleapis.com/auth/admin.directory.user.readonly"
];
const USER_PAGE_SIZE: u32 = 500;
const GROUP_PAGE_SIZE: u32 = 200;
const MAX_RETRIES: u32 = 3;

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>
}

pub struct GoogleAdapter {
    client: Client,
    config: GoogleDirectoryConfig,
    token: RwLock<Option<CachedToken>>,
    /// Bounds concurrent in-flight requests to `admin.googleapis.com`
    /// (spec.md 5, `http_max_concurrent_per_host`).
    host_limiter: Arc<Semaphore>,
    base_url: String
}

impl GoogleAdapter {
    pub fn new(config: GoogleDirectoryConfig, per_request_timeout: std::time::Duration, max_concurrent_per_host: usize) -> IdpSyncResult<Self> {
        let client = Client::builder()
            .timeout(per_request_timeout)
            .build()
            .map_err(IdpSyncError::from)?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
            host_limiter: Arc::new(Semaphore::new(max_concurrent_per_host.max(1))),
            base_url: BASE_URL.to_string()
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
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

        let assertion = signer::google_service_account_assertion(
            &self.config.service_account_email,
            &self.config.impersonation_email,
            SCOPES,
            &self.config.token_endpoint,
            &self.config.service_account_key_pem
        )?;

        let form = [
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:jwt-bearer"
            ),
            ("assertion", assertion.as_str())
        ];

        let response = {
            let _permit = self.host_limiter.acquire().await;
            http::post_form(&self.client, &self.config.token_endpoint, &form, vec![]).await?
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &self.config.token_endpoint, &body));
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

    async fn get_page<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        mut query: Vec<(&str, &str)>,
        page_token: Option<&str>
    ) -> IdpSyncResult<T> {
        let token = self.fetch_access_token().await?;
        let url = format!("{}{path}", self.base_url);
        if let Some(pt) = page_token {
            query.push(("pageToken", pt));
        }

        let response = {
            let _permit = self.host_limiter.acquire().await;
            http::get_with_retry(
                &self.client,
                &url,
                &query,
                || Ok(vec![("authorization".to_string(), format!("Bearer {token}"))]),
                MAX_RETRIES
            )
            .await?
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &url, &body));
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn issuer(&self) -> String {
        "https://accounts.google.com".to_string()
    }

    async fn access_token(&self) -> IdpSyncResult<String> {
        self.fetch_access_token().await
    }

    async fn verify(&self) -> IdpSyncResult<()> {
        self.get_page::<GoogleUserListResponse>(
            "/admin/directory/v1/users",
            vec![
                ("customer", "my_customer"),
                ("maxResults", "1"),
                ("projection", "full")
            ],
            None
        )
        .await?;
        Ok(())
    }

    fn stream_users<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<UserRecord>> {
        Box::pin(try_stream! {
            let domain = self.config.primary_domain.clone();
            let max_results = USER_PAGE_SIZE.to_string();
            let mut page_token: Option<String> = None;

            loop {
                let page: GoogleUserListResponse = self
                    .get_page(
                        "/admin/directory/v1/users",
                        vec![
                            ("customer", "my_customer"),
                            ("domain", domain.as_str()),
                            ("maxResults", max_results.as_str()),
                            ("projection", "full")
                        ],
                        page_token.as_deref()
                    )
                    .await?;

                for user in page.users.unwrap_or_default() {
                    let Some(id) = user.id else {
                        Err(IdpSyncError::ValidationError { record_kind: "google user".to_string(), field: "id".to_string() })?;
                        continue;
                    };
                    let Some(primary_email) = user.primary_email else {
                        Err(IdpSyncError::ValidationError { record_kind: "google user".to_string(), field: "primaryEmail".to_string() })?;
                        continue;
                    };

                    yield UserRecord {
                        idp_id: id,
                        email: Some(primary_email),
                        name: user.name.as_ref().and_then(|n| n.full_name.clone()),
                        given_name: user.name.as_ref().and_then(|n| n.given_name.clone()),
                        family_name: user.name.as_ref().and_then(|n| n.family_name.clone()),
                        preferred_username: None
                    };
                }

                page_token = page.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
        })
    }

    fn stream_groups<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>> {
        Box::pin(try_stream! {
            let max_results = GROUP_PAGE_SIZE.to_string();
            let mut page_token: Option<String> = None;

            loop {
                let page: GoogleGroupListResponse = self
                    .get_page(
                        "/admin/directory/v1/groups",
                        vec![("customer", "my_customer"), ("maxResults", max_results.as_str())],
                        page_token.as_deref()
                    )
                    .await?;

                for group in page.groups.unwrap_or_default() {
                    let Some(id) = group.id else {
                        Err(IdpSyncError::ValidationError { record_kind: "google group".to_string(), field: "id".to_string() })?;
                        continue;
                    };
                    let name = group.name.clone().or(group.email.clone());
                    let Some(name) = name else {
                        Err(IdpSyncError::ValidationError { record_kind: "google group".to_string(), field: "name".to_string() })?;
                        continue;
                    };

                    yield GroupRecord { idp_id: id, name };
                }

                page_token = page.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
        })
    }

    fn stream_group_members<'a>(&'a self, group_idp_id: &'a str) -> BoxStream<'a, IdpSyncResult<String>> {
        Box::pin(try_stream! {
            let mut page_token: Option<String> = None;
            let path = format!("/admin/directory/v1/groups/{group_idp_id}/members");

            loop {
                let page: GoogleMemberListResponse = self
                    .get_page(
                        &path,
                        vec![("maxResults", "200"), ("includeDerivedMembership", "true")],
                        page_token.as_deref()
                    )
                    .await?;

                for member in page.members.unwrap_or_default() {
                    if member.member_type.as_deref() == Some("USER") {
                        if let Some(id) = member.id {
                            yield id;
                        }
                    }
                }

                page_token = page.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
        })
    }

    fn stream_org_units<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>> {
        Box::pin(try_stream! {
            let path = "/admin/directory/v1/customer/my_customer/orgunits".to_string();
            let page: GoogleOrgUnitListResponse = self.get_page(&path, vec![("type", "all")], None).await?;

            for ou in page.organization_units.unwrap_or_default() {
                yield GroupRecord { idp_id: ou.org_unit_id, name: ou.name };
            }
        })
    }
}

fn classify_http_error(status: reqwest::StatusCode, path: &str, body: &str) -> IdpSyncError {
    if status.as_u16() == 403 && body.to_lowercase().contains("insufficient") {
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
struct GoogleUserListResponse {
    users: Option<Vec<GoogleUser>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    id: Option<String>,
    #[serde(rename = "primaryEmail")]
    primary_email: Option<String>,
    name: Option<GoogleUserName>
}

#[derive(Debug, Deserialize)]
struct GoogleUserName {
    #[serde(rename = "fullName")]
    full_name: Option<String>,
    #[serde(rename = "givenName")]
    given_name: Option<String>,
    #[serde(rename = "familyName")]
    family_name: Option<String>
}

#[derive(Debug, Deserialize)]
struct GoogleGroupListResponse {
    groups: Option<Vec<GoogleGroup>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>
}

#[derive(Debug, Deserialize)]
struct GoogleGroup {
    id: Option<String>,
    name: Option<String>,
    email: Option<String>
}

#[derive(Debug, Deserialize)]
struct GoogleMemberListResponse {
    members: Option<Vec<GoogleMember>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>
}

#[derive(Debug, Deserialize)]
struct GoogleMember {
    id: Option<String>,
    #[serde(rename = "type")]
    member_type: Option<String>
}

#[derive(Debug, Deserialize)]
struct GoogleOrgUnitListResponse {
    #[serde(rename = "organizationUnits")]
    organization_units: Option<Vec<GoogleOrgUnit>>
}

#[derive(Debug, Deserialize)]
struct GoogleOrgUnit {
    #[serde(rename = "orgUnitId")]
    org_unit_id: String,
    name: String
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(token_endpoint: String) -> GoogleDirectoryConfig {
        GoogleDirectoryConfig {
            service_account_email: "svc@project.iam.gserviceaccount.com".to_string(),
            service_account_key_pem: test_rsa_pem(),
            impersonation_email: "admin@example.com".to_string(),
            primary_domain: "example.com".to_string(),
            token_endpoint
        }
    }

    fn test_rsa_pem() -> String {
        let mut rng = rand::rngs::OsRng;
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        rsa::pkcs1::EncodeRsaPrivateKey::to_pkcs1_pem(&key, rsa::pkcs8::LineEnding::LF)
            .expect("pem")
            .to_string()
    }

    #[tokio::test]
    async fn missing_required_user_fields_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "t",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/directory/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": [{"id": "u1"}]
            })))
            .mount(&server)
            .await;

        let adapter = GoogleAdapter::new(
            test_config(format!("{}/token", server.uri())),
            std::time::Duration::from_secs(5),
            8
        )
        .unwrap()
        .with_base_url(server.uri());

        let mut stream = adapter.stream_users();
        let first = stream.next().await.expect("one item yielded");
        assert!(matches!(first, Err(IdpSyncError::ValidationError { ref field, .. }) if field == "primaryEmail"));
    }

    #[tokio::test]
    async fn stream_org_units_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "t",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("type", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "organizationUnits": [{"orgUnitId": "ou1", "name": "Engineering"}]
            })))
            .mount(&server)
            .await;

        let adapter = GoogleAdapter::new(
            test_config(format!("{}/token", server.uri())),
            std::time::Duration::from_secs(5),
            8
        )
        .unwrap()
        .with_base_url(server.uri());

        let mut stream = adapter.stream_org_units();
        let ou = stream.next().await.expect("one org unit yielded").expect("no error");
        assert_eq!(ou.idp_id, "ou1");
        assert_eq!(ou.name, "Engineering");
    }
}
