//! Okta adapter (spec.md 4.3): client-assertion + DPoP-bound OAuth, OIDC
//! apps as the group/membership surface (`/apps/{id}/users`,
//! `/apps/{id}/groups`), cursor pagination via the `Link: rel="next"`
//! header.

use crate::error::{IdpSyncError, IdpSyncResult};
use crate::http;
use crate::model::OktaDirectoryConfig;
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

const MAX_RETRIES: u32 = 3;
const PAGE_LIMIT: u32 = 200;

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>
}

pub struct OktaAdapter {
    client: Client,
    config: OktaDirectoryConfig,
    token: RwLock<Option<CachedToken>>,
    /// Bounds concurrent in-flight requests to the Okta org domain
    /// (spec.md 5, `http_max_concurrent_per_host`).
    host_limiter: Arc<Semaphore>
}

impl OktaAdapter {
    pub fn new(config: OktaDirectoryConfig, per_request_timeout: std::time::Duration, max_concurrent_per_host: usize) -> IdpSyncResult<Self> {
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
        format!("https://{}/oauth2/v1/token", self.config.domain)
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
        let assertion = signer::okta_client_assertion(
            &self.config.client_id,
            &token_endpoint,
            &self.config.key_id,
            &self.config.private_jwk_pem
        )?;

        let form = [
            ("grant_type", "client_credentials"),
            ("scope", "okta.apps.read okta.users.read okta.groups.read"),
            (
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"
            ),
            ("client_assertion", assertion.as_str())
        ];

        let key_id = self.config.key_id.clone();
        let private_key_pem = self.config.private_jwk_pem.clone();
        let token_endpoint_for_proof = token_endpoint.clone();
        let make_dpop_header = move |nonce: Option<&str>| {
            signer::okta_dpop_proof(
                "post",
                &token_endpoint_for_proof,
                &key_id,
                &private_key_pem,
                None,
                nonce
            )
        };

        let response = {
            let _permit = self.host_limiter.acquire().await;
            http::post_form_with_dpop_nonce_retry(&self.client, &token_endpoint, &form, make_dpop_header).await?
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

    async fn authorized_get<T: for<'de> Deserialize<'de>>(&self, url: &str, query: &[(&str, &str)]) -> IdpSyncResult<(T, Option<String>)> {
        self.authorized_get_with_headers(url, query, &[]).await
    }

    /// Same as `authorized_get`, plus a fixed set of extra request
    /// headers (e.g. the trimmed-projection `Content-Type` spec.md 4.3
    /// requires on the users listing) sent alongside the per-attempt
    /// DPoP proof.
    async fn authorized_get_with_headers<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, &str)]
    ) -> IdpSyncResult<(T, Option<String>)> {
        let token = self.fetch_access_token().await?;
        let key_id = self.config.key_id.clone();
        let private_key_pem = self.config.private_jwk_pem.clone();
        let url_for_proof = url.to_string();
        let token_for_proof = token.clone();
        let extra_headers: Vec<(String, String)> = extra_headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect();
        let headers_fn = move || {
            let proof = signer::okta_dpop_proof(
                "get",
                &url_for_proof,
                &key_id,
                &private_key_pem,
                Some(&token_for_proof),
                None
            )?;
            let mut headers = vec![
                ("authorization".to_string(), format!("DPoP {token_for_proof}")),
                ("dpop".to_string(), proof)
            ];
            headers.extend(extra_headers.iter().cloned());
            Ok(headers)
        };
        let response = {
            let _permit = self.host_limiter.acquire().await;
            http::get_with_retry(&self.client, url, query, headers_fn, MAX_RETRIES).await?
        };

        let status = response.status();
        let next_link = extract_next_link(response.headers());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, url, &body));
        }

        let body = response.json::<T>().await?;
        Ok((body, next_link))
    }

    async fn list_app_ids(&self) -> IdpSyncResult<Vec<String>> {
        let mut url = format!("https://{}/api/v1/apps", self.config.domain);
        let mut ids = Vec::new();
        let mut first = true;

        loop {
            let query: &[(&str, &str)] = if first {
                &[("filter", "status eq \"ACTIVE\""), ("limit", "200")]
            } else {
                &[]
            };
            let (apps, next): (Vec<OktaApp>, Option<String>) = self.authorized_get(&url, query).await?;
            ids.extend(apps.into_iter().map(|a| a.id));

            first = false;
            match next {
                Some(n) => url = n,
                None => break
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl ProviderAdapter for OktaAdapter {
    fn issuer(&self) -> String {
        format!("https://{}", self.config.domain)
    }

    async fn access_token(&self) -> IdpSyncResult<String> {
        self.fetch_access_token().await
    }

    async fn verify(&self) -> IdpSyncResult<()> {
        let url = format!("https://{}/api/v1/apps", self.config.domain);
        self.authorized_get::<Vec<OktaApp>>(&url, &[("limit", "1")]).await?;
        Ok(())
    }

    fn stream_users<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<UserRecord>> {
        Box::pin(try_stream! {
            let app_ids = self.list_app_ids().await?;

            for app_id in app_ids {
                let mut url = format!("https://{}/api/v1/apps/{app_id}/users", self.config.domain);
                let mut first = true;
                loop {
                    let query: &[(&str, &str)] = if first {
                        &[("expand", "user"), ("limit", "200"), ("fields", "id,status,profile:(firstName,lastName)")]
                    } else {
                        &[]
                    };
                    let (app_users, next): (Vec<OktaAppUser>, Option<String>) = self
                        .authorized_get_with_headers(
                            &url,
                            query,
                            &[("content-type", "application/json; okta-response=omitCredentials,omitCredentialsLinks")]
                        )
                        .await?;

                    for app_user in app_users {
                        if app_user.status.as_deref() != Some("ACTIVE") {
                            continue;
                        }
                        let Some(embedded) = app_user.embedded.and_then(|e| e.user) else {
                            continue;
                        };
                        let Some(profile) = embedded.profile else {
                            continue;
                        };
                        let Some(email) = profile.email.or(profile.login) else {
                            Err(IdpSyncError::ValidationError { record_kind: "okta user".to_string(), field: "profile.email".to_string() })?;
                            continue;
                        };

                        yield UserRecord {
                            idp_id: app_user.id,
                            email: Some(email),
                            name: combine_name(profile.first_name.as_deref(), profile.last_name.as_deref()),
                            given_name: profile.first_name,
                            family_name: profile.last_name,
                            preferred_username: profile.login
                        };
                    }

                    first = false;
                    match next {
                        Some(n) => url = n,
                        None => break
                    }
                }
            }
        })
    }

    fn stream_groups<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>> {
        Box::pin(try_stream! {
            let app_ids = self.list_app_ids().await?;

            for app_id in app_ids {
                let mut url = format!("https://{}/api/v1/apps/{app_id}/groups", self.config.domain);
                let mut first = true;
                loop {
                    let query: &[(&str, &str)] = if first {
                        &[("limit", PAGE_LIMIT_STR)]
                    } else {
                        &[]
                    };
                    let (app_groups, next): (Vec<OktaAppGroup>, Option<String>) = self.authorized_get(&url, query).await?;

                    for app_group in app_groups {
                        yield GroupRecord { idp_id: app_group.id, name: app_group.profile.map(|p| p.name).unwrap_or_default() };
                    }

                    first = false;
                    match next {
                        Some(n) => url = n,
                        None => break
                    }
                }
            }
        })
    }

    fn stream_group_members<'a>(&'a self, group_idp_id: &'a str) -> BoxStream<'a, IdpSyncResult<String>> {
        Box::pin(try_stream! {
            let mut url = format!("https://{}/api/v1/groups/{group_idp_id}/users", self.config.domain);
            let mut first = true;
            loop {
                let query: &[(&str, &str)] = if first {
                    &[("limit", PAGE_LIMIT_STR)]
                } else {
                    &[]
                };
                let (members, next): (Vec<OktaGroupMember>, Option<String>) = self.authorized_get(&url, query).await?;

                for member in members {
                    if member.status.as_deref() == Some("ACTIVE") {
                        yield member.id;
                    }
                }

                first = false;
                match next {
                    Some(n) => url = n,
                    None => break
                }
            }
        })
    }

    fn stream_org_units<'a>(&'a self) -> BoxStream<'a, IdpSyncResult<GroupRecord>> {
        Box::pin(futures_util::stream::empty())
    }
}

const PAGE_LIMIT_STR: &str = "200";

fn combine_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (Some(f), None) => Some(f.to_string()),
        (None, Some(l)) => Some(l.to_string()),
        (None, None) => None
    }
}

fn extract_next_link(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all("link")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|raw| {
            raw.split(',').find_map(|part| {
                let part = part.trim();
                if !part.contains("rel=\"next\"") {
                    return None;
                }
                let start = part.find('<')?;
                let end = part.find('>')?;
                Some(part[start + 1..end].to_string())
            })
        })
}

fn classify_http_error(status: reqwest::StatusCode, path: &str, body: &str) -> IdpSyncError {
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
struct OktaApp {
    id: String
}

#[derive(Debug, Deserialize)]
struct OktaAppUser {
    id: String,
    status: Option<String>,
    #[serde(rename = "_embedded")]
    embedded: Option<OktaAppUserEmbedded>
}

#[derive(Debug, Deserialize)]
struct OktaAppUserEmbedded {
    user: Option<OktaUser>
}

#[derive(Debug, Deserialize)]
struct OktaUser {
    profile: Option<OktaUserProfile>
}

#[derive(Debug, Deserialize)]
struct OktaUserProfile {
    email: Option<String>,
    login: Option<String>,
    #[serde(rename = "firstName")]
    first_name: Option<String>,
    #[serde(rename = "lastName")]
    last_name: Option<String>
}

#[derive(Debug, Deserialize)]
struct OktaAppGroup {
    id: String,
    profile: Option<OktaAppGroupProfile>
}

#[derive(Debug, Deserialize)]
struct OktaAppGroupProfile {
    name: String
}

#[derive(Debug, Deserialize)]
struct OktaGroupMember {
    id: String,
    status: Option<String>
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_next_link_parses_rel_next() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "link",
            "<https://example.okta.com/api/v1/apps?after=abc>; rel=\"next\""
                .parse()
                .unwrap()
        );
        assert_eq!(
            extract_next_link(&headers),
            Some("https://example.okta.com/api/v1/apps?after=abc".to_string())
        );
    }

    #[test]
    fn extract_next_link_is_none_without_next_rel() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "link",
            "<https://example.okta.com/api/v1/apps?before=abc>; rel=\"self\""
                .parse()
                .unwrap()
        );
        assert_eq!(extract_next_link(&headers), None);
    }

    #[test]
    fn combine_name_handles_partial_names() {
        assert_eq!(combine_name(Some("Ada"), Some("Lovelace")), Some("Ada Lovelace".to_string()));
        assert_eq!(combine_name(Some("Ada"), None), Some("Ada".to_string()));
        assert_eq!(combine_name(None, None), None);
    }
}
