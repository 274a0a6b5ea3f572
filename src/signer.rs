//! Credential Signer (spec.md 4.1): produces signed JWTs for the Google
//! service-account assertion flow and client-assertion + DPoP proofs for
//! Okta.
//!
//! Plain JWTs (no embedded public key) are built with `jsonwebtoken`, the
//! same crate already used elsewhere in this workspace's dependency tree
//! for GitHub App auth. DPoP proofs embed the signer's own public key as a `jwk` header
//! claim, which `jsonwebtoken::Header` has no slot for, so those are
//! assembled by hand and signed with the `rsa` crate's PKCS#1v1.5 scheme —
//! the same crate and signing call (`Pkcs1v15Sign::new::<Sha256>()`,
//! `private_key.sign(..)`, public modulus/exponent via `n()`/`e()`) used
//! by Google service-account JWT signing elsewhere in the retrieval pack.

use crate::error::{IdpSyncError, IdpSyncResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

const ASSERTION_TTL_SECS: i64 = 3600;
const DPOP_TTL_SECS: i64 = 300;
const CLIENT_ASSERTION_TTL_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct GoogleAssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    sub: String,
    exp: i64,
    iat: i64
}

/// Service-account JWT-bearer assertion for Google (spec.md 4.1).
pub fn google_service_account_assertion(
    service_account_email: &str,
    impersonation_email: &str,
    scopes: &[&str],
    token_endpoint: &str,
    private_key_pem: &str
) -> IdpSyncResult<String> {
    let now = Utc::now().timestamp();
    let claims = GoogleAssertionClaims {
        iss: service_account_email.to_string(),
        scope: scopes.join(" "),
        aud: token_endpoint.to_string(),
        sub: impersonation_email.to_string(),
        exp: now + ASSERTION_TTL_SECS,
        iat: now
    };

    let header = Header::new(jsonwebtoken::Algorithm::RS256);
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))?;

    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))
}

#[derive(Debug, Serialize)]
struct OktaClientAssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    jti: String
}

/// Client-assertion JWT for Okta's `/oauth2/v1/token` endpoint (spec.md 4.1).
pub fn okta_client_assertion(
    client_id: &str,
    token_endpoint: &str,
    key_id: &str,
    private_key_pem: &str
) -> IdpSyncResult<String> {
    let now = Utc::now().timestamp();
    let claims = OktaClientAssertionClaims {
        iss: client_id.to_string(),
        sub: client_id.to_string(),
        aud: token_endpoint.to_string(),
        exp: now + CLIENT_ASSERTION_TTL_SECS,
        iat: now,
        jti: fresh_jti(now)
    };

    let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some(key_id.to_string());
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))?;

    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))
}

#[derive(Debug, Serialize)]
struct DpopJwk {
    kty: &'static str,
    n: String,
    e: String
}

#[derive(Debug, Serialize)]
struct DpopHeader {
    alg: &'static str,
    typ: &'static str,
    kid: String,
    jwk: DpopJwk
}

#[derive(Debug, Serialize)]
struct DpopClaims {
    htm: String,
    htu: String,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>
}

/// A fresh DPoP proof JWT (RFC 9449), generated per request attempt so
/// `jti`/`iat` are never reused across retries (spec.md 4.2).
///
/// `access_token` is `Some` once a token has been issued (`ath` is only
/// present on calls authenticated with DPoP-bound bearer tokens, never on
/// the initial token-endpoint request). `nonce` is set after the server
/// challenges with `DPoP-Nonce` (spec.md scenario 4).
pub fn okta_dpop_proof(
    method: &str,
    url: &str,
    key_id: &str,
    private_key_pem: &str,
    access_token: Option<&str>,
    nonce: Option<&str>
) -> IdpSyncResult<String> {
    let private_key = load_rsa_private_key(private_key_pem)?;
    let public_key = rsa::RsaPublicKey::from(&private_key);

    let header = DpopHeader {
        alg: "RS256",
        typ: "dpop+jwt",
        kid: key_id.to_string(),
        jwk: DpopJwk {
            kty: "RSA",
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be())
        }
    };

    let now = Utc::now().timestamp();
    let claims = DpopClaims {
        htm: method.to_uppercase(),
        htu: htu_from_url(url),
        iat: now,
        exp: now + DPOP_TTL_SECS,
        jti: fresh_jti(now),
        ath: access_token.map(|t| URL_SAFE_NO_PAD.encode(Sha256::digest(t.as_bytes()))),
        nonce: nonce.map(str::to_string)
    };

    let header_json = serde_json::to_vec(&header)
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))?;
    let claims_json = serde_json::to_vec(&claims)
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );

    let digest = Sha256::digest(signing_input.as_bytes());
    let signature = private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))?;

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

fn load_rsa_private_key(pem: &str) -> IdpSyncResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| IdpSyncError::KeyMaterialInvalid(e.to_string()))
}

fn fresh_jti(now_unix: i64) -> String {
    let random_bytes: [u8; 8] = rand::random();
    format!("{now_unix}_{}", URL_SAFE_NO_PAD.encode(random_bytes))
}

/// `scheme://host[/path]` — no query string, no fragment (RFC 9449 `htu`).
fn htu_from_url(url: &str) -> String {
    url.split('?').next().unwrap_or(url).split('#').next().unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key_pem() -> String {
        // 2048-bit RSA key, PKCS#1 PEM, generated solely for test fixtures.
        let mut rng = rand::rngs::OsRng;
        let key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        rsa::pkcs1::EncodeRsaPrivateKey::to_pkcs1_pem(&key, rsa::pkcs8::LineEnding::LF)
            .expect("encode pem")
            .to_string()
    }

    /// Directory configuration stores key material as PEM text read off
    /// disk at operator-setup time; this round-trips through a real file
    /// the way the on-disk fixture would arrive, instead of assuming the
    /// in-memory string in `test_key_pem` is representative.
    #[test]
    fn signs_assertion_with_key_material_loaded_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("service-account.pem");
        std::fs::write(&key_path, test_key_pem()).expect("write pem fixture");

        let pem = std::fs::read_to_string(&key_path).expect("read pem fixture");
        let jws = google_service_account_assertion(
            "svc@project.iam.gserviceaccount.com",
            "admin@example.com",
            &["https://www.googleapis.com/auth/admin.directory.user.readonly"],
            "https://oauth2.googleapis.com/token",
            &pem
        )
        .expect("sign assertion from on-disk key");

        assert_eq!(jws.split('.').count(), 3);
    }

    #[test]
    fn htu_strips_query_and_fragment() {
        assert_eq!(
            htu_from_url("https://example.okta.com/oauth2/v1/token?foo=bar#frag"),
            "https://example.okta.com/oauth2/v1/token"
        );
        assert_eq!(
            htu_from_url("https://example.okta.com/api/v1/users"),
            "https://example.okta.com/api/v1/users"
        );
    }

    #[test]
    fn google_assertion_is_well_formed_compact_jws() {
        let pem = test_key_pem();
        let jws = google_service_account_assertion(
            "svc@project.iam.gserviceaccount.com",
            "admin@example.com",
            &["https://www.googleapis.com/auth/admin.directory.user.readonly"],
            "https://oauth2.googleapis.com/token",
            &pem
        )
        .expect("sign assertion");

        assert_eq!(jws.split('.').count(), 3);
    }

    #[test]
    fn okta_dpop_proof_embeds_fresh_jti_per_call() {
        let pem = test_key_pem();
        let proof1 = okta_dpop_proof(
            "post",
            "https://example.okta.com/oauth2/v1/token",
            "key-1",
            &pem,
            None,
            None
        )
        .expect("proof 1");
        let proof2 = okta_dpop_proof(
            "post",
            "https://example.okta.com/oauth2/v1/token",
            "key-1",
            &pem,
            None,
            Some("server-nonce")
        )
        .expect("proof 2");

        assert_ne!(proof1, proof2);
        assert_eq!(proof1.split('.').count(), 3);

        let header_b64 = proof2.split('.').next().unwrap();
        let header_json = URL_SAFE_NO_PAD.decode(header_b64).unwrap();
        let header_str = String::from_utf8(header_json).unwrap();
        assert!(header_str.contains("\"dpop+jwt\""));
        assert!(header_str.contains("\"jwk\""));
    }

    #[test]
    fn okta_dpop_proof_includes_ath_when_access_token_present() {
        let pem = test_key_pem();
        let proof = okta_dpop_proof(
            "get",
            "https://example.okta.com/api/v1/users",
            "key-1",
            &pem,
            Some("the-access-token"),
            None
        )
        .expect("proof");

        let claims_b64 = proof.split('.').nth(1).unwrap();
        let claims_json = URL_SAFE_NO_PAD.decode(claims_b64).unwrap();
        let claims_str = String::from_utf8(claims_json).unwrap();
        assert!(claims_str.contains("\"ath\""));
        assert!(claims_str.contains("\"htm\":\"GET\""));
    }

    #[test]
    fn invalid_key_material_is_rejected() {
        let result = okta_client_assertion(
            "client-id",
            "https://example.okta.com/oauth2/v1/token",
            "key-1",
            "not a pem key"
        );
        assert!(matches!(result, Err(IdpSyncError::KeyMaterialInvalid(_))));
    }
}
