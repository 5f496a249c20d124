//! Federated (Azure AD) token verification.
//!
//! Signing keys are published through the OpenID configuration's `jwks_uri`.
//! The key set is held as an immutable snapshot; a single refresher swaps in
//! a new snapshot on an interval and leaves the old one in place on failure.

use crate::config::FederationConfig;
use crate::error::MdmError;
use crate::service::TokenVerifier;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// A JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

/// A JSON Web Key Set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find_key(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: String,
}

/// Claims carried by a federated token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    /// Object ID of the user
    pub oid: String,
    /// User principal name
    pub upn: String,
    /// Tenant ID
    pub tid: String,
    pub name: String,
    /// Azure AD device ID
    pub deviceid: String,
}

/// Read-mostly cache of federated signing keys.
pub struct FederatedKeyCache {
    keys: RwLock<Arc<JwkSet>>,
    openid_configuration_url: String,
    http_client: reqwest::Client,
}

impl FederatedKeyCache {
    pub fn new(openid_configuration_url: impl Into<String>) -> Result<Self, MdmError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MdmError::Federation(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            keys: RwLock::new(Arc::new(JwkSet::default())),
            openid_configuration_url: openid_configuration_url.into(),
            http_client,
        })
    }

    /// A cache pre-populated with a key set.
    pub fn with_keys(keys: JwkSet) -> Result<Self, MdmError> {
        let cache = Self::new(String::new())?;
        Ok(Self {
            keys: RwLock::new(Arc::new(keys)),
            ..cache
        })
    }

    /// Current key set snapshot.
    pub async fn snapshot(&self) -> Arc<JwkSet> {
        self.keys.read().await.clone()
    }

    /// Fetch the key set and swap it in. The previous snapshot stays on error.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize, MdmError> {
        let keys = self.fetch().await?;
        let count = keys.keys.len();
        *self.keys.write().await = Arc::new(keys);
        info!(key_count = count, "Federated signing keys refreshed");
        Ok(count)
    }

    async fn fetch(&self) -> Result<JwkSet, MdmError> {
        let config: OpenIdConfiguration = self.get_json(&self.openid_configuration_url).await?;
        debug!(jwks_uri = %config.jwks_uri, "Resolved JWKS endpoint");
        self.get_json(&config.jwks_uri).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, MdmError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| MdmError::Federation(format!("HTTP error: {}", e)))?;

        if !response.status().is_success() {
            return Err(MdmError::Federation(format!(
                "HTTP status {} from {}",
                response.status(),
                url
            )));
        }

        response
            .json()
            .await
            .map_err(|e| MdmError::Federation(format!("JSON parse error: {}", e)))
    }

    /// Refresh immediately, then on every tick of `interval`, until the task is dropped.
    pub async fn run_refresher(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Federated key refresh failed, keeping previous keys");
            }
        }
    }
}

/// Verifies federated tokens against the cached key set.
pub struct FederatedTokenVerifier {
    cache: Arc<FederatedKeyCache>,
    audience: Option<String>,
    issuer: Option<String>,
    leeway_secs: u64,
}

impl FederatedTokenVerifier {
    pub fn new(cache: Arc<FederatedKeyCache>, config: &FederationConfig) -> Self {
        Self {
            cache,
            audience: config.audience.clone(),
            issuer: config.issuer.clone(),
            leeway_secs: config.leeway_secs,
        }
    }
}

#[async_trait]
impl TokenVerifier for FederatedTokenVerifier {
    async fn verify_token(&self, token: &str) -> Result<FederatedClaims, MdmError> {
        let header = decode_header(token)
            .map_err(|e| MdmError::Federation(format!("Invalid token header: {}", e)))?;

        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(MdmError::Federation(format!(
                "Unsupported token algorithm {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| MdmError::Federation("Token has no key ID".to_string()))?;

        let keys = self.cache.snapshot().await;
        let jwk = keys
            .find_key(&kid)
            .ok_or_else(|| MdmError::Federation(format!("Unknown signing key {}", kid)))?;

        let (n, e) = match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) if jwk.kty == "RSA" => (n, e),
            _ => {
                return Err(MdmError::Federation(format!(
                    "Signing key {} is not an RSA key",
                    kid
                )))
            }
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| MdmError::Federation(format!("Invalid signing key: {}", e)))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss]);
        }

        let data = decode::<FederatedClaims>(token, &key, &validation)
            .map_err(|e| MdmError::Federation(format!("Token verification failed: {}", e)))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use openssl::rsa::Rsa;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct SigningKey {
        encoding: EncodingKey,
        jwk: Jwk,
    }

    fn signing_key(kid: &str) -> SigningKey {
        let rsa = Rsa::generate(2048).unwrap();
        let jwk = Jwk {
            kty: "RSA".to_string(),
            kid: Some(kid.to_string()),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            n: Some(URL_SAFE_NO_PAD.encode(rsa.n().to_vec())),
            e: Some(URL_SAFE_NO_PAD.encode(rsa.e().to_vec())),
        };
        let pem = rsa.private_key_to_pem().unwrap();
        SigningKey {
            encoding: EncodingKey::from_rsa_pem(&pem).unwrap(),
            jwk,
        }
    }

    fn claims(exp_offset: i64) -> FederatedClaims {
        let now = chrono::Utc::now().timestamp();
        FederatedClaims {
            iss: "https://sts.windows.net/tenant/".to_string(),
            aud: "urn:ms-drs:enterpriseregistration.windows.net".to_string(),
            iat: now,
            exp: now + exp_offset,
            oid: "oid-1".to_string(),
            upn: "user@contoso.com".to_string(),
            tid: "tenant".to_string(),
            name: "User".to_string(),
            deviceid: "aad-device".to_string(),
        }
    }

    fn token(key: &SigningKey, kid: &str, claims: &FederatedClaims) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &key.encoding).unwrap()
    }

    fn verifier(keys: Vec<Jwk>, audience: Option<&str>) -> FederatedTokenVerifier {
        let cache = Arc::new(FederatedKeyCache::with_keys(JwkSet { keys }).unwrap());
        let config = FederationConfig {
            audience: audience.map(str::to_string),
            ..Default::default()
        };
        FederatedTokenVerifier::new(cache, &config)
    }

    #[tokio::test]
    async fn test_verify_valid_token() {
        let key = signing_key("k1");
        let verifier = verifier(vec![key.jwk.clone()], None);
        let verified = verifier
            .verify_token(&token(&key, "k1", &claims(3600)))
            .await
            .unwrap();
        assert_eq!(verified.upn, "user@contoso.com");
        assert_eq!(verified.deviceid, "aad-device");
    }

    #[tokio::test]
    async fn test_reject_unknown_kid() {
        let key = signing_key("k1");
        let verifier = verifier(vec![key.jwk.clone()], None);
        let result = verifier.verify_token(&token(&key, "k2", &claims(3600))).await;
        assert!(matches!(result, Err(MdmError::Federation(_))));
    }

    #[tokio::test]
    async fn test_reject_wrong_signing_key() {
        let trusted = signing_key("k1");
        let attacker = signing_key("k1");
        let verifier = verifier(vec![trusted.jwk.clone()], None);
        let result = verifier
            .verify_token(&token(&attacker, "k1", &claims(3600)))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reject_expired_token() {
        let key = signing_key("k1");
        let verifier = verifier(vec![key.jwk.clone()], None);
        let result = verifier.verify_token(&token(&key, "k1", &claims(-3600))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_audience_enforced_when_configured() {
        let key = signing_key("k1");
        let verifier = verifier(vec![key.jwk.clone()], Some("urn:other"));
        let result = verifier.verify_token(&token(&key, "k1", &claims(3600))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_refresh_fetches_through_openid_configuration() {
        let server = MockServer::start().await;
        let key = signing_key("k1");

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jwks_uri": format!("{}/discovery/keys", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/discovery/keys"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "keys": [key.jwk.clone()] })),
            )
            .mount(&server)
            .await;

        let cache = FederatedKeyCache::new(format!(
            "{}/.well-known/openid-configuration",
            server.uri()
        ))
        .unwrap();
        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert!(cache.snapshot().await.find_key("k1").is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let key = signing_key("k1");
        let cache = FederatedKeyCache {
            openid_configuration_url: format!("{}/.well-known/openid-configuration", server.uri()),
            ..FederatedKeyCache::with_keys(JwkSet {
                keys: vec![key.jwk.clone()],
            })
            .unwrap()
        };

        assert!(cache.refresh().await.is_err());
        assert!(cache.snapshot().await.find_key("k1").is_some());
    }
}
