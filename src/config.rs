//! Configuration types for the MDM server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Endpoint paths.
pub const DISCOVERY_PATH: &str = "/EnrollmentServer/Discovery.svc";
pub const POLICY_PATH: &str = "/EnrollmentServer/Policy.svc";
pub const ENROLLMENT_PATH: &str = "/EnrollmentServer/Enrollment.svc";
pub const TERMS_OF_SERVICE_PATH: &str = "/EnrollmentServer/TermsOfService.svc";
pub const MANAGEMENT_PATH: &str = "/ManagementServer/Manage.svc";

/// Main configuration for the MDM server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdmConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Issuing identity and trust material
    pub identity: IdentityConfig,

    /// Enrollment (WSTEP) behaviour
    pub enrollment: EnrollmentConfig,

    /// Federated token verification
    pub federation: FederationConfig,

    /// Management session (OMA-DM) behaviour
    pub management: ManagementConfig,
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            identity: IdentityConfig::default(),
            enrollment: EnrollmentConfig::default(),
            federation: FederationConfig::default(),
            management: ManagementConfig::default(),
        }
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Address the HTTP listener binds to
    pub listen_address: String,

    /// Public host name devices reach the server on
    pub domain: String,

    /// Provider identifier registered with the device management client
    pub provider_id: String,

    /// Name shown to the user for the management server
    pub server_display_name: String,

    /// Support website advertised to the device
    pub support_website: String,

    /// Redirect target for `/`
    pub index_website: Option<String>,

    /// Maximum SOAP body size (bytes)
    pub max_soap_body_size: usize,

    /// Maximum SyncML body size (bytes)
    pub max_syncml_body_size: usize,

    /// Header carrying the URL-escaped PEM client certificate from the TLS terminator.
    ///
    /// Any certificate in this header that chains to the identity certificate
    /// is accepted as the device's. The terminator must drop this header from
    /// incoming requests and set it only from the verified TLS session, or a
    /// client can present a certificate it holds no key for.
    pub client_cert_header: String,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8000".to_string(),
            domain: "mdm.example.com".to_string(),
            provider_id: "ZentinelMDM".to_string(),
            server_display_name: "Zentinel MDM".to_string(),
            support_website: "https://mdm.example.com/support".to_string(),
            index_website: None,
            max_soap_body_size: 10_000,
            max_syncml_body_size: 524_288,
            client_cert_header: "X-Client-Cert".to_string(),
        }
    }
}

impl SettingsConfig {
    /// Absolute HTTPS URL for a path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.domain, path)
    }
}

/// Identity certificate and trust pool locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// PEM certificate used to sign device certificates
    pub certificate_path: PathBuf,

    /// PEM private key for the identity certificate
    pub private_key_path: PathBuf,

    /// Additional PEM bundles trusted for client certificates
    pub trust_pool_paths: Vec<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            certificate_path: PathBuf::from("certs/identity.crt"),
            private_key_path: PathBuf::from("certs/identity.key"),
            trust_pool_paths: vec![],
        }
    }
}

/// Enrollment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    /// Accepted `DeviceType` values (supports glob patterns)
    pub allowed_device_types: Vec<String>,

    /// Reject renewals requested before the renewal window opens
    pub enforce_renewal_window: bool,

    /// Days before expiry the device starts renewing
    pub renewal_period_days: u32,

    /// Days between renewal retries
    pub retry_interval_days: u32,

    /// Validity of issued certificates
    pub certificate_validity_days: u32,

    /// Upper bound on the random NotBefore backdate
    pub max_not_before_jitter_minutes: u32,

    /// Title of the page shown once enrollment completes
    pub enrollment_complete_title: String,

    /// Body text of the page shown once enrollment completes
    pub enrollment_complete_body: String,

    /// Serve the terms of service page
    pub terms_of_service_enabled: bool,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            allowed_device_types: vec!["CIMClient_Windows".to_string()],
            enforce_renewal_window: true,
            renewal_period_days: 42,
            retry_interval_days: 4,
            certificate_validity_days: 365,
            max_not_before_jitter_minutes: 120,
            enrollment_complete_title: "Enrollment complete".to_string(),
            enrollment_complete_body: "Your device is now managed.".to_string(),
            terms_of_service_enabled: true,
        }
    }
}

/// Federated token verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Enable federated token authentication
    pub enabled: bool,

    /// OpenID configuration document advertising `jwks_uri`
    pub openid_configuration_url: String,

    /// Key set refresh interval in seconds
    pub refresh_interval_secs: u64,

    /// Expected `aud` claim
    pub audience: Option<String>,

    /// Expected `iss` claim
    pub issuer: Option<String>,

    /// Clock skew tolerance in seconds
    pub leeway_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            openid_configuration_url:
                "https://login.microsoftonline.com/common/.well-known/openid-configuration"
                    .to_string(),
            refresh_interval_secs: 7200, // 2 hours
            audience: None,
            issuer: None,
            leeway_secs: 60,
        }
    }
}

/// Management session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Action on header violations: "block" or "allow"
    pub fail_action: FailAction,

    /// Expected `Platform` query parameter
    pub required_platform: Option<String>,

    /// Require a client certificate bound to the device
    pub require_client_certificate: bool,

    /// OMA-URIs fetched at the start of each session
    pub inventory_uris: Vec<String>,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            fail_action: FailAction::Block,
            required_platform: Some("WoA".to_string()),
            require_client_certificate: true,
            inventory_uris: vec![
                "./DevDetail/SwV".to_string(),
                "./DevDetail/Ext/Microsoft/DeviceName".to_string(),
                "./DevInfo/Mod".to_string(),
            ],
        }
    }
}

/// Failure action when violations are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Answer with an error status
    #[default]
    Block,
    /// Log and continue
    Allow,
}
