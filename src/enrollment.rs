//! Enrollment endpoint (MS-WSTEP).
//!
//! Each request walks the same sequence: decode, route check, context
//! validation, token decode, authentication, CSR validation, issuance and
//! provisioning document assembly. Any step may end the request with a SOAP
//! fault; steps return `Err(Response)` carrying that fault so the sequence
//! reads top to bottom with `?`.

use crate::config::{EnrollmentConfig, SettingsConfig, MANAGEMENT_PATH};
use crate::error::{EnrollmentErrorType, FaultCode, MdmError};
use crate::fault::Fault;
use crate::identity::{
    common_name, is_current, open_renewal_envelope, parse_csr, renewal_window_open, sign_csr,
    validity, CertificateTemplate, RenewalEnvelope,
};
use crate::service::{CredentialVerifier, DeviceRegistry, IssuerIdentity, TokenVerifier};
use crate::soap::{
    soap_response, without_query, BinarySecurityToken, RequestEnvelope, ResponseEnvelope,
    ENROLLMENT_ACTION, ENROLLMENT_NS, ENROLLMENT_RESPONSE_ACTION, TOKEN_ENCODING_BASE64,
    TOKEN_VALUE_TYPE_JWT, TOKEN_VALUE_TYPE_PKCS10, TOKEN_VALUE_TYPE_PKCS7, WSSE_NS, WS_TRUST_NS,
};
use crate::validator::DeviceTypeMatcher;
use crate::wap::{self, Characteristic, Parameter, ProvisioningDoc, RenewalPolicy};
use crate::xml::Element;
use axum::http::StatusCode;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub const REQUEST_TYPE_ISSUE: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/Issue";
pub const REQUEST_TYPE_RENEW: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/Renew";

const DEVICE_ENROLLMENT_TOKEN_TYPE: &str =
    "http://schemas.microsoft.com/5.0.0.0/ConfigurationManager/Enrollment/DeviceEnrollmentToken";
const PROVISION_DOC_VALUE_TYPE: &str =
    "http://schemas.microsoft.com/5.0.0.0/ConfigurationManager/Enrollment/DeviceEnrollmentProvisionDoc";

/// Context items every request must carry.
const REQUIRED_CONTEXT_ITEMS: [&str; 3] = ["DeviceID", "EnrollmentType", "OSEdition"];

/// Whether a certificate is being issued for the first time or renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Issue,
    Renew,
}

impl RequestType {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            REQUEST_TYPE_ISSUE => Some(Self::Issue),
            REQUEST_TYPE_RENEW => Some(Self::Renew),
            _ => None,
        }
    }
}

/// Certificate store the client certificate is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStore {
    Device,
    User,
}

impl CertStore {
    /// Store name used in the provisioning document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "System",
            Self::User => "User",
        }
    }

    /// OMA-DM root the device manages this store's settings under.
    pub fn management_root(&self) -> &'static str {
        match self {
            Self::Device => "./Vendor",
            Self::User => "./User/Vendor",
        }
    }
}

/// A decoded `RequestSecurityToken`.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub token_type: String,
    /// `None` when the request type URI is not recognised
    pub request_type: Option<RequestType>,
    pub token: BinarySecurityToken,
    /// `AdditionalContext` items in document order
    pub context: Vec<(String, String)>,
    pub device_id: String,
    pub device_type: String,
    pub os_edition: String,
    pub enrollment_type: String,
    pub store: CertStore,
}

impl EnrollmentRequest {
    pub fn from_envelope(envelope: &RequestEnvelope) -> Result<Self, MdmError> {
        let rst = envelope
            .payload()
            .filter(|p| p.local_name() == "RequestSecurityToken")
            .ok_or_else(|| {
                MdmError::InvalidEnvelope("Missing RequestSecurityToken".to_string())
            })?;

        let token = rst
            .find("BinarySecurityToken")
            .map(BinarySecurityToken::from_element)
            .ok_or_else(|| MdmError::InvalidEnvelope("Missing BinarySecurityToken".to_string()))?;

        let context: Vec<(String, String)> = rst
            .find("AdditionalContext")
            .map(|ac| {
                ac.find_all("ContextItem")
                    .map(|item| {
                        (
                            item.attr("Name").unwrap_or_default().to_string(),
                            item.text_at(&["Value"]).unwrap_or_default().trim().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let item = |name: &str| {
            context
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        let enrollment_type = item("EnrollmentType");
        let store = if enrollment_type == "Device" {
            CertStore::Device
        } else {
            CertStore::User
        };

        Ok(Self {
            token_type: rst.text_at(&["TokenType"]).unwrap_or_default().trim().to_string(),
            request_type: RequestType::from_uri(rst.text_at(&["RequestType"]).unwrap_or_default().trim()),
            token,
            device_id: item("DeviceID"),
            device_type: item("DeviceType"),
            os_edition: item("OSEdition"),
            enrollment_type,
            store,
            context,
        })
    }

    /// First context item called `name`.
    pub fn context_item(&self, name: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check every required context item is present and non-empty.
    pub fn validate_context(&self) -> Result<(), MdmError> {
        for name in REQUIRED_CONTEXT_ITEMS {
            if self.context_item(name).map_or(true, str::is_empty) {
                return Err(MdmError::InvalidEnvelope(format!(
                    "request missing ContextItem '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// The signing request carried in the body token.
#[derive(Debug)]
pub enum SigningRequest {
    Issue(Vec<u8>),
    Renew(RenewalEnvelope),
}

impl SigningRequest {
    pub fn csr(&self) -> &[u8] {
        match self {
            Self::Issue(csr) => csr,
            Self::Renew(envelope) => &envelope.csr,
        }
    }
}

/// Decode a base64 binary security token value.
pub fn decode_token_value(token: &BinarySecurityToken) -> Result<Vec<u8>, MdmError> {
    if token.encoding_type != TOKEN_ENCODING_BASE64 {
        return Err(MdmError::TokenDecode(format!(
            "encoding {} not supported",
            token.encoding_type
        )));
    }
    let compact: String = token.value.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| MdmError::TokenDecode(e.to_string()))
}

type Step<T> = Result<T, Response>;

/// WSTEP enrollment service.
pub struct EnrollmentService {
    settings: SettingsConfig,
    config: EnrollmentConfig,
    device_types: DeviceTypeMatcher,
    identity: Arc<dyn IssuerIdentity>,
    registry: Arc<dyn DeviceRegistry>,
    credentials: Arc<dyn CredentialVerifier>,
    token_verifier: Option<Arc<dyn TokenVerifier>>,
}

impl EnrollmentService {
    pub fn new(
        settings: SettingsConfig,
        config: EnrollmentConfig,
        identity: Arc<dyn IssuerIdentity>,
        registry: Arc<dyn DeviceRegistry>,
        credentials: Arc<dyn CredentialVerifier>,
        token_verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> Self {
        let device_types = DeviceTypeMatcher::new(&config.allowed_device_types);
        Self {
            settings,
            config,
            device_types,
            identity,
            registry,
            credentials,
            token_verifier,
        }
    }

    /// Handle a `RequestSecurityToken` received at `request_url`.
    pub async fn enroll(&self, request_url: &str, body: &[u8]) -> Response {
        let mut fault = Fault::new("enrollment", ENROLLMENT_RESPONSE_ACTION);
        match self.process(&mut fault, request_url, body).await {
            Ok(response) | Err(response) => response,
        }
    }

    async fn process(&self, fault: &mut Fault, request_url: &str, body: &[u8]) -> Step<Response> {
        let envelope = RequestEnvelope::decode(body).map_err(|e| {
            fault.fault(e, "the request could not be parsed", FaultCode::InternalServiceFault)
        })?;
        fault.relate_to(envelope.relates_to());
        let fault = &*fault;

        if envelope.header.action != ENROLLMENT_ACTION {
            return Err(fault.fault(
                "the request's action is not supported by the endpoint",
                "the request was not destined for this endpoint",
                FaultCode::ActionMismatch,
            ));
        }
        if without_query(request_url) != without_query(&envelope.header.to) {
            return Err(fault.fault(
                format!("the request was destined for {}", envelope.header.to),
                "the request was not destined for this server",
                FaultCode::EndpointUnavailable,
            ));
        }

        let request = EnrollmentRequest::from_envelope(&envelope).map_err(|e| {
            fault.fault(e, "the request could not be parsed", FaultCode::InternalServiceFault)
        })?;
        self.validate_context(fault, &request)?;

        let signing = self.decode_signing_request(fault, &request)?;
        let principal = self.authenticate(fault, &envelope, &request, &signing).await?;

        let common_name = match request.store {
            CertStore::Device => request.device_id.clone(),
            CertStore::User => principal.clone(),
        };
        let (root_der, client_der) =
            self.issue(fault, signing.csr(), &common_name, &request.device_id)?;

        let search_criteria = format!(
            "Subject={}&Stores=MY%5C{}",
            urlencoding::encode(&format!("CN={}", common_name)),
            request.store.as_str()
        );

        let mut doc = ProvisioningDoc::new(vec![wap::certificate_store(
            &root_der,
            request.store.as_str(),
            &client_der,
            RenewalPolicy {
                renew_period_days: self.config.renewal_period_days,
                retry_interval_days: self.config.retry_interval_days,
            },
        )]);

        match request.request_type {
            Some(RequestType::Issue) => {
                self.registry
                    .check_in(&request.device_id, &request)
                    .await
                    .map_err(|e| {
                        fault.advanced_fault(
                            e,
                            "the management server encountered a fault",
                            EnrollmentErrorType::InMaintenance,
                            FaultCode::InternalServiceFault,
                        )
                    })?;
                doc.push(wap::w7_application(
                    &self.settings.provider_id,
                    &self.settings.server_display_name,
                    &self.settings.url(MANAGEMENT_PATH),
                    &search_criteria,
                ));
                doc.push(self.dm_client(&request.device_id));
            }
            Some(RequestType::Renew) | None => {
                doc.push(wap::empty_application(&self.settings.provider_id));
            }
        }

        info!(
            device_id = %request.device_id,
            principal = %principal,
            store = request.store.as_str(),
            request_type = ?request.request_type,
            "Issued device certificate"
        );

        let provisioning = doc.to_base64().map_err(|e| {
            fault.fault(
                e,
                "an internal fault occurred marshalling the provisioning profile",
                FaultCode::InternalServiceFault,
            )
        })?;

        ResponseEnvelope::new(
            ENROLLMENT_RESPONSE_ACTION,
            Some(envelope.relates_to()),
            token_response(provisioning),
        )
        .encode()
        .map(|xml| soap_response(StatusCode::OK, xml))
        .map_err(|e| {
            fault.fault(
                e,
                "an internal fault occurred marshalling the response body",
                FaultCode::InternalServiceFault,
            )
        })
    }

    fn validate_context(&self, fault: &Fault, request: &EnrollmentRequest) -> Step<()> {
        if let Err(e) = request.validate_context() {
            return Err(fault.advanced_fault(
                e,
                "the enrollment data is incomplete",
                EnrollmentErrorType::InvalidEnrollmentData,
                FaultCode::InternalServiceFault,
            ));
        }
        if !self.device_types.is_supported(&request.device_type) {
            return Err(fault.advanced_fault(
                format!("device type {:?} is not allowed", request.device_type),
                "the device is not supported by this management server",
                EnrollmentErrorType::DeviceNotSupported,
                FaultCode::InternalServiceFault,
            ));
        }
        Ok(())
    }

    fn decode_signing_request(
        &self,
        fault: &Fault,
        request: &EnrollmentRequest,
    ) -> Step<SigningRequest> {
        let raw = decode_token_value(&request.token).map_err(|e| {
            fault.fault(
                e,
                "the binary security token encoding is not supported",
                FaultCode::MessageFormat,
            )
        })?;

        let (expected, request_type) = match request.request_type {
            Some(RequestType::Renew) => (TOKEN_VALUE_TYPE_PKCS7, RequestType::Renew),
            Some(RequestType::Issue) => (TOKEN_VALUE_TYPE_PKCS10, RequestType::Issue),
            None => {
                return Err(fault.fault(
                    "the request type is not supported",
                    "the request could not be handled by this endpoint",
                    FaultCode::MessageFormat,
                ))
            }
        };
        if request.token.value_type != expected {
            return Err(fault.fault(
                format!("the binary security token ValueType is not {}", expected),
                "the binary security token type is not supported",
                FaultCode::MessageFormat,
            ));
        }

        match request_type {
            RequestType::Issue => Ok(SigningRequest::Issue(raw)),
            RequestType::Renew => open_renewal_envelope(&raw)
                .map(SigningRequest::Renew)
                .map_err(|e| {
                    fault.fault(
                        e,
                        "the binary security token could not be verified",
                        FaultCode::InternalServiceFault,
                    )
                }),
        }
    }

    /// Work out who is enrolling. Returns the principal name.
    async fn authenticate(
        &self,
        fault: &Fault,
        envelope: &RequestEnvelope,
        request: &EnrollmentRequest,
        signing: &SigningRequest,
    ) -> Step<String> {
        let security = envelope.header.security.clone().unwrap_or_default();

        if let Some(token) = &security.binary_security_token {
            return self.authenticate_federated(fault, token).await;
        }

        if let Some(credentials) = &security.username_token {
            if !credentials.username.is_empty() && !credentials.password.is_empty() {
                self.credentials
                    .verify_credentials(&credentials.username, &credentials.password)
                    .await
                    .map_err(|e| {
                        fault.fault(
                            e,
                            "the users authenticity could not be verified",
                            FaultCode::Authentication,
                        )
                    })?;
                return Ok(credentials.username.clone());
            }

            if request.request_type == Some(RequestType::Renew) && !credentials.username.is_empty() {
                self.authenticate_renewal(fault, request, signing)?;
                return Ok(credentials.username.clone());
            }
        }

        Err(fault.fault(
            "no supported credentials in the security header",
            "no valid authentication method was found",
            FaultCode::InvalidSecurity,
        ))
    }

    async fn authenticate_federated(&self, fault: &Fault, token: &BinarySecurityToken) -> Step<String> {
        let raw = decode_token_value(token).map_err(|e| {
            fault.fault(
                e,
                "the federated authentication token has an unsupported encoding",
                FaultCode::MessageFormat,
            )
        })?;

        let verifier = match (&self.token_verifier, token.value_type.as_str()) {
            (Some(verifier), TOKEN_VALUE_TYPE_JWT) => verifier,
            _ => {
                return Err(fault.fault(
                    format!("federated token type {} not supported", token.value_type),
                    "no valid authentication method was found",
                    FaultCode::InvalidSecurity,
                ))
            }
        };

        let jwt = String::from_utf8(raw).map_err(|e| {
            fault.fault(
                e,
                "the federated authentication token has an unsupported encoding",
                FaultCode::MessageFormat,
            )
        })?;

        let claims = verifier.verify_token(&jwt).await.map_err(|e| {
            fault.fault(
                e,
                "the users authenticity could not be verified",
                FaultCode::Authentication,
            )
        })?;

        Some(claims.upn).filter(|upn| !upn.is_empty()).ok_or_else(|| {
            fault.fault(
                "token carries no upn claim",
                "the users authenticity could not be verified",
                FaultCode::Authentication,
            )
        })
    }

    /// Renewal by a device holding a certificate this server issued.
    fn authenticate_renewal(
        &self,
        fault: &Fault,
        request: &EnrollmentRequest,
        signing: &SigningRequest,
    ) -> Step<()> {
        let device_fault = |err: &str| {
            fault.fault(
                err,
                "the devices authenticity could not be verified",
                FaultCode::Authentication,
            )
        };

        let SigningRequest::Renew(envelope) = signing else {
            return Err(device_fault("pkcs7 required for authenticating renewal"));
        };
        let signer = &envelope.signer;

        let (not_before, not_after) =
            validity(signer).map_err(|_| device_fault("pkcs7 signer validity unreadable"))?;
        let now = Utc::now();
        if !is_current(not_before, not_after, now) {
            return Err(device_fault("pkcs7 signer is expired"));
        }
        if let Err(e) = self.identity.is_issuer_identity(signer) {
            return Err(device_fault(&format!("the signer was not a trusted certificate: {}", e)));
        }
        if self.config.enforce_renewal_window
            && !renewal_window_open(not_after, now, self.config.renewal_period_days)
        {
            return Err(fault.advanced_fault(
                format!("certificate expires {}", not_after.to_rfc3339()),
                "the device is not eligible to renew yet",
                EnrollmentErrorType::NotEligibleToRenew,
                FaultCode::InternalServiceFault,
            ));
        }
        if common_name(signer).as_deref() != Some(request.device_id.as_str()) {
            return Err(device_fault(
                "certificate common name does not match renewal request DeviceID",
            ));
        }
        Ok(())
    }

    /// Parse the CSR and sign the device certificate. Returns the identity and client DER.
    fn issue(
        &self,
        fault: &Fault,
        csr: &[u8],
        common_name: &str,
        device_id: &str,
    ) -> Step<(Vec<u8>, Vec<u8>)> {
        let csr = parse_csr(csr).map_err(|e| {
            fault.fault(
                e,
                "the binary security token could not be parsed",
                FaultCode::InternalServiceFault,
            )
        })?;

        let internal = |e: MdmError| {
            fault.fault(
                e,
                "the management server encountered an internal fault",
                FaultCode::EnrollmentServer,
            )
        };

        let (issuer, issuer_key) = self.identity.issuer_identity().map_err(internal)?;
        let template = CertificateTemplate {
            common_name: common_name.to_string(),
            device_id: device_id.to_string(),
            validity_days: self.config.certificate_validity_days,
            max_jitter_minutes: self.config.max_not_before_jitter_minutes,
        };
        let client = sign_csr(&issuer, &issuer_key, &csr, &template).map_err(internal)?;

        let root_der = issuer.to_der().map_err(|e| internal(e.into()))?;
        let client_der = client.to_der().map_err(|e| internal(e.into()))?;
        Ok((root_der, client_der))
    }

    fn dm_client(&self, device_id: &str) -> Characteristic {
        wap::dm_client(
            &self.settings.provider_id,
            vec![
                Parameter::string("EntDMID", device_id),
                Parameter::string("HelpWebsite", self.settings.support_website.as_str()),
                Parameter::string("SyncApplicationVersion", "3.0"),
            ],
            vec![
                wap::default_poll(),
                Characteristic::new("CustomEnrollmentCompletePage").with_params([
                    Parameter::string("Title", self.config.enrollment_complete_title.as_str()),
                    Parameter::string("BodyText", self.config.enrollment_complete_body.as_str()),
                ]),
            ],
        )
    }
}

/// `RequestSecurityTokenResponseCollection` carrying the provisioning document.
fn token_response(provisioning_doc_base64: String) -> Element {
    Element::new("RequestSecurityTokenResponseCollection")
        .with_attr("xmlns", WS_TRUST_NS)
        .with_child(
            Element::new("RequestSecurityTokenResponse")
                .with_child(Element::leaf("TokenType", DEVICE_ENROLLMENT_TOKEN_TYPE))
                .with_child(Element::new("DispositionMessage").with_attr("xmlns", ENROLLMENT_NS))
                .with_child(
                    Element::new("RequestedSecurityToken").with_child(
                        Element::leaf("BinarySecurityToken", provisioning_doc_base64)
                            .with_attr("ValueType", PROVISION_DOC_VALUE_TYPE)
                            .with_attr("EncodingType", TOKEN_ENCODING_BASE64)
                            .with_attr("xmlns", WSSE_NS),
                    ),
                )
                .with_child(Element::leaf("RequestID", "0").with_attr("xmlns", ENROLLMENT_NS)),
        )
}
