//! Request validation for the management session and enrollment context.

use crate::config::{FailAction, ManagementConfig};
use crate::error::{Violation, ViolationCode};
use crate::identity::common_name;
use crate::soap::without_query;
use crate::syncml::{SyncHeader, VER_DTD, VER_PROTO};
use glob::Pattern;
use openssl::x509::X509Ref;
use tracing::warn;

/// Result of management session validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Violations found
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    /// Check if any violations were found.
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Add a violation.
    pub fn add_violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    /// SyncML status to answer with, if the exchange should stop here.
    pub fn blocking_status(&self, fail_action: FailAction) -> Option<&'static str> {
        match fail_action {
            FailAction::Allow => None,
            FailAction::Block => self.violations.iter().find_map(|v| v.code.syncml_status()),
        }
    }
}

/// What the transport knows about a management request.
#[derive(Clone, Copy, Default)]
pub struct RequestFacts<'a> {
    /// Absolute request URL
    pub request_url: &'a str,
    /// `Platform` query parameter
    pub platform: Option<&'a str>,
    /// Verified client certificate
    pub peer_certificate: Option<&'a X509Ref>,
}

impl std::fmt::Debug for RequestFacts<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFacts")
            .field("request_url", &self.request_url)
            .field("platform", &self.platform)
            .field("peer_certificate", &self.peer_certificate.map(|_| "X509"))
            .finish()
    }
}

/// Validates SyncML headers against the transport.
pub struct ManagementValidator {
    config: ManagementConfig,
}

impl ManagementValidator {
    /// Create a new validator with configuration.
    pub fn new(config: ManagementConfig) -> Self {
        Self { config }
    }

    pub fn fail_action(&self) -> FailAction {
        self.config.fail_action
    }

    /// Validate a message header.
    pub fn validate(&self, header: &SyncHeader, facts: &RequestFacts<'_>) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_header(header, facts, &mut result);
        self.validate_certificate(header, facts, &mut result);
        self.validate_platform(facts, &mut result);

        for violation in &result.violations {
            warn!(
                code = violation.code.as_str(),
                device_id = %header.source_uri,
                "{}",
                violation.message
            );
        }
        result
    }

    fn validate_header(
        &self,
        header: &SyncHeader,
        facts: &RequestFacts<'_>,
        result: &mut ValidationResult,
    ) {
        if header.ver_dtd != VER_DTD {
            result.add_violation(Violation::new(
                ViolationCode::UnsupportedVersion,
                format!("VerDTD {} not supported", header.ver_dtd),
            ));
        }

        if header.ver_proto != VER_PROTO {
            result.add_violation(Violation::new(
                ViolationCode::UnsupportedProtocol,
                format!("VerProto {} not supported", header.ver_proto),
            ));
        }

        if without_query(facts.request_url) != without_query(&header.target_uri) {
            result.add_violation(Violation::new(
                ViolationCode::TargetMismatch,
                format!(
                    "Target {} does not match request URL {}",
                    header.target_uri, facts.request_url
                ),
            ));
        }

        if header.source_uri.is_empty() {
            result.add_violation(Violation::new(
                ViolationCode::MissingSource,
                "Source LocURI is missing",
            ));
        }
    }

    fn validate_certificate(
        &self,
        header: &SyncHeader,
        facts: &RequestFacts<'_>,
        result: &mut ValidationResult,
    ) {
        if !self.config.require_client_certificate {
            return;
        }

        match facts.peer_certificate {
            None => result.add_violation(Violation::new(
                ViolationCode::MissingClientCertificate,
                "No authentication certificate provided",
            )),
            Some(cert) => {
                let cn = common_name(cert).unwrap_or_default();
                if cn != header.source_uri {
                    result.add_violation(Violation::new(
                        ViolationCode::CertificateDeviceMismatch,
                        format!(
                            "Certificate subject {} does not match device {}",
                            cn, header.source_uri
                        ),
                    ));
                }
            }
        }
    }

    fn validate_platform(&self, facts: &RequestFacts<'_>, result: &mut ValidationResult) {
        if let Some(required) = &self.config.required_platform {
            if facts.platform != Some(required.as_str()) {
                result.add_violation(Violation::new(
                    ViolationCode::UnsupportedPlatform,
                    format!("Unexpected device platform {:?}", facts.platform),
                ));
            }
        }
    }
}

/// Matches enrollment `DeviceType` values against configured patterns.
pub struct DeviceTypeMatcher {
    patterns: Vec<Pattern>,
}

impl DeviceTypeMatcher {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|pattern| match Pattern::new(pattern) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Ignoring invalid device type pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_supported(&self, device_type: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(device_type))
    }
}
