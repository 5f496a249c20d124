//! Error types and the SOAP fault taxonomy for the MDM server.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MDM server errors.
#[derive(Error, Debug)]
pub enum MdmError {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("XML encoding error: {0}")]
    XmlEncode(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid SyncML message: {0}")]
    InvalidSyncMl(String),

    #[error("Token decode error: {0}")]
    TokenDecode(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Federated token error: {0}")]
    Federation(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which party a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Causer {
    Sender,
    Receiver,
}

impl Causer {
    /// Wire value used in `s:Code/s:Value`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "s:Sender",
            Self::Receiver => "s:Receiver",
        }
    }
}

/// Fault codes returned by the SOAP endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// Malformed or unsupported token or body encoding
    MessageFormat,
    /// Principal or device could not be verified
    Authentication,
    /// Principal verified but not permitted
    Authorization,
    /// Certificate request invalid
    CertificateRequest,
    /// Internal issuance failure
    EnrollmentServer,
    /// Generic internal error
    InternalServiceFault,
    /// No usable authentication method
    InvalidSecurity,
    /// Wrong action URI for the endpoint
    ActionMismatch,
    /// Wrong destination server or URL
    EndpointUnavailable,
}

impl FaultCode {
    /// Get the wire value for this fault code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageFormat => "s:MessageFormat",
            Self::Authentication => "s:Authentication",
            Self::Authorization => "s:Authorization",
            Self::CertificateRequest => "s:CertificateRequest",
            Self::EnrollmentServer => "s:EnrollmentServer",
            Self::InternalServiceFault => "a:InternalServiceFault",
            Self::InvalidSecurity => "a:InvalidSecurity",
            Self::ActionMismatch => "a:ActionMismatch",
            Self::EndpointUnavailable => "a:EndpointUnavailable",
        }
    }

    /// The party the fault is attributed to.
    pub fn causer(&self) -> Causer {
        match self {
            Self::MessageFormat
            | Self::Authentication
            | Self::Authorization
            | Self::CertificateRequest
            | Self::EnrollmentServer
            | Self::InvalidSecurity => Causer::Receiver,
            Self::InternalServiceFault | Self::ActionMismatch | Self::EndpointUnavailable => {
                Causer::Sender
            }
        }
    }

    /// Whether the code lives in the WCF dispatcher namespace (`a:` prefix).
    pub fn is_dispatcher_code(&self) -> bool {
        self.as_str().starts_with("a:")
    }
}

/// Error types understood by the Windows enrollment client in advanced faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentErrorType {
    InvalidEnrollmentData,
    DeviceNotSupported,
    NotEligibleToRenew,
    InMaintenance,
}

impl EnrollmentErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidEnrollmentData => "InvalidEnrollmentData",
            Self::DeviceNotSupported => "DeviceNotSupported",
            Self::NotEligibleToRenew => "NotEligibleToRenew",
            Self::InMaintenance => "InMaintenance",
        }
    }
}

/// Violation codes for management session header checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationCode {
    /// VerDTD is not 1.2
    UnsupportedVersion,
    /// VerProto is not DM/1.2
    UnsupportedProtocol,
    /// Declared target does not match the request URL
    TargetMismatch,
    /// Source LocURI missing
    MissingSource,
    /// No client certificate presented
    MissingClientCertificate,
    /// Client certificate CN differs from the source LocURI
    CertificateDeviceMismatch,
    /// Bearer token could not be verified
    InvalidBearerToken,
    /// Platform query parameter unexpected
    UnsupportedPlatform,
}

impl ViolationCode {
    /// Get the string code for this violation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            Self::TargetMismatch => "TARGET_MISMATCH",
            Self::MissingSource => "MISSING_SOURCE",
            Self::MissingClientCertificate => "MISSING_CLIENT_CERTIFICATE",
            Self::CertificateDeviceMismatch => "CERTIFICATE_DEVICE_MISMATCH",
            Self::InvalidBearerToken => "INVALID_BEARER_TOKEN",
            Self::UnsupportedPlatform => "UNSUPPORTED_PLATFORM",
        }
    }

    /// SyncML status reported on the header when the violation blocks the
    /// exchange. `None` for violations that are only ever logged.
    pub fn syncml_status(&self) -> Option<&'static str> {
        match self {
            Self::UnsupportedVersion => Some("505"),
            Self::UnsupportedProtocol => Some("513"),
            Self::TargetMismatch => Some("404"),
            Self::MissingSource => Some("400"),
            Self::MissingClientCertificate => Some("401"),
            Self::CertificateDeviceMismatch => Some("403"),
            Self::InvalidBearerToken => Some("401"),
            Self::UnsupportedPlatform => None,
        }
    }
}

/// A violation detected while validating a management session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Violation code
    pub code: ViolationCode,
    /// Human-readable message
    pub message: String,
}

impl Violation {
    /// Create a new violation.
    pub fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
