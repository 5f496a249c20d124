//! WAP provisioning documents.
//!
//! The Windows management client reads these by position and characteristic
//! type rather than by schema, so the builders below emit a fixed nesting:
//!
//! - `CertificateStore/Root/System/{thumbprint}`
//! - `CertificateStore/My/{store}/{thumbprint}` with a sibling `PrivateKeyContainer`
//! - `CertificateStore/My/WSTEP/Renew`
//! - `APPLICATION` with two `APPAUTH` blocks
//! - `DMClient/Provider/{provider id}`

use crate::error::MdmError;
use crate::xml::Element;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::time::Duration;

/// Default ROBO renewal period in days.
pub const ROBO_RENEW_PERIOD: u32 = 42;
/// Default ROBO retry interval in days.
pub const ROBO_RETRY_INTERVAL: u32 = 4;

/// A `parm` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: Option<String>,
    pub datatype: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            datatype: None,
        }
    }

    /// A parameter carrying only its name.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            datatype: None,
        }
    }

    pub fn integer(name: impl Into<String>, value: impl ToString) -> Self {
        Self::new(name, value.to_string()).typed("integer")
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, value.to_string()).typed("boolean")
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value).typed("string")
    }

    fn typed(mut self, datatype: &str) -> Self {
        self.datatype = Some(datatype.to_string());
        self
    }

    fn to_element(&self) -> Element {
        let mut el = Element::new("parm").with_attr("name", self.name.as_str());
        if let Some(value) = &self.value {
            el = el.with_attr("value", value.as_str());
        }
        if let Some(datatype) = &self.datatype {
            el = el.with_attr("datatype", datatype.as_str());
        }
        el
    }
}

/// A `characteristic` element: parameters first, then nested characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub kind: String,
    pub params: Vec<Parameter>,
    pub children: Vec<Characteristic>,
}

impl Characteristic {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: vec![],
            children: vec![],
        }
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = Parameter>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Characteristic>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_child(mut self, child: Characteristic) -> Self {
        self.children.push(child);
        self
    }

    /// Follow a path of characteristic types.
    pub fn find_path(&self, path: &[&str]) -> Option<&Characteristic> {
        path.iter()
            .try_fold(self, |c, kind| c.children.iter().find(|child| child.kind == *kind))
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    fn to_element(&self) -> Element {
        Element::new("characteristic")
            .with_attr("type", self.kind.as_str())
            .with_children(self.params.iter().map(Parameter::to_element))
            .with_children(self.children.iter().map(Characteristic::to_element))
    }
}

/// The `wap-provisioningdoc` root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningDoc {
    pub version: String,
    pub characteristics: Vec<Characteristic>,
}

impl ProvisioningDoc {
    pub fn new(characteristics: Vec<Characteristic>) -> Self {
        Self {
            version: "1.1".to_string(),
            characteristics,
        }
    }

    pub fn push(&mut self, characteristic: Characteristic) {
        self.characteristics.push(characteristic);
    }

    /// Top-level characteristic by type.
    pub fn find(&self, kind: &str) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.kind == kind)
    }

    pub fn to_element(&self) -> Element {
        Element::new("wap-provisioningdoc")
            .with_attr("version", self.version.as_str())
            .with_children(self.characteristics.iter().map(Characteristic::to_element))
    }

    /// UTF-8 document with XML declaration.
    pub fn to_document(&self) -> Result<String, MdmError> {
        self.to_element().to_document()
    }

    /// Base64 of the serialized document, as carried in the enrollment response.
    pub fn to_base64(&self) -> Result<String, MdmError> {
        Ok(STANDARD.encode(self.to_document()?))
    }
}

/// Uppercase hex SHA-1 of a DER certificate.
pub fn thumbprint(der: &[u8]) -> String {
    hex::encode_upper(openssl::sha::sha1(der))
}

/// ROBO renewal parameters.
#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    pub renew_period_days: u32,
    pub retry_interval_days: u32,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            renew_period_days: ROBO_RENEW_PERIOD,
            retry_interval_days: ROBO_RETRY_INTERVAL,
        }
    }
}

/// Certificate store install for the trust root and the issued client certificate.
pub fn certificate_store(
    root_der: &[u8],
    store: &str,
    client_der: &[u8],
    renewal: RenewalPolicy,
) -> Characteristic {
    let root = Characteristic::new("Root").with_child(
        Characteristic::new("System").with_child(
            Characteristic::new(thumbprint(root_der))
                .with_params([Parameter::new("EncodedCertificate", STANDARD.encode(root_der))]),
        ),
    );

    let client_store = Characteristic::new(store).with_children([
        Characteristic::new(thumbprint(client_der))
            .with_params([Parameter::new("EncodedCertificate", STANDARD.encode(client_der))]),
        Characteristic::new("PrivateKeyContainer").with_params([
            Parameter::new("KeySpec", "2"),
            Parameter::new("ContainerName", "ConfigMgrEnrollment"),
            Parameter::new("ProviderType", "1"),
        ]),
    ]);

    let renew = Characteristic::new("WSTEP").with_child(Characteristic::new("Renew").with_params([
        Parameter::boolean("ROBOSupport", true),
        Parameter::integer("RenewPeriod", renewal.renew_period_days),
        Parameter::integer("RetryInterval", renewal.retry_interval_days),
    ]));

    Characteristic::new("CertificateStore").with_children([
        root,
        Characteristic::new("My").with_children([client_store, renew]),
    ])
}

/// Management client application registration.
pub fn w7_application(
    provider_id: &str,
    name: &str,
    management_url: &str,
    ssl_client_cert_search_criteria: &str,
) -> Characteristic {
    Characteristic::new("APPLICATION")
        .with_params([
            Parameter::new("APPID", "w7"),
            Parameter::new("PROVIDER-ID", provider_id),
            Parameter::new("ADDR", management_url),
            Parameter::new("NAME", name),
            Parameter::flag("BACKCOMPATRETRYDISABLED"),
            Parameter::new("CONNRETRYFREQ", "6"),
            Parameter::new("DEFAULTENCODING", "application/vnd.syncml.dm+xml"),
            Parameter::new("INITIALBACKOFFTIME", millis(Duration::from_secs(30))),
            Parameter::new("MAXBACKOFFTIME", millis(Duration::from_secs(120))),
            Parameter::new("SSLCLIENTCERTSEARCHCRITERIA", ssl_client_cert_search_criteria),
        ])
        .with_children([
            Characteristic::new("APPAUTH").with_params([
                Parameter::new("AAUTHLEVEL", "CLIENT"),
                Parameter::new("AAUTHTYPE", "DIGEST"),
                Parameter::new("AAUTHSECRET", "dummy"),
                Parameter::new("AAUTHDATA", "nonce"),
            ]),
            Characteristic::new("APPAUTH").with_params([
                Parameter::new("AAUTHLEVEL", "APPSRV"),
                Parameter::new("AAUTHTYPE", "DIGEST"),
                Parameter::new("AAUTHNAME", "dummy"),
                Parameter::new("AAUTHSECRET", "dummy"),
                Parameter::new("AAUTHDATA", "nonce"),
            ]),
        ])
}

/// Application characteristic signalling unchanged configuration on renewal.
pub fn empty_application(provider_id: &str) -> Characteristic {
    Characteristic::new("APPLICATION").with_params([Parameter::new("PROVIDER-ID", provider_id)])
}

/// DMClient provider registration.
pub fn dm_client(
    provider_id: &str,
    params: Vec<Parameter>,
    children: Vec<Characteristic>,
) -> Characteristic {
    Characteristic::new("DMClient").with_child(
        Characteristic::new("Provider").with_child(
            Characteristic::new(provider_id)
                .with_params(params)
                .with_children(children),
        ),
    )
}

/// Default polling schedule for the DMClient provider.
pub fn default_poll() -> Characteristic {
    Characteristic::new("Poll").with_params([
        Parameter::integer("IntervalForFirstSetOfRetries", 3),
        Parameter::integer("NumberOfFirstRetries", 5),
        Parameter::integer("IntervalForSecondSetOfRetries", 15),
        Parameter::integer("NumberOfSecondRetries", 8),
        Parameter::integer("IntervalForRemainingScheduledRetries", 480),
        Parameter::integer("NumberOfRemainingScheduledRetries", 0),
        Parameter::boolean("PollOnLogin", true),
        Parameter::boolean("AllUsersPollOnFirstLogin", true),
    ])
}

fn millis(d: Duration) -> String {
    d.as_millis().to_string()
}
