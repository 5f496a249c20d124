//! SOAP 1.2 envelope handling with WS-Addressing and WS-Security headers.

use crate::error::MdmError;
use crate::xml::{self, Element};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// SOAP namespace URIs.
pub const SOAP_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const ADDRESSING_NS: &str = "http://www.w3.org/2005/08/addressing";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
pub const DIAGNOSTICS_NS: &str = "http://schemas.microsoft.com/2004/09/ServiceModel/Diagnostics";
pub const WS_TRUST_NS: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512";
pub const ENROLLMENT_NS: &str = "http://schemas.microsoft.com/windows/pki/2009/01/enrollment";
pub const ENROLLMENT_POLICY_NS: &str =
    "http://schemas.microsoft.com/windows/pki/2009/01/enrollmentpolicy";
pub const DISCOVERY_NS: &str = "http://schemas.microsoft.com/windows/management/2012/01/enrollment";

/// Action URIs for each endpoint.
pub const DISCOVER_ACTION: &str =
    "http://schemas.microsoft.com/windows/management/2012/01/enrollment/IDiscoveryService/Discover";
pub const DISCOVER_RESPONSE_ACTION: &str =
    "http://schemas.microsoft.com/windows/management/2012/01/enrollment/IDiscoveryService/DiscoverResponse";
pub const POLICY_ACTION: &str =
    "http://schemas.microsoft.com/windows/pki/2009/01/enrollmentpolicy/IPolicy/GetPolicies";
pub const POLICY_RESPONSE_ACTION: &str =
    "http://schemas.microsoft.com/windows/pki/2009/01/enrollmentpolicy/IPolicy/GetPoliciesResponse";
pub const ENROLLMENT_ACTION: &str = "http://schemas.microsoft.com/windows/pki/2009/01/enrollment/RST/wstep";
pub const ENROLLMENT_RESPONSE_ACTION: &str =
    "http://schemas.microsoft.com/windows/pki/2009/01/enrollment/RSTRC/wstep";

/// Binary security token value and encoding types.
pub const TOKEN_VALUE_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
pub const TOKEN_VALUE_TYPE_PKCS7: &str =
    "http://schemas.microsoft.com/windows/pki/2009/01/enrollment#PKCS7";
pub const TOKEN_VALUE_TYPE_PKCS10: &str =
    "http://schemas.microsoft.com/windows/pki/2009/01/enrollment#PKCS10";
pub const TOKEN_ENCODING_BASE64: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd#base64binary";

pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// WS-Security `UsernameToken`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsernameToken {
    pub username: String,
    pub password: String,
}

/// WS-Security `BinarySecurityToken`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinarySecurityToken {
    /// ValueType attribute
    pub value_type: String,
    /// EncodingType attribute
    pub encoding_type: String,
    /// Raw text content
    pub value: String,
}

impl BinarySecurityToken {
    pub fn from_element(el: &Element) -> Self {
        Self {
            value_type: el.attr("ValueType").unwrap_or_default().to_string(),
            encoding_type: el.attr("EncodingType").unwrap_or_default().to_string(),
            value: el.text().to_string(),
        }
    }
}

/// WS-Security header block.
#[derive(Debug, Clone, Default)]
pub struct Security {
    pub username_token: Option<UsernameToken>,
    pub binary_security_token: Option<BinarySecurityToken>,
}

/// Parsed request header.
#[derive(Debug, Clone, Default)]
pub struct RequestHeader {
    /// WS-Addressing action
    pub action: String,
    /// WS-Addressing message ID
    pub message_id: String,
    /// Declared destination URL
    pub to: String,
    /// Reply address
    pub reply_to: Option<String>,
    /// WS-Security block
    pub security: Option<Security>,
}

/// A decoded SOAP request.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub header: RequestHeader,
    /// The `s:Body` element
    pub body: Element,
}

impl RequestEnvelope {
    /// Decode a SOAP 1.2 request envelope.
    pub fn decode(data: &[u8]) -> Result<Self, MdmError> {
        let root = xml::parse(data)?;
        if root.local_name() != "Envelope" {
            return Err(MdmError::InvalidEnvelope(format!(
                "Expected Envelope, found {}",
                root.local_name()
            )));
        }

        let header_el = root
            .find("Header")
            .ok_or_else(|| MdmError::InvalidEnvelope("Missing Header".to_string()))?;
        let body = root
            .find("Body")
            .cloned()
            .ok_or_else(|| MdmError::InvalidEnvelope("Missing Body".to_string()))?;

        let security = header_el.find("Security").map(|sec| Security {
            username_token: sec.find("UsernameToken").map(|token| UsernameToken {
                username: token.text_at(&["Username"]).unwrap_or_default().to_string(),
                password: token.text_at(&["Password"]).unwrap_or_default().to_string(),
            }),
            binary_security_token: sec
                .find("BinarySecurityToken")
                .map(BinarySecurityToken::from_element),
        });

        let header = RequestHeader {
            action: header_el.text_at(&["Action"]).unwrap_or_default().trim().to_string(),
            message_id: header_el
                .text_at(&["MessageID"])
                .unwrap_or_default()
                .trim()
                .to_string(),
            to: header_el.text_at(&["To"]).unwrap_or_default().trim().to_string(),
            reply_to: header_el
                .text_at(&["ReplyTo", "Address"])
                .map(|s| s.trim().to_string()),
            security,
        };

        Ok(Self { header, body })
    }

    /// The first element inside `s:Body`.
    pub fn payload(&self) -> Option<&Element> {
        self.body.children.first()
    }

    /// `RelatesTo` value every response to this request must carry.
    pub fn relates_to(&self) -> String {
        relates_to(&self.header.message_id)
    }
}

pub fn relates_to(message_id: &str) -> String {
    format!("urn:uuid:{}", message_id)
}

/// Strip the query string from a URL.
pub fn without_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// A SOAP response ready to be written.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    /// Response action URI
    pub action: String,
    /// `RelatesTo` value, omitted when the request could not be decoded
    pub relates_to: Option<String>,
    /// Body payload
    pub payload: Element,
    /// Declare xsi/xsd on the body element
    pub declare_schema_namespaces: bool,
}

impl ResponseEnvelope {
    pub fn new(action: impl Into<String>, relates_to: Option<String>, payload: Element) -> Self {
        Self {
            action: action.into(),
            relates_to,
            payload,
            declare_schema_namespaces: false,
        }
    }

    pub fn with_schema_namespaces(mut self) -> Self {
        self.declare_schema_namespaces = true;
        self
    }

    /// Build the envelope element tree.
    pub fn to_element(&self) -> Element {
        let activity_id = uuid::Uuid::new_v4().to_string();

        let mut header = Element::new("s:Header")
            .with_child(
                Element::leaf("a:Action", self.action.as_str()).with_attr("s:mustUnderstand", "1"),
            )
            .with_child(
                Element::leaf("ActivityId", activity_id.as_str())
                    .with_attr("CorrelationId", activity_id.as_str())
                    .with_attr("xmlns", DIAGNOSTICS_NS),
            );
        if let Some(relates_to) = &self.relates_to {
            header.push(Element::leaf("a:RelatesTo", relates_to.as_str()));
        }

        let mut body = Element::new("s:Body");
        if self.declare_schema_namespaces {
            body = body.with_attr("xmlns:xsi", XSI_NS).with_attr("xmlns:xsd", XSD_NS);
        }
        body.push(self.payload.clone());

        Element::new("s:Envelope")
            .with_attr("xmlns:s", SOAP_NS)
            .with_attr("xmlns:a", ADDRESSING_NS)
            .with_child(header)
            .with_child(body)
    }

    /// Serialize the envelope.
    pub fn encode(&self) -> Result<String, MdmError> {
        self.to_element().to_xml()
    }
}

/// Write a SOAP body with the SOAP content type and an explicit length.
pub fn soap_response(status: StatusCode, body: String) -> Response {
    let length = body.len().to_string();
    (
        status,
        [
            (header::CONTENT_TYPE, SOAP_CONTENT_TYPE.to_string()),
            (header::CONTENT_LENGTH, length),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENROLL_REQUEST: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:u="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd" xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
  <s:Header>
    <a:Action s:mustUnderstand="1">
      http://schemas.microsoft.com/windows/pki/2009/01/enrollment/RST/wstep
    </a:Action>
    <a:MessageID>urn:uuid:0d5a1441-5891-453b-becf-a2e5f6ea3749</a:MessageID>
    <a:ReplyTo><a:Address>http://www.w3.org/2005/08/addressing/anonymous</a:Address></a:ReplyTo>
    <a:To s:mustUnderstand="1">https://mdm.example.com/EnrollmentServer/Enrollment.svc</a:To>
    <wsse:Security s:mustUnderstand="1">
      <wsse:UsernameToken u:Id="uuid-1">
        <wsse:Username>user@example.com</wsse:Username>
        <wsse:Password wsse:Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText">secret</wsse:Password>
      </wsse:UsernameToken>
    </wsse:Security>
  </s:Header>
  <s:Body><Payload/></s:Body>
</s:Envelope>"#;

    #[test]
    fn test_decode_header_fields() {
        let req = RequestEnvelope::decode(ENROLL_REQUEST.as_bytes()).unwrap();
        assert_eq!(req.header.action, ENROLLMENT_ACTION);
        assert_eq!(req.header.message_id, "urn:uuid:0d5a1441-5891-453b-becf-a2e5f6ea3749");
        assert_eq!(req.header.to, "https://mdm.example.com/EnrollmentServer/Enrollment.svc");
        assert_eq!(
            req.header.reply_to.as_deref(),
            Some("http://www.w3.org/2005/08/addressing/anonymous")
        );
        let token = req.header.security.as_ref().unwrap().username_token.as_ref().unwrap();
        assert_eq!(token.username, "user@example.com");
        assert_eq!(token.password, "secret");
        assert_eq!(req.payload().unwrap().local_name(), "Payload");
    }

    #[test]
    fn test_decode_rejects_non_envelope() {
        assert!(matches!(
            RequestEnvelope::decode(b"<Foo/>"),
            Err(MdmError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_relates_to_prefix() {
        let req = RequestEnvelope::decode(ENROLL_REQUEST.as_bytes()).unwrap();
        assert_eq!(
            req.relates_to(),
            "urn:uuid:urn:uuid:0d5a1441-5891-453b-becf-a2e5f6ea3749"
        );
    }

    #[test]
    fn test_without_query() {
        assert_eq!(without_query("https://a/b?c=d"), "https://a/b");
        assert_eq!(without_query("https://a/b"), "https://a/b");
    }

    #[test]
    fn test_encode_response_envelope() {
        let res = ResponseEnvelope::new(
            DISCOVER_RESPONSE_ACTION,
            Some(relates_to("abc")),
            Element::new("DiscoverResponse"),
        )
        .with_schema_namespaces();
        let xml = res.encode().unwrap();
        assert!(xml.starts_with(r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope""#));
        assert!(xml.contains(r#"<a:Action s:mustUnderstand="1">http://schemas.microsoft.com/windows/management/2012/01/enrollment/IDiscoveryService/DiscoverResponse</a:Action>"#));
        assert!(xml.contains("<a:RelatesTo>urn:uuid:abc</a:RelatesTo>"));
        assert!(xml.contains(r#"<s:Body xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#));

        let parsed = xml::parse(xml.as_bytes()).unwrap();
        let activity = parsed.path(&["Header", "ActivityId"]).unwrap();
        assert_eq!(activity.attr("CorrelationId"), Some(activity.text()));
    }
}
