//! Discovery endpoint.
//!
//! Tells a device whether this domain hosts a management server and where the
//! policy and enrollment endpoints live.

use crate::config::{SettingsConfig, ENROLLMENT_PATH, POLICY_PATH};
use crate::error::FaultCode;
use crate::fault::Fault;
use crate::soap::{
    soap_response, RequestEnvelope, ResponseEnvelope, DISCOVERY_NS, DISCOVER_ACTION,
    DISCOVER_RESPONSE_ACTION,
};
use crate::xml::Element;
use axum::http::StatusCode;
use axum::response::Response;
use tracing::debug;

/// Version negotiated when the device does not ask for one.
pub const DEFAULT_ENROLLMENT_VERSION: &str = "4.0";

/// Handle a `Discover` request.
pub fn discover(settings: &SettingsConfig, body: &[u8]) -> Response {
    let mut fault = Fault::new("discovery", DISCOVER_RESPONSE_ACTION);

    let envelope = match RequestEnvelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return fault.fault(e, "the request could not be parsed", FaultCode::InternalServiceFault)
        }
    };
    fault.relate_to(envelope.relates_to());

    if envelope.header.action != DISCOVER_ACTION {
        return fault.fault(
            "the request's action is not supported by the endpoint",
            "the request was not destined for this endpoint",
            FaultCode::ActionMismatch,
        );
    }

    let version = envelope
        .payload()
        .and_then(|discover| discover.text_at(&["request", "RequestVersion"]))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ENROLLMENT_VERSION);
    debug!(version = version, "Discovery request");

    let payload = Element::new("DiscoverResponse")
        .with_attr("xmlns", DISCOVERY_NS)
        .with_child(
            Element::new("DiscoverResult")
                .with_child(Element::leaf("AuthPolicy", "OnPremise"))
                .with_child(Element::leaf("EnrollmentVersion", version))
                .with_child(Element::leaf(
                    "EnrollmentPolicyServiceUrl",
                    settings.url(POLICY_PATH),
                ))
                .with_child(Element::leaf("EnrollmentServiceUrl", settings.url(ENROLLMENT_PATH))),
        );

    match ResponseEnvelope::new(DISCOVER_RESPONSE_ACTION, Some(envelope.relates_to()), payload)
        .encode()
    {
        Ok(xml) => soap_response(StatusCode::OK, xml),
        Err(e) => fault.fault(
            e,
            "an internal fault occurred marshalling the response body",
            FaultCode::InternalServiceFault,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml;

    fn request(action: &str, version: Option<&str>) -> String {
        let version = version
            .map(|v| format!("<RequestVersion>{}</RequestVersion>", v))
            .unwrap_or_default();
        format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing">
  <s:Header>
    <a:Action s:mustUnderstand="1">{action}</a:Action>
    <a:MessageID>d2d5d2a0-1a1f-4f4b-8a36-0c4c1c1e2a7b</a:MessageID>
    <a:To s:mustUnderstand="1">https://mdm.example.com/EnrollmentServer/Discovery.svc</a:To>
  </s:Header>
  <s:Body>
    <Discover xmlns="http://schemas.microsoft.com/windows/management/2012/01/enrollment">
      <request xmlns:i="http://www.w3.org/2001/XMLSchema-instance">
        <EmailAddress>user@example.com</EmailAddress>
        {version}
        <DeviceType>CIMClient_Windows</DeviceType>
      </request>
    </Discover>
  </s:Body>
</s:Envelope>"#
        )
    }

    async fn parse(response: Response) -> (StatusCode, xml::Element) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, xml::parse(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_discover_response() {
        let settings = SettingsConfig::default();
        let body = request(DISCOVER_ACTION, Some("5.0"));
        let (status, doc) = parse(discover(&settings, body.as_bytes())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            doc.text_at(&["Header", "RelatesTo"]),
            Some("urn:uuid:d2d5d2a0-1a1f-4f4b-8a36-0c4c1c1e2a7b")
        );
        assert_eq!(doc.text_at(&["Header", "Action"]), Some(DISCOVER_RESPONSE_ACTION));
        let result = doc.path(&["Body", "DiscoverResponse", "DiscoverResult"]).unwrap();
        assert_eq!(result.text_at(&["AuthPolicy"]), Some("OnPremise"));
        assert_eq!(result.text_at(&["EnrollmentVersion"]), Some("5.0"));
        assert_eq!(
            result.text_at(&["EnrollmentPolicyServiceUrl"]),
            Some("https://mdm.example.com/EnrollmentServer/Policy.svc")
        );
        assert_eq!(
            result.text_at(&["EnrollmentServiceUrl"]),
            Some("https://mdm.example.com/EnrollmentServer/Enrollment.svc")
        );
    }

    #[tokio::test]
    async fn test_discover_defaults_version() {
        let settings = SettingsConfig::default();
        let body = request(DISCOVER_ACTION, None);
        let (_, doc) = parse(discover(&settings, body.as_bytes())).await;
        assert_eq!(
            doc.text_at(&["Body", "DiscoverResponse", "DiscoverResult", "EnrollmentVersion"]),
            Some(DEFAULT_ENROLLMENT_VERSION)
        );
    }

    #[tokio::test]
    async fn test_discover_action_mismatch() {
        let settings = SettingsConfig::default();
        let body = request("http://example.com/Wrong", None);
        let (status, doc) = parse(discover(&settings, body.as_bytes())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(doc.text_at(&["Body", "Fault", "Code", "Value"]), Some("s:Sender"));
        assert_eq!(
            doc.text_at(&["Body", "Fault", "Code", "Subcode", "Value"]),
            Some("a:ActionMismatch")
        );
    }

    #[tokio::test]
    async fn test_discover_unparseable() {
        let settings = SettingsConfig::default();
        let (status, doc) = parse(discover(&settings, b"<nope")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(doc.path(&["Header", "RelatesTo"]).is_none());
    }
}
