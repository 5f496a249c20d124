//! Certificate enrollment policy endpoint (MS-XCEP).
//!
//! The answer is always the same single policy: a 4096-bit key and SHA-256.
//! Optional XCEP fields are sent as `xsi:nil` rather than omitted because the
//! Windows client treats the two differently.

use crate::error::FaultCode;
use crate::fault::Fault;
use crate::soap::{
    soap_response, without_query, RequestEnvelope, ResponseEnvelope, ENROLLMENT_POLICY_NS,
    POLICY_ACTION, POLICY_RESPONSE_ACTION,
};
use crate::xml::Element;
use axum::http::StatusCode;
use axum::response::Response;

pub const POLICY_ID: &str = "zentinel-identity";
pub const POLICY_FRIENDLY_NAME: &str = "Zentinel Identity Certificate Policy";
pub const MINIMAL_KEY_LENGTH: u32 = 4096;
pub const SHA256_OID: &str = "2.16.840.1.101.3.4.2.1";

/// Handle a `GetPolicies` request received at `request_url`.
pub fn get_policies(request_url: &str, body: &[u8]) -> Response {
    let mut fault = Fault::new("policy", POLICY_RESPONSE_ACTION);

    let envelope = match RequestEnvelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return fault.fault(e, "the request could not be parsed", FaultCode::InternalServiceFault)
        }
    };
    fault.relate_to(envelope.relates_to());

    if envelope.header.action != POLICY_ACTION {
        return fault.fault(
            "the request's action is not supported by the endpoint",
            "the request was not destined for this endpoint",
            FaultCode::ActionMismatch,
        );
    }
    if without_query(request_url) != without_query(&envelope.header.to) {
        return fault.fault(
            format!("the request was destined for {}", envelope.header.to),
            "the request was not destined for this server",
            FaultCode::EndpointUnavailable,
        );
    }

    let response = ResponseEnvelope::new(
        POLICY_RESPONSE_ACTION,
        Some(envelope.relates_to()),
        policies_response(),
    )
    .with_schema_namespaces();

    match response.encode() {
        Ok(xml) => soap_response(StatusCode::OK, xml),
        Err(e) => fault.fault(
            e,
            "an internal fault occurred marshalling the response body",
            FaultCode::InternalServiceFault,
        ),
    }
}

/// The `GetPoliciesResponse` payload.
pub fn policies_response() -> Element {
    let private_key_attributes = Element::new("privateKeyAttributes")
        .with_child(Element::leaf("minimalKeyLength", MINIMAL_KEY_LENGTH.to_string()))
        .with_children(
            ["keySpec", "keyUsageProperty", "permissions", "algorithmOIDReference", "cryptoProviders"]
                .into_iter()
                .map(Element::nil),
        );

    let attributes = Element::new("attributes")
        .with_child(Element::leaf("policySchema", "3"))
        .with_child(private_key_attributes)
        .with_children(
            ["supersededPolicies", "privateKeyFlags", "subjectNameFlags", "enrollmentFlags", "generalFlags"]
                .into_iter()
                .map(Element::nil),
        )
        .with_child(Element::leaf("hashAlgorithmOIDReference", "0"))
        .with_children(
            ["rARequirements", "keyArchivalAttributes", "extensions"]
                .into_iter()
                .map(Element::nil),
        );

    let policy = Element::new("policy")
        .with_child(Element::leaf("policyOIDReference", "0"))
        .with_child(Element::nil("cAs"))
        .with_child(attributes);

    Element::new("GetPoliciesResponse")
        .with_attr("xmlns", ENROLLMENT_POLICY_NS)
        .with_child(
            Element::new("response")
                .with_child(Element::leaf("policyID", POLICY_ID))
                .with_child(Element::leaf("policyFriendlyName", POLICY_FRIENDLY_NAME))
                .with_child(Element::nil("nextUpdateHours"))
                .with_child(Element::nil("policiesNotChanged"))
                .with_child(Element::new("policies").with_child(policy)),
        )
        .with_child(Element::new("cAs"))
        .with_child(
            Element::new("oIDs")
                .with_child(Element::leaf("policyOIDReference", "0"))
                .with_child(Element::leaf("defaultName", "szOID_OIWSEC_SHA256"))
                .with_child(Element::leaf("group", "2"))
                .with_child(Element::leaf("value", SHA256_OID)),
        )
}
