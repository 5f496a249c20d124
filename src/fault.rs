//! SOAP fault construction.
//!
//! A [`Fault`] is created once per request with the response action the
//! endpoint would have answered with. Emitting a fault produces the complete
//! HTTP response, so handlers return it directly and nothing else runs.

use crate::error::{EnrollmentErrorType, FaultCode};
use crate::soap::{soap_response, ResponseEnvelope, ENROLLMENT_NS};
use crate::xml::Element;
use axum::http::StatusCode;
use axum::response::Response;
use std::fmt::Display;
use tracing::{error, warn};

const DISPATCHER_NS: &str = "http://schemas.microsoft.com/net/2005/12/windowscommunicationfoundation/dispatcher";

/// Per-request fault responder.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Label used when logging, e.g. the endpoint name
    context: &'static str,
    /// Response action of the endpoint
    action: &'static str,
    /// `RelatesTo` value, when the request got far enough to have one
    relates_to: Option<String>,
}

impl Fault {
    pub fn new(context: &'static str, action: &'static str) -> Self {
        Self {
            context,
            action,
            relates_to: None,
        }
    }

    /// Correlate subsequent faults with a decoded request.
    pub fn relate_to(&mut self, relates_to: String) {
        self.relates_to = Some(relates_to);
    }

    /// Log the error and build a fault response.
    pub fn fault(&self, err: impl Display, user_msg: &str, code: FaultCode) -> Response {
        warn!(
            context = self.context,
            causer = code.causer().as_str(),
            code = code.as_str(),
            error = %err,
            "{}",
            user_msg
        );
        self.respond(fault_body(code, user_msg, None))
    }

    /// Log the error and build a fault response carrying a
    /// `DeviceEnrollmentServiceError` detail.
    pub fn advanced_fault(
        &self,
        err: impl Display,
        user_msg: &str,
        error_type: EnrollmentErrorType,
        code: FaultCode,
    ) -> Response {
        let trace_id = uuid::Uuid::new_v4().to_string();
        warn!(
            context = self.context,
            causer = code.causer().as_str(),
            code = code.as_str(),
            error_type = error_type.as_str(),
            trace_id = %trace_id,
            error = %err,
            "{}",
            user_msg
        );
        let detail = Element::new("DeviceEnrollmentServiceError")
            .with_attr("xmlns", ENROLLMENT_NS)
            .with_child(Element::leaf("ErrorType", error_type.as_str()))
            .with_child(Element::leaf("Message", user_msg))
            .with_child(Element::leaf("TraceId", trace_id));
        self.respond(fault_body(code, user_msg, Some(detail)))
    }

    fn respond(&self, body: Element) -> Response {
        let envelope = ResponseEnvelope::new(self.action, self.relates_to.clone(), body);
        match envelope.encode() {
            Ok(xml) => soap_response(StatusCode::INTERNAL_SERVER_ERROR, xml),
            Err(e) => {
                error!(context = self.context, error = %e, "Failed to encode SOAP fault");
                soap_response(StatusCode::INTERNAL_SERVER_ERROR, String::new())
            }
        }
    }
}

/// Build the `s:Fault` element.
pub fn fault_body(code: FaultCode, reason: &str, detail: Option<Element>) -> Element {
    let mut subcode_value = Element::leaf("s:Value", code.as_str());
    if code.is_dispatcher_code() {
        subcode_value = subcode_value.with_attr("xmlns:a", DISPATCHER_NS);
    }

    let mut fault = Element::new("s:Fault")
        .with_child(
            Element::new("s:Code")
                .with_child(Element::leaf("s:Value", code.causer().as_str()))
                .with_child(Element::new("s:Subcode").with_child(subcode_value)),
        )
        .with_child(
            Element::new("s:Reason")
                .with_child(Element::leaf("s:Text", reason).with_attr("xml:lang", "en-US")),
        );

    if let Some(detail) = detail {
        fault.push(Element::new("s:Detail").with_child(detail));
    }
    fault
}
