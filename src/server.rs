//! HTTP surface.
//!
//! Routes the enrollment and management endpoints, enforces per content type
//! body limits and extracts what the protocol handlers need from the request:
//! the URL the device addressed and the client certificate presented upstream.

use crate::config::{
    MdmConfig, SettingsConfig, DISCOVERY_PATH, ENROLLMENT_PATH, MANAGEMENT_PATH, POLICY_PATH,
    TERMS_OF_SERVICE_PATH,
};
use crate::discovery::discover;
use crate::enrollment::EnrollmentService;
use crate::identity::CertificateAuthority;
use crate::manage::ManagementHandler;
use crate::policy::get_policies;
use crate::service::{
    CredentialVerifier, DeviceRegistry, LoggingDeviceRegistry, ManagementPolicy,
    NonEmptyCredentials, ReportingPolicy, TokenVerifier,
};
use crate::syncml::{SYNCML_CONTENT_TYPE, SYNCML_WBXML_CONTENT_TYPE};
use crate::validator::{ManagementValidator, RequestFacts};
use axum::body::{Body, Bytes};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use openssl::x509::X509;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const GENERIC_ALERT_HEADER: &str = "MDM-GenericAlert";

/// Client certificate handed over by an embedding TLS acceptor.
#[derive(Debug, Clone)]
pub struct PeerCertificate(pub X509);

/// Request counters.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub requests_processed: AtomicU64,
    pub faults_emitted: AtomicU64,
    pub unrecognized_commands: AtomicU64,
}

impl ServerMetrics {
    fn record(&self, response: &Response) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
            self.faults_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn log_summary(&self) {
        info!(
            requests_processed = self.requests_processed.load(Ordering::Relaxed),
            faults_emitted = self.faults_emitted.load(Ordering::Relaxed),
            unrecognized_commands = self.unrecognized_commands.load(Ordering::Relaxed),
            "Request counters"
        );
    }
}

/// Collaborators the server delegates decisions to.
#[derive(Clone)]
pub struct Collaborators {
    pub policy: Arc<dyn ManagementPolicy>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub token_verifier: Option<Arc<dyn TokenVerifier>>,
}

impl Collaborators {
    /// Reporting policy, logging registry and non-empty credential check.
    pub fn defaults(config: &MdmConfig, token_verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        Self {
            policy: Arc::new(ReportingPolicy::new(config.management.inventory_uris.clone())),
            registry: Arc::new(LoggingDeviceRegistry),
            credentials: Arc::new(NonEmptyCredentials),
            token_verifier,
        }
    }
}

/// State shared by all handlers.
pub struct AppState {
    settings: SettingsConfig,
    terms_of_service_enabled: bool,
    authority: Arc<CertificateAuthority>,
    enrollment: EnrollmentService,
    management: ManagementHandler,
    pub metrics: ServerMetrics,
}

impl AppState {
    pub fn new(
        config: &MdmConfig,
        authority: Arc<CertificateAuthority>,
        collaborators: Collaborators,
    ) -> Self {
        let enrollment = EnrollmentService::new(
            config.settings.clone(),
            config.enrollment.clone(),
            authority.clone(),
            collaborators.registry,
            collaborators.credentials,
            collaborators.token_verifier.clone(),
        );
        let management = ManagementHandler::new(
            ManagementValidator::new(config.management.clone()),
            collaborators.policy,
            collaborators.token_verifier,
            config.settings.max_syncml_body_size,
        );
        Self {
            settings: config.settings.clone(),
            terms_of_service_enabled: config.enrollment.terms_of_service_enabled,
            authority,
            enrollment,
            management,
            metrics: ServerMetrics::default(),
        }
    }

    /// URL the device addressed, rebuilt from forwarding headers.
    fn request_url(&self, headers: &HeaderMap, uri: &Uri) -> String {
        let scheme = headers
            .get("X-Forwarded-Proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("https");
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.settings.domain);
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        format!("{}://{}{}", scheme, host, path)
    }

    /// Trusted client certificate, from the TLS acceptor or the forwarding header.
    fn client_certificate(
        &self,
        headers: &HeaderMap,
        peer: Option<PeerCertificate>,
    ) -> Option<X509> {
        let cert = match peer {
            Some(PeerCertificate(cert)) => cert,
            None => {
                let value = headers
                    .get(self.settings.client_cert_header.as_str())?
                    .to_str()
                    .ok()?;
                let pem = match urlencoding::decode(value) {
                    Ok(pem) => pem,
                    Err(e) => {
                        warn!(error = %e, "Client certificate header is not URL-escaped");
                        return None;
                    }
                };
                match X509::from_pem(pem.as_bytes()) {
                    Ok(cert) => cert,
                    Err(e) => {
                        warn!(error = %e, "Client certificate header is not a PEM certificate");
                        return None;
                    }
                }
            }
        };

        match self.authority.verify_trust_chain(&cert) {
            Ok(()) => Some(cert),
            Err(e) => {
                warn!(error = %e, "Client certificate rejected");
                None
            }
        }
    }
}

/// Build the router for all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route(DISCOVERY_PATH, get(discovery_probe).post(discovery))
        .route(POLICY_PATH, post(policy))
        .route(ENROLLMENT_PATH, post(enrollment))
        .route(TERMS_OF_SERVICE_PATH, get(terms_of_service))
        .route(MANAGEMENT_PATH, post(manage))
        .layer(middleware::from_fn_with_state(state.clone(), limit_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cap the body by content type and reject oversized requests with 413.
async fn limit_body(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let media_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let limit = match media_type.as_str() {
        "application/soap+xml" => state.settings.max_soap_body_size,
        SYNCML_CONTENT_TYPE | SYNCML_WBXML_CONTENT_TYPE => state.settings.max_syncml_body_size,
        _ => 0,
    };

    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        debug!(media_type = %media_type, limit = limit, "Request body too large");
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            debug!(media_type = %media_type, limit = limit, "Request body too large");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let mut response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

async fn index(State(state): State<Arc<AppState>>) -> Response {
    match &state.settings.index_website {
        Some(url) => match HeaderValue::from_str(url) {
            Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
            Err(e) => {
                warn!(error = %e, "Index website is not a valid header value");
                StatusCode::NOT_FOUND.into_response()
            }
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn discovery_probe() -> StatusCode {
    StatusCode::OK
}

async fn discovery(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let response = discover(&state.settings, &body);
    state.metrics.record(&response);
    response
}

async fn policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let response = get_policies(&state.request_url(&headers, &uri), &body);
    state.metrics.record(&response);
    response
}

async fn enrollment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let response = state
        .enrollment
        .enroll(&state.request_url(&headers, &uri), &body)
        .await;
    state.metrics.record(&response);
    response
}

#[derive(Debug, Deserialize)]
struct TermsQuery {
    redirect_uri: Option<String>,
    #[serde(rename = "client-request-id")]
    client_request_id: Option<String>,
}

async fn terms_of_service(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TermsQuery>,
) -> Response {
    if !state.terms_of_service_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(redirect_uri) = query.redirect_uri else {
        return (StatusCode::BAD_REQUEST, "missing redirect_uri").into_response();
    };

    let target = format!(
        "{}?IsAccepted=true&OpaqueBlob={}",
        redirect_uri,
        urlencoding::encode(query.client_request_id.as_deref().unwrap_or_default())
    );
    let target = serde_json::Value::String(target).to_string().replace("</", "<\\/");
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{name} Terms of Service</title></head>
<body>
<h3>{name} Terms of Service</h3>
<p>By accepting, you allow {name} to manage this device.</p>
<button onclick="accept()">Accept</button>
<script>function accept() {{ window.location = {target}; }}</script>
</body>
</html>"#,
        name = html_escape(&state.settings.server_display_name),
        target = target,
    ))
    .into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn manage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    peer: Option<Extension<PeerCertificate>>,
    body: Bytes,
) -> Response {
    if let Some(alert) = headers.get(GENERIC_ALERT_HEADER) {
        info!(alert = ?alert, "Device sent a generic alert");
    }

    let request_url = state.request_url(&headers, &uri);
    let certificate = state.client_certificate(&headers, peer.map(|Extension(p)| p));
    let facts = RequestFacts {
        request_url: &request_url,
        platform: query.get("Platform").map(String::as_str),
        peer_certificate: certificate.as_deref(),
    };
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    state.metrics.requests_processed.fetch_add(1, Ordering::Relaxed);
    match state.management.handle(&body, &facts, authorization).await {
        Ok(outcome) => {
            if !outcome.unrecognized.is_empty() {
                state
                    .metrics
                    .unrecognized_commands
                    .fetch_add(outcome.unrecognized.len() as u64, Ordering::Relaxed);
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, SYNCML_CONTENT_TYPE)],
                outcome.body,
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Management request could not be decoded");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}
