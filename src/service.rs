//! Collaborators the protocol handlers call out to, with default implementations.

use crate::enrollment::EnrollmentRequest;
use crate::error::MdmError;
use crate::federation::FederatedClaims;
use crate::manage::{ManageContext, ManagementTree, Node, NodeData, ResponseTree};
use crate::syncml::CommandIdAllocator;
use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509};
use std::collections::BTreeMap;
use tracing::info;

/// Decides which commands to send to a device in response to what it reported.
#[async_trait]
pub trait ManagementPolicy: Send + Sync {
    /// Add commands for the device to `response`, allocating IDs from `ids`.
    /// Commands added before an error is returned are still sent.
    async fn manage(
        &self,
        context: &ManageContext,
        ids: &mut CommandIdAllocator,
        tree: &ManagementTree,
        response: &mut ResponseTree,
    ) -> Result<(), MdmError>;
}

/// Records enrolled devices.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn check_in(&self, device_id: &str, request: &EnrollmentRequest) -> Result<(), MdmError>;
}

/// Decides whether a username/password pair may enroll.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify_credentials(&self, username: &str, password: &str) -> Result<(), MdmError>;
}

/// Verifies federated identity tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<FederatedClaims, MdmError>;
}

/// Access to the certificate used to issue device certificates.
pub trait IssuerIdentity: Send + Sync {
    fn issuer_identity(&self) -> Result<(X509, PKey<Private>), MdmError>;

    /// `Ok` when `cert` was issued by the identity certificate.
    fn is_issuer_identity(&self, cert: &X509Ref) -> Result<(), MdmError>;
}

/// Logs what devices report and collects inventory at the start of each session.
///
/// Inventory is requested only when answering message 1 of a session, so
/// repeated exchanges within a session do not re-issue it.
#[derive(Debug, Clone, Default)]
pub struct ReportingPolicy {
    inventory_uris: Vec<String>,
}

impl ReportingPolicy {
    pub fn new(inventory_uris: Vec<String>) -> Self {
        Self { inventory_uris }
    }
}

#[async_trait]
impl ManagementPolicy for ReportingPolicy {
    async fn manage(
        &self,
        context: &ManageContext,
        ids: &mut CommandIdAllocator,
        tree: &ManagementTree,
        response: &mut ResponseTree,
    ) -> Result<(), MdmError> {
        for (loc, node) in tree {
            if let Some(status) = &node.status {
                info!(
                    device_id = %context.device_id,
                    msg_ref = %loc.msg_id,
                    cmd_ref = %loc.cmd_id,
                    cmd = %node.cmd,
                    status = %status,
                    original_error = ?node.msft_status,
                    "Device reported command status"
                );
            }
            for (uri, data) in node.leaves() {
                info!(
                    device_id = %context.device_id,
                    uri = %uri,
                    status = ?data.status.as_ref().or(node.status.as_ref()),
                    original_error = ?data.msft_status,
                    value = ?data.data,
                    "Device reported node"
                );
            }
        }

        if context.msg_id == "1" && !self.inventory_uris.is_empty() {
            let leaves: BTreeMap<String, NodeData> = self
                .inventory_uris
                .iter()
                .map(|uri| (uri.clone(), NodeData::default()))
                .collect();
            response.insert(ids.next(), Node::with_leaves("Get", leaves));
        }
        Ok(())
    }
}

/// Logs device check-ins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeviceRegistry;

#[async_trait]
impl DeviceRegistry for LoggingDeviceRegistry {
    async fn check_in(&self, device_id: &str, request: &EnrollmentRequest) -> Result<(), MdmError> {
        info!(
            device_id = %device_id,
            device_type = %request.device_type,
            os_edition = %request.os_edition,
            store = ?request.store,
            "Device checked in"
        );
        Ok(())
    }
}

/// Accepts any non-empty username and password.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyCredentials;

#[async_trait]
impl CredentialVerifier for NonEmptyCredentials {
    async fn verify_credentials(&self, username: &str, password: &str) -> Result<(), MdmError> {
        if username.is_empty() || password.is_empty() {
            return Err(MdmError::Collaborator(
                "username and password are required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manage::{NodeBody, NodeLoc};

    fn context(msg_id: &str) -> ManageContext {
        ManageContext {
            device_id: "device-1".to_string(),
            msg_id: msg_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reporting_policy_requests_inventory_once_per_session() {
        let policy = ReportingPolicy::new(vec!["./DevDetail/SwV".to_string()]);
        let tree = ManagementTree::new();

        let mut ids = CommandIdAllocator::new();
        ids.next();
        let mut response = ResponseTree::new();
        policy
            .manage(&context("1"), &mut ids, &tree, &mut response)
            .await
            .unwrap();
        assert_eq!(response.len(), 1);
        let (id, node) = response.iter().next().unwrap();
        assert_eq!(id.to_string(), "2");
        assert_eq!(node.cmd, "Get");
        assert!(matches!(&node.body, NodeBody::Leaves(l) if l.contains_key("./DevDetail/SwV")));

        let mut response = ResponseTree::new();
        policy
            .manage(&context("2"), &mut CommandIdAllocator::new(), &tree, &mut response)
            .await
            .unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_reporting_policy_accepts_reported_tree() {
        let policy = ReportingPolicy::default();
        let mut tree = ManagementTree::new();
        tree.insert(
            NodeLoc::new("1", "2"),
            Node {
                cmd: "Get".to_string(),
                status: Some("200".to_string()),
                ..Default::default()
            },
        );
        let mut response = ResponseTree::new();
        assert!(policy
            .manage(&context("2"), &mut CommandIdAllocator::new(), &tree, &mut response)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_non_empty_credentials() {
        let verifier = NonEmptyCredentials;
        assert!(verifier.verify_credentials("user", "pass").await.is_ok());
        assert!(verifier.verify_credentials("user", "").await.is_err());
        assert!(verifier.verify_credentials("", "pass").await.is_err());
    }
}
