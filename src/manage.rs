//! OMA-DM management sessions.
//!
//! An inbound [`SyncMessage`] is folded into a [`ManagementTree`] keyed by the
//! `(MsgRef, CmdRef)` pair each device command correlates to. The tree is
//! handed to a [`ManagementPolicy`] which answers with a [`ResponseTree`] of
//! commands keyed by freshly allocated [`CommandId`]s.

use crate::error::{MdmError, Violation, ViolationCode};
use crate::service::{ManagementPolicy, TokenVerifier};
use crate::syncml::{
    CommandId, Item, Meta, SyncCommand, SyncMessage, SyncResponse, ALERT_DEVICE, ALERT_GENERIC,
    ALERT_TYPE_LOGIN_STATUS, ALERT_TYPE_UNENROLLMENT, STATUS_OK,
};
use crate::validator::{ManagementValidator, RequestFacts};
use crate::xml::Element;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Status sent for commands this server does not understand.
pub const STATUS_NOT_SUPPORTED: &str = "406";

/// Node status when the device only reported per-leaf statuses.
pub const STATUS_LEAF_REPORTED: &str = "0";

/// Location of a node: the message and command of the server command the
/// device is answering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeLoc {
    pub msg_id: String,
    pub cmd_id: String,
}

impl NodeLoc {
    pub fn new(msg_id: impl Into<String>, cmd_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            cmd_id: cmd_id.into(),
        }
    }
}

/// One managed-object leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeData {
    pub status: Option<String>,
    pub msft_status: Option<String>,
    pub format: Option<String>,
    pub kind: Option<String>,
    pub data: Option<String>,
}

/// Contents of a node: either leaves keyed by OMA-URI or nested commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    Leaves(BTreeMap<String, NodeData>),
    Group(BTreeMap<CommandId, Node>),
}

impl Default for NodeBody {
    fn default() -> Self {
        Self::Leaves(BTreeMap::new())
    }
}

/// A command and what it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub cmd: String,
    pub status: Option<String>,
    pub msft_status: Option<String>,
    pub body: NodeBody,
}

impl Node {
    pub fn with_leaves(cmd: impl Into<String>, leaves: BTreeMap<String, NodeData>) -> Self {
        Self {
            cmd: cmd.into(),
            body: NodeBody::Leaves(leaves),
            ..Default::default()
        }
    }

    /// A command wrapping nested commands, e.g. `Atomic`.
    pub fn group(cmd: impl Into<String>, children: BTreeMap<CommandId, Node>) -> Self {
        Self {
            cmd: cmd.into(),
            body: NodeBody::Group(children),
            ..Default::default()
        }
    }

    /// Leaves of this node; empty for groups.
    pub fn leaves(&self) -> impl Iterator<Item = (&String, &NodeData)> {
        let leaves = match &self.body {
            NodeBody::Leaves(leaves) => Some(leaves.iter()),
            NodeBody::Group(_) => None,
        };
        leaves.into_iter().flatten()
    }

    /// Leaf at `uri`, created if missing. `None` for groups.
    fn leaf_mut(&mut self, uri: String) -> Option<&mut NodeData> {
        match &mut self.body {
            NodeBody::Leaves(leaves) => Some(leaves.entry(uri).or_default()),
            NodeBody::Group(_) => None,
        }
    }
}

/// What the device reported, keyed by correlation location.
pub type ManagementTree = BTreeMap<NodeLoc, Node>;

/// Commands to send, keyed by their command ID.
pub type ResponseTree = BTreeMap<CommandId, Node>;

/// An alert item the device sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertRecord {
    pub code: String,
    pub kind: Option<String>,
    pub data: Option<String>,
}

/// Facts about the exchange handed to the management policy.
#[derive(Debug, Clone, Default)]
pub struct ManageContext {
    pub udid: String,
    pub device_id: String,
    /// Set from a `LoginStatus` device alert
    pub is_managed_user: bool,
    pub upn: Option<String>,
    pub aad_user_oid: Option<String>,
    pub aad_device_id: Option<String>,
    pub session_id: String,
    pub msg_id: String,
    /// The user asked to unenroll the device
    pub unenrollment_requested: bool,
    pub alerts: Vec<AlertRecord>,
}

impl ManageContext {
    /// Root of the configuration service providers for this session.
    pub fn management_root(&self) -> &'static str {
        if self.is_managed_user {
            "./User/Vendor"
        } else {
            "./Vendor"
        }
    }
}

/// A management tree plus the bookkeeping gathered while building it.
#[derive(Debug, Default)]
pub struct FoldedMessage {
    pub tree: ManagementTree,
    /// Status the device reported for our previous header
    pub client_status: Option<String>,
    pub unrecognized: Vec<String>,
}

/// Fold the commands of `message` into a management tree, updating `context`
/// from any alerts.
pub fn fold(message: &SyncMessage, context: &mut ManageContext) -> FoldedMessage {
    let mut folded = FoldedMessage::default();

    for command in &message.commands {
        match command {
            SyncCommand::Status(status) if status.is_header() => {
                let value = status.data.clone().unwrap_or_else(|| "0".to_string());
                let ok = value == STATUS_OK;
                folded.client_status = Some(value);
                if !ok {
                    break;
                }
            }
            SyncCommand::Status(status) => {
                let node = folded
                    .tree
                    .entry(NodeLoc::new(&status.msg_ref, &status.cmd_ref))
                    .or_default();
                node.cmd = status.cmd.clone();
                match &status.target_ref {
                    Some(target) => {
                        node.status = Some(STATUS_LEAF_REPORTED.to_string());
                        if let Some(leaf) = node.leaf_mut(target.clone()) {
                            leaf.status = status.data.clone();
                            leaf.msft_status = status.original_error.clone();
                        }
                    }
                    None => {
                        node.status = status.data.clone();
                        node.msft_status = status.original_error.clone();
                    }
                }
            }
            SyncCommand::Results(results) | SyncCommand::Replace(results) => {
                let node = folded
                    .tree
                    .entry(NodeLoc::new(&results.msg_ref, &results.cmd_ref))
                    .or_default();
                if node.cmd.is_empty() {
                    node.cmd = command.name().to_string();
                }
                for item in &results.items {
                    let uri = item.source.clone().unwrap_or_default();
                    let Some(leaf) = node.leaf_mut(uri) else {
                        continue;
                    };
                    if let Some(meta) = &item.meta {
                        leaf.format = meta.format.clone();
                        leaf.kind = meta.kind.clone();
                    }
                    if item.data.is_some() {
                        leaf.data = item.data.clone();
                    }
                }
            }
            SyncCommand::Alert(alert) => {
                for item in &alert.items {
                    let kind = item.meta.as_ref().and_then(|m| m.kind.clone());
                    match (alert.code.as_str(), kind.as_deref()) {
                        (ALERT_DEVICE, Some(ALERT_TYPE_LOGIN_STATUS)) => {
                            context.is_managed_user = item.data.as_deref() == Some("user");
                        }
                        (ALERT_GENERIC, Some(ALERT_TYPE_UNENROLLMENT)) => {
                            context.unenrollment_requested = true;
                        }
                        _ => {}
                    }
                    context.alerts.push(AlertRecord {
                        code: alert.code.clone(),
                        kind,
                        data: item.data.clone(),
                    });
                }
            }
            SyncCommand::Final => break,
            SyncCommand::Unrecognized { name, cmd_id } => {
                warn!(
                    device_id = %context.device_id,
                    command = %name,
                    cmd_id = %cmd_id,
                    "Unrecognized SyncML command"
                );
                folded.unrecognized.push(name.clone());
            }
        }
    }

    folded
}

/// Render a response node as a SyncML command.
///
/// Nested nodes are rendered as commands of the parent's type, whatever
/// their own `cmd` says.
pub fn node_to_command(id: CommandId, node: &Node) -> Element {
    render_command(id, &node.cmd, node)
}

fn render_command(id: CommandId, cmd: &str, node: &Node) -> Element {
    let mut command = Element::new(cmd).with_child(Element::leaf("CmdID", id.to_string()));

    match &node.body {
        NodeBody::Leaves(leaves) => {
            for (uri, leaf) in leaves {
                let meta = (leaf.format.is_some() || leaf.kind.is_some()).then(|| Meta {
                    format: leaf.format.clone(),
                    kind: leaf.kind.clone(),
                });
                let item = Item {
                    target: Some(uri.clone()),
                    source: None,
                    meta,
                    data: leaf.data.clone().filter(|d| !d.is_empty()),
                };
                command.push(item.to_element());
            }
        }
        NodeBody::Group(children) => {
            for (child_id, child) in children {
                command.push(render_command(*child_id, cmd, child));
            }
        }
    }
    command
}

fn non_empty(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

/// Result of handling one management request.
#[derive(Debug)]
pub struct ManageOutcome {
    /// Serialized SyncML response
    pub body: String,
    /// Names of commands that were not understood
    pub unrecognized: Vec<String>,
}

/// Drives one SyncML exchange.
pub struct ManagementHandler {
    validator: ManagementValidator,
    policy: Arc<dyn ManagementPolicy>,
    token_verifier: Option<Arc<dyn TokenVerifier>>,
    max_msg_size: usize,
}

impl ManagementHandler {
    pub fn new(
        validator: ManagementValidator,
        policy: Arc<dyn ManagementPolicy>,
        token_verifier: Option<Arc<dyn TokenVerifier>>,
        max_msg_size: usize,
    ) -> Self {
        Self {
            validator,
            policy,
            token_verifier,
            max_msg_size,
        }
    }

    /// Handle a request body. An `Err` means the body could not be decoded.
    pub async fn handle(
        &self,
        body: &[u8],
        facts: &RequestFacts<'_>,
        authorization: Option<&str>,
    ) -> Result<ManageOutcome, MdmError> {
        let message = SyncMessage::decode(body)?;
        let header = &message.header;

        let mut context = ManageContext {
            udid: header.source_uri.clone(),
            device_id: header.source_uri.clone(),
            session_id: header.session_id.clone(),
            msg_id: header.msg_id.clone(),
            ..Default::default()
        };

        let mut validation = self.validator.validate(header, facts);

        if let Some(token) = authorization.map(|a| a.strip_prefix("Bearer ").unwrap_or(a)) {
            match &self.token_verifier {
                Some(verifier) => match verifier.verify_token(token).await {
                    Ok(claims) => {
                        context.upn = non_empty(claims.upn);
                        context.aad_user_oid = non_empty(claims.oid);
                        context.aad_device_id = non_empty(claims.deviceid);
                    }
                    Err(e) => {
                        warn!(device_id = %context.device_id, error = %e, "Bearer token rejected");
                        validation.add_violation(Violation::new(
                            ViolationCode::InvalidBearerToken,
                            e.to_string(),
                        ));
                    }
                },
                None => debug!("Ignoring bearer token, federation disabled"),
            }
        }

        if let Some(status) = validation.blocking_status(self.validator.fail_action()) {
            info!(
                device_id = %context.device_id,
                status = status,
                "Management exchange refused"
            );
            let response = SyncResponse::new(header, self.max_msg_size, status);
            return Ok(ManageOutcome {
                body: response.encode()?,
                unrecognized: vec![],
            });
        }

        let mut response = SyncResponse::new(header, self.max_msg_size, STATUS_OK);
        for command in &message.commands {
            let status = match command {
                SyncCommand::Status(_) => continue,
                SyncCommand::Final => break,
                SyncCommand::Unrecognized { .. } => STATUS_NOT_SUPPORTED,
                SyncCommand::Results(_) | SyncCommand::Replace(_) | SyncCommand::Alert(_) => {
                    STATUS_OK
                }
            };
            let cmd_ref = command.cmd_id().unwrap_or_default().to_string();
            response.status(&header.msg_id, &cmd_ref, command.name(), status);
        }

        let folded = fold(&message, &mut context);
        if let Some(status) = folded.client_status.as_deref().filter(|s| *s != STATUS_OK) {
            warn!(
                device_id = %context.device_id,
                status = status,
                "Device reported an error for the previous message"
            );
        }

        let mut commands = ResponseTree::new();
        if let Err(e) = self
            .policy
            .manage(&context, &mut response.ids, &folded.tree, &mut commands)
            .await
        {
            warn!(device_id = %context.device_id, error = %e, "Management policy failed");
        }

        for (id, node) in &commands {
            response.push(node_to_command(*id, node));
        }

        Ok(ManageOutcome {
            body: response.encode()?,
            unrecognized: folded.unrecognized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailAction, ManagementConfig};
    use crate::federation::FederatedClaims;
    use crate::syncml::CommandIdAllocator;
    use crate::xml;
    use async_trait::async_trait;

    const URL: &str = "https://mdm.example.com/ManagementServer/Manage.svc";

    fn message(msg_id: &str, body: &str) -> String {
        format!(
            r#"<SyncML xmlns="SYNCML:SYNCML1.2">
  <SyncHdr>
    <VerDTD>1.2</VerDTD><VerProto>DM/1.2</VerProto>
    <SessionID>7</SessionID><MsgID>{msg_id}</MsgID>
    <Target><LocURI>{URL}?mode=Maintenance&amp;Platform=WoA</LocURI></Target>
    <Source><LocURI>device-1</LocURI></Source>
  </SyncHdr>
  <SyncBody>{body}<Final/></SyncBody>
</SyncML>"#
        )
    }

    fn lenient() -> ManagementValidator {
        ManagementValidator::new(ManagementConfig {
            require_client_certificate: false,
            required_platform: None,
            ..Default::default()
        })
    }

    fn facts() -> RequestFacts<'static> {
        RequestFacts {
            request_url: URL,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct AtomicPolicy;

    #[async_trait]
    impl ManagementPolicy for AtomicPolicy {
        async fn manage(
            &self,
            _context: &ManageContext,
            ids: &mut CommandIdAllocator,
            _tree: &ManagementTree,
            response: &mut ResponseTree,
        ) -> Result<(), MdmError> {
            let atomic = ids.next();
            let mut leaves = BTreeMap::new();
            leaves.insert(
                "./Vendor/MSFT/Policy/Config/Camera/AllowCamera".to_string(),
                NodeData {
                    format: Some("int".to_string()),
                    data: Some("0".to_string()),
                    ..Default::default()
                },
            );
            let mut children = BTreeMap::new();
            children.insert(ids.next(), Node::with_leaves("Add", leaves));
            response.insert(atomic, Node::group("Atomic", children));
            Err(MdmError::Collaborator("partial".to_string()))
        }
    }

    struct RejectingVerifier;

    #[async_trait]
    impl TokenVerifier for RejectingVerifier {
        async fn verify_token(&self, _token: &str) -> Result<FederatedClaims, MdmError> {
            Err(MdmError::Federation("bad signature".to_string()))
        }
    }

    #[test]
    fn test_results_items_share_one_node() {
        let body = message(
            "2",
            r#"<Status><CmdID>1</CmdID><MsgRef>1</MsgRef><CmdRef>0</CmdRef><Cmd>SyncHdr</Cmd><Data>200</Data></Status>
<Results><CmdID>2</CmdID><MsgRef>1</MsgRef><CmdRef>2</CmdRef>
  <Item><Source><LocURI>./DevDetail/SwV</LocURI></Source><Data>10.0.19045</Data></Item>
  <Item><Source><LocURI>./DevInfo/Mod</LocURI></Source><Meta><Format xmlns="syncml:metinf">chr</Format></Meta><Data>Surface</Data></Item>
</Results>"#,
        );
        let msg = SyncMessage::decode(body.as_bytes()).unwrap();
        let folded = fold(&msg, &mut ManageContext::default());

        assert_eq!(folded.client_status.as_deref(), Some("200"));
        assert_eq!(folded.tree.len(), 1);
        let node = &folded.tree[&NodeLoc::new("1", "2")];
        assert_eq!(node.cmd, "Results");
        let leaves: Vec<_> = node.leaves().collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].0, "./DevDetail/SwV");
        assert_eq!(leaves[0].1.data.as_deref(), Some("10.0.19045"));
        assert_eq!(leaves[1].1.data.as_deref(), Some("Surface"));
        assert_eq!(leaves[1].1.format.as_deref(), Some("chr"));
    }

    #[test]
    fn test_status_updates_node_or_leaf() {
        let body = message(
            "3",
            r#"<Status><CmdID>2</CmdID><MsgRef>2</MsgRef><CmdRef>4</CmdRef><Cmd>Add</Cmd><Data>200</Data></Status>
<Status><CmdID>3</CmdID><MsgRef>2</MsgRef><CmdRef>5</CmdRef><Cmd>Replace</Cmd><TargetRef>./Vendor/MSFT/Foo</TargetRef><Data>404</Data></Status>"#,
        );
        let msg = SyncMessage::decode(body.as_bytes()).unwrap();
        let folded = fold(&msg, &mut ManageContext::default());

        let add = &folded.tree[&NodeLoc::new("2", "4")];
        assert_eq!(add.cmd, "Add");
        assert_eq!(add.status.as_deref(), Some("200"));

        let replace = &folded.tree[&NodeLoc::new("2", "5")];
        assert_eq!(replace.status.as_deref(), Some(STATUS_LEAF_REPORTED));
        let (uri, leaf) = replace.leaves().next().unwrap();
        assert_eq!(uri, "./Vendor/MSFT/Foo");
        assert_eq!(leaf.status.as_deref(), Some("404"));
    }

    #[test]
    fn test_header_error_stops_fold() {
        let body = message(
            "2",
            r#"<Status><CmdID>1</CmdID><MsgRef>1</MsgRef><CmdRef>0</CmdRef><Cmd>SyncHdr</Cmd><Data>500</Data></Status>
<Results><CmdID>2</CmdID><MsgRef>1</MsgRef><CmdRef>2</CmdRef><Item><Source><LocURI>./A</LocURI></Source><Data>x</Data></Item></Results>"#,
        );
        let msg = SyncMessage::decode(body.as_bytes()).unwrap();
        let folded = fold(&msg, &mut ManageContext::default());
        assert_eq!(folded.client_status.as_deref(), Some("500"));
        assert!(folded.tree.is_empty());
    }

    #[test]
    fn test_alerts_update_context() {
        let body = message(
            "1",
            r#"<Alert><CmdID>2</CmdID><Data>1201</Data></Alert>
<Alert><CmdID>3</CmdID><Data>1224</Data><Item><Meta><Type xmlns="syncml:metinf">com.microsoft/MDM/LoginStatus</Type></Meta><Data>user</Data></Item></Alert>
<Alert><CmdID>4</CmdID><Data>1226</Data><Item><Meta><Type xmlns="syncml:metinf">com.microsoft:mdm.unenrollment.userrequest</Type><Format xmlns="syncml:metinf">int</Format></Meta><Data>1</Data></Item></Alert>
<Exec><CmdID>5</CmdID></Exec>"#,
        );
        let msg = SyncMessage::decode(body.as_bytes()).unwrap();
        let mut context = ManageContext::default();
        let folded = fold(&msg, &mut context);

        assert!(context.is_managed_user);
        assert!(context.unenrollment_requested);
        assert_eq!(context.alerts.len(), 2);
        assert_eq!(context.management_root(), "./User/Vendor");
        assert_eq!(folded.unrecognized, vec!["Exec".to_string()]);
    }

    #[test]
    fn test_atomic_nesting_serializes_recursively() {
        let mut leaves = BTreeMap::new();
        leaves.insert(
            "./Vendor/MSFT/A".to_string(),
            NodeData {
                data: Some("1".to_string()),
                ..Default::default()
            },
        );
        let mut ids = CommandIdAllocator::new();
        let outer = ids.next();
        let inner = ids.next();
        let innermost = ids.next();

        let mut deepest = BTreeMap::new();
        deepest.insert(innermost, Node::with_leaves("Replace", leaves));
        let mut children = BTreeMap::new();
        children.insert(inner, Node::group("", deepest));
        let node = Node::group("Atomic", children);

        let el = node_to_command(outer, &node);
        assert_eq!(el.name, "Atomic");
        assert_eq!(el.text_at(&["CmdID"]), Some("1"));
        let nested = el.find("Atomic").unwrap();
        assert_eq!(nested.text_at(&["CmdID"]), Some("2"));
        let deepest = nested.find("Atomic").unwrap();
        assert_eq!(deepest.text_at(&["CmdID"]), Some("3"));
        assert_eq!(
            deepest.text_at(&["Item", "Target", "LocURI"]),
            Some("./Vendor/MSFT/A")
        );
        assert_eq!(deepest.text_at(&["Item", "Data"]), Some("1"));
        assert!(deepest.path(&["Item", "Meta"]).is_none());
        assert!(el.find("Replace").is_none());
        assert!(nested.find("Replace").is_none());
    }

    #[test]
    fn test_replace_items_fold_by_source() {
        let body = message(
            "2",
            r#"<Status><CmdID>1</CmdID><MsgRef>1</MsgRef><CmdRef>0</CmdRef><Cmd>SyncHdr</Cmd><Data>200</Data></Status>
<Replace><CmdID>2</CmdID>
  <Item><Source><LocURI>./DevInfo/DevId</LocURI></Source><Data>device-1</Data></Item>
  <Item><Source><LocURI>./DevInfo/Lang</LocURI></Source><Meta><Format xmlns="syncml:metinf">chr</Format><Type xmlns="syncml:metinf">text/plain</Type></Meta><Data>en-US</Data></Item>
</Replace>"#,
        );
        let msg = SyncMessage::decode(body.as_bytes()).unwrap();
        let folded = fold(&msg, &mut ManageContext::default());

        assert_eq!(folded.tree.len(), 1);
        let (_, node) = folded.tree.iter().next().unwrap();
        assert_eq!(node.cmd, "Replace");
        assert_eq!(node.status, None);

        let leaves: Vec<_> = node.leaves().collect();
        assert_eq!(leaves.len(), 2);
        let (uri, dev_id) = leaves[0];
        assert_eq!(uri, "./DevInfo/DevId");
        assert_eq!(dev_id.data.as_deref(), Some("device-1"));
        assert_eq!(dev_id.format, None);
        let (uri, lang) = leaves[1];
        assert_eq!(uri, "./DevInfo/Lang");
        assert_eq!(lang.data.as_deref(), Some("en-US"));
        assert_eq!(lang.format.as_deref(), Some("chr"));
        assert_eq!(lang.kind.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_handle_acks_and_policy_commands() {
        let handler = ManagementHandler::new(lenient(), Arc::new(AtomicPolicy), None, 524_288);
        let body = message(
            "1",
            r#"<Alert><CmdID>2</CmdID><Data>1201</Data></Alert>
<Get><CmdID>3</CmdID></Get>"#,
        );
        let outcome = handler.handle(body.as_bytes(), &facts(), None).await.unwrap();
        assert_eq!(outcome.unrecognized, vec!["Get".to_string()]);

        let parsed = xml::parse(outcome.body.as_bytes()).unwrap();
        assert_eq!(parsed.text_at(&["SyncHdr", "MsgID"]), Some("1"));
        let body = parsed.find("SyncBody").unwrap();
        let names: Vec<&str> = body.children.iter().map(|c| c.local_name()).collect();
        assert_eq!(names, ["Status", "Status", "Status", "Atomic", "Final"]);

        let ids: Vec<&str> = body
            .children
            .iter()
            .filter_map(|c| c.text_at(&["CmdID"]))
            .collect();
        assert_eq!(ids, ["1", "2", "3", "4"]);
        assert_eq!(body.children[1].text_at(&["Cmd"]), Some("Alert"));
        assert_eq!(body.children[1].text_at(&["Data"]), Some("200"));
        assert_eq!(body.children[2].text_at(&["Cmd"]), Some("Get"));
        assert_eq!(body.children[2].text_at(&["Data"]), Some(STATUS_NOT_SUPPORTED));

        let nested = body.children[3].find("Atomic").unwrap();
        assert_eq!(nested.text_at(&["CmdID"]), Some("5"));
        assert_eq!(nested.text_at(&["Item", "Meta", "Format"]), Some("int"));
    }

    #[tokio::test]
    async fn test_handle_blocks_on_violation() {
        let validator = ManagementValidator::new(ManagementConfig {
            required_platform: None,
            ..Default::default()
        });
        let handler = ManagementHandler::new(validator, Arc::new(AtomicPolicy), None, 524_288);
        let body = message("1", "");
        let outcome = handler.handle(body.as_bytes(), &facts(), None).await.unwrap();

        let parsed = xml::parse(outcome.body.as_bytes()).unwrap();
        let body = parsed.find("SyncBody").unwrap();
        assert_eq!(body.children.len(), 2);
        assert_eq!(body.children[0].text_at(&["Data"]), Some("401"));
    }

    #[tokio::test]
    async fn test_handle_rejected_bearer_token() {
        let handler = ManagementHandler::new(
            lenient(),
            Arc::new(AtomicPolicy),
            Some(Arc::new(RejectingVerifier)),
            524_288,
        );
        let body = message("1", "");
        let outcome = handler
            .handle(body.as_bytes(), &facts(), Some("Bearer abc"))
            .await
            .unwrap();
        let parsed = xml::parse(outcome.body.as_bytes()).unwrap();
        assert_eq!(
            parsed.text_at(&["SyncBody", "Status", "Data"]),
            Some("401")
        );
    }

    #[tokio::test]
    async fn test_handle_allow_mode_continues() {
        let validator = ManagementValidator::new(ManagementConfig {
            fail_action: FailAction::Allow,
            required_platform: None,
            ..Default::default()
        });
        let handler = ManagementHandler::new(validator, Arc::new(AtomicPolicy), None, 524_288);
        let body = message("1", "");
        let outcome = handler.handle(body.as_bytes(), &facts(), None).await.unwrap();
        let parsed = xml::parse(outcome.body.as_bytes()).unwrap();
        assert_eq!(parsed.text_at(&["SyncBody", "Status", "Data"]), Some("200"));
        assert!(parsed.path(&["SyncBody", "Atomic"]).is_some());
    }

    #[tokio::test]
    async fn test_handle_rejects_garbage() {
        let handler = ManagementHandler::new(lenient(), Arc::new(AtomicPolicy), None, 524_288);
        assert!(handler.handle(b"not xml", &facts(), None).await.is_err());
    }
}
