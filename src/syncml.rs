//! OMA-DM SyncML messages.
//!
//! Inbound messages are decoded into a closed set of [`SyncCommand`]s; anything
//! else lands in [`SyncCommand::Unrecognized`] so callers can count it.
//! Outbound messages are assembled with [`SyncResponse`].

use crate::error::MdmError;
use crate::xml::{self, Element};
use std::fmt;

pub const SYNCML_NS: &str = "SYNCML:SYNCML1.2";
pub const METINF_NS: &str = "syncml:metinf";

pub const SYNCML_CONTENT_TYPE: &str = "application/vnd.syncml.dm+xml";
pub const SYNCML_WBXML_CONTENT_TYPE: &str = "application/vnd.syncml.dm+wbxml";

pub const VER_DTD: &str = "1.2";
pub const VER_PROTO: &str = "DM/1.2";

/// Status codes used by this server.
pub const STATUS_OK: &str = "200";

/// Alert codes.
pub const ALERT_DEVICE: &str = "1224";
pub const ALERT_GENERIC: &str = "1226";

/// Alert item types.
pub const ALERT_TYPE_UNENROLLMENT: &str = "com.microsoft:mdm.unenrollment.userrequest";
pub const ALERT_TYPE_LOGIN_STATUS: &str = "com.microsoft/MDM/LoginStatus";

/// Identifier of a command within one response, rendered as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(u32);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Hands out command IDs for one response, starting at 1.
#[derive(Debug, Default)]
pub struct CommandIdAllocator {
    last: u32,
}

impl CommandIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> CommandId {
        self.last += 1;
        CommandId(self.last)
    }
}

/// `SyncHdr` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncHeader {
    pub ver_dtd: String,
    pub ver_proto: String,
    pub session_id: String,
    pub msg_id: String,
    pub target_uri: String,
    pub source_uri: String,
    pub max_msg_size: Option<String>,
}

impl SyncHeader {
    fn from_element(el: &Element) -> Self {
        let text = |path: &[&str]| el.text_at(path).unwrap_or_default().to_string();
        Self {
            ver_dtd: text(&["VerDTD"]),
            ver_proto: text(&["VerProto"]),
            session_id: text(&["SessionID"]),
            msg_id: text(&["MsgID"]),
            target_uri: text(&["Target", "LocURI"]),
            source_uri: text(&["Source", "LocURI"]),
            max_msg_size: el.text_at(&["Meta", "MaxMsgSize"]).map(str::to_string),
        }
    }

    fn to_element(&self) -> Element {
        let mut header = Element::new("SyncHdr")
            .with_child(Element::leaf("VerDTD", self.ver_dtd.as_str()))
            .with_child(Element::leaf("VerProto", self.ver_proto.as_str()))
            .with_child(Element::leaf("SessionID", self.session_id.as_str()))
            .with_child(Element::leaf("MsgID", self.msg_id.as_str()))
            .with_child(loc_uri("Target", &self.target_uri))
            .with_child(loc_uri("Source", &self.source_uri));
        if let Some(size) = &self.max_msg_size {
            header.push(
                Element::new("Meta").with_child(
                    Element::leaf("MaxMsgSize", size.as_str()).with_attr("xmlns", METINF_NS),
                ),
            );
        }
        header
    }
}

fn loc_uri(name: &str, uri: &str) -> Element {
    Element::new(name).with_child(Element::leaf("LocURI", uri))
}

/// Item metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub format: Option<String>,
    pub kind: Option<String>,
}

impl Meta {
    fn from_element(el: &Element) -> Self {
        Self {
            format: el.text_at(&["Format"]).map(str::to_string),
            kind: el.text_at(&["Type"]).map(str::to_string),
        }
    }

    fn to_element(&self) -> Element {
        let mut meta = Element::new("Meta");
        if let Some(format) = &self.format {
            meta.push(Element::leaf("Format", format.as_str()).with_attr("xmlns", METINF_NS));
        }
        if let Some(kind) = &self.kind {
            meta.push(Element::leaf("Type", kind.as_str()).with_attr("xmlns", METINF_NS));
        }
        meta
    }
}

/// An `Item` inside a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub source: Option<String>,
    pub target: Option<String>,
    pub meta: Option<Meta>,
    pub data: Option<String>,
}

impl Item {
    fn from_element(el: &Element) -> Self {
        Self {
            source: el.text_at(&["Source", "LocURI"]).map(str::to_string),
            target: el.text_at(&["Target", "LocURI"]).map(str::to_string),
            meta: el.find("Meta").map(Meta::from_element),
            data: el.find("Data").map(|d| d.text().to_string()),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut item = Element::new("Item");
        if let Some(target) = &self.target {
            item.push(loc_uri("Target", target));
        }
        if let Some(source) = &self.source {
            item.push(loc_uri("Source", source));
        }
        if let Some(meta) = &self.meta {
            item.push(meta.to_element());
        }
        if let Some(data) = &self.data {
            item.push(Element::leaf("Data", data.as_str()));
        }
        item
    }
}

/// An inbound `Status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub cmd_id: String,
    pub msg_ref: String,
    pub cmd_ref: String,
    pub cmd: String,
    pub target_ref: Option<String>,
    pub source_ref: Option<String>,
    pub data: Option<String>,
    /// Windows `msft:originalerror` HRESULT
    pub original_error: Option<String>,
}

impl Status {
    /// Status for the message header.
    pub fn is_header(&self) -> bool {
        self.cmd_ref == "0" && self.cmd == "SyncHdr"
    }
}

/// An inbound command carrying items (`Results`, `Replace`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemCommand {
    pub cmd_id: String,
    pub msg_ref: String,
    pub cmd_ref: String,
    pub items: Vec<Item>,
}

/// An inbound `Alert`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alert {
    pub cmd_id: String,
    pub code: String,
    pub items: Vec<Item>,
}

/// Commands a device may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Status(Status),
    Results(ItemCommand),
    Replace(ItemCommand),
    Alert(Alert),
    Final,
    Unrecognized { name: String, cmd_id: String },
}

impl SyncCommand {
    fn from_element(el: &Element) -> Self {
        let text = |name: &str| el.text_at(&[name]).unwrap_or_default().to_string();
        let items = || el.find_all("Item").map(Item::from_element).collect::<Vec<_>>();

        match el.local_name() {
            "Status" => {
                let data = el.find("Data");
                Self::Status(Status {
                    cmd_id: text("CmdID"),
                    msg_ref: text("MsgRef"),
                    cmd_ref: text("CmdRef"),
                    cmd: text("Cmd"),
                    target_ref: el.text_at(&["TargetRef"]).map(str::to_string),
                    source_ref: el.text_at(&["SourceRef"]).map(str::to_string),
                    data: data.map(|d| d.text().to_string()),
                    original_error: data
                        .and_then(|d| d.attr("originalerror"))
                        .map(str::to_string),
                })
            }
            "Results" | "Replace" => {
                let command = ItemCommand {
                    cmd_id: text("CmdID"),
                    msg_ref: text("MsgRef"),
                    cmd_ref: text("CmdRef"),
                    items: items(),
                };
                if el.local_name() == "Results" {
                    Self::Results(command)
                } else {
                    Self::Replace(command)
                }
            }
            "Alert" => Self::Alert(Alert {
                cmd_id: text("CmdID"),
                code: text("Data"),
                items: items(),
            }),
            "Final" => Self::Final,
            other => Self::Unrecognized {
                name: other.to_string(),
                cmd_id: text("CmdID"),
            },
        }
    }

    /// Element name of the command.
    pub fn name(&self) -> &str {
        match self {
            Self::Status(_) => "Status",
            Self::Results(_) => "Results",
            Self::Replace(_) => "Replace",
            Self::Alert(_) => "Alert",
            Self::Final => "Final",
            Self::Unrecognized { name, .. } => name,
        }
    }

    pub fn cmd_id(&self) -> Option<&str> {
        match self {
            Self::Status(s) => Some(&s.cmd_id),
            Self::Results(c) | Self::Replace(c) => Some(&c.cmd_id),
            Self::Alert(a) => Some(&a.cmd_id),
            Self::Final => None,
            Self::Unrecognized { cmd_id, .. } => Some(cmd_id),
        }
    }
}

/// A decoded inbound SyncML message.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    pub header: SyncHeader,
    /// Body commands in document order, `Final` included
    pub commands: Vec<SyncCommand>,
}

impl SyncMessage {
    pub fn decode(data: &[u8]) -> Result<Self, MdmError> {
        let root = xml::parse(data)?;
        if root.local_name() != "SyncML" {
            return Err(MdmError::InvalidSyncMl(format!(
                "Expected SyncML, found {}",
                root.local_name()
            )));
        }
        let header = root
            .find("SyncHdr")
            .map(SyncHeader::from_element)
            .ok_or_else(|| MdmError::InvalidSyncMl("Missing SyncHdr".to_string()))?;
        let body = root
            .find("SyncBody")
            .ok_or_else(|| MdmError::InvalidSyncMl("Missing SyncBody".to_string()))?;

        Ok(Self {
            header,
            commands: body.children.iter().map(SyncCommand::from_element).collect(),
        })
    }
}

/// An outbound SyncML message.
#[derive(Debug)]
pub struct SyncResponse {
    header: SyncHeader,
    request_msg_id: String,
    body: Vec<Element>,
    /// Allocator shared with whoever adds commands to this response
    pub ids: CommandIdAllocator,
}

impl SyncResponse {
    /// Start a response to `request`: addressing swapped and the header
    /// status already allocated as command 1.
    pub fn new(request: &SyncHeader, max_msg_size: usize, header_status: &str) -> Self {
        let mut response = Self {
            header: SyncHeader {
                ver_dtd: request.ver_dtd.clone(),
                ver_proto: request.ver_proto.clone(),
                session_id: request.session_id.clone(),
                msg_id: request.msg_id.clone(),
                target_uri: request.source_uri.clone(),
                source_uri: request.target_uri.clone(),
                max_msg_size: Some(max_msg_size.to_string()),
            },
            request_msg_id: request.msg_id.clone(),
            body: vec![],
            ids: CommandIdAllocator::new(),
        };
        let msg_ref = response.request_msg_id.clone();
        response.status(&msg_ref, "0", "SyncHdr", header_status);
        response
    }

    /// Append a `Status` for a command of the request.
    pub fn status(&mut self, msg_ref: &str, cmd_ref: &str, cmd: &str, data: &str) {
        let id = self.ids.next();
        self.body.push(
            Element::new("Status")
                .with_child(Element::leaf("CmdID", id.to_string()))
                .with_child(Element::leaf("MsgRef", msg_ref))
                .with_child(Element::leaf("CmdRef", cmd_ref))
                .with_child(Element::leaf("Cmd", cmd))
                .with_child(Element::leaf("Data", data)),
        );
    }

    /// Append an already built command.
    pub fn push(&mut self, command: Element) {
        self.body.push(command);
    }

    pub fn to_element(&self) -> Element {
        Element::new("SyncML")
            .with_attr("xmlns", SYNCML_NS)
            .with_child(self.header.to_element())
            .with_child(
                Element::new("SyncBody")
                    .with_children(self.body.iter().cloned())
                    .with_child(Element::new("Final")),
            )
    }

    pub fn encode(&self) -> Result<String, MdmError> {
        self.to_element().to_xml()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SyncML xmlns="SYNCML:SYNCML1.2" xmlns:msft="http://schemas.microsoft.com/MobileDevice/MDM">
  <SyncHdr>
    <VerDTD>1.2</VerDTD>
    <VerProto>DM/1.2</VerProto>
    <SessionID>1</SessionID>
    <MsgID>2</MsgID>
    <Target><LocURI>https://mdm.example.com/ManagementServer/Manage.svc</LocURI></Target>
    <Source><LocURI>device-123</LocURI></Source>
    <Meta><MaxMsgSize xmlns="syncml:metinf">524288</MaxMsgSize></Meta>
  </SyncHdr>
  <SyncBody>
    <Status>
      <CmdID>1</CmdID><MsgRef>1</MsgRef><CmdRef>0</CmdRef><Cmd>SyncHdr</Cmd><Data>200</Data>
    </Status>
    <Status>
      <CmdID>2</CmdID><MsgRef>1</MsgRef><CmdRef>3</CmdRef><Cmd>Add</Cmd>
      <TargetRef>./Vendor/MSFT/Policy/Config/Camera/AllowCamera</TargetRef>
      <Data msft:originalerror="0x80070002">404</Data>
    </Status>
    <Results>
      <CmdID>3</CmdID><MsgRef>1</MsgRef><CmdRef>2</CmdRef>
      <Item>
        <Source><LocURI>./DevDetail/SwV</LocURI></Source>
        <Meta><Format xmlns="syncml:metinf">chr</Format></Meta>
        <Data>10.0.19045</Data>
      </Item>
    </Results>
    <Alert>
      <CmdID>4</CmdID><Data>1224</Data>
      <Item>
        <Meta><Type xmlns="syncml:metinf">com.microsoft/MDM/LoginStatus</Type></Meta>
        <Data>user</Data>
      </Item>
    </Alert>
    <Get><CmdID>5</CmdID></Get>
    <Final/>
  </SyncBody>
</SyncML>"#;

    #[test]
    fn test_command_id_allocator_is_hex_and_monotonic() {
        let mut ids = CommandIdAllocator::new();
        let rendered: Vec<String> = (0..17).map(|_| ids.next().to_string()).collect();
        assert_eq!(&rendered[..3], &["1", "2", "3"]);
        assert_eq!(rendered[9], "a");
        assert_eq!(rendered[15], "10");
        let unique: std::collections::HashSet<_> = rendered.iter().collect();
        assert_eq!(unique.len(), rendered.len());
    }

    #[test]
    fn test_decode_header() {
        let msg = SyncMessage::decode(SAMPLE.as_bytes()).unwrap();
        assert_eq!(msg.header.ver_dtd, "1.2");
        assert_eq!(msg.header.ver_proto, "DM/1.2");
        assert_eq!(msg.header.msg_id, "2");
        assert_eq!(msg.header.source_uri, "device-123");
        assert_eq!(msg.header.max_msg_size.as_deref(), Some("524288"));
    }

    #[test]
    fn test_decode_commands() {
        let msg = SyncMessage::decode(SAMPLE.as_bytes()).unwrap();
        let names: Vec<&str> = msg.commands.iter().map(SyncCommand::name).collect();
        assert_eq!(names, ["Status", "Status", "Results", "Alert", "Get", "Final"]);

        match &msg.commands[0] {
            SyncCommand::Status(s) => assert!(s.is_header()),
            other => panic!("unexpected {:?}", other),
        }
        match &msg.commands[1] {
            SyncCommand::Status(s) => {
                assert_eq!(s.data.as_deref(), Some("404"));
                assert_eq!(s.original_error.as_deref(), Some("0x80070002"));
                assert!(s.target_ref.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        match &msg.commands[2] {
            SyncCommand::Results(r) => {
                assert_eq!(r.items[0].source.as_deref(), Some("./DevDetail/SwV"));
                assert_eq!(
                    r.items[0].meta.as_ref().unwrap().format.as_deref(),
                    Some("chr")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        match &msg.commands[3] {
            SyncCommand::Alert(a) => assert_eq!(a.code, ALERT_DEVICE),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&msg.commands[4], SyncCommand::Unrecognized { name, .. } if name == "Get"));
    }

    #[test]
    fn test_decode_rejects_wrong_root() {
        assert!(SyncMessage::decode(b"<Foo/>").is_err());
        assert!(SyncMessage::decode(b"<SyncML><SyncBody/></SyncML>").is_err());
    }

    #[test]
    fn test_response_header_and_final() {
        let msg = SyncMessage::decode(SAMPLE.as_bytes()).unwrap();
        let mut response = SyncResponse::new(&msg.header, 524_288, STATUS_OK);
        assert_eq!(response.ids.next().to_string(), "2");

        let xml = response.encode().unwrap();
        let parsed = xml::parse(xml.as_bytes()).unwrap();
        assert_eq!(
            parsed.text_at(&["SyncHdr", "Target", "LocURI"]),
            Some("device-123")
        );
        assert_eq!(
            parsed.text_at(&["SyncHdr", "Source", "LocURI"]),
            Some("https://mdm.example.com/ManagementServer/Manage.svc")
        );
        let body = parsed.find("SyncBody").unwrap();
        let status = &body.children[0];
        assert_eq!(status.text_at(&["CmdID"]), Some("1"));
        assert_eq!(status.text_at(&["MsgRef"]), Some("2"));
        assert_eq!(status.text_at(&["CmdRef"]), Some("0"));
        assert_eq!(status.text_at(&["Cmd"]), Some("SyncHdr"));
        assert_eq!(status.text_at(&["Data"]), Some("200"));
        assert_eq!(body.children.last().unwrap().local_name(), "Final");
        assert!(xml.starts_with(r#"<SyncML xmlns="SYNCML:SYNCML1.2">"#));
    }
}
