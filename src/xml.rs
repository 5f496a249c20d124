//! XML element tree shared by the SOAP, WAP and SyncML layers.
//!
//! Parsing uses quick-xml which never expands entities; documents carrying a
//! DOCTYPE or entity declaration are rejected before the reader runs.

use crate::error::MdmError;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Declaration prepended to standalone documents.
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// An XML element with its attributes, text content and children.
///
/// Names are kept as written (`s:Envelope`); lookups compare local names so
/// callers are not tied to the prefixes a client happens to choose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Qualified name
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Concatenated text content
    pub text: Option<String>,
    /// Child elements in document order
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// An element marked `xsi:nil="true"`.
    pub fn nil(name: impl Into<String>) -> Self {
        Self::new(name).with_attr("xsi:nil", "true")
    }

    /// An element holding only text.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).with_text(text)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    /// Attribute value by local name. Namespace declarations are skipped.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|(key, _)| key != "xmlns" && !key.starts_with("xmlns:"))
            .find(|(key, _)| local_part(key) == local)
            .map(|(_, value)| value.as_str())
    }

    /// First child with the given local name.
    pub fn find(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    /// All children with the given local name.
    pub fn find_all<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.local_name() == local)
    }

    /// Descend through children by local name.
    pub fn path(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.find(name))
    }

    /// Text content, or the empty string.
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// Text content of the element reached by `path`.
    pub fn text_at(&self, path: &[&str]) -> Option<&str> {
        self.path(path).map(Element::text)
    }

    /// Serialize without an XML declaration.
    pub fn to_xml(&self) -> Result<String, MdmError> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, self)?;
        String::from_utf8(writer.into_inner()).map_err(|e| MdmError::XmlEncode(e.to_string()))
    }

    /// Serialize as a standalone UTF-8 document.
    pub fn to_document(&self) -> Result<String, MdmError> {
        Ok(format!("{}{}", XML_DECLARATION, self.to_xml()?))
    }
}

fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, local)| local).unwrap_or(name)
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) -> Result<(), MdmError> {
    let mut start = BytesStart::new(el.name.as_str());
    for (key, value) in &el.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    writer.write_event(Event::Start(start)).map_err(encode_err)?;

    if let Some(text) = &el.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(encode_err)?;
    }

    for child in &el.children {
        write_element(writer, child)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(el.name.as_str())))
        .map_err(encode_err)?;
    Ok(())
}

fn encode_err(e: impl std::fmt::Display) -> MdmError {
    MdmError::XmlEncode(e.to_string())
}

/// Parse raw bytes into an element tree rooted at the document element.
pub fn parse(data: &[u8]) -> Result<Element, MdmError> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| MdmError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

    check_entity_declarations(xml_str)?;

    let mut reader = Reader::from_str(xml_str);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(element_from_start(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let el = element_from_start(&e)?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::End(_)) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| MdmError::XmlParse("Unexpected closing tag".to_string()))?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| MdmError::XmlParse(e.to_string()))?;
                append_text(&mut stack, &text);
            }
            Ok(Event::CData(e)) => {
                let raw = e.into_inner();
                append_text(&mut stack, &String::from_utf8_lossy(&raw));
            }
            Ok(Event::DocType(_)) => {
                return Err(MdmError::XmlParse(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(MdmError::XmlParse(format!(
                    "Error at position {}: {}",
                    reader.error_position(),
                    e
                )));
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(MdmError::XmlParse("Unclosed element".to_string()));
    }
    root.ok_or_else(|| MdmError::XmlParse("Empty document".to_string()))
}

fn element_from_start(e: &BytesStart) -> Result<Element, MdmError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut el = Element::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| MdmError::XmlParse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| MdmError::XmlParse(e.to_string()))?
            .into_owned();
        el.attributes.push((key, value));
    }
    Ok(el)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) -> Result<(), MdmError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(el);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err(MdmError::XmlParse("Multiple root elements".to_string())),
    }
}

fn append_text(stack: &mut [Element], text: &str) {
    if let Some(current) = stack.last_mut() {
        current.text.get_or_insert_with(String::new).push_str(text);
    }
}

/// Reject DOCTYPE and entity declarations outright.
fn check_entity_declarations(xml: &str) -> Result<(), MdmError> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(MdmError::XmlParse(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }

    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(MdmError::XmlParse(
            "Entity declarations are not allowed".to_string(),
        ));
    }

    Ok(())
}
