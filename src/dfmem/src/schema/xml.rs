//! Minimal owned DOM over quick-xml events.
//!
//! The df-structures documents are small and the importer needs
//! random-access traversal (members are dispatched on tag names, the
//! "other vectors" builder re-visits elements after every file has been
//! read), so the event stream is materialized into a tree up front.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// XML load errors.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml parse error: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("missing document element")]
    NoDocumentElement,
}

/// An element with its attributes and child elements.
///
/// Text, comments and processing instructions are dropped; the schema
/// format carries everything in elements and attributes.
#[derive(Debug, Clone)]
pub struct XmlNode {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    /// Byte offset of the element in the source, for diagnostics.
    pub offset: usize,
}

impl XmlNode {
    fn new(tag: String, attrs: Vec<(String, String)>, offset: usize) -> Self {
        XmlNode {
            tag,
            attrs,
            children: Vec::new(),
            offset,
        }
    }

    /// Value of the attribute `name`, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Child elements with the given tag name.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |child| child.tag == tag)
    }
}

fn read_attrs(e: &quick_xml::events::BytesStart) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .map(|attr| {
            (
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&attr.value).into_owned(),
            )
        })
        .collect()
}

/// Parse a document and return its document element.
pub fn parse_document(source: &str) -> Result<XmlNode, XmlError> {
    let mut reader = Reader::from_str(source);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root = None;
    let mut buf = Vec::new();
    loop {
        let offset = reader.buffer_position();
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(XmlNode::new(tag, read_attrs(e), offset));
            }
            Event::Empty(ref e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let node = XmlNode::new(tag, read_attrs(e), offset);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {}
                }
            }
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None if root.is_none() => root = Some(node),
                        None => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    root.ok_or(XmlError::NoDocumentElement)
}
