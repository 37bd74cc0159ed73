//! Small owned XML element tree.
//!
//! CoT documents are parsed once with `quick-xml` into this tree so that
//! detail elements can be inspected and edited before reserialization.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::core::{CommoError, Result};

/// One node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    /// A nested element.
    Element(XmlElement),
    /// Character data (already unescaped).
    Text(String),
}

/// An element with ordered attributes and children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    /// Element name.
    pub name: String,
    /// Attributes in document order.
    pub attrs: Vec<(String, String)>,
    /// Child nodes in document order.
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    /// Value of an attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// True if the attribute is present.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    /// Set or replace an attribute, keeping its position.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    /// Remove an attribute, returning its value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(idx).1)
    }

    /// Iterate over child elements.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    /// Mutable access to the first child element with the given name.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find_map(|c| match c {
            XmlNode::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// Number of child elements with the given name.
    pub fn count_children(&self, name: &str) -> usize {
        self.elements().filter(|e| e.name == name).count()
    }

    /// Append a child element and return a handle to it.
    pub fn add_child(&mut self, child: XmlElement) -> &mut XmlElement {
        self.children.push(XmlNode::Element(child));
        match self.children.last_mut() {
            Some(XmlNode::Element(e)) => e,
            _ => unreachable!("child was just pushed"),
        }
    }

    /// Return the named child, creating it if needed.
    pub fn child_or_insert(&mut self, name: &str) -> &mut XmlElement {
        let idx = self
            .children
            .iter()
            .position(|c| matches!(c, XmlNode::Element(e) if e.name == name));
        match idx {
            Some(i) => match &mut self.children[i] {
                XmlNode::Element(e) => e,
                XmlNode::Text(_) => unreachable!("position matched an element"),
            },
            None => self.add_child(XmlElement::new(name)),
        }
    }

    /// Remove the first child element with the given name.
    pub fn take_child(&mut self, name: &str) -> Option<XmlElement> {
        let idx = self
            .children
            .iter()
            .position(|c| matches!(c, XmlNode::Element(e) if e.name == name))?;
        match self.children.remove(idx) {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        }
    }

    /// Remove every child element with the given name.
    pub fn remove_children(&mut self, name: &str) {
        self.children
            .retain(|c| !matches!(c, XmlNode::Element(e) if e.name == name));
    }

    /// True if the element has neither attributes nor children.
    pub fn is_bare(&self) -> bool {
        self.attrs.is_empty() && self.children.is_empty()
    }

    /// Append `<name attr="..."` (without the closing bracket) to `out`.
    pub fn write_start(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
    }

    /// Append the compact serialization of this element to `out`.
    pub fn write_to(&self, out: &mut String) {
        self.write_start(out);
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            write_node(child, out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Compact serialization of this element.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }
}

/// Append the serialization of one node to `out`.
pub fn write_node(node: &XmlNode, out: &mut String) {
    match node {
        XmlNode::Element(e) => e.write_to(out),
        XmlNode::Text(t) => out.push_str(&escape(t.as_str())),
    }
}

/// Parse a document and return its root element.
pub fn parse_document(data: &[u8]) -> Result<XmlElement> {
    let text = std::str::from_utf8(data)
        .map_err(|e| CommoError::Parse(format!("xml is not utf-8: {e}")))?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    loop {
        let event = reader
            .read_event()
            .map_err(|e| CommoError::Parse(format!("xml error at {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let el = element_from(&start)?;
                attach(&mut stack, &mut root, el)?;
            }
            Event::End(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| CommoError::Parse("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, el)?;
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| CommoError::Parse(format!("bad text: {e}")))?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::Text(text.into_owned()));
                }
            }
            Event::CData(c) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    parent.children.push(XmlNode::Text(text));
                }
            }
            Event::Eof => break,
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }
    if !stack.is_empty() {
        return Err(CommoError::Parse("unterminated element".into()));
    }
    root.ok_or_else(|| CommoError::Parse("document has no root element".into()))
}

/// Parse a sequence of sibling nodes, such as a protobuf `xmlDetail` body.
pub fn parse_fragment(fragment: &str) -> Result<Vec<XmlNode>> {
    let wrapped = format!("<detail>{fragment}</detail>");
    Ok(parse_document(wrapped.as_bytes())?.children)
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut el = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| CommoError::Parse(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CommoError::Parse(format!("bad attribute value: {e}")))?;
        el.attrs.push((key, value.into_owned()));
    }
    Ok(el)
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, el: XmlElement) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(XmlNode::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err(CommoError::Parse("multiple root elements".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_write() {
        let doc = br#"<?xml version="1.0"?><a x="1&amp;2"><b/>text<c y="z"></c></a>"#;
        let root = parse_document(doc).unwrap();
        assert_eq!(root.name, "a");
        assert_eq!(root.attr("x"), Some("1&2"));
        assert!(root.child("b").is_some());
        assert_eq!(root.child("c").unwrap().attr("y"), Some("z"));
        assert_eq!(root.to_xml(), r#"<a x="1&amp;2"><b/>text<c y="z"/></a>"#);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_document(b"<a><b></a>").is_err());
        assert!(parse_document(b"").is_err());
        assert!(parse_document(b"<a/><b/>").is_err());
    }

    #[test]
    fn test_attr_edit() {
        let mut el = XmlElement::new("contact").with_attr("endpoint", "a").with_attr("callsign", "b");
        el.set_attr("endpoint", "c");
        assert_eq!(el.attrs[0], ("endpoint".to_string(), "c".to_string()));
        assert_eq!(el.remove_attr("callsign"), Some("b".to_string()));
        assert!(el.remove_attr("callsign").is_none());
    }

    #[test]
    fn test_fragment() {
        let nodes = parse_fragment(r#"<x a="1"/><y/>"#).unwrap();
        assert_eq!(nodes.len(), 2);
    }
}
