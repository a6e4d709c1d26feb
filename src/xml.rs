//! A small owned XML document tree.
//!
//! The signer has requirements none of the streaming parsers cover on
//! their own: it must mutate a parsed document (stamp the signing time,
//! append the signature, splice in the QR group) and then produce both a
//! regular serialization and a canonical one whose bytes feed the digest.
//! This module keeps a document as an owned [`Element`] tree, built from
//! quick-xml events, and implements the subset of Canonical XML that the
//! fiscal documents exercise: UTF-8 output, no XML declaration, empty
//! elements expanded, namespace declarations before other attributes,
//! attributes sorted by name, and the canonical escaping rules for text
//! and attribute values.
//!
//! Whitespace-only text is dropped at parse time, matching the pretty
//! printed documents the upstream application stores.

use std::fmt;

use quick_xml::Reader;
use quick_xml::events::Event;

//------------ Node ----------------------------------------------------------

/// One node in a document tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

//------------ Element -------------------------------------------------------

/// An element with its attributes and children.
///
/// Names are kept exactly as written, prefix included.  Namespace
/// declarations are ordinary attributes named `xmlns` or `xmlns:*`; they
/// are only treated specially by the canonical serializer, which emits
/// them ahead of other attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name with any prefix stripped.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order, namespace declarations included.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Set an attribute, replacing an existing one of the same name.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Direct child elements, in document order.
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// The concatenated direct text content.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        let mut found = false;
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
                found = true;
            }
        }
        found.then_some(out)
    }

    /// Replace the element's content with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children.retain(|n| matches!(n, Node::Element(_)));
        self.children.insert(0, Node::Text(text.into()));
    }

    /// Find the first element with the given local name, depth first,
    /// starting with this element itself.
    pub fn find(&self, local: &str) -> Option<&Element> {
        if self.local_name() == local {
            return Some(self);
        }
        self.child_elements().find_map(|el| el.find(local))
    }

    /// Mutable variant of [`find()`][Self::find].
    pub fn find_mut(&mut self, local: &str) -> Option<&mut Element> {
        if self.local_name() == local {
            return Some(self);
        }
        for node in &mut self.children {
            if let Node::Element(el) = node {
                if let Some(found) = el.find_mut(local) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Count descendant elements with the given local name.
    pub fn count(&self, local: &str) -> usize {
        let mut n = 0;
        for el in self.child_elements() {
            if el.local_name() == local {
                n += 1;
            }
            n += el.count(local);
        }
        n
    }

    /// Insert an element immediately after the first direct child element
    /// with the given local name.  Returns false if no such child exists.
    pub fn insert_after(&mut self, local: &str, element: Element) -> bool {
        let pos = self.children.iter().position(|n| {
            matches!(n, Node::Element(el) if el.local_name() == local)
        });
        match pos {
            Some(pos) => {
                self.children.insert(pos + 1, Node::Element(element));
                true
            }
            None => false,
        }
    }

    /// Serialize the tree.
    ///
    /// Attributes keep document order and empty elements self-close, the
    /// way the upstream documents are written.
    pub fn serialize(&self, with_decl: bool) -> String {
        let mut out = String::new();
        if with_decl {
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        }
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            escape_attr(value, out);
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write(out),
                Node::Text(t) => escape_text(t, out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Serialize the tree in canonical form.
    ///
    /// Namespace declarations come first (default declaration, then
    /// prefixed ones by prefix), remaining attributes sorted by name,
    /// empty elements expanded, no XML declaration.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);

        let mut attrs: Vec<&(String, String)> = self.attrs.iter().collect();
        attrs.sort_by_key(|(name, _)| attr_rank(name));
        for (name, value) in attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            escape_attr(value, out);
            out.push('"');
        }

        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_canonical(out),
                Node::Text(t) => escape_text(t, out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// The canonical attribute ordering key.
fn attr_rank(name: &str) -> (u8, String) {
    if name == "xmlns" {
        (0, String::new())
    } else if let Some(prefix) = name.strip_prefix("xmlns:") {
        (1, prefix.to_string())
    } else {
        (2, name.to_string())
    }
}

fn escape_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

//------------ parse ---------------------------------------------------------

/// Parse a document into its root element.
///
/// Comments, processing instructions and whitespace-only text are
/// discarded.
pub fn parse(input: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(input);
    let config = reader.config_mut();
    config.trim_text_start = true;
    config.trim_text_end = true;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Err(err) => return Err(XmlError::Parse(err.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) => {
                stack.push(element_from_start(&reader, &start)?);
            }
            Ok(Event::Empty(start)) => {
                let el = element_from_start(&reader, &start)?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::End(_)) => {
                let el = stack.pop().ok_or_else(|| {
                    XmlError::Parse("unexpected closing tag".to_string())
                })?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|err| XmlError::Parse(err.to_string()))?;
                if text.is_empty() {
                    continue;
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Text(text.into_owned())),
                    None => {
                        return Err(XmlError::Parse(
                            "text content outside the root element".to_string(),
                        ));
                    }
                }
            }
            Ok(Event::CData(data)) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(text));
                }
            }
            // Declarations, comments, processing instructions and DTDs
            // carry nothing the lifecycle needs.
            Ok(_) => {}
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Parse("unterminated element".to_string()));
    }
    root.ok_or(XmlError::NoRoot)
}

fn element_from_start(
    reader: &Reader<&[u8]>,
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<Element, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut el = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|err| XmlError::Parse(err.to_string()))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|err| XmlError::Parse(err.to_string()))?
            .into_owned();
        el.attrs.push((name, value));
    }
    Ok(el)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    el: Element,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err(XmlError::Parse(
            "multiple root elements in document".to_string(),
        )),
    }
}

//------------ XmlError ------------------------------------------------------

/// A document could not be read into a tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlError {
    /// The underlying parser rejected the input.
    Parse(String),

    /// The input held no root element.
    NoRoot,
}

impl std::error::Error for XmlError {}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(reason) => write!(f, "malformed XML: {reason}"),
            Self::NoRoot => f.write_str("the document holds no root element"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Element, parse};

    #[test]
    fn parse_drops_insignificant_whitespace() {
        let doc = parse("<a>\n  <b>uno</b>\n  <c/>\n</a>").unwrap();
        assert_eq!(doc.serialize(false), "<a><b>uno</b><c/></a>");
    }

    #[test]
    fn find_includes_self_and_descends() {
        let doc = parse("<rDE><DE Id=\"X\"><g><DE2/></g></DE></rDE>").unwrap();
        assert_eq!(doc.find("rDE").map(|e| e.name()), Some("rDE"));
        assert_eq!(doc.find("DE").and_then(|e| e.attr("Id")), Some("X"));
        assert!(doc.find("nope").is_none());
    }

    #[test]
    fn count_descendants() {
        let doc =
            parse("<a><gCamItem/><x><gCamItem/><gCamItem/></x></a>").unwrap();
        assert_eq!(doc.count("gCamItem"), 3);
    }

    #[test]
    fn set_text_replaces_content() {
        let mut doc = parse("<a><dFecFirma>old</dFecFirma></a>").unwrap();
        doc.find_mut("dFecFirma").unwrap().set_text("2020-01-01T00:00:00");
        assert_eq!(
            doc.serialize(false),
            "<a><dFecFirma>2020-01-01T00:00:00</dFecFirma></a>"
        );
    }

    #[test]
    fn canonical_expands_and_orders() {
        let el = Element::new("e")
            .with_attr("b", "2")
            .with_attr("xmlns:p", "urn:p")
            .with_attr("a", "1")
            .with_attr("xmlns", "urn:d")
            .with_child(Element::new("empty"));
        assert_eq!(
            el.canonical(),
            "<e xmlns=\"urn:d\" xmlns:p=\"urn:p\" a=\"1\" b=\"2\"><empty></empty></e>"
        );
    }

    #[test]
    fn canonical_escaping() {
        let el = Element::new("e")
            .with_attr("a", "x\"y<z\n")
            .with_text("a&b<c>d\r");
        assert_eq!(
            el.canonical(),
            "<e a=\"x&quot;y&lt;z&#xA;\">a&amp;b&lt;c&gt;d&#xD;</e>"
        );
    }

    #[test]
    fn insert_after_named_child() {
        let mut doc = parse("<r><a/><b/></r>").unwrap();
        assert!(doc.insert_after("a", Element::new("n")));
        assert_eq!(doc.serialize(false), "<r><a/><n/><b/></r>");
        assert!(!doc.insert_after("missing", Element::new("n")));
    }

    #[test]
    fn attribute_values_unescape_on_parse() {
        let doc = parse("<a v=\"x&amp;y\"/>").unwrap();
        assert_eq!(doc.attr("v"), Some("x&y"));
        assert_eq!(doc.serialize(false), "<a v=\"x&amp;y\"/>");
    }
}
