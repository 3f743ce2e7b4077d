//! Descriptor parsing, canonicalization and identity binding.
//!
//! A descriptor is parsed into a generic element tree. Only the root element
//! name and the `<uuid>` child are understood; everything else is carried
//! through untouched, so any field libvirt accepts survives a round trip.
//!
//! The canonical form is what callers store and compare for drift:
//!
//! - declaration, comments, processing instructions and doctype are dropped
//! - attributes are sorted by name
//! - whitespace-only text is dropped, other text is trimmed
//! - childless elements self-close, text-only elements stay on one line
//! - two-space indentation, one child per line, trailing newline

use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::types::{Identity, ObjectKind};

const IDENTITY_ELEMENT: &str = "uuid";
const NAME_ELEMENT: &str = "name";

type Result<T> = std::result::Result<T, ParseError>;

/// A node of the descriptor tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with order-insensitive attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Element holding a single text node.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            children: vec![Node::Text(text.into())],
        }
    }

    /// Child elements with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter_map(move |node| match node {
            Node::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    /// Concatenated text content of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    fn position_of(&self, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|node| matches!(node, Node::Element(el) if el.name == name))
    }

    /// Append raw text, merging with a preceding text run. Comments and
    /// CDATA sections split one run into several events.
    fn push_text(&mut self, text: &str) {
        match self.children.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(text),
            _ => self.children.push(Node::Text(text.to_string())),
        }
    }

    /// Trim each text run and drop the whitespace-only ones. Runs only once
    /// the element is closed, so inner whitespace of a split run survives.
    fn finish_text(&mut self) {
        self.children.retain_mut(|node| match node {
            Node::Text(text) => {
                let trimmed = text.trim();
                if trimmed.len() != text.len() {
                    *text = trimmed.to_string();
                }
                !text.is_empty()
            }
            Node::Element(_) => true,
        });
    }
}

/// A parsed descriptor of a known kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    kind: ObjectKind,
    root: Element,
}

impl Descriptor {
    /// Parse `raw` and check it against the kind's schema.
    pub fn parse(raw: &str, kind: ObjectKind) -> Result<Self> {
        let root = parse_tree(raw, kind)?;

        if root.name != kind.root_element() {
            return Err(ParseError::WrongRoot {
                expected: kind,
                found: root.name,
            });
        }

        let descriptor = Self { kind, root };
        descriptor.check_identity()?;
        Ok(descriptor)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Value of the `<name>` field, if present.
    pub fn name(&self) -> Option<String> {
        self.root.children_named(NAME_ELEMENT).next().map(Element::text)
    }

    /// The identity declared in the descriptor, if any.
    pub fn identity(&self) -> Option<Identity> {
        self.root
            .children_named(IDENTITY_ELEMENT)
            .next()
            .and_then(|el| Identity::parse(&el.text()).ok())
    }

    /// Overwrite the `<uuid>` field, inserting it right after `<name>` when
    /// the descriptor has none.
    pub fn set_identity(&mut self, identity: &Identity) {
        let uuid = Element::with_text(IDENTITY_ELEMENT, identity.to_string());

        if let Some(idx) = self.root.position_of(IDENTITY_ELEMENT) {
            self.root.children[idx] = Node::Element(uuid);
            return;
        }

        let at = self
            .root
            .position_of(NAME_ELEMENT)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        self.root.children.insert(at, Node::Element(uuid));
    }

    /// Remove the `<uuid>` field. Returns whether one was present.
    pub fn clear_identity(&mut self) -> bool {
        let before = self.root.children.len();
        self.root
            .children
            .retain(|node| !matches!(node, Node::Element(el) if el.name == IDENTITY_ELEMENT));
        self.root.children.len() != before
    }

    /// Serialize in canonical form.
    pub fn to_canonical(&self) -> String {
        let mut out = String::new();
        write_element(&mut out, &self.root, 0);
        out
    }

    fn check_identity(&self) -> Result<()> {
        let uuids: Vec<&Element> = self.root.children_named(IDENTITY_ELEMENT).collect();
        match uuids.as_slice() {
            [] => Ok(()),
            [uuid] => {
                let value = uuid.text();
                Identity::parse(&value)
                    .map(|_| ())
                    .map_err(|e| ParseError::InvalidIdentity {
                        kind: self.kind,
                        value,
                        reason: e.to_string(),
                    })
            }
            many => Err(ParseError::DuplicateIdentity {
                kind: self.kind,
                count: many.len(),
            }),
        }
    }
}

/// Validate a raw descriptor without producing output.
pub fn validate(raw: &str, kind: ObjectKind) -> Result<()> {
    Descriptor::parse(raw, kind).map(|_| ())
}

/// Canonical form of a raw descriptor.
pub fn canonicalize(raw: &str, kind: ObjectKind) -> Result<String> {
    Descriptor::parse(raw, kind).map(|d| d.to_canonical())
}

/// Canonical form of `raw` with its identity field set to `identity`.
///
/// Redefinitions must carry the existing identity, otherwise the hypervisor
/// treats them as a second object with the same name.
pub fn bind_identity(raw: &str, kind: ObjectKind, identity: &Identity) -> Result<String> {
    let mut descriptor = Descriptor::parse(raw, kind)?;
    descriptor.set_identity(identity);
    Ok(descriptor.to_canonical())
}

// =============================================================================
// PARSING
// =============================================================================

fn malformed(kind: ObjectKind, reason: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        kind,
        reason: reason.into(),
    }
}

fn parse_tree(raw: &str, kind: ObjectKind) -> Result<Element> {
    let mut reader = Reader::from_str(raw);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            malformed(kind, format!("at byte {}: {}", reader.buffer_position(), e))
        })?;

        match event {
            Event::Start(start) => {
                let el = element_from(&start, kind)?;
                if stack.is_empty() && root.is_some() {
                    return Err(malformed(kind, format!("second root element <{}>", el.name)));
                }
                stack.push(el);
            }
            Event::Empty(start) => {
                let el = element_from(&start, kind)?;
                attach(&mut stack, &mut root, el, kind)?;
            }
            Event::End(end) => {
                let mut el = stack.pop().ok_or_else(|| {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    malformed(kind, format!("unexpected closing tag </{}>", name))
                })?;
                el.finish_text();
                attach(&mut stack, &mut root, el, kind)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| malformed(kind, format!("bad text content: {}", e)))?;
                add_text(&mut stack, &text, kind)?;
            }
            Event::CData(cdata) => {
                let text = std::str::from_utf8(&cdata)
                    .map_err(|e| malformed(kind, format!("bad CDATA content: {}", e)))?;
                add_text(&mut stack, text, kind)?;
            }
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if let Some(open) = stack.last() {
        return Err(malformed(kind, format!("unclosed element <{}>", open.name)));
    }

    root.ok_or(ParseError::Empty { kind })
}

fn element_from(start: &BytesStart<'_>, kind: ObjectKind) -> Result<Element> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| malformed(kind, format!("bad element name: {}", e)))?
        .to_string();

    let mut el = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(kind, format!("bad attribute in <{}>: {}", el.name, e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| malformed(kind, format!("bad attribute name: {}", e)))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(kind, format!("bad value for attribute '{}': {}", key, e)))?
            .into_owned();
        el.attributes.insert(key, value);
    }
    Ok(el)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    el: Element,
    kind: ObjectKind,
) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err(malformed(kind, format!("second root element <{}>", el.name))),
    }
}

fn add_text(stack: &mut [Element], text: &str, kind: ObjectKind) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.push_text(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(malformed(kind, "text outside the root element")),
    }
}

// =============================================================================
// SERIALIZATION
// =============================================================================

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_element(out: &mut String, el: &Element, depth: usize) {
    indent(out, depth);
    out.push('<');
    out.push_str(&el.name);
    for (key, value) in &el.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }

    match el.children.as_slice() {
        [] => out.push_str("/>\n"),
        [Node::Text(text)] => {
            out.push('>');
            out.push_str(&partial_escape(text.as_str()));
            out.push_str("</");
            out.push_str(&el.name);
            out.push_str(">\n");
        }
        children => {
            out.push_str(">\n");
            for child in children {
                match child {
                    Node::Element(child) => write_element(out, child, depth + 1),
                    Node::Text(text) => {
                        indent(out, depth + 1);
                        out.push_str(&partial_escape(text.as_str()));
                        out.push('\n');
                    }
                }
            }
            indent(out, depth);
            out.push_str("</");
            out.push_str(&el.name);
            out.push_str(">\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"<?xml version="1.0"?>
<!-- managed by vrecon -->
<domain type='kvm'>
  <name>vm1</name>
  <memory unit='MiB'>2048</memory>
  <vcpu placement='static'>2</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/vm1.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
  </devices>
</domain>
"#;

    #[test]
    fn test_canonical_form_layout() {
        let canonical = canonicalize("<domain type='kvm'><name>vm1</name><features><acpi/></features></domain>", ObjectKind::Domain).unwrap();

        assert_eq!(
            canonical,
            "<domain type=\"kvm\">\n  <name>vm1</name>\n  <features>\n    <acpi/>\n  </features>\n</domain>\n"
        );
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let once = canonicalize(DOMAIN_XML, ObjectKind::Domain).unwrap();
        let twice = canonicalize(&once, ObjectKind::Domain).unwrap();
        assert_eq!(once, twice);
        assert!(!once.contains("managed by vrecon"));
        assert!(!once.contains("<?xml"));
    }

    #[test]
    fn test_attribute_order_and_whitespace_are_insignificant() {
        let a = "<domain type='kvm'><name>vm1</name><disk type='file' device='disk'/></domain>";
        let b = "<domain   type=\"kvm\">\n\n   <name>  vm1 </name>\n  <disk device=\"disk\"\n type=\"file\" />\n</domain>";

        assert_eq!(
            canonicalize(a, ObjectKind::Domain).unwrap(),
            canonicalize(b, ObjectKind::Domain).unwrap()
        );
    }

    #[test]
    fn test_child_order_is_preserved() {
        let a = canonicalize("<network><name>n</name><bridge name='br0'/></network>", ObjectKind::Network).unwrap();
        let b = canonicalize("<network><bridge name='br0'/><name>n</name></network>", ObjectKind::Network).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_escaping_round_trips() {
        let raw = "<domain><name>a&amp;b</name><description>x &lt; y</description><metadata note='say &quot;hi&quot; &apos;now&apos;'/></domain>";
        let canonical = canonicalize(raw, ObjectKind::Domain).unwrap();

        assert!(canonical.contains("<name>a&amp;b</name>"));
        assert!(canonical.contains("<description>x &lt; y</description>"));
        assert_eq!(canonicalize(&canonical, ObjectKind::Domain).unwrap(), canonical);

        let parsed = Descriptor::parse(&canonical, ObjectKind::Domain).unwrap();
        assert_eq!(parsed.name().as_deref(), Some("a&b"));
    }

    #[test]
    fn test_cdata_and_mixed_content_are_stable() {
        let raw = "<domain><name>vm1</name><description>first<![CDATA[ <raw> ]]><br/>second</description></domain>";
        let once = canonicalize(raw, ObjectKind::Domain).unwrap();
        assert_eq!(canonicalize(&once, ObjectKind::Domain).unwrap(), once);
        assert!(once.contains("first &lt;raw&gt;"));
    }

    #[test]
    fn test_text_split_by_comment_keeps_inner_whitespace() {
        let raw = "<domain><name>vm1</name><description>web server <!-- prod --> east</description></domain>";
        let canonical = canonicalize(raw, ObjectKind::Domain).unwrap();

        assert!(canonical.contains("<description>web server  east</description>"));
        assert_eq!(canonicalize(&canonical, ObjectKind::Domain).unwrap(), canonical);

        let raw = "<network><name> lan <![CDATA[a  b]]> </name></network>";
        let descriptor = Descriptor::parse(raw, ObjectKind::Network).unwrap();
        assert_eq!(descriptor.name().as_deref(), Some("lan a  b"));
    }

    #[test]
    fn test_namespaced_metadata_passes_through() {
        let raw = r#"<domain xmlns:qemu="http://libvirt.org/schemas/domain/qemu/1.0"><name>vm1</name><qemu:commandline><qemu:arg value="-s"/></qemu:commandline></domain>"#;
        let canonical = canonicalize(raw, ObjectKind::Domain).unwrap();
        assert!(canonical.contains("<qemu:arg value=\"-s\"/>"));
        assert!(canonical.contains("xmlns:qemu=\"http://libvirt.org/schemas/domain/qemu/1.0\""));
    }

    #[test]
    fn test_wrong_root_is_rejected() {
        let err = canonicalize("<network><name>n</name></network>", ObjectKind::Domain).unwrap_err();
        assert_eq!(
            err,
            ParseError::WrongRoot {
                expected: ObjectKind::Domain,
                found: "network".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        for raw in [
            "<domain><name>vm1</domain>",
            "<domain><name>vm1</name>",
            "<domain/><domain/>",
            "vm1",
            "<domain a='1' a='2'/>",
        ] {
            let err = validate(raw, ObjectKind::Domain).unwrap_err();
            assert!(
                matches!(err, ParseError::Malformed { .. }),
                "expected malformed for {:?}, got {:?}",
                raw,
                err
            );
        }

        assert_eq!(
            validate("  <!-- nothing -->  ", ObjectKind::Network).unwrap_err(),
            ParseError::Empty {
                kind: ObjectKind::Network
            }
        );
    }

    #[test]
    fn test_identity_field_is_validated() {
        let err = validate("<domain><uuid>not-a-uuid</uuid></domain>", ObjectKind::Domain).unwrap_err();
        assert!(matches!(err, ParseError::InvalidIdentity { .. }));

        let id = Identity::generate();
        let raw = format!("<domain><uuid>{id}</uuid><uuid>{id}</uuid></domain>");
        let err = validate(&raw, ObjectKind::Domain).unwrap_err();
        assert_eq!(
            err,
            ParseError::DuplicateIdentity {
                kind: ObjectKind::Domain,
                count: 2
            }
        );
    }

    #[test]
    fn test_bind_inserts_identity_after_name() {
        let id = Identity::generate();
        let bound = bind_identity(DOMAIN_XML, ObjectKind::Domain, &id).unwrap();

        let expected_prefix = format!(
            "<domain type=\"kvm\">\n  <name>vm1</name>\n  <uuid>{}</uuid>\n  <memory unit=\"MiB\">2048</memory>\n",
            id
        );
        assert!(bound.starts_with(&expected_prefix), "got:\n{}", bound);

        let parsed = Descriptor::parse(&bound, ObjectKind::Domain).unwrap();
        assert_eq!(parsed.identity(), Some(id));
    }

    #[test]
    fn test_bind_replaces_existing_identity_and_preserves_the_rest() {
        let old = Identity::generate();
        let new = Identity::generate();
        let raw = format!(
            "<network><name>lan</name><uuid>{old}</uuid><bridge name='virbr1' stp='on'/><ip address='10.0.0.1' netmask='255.255.255.0'/></network>"
        );

        let original = canonicalize(&raw, ObjectKind::Network).unwrap();
        let bound = bind_identity(&raw, ObjectKind::Network, &new).unwrap();

        assert_eq!(original.replace(&old.to_string(), &new.to_string()), bound);
    }

    #[test]
    fn test_bind_without_name_puts_identity_first() {
        let id = Identity::generate();
        let bound = bind_identity("<network><bridge name='br0'/></network>", ObjectKind::Network, &id).unwrap();
        assert_eq!(
            bound,
            format!("<network>\n  <uuid>{id}</uuid>\n  <bridge name=\"br0\"/>\n</network>\n")
        );
    }

    #[test]
    fn test_bind_rejects_malformed_input() {
        let id = Identity::generate();
        assert!(bind_identity("<domain>", ObjectKind::Domain, &id).is_err());
    }

    #[test]
    fn test_clear_identity() {
        let id = Identity::generate();
        let raw = format!("<domain><name>vm1</name><uuid>{id}</uuid></domain>");
        let mut descriptor = Descriptor::parse(&raw, ObjectKind::Domain).unwrap();

        assert!(descriptor.clear_identity());
        assert!(descriptor.identity().is_none());
        assert!(!descriptor.clear_identity());
        assert_eq!(descriptor.to_canonical(), "<domain>\n  <name>vm1</name>\n</domain>\n");
    }
}
