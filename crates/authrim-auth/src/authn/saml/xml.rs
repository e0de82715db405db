//! SAML XML parsing.
//!
//! A small DOM built on the streaming reader, tracking each element's byte
//! span in the source document. Spans are what make XML-Signature
//! verification possible without a full canonicalization engine: the digest
//! input for an enveloped signature is the signed element's raw bytes with
//! the `Signature` subtree spliced out.
//!
//! External entity processing is rejected before parsing: any document
//! containing a DTD (`<!DOCTYPE`, `<!ENTITY`, or declarations referencing
//! `SYSTEM` / `PUBLIC` sources) is refused outright.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::AuthError;

/// A parsed element with its byte span in the source.
#[derive(Debug, Clone)]
pub struct Element {
    /// Local name (namespace prefix stripped).
    pub name: String,
    /// Attributes as `(local_name, value)`.
    pub attributes: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<Element>,
    /// Concatenated direct text content.
    pub text: String,
    /// Byte offset of the opening `<`.
    pub start: usize,
    /// Byte offset just past the closing `>`.
    pub end: usize,
}

impl Element {
    /// First attribute with the given local name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given local name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given local name.
    #[must_use]
    pub fn children_named(&self, name: &str) -> Vec<&Element> {
        self.children.iter().filter(|c| c.name == name).collect()
    }

    /// First descendant (depth-first) with the given local name.
    #[must_use]
    pub fn descendant(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given local name.
    #[must_use]
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }

    /// Trimmed text content.
    #[must_use]
    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }

    /// Collects every `ID` attribute value in the subtree, for duplicate
    /// detection (signature wrapping uses colliding IDs).
    #[must_use]
    pub fn collect_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_ids_into(&mut ids);
        ids
    }

    fn collect_ids_into(&self, ids: &mut Vec<String>) {
        if let Some(id) = self.attr("ID") {
            ids.push(id.to_string());
        }
        for child in &self.children {
            child.collect_ids_into(ids);
        }
    }
}

fn local_name(qname: &[u8]) -> String {
    let name = String::from_utf8_lossy(qname);
    match name.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => name.to_string(),
    }
}

/// Refuses documents carrying a DTD.
///
/// # Errors
///
/// Returns `invalid_request` when any DTD construct is present.
pub fn reject_dtd(xml: &str) -> Result<(), AuthError> {
    let upper = xml.to_ascii_uppercase();
    if upper.contains("<!DOCTYPE") || upper.contains("<!ENTITY") {
        return Err(AuthError::invalid_request("XML documents with a DTD are not accepted"));
    }
    // Declarations sourcing external content.
    let mut rest = upper.as_str();
    while let Some(pos) = rest.find("<!") {
        let declaration = &rest[pos..rest[pos..].find('>').map_or(rest.len(), |e| pos + e)];
        if declaration.contains("SYSTEM") || declaration.contains("PUBLIC") {
            return Err(AuthError::invalid_request(
                "XML documents with external declarations are not accepted",
            ));
        }
        rest = &rest[pos + 2..];
    }
    Ok(())
}

/// Parses a document into its root element.
///
/// # Errors
///
/// Returns `invalid_request` for DTD constructs or malformed XML.
pub fn parse_document(xml: &str) -> Result<Element, AuthError> {
    reject_dtd(xml)?;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let pos_before = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .map_err(|_| AuthError::invalid_request("Malformed XML"))?;
        let pos_after = reader.buffer_position() as usize;

        match event {
            Event::Start(start) => {
                let mut element = Element {
                    name: local_name(start.name().as_ref()),
                    attributes: Vec::new(),
                    children: Vec::new(),
                    text: String::new(),
                    start: pos_before,
                    end: pos_after,
                };
                for attr in start.attributes().flatten() {
                    element.attributes.push((
                        local_name(attr.key.as_ref()),
                        attr.unescape_value()
                            .map_err(|_| AuthError::invalid_request("Malformed XML attribute"))?
                            .to_string(),
                    ));
                }
                stack.push(element);
            }
            Event::Empty(start) => {
                let mut element = Element {
                    name: local_name(start.name().as_ref()),
                    attributes: Vec::new(),
                    children: Vec::new(),
                    text: String::new(),
                    start: pos_before,
                    end: pos_after,
                };
                for attr in start.attributes().flatten() {
                    element.attributes.push((
                        local_name(attr.key.as_ref()),
                        attr.unescape_value()
                            .map_err(|_| AuthError::invalid_request("Malformed XML attribute"))?
                            .to_string(),
                    ));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => {
                        return Err(AuthError::invalid_request("Multiple XML roots"));
                    }
                }
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| AuthError::invalid_request("Unbalanced XML"))?;
                element.end = pos_after;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => {
                        return Err(AuthError::invalid_request("Multiple XML roots"));
                    }
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(
                        &text
                            .unescape()
                            .map_err(|_| AuthError::invalid_request("Malformed XML text"))?,
                    );
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(AuthError::invalid_request("Unbalanced XML"));
    }
    root.ok_or_else(|| AuthError::invalid_request("Empty XML document"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="r1" Destination="https://sp.example/acs">
  <saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">https://idp.example</saml:Issuer>
  <saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="a1">
    <saml:Subject><saml:NameID>user@x</saml:NameID></saml:Subject>
  </saml:Assertion>
</samlp:Response>"#;

    #[test]
    fn test_parse_structure() {
        let root = parse_document(SAMPLE).unwrap();
        assert_eq!(root.name, "Response");
        assert_eq!(root.attr("Destination").unwrap(), "https://sp.example/acs");
        assert_eq!(root.child("Issuer").unwrap().trimmed_text(), "https://idp.example");
        let assertion = root.child("Assertion").unwrap();
        assert_eq!(assertion.attr("ID").unwrap(), "a1");
        assert_eq!(
            assertion.descendant("NameID").unwrap().trimmed_text(),
            "user@x"
        );
    }

    #[test]
    fn test_spans_cover_elements() {
        let root = parse_document(SAMPLE).unwrap();
        let assertion = root.child("Assertion").unwrap();
        let slice = &SAMPLE[assertion.start..assertion.end];
        assert!(slice.starts_with("<saml:Assertion"));
        assert!(slice.ends_with("</saml:Assertion>"));
    }

    #[test]
    fn test_collect_ids() {
        let root = parse_document(SAMPLE).unwrap();
        let mut ids = root.collect_ids();
        ids.sort();
        assert_eq!(ids, vec!["a1", "r1"]);
    }

    #[test]
    fn test_doctype_rejected() {
        let xml = r#"<?xml version="1.0"?><!DOCTYPE foo [<!ENTITY x "y">]><a>&x;</a>"#;
        assert!(parse_document(xml).is_err());
    }

    #[test]
    fn test_external_entity_rejected() {
        let xml = r#"<!DOCTYPE a SYSTEM "http://evil.example/a.dtd"><a/>"#;
        assert!(parse_document(xml).is_err());
    }

    #[test]
    fn test_unbalanced_rejected() {
        assert!(parse_document("<a><b></a>").is_err());
    }
}
