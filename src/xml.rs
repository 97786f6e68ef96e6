// SPDX-License-Identifier: MIT

//! Decodes a vendor catalog into a generic element tree.
//!
//! The tree has no domain knowledge: every element keeps its attribute map,
//! its text content and its children in document order. Catalogs are
//! usually stored as UTF-16 little endian with a byte order mark, but UTF-8
//! and BOM-less UTF-16 input are accepted as well.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use xml::reader::{EventReader, XmlEvent};

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    fn new(name: String) -> Self {
        Element {
            name,
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// Text of the first `Display` child, the way catalogs carry
    /// human readable names.
    pub fn display(&self) -> Option<&str> {
        self.child("Display").and_then(|d| d.text.as_deref())
    }

    /// Serializes the element as an opaque JSON payload.
    ///
    /// Attributes land under `$`, text under `_`, and children are grouped
    /// by name into arrays.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if !self.attributes.is_empty() {
            let attrs = self
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect::<Map<String, Value>>();
            map.insert("$".to_string(), Value::Object(attrs));
        }
        if let Some(text) = &self.text {
            map.insert("_".to_string(), Value::String(text.clone()));
        }
        for c in &self.children {
            let entry = map
                .entry(c.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(c.to_json());
            }
        }
        Value::Object(map)
    }
}

/// Turns raw catalog bytes into text.
fn decode_text(bytes: &[u8]) -> std::result::Result<String, String> {
    let utf16 = |data: &[u8], little: bool| -> std::result::Result<String, String> {
        if data.len() % 2 != 0 {
            return Err("odd number of bytes in UTF-16 document".to_string());
        }
        let units = data
            .chunks_exact(2)
            .map(|c| match little {
                true => u16::from_le_bytes([c[0], c[1]]),
                false => u16::from_be_bytes([c[0], c[1]]),
            })
            .collect::<Vec<u16>>();
        String::from_utf16(&units).map_err(|e| e.to_string())
    };

    match bytes {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, true),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, false),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8(rest.to_vec()).map_err(|e| e.to_string()),
        // '<' followed by a zero byte: UTF-16LE without BOM
        [b'<', 0, ..] => utf16(bytes, true),
        [0, b'<', ..] => utf16(bytes, false),
        _ => String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string()),
    }
}

/// The XML declaration names the on-disk encoding (usually utf-16). The
/// text has already been transcoded, so the declaration is dropped before
/// the reader sees it.
fn strip_declaration(text: &str) -> &str {
    let trimmed = text.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    trimmed
}

/// Decodes a catalog document into its root element.
///
/// `path` is only used for error reporting.
pub fn decode(bytes: &[u8], path: &Path) -> Result<Element> {
    let malformed = |message: String| Error::MalformedCatalog {
        path: path.to_path_buf(),
        message,
    };

    let text = decode_text(bytes).map_err(malformed)?;
    let reader = EventReader::new(strip_declaration(&text).as_bytes());

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    for event in reader {
        match event.map_err(|e| malformed(e.to_string()))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if root.is_some() {
                    return Err(malformed("content after the root element".to_string()));
                }
                let mut element = Element::new(name.local_name);
                for a in attributes {
                    element.attributes.insert(a.name.local_name, a.value);
                }
                stack.push(element);
            }
            XmlEvent::EndElement { .. } => {
                let mut element = match stack.pop() {
                    Some(e) => e,
                    None => return Err(malformed("unbalanced end tag".to_string())),
                };
                if let Some(t) = &element.text {
                    let trimmed = t.trim();
                    element.text = match trimmed.is_empty() {
                        true => None,
                        false => Some(trimmed.to_string()),
                    };
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            XmlEvent::Characters(s) | XmlEvent::CData(s) => {
                if let Some(current) = stack.last_mut() {
                    current.text.get_or_insert_with(String::new).push_str(&s);
                }
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed(format!(
            "unexpected end of input, unclosed <{}>",
            stack.last().map(|e| e.name.as_str()).unwrap_or_default()
        )));
    }

    root.ok_or_else(|| malformed("document has no root element".to_string()))
}

/// Reads and decodes a catalog file.
pub fn decode_file(path: &Path) -> Result<Element> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    decode(&bytes, path)
}

#[cfg(test)]
pub(crate) fn utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"<?xml version="1.0" encoding="utf-16"?>
<Manifest baseLocation="downloads.example.com" version="1.00">
  <SoftwareComponent hashMD5="abc" path="FOLDER1/a.EXE">
    <Name><Display lang="en"><![CDATA[BIOS update]]></Display></Name>
    <Category value="BI"><Display lang="en">BIOS</Display></Category>
  </SoftwareComponent>
  <SoftwareComponent hashMD5="def" path="FOLDER2/b.EXE"/>
</Manifest>"#;

    #[test]
    fn decode_utf16_test() {
        let root = decode(&utf16le_with_bom(SMALL), Path::new("c.xml")).unwrap();
        assert_eq!("Manifest", root.name);
        assert_eq!(Some("1.00"), root.attr("version"));
        let comps: Vec<&Element> = root.children_named("SoftwareComponent").collect();
        assert_eq!(2, comps.len());
        assert_eq!(Some("abc"), comps[0].attr("hashMD5"));
        assert_eq!(
            Some("BIOS update"),
            comps[0].child("Name").and_then(|n| n.display())
        );
        assert_eq!(
            Some("BI"),
            comps[0].child("Category").and_then(|c| c.attr("value"))
        );
        assert!(comps[1].children.is_empty());
    }

    #[test]
    fn decode_utf8_test() {
        let root = decode(SMALL.as_bytes(), Path::new("c.xml")).unwrap();
        assert_eq!(2, root.children_named("SoftwareComponent").count());
    }

    #[test]
    fn decode_malformed_test() {
        let truncated = &SMALL[..SMALL.len() - 20];
        match decode(&utf16le_with_bom(truncated), Path::new("bad.xml")) {
            Err(Error::MalformedCatalog { path, .. }) => assert_eq!(Path::new("bad.xml"), path),
            other => panic!("expected MalformedCatalog, got {:?}", other),
        }
        assert!(matches!(
            decode(b"", Path::new("empty.xml")),
            Err(Error::MalformedCatalog { .. })
        ));
    }

    #[test]
    fn to_json_test() {
        let root = decode(SMALL.as_bytes(), Path::new("c.xml")).unwrap();
        let comp = root.child("SoftwareComponent").unwrap();
        let json = comp.to_json();
        assert_eq!("abc", json["$"]["hashMD5"]);
        assert_eq!("BIOS update", json["Name"][0]["Display"][0]["_"]);
        assert_eq!("en", json["Name"][0]["Display"][0]["$"]["lang"]);
    }
}
