//! Office Open XML plumbing shared by the DOCX, PPTX, and XLSX extractors: zip part access,
//! relationship resolution, and a small element tree built from `quick-xml` events.

use super::ExtractionError;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use zip::ZipArchive;
use zip::result::ZipError;

const MAX_COLUMN_LETTERS: usize = 3;
const MAX_COLUMN: u32 = 16_384;
const MAX_ROW: u32 = 1_048_576;
/// Largest decompressed part read from a package.
pub(crate) const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

/// Read-only view over an OOXML zip package.
pub(crate) struct Package<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    kind: &'static str,
    part_limit: u64,
}

impl<'a> Package<'a> {
    /// Open `bytes` as a zip container holding a `kind` document.
    pub(crate) fn open(bytes: &'a [u8], kind: &'static str) -> Result<Self, ExtractionError> {
        let archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| {
            ExtractionError::CorruptDocument(format!("{kind} container is not a readable zip: {err}"))
        })?;
        Ok(Self {
            archive,
            kind,
            part_limit: MAX_PART_BYTES,
        })
    }

    #[cfg(test)]
    fn with_part_limit(mut self, limit: u64) -> Self {
        self.part_limit = limit;
        self
    }

    /// Read a part as UTF-8 text.
    ///
    /// Decompression stops once the part grows past the package's part limit, whatever size the
    /// zip directory declares.
    pub(crate) fn read_part(&mut self, name: &str) -> Result<String, String> {
        let limit = self.part_limit;
        let file = self.archive.by_name(name).map_err(|err| match err {
            ZipError::FileNotFound => format!("missing part {name}"),
            other => format!("unreadable part {name}: {other}"),
        })?;
        if file.size() > limit {
            return Err(format!("part {name} exceeds {limit} bytes"));
        }
        let mut buffer = Vec::new();
        file.take(limit + 1)
            .read_to_end(&mut buffer)
            .map_err(|err| format!("unreadable part {name}: {err}"))?;
        if buffer.len() as u64 > limit {
            return Err(format!("part {name} exceeds {limit} bytes"));
        }
        String::from_utf8(buffer).map_err(|_| format!("part {name} is not valid UTF-8"))
    }

    /// Read the part the whole document hangs off.
    ///
    /// A missing root part means the zip is some other kind of container; an unreadable one means
    /// the package is corrupt.
    pub(crate) fn root_part(&mut self, name: &str) -> Result<String, ExtractionError> {
        if self.archive.by_name(name).is_err() {
            return Err(ExtractionError::UnsupportedDocument(format!(
                "not a {} package: missing {name}",
                self.kind
            )));
        }
        self.read_part(name).map_err(ExtractionError::CorruptDocument)
    }

    /// Parse the root part into an element tree.
    pub(crate) fn root_element(&mut self, name: &str) -> Result<XmlElement, ExtractionError> {
        let xml = self.root_part(name)?;
        parse_xml(&xml, false).map_err(|err| {
            ExtractionError::CorruptDocument(format!("{} {name}: {err}", self.kind))
        })
    }

    /// Relationships of `part`, keyed by relationship id, with targets resolved to part names.
    ///
    /// A missing relationships part yields an empty map.
    pub(crate) fn relationships(&mut self, part: &str) -> Result<HashMap<String, String>, String> {
        let rels_name = rels_path_for(part);
        let xml = match self.read_part(&rels_name) {
            Ok(xml) => xml,
            Err(_) => return Ok(HashMap::new()),
        };
        let root = parse_xml(&xml, false)?;
        Ok(root
            .children_named("Relationship")
            .filter(|rel| rel.attr("TargetMode") != Some("External"))
            .filter_map(|rel| {
                let id = rel.attr("Id")?;
                let target = rel.attr("Target")?;
                Some((id.to_string(), resolve_target(part, target)))
            })
            .collect())
    }
}

/// Path of the relationships part describing `part`.
pub(crate) fn rels_path_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Resolve a relationship target relative to the part that declares it.
pub(crate) fn resolve_target(base_part: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = match base_part.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Node of the element tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// Element with local name, qualified attributes, and ordered children.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Attribute by qualified name (`r:id`), falling back to the local name (`val` for `w:val`).
    pub(crate) fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(key, _)| key.rsplit(':').next() == Some(name))
            })
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            XmlNode::Text(_) => None,
        })
    }

    pub(crate) fn children_named<'s>(
        &'s self,
        name: &'s str,
    ) -> impl Iterator<Item = &'s XmlElement> + 's {
        self.elements().filter(move |element| element.name == name)
    }

    pub(crate) fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|element| element.name == name)
    }

    /// Follow a path of child names.
    pub(crate) fn path(&self, names: &[&str]) -> Option<&XmlElement> {
        names
            .iter()
            .try_fold(self, |element, name| element.child(name))
    }

    /// Descendants named `name`, in document order, without descending into matches.
    pub(crate) fn find_all<'s>(&'s self, name: &str, out: &mut Vec<&'s XmlElement>) {
        for element in self.elements() {
            if element.name == name {
                out.push(element);
            } else {
                element.find_all(name, out);
            }
        }
    }

    /// Concatenated text of every descendant element named `text_tag`.
    pub(crate) fn text_of(&self, text_tag: &str) -> String {
        let mut out = String::new();
        self.collect_text(text_tag, false, &mut out);
        out
    }

    fn collect_text(&self, text_tag: &str, inside: bool, out: &mut String) {
        let inside = inside || self.name == text_tag;
        for node in &self.children {
            match node {
                XmlNode::Text(text) if inside => out.push_str(text),
                XmlNode::Text(_) => {}
                XmlNode::Element(element) => element.collect_text(text_tag, inside, out),
            }
        }
    }
}

/// Parse `xml` into an element tree and return its root element.
///
/// In strict mode mismatched end tags, unclosed elements, and undecodable entities are errors;
/// otherwise they are tolerated so a damaged package can still be walked.
pub(crate) fn parse_xml(xml: &str, strict: bool) -> Result<XmlElement, String> {
    let mut reader = Reader::from_str(xml);
    reader.check_end_names(strict);

    let mut stack: Vec<XmlElement> = vec![XmlElement::default()];
    loop {
        match reader.read_event().map_err(|err| err.to_string())? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::Element(element));
                }
            }
            Event::End(_) => {
                if stack.len() > 1 {
                    close_top(&mut stack);
                } else if strict {
                    return Err("unexpected closing tag".to_string());
                }
            }
            Event::Text(text) => {
                let value = match text.unescape() {
                    Ok(value) => value.into_owned(),
                    Err(err) if strict => return Err(err.to_string()),
                    Err(_) => String::from_utf8_lossy(&text).into_owned(),
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::Text(value));
                }
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::Text(value));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() > 1 && strict {
        return Err("unclosed element".to_string());
    }
    while stack.len() > 1 {
        close_top(&mut stack);
    }
    stack
        .pop()
        .and_then(|document| document.elements().next().cloned())
        .ok_or_else(|| "no root element".to_string())
}

fn close_top(stack: &mut Vec<XmlElement>) {
    if let Some(element) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(XmlNode::Element(element));
        }
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, String> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| err.to_string())?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| err.to_string())?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

/// Byte ranges of the direct children of the first element named `parent`.
///
/// The scan only tracks nesting depth, so a child whose content is malformed still gets a
/// range and can be rejected on its own by a strict [`parse_xml`].
pub(crate) fn child_ranges(xml: &str, parent: &str) -> Result<Vec<(usize, usize)>, String> {
    let mut reader = Reader::from_str(xml);
    reader.check_end_names(false);

    let mut depth = 0usize;
    let mut parent_depth: Option<usize> = None;
    let mut child_start: Option<usize> = None;
    let mut ranges = Vec::new();

    loop {
        let before = reader.buffer_position();
        let event = reader.read_event().map_err(|err| err.to_string())?;
        let after = reader.buffer_position();
        match event {
            Event::Start(start) => {
                depth += 1;
                match parent_depth {
                    None if start.local_name().as_ref() == parent.as_bytes() => {
                        parent_depth = Some(depth);
                    }
                    Some(level) if depth == level + 1 => child_start = Some(before),
                    _ => {}
                }
            }
            Event::Empty(_) => {
                if parent_depth.is_some_and(|level| depth == level) {
                    ranges.push((before, after));
                }
            }
            Event::End(_) => {
                match parent_depth {
                    Some(level) if depth == level + 1 => {
                        if let Some(start) = child_start.take() {
                            ranges.push((start, after));
                        }
                    }
                    Some(level) if depth == level => return Ok(ranges),
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match parent_depth {
        Some(_) => Ok(ranges),
        None => Err(format!("no <{parent}> element")),
    }
}

/// Column letters (`1 -> A`, `28 -> AB`).
pub(crate) fn column_letters(mut column: u32) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let remainder = (column - 1) % 26;
        letters.push(char::from(b'A' + remainder as u8));
        column = (column - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Split an A1 reference into 1-based `(column, row)`.
///
/// References beyond the worksheet grid (`XFD1048576`) are rejected.
pub(crate) fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || letters.len() > MAX_COLUMN_LETTERS {
        return None;
    }
    let mut column = 0u32;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        column = column * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let row: u32 = digits.parse().ok()?;
    if column > MAX_COLUMN || row == 0 || row > MAX_ROW {
        return None;
    }
    Some((column, row))
}
