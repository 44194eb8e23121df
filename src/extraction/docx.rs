//! Flowed documents: paragraphs and tables of `word/document.xml` in body order.

use super::chunking::TokenBudget;
use super::ooxml::{Package, XmlElement, XmlNode, child_ranges, parse_xml};
use super::{DraftSet, ExtractionError, ExtractionWarning};
use crate::model::LocationMetadata;
use crate::text::collapse_whitespace;
use std::collections::HashMap;

const DOCUMENT_PART: &str = "word/document.xml";
const STYLES_PART: &str = "word/styles.xml";

pub(super) fn extract(bytes: &[u8], budget: &TokenBudget) -> Result<DraftSet, ExtractionError> {
    let mut package = Package::open(bytes, "DOCX")?;
    let xml = package.root_part(DOCUMENT_PART)?;
    let styles = package
        .read_part(STYLES_PART)
        .ok()
        .map(|styles| heading_styles(&styles))
        .unwrap_or_default();
    let ranges = child_ranges(&xml, "body")
        .map_err(|err| ExtractionError::CorruptDocument(format!("DOCX body: {err}")))?;

    let mut set = DraftSet::default();
    let mut section_path: Vec<String> = Vec::new();

    for (index, (start, end)) in ranges.into_iter().enumerate() {
        let element = match parse_xml(&xml[start..end], true) {
            Ok(element) => element,
            Err(err) => {
                set.warn(ExtractionWarning::new(
                    format!("element:{index}"),
                    format!("malformed body element: {err}"),
                ));
                continue;
            }
        };
        let element_index = index as u32;

        let blocks: Vec<&XmlElement> = if element.name == "sdt" {
            element
                .child("sdtContent")
                .map(|content| content.elements().collect())
                .unwrap_or_default()
        } else {
            vec![&element]
        };

        for block in blocks {
            match block.name.as_str() {
                "p" => {
                    let text = collapse_whitespace(&paragraph_text(block));
                    if text.is_empty() {
                        continue;
                    }
                    if let Some(level) = heading_level(block, &styles) {
                        section_path.truncate(level.saturating_sub(1));
                        section_path.push(text);
                        continue;
                    }
                    push_pieces(&mut set, budget, &text, &section_path, element_index);
                }
                "tbl" => {
                    let text = table_text(block);
                    if !text.is_empty() {
                        push_pieces(&mut set, budget, &text, &section_path, element_index);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(set)
}

fn push_pieces(
    set: &mut DraftSet,
    budget: &TokenBudget,
    text: &str,
    section_path: &[String],
    element_index: u32,
) {
    for piece in budget.split(text) {
        set.push(
            piece,
            LocationMetadata::Flowed {
                section_path: section_path.to_vec(),
                element_index,
            },
        );
    }
}

/// Visible text of a paragraph: runs, tabs, and breaks; deleted revisions and field codes are
/// skipped.
fn paragraph_text(paragraph: &XmlElement) -> String {
    let mut out = String::new();
    collect_runs(paragraph, &mut out);
    out
}

fn collect_runs(element: &XmlElement, out: &mut String) {
    for node in &element.children {
        let XmlNode::Element(child) = node else {
            continue;
        };
        match child.name.as_str() {
            "t" => {
                for text in child.children.iter().filter_map(|node| match node {
                    XmlNode::Text(text) => Some(text),
                    XmlNode::Element(_) => None,
                }) {
                    out.push_str(text);
                }
            }
            "tab" | "br" | "cr" => out.push(' '),
            "del" | "delText" | "instrText" | "pPr" | "rPr" => {}
            _ => collect_runs(child, out),
        }
    }
}

/// Rows rendered as `cell | cell`, one per line.
fn table_text(table: &XmlElement) -> String {
    let rows: Vec<String> = table
        .children_named("tr")
        .filter_map(|row| {
            let cells: Vec<String> = row
                .children_named("tc")
                .map(|cell| {
                    let paragraphs: Vec<String> = cell
                        .children_named("p")
                        .map(|p| collapse_whitespace(&paragraph_text(p)))
                        .filter(|text| !text.is_empty())
                        .collect();
                    paragraphs.join(" ")
                })
                .collect();
            if cells.iter().all(String::is_empty) {
                None
            } else {
                Some(cells.join(" | ").trim_end().to_string())
            }
        })
        .collect();
    rows.join("\n")
}

fn heading_level(paragraph: &XmlElement, styles: &HashMap<String, usize>) -> Option<usize> {
    let properties = paragraph.child("pPr")?;
    if let Some(style) = properties.child("pStyle").and_then(|s| s.attr("val")) {
        if let Some(level) = styles.get(style) {
            return Some(*level);
        }
        if let Some(level) = builtin_heading_level(style) {
            return Some(level);
        }
    }
    outline_level(properties)
}

fn outline_level(properties: &XmlElement) -> Option<usize> {
    let level: usize = properties.child("outlineLvl")?.attr("val")?.parse().ok()?;
    // Level 9 means "body text".
    (level < 9).then_some(level + 1)
}

fn builtin_heading_level(style: &str) -> Option<usize> {
    let normalized: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if normalized == "title" {
        return Some(1);
    }
    normalized
        .strip_prefix("heading")
        .and_then(|level| level.parse().ok())
        .filter(|level| (1..=9).contains(level))
}

/// Map style ids to heading levels using the style names and outline levels of `styles.xml`.
fn heading_styles(xml: &str) -> HashMap<String, usize> {
    let Ok(root) = parse_xml(xml, false) else {
        return HashMap::new();
    };
    root.children_named("style")
        .filter_map(|style| {
            let id = style.attr("styleId")?;
            let level = style
                .child("name")
                .and_then(|name| name.attr("val"))
                .and_then(builtin_heading_level)
                .or_else(|| style.child("pPr").and_then(outline_level))?;
            Some((id.to_string(), level))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(xml: &str) -> XmlElement {
        parse_xml(xml, true).unwrap()
    }

    #[test]
    fn paragraph_text_skips_deleted_runs() {
        let p = paragraph(
            "<w:p><w:r><w:t>kept</w:t></w:r><w:del><w:r><w:delText>gone</w:delText></w:r></w:del><w:r><w:tab/><w:t>too</w:t></w:r></w:p>",
        );
        assert_eq!(collapse_whitespace(&paragraph_text(&p)), "kept too");
    }

    #[test]
    fn heading_levels_come_from_styles_or_outline() {
        let styles = HashMap::from([("Kop1".to_string(), 1)]);
        let custom = paragraph("<w:p><w:pPr><w:pStyle w:val=\"Kop1\"/></w:pPr></w:p>");
        let builtin = paragraph("<w:p><w:pPr><w:pStyle w:val=\"Heading2\"/></w:pPr></w:p>");
        let outline = paragraph("<w:p><w:pPr><w:outlineLvl w:val=\"2\"/></w:pPr></w:p>");
        let body = paragraph("<w:p><w:pPr><w:pStyle w:val=\"Normal\"/></w:pPr></w:p>");
        assert_eq!(heading_level(&custom, &styles), Some(1));
        assert_eq!(heading_level(&builtin, &styles), Some(2));
        assert_eq!(heading_level(&outline, &styles), Some(3));
        assert_eq!(heading_level(&body, &styles), None);
    }

    #[test]
    fn table_rows_render_as_pipe_separated_lines() {
        let table = paragraph(
            "<w:tbl><w:tr><w:tc><w:p><w:r><w:t>a</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>b</w:t></w:r></w:p></w:tc></w:tr><w:tr><w:tc><w:p/></w:tc></w:tr><w:tr><w:tc><w:p><w:r><w:t>c</w:t></w:r></w:p></w:tc><w:tc><w:p/></w:tc></w:tr></w:tbl>",
        );
        assert_eq!(table_text(&table), "a | b\nc |");
    }

    #[test]
    fn style_names_define_custom_headings() {
        let styles = heading_styles(
            r#"<w:styles><w:style w:styleId="Kop1"><w:name w:val="heading 1"/></w:style><w:style w:styleId="Body"><w:name w:val="Normal"/></w:style></w:styles>"#,
        );
        assert_eq!(styles.get("Kop1"), Some(&1));
        assert!(!styles.contains_key("Body"));
    }
}
