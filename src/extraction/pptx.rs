//! Slide decks: one passage per slide with its visible text, plus one for its speaker notes.

use super::chunking::TokenBudget;
use super::ooxml::{Package, XmlElement, parse_xml};
use super::{Draft, DraftSet, ExtractionError, ExtractionWarning};
use crate::model::LocationMetadata;
use crate::text::collapse_whitespace;
use rayon::prelude::*;

const PRESENTATION_PART: &str = "ppt/presentation.xml";
const NOTES_SLIDE_TYPE: &str = "notesSlide";

/// Raw parts of one slide, read sequentially from the zip before parallel parsing.
struct SlideParts {
    index: u32,
    slide: Result<String, String>,
    notes: Option<Result<String, String>>,
}

/// Passages of one slide. Notes that fail to load are skipped with their own warning.
struct SlideText {
    drafts: Vec<Draft>,
    notes_warning: Option<ExtractionWarning>,
}

pub(super) fn extract(bytes: &[u8], budget: &TokenBudget) -> Result<DraftSet, ExtractionError> {
    let mut package = Package::open(bytes, "PPTX")?;
    let presentation = package.root_element(PRESENTATION_PART)?;
    let relationships = package
        .relationships(PRESENTATION_PART)
        .map_err(|err| ExtractionError::CorruptDocument(format!("PPTX relationships: {err}")))?;

    let slide_ids: Vec<&str> = presentation
        .child("sldIdLst")
        .map(|list| {
            list.children_named("sldId")
                .filter_map(|slide| slide.attr("r:id"))
                .collect()
        })
        .unwrap_or_default();

    let mut parts = Vec::with_capacity(slide_ids.len());
    for (position, relationship_id) in slide_ids.into_iter().enumerate() {
        let index = position as u32 + 1;
        let Some(part_name) = relationships.get(relationship_id) else {
            parts.push(SlideParts {
                index,
                slide: Err(format!("relationship {relationship_id} not found")),
                notes: None,
            });
            continue;
        };
        let slide = package.read_part(part_name);
        let notes = notes_part(&mut package, part_name)
            .map(|notes_name| package.read_part(&notes_name));
        parts.push(SlideParts {
            index,
            slide,
            notes,
        });
    }

    let results: Vec<Result<SlideText, ExtractionWarning>> = parts
        .par_iter()
        .map(|parts| extract_slide(parts, budget))
        .collect();

    let mut set = DraftSet::default();
    for result in results {
        match result {
            Ok(slide) => {
                set.drafts.extend(slide.drafts);
                if let Some(warning) = slide.notes_warning {
                    set.warn(warning);
                }
            }
            Err(warning) => set.warn(warning),
        }
    }
    Ok(set)
}

fn notes_part(package: &mut Package<'_>, slide_part: &str) -> Option<String> {
    let relationships = package.relationships(slide_part).ok()?;
    let mut targets: Vec<(&String, &String)> = relationships
        .iter()
        .filter(|(_, target)| {
            target
                .rsplit('/')
                .next()
                .is_some_and(|file| file.starts_with(NOTES_SLIDE_TYPE))
        })
        .collect();
    targets.sort();
    targets.first().map(|(_, target)| (*target).clone())
}

fn extract_slide(parts: &SlideParts, budget: &TokenBudget) -> Result<SlideText, ExtractionWarning> {
    let unit = format!("slide:{}", parts.index);
    let xml = parts
        .slide
        .as_ref()
        .map_err(|err| ExtractionWarning::new(&unit, err.clone()))?;
    let slide = parse_xml(xml, true)
        .map_err(|err| ExtractionWarning::new(&unit, format!("malformed slide: {err}")))?;

    let mut drafts = Vec::new();
    let shapes = slide_shapes(&slide, false);
    let shape_id = shapes.first().and_then(|(id, _)| *id);
    let text = shapes
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n");
    push_pieces(
        &mut drafts,
        budget,
        &text,
        LocationMetadata::Slide {
            slide_index: parts.index,
            shape_id,
            is_speaker_note: false,
        },
    );

    let notes = match &parts.notes {
        None => None,
        Some(loaded) => {
            let parsed = loaded.as_ref().map_err(Clone::clone).and_then(|xml| {
                parse_xml(xml, true).map_err(|err| format!("malformed speaker notes: {err}"))
            });
            match parsed {
                Ok(notes) => Some(notes),
                Err(message) => {
                    return Ok(SlideText {
                        drafts,
                        notes_warning: Some(ExtractionWarning::new(format!("{unit}:notes"), message)),
                    });
                }
            }
        }
    };

    if let Some(notes) = notes {
        let notes_text = slide_shapes(&notes, true)
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join("\n");
        push_pieces(
            &mut drafts,
            budget,
            &notes_text,
            LocationMetadata::Slide {
                slide_index: parts.index,
                shape_id: None,
                is_speaker_note: true,
            },
        );
    }

    Ok(SlideText {
        drafts,
        notes_warning: None,
    })
}

fn push_pieces(drafts: &mut Vec<Draft>, budget: &TokenBudget, text: &str, location: LocationMetadata) {
    for piece in budget.split(text) {
        if !piece.trim().is_empty() {
            drafts.push(Draft {
                text: piece,
                location: location.clone(),
            });
        }
    }
}

/// Text-bearing shapes of a slide in tree order as `(shape id, text)`.
///
/// For notes pages only body placeholders count; the slide image and slide number placeholders
/// are not part of the notes.
fn slide_shapes(root: &XmlElement, notes_only: bool) -> Vec<(Option<u32>, String)> {
    let Some(tree) = root.path(&["cSld", "spTree"]) else {
        return Vec::new();
    };
    let mut shapes = Vec::new();
    collect_shapes(tree, notes_only, &mut shapes);
    shapes
}

fn collect_shapes(tree: &XmlElement, notes_only: bool, out: &mut Vec<(Option<u32>, String)>) {
    for shape in tree.elements() {
        match shape.name.as_str() {
            "grpSp" => collect_shapes(shape, notes_only, out),
            "sp" => {
                if notes_only && placeholder_type(shape) != Some("body") {
                    continue;
                }
                let Some(body) = shape.child("txBody") else {
                    continue;
                };
                let text = paragraphs_text(body);
                if !text.is_empty() {
                    out.push((shape_id(shape, "nvSpPr"), text));
                }
            }
            "graphicFrame" if !notes_only => {
                let mut tables = Vec::new();
                shape.find_all("tbl", &mut tables);
                let text = tables
                    .into_iter()
                    .map(table_text)
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                if !text.is_empty() {
                    out.push((shape_id(shape, "nvGraphicFramePr"), text));
                }
            }
            _ => {}
        }
    }
}

fn placeholder_type(shape: &XmlElement) -> Option<&str> {
    shape.path(&["nvSpPr", "nvPr", "ph"])?.attr("type")
}

fn shape_id(shape: &XmlElement, properties: &str) -> Option<u32> {
    shape
        .path(&[properties, "cNvPr"])?
        .attr("id")?
        .parse()
        .ok()
}

fn paragraphs_text(body: &XmlElement) -> String {
    body.children_named("p")
        .map(|paragraph| collapse_whitespace(&paragraph.text_of("t")))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn table_text(table: &XmlElement) -> String {
    table
        .children_named("tr")
        .map(|row| {
            row.children_named("tc")
                .map(|cell| {
                    cell.child("txBody")
                        .map(paragraphs_text)
                        .unwrap_or_default()
                        .replace('\n', " ")
                })
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .filter(|row| !row.replace('|', "").trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLIDE: &str = r#"<p:sld><p:cSld><p:spTree>
        <p:nvGrpSpPr/>
        <p:sp><p:nvSpPr><p:cNvPr id="2" name="Title"/><p:nvPr><p:ph type="title"/></p:nvPr></p:nvSpPr>
          <p:txBody><a:p><a:r><a:t>Quarterly</a:t></a:r><a:r><a:t> review</a:t></a:r></a:p></p:txBody></p:sp>
        <p:sp><p:nvSpPr><p:cNvPr id="3" name="Picture"/></p:nvSpPr></p:sp>
        <p:grpSp><p:sp><p:nvSpPr><p:cNvPr id="7" name="Body"/></p:nvSpPr>
          <p:txBody><a:p><a:r><a:t>Revenue grew</a:t></a:r></a:p><a:p><a:r><a:t>Costs fell</a:t></a:r></a:p></p:txBody></p:sp></p:grpSp>
      </p:spTree></p:cSld></p:sld>"#;

    #[test]
    fn collects_shapes_in_tree_order_with_ids() {
        let slide = parse_xml(SLIDE, true).unwrap();
        let shapes = slide_shapes(&slide, false);
        assert_eq!(
            shapes,
            vec![
                (Some(2), "Quarterly review".to_string()),
                (Some(7), "Revenue grew\nCosts fell".to_string()),
            ]
        );
    }

    #[test]
    fn notes_only_keep_body_placeholders() {
        let notes = parse_xml(
            r#"<p:notes><p:cSld><p:spTree>
              <p:sp><p:nvSpPr><p:cNvPr id="2"/><p:nvPr><p:ph type="sldImg"/></p:nvPr></p:nvSpPr></p:sp>
              <p:sp><p:nvSpPr><p:cNvPr id="3"/><p:nvPr><p:ph type="body"/></p:nvPr></p:nvSpPr>
                <p:txBody><a:p><a:r><a:t>Mention the new office.</a:t></a:r></a:p></p:txBody></p:sp>
              <p:sp><p:nvSpPr><p:cNvPr id="4"/><p:nvPr><p:ph type="sldNum"/></p:nvPr></p:nvSpPr>
                <p:txBody><a:p><a:r><a:t>3</a:t></a:r></a:p></p:txBody></p:sp>
            </p:spTree></p:cSld></p:notes>"#,
            true,
        )
        .unwrap();
        assert_eq!(
            slide_shapes(&notes, true),
            vec![(Some(3), "Mention the new office.".to_string())]
        );
    }

    #[test]
    fn missing_slide_part_becomes_warning() {
        let parts = SlideParts {
            index: 4,
            slide: Err("missing part ppt/slides/slide4.xml".into()),
            notes: None,
        };
        let budget = TokenBudget::new(100, super::super::chunking::whitespace_token_counter());
        let Err(warning) = extract_slide(&parts, &budget) else {
            panic!("slide without a part was extracted");
        };
        assert_eq!(warning.unit, "slide:4");
    }

    #[test]
    fn malformed_notes_keep_the_slide_and_warn() {
        let parts = SlideParts {
            index: 2,
            slide: Ok(SLIDE.to_string()),
            notes: Some(Ok("<p:notes><p:cSld>".to_string())),
        };
        let budget = TokenBudget::new(100, super::super::chunking::whitespace_token_counter());
        let Ok(slide) = extract_slide(&parts, &budget) else {
            panic!("slide was dropped with its notes");
        };
        assert_eq!(slide.drafts.len(), 1);
        assert!(slide.drafts[0].text.starts_with("Quarterly review"));
        let warning = slide.notes_warning.unwrap();
        assert_eq!(warning.unit, "slide:2:notes");
        assert!(warning.message.starts_with("malformed speaker notes"));
    }
}
