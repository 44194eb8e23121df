//! Workbooks: one passage per non-empty row, sheets in workbook order.

use super::chunking::TokenBudget;
use super::ooxml::{Package, XmlElement, column_letters, parse_cell_ref, parse_xml};
use super::{Draft, DraftSet, ExtractionError, ExtractionWarning};
use crate::model::LocationMetadata;
use crate::text::collapse_whitespace;
use rayon::prelude::*;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const MAX_ROW: u32 = 1_048_576;

struct SheetPart {
    name: String,
    xml: Result<String, String>,
}

pub(super) fn extract(bytes: &[u8], budget: &TokenBudget) -> Result<DraftSet, ExtractionError> {
    let mut package = Package::open(bytes, "XLSX")?;
    let workbook = package.root_element(WORKBOOK_PART)?;
    let relationships = package
        .relationships(WORKBOOK_PART)
        .map_err(|err| ExtractionError::CorruptDocument(format!("XLSX relationships: {err}")))?;
    let shared_strings = match package.read_part(SHARED_STRINGS_PART) {
        Ok(xml) => shared_strings(&xml)
            .map_err(|err| ExtractionError::CorruptDocument(format!("XLSX shared strings: {err}")))?,
        Err(_) => Vec::new(),
    };

    let sheets: Vec<SheetPart> = workbook
        .child("sheets")
        .map(|sheets| sheets.children_named("sheet").collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .map(|sheet| {
            let name = sheet.attr("name").unwrap_or_default().to_string();
            let xml = match sheet.attr("r:id").and_then(|id| relationships.get(id)) {
                Some(part) => package.read_part(part),
                None => Err("sheet relationship not found".to_string()),
            };
            SheetPart { name, xml }
        })
        .collect();

    let results: Vec<Result<Vec<Draft>, ExtractionWarning>> = sheets
        .par_iter()
        .map(|sheet| extract_sheet(sheet, &shared_strings, budget))
        .collect();

    let mut set = DraftSet::default();
    for result in results {
        match result {
            Ok(drafts) => set.drafts.extend(drafts),
            Err(warning) => set.warn(warning),
        }
    }
    Ok(set)
}

/// Shared string table; rich-text runs are concatenated and phonetic hints dropped.
fn shared_strings(xml: &str) -> Result<Vec<String>, String> {
    let root = parse_xml(xml, false)?;
    Ok(root
        .children_named("si")
        .map(|item| {
            let mut text = String::new();
            for part in item.elements() {
                match part.name.as_str() {
                    "t" => text.push_str(&part.text_of("t")),
                    "r" => text.push_str(&part.text_of("t")),
                    _ => {}
                }
            }
            text
        })
        .collect())
}

fn extract_sheet(
    sheet: &SheetPart,
    shared: &[String],
    budget: &TokenBudget,
) -> Result<Vec<Draft>, ExtractionWarning> {
    let unit = format!("sheet:{}", sheet.name);
    let xml = sheet
        .xml
        .as_ref()
        .map_err(|err| ExtractionWarning::new(&unit, err.clone()))?;
    let root = parse_xml(xml, true)
        .map_err(|err| ExtractionWarning::new(&unit, format!("malformed sheet: {err}")))?;
    let Some(data) = root.child("sheetData") else {
        return Ok(Vec::new());
    };

    let mut drafts = Vec::new();
    let mut previous_row = 0u32;
    for row in data.children_named("row") {
        let row_number = match row.attr("r") {
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|number| (1..=MAX_ROW).contains(number))
                .ok_or_else(|| ExtractionWarning::new(&unit, format!("invalid row number {value}")))?,
            None => previous_row.saturating_add(1),
        };
        previous_row = row_number;

        let mut cells: Vec<(u32, String)> = Vec::new();
        let mut previous_column = 0u32;
        for cell in row.children_named("c") {
            let column = match cell.attr("r") {
                Some(reference) => parse_cell_ref(reference)
                    .map(|(column, _)| column)
                    .ok_or_else(|| {
                        ExtractionWarning::new(&unit, format!("invalid cell reference {reference}"))
                    })?,
                None => previous_column.saturating_add(1),
            };
            previous_column = column;
            let value = collapse_whitespace(&cell_value(cell, shared));
            if !value.is_empty() {
                cells.push((column, value));
            }
        }

        let (Some((first, _)), Some((last, _))) = (cells.first(), cells.last()) else {
            continue;
        };
        let cell_range = format!(
            "{}{row_number}:{}{row_number}",
            column_letters(*first),
            column_letters(*last)
        );
        let text = cells
            .iter()
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        for piece in budget.split(&text) {
            drafts.push(Draft {
                text: piece,
                location: LocationMetadata::Tabular {
                    sheet_name: sheet.name.clone(),
                    cell_range: cell_range.clone(),
                },
            });
        }
    }
    Ok(drafts)
}

fn cell_value(cell: &XmlElement, shared: &[String]) -> String {
    let raw = || cell.child("v").map(|v| v.text_of("v")).unwrap_or_default();
    match cell.attr("t") {
        Some("s") => raw()
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|index| shared.get(index).cloned())
            .unwrap_or_default(),
        Some("inlineStr") => cell.child("is").map(|is| is.text_of("t")).unwrap_or_default(),
        Some("b") => match raw().trim() {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        _ => raw(),
    }
}
