//! Fixture builders shared by the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use citegrounder::config::Config;
use citegrounder::embedding::{EmbeddingClient, EmbeddingClientError, LocalEmbeddingClient};
use citegrounder::service::GroundingService;
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use std::io::{Cursor, Write};
use std::sync::Arc;
use tokio::sync::Notify;
use zip::ZipWriter;
use zip::write::FileOptions;

pub const DIMENSION: usize = 1024;

pub fn config() -> Config {
    Config {
        embedding_dimension: DIMENSION,
        ..Config::default()
    }
}

pub fn service() -> GroundingService {
    GroundingService::new(config(), Arc::new(LocalEmbeddingClient::new(DIMENSION)))
        .expect("valid config")
}

/// Embedder that parks every call until the test drops the job.
pub struct GatedEmbedder {
    inner: LocalEmbeddingClient,
    pub started: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedEmbedder {
    pub fn new() -> Self {
        Self {
            inner: LocalEmbeddingClient::new(DIMENSION),
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl EmbeddingClient for GatedEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.generate_embeddings(texts).await
    }
}

fn zip_parts(parts: &[(String, String)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in parts {
        writer
            .start_file(name.as_str(), FileOptions::default())
            .expect("start part");
        writer.write_all(body.as_bytes()).expect("write part");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// DOCX whose body holds one paragraph per entry; `Some(level)` marks a heading.
pub fn docx(paragraphs: &[(Option<u8>, &str)]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|(heading, text)| {
            let properties = heading
                .map(|level| format!("<w:pPr><w:pStyle w:val=\"Heading{level}\"/></w:pPr>"))
                .unwrap_or_default();
            format!(
                "<w:p>{properties}<w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>",
                escape(text)
            )
        })
        .collect();
    let document = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{body}<w:sectPr/></w:body></w:document>"
    );
    zip_parts(&[("word/document.xml".to_string(), document)])
}

/// One slide of a PPTX fixture.
pub struct SlideFixture<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub notes: Option<&'a str>,
    /// Replace the slide part with unparseable XML.
    pub broken: bool,
}

fn shape(id: u32, text: &str, placeholder: &str) -> String {
    format!(
        "<p:sp><p:nvSpPr><p:cNvPr id=\"{id}\" name=\"Shape {id}\"/><p:cNvSpPr/><p:nvPr><p:ph type=\"{placeholder}\"/></p:nvPr></p:nvSpPr><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp>",
        escape(text)
    )
}

const PML: &str = "xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\" xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\" xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"";
const RELS: &str = "xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\"";

pub fn pptx(slides: &[SlideFixture<'_>]) -> Vec<u8> {
    let mut parts = Vec::new();
    let mut ids = String::new();
    let mut relationships = String::new();
    for (position, slide) in slides.iter().enumerate() {
        let n = position + 1;
        ids.push_str(&format!("<p:sldId id=\"{}\" r:id=\"rId{n}\"/>", 255 + n));
        relationships.push_str(&format!(
            "<Relationship Id=\"rId{n}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide\" Target=\"slides/slide{n}.xml\"/>"
        ));

        let xml = if slide.broken {
            format!("<p:sld {PML}><p:cSld><p:spTree><p:sp>")
        } else {
            format!(
                "<p:sld {PML}><p:cSld><p:spTree><p:nvGrpSpPr/>{}{}</p:spTree></p:cSld></p:sld>",
                shape(2, slide.title, "title"),
                shape(3, slide.body, "body")
            )
        };
        parts.push((format!("ppt/slides/slide{n}.xml"), xml));

        if let Some(notes) = slide.notes {
            parts.push((
                format!("ppt/slides/_rels/slide{n}.xml.rels"),
                format!(
                    "<Relationships {RELS}><Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/notesSlide\" Target=\"../notesSlides/notesSlide{n}.xml\"/></Relationships>"
                ),
            ));
            parts.push((
                format!("ppt/notesSlides/notesSlide{n}.xml"),
                format!(
                    "<p:notes {PML}><p:cSld><p:spTree><p:nvGrpSpPr/>{}{}</p:spTree></p:cSld></p:notes>",
                    shape(2, "slide image", "sldImg"),
                    shape(3, notes, "body")
                ),
            ));
        }
    }
    parts.push((
        "ppt/presentation.xml".to_string(),
        format!("<p:presentation {PML}><p:sldIdLst>{ids}</p:sldIdLst></p:presentation>"),
    ));
    parts.push((
        "ppt/_rels/presentation.xml.rels".to_string(),
        format!("<Relationships {RELS}>{relationships}</Relationships>"),
    ));
    zip_parts(&parts)
}

/// XLSX with inline-string cells; rows start at row 1 and columns at A.
pub fn xlsx(sheets: &[(&str, Vec<Vec<&str>>)]) -> Vec<u8> {
    let parts: Vec<(String, String)> = sheets
        .iter()
        .map(|(name, rows)| {
            let data: String = rows
                .iter()
                .enumerate()
                .map(|(row_index, cells)| {
                    let row = row_index + 1;
                    let cells: String = cells
                        .iter()
                        .enumerate()
                        .map(|(column, value)| {
                            let reference = format!("{}{row}", char::from(b'A' + column as u8));
                            format!(
                                "<c r=\"{reference}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                                escape(value)
                            )
                        })
                        .collect();
                    format!("<row r=\"{row}\">{cells}</row>")
                })
                .collect();
            (name.to_string(), format!("<worksheet><sheetData>{data}</sheetData></worksheet>"))
        })
        .collect();
    let borrowed: Vec<(&str, &str)> = parts
        .iter()
        .map(|(name, xml)| (name.as_str(), xml.as_str()))
        .collect();
    xlsx_sheets(&borrowed)
}

/// XLSX whose sheet parts are the given raw worksheet XML.
pub fn xlsx_sheets(sheets: &[(&str, &str)]) -> Vec<u8> {
    let mut parts = Vec::new();
    let mut entries = String::new();
    let mut relationships = String::new();
    for (position, (name, xml)) in sheets.iter().enumerate() {
        let n = position + 1;
        entries.push_str(&format!(
            "<sheet name=\"{}\" sheetId=\"{n}\" r:id=\"rId{n}\"/>",
            escape(name)
        ));
        relationships.push_str(&format!(
            "<Relationship Id=\"rId{n}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet{n}.xml\"/>"
        ));
        parts.push((format!("xl/worksheets/sheet{n}.xml"), xml.to_string()));
    }
    parts.push((
        "xl/workbook.xml".to_string(),
        format!(
            "<workbook xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><sheets>{entries}</sheets></workbook>"
        ),
    ));
    parts.push((
        "xl/_rels/workbook.xml.rels".to_string(),
        format!("<Relationships {RELS}>{relationships}</Relationships>"),
    ));
    zip_parts(&parts)
}

/// Text drawn at `(x, baseline)` in PDF user space with font size `size`.
pub struct PdfText<'a> {
    pub text: &'a str,
    pub x: i64,
    pub baseline: i64,
    pub size: i64,
}

/// Letter-sized PDF with one Type1 font; each inner vector is one page.
pub fn pdf(pages: &[Vec<PdfText<'_>>]) -> Vec<u8> {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let font_id = document.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = document.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for page in pages {
        let mut operations = Vec::new();
        for run in page {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), run.size.into()],
            ));
            operations.push(Operation::new("Td", vec![run.x.into(), run.baseline.into()]));
            operations.push(Operation::new("Tj", vec![Object::string_literal(run.text)]));
            operations.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations };
        let content_id = document.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = document.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    document.save_to(&mut bytes).expect("save pdf");
    bytes
}
