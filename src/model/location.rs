use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in page points with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub w: f32,
    /// Height.
    pub h: f32,
}

impl Rect {
    /// Build a rectangle from its top-left corner and extent.
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Scale into `[0, 1]` page-relative coordinates, clamping out-of-page geometry.
    pub fn normalized(&self, page: PageSize) -> Self {
        let scale = |value: f32, extent: f32| {
            if extent > 0.0 {
                (value / extent).clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        Self {
            x: scale(self.x, page.width),
            y: scale(self.y, page.height),
            w: scale(self.w, page.width),
            h: scale(self.h, page.height),
        }
    }
}

/// Page extent in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    /// Page width.
    pub width: f32,
    /// Page height.
    pub height: f32,
}

/// Format-specific location of a passage.
///
/// The highlight resolver matches exhaustively on this enum, so adding a format forces every
/// consumer to decide how to locate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationMetadata {
    /// Page-based source with geometry computed during layout analysis.
    Pdf {
        /// 1-based page number.
        page: u32,
        /// Page extent used to normalize the boxes.
        page_size: PageSize,
        /// Line boxes covered by the passage.
        bounding_boxes: Vec<Rect>,
    },
    /// Flowed paragraph/table source.
    Flowed {
        /// Heading titles enclosing the element, outermost first.
        section_path: Vec<String>,
        /// Index of the body element (paragraph or table) in reading order.
        element_index: u32,
    },
    /// Slide deck source.
    Slide {
        /// 1-based slide number.
        slide_index: u32,
        /// First text-bearing shape on the slide, when known.
        shape_id: Option<u32>,
        /// Whether the passage holds speaker notes rather than visible slide text.
        is_speaker_note: bool,
    },
    /// Workbook source.
    Tabular {
        /// Sheet name as shown in the workbook.
        sheet_name: String,
        /// A1-style range such as `A2:D2`.
        cell_range: String,
    },
    /// Plain or markup text; offsets index the whitespace-normalized copy.
    Text {
        /// Inclusive start (Unicode scalar values).
        char_offset_start: usize,
        /// Exclusive end (Unicode scalar values).
        char_offset_end: usize,
    },
    /// Web page; offsets index the cleaned article text.
    Web {
        /// Inclusive start (Unicode scalar values).
        char_offset_start: usize,
        /// Exclusive end (Unicode scalar values).
        char_offset_end: usize,
    },
}

impl LocationMetadata {
    /// Identifier of the containing page, section, slide, or sheet.
    pub fn container_id(&self) -> String {
        match self {
            Self::Pdf { page, .. } => format!("page:{page}"),
            Self::Flowed {
                section_path,
                element_index,
            } => {
                if section_path.is_empty() {
                    format!("element:{element_index}")
                } else {
                    format!("section:{}", section_path.join("/"))
                }
            }
            Self::Slide {
                slide_index,
                is_speaker_note,
                ..
            } => {
                if *is_speaker_note {
                    format!("slide:{slide_index}:notes")
                } else {
                    format!("slide:{slide_index}")
                }
            }
            Self::Tabular { sheet_name, .. } => format!("sheet:{sheet_name}"),
            Self::Text {
                char_offset_start, ..
            }
            | Self::Web {
                char_offset_start, ..
            } => format!("offset:{char_offset_start}"),
        }
    }
}
