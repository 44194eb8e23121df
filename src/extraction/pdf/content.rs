//! Content-stream interpretation: text state operators to positioned lines.
//!
//! Only what is needed to place text is modelled: the graphics state stack and `cm`, the text
//! object operators, and font decoding through `ToUnicode` CMaps. Glyph widths are estimated at
//! half an em per character, and a line box is one font size tall above the baseline.

use super::super::ExtractionWarning;
use crate::model::{PageSize, Rect};
use crate::text::collapse_whitespace;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashMap;

/// Estimated advance of one glyph, in text space units per unit of font size.
const GLYPH_ADVANCE_EM: f32 = 0.5;
/// Gap between runs, relative to font size, that reads as a word break.
const WORD_GAP_EM: f32 = 0.15;
/// Baseline difference, relative to font size, tolerated within one line.
const BASELINE_TOLERANCE_EM: f32 = 0.5;
/// Font size assumed before any `Tf`.
const DEFAULT_FONT_SIZE: f32 = 12.0;
/// US Letter, used when a page declares no media box.
const DEFAULT_PAGE_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];
const MAX_INHERITANCE_DEPTH: usize = 32;

/// Positioned lines of one page.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct PageText {
    pub page: u32,
    pub size: PageSize,
    pub lines: Vec<Line>,
}

/// One visual line of text, in page points with a top-left origin.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Line {
    pub text: String,
    pub rect: Rect,
    pub font_size: f32,
}

/// Text shown by one string operand, in PDF user space (bottom-left origin).
#[derive(Debug, Clone, PartialEq)]
struct TextRun {
    text: String,
    x: f32,
    baseline: f32,
    width: f32,
    size: f32,
}

pub(super) fn page_text(
    document: &Document,
    page: u32,
    page_id: ObjectId,
) -> Result<PageText, ExtractionWarning> {
    let unit = format!("page:{page}");
    let dictionary = document
        .get_dictionary(page_id)
        .map_err(|err| ExtractionWarning::new(&unit, format!("missing page object: {err}")))?;

    let page_box = inherited(document, dictionary, b"CropBox")
        .or_else(|| inherited(document, dictionary, b"MediaBox"))
        .and_then(|object| parse_box(document, object))
        .unwrap_or(DEFAULT_PAGE_BOX);
    let fonts = page_fonts(document, dictionary);

    let data = document
        .get_page_content(page_id)
        .map_err(|err| ExtractionWarning::new(&unit, format!("unreadable content stream: {err}")))?;
    let content = Content::decode(&data)
        .map_err(|err| ExtractionWarning::new(&unit, format!("undecodable content stream: {err}")))?;

    let runs = interpret(&content.operations, &fonts);
    Ok(PageText {
        page,
        size: PageSize {
            width: page_box[2] - page_box[0],
            height: page_box[3] - page_box[1],
        },
        lines: group_lines(runs, page_box),
    })
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => document.get_object(*id).unwrap_or(object),
        other => other,
    }
}

fn as_dict<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match resolve(document, object) {
        Object::Dictionary(dictionary) => Some(dictionary),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

/// Look up a page attribute, following `Parent` links for inheritable keys.
fn inherited<'a>(
    document: &'a Document,
    dictionary: &'a Dictionary,
    key: &[u8],
) -> Option<&'a Object> {
    let mut current = dictionary;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(resolve(document, value));
        }
        current = as_dict(document, current.get(b"Parent").ok()?)?;
    }
    None
}

fn parse_box(document: &Document, object: &Object) -> Option<[f32; 4]> {
    let Object::Array(values) = resolve(document, object) else {
        return None;
    };
    if values.len() != 4 {
        return None;
    }
    let mut numbers = [0.0_f32; 4];
    for (slot, value) in numbers.iter_mut().zip(values) {
        *slot = number(resolve(document, value))?;
    }
    let [a, b, c, d] = numbers;
    Some([a.min(c), b.min(d), a.max(c), b.max(d)])
}

fn page_fonts(document: &Document, page: &Dictionary) -> HashMap<Vec<u8>, FontDecoder> {
    let Some(fonts) = inherited(document, page, b"Resources")
        .and_then(|resources| as_dict(document, resources))
        .and_then(|resources| resources.get(b"Font").ok())
        .and_then(|fonts| as_dict(document, fonts))
    else {
        return HashMap::new();
    };

    fonts
        .iter()
        .filter_map(|(name, font)| {
            let font = as_dict(document, font)?;
            Some((name.clone(), FontDecoder::from_font(document, font)))
        })
        .collect()
}

/// Maps character codes of one font to Unicode text.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct FontDecoder {
    two_byte: bool,
    to_unicode: HashMap<u32, String>,
}

impl FontDecoder {
    fn from_font(document: &Document, font: &Dictionary) -> Self {
        let two_byte = matches!(font.get(b"Subtype"), Ok(Object::Name(name)) if name == b"Type0");
        let to_unicode = match font.get(b"ToUnicode").map(|object| resolve(document, object)) {
            Ok(Object::Stream(stream)) => {
                let data = stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone());
                parse_cmap(&String::from_utf8_lossy(&data))
            }
            _ => HashMap::new(),
        };
        Self {
            two_byte,
            to_unicode,
        }
    }

    pub(super) fn decode(&self, bytes: &[u8]) -> String {
        if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
            return utf16_be(rest);
        }
        let width = if self.two_byte { 2 } else { 1 };
        let text: String = if !self.to_unicode.is_empty() {
            bytes
                .chunks(width)
                .map(|chunk| {
                    let code = chunk.iter().fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
                    match self.to_unicode.get(&code) {
                        Some(mapped) => mapped.clone(),
                        None if self.two_byte => String::new(),
                        None => char::from(chunk[0]).to_string(),
                    }
                })
                .collect()
        } else if self.two_byte {
            utf16_be(bytes)
        } else {
            bytes.iter().map(|byte| char::from(*byte)).collect()
        };
        text.chars().filter(|c| !c.is_control() || *c == '\t').collect()
    }
}

fn utf16_be(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| match pair {
            [high, low] => u16::from_be_bytes([*high, *low]),
            [single] => u16::from(*single),
            _ => 0,
        })
        .collect();
    String::from_utf16_lossy(&units)
}

#[derive(Debug, Clone, PartialEq)]
enum CmapToken {
    Hex(Vec<u8>),
    Open,
    Close,
    Word(String),
}

fn tokenize_cmap(source: &str) -> Vec<CmapToken> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '%' => {
                for next in chars.by_ref() {
                    if next == '\n' || next == '\r' {
                        break;
                    }
                }
            }
            '<' if chars.peek() == Some(&'<') => {
                chars.next();
                tokens.push(CmapToken::Word("<<".to_string()));
            }
            '<' => {
                let mut digits = String::new();
                for next in chars.by_ref() {
                    if next == '>' {
                        break;
                    }
                    if next.is_ascii_hexdigit() {
                        digits.push(next);
                    }
                }
                if digits.len() % 2 == 1 {
                    digits.push('0');
                }
                let bytes = (0..digits.len())
                    .step_by(2)
                    .filter_map(|index| u8::from_str_radix(&digits[index..index + 2], 16).ok())
                    .collect();
                tokens.push(CmapToken::Hex(bytes));
            }
            '[' => tokens.push(CmapToken::Open),
            ']' => tokens.push(CmapToken::Close),
            '(' => {
                let mut depth = 1;
                for next in chars.by_ref() {
                    match next {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            c if c.is_whitespace() => {}
            c => {
                let mut word = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || "<>[]()%/".contains(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(CmapToken::Word(word));
            }
        }
    }
    tokens
}

fn code_of(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
}

/// Parse the `bfchar` and `bfrange` sections of a ToUnicode CMap.
pub(super) fn parse_cmap(source: &str) -> HashMap<u32, String> {
    /// Upper bound on codes generated from a single range.
    const MAX_RANGE: u32 = 0xFFFF;

    let tokens = tokenize_cmap(source);
    let mut map = HashMap::new();
    let mut index = 0;
    let is_word = |token: &CmapToken, expected: &str| matches!(token, CmapToken::Word(word) if word == expected);

    while index < tokens.len() {
        if is_word(&tokens[index], "beginbfchar") {
            index += 1;
            while index + 1 < tokens.len() && !is_word(&tokens[index], "endbfchar") {
                if let (CmapToken::Hex(source), CmapToken::Hex(target)) =
                    (&tokens[index], &tokens[index + 1])
                {
                    map.insert(code_of(source), utf16_be(target));
                    index += 2;
                } else {
                    index += 1;
                }
            }
        } else if is_word(&tokens[index], "beginbfrange") {
            index += 1;
            while index + 2 < tokens.len() && !is_word(&tokens[index], "endbfrange") {
                let (CmapToken::Hex(low), CmapToken::Hex(high)) = (&tokens[index], &tokens[index + 1])
                else {
                    index += 1;
                    continue;
                };
                let low = code_of(low);
                let high = code_of(high).min(low.saturating_add(MAX_RANGE));
                match &tokens[index + 2] {
                    CmapToken::Hex(target) => {
                        let base: Vec<u16> = target
                            .chunks(2)
                            .map(|pair| match pair {
                                [h, l] => u16::from_be_bytes([*h, *l]),
                                [single] => u16::from(*single),
                                _ => 0,
                            })
                            .collect();
                        for (offset, code) in (low..=high).enumerate() {
                            let mut units = base.clone();
                            if let Some(last) = units.last_mut() {
                                *last = last.wrapping_add(offset as u16);
                            }
                            map.insert(code, String::from_utf16_lossy(&units));
                        }
                        index += 3;
                    }
                    CmapToken::Open => {
                        let mut cursor = index + 3;
                        let mut code = low;
                        while cursor < tokens.len() && tokens[cursor] != CmapToken::Close {
                            if let CmapToken::Hex(target) = &tokens[cursor] {
                                if code <= high {
                                    map.insert(code, utf16_be(target));
                                }
                                code = code.saturating_add(1);
                            }
                            cursor += 1;
                        }
                        index = cursor + 1;
                    }
                    _ => index += 1,
                }
            }
        } else {
            index += 1;
        }
    }
    map
}

/// Affine transform `[a b c d e f]` in PDF row-vector convention.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    fn from_operands(values: &[f32]) -> Option<Self> {
        match values {
            [a, b, c, d, e, f] => Some(Self {
                a: *a,
                b: *b,
                c: *c,
                d: *d,
                e: *e,
                f: *f,
            }),
            _ => None,
        }
    }

    fn translate(tx: f32, ty: f32) -> Self {
        Self {
            e: tx,
            f: ty,
            ..Self::IDENTITY
        }
    }

    /// `self × other`.
    fn then(&self, other: &Self) -> Self {
        Self {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }
}

struct Interpreter<'f> {
    fonts: &'f HashMap<Vec<u8>, FontDecoder>,
    fallback: FontDecoder,
    ctm: Matrix,
    saved: Vec<Matrix>,
    text_matrix: Matrix,
    line_matrix: Matrix,
    font: Option<Vec<u8>>,
    font_size: f32,
    leading: f32,
    runs: Vec<TextRun>,
}

fn interpret(operations: &[Operation], fonts: &HashMap<Vec<u8>, FontDecoder>) -> Vec<TextRun> {
    let mut interpreter = Interpreter {
        fonts,
        fallback: FontDecoder::default(),
        ctm: Matrix::IDENTITY,
        saved: Vec::new(),
        text_matrix: Matrix::IDENTITY,
        line_matrix: Matrix::IDENTITY,
        font: None,
        font_size: DEFAULT_FONT_SIZE,
        leading: 0.0,
        runs: Vec::new(),
    };
    for operation in operations {
        interpreter.apply(operation);
    }
    interpreter.runs
}

impl Interpreter<'_> {
    fn apply(&mut self, operation: &Operation) {
        let operands = &operation.operands;
        let numbers: Vec<f32> = operands.iter().filter_map(number).collect();
        match operation.operator.as_str() {
            "q" => self.saved.push(self.ctm),
            "Q" => {
                if let Some(ctm) = self.saved.pop() {
                    self.ctm = ctm;
                }
            }
            "cm" => {
                if let Some(matrix) = Matrix::from_operands(&numbers) {
                    self.ctm = matrix.then(&self.ctm);
                }
            }
            "BT" => {
                self.text_matrix = Matrix::IDENTITY;
                self.line_matrix = Matrix::IDENTITY;
            }
            "Tf" => {
                if let Some(Object::Name(name)) = operands.first() {
                    self.font = Some(name.clone());
                }
                if let Some(size) = numbers.last() {
                    self.font_size = size.abs();
                }
            }
            "TL" => {
                if let Some(leading) = numbers.first() {
                    self.leading = *leading;
                }
            }
            "Td" => {
                if let [tx, ty] = numbers[..] {
                    self.move_line(tx, ty);
                }
            }
            "TD" => {
                if let [tx, ty] = numbers[..] {
                    self.leading = -ty;
                    self.move_line(tx, ty);
                }
            }
            "Tm" => {
                if let Some(matrix) = Matrix::from_operands(&numbers) {
                    self.text_matrix = matrix;
                    self.line_matrix = matrix;
                }
            }
            "T*" => self.move_line(0.0, -self.leading),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    self.show(bytes);
                }
            }
            "'" => {
                self.move_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = operands.first() {
                    self.show(bytes);
                }
            }
            "\"" => {
                self.move_line(0.0, -self.leading);
                if let Some(Object::String(bytes, _)) = operands.get(2) {
                    self.show(bytes);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => self.show(bytes),
                            other => {
                                if let Some(adjustment) = number(other) {
                                    let shift = -adjustment / 1000.0 * self.font_size;
                                    self.text_matrix =
                                        Matrix::translate(shift, 0.0).then(&self.text_matrix);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        self.line_matrix = Matrix::translate(tx, ty).then(&self.line_matrix);
        self.text_matrix = self.line_matrix;
    }

    fn show(&mut self, bytes: &[u8]) {
        let decoder = self
            .font
            .as_ref()
            .and_then(|name| self.fonts.get(name))
            .unwrap_or(&self.fallback);
        let text = decoder.decode(bytes);
        let advance = text.chars().count() as f32 * GLYPH_ADVANCE_EM * self.font_size;

        let rendering = self.text_matrix.then(&self.ctm);
        let horizontal_scale = (rendering.a * rendering.a + rendering.b * rendering.b).sqrt();
        let vertical_scale = (rendering.c * rendering.c + rendering.d * rendering.d).sqrt();
        if !text.trim().is_empty() {
            self.runs.push(TextRun {
                text,
                x: rendering.e,
                baseline: rendering.f,
                width: advance * horizontal_scale,
                size: self.font_size * vertical_scale,
            });
        }
        self.text_matrix = Matrix::translate(advance, 0.0).then(&self.text_matrix);
    }
}

struct LineBuilder {
    text: String,
    left: f32,
    right: f32,
    baseline: f32,
    size: f32,
}

/// Merge runs sharing a baseline into lines, converting to top-left page coordinates.
fn group_lines(runs: Vec<TextRun>, page_box: [f32; 4]) -> Vec<Line> {
    let mut builders: Vec<LineBuilder> = Vec::new();
    for run in runs {
        if let Some(line) = builders.last_mut() {
            let size = line.size.max(run.size);
            let same_baseline = (run.baseline - line.baseline).abs() <= BASELINE_TOLERANCE_EM * size;
            if same_baseline && run.x >= line.right - size {
                let gap = run.x - line.right;
                let separated = line.text.ends_with(char::is_whitespace)
                    || run.text.starts_with(char::is_whitespace);
                if gap > WORD_GAP_EM * size && !separated {
                    line.text.push(' ');
                }
                line.text.push_str(&run.text);
                line.left = line.left.min(run.x);
                line.right = line.right.max(run.x + run.width);
                line.size = size;
                continue;
            }
        }
        builders.push(LineBuilder {
            left: run.x,
            right: run.x + run.width,
            baseline: run.baseline,
            size: run.size,
            text: run.text,
        });
    }

    let [x0, _, _, y1] = page_box;
    builders
        .into_iter()
        .filter_map(|line| {
            let text = collapse_whitespace(&line.text);
            if text.is_empty() {
                return None;
            }
            Some(Line {
                text,
                rect: Rect::new(
                    line.left - x0,
                    y1 - line.baseline - line.size,
                    line.right - line.left,
                    line.size,
                ),
                font_size: line.size,
            })
        })
        .collect()
}
