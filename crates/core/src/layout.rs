use crate::error::ExtractionError;
use crate::fonts::PageFonts;
use crate::models::{BoundingBox, RawTextBox};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, ObjectId};
use std::collections::{btree_map, VecDeque};
use std::path::PathBuf;
use tracing::warn;

/// US Letter, used when a page carries no usable `MediaBox`.
pub const FALLBACK_PAGE_SIZE: (f64, f64) = (612.0, 792.0);

/// Glyph advance as a fraction of the font size. Content streams carry no
/// widths without font metrics, so runs are measured with this average.
const AVERAGE_GLYPH_ADVANCE: f64 = 0.5;

/// Boxes in ascending page order. Not restartable: a failure means reopening
/// the document from page 1.
pub type TextBoxStream = Box<dyn Iterator<Item = Result<RawTextBox, ExtractionError>>>;

/// Seam in front of the layout engine.
pub trait LayoutAdapter {
    fn text_boxes(&self, doc_name: &str) -> Result<TextBoxStream, ExtractionError>;
}

/// Reads documents from a folder and walks their content streams with lopdf.
/// Each text object (`BT` .. `ET`) becomes one box.
#[derive(Debug, Clone)]
pub struct LopdfLayoutAdapter {
    root: PathBuf,
}

impl LopdfLayoutAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl LayoutAdapter for LopdfLayoutAdapter {
    fn text_boxes(&self, doc_name: &str) -> Result<TextBoxStream, ExtractionError> {
        let path = self.root.join(doc_name);
        let document =
            Document::load(&path).map_err(|error| ExtractionError::unreadable(doc_name, error))?;

        if document.trailer.get(b"Encrypt").is_ok() {
            return Err(ExtractionError::unreadable(doc_name, "document is encrypted"));
        }

        let pages = document.get_pages().into_iter();
        Ok(Box::new(PageWalker {
            doc_name: doc_name.to_string(),
            document,
            pages,
            buffered: VecDeque::new(),
            stopped: false,
        }))
    }
}

struct PageWalker {
    doc_name: String,
    document: Document,
    pages: btree_map::IntoIter<u32, ObjectId>,
    buffered: VecDeque<RawTextBox>,
    stopped: bool,
}

impl Iterator for PageWalker {
    type Item = Result<RawTextBox, ExtractionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stopped {
                return None;
            }
            if let Some(text_box) = self.buffered.pop_front() {
                return Some(Ok(text_box));
            }

            let (page_index, page_id) = self.pages.next()?;
            match read_page(&self.document, &self.doc_name, page_index, page_id) {
                Ok(boxes) => self.buffered.extend(boxes),
                Err(error) => {
                    self.stopped = true;
                    return Some(Err(ExtractionError::unreadable(
                        self.doc_name.as_str(),
                        format!("page {page_index}: {error}"),
                    )));
                }
            }
        }
    }
}

fn read_page(
    document: &Document,
    doc_name: &str,
    page_index: u32,
    page_id: ObjectId,
) -> Result<Vec<RawTextBox>, lopdf::Error> {
    let [origin_x, origin_y, page_width, page_height] = match media_box(document, page_id) {
        Some(media_box) => media_box,
        None => {
            warn!(doc_name, page_index, "page has no usable MediaBox, assuming US Letter");
            [0.0, 0.0, FALLBACK_PAGE_SIZE.0, FALLBACK_PAGE_SIZE.1]
        }
    };

    let content = Content::decode(&document.get_page_content(page_id)?)?;
    let mut walker = TextWalker::new(PageFonts::load(document, page_id));
    for operation in &content.operations {
        walker.apply(operation);
    }

    Ok(walker
        .finish()
        .into_iter()
        .map(|(bbox, text)| RawTextBox {
            page_index,
            bbox: BoundingBox::new(
                bbox.x0 - origin_x,
                bbox.y0 - origin_y,
                bbox.x1 - origin_x,
                bbox.y1 - origin_y,
            ),
            page_width,
            page_height,
            text,
        })
        .collect())
}

/// Returns `[x, y, width, height]` of the page's (possibly inherited) MediaBox.
fn media_box(document: &Document, page_id: ObjectId) -> Option<[f64; 4]> {
    const MAX_TREE_DEPTH: usize = 32;

    let mut node = Some(page_id);
    for _ in 0..MAX_TREE_DEPTH {
        let dictionary = document.get_dictionary(node?).ok()?;
        if let Ok(object) = dictionary.get(b"MediaBox") {
            let object = match object {
                Object::Reference(id) => document.get_object(*id).ok()?,
                other => other,
            };
            let values = object
                .as_array()
                .ok()?
                .iter()
                .filter_map(number)
                .collect::<Vec<_>>();
            if values.len() != 4 {
                return None;
            }
            let (x0, x1) = (values[0].min(values[2]), values[0].max(values[2]));
            let (y0, y1) = (values[1].min(values[3]), values[1].max(values[3]));
            return Some([x0, y0, x1 - x0, y1 - y0]);
        }
        node = dictionary
            .get(b"Parent")
            .and_then(|parent| parent.as_reference())
            .ok();
    }
    None
}

fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(value) => Some(*value as f64),
        Object::Real(value) => Some(*value as f64),
        _ => None,
    }
}

fn operand(operands: &[Object], index: usize) -> f64 {
    operands.get(index).and_then(number).unwrap_or(0.0)
}

/// Affine transform `[a b c d e f]` in PDF row-vector convention.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f64; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn from_operands(operands: &[Object]) -> Self {
        Matrix(std::array::from_fn(|index| operand(operands, index)))
    }

    fn translation(tx: f64, ty: f64) -> Self {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    /// `self` applied first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a * a2 + b * c2,
            a * b2 + b * d2,
            c * a2 + d * c2,
            c * b2 + d * d2,
            e * a2 + f * c2 + e2,
            e * b2 + f * d2 + f2,
        ])
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, c, d, e, f] = self.0;
        (x * a + y * c + e, x * b + y * d + f)
    }
}

#[derive(Debug, Default)]
struct TextObject {
    text: String,
    bounds: Option<BoundingBox>,
    line_break: bool,
}

impl TextObject {
    fn include(&mut self, (x, y): (f64, f64)) {
        self.bounds = Some(match self.bounds {
            None => BoundingBox::new(x, y, x, y),
            Some(bounds) => BoundingBox::new(
                bounds.x0.min(x),
                bounds.y0.min(y),
                bounds.x1.max(x),
                bounds.y1.max(y),
            ),
        });
    }
}

#[derive(Debug)]
struct TextWalker {
    fonts: PageFonts,
    font: Option<Vec<u8>>,
    ctm: Matrix,
    saved_ctm: Vec<Matrix>,
    text_matrix: Matrix,
    line_matrix: Matrix,
    font_size: f64,
    leading: f64,
    current: Option<TextObject>,
    finished: Vec<(BoundingBox, String)>,
}

impl TextWalker {
    fn new(fonts: PageFonts) -> Self {
        Self {
            fonts,
            font: None,
            ctm: Matrix::IDENTITY,
            saved_ctm: Vec::new(),
            text_matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 1.0,
            leading: 0.0,
            current: None,
            finished: Vec::new(),
        }
    }

    fn apply(&mut self, operation: &Operation) {
        let operands = operation.operands.as_slice();
        match operation.operator.as_str() {
            "q" => self.saved_ctm.push(self.ctm),
            "Q" => {
                if let Some(ctm) = self.saved_ctm.pop() {
                    self.ctm = ctm;
                }
            }
            "cm" => self.ctm = Matrix::from_operands(operands).then(&self.ctm),
            "BT" => {
                self.flush();
                self.text_matrix = Matrix::IDENTITY;
                self.line_matrix = Matrix::IDENTITY;
                self.current = Some(TextObject::default());
            }
            "ET" => self.flush(),
            "Tf" => {
                self.font = operands
                    .first()
                    .and_then(|name| name.as_name().ok())
                    .map(<[u8]>::to_vec);
                self.font_size = operand(operands, 1);
            }
            "TL" => self.leading = operand(operands, 0),
            "Td" => self.move_line(operand(operands, 0), operand(operands, 1)),
            "TD" => {
                self.leading = -operand(operands, 1);
                self.move_line(operand(operands, 0), operand(operands, 1));
            }
            "Tm" => {
                self.line_matrix = Matrix::from_operands(operands);
                self.text_matrix = self.line_matrix;
                self.mark_line_break();
            }
            "T*" => self.move_line(0.0, -self.leading),
            "Tj" => self.show_operand(operands.first()),
            "'" => {
                self.move_line(0.0, -self.leading);
                self.show_operand(operands.first());
            }
            "\"" => {
                self.move_line(0.0, -self.leading);
                self.show_operand(operands.get(2));
            }
            "TJ" => {
                let Some(Object::Array(items)) = operands.first() else {
                    return;
                };
                for item in items {
                    match item {
                        Object::String(bytes, _) => self.show(bytes),
                        other => {
                            if let Some(adjustment) = number(other) {
                                let shift = -adjustment / 1000.0 * self.font_size;
                                self.text_matrix =
                                    Matrix::translation(shift, 0.0).then(&self.text_matrix);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn move_line(&mut self, tx: f64, ty: f64) {
        self.line_matrix = Matrix::translation(tx, ty).then(&self.line_matrix);
        self.text_matrix = self.line_matrix;
        self.mark_line_break();
    }

    fn mark_line_break(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.line_break = true;
        }
    }

    fn show_operand(&mut self, object: Option<&Object>) {
        if let Some(Object::String(bytes, _)) = object {
            self.show(bytes);
        }
    }

    fn show(&mut self, bytes: &[u8]) {
        let text = self.fonts.decode(self.font.as_deref(), bytes);
        let glyphs = text.chars().count() as f64;
        let width = glyphs * self.font_size * AVERAGE_GLYPH_ADVANCE;
        let height = self.font_size;
        let placement = self.text_matrix.then(&self.ctm);

        let current = self.current.get_or_insert_with(TextObject::default);
        if current.line_break && !current.text.is_empty() && !current.text.ends_with('\n') {
            current.text.push('\n');
        }
        current.line_break = false;
        current.text.push_str(&text);
        for (x, y) in [(0.0, 0.0), (width, 0.0), (0.0, height), (width, height)] {
            current.include(placement.apply(x, y));
        }

        self.text_matrix = Matrix::translation(width, 0.0).then(&self.text_matrix);
    }

    fn flush(&mut self) {
        if let Some(object) = self.current.take() {
            if let Some(bounds) = object.bounds {
                if !object.text.trim().is_empty() {
                    let mut text = object.text;
                    text.push('\n');
                    self.finished.push((bounds, text));
                }
            }
        }
    }

    fn finish(mut self) -> Vec<(BoundingBox, String)> {
        self.flush();
        self.finished
    }
}
