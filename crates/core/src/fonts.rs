//! Font-aware decoding of the strings shown by `Tj`/`TJ`.
//!
//! Simple fonts are decoded by lopdf from their named encoding. Fonts that
//! carry a `ToUnicode` CMap, Identity-H composite fonts among them, are decoded
//! through that map, which lopdf 0.33 does not read on its own.

use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum FontDecoding {
    /// Named single-byte encoding understood by `Document::decode_text`.
    Named(String),
    Unicode(UnicodeMap),
}

/// Resource name (`/F1`) to decoder, for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PageFonts {
    fonts: BTreeMap<Vec<u8>, FontDecoding>,
}

impl PageFonts {
    pub(crate) fn load(document: &Document, page_id: ObjectId) -> Self {
        let fonts = document
            .get_page_fonts(page_id)
            .into_iter()
            .map(|(name, font)| {
                let decoding = match unicode_map(document, font) {
                    Some(map) => FontDecoding::Unicode(map),
                    None => FontDecoding::Named(encoding_name(document, font)),
                };
                (name, decoding)
            })
            .collect();
        Self { fonts }
    }

    /// Decodes `bytes` shown with `font`. Unknown or unset fonts fall back to
    /// lopdf's default (StandardEncoding).
    pub(crate) fn decode(&self, font: Option<&[u8]>, bytes: &[u8]) -> String {
        match font.and_then(|name| self.fonts.get(name)) {
            Some(FontDecoding::Unicode(map)) => map.decode(bytes),
            Some(FontDecoding::Named(encoding)) => {
                Document::decode_text(Some(encoding.as_str()), bytes)
            }
            None => Document::decode_text(None, bytes),
        }
    }

    #[cfg(test)]
    pub(crate) fn with(name: &str, encoding: &str) -> Self {
        let mut fonts = BTreeMap::new();
        fonts.insert(
            name.as_bytes().to_vec(),
            FontDecoding::Named(encoding.to_string()),
        );
        Self { fonts }
    }
}

/// `/Encoding` as a name, or the `/BaseEncoding` of an encoding dictionary.
fn encoding_name(document: &Document, font: &Dictionary) -> String {
    let base = font
        .get(b"Encoding")
        .and_then(|object| document.dereference(object))
        .ok()
        .and_then(|(_, object)| object.as_dict().ok())
        .and_then(|encoding| encoding.get(b"BaseEncoding").ok())
        .and_then(|name| name.as_name_str().ok());
    match base {
        Some(name) => name.to_string(),
        None => font.get_font_encoding().to_string(),
    }
}

fn unicode_map(document: &Document, font: &Dictionary) -> Option<UnicodeMap> {
    let (_, object) = document.dereference(font.get(b"ToUnicode").ok()?).ok()?;
    let content = object.as_stream().ok()?.decompressed_content().ok()?;
    let composite = font
        .get(b"Subtype")
        .and_then(Object::as_name)
        .map_or(false, |subtype| subtype == b"Type0");

    let map = UnicodeMap::parse(&content, if composite { 2 } else { 1 });
    if map.is_empty() {
        debug!("ToUnicode CMap has no mappings, using the font encoding");
        return None;
    }
    Some(map)
}

#[derive(Debug, Clone, PartialEq)]
struct UnicodeMap {
    code_width: usize,
    codes: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Hex(Vec<u8>),
    Open,
    Close,
    Word(&'a str),
}

impl UnicodeMap {
    fn parse(content: &[u8], default_width: usize) -> Self {
        let source = String::from_utf8_lossy(content);
        let tokens = tokenize(&source);
        let mut map = Self {
            code_width: default_width,
            codes: BTreeMap::new(),
        };

        let mut index = 0;
        while index < tokens.len() {
            match tokens[index] {
                Token::Word("begincodespacerange") => {
                    if let Some(Token::Hex(low)) = tokens.get(index + 1) {
                        map.code_width = low.len().max(1);
                    }
                }
                Token::Word("beginbfchar") => {
                    index += 1;
                    while let (Some(Token::Hex(code)), Some(Token::Hex(target))) =
                        (tokens.get(index), tokens.get(index + 1))
                    {
                        map.codes.insert(code_value(code), utf16_text(target));
                        index += 2;
                    }
                    continue;
                }
                Token::Word("beginbfrange") => {
                    index += 1;
                    while let (Some(Token::Hex(low)), Some(Token::Hex(high))) =
                        (tokens.get(index), tokens.get(index + 1))
                    {
                        let (low, high) = (code_value(low), code_value(high));
                        index += 2;
                        match tokens.get(index) {
                            Some(Token::Hex(start)) => {
                                for (offset, code) in (low..=high).enumerate() {
                                    map.codes.insert(code, shifted_text(start, offset as u32));
                                }
                                index += 1;
                            }
                            Some(Token::Open) => {
                                index += 1;
                                let mut code = low;
                                while let Some(Token::Hex(target)) = tokens.get(index) {
                                    if code <= high {
                                        map.codes.insert(code, utf16_text(target));
                                    }
                                    code = code.saturating_add(1);
                                    index += 1;
                                }
                                if tokens.get(index) == Some(&Token::Close) {
                                    index += 1;
                                }
                            }
                            _ => break,
                        }
                    }
                    continue;
                }
                _ => {}
            }
            index += 1;
        }
        map
    }

    fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    fn decode(&self, bytes: &[u8]) -> String {
        bytes
            .chunks(self.code_width)
            .map(|code| {
                self.codes
                    .get(&code_value(code))
                    .map_or("\u{FFFD}", String::as_str)
            })
            .collect()
    }
}

fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find(|ch: char| !ch.is_whitespace()) {
        rest = &rest[start..];
        if let Some(body) = rest.strip_prefix('<') {
            let end = body.find('>').unwrap_or(body.len());
            tokens.push(Token::Hex(hex_bytes(&body[..end])));
            rest = body.get(end + 1..).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix('[') {
            tokens.push(Token::Open);
            rest = after;
        } else if let Some(after) = rest.strip_prefix(']') {
            tokens.push(Token::Close);
            rest = after;
        } else {
            let end = rest
                .find(|ch: char| ch.is_whitespace() || matches!(ch, '<' | '[' | ']'))
                .unwrap_or(rest.len())
                .max(1);
            tokens.push(Token::Word(&rest[..end]));
            rest = &rest[end..];
        }
    }
    tokens
}

fn hex_bytes(digits: &str) -> Vec<u8> {
    let nibbles = digits
        .chars()
        .filter_map(|ch| ch.to_digit(16))
        .map(|nibble| nibble as u8)
        .collect::<Vec<_>>();
    nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

fn code_value(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |value, &byte| (value << 8) | u32::from(byte))
}

fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

fn utf16_text(bytes: &[u8]) -> String {
    String::from_utf16_lossy(&utf16_units(bytes))
}

/// Destination of a `bfrange` entry: the last UTF-16 unit advances with the code.
fn shifted_text(start: &[u8], offset: u32) -> String {
    let mut units = utf16_units(start);
    if let Some(last) = units.last_mut() {
        *last = last.wrapping_add(offset as u16);
    }
    String::from_utf16_lossy(&units)
}
