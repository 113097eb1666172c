//! Minimal self-describing XML element model.
//!
//! Message bodies on the collector link are small XML sub-documents: a
//! `header` element followed by one named payload element. This module
//! provides the element tree used to build and read those bodies. It is a
//! deliberately small writer/parser for the fixed grammar beacon emits —
//! elements, double-quoted attributes, text content, and the five named
//! entities. It is not a general-purpose XML library.

use std::fmt;

// ---------------------------------------------------------------------------
// XmlElement
// ---------------------------------------------------------------------------

/// One XML element: name, attributes, child elements, and text content.
///
/// An element carries either children or text; beacon never mixes the two
/// within one element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            ..XmlElement::default()
        }
    }

    /// Builder: add an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Builder: add a child element.
    pub fn child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: set the text content.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Shorthand for a leaf element holding only text.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        XmlElement::new(name).text(text)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn find_child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text content of the named child, or `""` if absent.
    pub fn child_text(&self, name: &str) -> &str {
        self.find_child(name).map_or("", |c| c.text.as_str())
    }

    /// Serialize this element (and its subtree) into `out`.
    pub fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            escape_into(value, out, true);
            out.push('"');
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if self.children.is_empty() {
            escape_into(&self.text, out, false);
        } else {
            for child in &self.children {
                child.write_to(out);
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    /// Parse a single element from the start of `input`.
    ///
    /// Leading whitespace is skipped. Returns the element and the number of
    /// bytes consumed, so callers can parse a sequence of sibling elements.
    pub fn parse_prefix(input: &str) -> Result<(XmlElement, usize), XmlError> {
        let mut parser = Parser {
            input: input.as_bytes(),
            pos: 0,
        };
        parser.skip_whitespace();
        let element = parser.parse_element()?;
        Ok((element, parser.pos))
    }

    /// Parse exactly one element; trailing non-whitespace is an error.
    pub fn parse(input: &str) -> Result<XmlElement, XmlError> {
        let (element, consumed) = Self::parse_prefix(input)?;
        if !input[consumed..].trim().is_empty() {
            return Err(XmlError::TrailingContent);
        }
        Ok(element)
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml_string())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("expected '{expected}' at byte {at}")]
    Expected { expected: char, at: usize },
    #[error("invalid element or attribute name at byte {0}")]
    InvalidName(usize),
    #[error("mismatched close tag: expected </{expected}>, found </{found}>")]
    MismatchedClose { expected: String, found: String },
    #[error("unknown entity '&{0};'")]
    UnknownEntity(String),
    #[error("content after the root element")]
    TrailingContent,
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

fn escape_into(value: &str, out: &mut String, attribute: bool) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\'' if attribute => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, ch: u8) -> Result<(), XmlError> {
        match self.peek() {
            Some(found) if found == ch => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(XmlError::Expected {
                expected: ch as char,
                at: self.pos,
            }),
            None => Err(XmlError::UnexpectedEnd),
        }
    }

    fn parse_name(&mut self) -> Result<String, XmlError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || matches!(ch, b'_' | b'-' | b'.' | b':') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(XmlError::InvalidName(start));
        }
        // Name bytes are validated ASCII, safe to slice.
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_element(&mut self) -> Result<XmlElement, XmlError> {
        self.expect(b'<')?;
        let name = self.parse_name()?;
        let mut element = XmlElement::new(name);

        // Attributes until '>' or '/>'.
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    return Ok(element);
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let key = self.parse_name()?;
                    self.expect(b'=')?;
                    self.expect(b'"')?;
                    let value = self.parse_until(b'"')?;
                    self.expect(b'"')?;
                    element.attributes.push((key, value));
                }
                None => return Err(XmlError::UnexpectedEnd),
            }
        }

        // Content: child elements or text, until the close tag.
        loop {
            if self.peek() == Some(b'<') {
                if self.input.get(self.pos + 1) == Some(&b'/') {
                    self.pos += 2;
                    let close = self.parse_name()?;
                    self.expect(b'>')?;
                    if close != element.name {
                        return Err(XmlError::MismatchedClose {
                            expected: element.name,
                            found: close,
                        });
                    }
                    return Ok(element);
                }
                let child = self.parse_element()?;
                element.children.push(child);
                continue;
            }
            if self.peek().is_none() {
                return Err(XmlError::UnexpectedEnd);
            }
            let text = self.parse_until(b'<')?;
            // Whitespace between child elements is formatting, not content.
            if element.children.is_empty() {
                element.text.push_str(&text);
            } else if !text.trim().is_empty() {
                element.text.push_str(text.trim());
            }
        }
    }

    /// Consume (and unescape) raw content up to, but not including, `stop`.
    fn parse_until(&mut self, stop: u8) -> Result<String, XmlError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(XmlError::UnexpectedEnd),
                Some(ch) if ch == stop => return Ok(out),
                Some(b'&') => {
                    self.pos += 1;
                    let entity_start = self.pos;
                    while self.peek().is_some() && self.peek() != Some(b';') {
                        self.pos += 1;
                    }
                    let entity =
                        String::from_utf8_lossy(&self.input[entity_start..self.pos]).into_owned();
                    self.expect(b';')?;
                    match entity.as_str() {
                        "amp" => out.push('&'),
                        "lt" => out.push('<'),
                        "gt" => out.push('>'),
                        "quot" => out.push('"'),
                        "apos" => out.push('\''),
                        _ => return Err(XmlError::UnknownEntity(entity)),
                    }
                }
                Some(_) => {
                    // Advance over one full UTF-8 scalar.
                    let rest = &self.input[self.pos..];
                    let step = match rest[0] {
                        b if b < 0x80 => 1,
                        b if b >= 0xF0 => 4,
                        b if b >= 0xE0 => 3,
                        _ => 2,
                    };
                    let step = step.min(rest.len());
                    out.push_str(&String::from_utf8_lossy(&rest[..step]));
                    self.pos += step;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
