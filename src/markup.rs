//! Parser for the project document: a small superset of HTML with custom
//! element names (`project`, `outputs`, `assets`, `sequence`, `fragment`,
//! `container`, `app`, `ffmpeg`, `upload`, `style`).
//!
//! The tree preserves source order and attribute order, and every element
//! remembers the byte span of its inner content so container subtrees can be
//! handed to the rasterizer verbatim.

use crate::error::{ReelError, ReelResult};

#[derive(Clone, Debug)]
pub struct Document {
    source: String,
    pub children: Vec<Node>,
}

#[derive(Clone, Debug)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Clone, Debug)]
pub struct Element {
    pub tag: String,
    /// Attributes in source order; duplicate names keep their first value.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub line: usize,
    pub col: usize,
    inner_start: usize,
    inner_end: usize,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn classes(&self) -> Vec<&str> {
        self.attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Concatenated text of all direct text children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for n in &self.children {
            if let Node::Text(t) = n {
                out.push_str(t);
            }
        }
        out
    }

    fn collect<'a>(&'a self, tag: &str, out: &mut Vec<&'a Element>) {
        for e in self.child_elements() {
            if e.tag == tag {
                out.push(e);
            }
            e.collect(tag, out);
        }
    }

    /// All descendant elements with the given tag, in document order.
    pub fn find_all<'a>(&'a self, tag: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        self.collect(tag, &mut out);
        out
    }
}

impl Document {
    pub fn parse(source: &str) -> ReelResult<Document> {
        let mut p = Parser::new(source);
        let children = p.parse_nodes(None)?;
        p.skip_whitespace();
        if !p.at_end() {
            return Err(p.error("trailing content after document root"));
        }
        Ok(Document {
            source: source.to_string(),
            children,
        })
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// All elements with the given tag anywhere in the document.
    pub fn find_all<'a>(&'a self, tag: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        for e in self.child_elements() {
            if e.tag == tag {
                out.push(e);
            }
            e.collect(tag, &mut out);
        }
        out
    }

    /// The raw source text between an element's open and close tags,
    /// untouched by entity decoding.
    pub fn inner_html(&self, el: &Element) -> &str {
        &self.source[el.inner_start..el.inner_end]
    }
}

/// Tags whose content is raw text up to the matching close tag.
const RAW_TEXT_TAGS: &[&str] = &["style", "script"];

/// Standard void elements, so container HTML with `<br>` or `<img>` parses.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s)
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> ReelError {
        ReelError::parse(self.line, self.col, message)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.bump();
        }
    }

    fn parse_nodes(&mut self, close_for: Option<&str>) -> ReelResult<Vec<Node>> {
        let mut nodes = Vec::new();
        loop {
            if self.at_end() {
                if let Some(tag) = close_for {
                    return Err(self.error(format!("unclosed <{tag}>")));
                }
                return Ok(nodes);
            }

            if self.starts_with("</") {
                if close_for.is_some() {
                    return Ok(nodes);
                }
                return Err(self.error("closing tag with no open element"));
            }

            if self.starts_with("<!--") {
                self.skip_until("-->")?;
                continue;
            }
            if self.starts_with("<!") {
                // doctype and friends
                while let Some(b) = self.bump() {
                    if b == b'>' {
                        break;
                    }
                }
                continue;
            }

            if self.peek() == Some(b'<') {
                nodes.push(Node::Element(self.parse_element()?));
            } else {
                let start = self.pos;
                while !self.at_end() && self.peek() != Some(b'<') {
                    self.bump();
                }
                let text = decode_entities(&self.src[start..self.pos]);
                if !text.is_empty() {
                    nodes.push(Node::Text(text));
                }
            }
        }
    }

    fn skip_until(&mut self, marker: &str) -> ReelResult<()> {
        match self.src[self.pos..].find(marker) {
            Some(rel) => {
                self.bump_n(rel + marker.len());
                Ok(())
            }
            None => Err(self.error(format!("unterminated '{marker}'"))),
        }
    }

    fn parse_name(&mut self) -> ReelResult<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            self.bump();
        }
        if self.pos == start {
            return Err(self.error("expected a name"));
        }
        Ok(self.src[start..self.pos].to_ascii_lowercase())
    }

    fn parse_element(&mut self) -> ReelResult<Element> {
        let (line, col) = (self.line, self.col);
        self.bump(); // '<'
        let tag = self.parse_name()?;

        let mut attrs: Vec<(String, String)> = Vec::new();
        let self_closed = loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.error(format!("unterminated <{tag}> tag"))),
                Some(b'>') => {
                    self.bump();
                    break false;
                }
                Some(b'/') => {
                    self.bump();
                    if self.peek() != Some(b'>') {
                        return Err(self.error("expected '>' after '/'"));
                    }
                    self.bump();
                    break true;
                }
                Some(_) => {
                    let name = self.parse_name()?;
                    let value = if self.peek() == Some(b'=') {
                        self.bump();
                        self.parse_attr_value()?
                    } else {
                        String::new()
                    };
                    if !attrs.iter().any(|(k, _)| *k == name) {
                        attrs.push((name, value));
                    }
                }
            }
        };

        if self_closed || VOID_TAGS.contains(&tag.as_str()) {
            return Ok(Element {
                tag,
                attrs,
                children: Vec::new(),
                line,
                col,
                inner_start: self.pos,
                inner_end: self.pos,
            });
        }

        let inner_start = self.pos;
        let children;
        let inner_end;

        if RAW_TEXT_TAGS.contains(&tag.as_str()) {
            let close = format!("</{tag}");
            let rel = self.src[self.pos..]
                .to_ascii_lowercase()
                .find(&close)
                .ok_or_else(|| self.error(format!("unclosed <{tag}>")))?;
            inner_end = self.pos + rel;
            let raw = self.src[self.pos..inner_end].to_string();
            self.bump_n(rel);
            children = if raw.is_empty() {
                Vec::new()
            } else {
                vec![Node::Text(raw)]
            };
        } else {
            children = self.parse_nodes(Some(&tag))?;
            inner_end = self.pos;
        }

        // consume "</tag>"
        self.bump_n(2);
        let close_name = self.parse_name()?;
        if close_name != tag {
            return Err(self.error(format!("expected </{tag}>, found </{close_name}>")));
        }
        self.skip_whitespace();
        if self.peek() != Some(b'>') {
            return Err(self.error(format!("expected '>' to close </{tag}>")));
        }
        self.bump();

        Ok(Element {
            tag,
            attrs,
            children,
            line,
            col,
            inner_start,
            inner_end,
        })
    }

    fn parse_attr_value(&mut self) -> ReelResult<String> {
        match self.peek() {
            Some(q @ (b'"' | b'\'')) => {
                self.bump();
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == q {
                        let raw = &self.src[start..self.pos];
                        self.bump();
                        return Ok(decode_entities(raw));
                    }
                    self.bump();
                }
                Err(self.error("unterminated attribute value"))
            }
            Some(_) => {
                let start = self.pos;
                while matches!(self.peek(), Some(b) if !b.is_ascii_whitespace() && b != b'>' && b != b'/')
                {
                    self.bump();
                }
                Ok(decode_entities(&self.src[start..self.pos]))
            }
            None => Err(self.error("unterminated attribute value")),
        }
    }
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let mut replaced = false;
        for (ent, ch) in [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
            ("&#39;", '\''),
        ] {
            if rest.starts_with(ent) {
                out.push(ch);
                rest = &rest[ent.len()..];
                replaced = true;
                break;
            }
        }
        if !replaced {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}
