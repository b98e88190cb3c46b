//! Minimal stylesheet support for the project document.
//!
//! Rules are matched against an element's tag, classes, and id; the resolved
//! style is the last-declaration-wins cascade over (tag < class < id),
//! with inline `style="…"` applied on top. Only the hyphen-prefixed custom
//! properties and `filter` mean anything downstream; everything else rides
//! along untouched so containers can share the project stylesheet.

use std::collections::BTreeMap;

use crate::{
    error::{ReelError, ReelResult},
    markup::Element,
};

#[derive(Clone, Debug, Default)]
pub struct Stylesheet {
    rules: Vec<Rule>,
}

#[derive(Clone, Debug)]
struct Rule {
    selectors: Vec<Selector>,
    decls: Vec<(String, String)>,
}

/// A compound simple selector: `tag`, `.class`, `#id`, or combinations like
/// `fragment.hero`. Combinators are not supported; the compiler only ever
/// styles elements directly.
#[derive(Clone, Debug, Default)]
struct Selector {
    tag: Option<String>,
    classes: Vec<String>,
    id: Option<String>,
}

impl Selector {
    fn parse(text: &str) -> Option<Selector> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let mut sel = Selector::default();
        let mut rest = text;
        while !rest.is_empty() {
            let (kind, body) = match rest.as_bytes()[0] {
                b'.' => ('.', &rest[1..]),
                b'#' => ('#', &rest[1..]),
                b'*' => {
                    rest = &rest[1..];
                    continue;
                }
                _ => ('t', rest),
            };
            let end = body
                .find(|c: char| c == '.' || c == '#')
                .unwrap_or(body.len());
            let name = &body[..end];
            if name.is_empty() {
                return None;
            }
            match kind {
                '.' => sel.classes.push(name.to_string()),
                '#' => sel.id = Some(name.to_string()),
                _ => sel.tag = Some(name.to_ascii_lowercase()),
            }
            rest = &body[end..];
        }
        Some(sel)
    }

    fn specificity(&self) -> u32 {
        let mut s = 0;
        if self.id.is_some() {
            s += 100;
        }
        s += 10 * self.classes.len() as u32;
        if self.tag.is_some() {
            s += 1;
        }
        s
    }

    fn matches(&self, el: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if *tag != el.tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if el.id() != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let have = el.classes();
            if !self.classes.iter().all(|c| have.contains(&c.as_str())) {
                return false;
            }
        }
        self.tag.is_some() || self.id.is_some() || !self.classes.is_empty()
    }
}

impl Stylesheet {
    pub fn parse(css: &str) -> ReelResult<Stylesheet> {
        let stripped = strip_comments(css);
        let mut rules = Vec::new();
        let mut rest = stripped.as_str();
        let mut consumed = 0usize;

        loop {
            let trimmed_off = rest.len() - rest.trim_start().len();
            rest = rest.trim_start();
            consumed += trimmed_off;
            if rest.is_empty() {
                break;
            }

            // at-rules are outside the dialect; skip the whole block or statement
            if rest.starts_with('@') {
                let skip = skip_at_rule(rest);
                rest = &rest[skip..];
                consumed += skip;
                continue;
            }

            let open = rest
                .find('{')
                .ok_or_else(|| err_at(css, consumed, "expected '{' after selector"))?;
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| err_at(css, consumed + open, "unterminated rule block"))?;

            let selectors: Vec<Selector> = rest[..open]
                .split(',')
                .filter_map(Selector::parse)
                .collect();
            let decls = parse_declarations(&rest[open + 1..close]);
            if !selectors.is_empty() {
                rules.push(Rule { selectors, decls });
            }

            rest = &rest[close + 1..];
            consumed += close + 1;
        }

        Ok(Stylesheet { rules })
    }

    /// Resolved style for one element: matching rules sorted by
    /// (specificity, rule order), declarations applied in order so later
    /// ones win, then the element's inline `style` attribute on top.
    pub fn resolve(&self, el: &Element) -> BTreeMap<String, String> {
        let mut matched: Vec<(u32, usize, &[(String, String)])> = Vec::new();
        for (order, rule) in self.rules.iter().enumerate() {
            let best = rule
                .selectors
                .iter()
                .filter(|s| s.matches(el))
                .map(Selector::specificity)
                .max();
            if let Some(spec) = best {
                matched.push((spec, order, &rule.decls));
            }
        }
        matched.sort_by_key(|(spec, order, _)| (*spec, *order));

        let mut out = BTreeMap::new();
        for (_, _, decls) in matched {
            for (k, v) in decls {
                out.insert(k.clone(), v.clone());
            }
        }
        if let Some(inline) = el.attr("style") {
            for (k, v) in parse_declarations(inline) {
                out.insert(k, v);
            }
        }
        out
    }
}

/// `prop: value; prop: value` into ordered pairs. Semicolons never appear in
/// the value grammar (calc/url use parens), so a flat split is enough.
pub fn parse_declarations(block: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for decl in block.split(';') {
        let decl = decl.trim();
        if decl.is_empty() {
            continue;
        }
        if let Some(colon) = decl.find(':') {
            let prop = decl[..colon].trim().to_ascii_lowercase();
            let value = decl[colon + 1..].trim().to_string();
            if !prop.is_empty() && !value.is_empty() {
                out.push((prop, value));
            }
        }
    }
    out
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn skip_at_rule(rest: &str) -> usize {
    let stmt_end = rest.find(';');
    let block_start = rest.find('{');
    match (stmt_end, block_start) {
        (Some(s), Some(b)) if s < b => s + 1,
        (Some(s), None) => s + 1,
        (_, Some(b)) => {
            let mut depth = 0usize;
            for (i, c) in rest[b..].char_indices() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            return b + i + 1;
                        }
                    }
                    _ => {}
                }
            }
            rest.len()
        }
        (None, None) => rest.len(),
    }
}

fn err_at(css: &str, offset: usize, message: &str) -> ReelError {
    let upto = &css[..offset.min(css.len())];
    let line = upto.matches('\n').count() + 1;
    let col = upto.rsplit('\n').next().map(|l| l.len()).unwrap_or(0) + 1;
    ReelError::parse(line, col, message)
}
