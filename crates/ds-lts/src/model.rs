use std::fmt;

/// The fixed-width identifier of a learned topic shape.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StaticKey(Box<[u8]>);

impl StaticKey {
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticKey({})", hex(&self.0))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One element of a learned topic shape's template: either a literal token
/// that every topic of this shape shares, or a slot whose value varies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Wildcard,
}

/// One element of a caller-supplied MQTT topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSegment {
    Literal(String),
    /// `+`: matches exactly one token.
    Plus,
    /// `#`: matches this level and every level beneath it. Only meaningful
    /// as the final segment of a filter.
    Hash,
}

/// One varying-slot value in a `match_topics` result: either pinned to a
/// concrete token (the filter specified a literal where the shape has a
/// wildcard), or left open (the filter specified `+`/`#` there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaryingSlot {
    Concrete(String),
    Wildcard,
}

/// Split a concrete MQTT topic into its slash-delimited tokens.
pub fn parse_topic(topic: &str) -> Vec<String> {
    topic.split('/').map(str::to_owned).collect()
}

/// Split an MQTT topic filter into its slash-delimited, wildcard-aware segments.
pub fn parse_filter(filter: &str) -> Vec<FilterSegment> {
    filter
        .split('/')
        .map(|tok| match tok {
            "+" => FilterSegment::Plus,
            "#" => FilterSegment::Hash,
            lit => FilterSegment::Literal(lit.to_owned()),
        })
        .collect()
}

/// Reconstruct a full topic from a shape's template and its filter-level
/// varying values, substituting each wildcard slot's concrete token. Returns
/// `None` if any slot was left open (`VaryingSlot::Wildcard`) — callers
/// enumerating streams, not replaying concrete topics, should use
/// `Segment`/`VaryingSlot` directly rather than expecting a flattened topic.
pub fn decompress_topic(template: &[Segment], varying: &[String]) -> Option<Vec<String>> {
    let mut out = Vec::with_capacity(template.len());
    let mut iter = varying.iter();
    for seg in template {
        match seg {
            Segment::Literal(lit) => out.push(lit.clone()),
            Segment::Wildcard => out.push(iter.next()?.clone()),
        }
    }
    if iter.next().is_some() {
        return None;
    }
    Some(out)
}

/// Align a topic filter against a learned shape's template, producing the
/// per-wildcard-slot value the filter implies at that shape: a concrete
/// token where the filter pins one, or `Wildcard` where the filter leaves it
/// open (`+`, or the tail swallowed by a trailing `#`). Returns `None` if the
/// filter's literal segments disagree with the template, or the filter
/// doesn't fully cover the template (too short, no trailing `#`; or too
/// long).
///
/// This is the read-side counterpart to `Lts::match_topics`: it recomputes
/// the same per-level concreteness for one already-known static key, without
/// re-walking the whole trie — used by callers resuming an iterator that was
/// constructed from a persisted `(static_key, filter)` pair rather than a
/// fresh `get_streams` call.
pub fn align_filter(template: &[Segment], filter: &[FilterSegment]) -> Option<Vec<VaryingSlot>> {
    let mut varying = Vec::new();
    let mut ti = 0;
    let mut fi = 0;

    while ti < template.len() {
        match filter.get(fi) {
            None => return None,
            Some(FilterSegment::Hash) => {
                for seg in &template[ti..] {
                    if let Segment::Wildcard = seg {
                        varying.push(VaryingSlot::Wildcard);
                    }
                }
                return Some(varying);
            }
            Some(FilterSegment::Plus) => {
                if let Segment::Wildcard = template[ti] {
                    varying.push(VaryingSlot::Wildcard);
                }
                ti += 1;
                fi += 1;
            }
            Some(FilterSegment::Literal(lit)) => {
                match &template[ti] {
                    Segment::Literal(t) if t == lit => {}
                    Segment::Literal(_) => return None,
                    Segment::Wildcard => varying.push(VaryingSlot::Concrete(lit.clone())),
                }
                ti += 1;
                fi += 1;
            }
        }
    }

    if fi < filter.len() {
        return None;
    }
    Some(varying)
}

/// Split a concrete topic (matching `template`'s length) into its varying
/// tokens, checking literal positions agree. Returns `None` on shape
/// mismatch.
pub fn compress_topic(template: &[Segment], topic: &[String]) -> Option<Vec<String>> {
    if template.len() != topic.len() {
        return None;
    }
    let mut varying = Vec::new();
    for (seg, tok) in template.iter().zip(topic) {
        match seg {
            Segment::Literal(lit) => {
                if lit != tok {
                    return None;
                }
            }
            Segment::Wildcard => varying.push(tok.clone()),
        }
    }
    Some(varying)
}
