//! Top-level element framing
//!
//! INDI messages carry no length prefix: a message is complete when the
//! nesting depth of its root element returns to zero. The framer scans raw
//! bytes incrementally, so a chunk boundary may fall anywhere, and hands
//! complete elements to the decoder. Junk between elements and elements cut
//! short by the start of a new message are reported once and skipped.

use std::collections::VecDeque;

use crate::error::{DecodeError, DecodeErrorKind};

/// Root elements a server or client may send
pub(crate) const TOP_LEVEL_TAGS: &[&str] = &[
    "getProperties",
    "defSwitchVector",
    "defNumberVector",
    "defTextVector",
    "defLightVector",
    "defBLOBVector",
    "setSwitchVector",
    "setNumberVector",
    "setTextVector",
    "setLightVector",
    "setBLOBVector",
    "newSwitchVector",
    "newNumberVector",
    "newTextVector",
    "newLightVector",
    "newBLOBVector",
    "delProperty",
    "enableBLOB",
    "message",
];

pub(crate) fn is_top_level(name: &str) -> bool {
    TOP_LEVEL_TAGS.contains(&name)
}

/// Output of the framer
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    /// One complete top-level element, root tag name and raw bytes
    Element { name: String, bytes: Vec<u8> },
    Error(DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lex {
    /// Character data, or whitespace between elements
    Text,
    /// Inside `<...>`; `last` is the last significant byte outside quotes
    Tag { quote: Option<u8>, last: u8 },
    /// Inside `<!-- ... -->`
    Comment { dashes: u8 },
}

pub(crate) struct Framer {
    buf: Vec<u8>,
    max_frame: usize,
    lex: Lex,
    tag_start: usize,
    depth: usize,
    frame_start: Option<usize>,
    frame_name: String,
    /// Current element exceeded `max_frame` and is being skipped
    discarding: bool,
    /// Non-whitespace bytes seen outside any element since the last report
    junk: usize,
    out: VecDeque<Frame>,
}

impl Framer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
            lex: Lex::Text,
            tag_start: 0,
            depth: 0,
            frame_start: None,
            frame_name: String::new(),
            discarding: false,
            junk: 0,
            out: VecDeque::new(),
        }
    }

    /// Scan another chunk of input
    pub fn push(&mut self, data: &[u8]) {
        let start = self.buf.len();
        self.buf.extend_from_slice(data);
        for i in start..self.buf.len() {
            let b = self.buf[i];
            self.step(i, b);
            self.check_size(i);
        }
        self.compact();
    }

    /// Next complete element or error, in stream order
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.out.pop_front()
    }

    /// End of input: report whatever is left unfinished
    pub fn finish(&mut self) {
        if self.lex != Lex::Text && self.frame_start.is_none() && self.depth == 0 {
            self.junk += self.buf.len().saturating_sub(self.tag_start);
        }
        if self.depth > 0 && !self.discarding {
            if let Some(start) = self.frame_start {
                let bytes = self.buf.len().saturating_sub(start);
                self.out.push_back(Frame::Error(DecodeError::new(
                    DecodeErrorKind::Truncated,
                    format!("stream ended inside <{}>", self.frame_name),
                    bytes,
                )));
            }
        }
        self.flush_junk();
        self.buf.clear();
        self.lex = Lex::Text;
        self.depth = 0;
        self.frame_start = None;
        self.discarding = false;
    }

    /// Bytes held for an element still in progress
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn step(&mut self, i: usize, b: u8) {
        match self.lex {
            Lex::Text => {
                if b == b'<' {
                    self.begin_tag(i);
                } else if self.depth == 0 && !b.is_ascii_whitespace() {
                    self.junk += 1;
                }
            }
            Lex::Tag { quote, last } => {
                if b == b'<' {
                    // a raw '<' cannot occur inside markup, the tag was cut off
                    self.abandon_tag(i);
                    self.begin_tag(i);
                    return;
                }
                match quote {
                    Some(q) => {
                        if b == q {
                            self.lex = Lex::Tag { quote: None, last: b };
                        }
                    }
                    None if b == b'"' || b == b'\'' => {
                        self.lex = Lex::Tag {
                            quote: Some(b),
                            last: b,
                        };
                    }
                    None if b == b'>' => {
                        self.lex = Lex::Text;
                        self.close_tag(i, last);
                    }
                    None => {
                        if i == self.tag_start + 3 && &self.buf[self.tag_start..=i] == b"<!--" {
                            self.lex = Lex::Comment { dashes: 0 };
                            return;
                        }
                        let last = if b.is_ascii_whitespace() { last } else { b };
                        self.lex = Lex::Tag { quote: None, last };
                    }
                }
            }
            Lex::Comment { dashes } => {
                if b == b'>' && dashes >= 2 {
                    self.lex = Lex::Text;
                } else if b == b'-' {
                    self.lex = Lex::Comment {
                        dashes: dashes.saturating_add(1),
                    };
                } else {
                    self.lex = Lex::Comment { dashes: 0 };
                }
            }
        }
    }

    fn begin_tag(&mut self, i: usize) {
        self.tag_start = i;
        self.lex = Lex::Tag {
            quote: None,
            last: b'<',
        };
    }

    fn abandon_tag(&mut self, i: usize) {
        if self.depth == 0 {
            self.junk += i - self.tag_start;
        }
        // inside an element the partial tag stays in the frame and either
        // a new root element truncates it or the parser rejects it
    }

    fn close_tag(&mut self, end: usize, last: u8) {
        let inner = &self.buf[self.tag_start + 1..end];
        match inner.first() {
            // prolog, doctype
            Some(b'?') | Some(b'!') => {}
            Some(b'/') => {
                if self.depth == 0 {
                    self.junk += end + 1 - self.tag_start;
                    return;
                }
                self.depth -= 1;
                if self.depth == 0 {
                    self.finish_frame(end + 1);
                }
            }
            _ => {
                let name = tag_name(inner);
                if name.is_empty() {
                    if self.depth == 0 {
                        self.junk += end + 1 - self.tag_start;
                    }
                    return;
                }
                if self.depth > 0 && is_top_level(&name) {
                    self.truncate_frame(self.tag_start, &name);
                }
                if self.depth == 0 {
                    self.flush_junk();
                    self.frame_start = Some(self.tag_start);
                    self.frame_name = name;
                    self.discarding = false;
                }
                if last == b'/' {
                    if self.depth == 0 {
                        self.finish_frame(end + 1);
                    }
                } else {
                    self.depth += 1;
                }
            }
        }
    }

    fn truncate_frame(&mut self, at: usize, next: &str) {
        if !self.discarding {
            let bytes = self
                .frame_start
                .map(|start| at.saturating_sub(start))
                .unwrap_or(0);
            self.out.push_back(Frame::Error(DecodeError::new(
                DecodeErrorKind::Truncated,
                format!("<{}> cut off by <{}>", self.frame_name, next),
                bytes,
            )));
        }
        self.depth = 0;
        self.frame_start = None;
        self.discarding = false;
    }

    fn finish_frame(&mut self, end: usize) {
        let start = self.frame_start.take();
        if self.discarding {
            self.discarding = false;
            return;
        }
        if let Some(start) = start {
            self.out.push_back(Frame::Element {
                name: std::mem::take(&mut self.frame_name),
                bytes: self.buf[start..end].to_vec(),
            });
        }
    }

    fn check_size(&mut self, i: usize) {
        if self.discarding {
            return;
        }
        if let Some(start) = self.frame_start {
            if i + 1 - start > self.max_frame {
                self.out.push_back(Frame::Error(DecodeError::new(
                    DecodeErrorKind::Oversized,
                    format!("<{}> exceeds {} bytes", self.frame_name, self.max_frame),
                    i + 1 - start,
                )));
                self.discarding = true;
            }
        }
    }

    fn flush_junk(&mut self) {
        if self.junk > 0 {
            self.out.push_back(Frame::Error(DecodeError::new(
                DecodeErrorKind::Garbage,
                "stray bytes outside any element",
                self.junk,
            )));
            self.junk = 0;
        }
    }

    /// Drop bytes no longer needed by an element or tag in progress
    fn compact(&mut self) {
        let mut keep = self.buf.len();
        if let (Some(start), false) = (self.frame_start, self.discarding) {
            keep = keep.min(start);
        }
        if self.lex != Lex::Text {
            keep = keep.min(self.tag_start);
        }
        if keep == 0 {
            return;
        }
        self.buf.drain(..keep);
        self.tag_start = self.tag_start.saturating_sub(keep);
        self.frame_start = self.frame_start.map(|s| s.saturating_sub(keep));
    }
}

fn tag_name(inner: &[u8]) -> String {
    let end = inner
        .iter()
        .position(|b| b.is_ascii_whitespace() || *b == b'/')
        .unwrap_or(inner.len());
    String::from_utf8_lossy(&inner[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(framer: &mut Framer) -> Vec<Frame> {
        std::iter::from_fn(|| framer.next_frame()).collect()
    }

    fn element(frame: &Frame) -> (&str, &str) {
        match frame {
            Frame::Element { name, bytes } => (name, std::str::from_utf8(bytes).unwrap()),
            Frame::Error(e) => panic!("expected element, got {e}"),
        }
    }

    fn error_kind(frame: &Frame) -> DecodeErrorKind {
        match frame {
            Frame::Error(e) => e.kind,
            Frame::Element { name, .. } => panic!("expected error, got <{name}>"),
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let xml = br#"<getProperties version="1.7"/>"#;
        let mut framer = Framer::new(1024);
        for b in xml.iter() {
            framer.push(std::slice::from_ref(b));
        }
        let out = frames(&mut framer);
        assert_eq!(out.len(), 1);
        assert_eq!(element(&out[0]), ("getProperties", r#"<getProperties version="1.7"/>"#));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_nested_vector_with_quoted_angle_bracket() {
        let xml = "<defTextVector device=\"d\" name=\"p\" label=\"a>b\">\n  \
                   <defText name=\"t\">hi</defText>\n</defTextVector>\n";
        let mut framer = Framer::new(1024);
        framer.push(&xml.as_bytes()[..20]);
        assert!(framer.next_frame().is_none());
        framer.push(&xml.as_bytes()[20..]);
        let out = frames(&mut framer);
        assert_eq!(out.len(), 1);
        let (name, text) = element(&out[0]);
        assert_eq!(name, "defTextVector");
        assert!(text.ends_with("</defTextVector>"));
    }

    #[test]
    fn test_garbage_is_reported_once_before_next_element() {
        let mut framer = Framer::new(1024);
        framer.push(b"hello there ");
        framer.push(b"</stray> more junk\n<getProperties/>");
        let out = frames(&mut framer);
        assert_eq!(out.len(), 2);
        assert_eq!(error_kind(&out[0]), DecodeErrorKind::Garbage);
        assert_eq!(element(&out[1]).0, "getProperties");
    }

    #[test]
    fn test_truncated_element_resyncs_at_next_root() {
        let mut framer = Framer::new(1024);
        framer.push(b"<defNumberVector device=\"d\" name=\"p\"><defNumb");
        framer.push(b"<getProperties version=\"1.7\"/>");
        let out = frames(&mut framer);
        assert_eq!(out.len(), 2);
        assert_eq!(error_kind(&out[0]), DecodeErrorKind::Truncated);
        assert_eq!(element(&out[1]).0, "getProperties");
    }

    #[test]
    fn test_oversized_element_is_skipped() {
        let mut framer = Framer::new(64);
        let big = format!(
            "<setBLOBVector device=\"d\" name=\"b\"><oneBLOB name=\"x\">{}</oneBLOB></setBLOBVector>",
            "A".repeat(200)
        );
        framer.push(big.as_bytes());
        framer.push(b"<delProperty device=\"d\"/>");
        let out = frames(&mut framer);
        assert_eq!(out.len(), 2);
        assert_eq!(error_kind(&out[0]), DecodeErrorKind::Oversized);
        assert_eq!(element(&out[1]).0, "delProperty");
    }

    #[test]
    fn test_prolog_and_comments_are_not_garbage() {
        let mut framer = Framer::new(1024);
        framer.push(b"<?xml version=\"1.0\"?>\n<!-- a <comment> -->\n<message message=\"hi\"/>");
        let out = frames(&mut framer);
        assert_eq!(out.len(), 1);
        assert_eq!(element(&out[0]).0, "message");
    }

    #[test]
    fn test_end_of_stream_inside_element() {
        let mut framer = Framer::new(1024);
        framer.push(b"<setNumberVector device=\"d\" name=\"p\"><oneNumber name=\"n\">1");
        framer.finish();
        let out = frames(&mut framer);
        assert_eq!(out.len(), 1);
        assert_eq!(error_kind(&out[0]), DecodeErrorKind::Truncated);
    }

    #[test]
    fn test_buffer_is_released_between_elements() {
        let mut framer = Framer::new(1024);
        for _ in 0..100 {
            framer.push(b"<getProperties/>\n");
        }
        assert_eq!(frames(&mut framer).len(), 100);
        assert_eq!(framer.buffered(), 0);
    }
}
