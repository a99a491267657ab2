//! INDI decoding
//!
//! Framed elements are parsed with quick-xml into a small element tree and
//! then mapped onto [`Message`]. [`Decoder`] is the synchronous streaming
//! interface, [`MessageReader`] pumps it from an async byte stream.
//!
//! Two normalisations apply. Element text is trimmed, because servers pad
//! values with line breaks and indentation. An empty `device`, `name` or
//! `version` scope reads as absent, matching what the encoder writes for it.
//! Other attributes, such as `message`, are kept as sent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::IndiConfig;
use crate::error::{DecodeError, DecodeErrorKind};
use crate::framing::{Frame, Framer};
use crate::message::*;

/// Parse an INDI number, accepting sexagesimal forms such as `-12:30:15`,
/// `12 30` or `5;45`
pub fn parse_number(text: &str) -> Option<f64> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }

    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let mut value = 0.0;
    let mut scale = 1.0;
    let mut parts = 0;
    for part in body
        .split(|c: char| c == ':' || c == ';' || c.is_whitespace())
        .filter(|p| !p.is_empty())
    {
        let v: f64 = part.parse().ok()?;
        if v.is_sign_negative() || parts == 3 {
            return None;
        }
        value += v / scale;
        scale *= 60.0;
        parts += 1;
    }
    if parts < 2 {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Result of pulling one item off a stream
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    /// Bytes were dropped; the stream is already positioned at the next element
    Malformed(DecodeError),
    EndOfStream,
}

/// Streaming decoder: push arbitrary chunks, pull messages
pub struct Decoder {
    framer: Framer,
}

impl Decoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            framer: Framer::new(max_frame_bytes),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.framer.push(bytes);
    }

    /// Flush state at end of input; incomplete data is reported by `decode_next`
    pub fn finish(&mut self) {
        self.framer.finish();
    }

    /// Next decoded message or decode error, `None` when more input is needed.
    /// Unknown top-level elements are skipped.
    pub fn decode_next(&mut self) -> Option<Result<Message, DecodeError>> {
        loop {
            match self.framer.next_frame()? {
                Frame::Error(e) => return Some(Err(e)),
                Frame::Element { name, bytes } => match decode_frame(&bytes) {
                    Ok(Some(message)) => return Some(Ok(message)),
                    Ok(None) => {
                        tracing::debug!("Skipping unknown INDI element <{}>", name);
                    }
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}

/// Decode a single complete top-level element
pub fn decode_message(xml: &str) -> Result<Message, DecodeError> {
    decode_frame(xml.as_bytes())?.ok_or_else(|| {
        DecodeError::new(
            DecodeErrorKind::Malformed,
            "not an INDI message",
            xml.len(),
        )
    })
}

/// Reads messages from an async byte stream
pub struct MessageReader<R> {
    reader: R,
    decoder: Decoder,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize, read_chunk_bytes: usize) -> Self {
        Self {
            reader,
            decoder: Decoder::new(max_frame_bytes),
            chunk: vec![0u8; read_chunk_bytes.max(1)],
            eof: false,
        }
    }

    pub fn with_config(reader: R, config: &IndiConfig) -> Self {
        Self::new(reader, config.max_frame_bytes, config.read_chunk_bytes)
    }

    /// Next item from the stream. Cancel-safe: dropping the future between
    /// reads loses no data. Errors are transport errors only.
    pub async fn next(&mut self) -> std::io::Result<Decoded> {
        loop {
            match self.decoder.decode_next() {
                Some(Ok(message)) => return Ok(Decoded::Message(message)),
                Some(Err(e)) => return Ok(Decoded::Malformed(e)),
                None => {}
            }
            if self.eof {
                return Ok(Decoded::EndOfStream);
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
                self.decoder.finish();
            } else {
                self.decoder.push(&self.chunk[..n]);
            }
        }
    }
}

/// Minimal element tree for one framed message
#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self, String> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            attrs.push((key, value.into_owned()));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            ..Self::default()
        })
    }

    fn attr(&self, key: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Scope attribute, treating an empty value as absent
    fn attr_nonempty(&self, key: &str) -> Option<String> {
        self.attr(key).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, String> {
        self.attr(key)
            .ok_or_else(|| format!("<{}> is missing '{}'", self.name, key))
    }

    fn number_attr(&self, key: &str) -> Result<Option<f64>, String> {
        match self.attr(key) {
            None => Ok(None),
            Some(raw) => parse_number(&raw)
                .map(Some)
                .ok_or_else(|| format!("<{}> has a bad {} '{}'", self.name, key, raw)),
        }
    }

    fn state_attr(&self) -> Result<Option<IndiPropertyState>, String> {
        match self.attr("state") {
            None => Ok(None),
            Some(raw) => IndiPropertyState::from_wire(&raw)
                .map(Some)
                .ok_or_else(|| format!("<{}> has a bad state '{}'", self.name, raw)),
        }
    }

    /// Child elements with the expected tag; anything else is skipped
    fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |child| {
            if child.name == tag {
                true
            } else {
                tracing::debug!("Ignoring <{}> inside <{}>", child.name, self.name);
                false
            }
        })
    }
}

fn parse_tree(xml: &str) -> Result<Node, String> {
    let mut reader = Reader::from_str(xml);
    // element values never keep surrounding whitespace
    reader.trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) -> Result<(), String> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None if root.is_none() => *root = Some(node),
            None => return Err("more than one root element".to_string()),
        }
        Ok(())
    }

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => stack.push(Node::open(&e)?),
            Event::Empty(e) => {
                let node = Node::open(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or("unbalanced end tag")?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("<{}> is not closed", open.name));
    }
    root.ok_or_else(|| "no element".to_string())
}

pub(crate) fn decode_frame(bytes: &[u8]) -> Result<Option<Message>, DecodeError> {
    let malformed = |detail: String| DecodeError::new(DecodeErrorKind::Malformed, detail, bytes.len());
    let xml = std::str::from_utf8(bytes).map_err(|e| malformed(format!("invalid UTF-8: {}", e)))?;
    let node = parse_tree(xml).map_err(malformed)?;
    to_message(&node).map_err(malformed)
}

fn vector_kind(tag: &str, prefix: &str) -> Option<VectorKind> {
    tag.strip_prefix(prefix)?
        .strip_suffix("Vector")
        .and_then(VectorKind::from_tag)
}

fn to_message(node: &Node) -> Result<Option<Message>, String> {
    let message = match node.name.as_str() {
        "getProperties" => Message::GetProperties(GetProperties {
            version: node.attr_nonempty("version"),
            device: node.attr_nonempty("device"),
            name: node.attr_nonempty("name"),
        }),
        "delProperty" => Message::DelProperty(DelProperty {
            device: node.required("device")?,
            name: node.attr_nonempty("name"),
            timestamp: node.attr("timestamp"),
            message: node.attr("message"),
        }),
        "enableBLOB" => {
            let raw = node.text.trim();
            Message::EnableBlob(EnableBlob {
                device: node.required("device")?,
                name: node.attr_nonempty("name"),
                mode: BlobMode::from_wire(raw)
                    .ok_or_else(|| format!("bad enableBLOB value '{}'", raw))?,
            })
        }
        "message" => Message::Notice(Notice {
            device: node.attr_nonempty("device"),
            timestamp: node.attr("timestamp"),
            message: node.attr("message").unwrap_or_default(),
        }),
        tag => {
            if let Some(kind) = vector_kind(tag, "def") {
                Message::DefVector(def_vector(node, kind)?)
            } else if let Some(kind) = vector_kind(tag, "set") {
                Message::SetVector(SetVector {
                    device: node.required("device")?,
                    name: node.required("name")?,
                    state: node.state_attr()?,
                    timeout: node.number_attr("timeout")?,
                    timestamp: node.attr("timestamp"),
                    message: node.attr("message"),
                    elements: one_elements(node, kind)?,
                })
            } else if let Some(kind) = vector_kind(tag, "new") {
                let rule = match node.attr("rule") {
                    None => None,
                    Some(raw) => Some(
                        SwitchRule::from_wire(&raw).ok_or_else(|| format!("bad rule '{}'", raw))?,
                    ),
                };
                Message::NewVector(NewVector {
                    device: node.required("device")?,
                    name: node.required("name")?,
                    timestamp: node.attr("timestamp"),
                    message: node.attr("message"),
                    rule,
                    elements: one_elements(node, kind)?,
                })
            } else {
                return Ok(None);
            }
        }
    };
    Ok(Some(message))
}

fn parse_switch(node: &Node) -> Result<bool, String> {
    match node.text.trim() {
        "On" => Ok(true),
        "Off" => Ok(false),
        other => Err(format!("bad switch value '{}' for {}", other, node.attr("name").unwrap_or_default())),
    }
}

fn parse_light(node: &Node) -> Result<IndiPropertyState, String> {
    IndiPropertyState::from_wire(node.text.trim())
        .ok_or_else(|| format!("bad light value '{}'", node.text.trim()))
}

fn parse_value(node: &Node) -> Result<f64, String> {
    parse_number(&node.text).ok_or_else(|| {
        format!(
            "bad number '{}' for {}",
            node.text.trim(),
            node.attr("name").unwrap_or_default()
        )
    })
}

fn def_vector(node: &Node, kind: VectorKind) -> Result<DefVector, String> {
    let perm = match kind {
        VectorKind::Light => IndiPermission::ReadOnly,
        _ => match node.attr("perm") {
            None => IndiPermission::ReadWrite,
            Some(raw) => {
                IndiPermission::from_wire(&raw).ok_or_else(|| format!("bad perm '{}'", raw))?
            }
        },
    };

    let tag = format!("def{}", kind.tag());
    let children = node.children_named(&tag);
    let elements = match kind {
        VectorKind::Switch => {
            let rule = match node.attr("rule") {
                None => SwitchRule::AnyOfMany,
                Some(raw) => {
                    SwitchRule::from_wire(&raw).ok_or_else(|| format!("bad rule '{}'", raw))?
                }
            };
            let elements = children
                .map(|c| {
                    Ok(DefSwitch {
                        name: c.required("name")?,
                        label: c.attr("label"),
                        value: parse_switch(c)?,
                    })
                })
                .collect::<Result<_, String>>()?;
            DefElements::Switch { rule, elements }
        }
        VectorKind::Number => DefElements::Number(
            children
                .map(|c| {
                    Ok(DefNumber {
                        name: c.required("name")?,
                        label: c.attr("label"),
                        format: c.attr("format").unwrap_or_else(|| "%g".to_string()),
                        min: c.number_attr("min")?.unwrap_or(0.0),
                        max: c.number_attr("max")?.unwrap_or(0.0),
                        step: c.number_attr("step")?.unwrap_or(0.0),
                        value: parse_value(c)?,
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Text => DefElements::Text(
            children
                .map(|c| {
                    Ok(DefText {
                        name: c.required("name")?,
                        label: c.attr("label"),
                        value: c.text.clone(),
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Light => DefElements::Light(
            children
                .map(|c| {
                    Ok(DefLight {
                        name: c.required("name")?,
                        label: c.attr("label"),
                        value: parse_light(c)?,
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Blob => DefElements::Blob(
            children
                .map(|c| {
                    Ok(DefBlob {
                        name: c.required("name")?,
                        label: c.attr("label"),
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
    };

    Ok(DefVector {
        device: node.required("device")?,
        name: node.required("name")?,
        label: node.attr("label"),
        group: node.attr("group"),
        state: node.state_attr()?.unwrap_or_default(),
        perm,
        timeout: node.number_attr("timeout")?,
        timestamp: node.attr("timestamp"),
        message: node.attr("message"),
        elements,
    })
}

fn one_elements(node: &Node, kind: VectorKind) -> Result<OneElements, String> {
    let tag = format!("one{}", kind.tag());
    let children = node.children_named(&tag);
    let elements = match kind {
        VectorKind::Switch => OneElements::Switch(
            children
                .map(|c| {
                    Ok(OneSwitch {
                        name: c.required("name")?,
                        value: parse_switch(c)?,
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Number => OneElements::Number(
            children
                .map(|c| {
                    Ok(OneNumber {
                        name: c.required("name")?,
                        value: parse_value(c)?,
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Text => OneElements::Text(
            children
                .map(|c| {
                    Ok(OneText {
                        name: c.required("name")?,
                        value: c.text.clone(),
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Light => OneElements::Light(
            children
                .map(|c| {
                    Ok(OneLight {
                        name: c.required("name")?,
                        value: parse_light(c)?,
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
        VectorKind::Blob => OneElements::Blob(
            children
                .map(|c| {
                    let name = c.required("name")?;
                    let compact: Vec<u8> = c
                        .text
                        .bytes()
                        .filter(|b| !b.is_ascii_whitespace())
                        .collect();
                    let data = BASE64
                        .decode(&compact)
                        .map_err(|e| format!("bad base64 in BLOB {}: {}", name, e))?;
                    let size = match c.attr("size") {
                        Some(raw) => raw
                            .trim()
                            .parse()
                            .map_err(|_| format!("bad BLOB size '{}'", raw))?,
                        None => data.len(),
                    };
                    Ok(OneBlob {
                        name,
                        size,
                        format: c.attr("format").unwrap_or_default(),
                        data,
                    })
                })
                .collect::<Result<_, String>>()?,
        ),
    };
    Ok(elements)
}
