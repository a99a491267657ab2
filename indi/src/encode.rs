//! INDI encoding
//!
//! Hand-written serializer, one arm per message variant. Numbers are written
//! in their shortest exact decimal form so decoding restores the same value.

use std::fmt::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::escape::escape;

use crate::message::*;

/// Serialize a message as one top-level XML element followed by a newline
pub fn encode(message: &Message) -> String {
    let mut out = String::new();
    match message {
        Message::GetProperties(m) => {
            out.push_str("<getProperties");
            scope_attr(&mut out, "version", m.version.as_deref());
            scope_attr(&mut out, "device", m.device.as_deref());
            scope_attr(&mut out, "name", m.name.as_deref());
            out.push_str("/>");
        }
        Message::DefVector(m) => encode_def(&mut out, m),
        Message::SetVector(m) => {
            let tag = format!("set{}Vector", m.elements.kind().tag());
            let _ = write!(out, "<{}", tag);
            attr(&mut out, "device", &m.device);
            attr(&mut out, "name", &m.name);
            opt_attr(&mut out, "state", m.state.map(|s| s.as_wire()));
            opt_number_attr(&mut out, "timeout", m.timeout);
            opt_attr(&mut out, "timestamp", m.timestamp.as_deref());
            opt_attr(&mut out, "message", m.message.as_deref());
            out.push('>');
            encode_ones(&mut out, &m.elements);
            let _ = write!(out, "</{}>", tag);
        }
        Message::NewVector(m) => {
            let tag = format!("new{}Vector", m.elements.kind().tag());
            let _ = write!(out, "<{}", tag);
            attr(&mut out, "device", &m.device);
            attr(&mut out, "name", &m.name);
            opt_attr(&mut out, "timestamp", m.timestamp.as_deref());
            opt_attr(&mut out, "message", m.message.as_deref());
            opt_attr(&mut out, "rule", m.rule.map(|r| r.as_wire()));
            out.push('>');
            encode_ones(&mut out, &m.elements);
            let _ = write!(out, "</{}>", tag);
        }
        Message::DelProperty(m) => {
            out.push_str("<delProperty");
            attr(&mut out, "device", &m.device);
            scope_attr(&mut out, "name", m.name.as_deref());
            opt_attr(&mut out, "timestamp", m.timestamp.as_deref());
            opt_attr(&mut out, "message", m.message.as_deref());
            out.push_str("/>");
        }
        Message::EnableBlob(m) => {
            out.push_str("<enableBLOB");
            attr(&mut out, "device", &m.device);
            scope_attr(&mut out, "name", m.name.as_deref());
            let _ = write!(out, ">{}</enableBLOB>", m.mode.as_wire());
        }
        Message::Notice(m) => {
            out.push_str("<message");
            scope_attr(&mut out, "device", m.device.as_deref());
            opt_attr(&mut out, "timestamp", m.timestamp.as_deref());
            attr(&mut out, "message", &m.message);
            out.push_str("/>");
        }
    }
    out.push('\n');
    out
}

impl Message {
    /// Wire form of this message
    pub fn to_xml(&self) -> String {
        encode(self)
    }
}

fn attr(out: &mut String, key: &str, value: &str) {
    let _ = write!(out, " {}=\"{}\"", key, escape(value));
}

fn opt_attr(out: &mut String, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        attr(out, key, value);
    }
}

/// Device, name or version that narrows a message. Empty means no narrowing,
/// so it is left off the wire.
fn scope_attr(out: &mut String, key: &str, value: Option<&str>) {
    opt_attr(out, key, value.filter(|v| !v.is_empty()));
}

fn opt_number_attr(out: &mut String, key: &str, value: Option<f64>) {
    if let Some(value) = value {
        let _ = write!(out, " {}=\"{}\"", key, value);
    }
}

fn switch_text(on: bool) -> &'static str {
    if on {
        "On"
    } else {
        "Off"
    }
}

fn encode_def(out: &mut String, m: &DefVector) {
    let kind = m.elements.kind();
    let tag = format!("def{}Vector", kind.tag());
    let _ = write!(out, "<{}", tag);
    attr(out, "device", &m.device);
    attr(out, "name", &m.name);
    opt_attr(out, "label", m.label.as_deref());
    opt_attr(out, "group", m.group.as_deref());
    attr(out, "state", m.state.as_wire());
    if kind != VectorKind::Light {
        attr(out, "perm", m.perm.as_wire());
    }
    if let DefElements::Switch { rule, .. } = &m.elements {
        attr(out, "rule", rule.as_wire());
    }
    opt_number_attr(out, "timeout", m.timeout);
    opt_attr(out, "timestamp", m.timestamp.as_deref());
    opt_attr(out, "message", m.message.as_deref());
    out.push('>');

    match &m.elements {
        DefElements::Switch { elements, .. } => {
            for e in elements {
                out.push_str("<defSwitch");
                attr(out, "name", &e.name);
                opt_attr(out, "label", e.label.as_deref());
                let _ = write!(out, ">{}</defSwitch>", switch_text(e.value));
            }
        }
        DefElements::Number(elements) => {
            for e in elements {
                out.push_str("<defNumber");
                attr(out, "name", &e.name);
                opt_attr(out, "label", e.label.as_deref());
                attr(out, "format", &e.format);
                let _ = write!(
                    out,
                    " min=\"{}\" max=\"{}\" step=\"{}\">{}</defNumber>",
                    e.min, e.max, e.step, e.value
                );
            }
        }
        DefElements::Text(elements) => {
            for e in elements {
                out.push_str("<defText");
                attr(out, "name", &e.name);
                opt_attr(out, "label", e.label.as_deref());
                let _ = write!(out, ">{}</defText>", escape(e.value.as_str()));
            }
        }
        DefElements::Light(elements) => {
            for e in elements {
                out.push_str("<defLight");
                attr(out, "name", &e.name);
                opt_attr(out, "label", e.label.as_deref());
                let _ = write!(out, ">{}</defLight>", e.value.as_wire());
            }
        }
        DefElements::Blob(elements) => {
            for e in elements {
                out.push_str("<defBLOB");
                attr(out, "name", &e.name);
                opt_attr(out, "label", e.label.as_deref());
                out.push_str("/>");
            }
        }
    }
    let _ = write!(out, "</{}>", tag);
}

fn encode_ones(out: &mut String, elements: &OneElements) {
    match elements {
        OneElements::Switch(v) => {
            for e in v {
                out.push_str("<oneSwitch");
                attr(out, "name", &e.name);
                let _ = write!(out, ">{}</oneSwitch>", switch_text(e.value));
            }
        }
        OneElements::Number(v) => {
            for e in v {
                out.push_str("<oneNumber");
                attr(out, "name", &e.name);
                let _ = write!(out, ">{}</oneNumber>", e.value);
            }
        }
        OneElements::Text(v) => {
            for e in v {
                out.push_str("<oneText");
                attr(out, "name", &e.name);
                let _ = write!(out, ">{}</oneText>", escape(e.value.as_str()));
            }
        }
        OneElements::Light(v) => {
            for e in v {
                out.push_str("<oneLight");
                attr(out, "name", &e.name);
                let _ = write!(out, ">{}</oneLight>", e.value.as_wire());
            }
        }
        OneElements::Blob(v) => {
            for e in v {
                out.push_str("<oneBLOB");
                attr(out, "name", &e.name);
                let _ = write!(out, " size=\"{}\"", e.size);
                attr(out, "format", &e.format);
                let _ = write!(out, ">{}</oneBLOB>", BASE64.encode(&e.data));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, Decoder};

    fn round_trip(message: Message) {
        let xml = encode(&message);
        let decoded = decode_message(&xml).unwrap_or_else(|e| panic!("{e}\n{xml}"));
        assert_eq!(decoded, message, "wire form: {}", xml);
    }

    fn def(elements: DefElements, perm: IndiPermission) -> DefVector {
        DefVector {
            device: "Sim \"A\" & <B>".to_string(),
            name: "PROP".to_string(),
            label: Some("Label".to_string()),
            group: Some("Main Control".to_string()),
            state: IndiPropertyState::Busy,
            perm,
            timeout: Some(60.0),
            timestamp: Some("2024-03-01T21:00:00".to_string()),
            message: Some("moving 'now'".to_string()),
            elements,
        }
    }

    #[test]
    fn test_definitions_round_trip() {
        round_trip(Message::DefVector(def(
            DefElements::Switch {
                rule: SwitchRule::OneOfMany,
                elements: vec![
                    DefSwitch {
                        name: "PARK".to_string(),
                        label: Some("Park(ed)".to_string()),
                        value: true,
                    },
                    DefSwitch {
                        name: "UNPARK".to_string(),
                        label: None,
                        value: false,
                    },
                ],
            },
            IndiPermission::ReadWrite,
        )));
        round_trip(Message::DefVector(def(
            DefElements::Number(vec![DefNumber {
                name: "DEC".to_string(),
                label: Some("DEC (dd:mm:ss)".to_string()),
                format: "%010.6m".to_string(),
                min: -90.0,
                max: 90.0,
                step: 0.0001,
                value: -0.1 - 0.2,
            }]),
            IndiPermission::WriteOnly,
        )));
        round_trip(Message::DefVector(def(
            DefElements::Text(vec![DefText {
                name: "DRIVER_EXEC".to_string(),
                label: None,
                value: "indi_simulator_telescope <&>".to_string(),
            }]),
            IndiPermission::ReadOnly,
        )));
        round_trip(Message::DefVector(def(
            DefElements::Light(vec![DefLight {
                name: "RAIN".to_string(),
                label: Some("Rain".to_string()),
                value: IndiPropertyState::Alert,
            }]),
            IndiPermission::ReadOnly,
        )));
        round_trip(Message::DefVector(def(
            DefElements::Blob(vec![DefBlob {
                name: "CCD1".to_string(),
                label: Some("Image".to_string()),
            }]),
            IndiPermission::ReadOnly,
        )));
    }

    #[test]
    fn test_empty_and_minimal_variants_round_trip() {
        round_trip(Message::GetProperties(GetProperties::default()));
        round_trip(Message::GetProperties(GetProperties {
            version: Some("1.7".to_string()),
            device: Some("CCD Simulator".to_string()),
            name: Some("CCD_EXPOSURE".to_string()),
        }));
        round_trip(Message::DefVector(DefVector {
            device: "d".to_string(),
            name: "EMPTY".to_string(),
            label: None,
            group: None,
            state: IndiPropertyState::Idle,
            perm: IndiPermission::ReadWrite,
            timeout: None,
            timestamp: None,
            message: None,
            elements: DefElements::Number(vec![]),
        }));
        round_trip(Message::DelProperty(DelProperty {
            device: "d".to_string(),
            name: None,
            timestamp: None,
            message: None,
        }));
        round_trip(Message::DelProperty(DelProperty {
            device: "d".to_string(),
            name: Some("FILTER_NAME".to_string()),
            timestamp: Some("2024-03-01T21:00:00".to_string()),
            message: Some("gone".to_string()),
        }));
        round_trip(Message::EnableBlob(EnableBlob {
            device: "CCD Simulator".to_string(),
            name: None,
            mode: BlobMode::Also,
        }));
        round_trip(Message::Notice(Notice {
            device: None,
            timestamp: None,
            message: "server shutting down".to_string(),
        }));
    }

    #[test]
    fn test_updates_round_trip() {
        round_trip(Message::SetVector(SetVector {
            device: "Telescope".to_string(),
            name: "EQUATORIAL_EOD_COORD".to_string(),
            state: Some(IndiPropertyState::Ok),
            timeout: Some(0.5),
            timestamp: None,
            message: None,
            elements: OneElements::Number(vec![
                OneNumber {
                    name: "RA".to_string(),
                    value: 5.591_234_567_89,
                },
                OneNumber {
                    name: "DEC".to_string(),
                    value: -1e-9,
                },
            ]),
        }));
        round_trip(Message::SetVector(SetVector {
            device: "Weather".to_string(),
            name: "STATUS".to_string(),
            state: None,
            timeout: None,
            timestamp: None,
            message: None,
            elements: OneElements::Light(vec![OneLight {
                name: "RAIN".to_string(),
                value: IndiPropertyState::Ok,
            }]),
        }));
        round_trip(Message::SetVector(SetVector {
            device: "CCD".to_string(),
            name: "CCD1".to_string(),
            state: Some(IndiPropertyState::Ok),
            timeout: None,
            timestamp: None,
            message: None,
            elements: OneElements::Blob(vec![OneBlob {
                name: "CCD1".to_string(),
                size: 4,
                format: ".fits".to_string(),
                data: vec![0, 159, 255, 10],
            }]),
        }));
        let mut switch = NewVector::switch("Telescope", "TELESCOPE_PARK", "PARK", true);
        switch.rule = Some(SwitchRule::OneOfMany);
        round_trip(Message::NewVector(switch));
        round_trip(Message::NewVector(NewVector::texts(
            "Wheel",
            "FILTER_NAME",
            &[("FILTER_SLOT_NAME_1", "Luminance"), ("FILTER_SLOT_NAME_2", "")],
        )));
    }

    #[test]
    fn test_text_values_are_trimmed() {
        let padded = Message::SetVector(SetVector {
            device: "Wheel".to_string(),
            name: "FILTER_NAME".to_string(),
            state: Some(IndiPropertyState::Ok),
            timeout: None,
            timestamp: None,
            message: Some("  kept as sent ".to_string()),
            elements: OneElements::Text(vec![
                OneText {
                    name: "FILTER_SLOT_NAME_1".to_string(),
                    value: "\n      Red\n    ".to_string(),
                },
                OneText {
                    name: "FILTER_SLOT_NAME_2".to_string(),
                    value: "  H Alpha  ".to_string(),
                },
            ]),
        });
        let Message::SetVector(decoded) = decode_message(&encode(&padded)).unwrap() else {
            panic!("expected an update");
        };
        assert_eq!(decoded.message.as_deref(), Some("  kept as sent "));
        assert_eq!(
            decoded.elements,
            OneElements::Text(vec![
                OneText {
                    name: "FILTER_SLOT_NAME_1".to_string(),
                    value: "Red".to_string(),
                },
                OneText {
                    name: "FILTER_SLOT_NAME_2".to_string(),
                    value: "H Alpha".to_string(),
                },
            ])
        );
    }

    #[test]
    fn test_empty_scope_reads_as_absent() {
        let empty = Message::GetProperties(GetProperties {
            version: Some("1.7".to_string()),
            device: Some(String::new()),
            name: Some(String::new()),
        });
        let xml = encode(&empty);
        assert_eq!(xml, "<getProperties version=\"1.7\"/>\n");
        assert_eq!(
            decode_message(&xml).unwrap(),
            Message::GetProperties(GetProperties {
                version: Some("1.7".to_string()),
                device: None,
                name: None,
            })
        );
        assert_eq!(
            decode_message(r#"<delProperty device="CCD Simulator" name=""/>"#).unwrap(),
            Message::DelProperty(DelProperty {
                device: "CCD Simulator".to_string(),
                name: None,
                timestamp: None,
                message: None,
            })
        );
    }

    #[test]
    fn test_new_number_vector_wire_form() {
        let xml = encode(&Message::NewVector(NewVector::number(
            "Focuser Simulator",
            "ABS_FOCUS_POSITION",
            "FOCUS_ABSOLUTE_POSITION",
            12345.0,
        )));
        assert_eq!(
            xml,
            "<newNumberVector device=\"Focuser Simulator\" name=\"ABS_FOCUS_POSITION\">\
             <oneNumber name=\"FOCUS_ABSOLUTE_POSITION\">12345</oneNumber></newNumberVector>\n"
        );
    }

    #[test]
    fn test_concatenated_stream_decodes_in_order() {
        let messages = vec![
            Message::GetProperties(GetProperties {
                version: Some("1.7".to_string()),
                ..GetProperties::default()
            }),
            Message::NewVector(NewVector::switch("Mount", "CONNECTION", "CONNECT", true)),
            Message::Notice(Notice {
                device: Some("Mount".to_string()),
                timestamp: None,
                message: "connected".to_string(),
            }),
        ];
        let wire: String = messages.iter().map(encode).collect();

        let mut decoder = Decoder::new(4096);
        for chunk in wire.as_bytes().chunks(7) {
            decoder.push(chunk);
        }
        let decoded: Vec<Message> = std::iter::from_fn(|| decoder.decode_next())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(decoded, messages);
    }
}
