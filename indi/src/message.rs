//! INDI message model
//!
//! One variant per top-level wire element. Element lists are typed by the
//! vector kind so a number vector can never carry a switch element.

use std::fmt;

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndiPropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl IndiPropertyState {
    pub fn as_wire(self) -> &'static str {
        match self {
            IndiPropertyState::Idle => "Idle",
            IndiPropertyState::Ok => "Ok",
            IndiPropertyState::Busy => "Busy",
            IndiPropertyState::Alert => "Alert",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Idle" => Some(IndiPropertyState::Idle),
            "Ok" => Some(IndiPropertyState::Ok),
            "Busy" => Some(IndiPropertyState::Busy),
            "Alert" => Some(IndiPropertyState::Alert),
            _ => None,
        }
    }
}

impl fmt::Display for IndiPropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndiPermission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IndiPermission {
    pub fn as_wire(self) -> &'static str {
        match self {
            IndiPermission::ReadOnly => "ro",
            IndiPermission::WriteOnly => "wo",
            IndiPermission::ReadWrite => "rw",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Some(IndiPermission::ReadOnly),
            "wo" => Some(IndiPermission::WriteOnly),
            "rw" => Some(IndiPermission::ReadWrite),
            _ => None,
        }
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, IndiPermission::ReadOnly)
    }
}

/// Switch vector rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchRule {
    /// Exactly one element is On
    OneOfMany,
    /// Zero or one element is On
    AtMostOne,
    /// Any subset is On
    AnyOfMany,
}

impl SwitchRule {
    pub fn as_wire(self) -> &'static str {
        match self {
            SwitchRule::OneOfMany => "OneOfMany",
            SwitchRule::AtMostOne => "AtMostOne",
            SwitchRule::AnyOfMany => "AnyOfMany",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "OneOfMany" => Some(SwitchRule::OneOfMany),
            "AtMostOne" => Some(SwitchRule::AtMostOne),
            "AnyOfMany" => Some(SwitchRule::AnyOfMany),
            _ => None,
        }
    }

    /// Whether `on` active switches satisfy this rule
    pub fn allows(self, on: usize) -> bool {
        match self {
            SwitchRule::OneOfMany => on == 1,
            SwitchRule::AtMostOne => on <= 1,
            SwitchRule::AnyOfMany => true,
        }
    }
}

/// BLOB delivery policy requested with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobMode {
    Never,
    Also,
    Only,
}

impl BlobMode {
    pub fn as_wire(self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Never" => Some(BlobMode::Never),
            "Also" => Some(BlobMode::Also),
            "Only" => Some(BlobMode::Only),
            _ => None,
        }
    }
}

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Switch,
    Number,
    Text,
    Light,
    Blob,
}

impl VectorKind {
    /// Suffix used in tag names, e.g. `Number` in `defNumberVector`
    pub fn tag(self) -> &'static str {
        match self {
            VectorKind::Switch => "Switch",
            VectorKind::Number => "Number",
            VectorKind::Text => "Text",
            VectorKind::Light => "Light",
            VectorKind::Blob => "BLOB",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s {
            "Switch" => Some(VectorKind::Switch),
            "Number" => Some(VectorKind::Number),
            "Text" => Some(VectorKind::Text),
            "Light" => Some(VectorKind::Light),
            "BLOB" => Some(VectorKind::Blob),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefSwitch {
    pub name: String,
    pub label: Option<String>,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefNumber {
    pub name: String,
    pub label: Option<String>,
    /// printf-style format, `%m` variants denote sexagesimal
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefText {
    pub name: String,
    pub label: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefLight {
    pub name: String,
    pub label: Option<String>,
    pub value: IndiPropertyState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefBlob {
    pub name: String,
    pub label: Option<String>,
}

/// Element definitions of a `def*Vector`
#[derive(Debug, Clone, PartialEq)]
pub enum DefElements {
    Switch {
        rule: SwitchRule,
        elements: Vec<DefSwitch>,
    },
    Number(Vec<DefNumber>),
    Text(Vec<DefText>),
    Light(Vec<DefLight>),
    Blob(Vec<DefBlob>),
}

impl DefElements {
    pub fn kind(&self) -> VectorKind {
        match self {
            DefElements::Switch { .. } => VectorKind::Switch,
            DefElements::Number(_) => VectorKind::Number,
            DefElements::Text(_) => VectorKind::Text,
            DefElements::Light(_) => VectorKind::Light,
            DefElements::Blob(_) => VectorKind::Blob,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DefElements::Switch { elements, .. } => elements.len(),
            DefElements::Number(v) => v.len(),
            DefElements::Text(v) => v.len(),
            DefElements::Light(v) => v.len(),
            DefElements::Blob(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneSwitch {
    pub name: String,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneNumber {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneText {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneLight {
    pub name: String,
    pub value: IndiPropertyState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneBlob {
    pub name: String,
    /// Size advertised by the sender (uncompressed bytes)
    pub size: usize,
    /// File suffix such as `.fits`, with an optional `.z` compression marker
    pub format: String,
    pub data: Vec<u8>,
}

/// Element values of a `set*Vector` or `new*Vector`
#[derive(Debug, Clone, PartialEq)]
pub enum OneElements {
    Switch(Vec<OneSwitch>),
    Number(Vec<OneNumber>),
    Text(Vec<OneText>),
    Light(Vec<OneLight>),
    Blob(Vec<OneBlob>),
}

impl OneElements {
    pub fn kind(&self) -> VectorKind {
        match self {
            OneElements::Switch(_) => VectorKind::Switch,
            OneElements::Number(_) => VectorKind::Number,
            OneElements::Text(_) => VectorKind::Text,
            OneElements::Light(_) => VectorKind::Light,
            OneElements::Blob(_) => VectorKind::Blob,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OneElements::Switch(v) => v.len(),
            OneElements::Number(v) => v.len(),
            OneElements::Text(v) => v.len(),
            OneElements::Light(v) => v.len(),
            OneElements::Blob(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            OneElements::Switch(v) => v.iter().map(|e| e.name.as_str()).collect(),
            OneElements::Number(v) => v.iter().map(|e| e.name.as_str()).collect(),
            OneElements::Text(v) => v.iter().map(|e| e.name.as_str()).collect(),
            OneElements::Light(v) => v.iter().map(|e| e.name.as_str()).collect(),
            OneElements::Blob(v) => v.iter().map(|e| e.name.as_str()).collect(),
        }
    }
}

/// `getProperties`: discovery request, optionally narrowed to a device or property
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetProperties {
    pub version: Option<String>,
    pub device: Option<String>,
    pub name: Option<String>,
}

/// `def*Vector`: the server announces a property
#[derive(Debug, Clone, PartialEq)]
pub struct DefVector {
    pub device: String,
    pub name: String,
    pub label: Option<String>,
    pub group: Option<String>,
    pub state: IndiPropertyState,
    /// Light vectors carry no permission on the wire and decode as read-only
    pub perm: IndiPermission,
    pub timeout: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub elements: DefElements,
}

/// `set*Vector`: the server reports new values and/or state
#[derive(Debug, Clone, PartialEq)]
pub struct SetVector {
    pub device: String,
    pub name: String,
    pub state: Option<IndiPropertyState>,
    pub timeout: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub elements: OneElements,
}

/// `new*Vector`: the client asks for new values
#[derive(Debug, Clone, PartialEq)]
pub struct NewVector {
    pub device: String,
    pub name: String,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    /// Active rule, switch vectors only
    pub rule: Option<SwitchRule>,
    pub elements: OneElements,
}

impl NewVector {
    pub fn new(device: impl Into<String>, name: impl Into<String>, elements: OneElements) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            timestamp: None,
            message: None,
            rule: None,
            elements,
        }
    }

    pub fn switch(device: &str, name: &str, element: &str, value: bool) -> Self {
        Self::new(
            device,
            name,
            OneElements::Switch(vec![OneSwitch {
                name: element.to_string(),
                value,
            }]),
        )
    }

    pub fn numbers(device: &str, name: &str, values: &[(&str, f64)]) -> Self {
        Self::new(
            device,
            name,
            OneElements::Number(
                values
                    .iter()
                    .map(|(n, v)| OneNumber {
                        name: n.to_string(),
                        value: *v,
                    })
                    .collect(),
            ),
        )
    }

    pub fn number(device: &str, name: &str, element: &str, value: f64) -> Self {
        Self::numbers(device, name, &[(element, value)])
    }

    pub fn texts(device: &str, name: &str, values: &[(&str, &str)]) -> Self {
        Self::new(
            device,
            name,
            OneElements::Text(
                values
                    .iter()
                    .map(|(n, v)| OneText {
                        name: n.to_string(),
                        value: v.to_string(),
                    })
                    .collect(),
            ),
        )
    }
}

/// `delProperty`: retracts one property, or the whole device when `name` is `None`
#[derive(Debug, Clone, PartialEq)]
pub struct DelProperty {
    pub device: String,
    pub name: Option<String>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
}

/// `enableBLOB`: client opt-in for binary attachments
#[derive(Debug, Clone, PartialEq)]
pub struct EnableBlob {
    pub device: String,
    pub name: Option<String>,
    pub mode: BlobMode,
}

/// `message`: free text from the server, device-scoped when `device` is set
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub device: Option<String>,
    pub timestamp: Option<String>,
    pub message: String,
}

/// A decoded INDI message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    GetProperties(GetProperties),
    DefVector(DefVector),
    SetVector(SetVector),
    NewVector(NewVector),
    DelProperty(DelProperty),
    EnableBlob(EnableBlob),
    Notice(Notice),
}

impl Message {
    /// Device the message is addressed to; empty for broadcasts
    pub fn device(&self) -> &str {
        match self {
            Message::GetProperties(m) => m.device.as_deref().unwrap_or(""),
            Message::DefVector(m) => &m.device,
            Message::SetVector(m) => &m.device,
            Message::NewVector(m) => &m.device,
            Message::DelProperty(m) => &m.device,
            Message::EnableBlob(m) => &m.device,
            Message::Notice(m) => m.device.as_deref().unwrap_or(""),
        }
    }

    /// Property vector name, empty when the message is not property-scoped
    pub fn property_name(&self) -> &str {
        match self {
            Message::GetProperties(m) => m.name.as_deref().unwrap_or(""),
            Message::DefVector(m) => &m.name,
            Message::SetVector(m) => &m.name,
            Message::NewVector(m) => &m.name,
            Message::DelProperty(m) => m.name.as_deref().unwrap_or(""),
            Message::EnableBlob(m) => m.name.as_deref().unwrap_or(""),
            Message::Notice(_) => "",
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            Message::DefVector(m) => m.timestamp.as_deref(),
            Message::SetVector(m) => m.timestamp.as_deref(),
            Message::NewVector(m) => m.timestamp.as_deref(),
            Message::DelProperty(m) => m.timestamp.as_deref(),
            Message::Notice(m) => m.timestamp.as_deref(),
            Message::GetProperties(_) | Message::EnableBlob(_) => None,
        }
    }

    /// Free-text message attribute
    pub fn text(&self) -> Option<&str> {
        match self {
            Message::DefVector(m) => m.message.as_deref(),
            Message::SetVector(m) => m.message.as_deref(),
            Message::NewVector(m) => m.message.as_deref(),
            Message::DelProperty(m) => m.message.as_deref(),
            Message::Notice(m) => Some(&m.message),
            Message::GetProperties(_) | Message::EnableBlob(_) => None,
        }
    }

    /// Wire tag of the top-level element
    pub fn tag(&self) -> String {
        match self {
            Message::GetProperties(_) => "getProperties".to_string(),
            Message::DefVector(m) => format!("def{}Vector", m.elements.kind().tag()),
            Message::SetVector(m) => format!("set{}Vector", m.elements.kind().tag()),
            Message::NewVector(m) => format!("new{}Vector", m.elements.kind().tag()),
            Message::DelProperty(_) => "delProperty".to_string(),
            Message::EnableBlob(_) => "enableBLOB".to_string(),
            Message::Notice(_) => "message".to_string(),
        }
    }
}
