//! Property vector model
//!
//! A device's state is a set of named property vectors. Definitions replace a
//! vector wholesale; updates touch only the elements they name. Server state
//! is trusted as reported, including switch states that break the vector's
//! rule.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{IndiError, IndiResult};
use crate::message::*;

/// Bounds and display format of a number element
#[derive(Debug, Clone, PartialEq)]
pub struct NumberValue {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub format: String,
}

impl NumberValue {
    /// Whether `value` is inside `[min, max]`; unbounded when `min >= max`
    pub fn in_range(&self, value: f64) -> bool {
        self.min >= self.max || (value >= self.min && value <= self.max)
    }
}

/// Last BLOB payload received for an element
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlobValue {
    pub format: String,
    pub size: usize,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Switch(bool),
    Number(NumberValue),
    Text(String),
    Light(IndiPropertyState),
    Blob(BlobValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub label: Option<String>,
    pub value: ElementValue,
}

/// Result of applying a definition or update
#[derive(Debug, Clone)]
pub struct Applied {
    /// Any element value or the vector state differs from before
    pub changed: bool,
    /// The vector as it was, `None` for a first definition
    pub previous: Option<PropertyVector>,
}

/// A definition or an update, as fed to [`PropertyTable::apply`]
#[derive(Debug, Clone, Copy)]
pub enum Update<'a> {
    Define(&'a DefVector),
    Set(&'a SetVector),
}

impl Update<'_> {
    pub fn name(&self) -> &str {
        match self {
            Update::Define(def) => &def.name,
            Update::Set(set) => &set.name,
        }
    }
}

/// INDI property vector
#[derive(Debug, Clone)]
pub struct PropertyVector {
    pub device: String,
    pub name: String,
    pub label: Option<String>,
    pub group: Option<String>,
    pub kind: VectorKind,
    pub state: IndiPropertyState,
    pub perm: IndiPermission,
    /// Switch vectors only
    pub rule: Option<SwitchRule>,
    pub timeout: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    elements: Vec<Element>,
    index: HashMap<String, usize>,
    rule_warned: bool,
}

impl PartialEq for PropertyVector {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
            && self.name == other.name
            && self.label == other.label
            && self.group == other.group
            && self.kind == other.kind
            && self.state == other.state
            && self.perm == other.perm
            && self.rule == other.rule
            && self.timeout == other.timeout
            && self.elements == other.elements
    }
}

impl PropertyVector {
    pub fn from_def(def: &DefVector) -> Self {
        let (rule, elements) = match &def.elements {
            DefElements::Switch { rule, elements } => (
                Some(*rule),
                elements
                    .iter()
                    .map(|e| Element {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        value: ElementValue::Switch(e.value),
                    })
                    .collect(),
            ),
            DefElements::Number(v) => (
                None,
                v.iter()
                    .map(|e| Element {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        value: ElementValue::Number(NumberValue {
                            value: e.value,
                            min: e.min,
                            max: e.max,
                            step: e.step,
                            format: e.format.clone(),
                        }),
                    })
                    .collect(),
            ),
            DefElements::Text(v) => (
                None,
                v.iter()
                    .map(|e| Element {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        value: ElementValue::Text(e.value.clone()),
                    })
                    .collect(),
            ),
            DefElements::Light(v) => (
                None,
                v.iter()
                    .map(|e| Element {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        value: ElementValue::Light(e.value),
                    })
                    .collect(),
            ),
            DefElements::Blob(v) => (
                None,
                v.iter()
                    .map(|e| Element {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        value: ElementValue::Blob(BlobValue::default()),
                    })
                    .collect(),
            ),
        };

        let mut vector = Self {
            device: def.device.clone(),
            name: def.name.clone(),
            label: def.label.clone(),
            group: def.group.clone(),
            kind: def.elements.kind(),
            state: def.state,
            perm: def.perm,
            rule,
            timeout: def.timeout,
            timestamp: def.timestamp.clone(),
            message: def.message.clone(),
            elements,
            index: HashMap::new(),
            rule_warned: false,
        };
        vector.rebuild_index();
        vector.check_rule();
        vector
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
    }

    /// Apply a `set*Vector`: only the named elements change, unknown element
    /// names are logged and skipped
    pub fn apply_set(&mut self, set: &SetVector) -> Applied {
        let previous = self.clone();

        if set.elements.kind() != self.kind {
            tracing::warn!(
                "Ignoring set{}Vector for {}.{} defined as {:?}",
                set.elements.kind().tag(),
                self.device,
                self.name,
                self.kind
            );
            return Applied {
                changed: false,
                previous: Some(previous),
            };
        }

        if let Some(state) = set.state {
            self.state = state;
        }
        if set.timeout.is_some() {
            self.timeout = set.timeout;
        }
        if set.timestamp.is_some() {
            self.timestamp = set.timestamp.clone();
        }
        if set.message.is_some() {
            self.message = set.message.clone();
        }

        // every BLOB delivery is new data, even when the bytes repeat
        let mut blob_delivered = false;
        match &set.elements {
            OneElements::Switch(v) => {
                for e in v {
                    if let Some(ElementValue::Switch(on)) = self.value_mut(&e.name) {
                        *on = e.value;
                    }
                }
                self.check_rule();
            }
            OneElements::Number(v) => {
                for e in v {
                    if let Some(ElementValue::Number(n)) = self.value_mut(&e.name) {
                        n.value = e.value;
                    }
                }
            }
            OneElements::Text(v) => {
                for e in v {
                    if let Some(ElementValue::Text(t)) = self.value_mut(&e.name) {
                        t.clone_from(&e.value);
                    }
                }
            }
            OneElements::Light(v) => {
                for e in v {
                    if let Some(ElementValue::Light(l)) = self.value_mut(&e.name) {
                        *l = e.value;
                    }
                }
            }
            OneElements::Blob(v) => {
                for e in v {
                    if let Some(ElementValue::Blob(b)) = self.value_mut(&e.name) {
                        blob_delivered = true;
                        *b = BlobValue {
                            format: e.format.clone(),
                            size: e.size,
                            data: Arc::from(e.data.as_slice()),
                        };
                    }
                }
            }
        }

        let changed = blob_delivered
            || self.state != previous.state
            || self.elements != previous.elements;
        Applied {
            changed,
            previous: Some(previous),
        }
    }

    fn value_mut(&mut self, name: &str) -> Option<&mut ElementValue> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.elements[i].value),
            None => {
                tracing::warn!(
                    "Ignoring unknown element {}.{}.{}",
                    self.device,
                    self.name,
                    name
                );
                None
            }
        }
    }

    /// Warn once per vector when the active switches break the declared rule
    fn check_rule(&mut self) {
        let Some(rule) = self.rule else {
            return;
        };
        let on = self.on_switches().len();
        if !rule.allows(on) && !self.rule_warned {
            self.rule_warned = true;
            tracing::warn!(
                "{}.{} reports {} active switches under rule {}; keeping server state",
                self.device,
                self.name,
                on,
                rule.as_wire()
            );
        }
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.index.get(name).map(|&i| &self.elements[i])
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match &self.element(name)?.value {
            ElementValue::Number(n) => Some(n.value),
            _ => None,
        }
    }

    pub fn number_value(&self, name: &str) -> Option<&NumberValue> {
        match &self.element(name)?.value {
            ElementValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn switch(&self, name: &str) -> Option<bool> {
        match self.element(name)?.value {
            ElementValue::Switch(on) => Some(on),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match &self.element(name)?.value {
            ElementValue::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn light(&self, name: &str) -> Option<IndiPropertyState> {
        match self.element(name)?.value {
            ElementValue::Light(l) => Some(l),
            _ => None,
        }
    }

    pub fn blob(&self, name: &str) -> Option<&BlobValue> {
        match &self.element(name)?.value {
            ElementValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Names of all switches that are On, in definition order
    pub fn on_switches(&self) -> Vec<&str> {
        self.elements
            .iter()
            .filter(|e| matches!(e.value, ElementValue::Switch(true)))
            .map(|e| e.name.as_str())
            .collect()
    }

    /// First switch that is On, the selection of a OneOfMany vector
    pub fn first_on_switch(&self) -> Option<&str> {
        self.elements
            .iter()
            .find(|e| matches!(e.value, ElementValue::Switch(true)))
            .map(|e| e.name.as_str())
    }

    pub fn is_busy(&self) -> bool {
        self.state == IndiPropertyState::Busy
    }

    /// Reject writes to read-only vectors
    pub fn check_writable(&self) -> IndiResult<()> {
        if self.perm.is_writable() {
            Ok(())
        } else {
            Err(IndiError::PermissionDenied {
                device: self.device.clone(),
                property: self.name.clone(),
            })
        }
    }

    /// Check an outgoing element list against this definition
    pub fn check_command(&self, elements: &OneElements) -> IndiResult<()> {
        self.check_writable()?;
        if elements.kind() != self.kind {
            return Err(IndiError::PropertyNotFound {
                device: self.device.clone(),
                property: format!("{} ({:?})", self.name, elements.kind()),
            });
        }
        for name in elements.names() {
            if self.element(name).is_none() {
                return Err(IndiError::ElementNotFound {
                    device: self.device.clone(),
                    property: self.name.clone(),
                    element: name.to_string(),
                });
            }
        }
        if let OneElements::Number(numbers) = elements {
            for n in numbers {
                if let Some(limits) = self.number_value(&n.name) {
                    if !limits.in_range(n.value) {
                        return Err(IndiError::ValueOutOfRange {
                            device: self.device.clone(),
                            property: self.name.clone(),
                            element: n.name.clone(),
                            value: n.value,
                            min: limits.min,
                            max: limits.max,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// All property vectors of one device
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    vectors: HashMap<String, PropertyVector>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a definition or update. `None` when an update names a vector
    /// that was never defined; that is logged and otherwise ignored.
    pub fn apply(&mut self, update: Update<'_>) -> Option<Applied> {
        match update {
            Update::Define(def) => {
                let vector = PropertyVector::from_def(def);
                let previous = self.vectors.insert(def.name.clone(), vector);
                let changed = match (&previous, self.vectors.get(&def.name)) {
                    (Some(old), Some(new)) => old != new,
                    _ => true,
                };
                Some(Applied { changed, previous })
            }
            Update::Set(set) => match self.vectors.get_mut(&set.name) {
                Some(vector) => Some(vector.apply_set(set)),
                None => {
                    tracing::warn!(
                        "Ignoring update for undefined property {}.{}",
                        set.device,
                        set.name
                    );
                    None
                }
            },
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyVector> {
        self.vectors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vectors.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyVector> {
        self.vectors.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.vectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyVector> {
        self.vectors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn park_def() -> DefVector {
        DefVector {
            device: "Telescope".to_string(),
            name: "TELESCOPE_PARK".to_string(),
            label: Some("Parking".to_string()),
            group: None,
            state: IndiPropertyState::Idle,
            perm: IndiPermission::ReadWrite,
            timeout: None,
            timestamp: None,
            message: None,
            elements: DefElements::Switch {
                rule: SwitchRule::OneOfMany,
                elements: vec![
                    DefSwitch {
                        name: "PARK".to_string(),
                        label: None,
                        value: false,
                    },
                    DefSwitch {
                        name: "UNPARK".to_string(),
                        label: None,
                        value: true,
                    },
                ],
            },
        }
    }

    fn focus_def(perm: IndiPermission) -> DefVector {
        DefVector {
            device: "Focuser".to_string(),
            name: "ABS_FOCUS_POSITION".to_string(),
            label: None,
            group: None,
            state: IndiPropertyState::Idle,
            perm,
            timeout: None,
            timestamp: None,
            message: None,
            elements: DefElements::Number(vec![DefNumber {
                name: "FOCUS_ABSOLUTE_POSITION".to_string(),
                label: None,
                format: "%6.0f".to_string(),
                min: 0.0,
                max: 50000.0,
                step: 10.0,
                value: 100.0,
            }]),
        }
    }

    fn switch_set(state: Option<IndiPropertyState>, values: &[(&str, bool)]) -> SetVector {
        SetVector {
            device: "Telescope".to_string(),
            name: "TELESCOPE_PARK".to_string(),
            state,
            timeout: None,
            timestamp: None,
            message: None,
            elements: OneElements::Switch(
                values
                    .iter()
                    .map(|(n, v)| OneSwitch {
                        name: n.to_string(),
                        value: *v,
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_define_then_update_only_named_elements() {
        let mut table = PropertyTable::new();
        let applied = table.apply(Update::Define(&park_def())).unwrap();
        assert!(applied.changed);
        assert!(applied.previous.is_none());

        let set = switch_set(Some(IndiPropertyState::Busy), &[("PARK", true)]);
        let applied = table.apply(Update::Set(&set)).unwrap();
        assert!(applied.changed);
        let previous = applied.previous.unwrap();
        assert_eq!(previous.state, IndiPropertyState::Idle);
        assert_eq!(previous.first_on_switch(), Some("UNPARK"));

        let vector = table.get("TELESCOPE_PARK").unwrap();
        assert_eq!(vector.state, IndiPropertyState::Busy);
        assert_eq!(vector.switch("PARK"), Some(true));
        // not named in the update, retains its value
        assert_eq!(vector.switch("UNPARK"), Some(true));
    }

    #[test]
    fn test_identical_update_reports_unchanged() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&park_def()));
        let set = switch_set(Some(IndiPropertyState::Ok), &[("PARK", true), ("UNPARK", false)]);
        assert!(table.apply(Update::Set(&set)).unwrap().changed);
        assert!(!table.apply(Update::Set(&set)).unwrap().changed);
    }

    #[test]
    fn test_repeated_blob_counts_as_new_data() {
        let decode = |xml: &str| crate::codec::decode_message(xml).unwrap();
        let Message::DefVector(def) = decode(
            r#"<defBLOBVector device="CCD Simulator" name="CCD1" state="Idle" perm="ro"><defBLOB name="CCD1"/></defBLOBVector>"#,
        ) else {
            panic!("expected a definition");
        };
        let Message::SetVector(set) = decode(
            r#"<setBLOBVector device="CCD Simulator" name="CCD1" state="Ok">
                <oneBLOB name="CCD1" size="5" format=".fits">SGVsbG8=</oneBLOB></setBLOBVector>"#,
        ) else {
            panic!("expected an update");
        };

        let mut table = PropertyTable::new();
        table.apply(Update::Define(&def));
        assert!(table.apply(Update::Set(&set)).unwrap().changed);
        assert!(table.apply(Update::Set(&set)).unwrap().changed);
        assert_eq!(&table.get("CCD1").unwrap().blob("CCD1").unwrap().data[..], b"Hello");
    }

    #[test]
    fn test_one_of_many_reads_as_reported() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&park_def()));
        let sequence = [
            switch_set(None, &[("PARK", true), ("UNPARK", false)]),
            switch_set(None, &[("UNPARK", true), ("PARK", false)]),
            switch_set(None, &[("PARK", true), ("UNPARK", false)]),
        ];
        for set in &sequence {
            table.apply(Update::Set(set));
            let vector = table.get("TELESCOPE_PARK").unwrap();
            assert_eq!(vector.on_switches().len(), 1);
        }
        assert_eq!(table.get("TELESCOPE_PARK").unwrap().first_on_switch(), Some("PARK"));
    }

    #[test]
    fn test_rule_violation_is_kept() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&park_def()));
        table.apply(Update::Set(&switch_set(None, &[("PARK", true)])));
        table.apply(Update::Set(&switch_set(None, &[("PARK", true)])));

        let vector = table.get("TELESCOPE_PARK").unwrap();
        assert_eq!(vector.on_switches(), vec!["PARK", "UNPARK"]);
        assert_eq!(vector.first_on_switch(), Some("PARK"));
        assert!(vector.rule_warned);
    }

    #[test]
    fn test_unknown_element_and_vector_are_ignored() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&park_def()));
        let applied = table
            .apply(Update::Set(&switch_set(None, &[("PARK_HOME", true)])))
            .unwrap();
        assert!(!applied.changed);

        let mut unknown = switch_set(None, &[("X", true)]);
        unknown.name = "NOT_DEFINED".to_string();
        assert!(table.apply(Update::Set(&unknown)).is_none());
    }

    #[test]
    fn test_mismatched_kind_is_ignored() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&park_def()));
        let set = SetVector {
            device: "Telescope".to_string(),
            name: "TELESCOPE_PARK".to_string(),
            state: Some(IndiPropertyState::Alert),
            timeout: None,
            timestamp: None,
            message: None,
            elements: OneElements::Number(vec![]),
        };
        let applied = table.apply(Update::Set(&set)).unwrap();
        assert!(!applied.changed);
        assert_eq!(table.get("TELESCOPE_PARK").unwrap().state, IndiPropertyState::Idle);
    }

    #[test]
    fn test_redefinition_replaces_vector() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&park_def()));
        let applied = table.apply(Update::Define(&park_def())).unwrap();
        assert!(!applied.changed);
        assert!(applied.previous.is_some());

        let mut def = park_def();
        if let DefElements::Switch { elements, .. } = &mut def.elements {
            elements.pop();
        }
        assert!(table.apply(Update::Define(&def)).unwrap().changed);
        let vector = table.get("TELESCOPE_PARK").unwrap();
        assert_eq!(vector.elements().len(), 1);
        assert!(vector.element("UNPARK").is_none());
    }

    #[test]
    fn test_command_checks() {
        let mut table = PropertyTable::new();
        table.apply(Update::Define(&focus_def(IndiPermission::ReadWrite)));
        let vector = table.get("ABS_FOCUS_POSITION").unwrap();

        let ok = OneElements::Number(vec![OneNumber {
            name: "FOCUS_ABSOLUTE_POSITION".to_string(),
            value: 12345.0,
        }]);
        assert!(vector.check_command(&ok).is_ok());

        let too_far = OneElements::Number(vec![OneNumber {
            name: "FOCUS_ABSOLUTE_POSITION".to_string(),
            value: 60000.0,
        }]);
        assert!(matches!(
            vector.check_command(&too_far),
            Err(IndiError::ValueOutOfRange { max, .. }) if max == 50000.0
        ));

        let unknown = OneElements::Number(vec![OneNumber {
            name: "FOCUS_TICKS".to_string(),
            value: 1.0,
        }]);
        assert!(matches!(
            vector.check_command(&unknown),
            Err(IndiError::ElementNotFound { .. })
        ));

        table.apply(Update::Define(&focus_def(IndiPermission::ReadOnly)));
        let vector = table.get("ABS_FOCUS_POSITION").unwrap();
        assert!(matches!(
            vector.check_command(&ok),
            Err(IndiError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_unbounded_number() {
        let n = NumberValue {
            value: 0.0,
            min: 0.0,
            max: 0.0,
            step: 0.0,
            format: "%g".to_string(),
        };
        assert!(n.in_range(-1e9));
    }
}
