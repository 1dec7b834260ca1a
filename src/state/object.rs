use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of scene object taking part in synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    RigidBody,
    ArticulatedJoint,
    Camera,
    #[default]
    AttributeBag,
}

/// Type tag of an attribute value, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Scalar,
    Vector3,
    Quaternion,
    List,
}

impl AttributeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Scalar => "scalar",
            AttributeKind::Vector3 => "vector3",
            AttributeKind::Quaternion => "quaternion",
            AttributeKind::List => "list",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed attribute value. Quaternions are stored `[w, x, y, z]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AttributeValue {
    Scalar(f64),
    Vector3([f64; 3]),
    Quaternion([f64; 4]),
    List(Vec<f64>),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Scalar(_) => AttributeKind::Scalar,
            AttributeValue::Vector3(_) => AttributeKind::Vector3,
            AttributeValue::Quaternion(_) => AttributeKind::Quaternion,
            AttributeValue::List(_) => AttributeKind::List,
        }
    }

    /// Flattened numeric view, in wire order
    pub fn as_slice(&self) -> &[f64] {
        match self {
            AttributeValue::Scalar(v) => std::slice::from_ref(v),
            AttributeValue::Vector3(v) => v,
            AttributeValue::Quaternion(v) => v,
            AttributeValue::List(v) => v,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            AttributeValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<[f64; 3]> {
        match self {
            AttributeValue::Vector3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_quaternion(&self) -> Option<[f64; 4]> {
        match self {
            AttributeValue::Quaternion(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Scalar(value)
    }
}

impl From<[f64; 3]> for AttributeValue {
    fn from(value: [f64; 3]) -> Self {
        AttributeValue::Vector3(value)
    }
}

impl From<[f64; 4]> for AttributeValue {
    fn from(value: [f64; 4]) -> Self {
        AttributeValue::Quaternion(value)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(value: Vec<f64>) -> Self {
        AttributeValue::List(value)
    }
}

/// Attribute snapshot of one synchronized object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireObject", into = "WireObject")]
pub struct ObjectState {
    pub id: String,
    pub kind: ObjectKind,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl ObjectState {
    pub fn new(id: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Wire shape of an object: attributes as an ordered list so duplicates are
/// detectable instead of being silently merged by a map deserializer.
#[derive(Serialize, Deserialize)]
struct WireObject {
    id: String,
    kind: ObjectKind,
    attributes: Vec<(String, AttributeValue)>,
}

impl From<ObjectState> for WireObject {
    fn from(state: ObjectState) -> Self {
        Self {
            id: state.id,
            kind: state.kind,
            attributes: state.attributes.into_iter().collect(),
        }
    }
}

impl TryFrom<WireObject> for ObjectState {
    type Error = String;

    fn try_from(wire: WireObject) -> Result<Self, Self::Error> {
        let mut attributes = BTreeMap::new();
        for (name, value) in wire.attributes {
            if attributes.insert(name.clone(), value).is_some() {
                return Err(format!(
                    "duplicate attribute '{}' on object '{}'",
                    name, wire.id
                ));
            }
        }
        Ok(Self {
            id: wire.id,
            kind: wire.kind,
            attributes,
        })
    }
}

/// Declaration of an object one side sends or receives, exchanged at handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDeclaration {
    pub id: String,
    #[serde(default)]
    pub kind: ObjectKind,
    pub attributes: Vec<String>,
}

impl ObjectDeclaration {
    pub fn new<I, S>(id: impl Into<String>, kind: ObjectKind, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind,
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declares(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a == attribute)
    }
}
