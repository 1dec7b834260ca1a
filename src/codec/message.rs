use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{ObjectDeclaration, ObjectState};

/// Conventions the host declares at handshake so the server can convert units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMeta {
    pub world_name: String,
    pub simulation_name: String,
    pub time_unit: String,
    pub length_unit: String,
    pub angle_unit: String,
    pub handedness: String,
    pub force_unit: String,
}

impl Default for SessionMeta {
    fn default() -> Self {
        Self {
            world_name: "world".to_string(),
            simulation_name: "host".to_string(),
            time_unit: "s".to_string(),
            length_unit: "m".to_string(),
            angle_unit: "rad".to_string(),
            handedness: "rhs".to_string(),
            force_unit: "N".to_string(),
        }
    }
}

/// Client declaration of what it publishes and subscribes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub client_id: Uuid,
    pub meta: SessionMeta,
    pub send: Vec<ObjectDeclaration>,
    pub receive: Vec<ObjectDeclaration>,
}

/// Server's view of the declaration. Entries the server refused are missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub send: Vec<ObjectDeclaration>,
    pub receive: Vec<ObjectDeclaration>,
    pub sim_time: f64,
    /// Values the server already holds for objects this client publishes
    #[serde(default)]
    pub resume: Vec<ObjectState>,
}

/// Named call into a simulation, answered on a later exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCall {
    pub simulation: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl ApiCall {
    pub fn new<I, S>(simulation: impl Into<String>, name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            simulation: simulation.into(),
            name: name.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }
}

/// Per-tick request: locally authored attributes since the last exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub sim_time: f64,
    pub objects: Vec<ObjectState>,
    #[serde(default)]
    pub api_calls: Vec<ApiCall>,
}

/// Per-tick response: authoritative values for subscribed objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub sim_time: f64,
    pub objects: Vec<ObjectState>,
    #[serde(default)]
    pub api_results: Vec<ApiCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Exchange(Exchange),
    Update(Update),
    /// Server no longer knows this session; client must handshake again
    Reset { reason: String },
    Close,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake_ack",
            Message::Exchange(_) => "exchange",
            Message::Update(_) => "update",
            Message::Reset { .. } => "reset",
            Message::Close => "close",
        }
    }

    /// Object states carried by this message, if any
    pub fn objects(&self) -> &[ObjectState] {
        match self {
            Message::HandshakeAck(ack) => &ack.resume,
            Message::Exchange(exchange) => &exchange.objects,
            Message::Update(update) => &update.objects,
            _ => &[],
        }
    }

    pub fn sim_time(&self) -> Option<f64> {
        match self {
            Message::HandshakeAck(ack) => Some(ack.sim_time),
            Message::Exchange(exchange) => Some(exchange.sim_time),
            Message::Update(update) => Some(update.sim_time),
            _ => None,
        }
    }
}
