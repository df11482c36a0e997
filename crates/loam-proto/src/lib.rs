//! Shared wire definitions for manager ↔ controller communication.
//! Keeping this in a dedicated crate allows firmware bindings to be
//! regenerated without pulling in the manager runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub type JsonObject = Map<String, Value>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Peripheral vocabulary understood by controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralType {
    InvalidPeripheral,
    BME280,
    CapacitiveSensor,
    I2CAdapter,
    LED,
    NeoPixel,
}

impl PeripheralType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "InvalidPeripheral" => Some(Self::InvalidPeripheral),
            "BME280" => Some(Self::BME280),
            "CapacitiveSensor" => Some(Self::CapacitiveSensor),
            "I2CAdapter" => Some(Self::I2CAdapter),
            "LED" => Some(Self::LED),
            "NeoPixel" => Some(Self::NeoPixel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPeripheral => "InvalidPeripheral",
            Self::BME280 => "BME280",
            Self::CapacitiveSensor => "CapacitiveSensor",
            Self::I2CAdapter => "I2CAdapter",
            Self::LED => "LED",
            Self::NeoPixel => "NeoPixel",
        }
    }
}

impl std::fmt::Display for PeripheralType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Add/remove sub-commands for one entity family. Empty lists are omitted on
/// the wire so consumers can treat key-presence as "there is work of this
/// kind".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandBatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<JsonObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<JsonObject>,
}

impl CommandBatch {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default, skip_serializing_if = "CommandBatch::is_empty")]
    pub peripheral: CommandBatch,
    #[serde(default, skip_serializing_if = "CommandBatch::is_empty")]
    pub task: CommandBatch,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

/// A controller's report of a lifecycle transition it carried out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub uuid: Uuid,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peripheral: Vec<StateReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task: Vec<StateReport>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

/// The JSON envelope exchanged with controllers, discriminated by its `type`
/// field. Decoding is total: anything without a recognized discriminator (or
/// with a body that does not match the discriminator's shape) lands in
/// `Unknown`, and every extraction against the wrong variant returns an empty
/// payload rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Command(CommandPayload),
    Error(JsonObject),
    Register(JsonObject),
    Result(ResultPayload),
    Telemetry(JsonObject),
    Unknown(Value),
}

impl Envelope {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(Self::from_value(serde_json::from_str(raw)?))
    }

    pub fn from_value(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match kind.as_deref() {
            Some("cmd") => match serde_json::from_value::<CommandPayload>(value.clone()) {
                Ok(payload) => Envelope::Command(payload),
                Err(_) => Envelope::Unknown(value),
            },
            Some("result") => match serde_json::from_value::<ResultPayload>(value.clone()) {
                Ok(payload) => Envelope::Result(payload),
                Err(_) => Envelope::Unknown(value),
            },
            Some("err") => match value {
                Value::Object(obj) => Envelope::Error(obj),
                other => Envelope::Unknown(other),
            },
            Some("reg") => match value {
                Value::Object(obj) => Envelope::Register(obj),
                other => Envelope::Unknown(other),
            },
            Some("tel") => match value {
                Value::Object(obj) => Envelope::Telemetry(obj),
                other => Envelope::Unknown(other),
            },
            _ => Envelope::Unknown(value),
        }
    }

    pub fn command(peripheral: CommandBatch, task: CommandBatch, request_id: &str) -> Self {
        Envelope::Command(CommandPayload {
            peripheral,
            task,
            request_id: request_id.to_owned(),
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Envelope::Command(payload) => tagged("cmd", payload),
            Envelope::Error(obj) => retagged("err", obj),
            Envelope::Register(obj) => retagged("reg", obj),
            Envelope::Result(payload) => tagged("result", payload),
            Envelope::Telemetry(obj) => retagged("tel", obj),
            Envelope::Unknown(value) => value.clone(),
        }
    }

    pub fn wire_type(&self) -> &str {
        match self {
            Envelope::Command(_) => "cmd",
            Envelope::Error(_) => "err",
            Envelope::Register(_) => "reg",
            Envelope::Result(_) => "result",
            Envelope::Telemetry(_) => "tel",
            Envelope::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }

    pub fn peripheral_commands(&self) -> CommandBatch {
        match self {
            Envelope::Command(payload) => payload.peripheral.clone(),
            _ => CommandBatch::default(),
        }
    }

    pub fn task_commands(&self) -> CommandBatch {
        match self {
            Envelope::Command(payload) => payload.task.clone(),
            _ => CommandBatch::default(),
        }
    }

    pub fn peripheral_results(&self) -> Vec<StateReport> {
        match self {
            Envelope::Result(payload) => payload.peripheral.clone(),
            _ => Vec::new(),
        }
    }

    pub fn task_results(&self) -> Vec<StateReport> {
        match self {
            Envelope::Result(payload) => payload.task.clone(),
            _ => Vec::new(),
        }
    }

    pub fn register(&self) -> JsonObject {
        match self {
            Envelope::Register(obj) => obj.clone(),
            _ => JsonObject::new(),
        }
    }

    pub fn telemetry(&self) -> JsonObject {
        match self {
            Envelope::Telemetry(obj) => obj.clone(),
            _ => JsonObject::new(),
        }
    }

    pub fn errors(&self) -> JsonObject {
        match self {
            Envelope::Error(obj) => obj.clone(),
            _ => JsonObject::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Envelope::Command(payload) => &payload.request_id,
            Envelope::Result(payload) => &payload.request_id,
            _ => "",
        }
    }
}

fn tagged<T: Serialize>(kind: &str, payload: &T) -> Value {
    let mut obj = match serde_json::to_value(payload) {
        Ok(Value::Object(obj)) => obj,
        _ => JsonObject::new(),
    };
    obj.insert("type".to_owned(), Value::String(kind.to_owned()));
    Value::Object(obj)
}

fn retagged(kind: &str, obj: &JsonObject) -> Value {
    let mut obj = obj.clone();
    obj.insert("type".to_owned(), Value::String(kind.to_owned()));
    Value::Object(obj)
}

/// Message pushed over the delivery channel to a connected controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelCommand {
    #[serde(rename = "send.peripheral.commands")]
    PeripheralCommands {
        commands: CommandBatch,
        request_id: String,
    },
    #[serde(rename = "send.controller.task.commands")]
    ControllerTaskCommands {
        commands: CommandBatch,
        request_id: String,
    },
}
