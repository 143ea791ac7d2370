//! MPV JSON IPC protocol types.
//!
//! Every message is one JSON object on its own line. Outbound commands carry a
//! `command` array and a `request_id`; inbound lines are either replies (they
//! carry a `request_id`) or events (they carry an `event` name).
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// First argument of the `script-message` emitted by keys bound via [`MpvCommand::keybind`].
pub const INPUT_MESSAGE: &str = "mpvbridge-input";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
  #[error("Encoding error: {0}")]
  Encoding(String),
  #[error("Decoding error: {0}")]
  Decoding(String),
}

/// Seek reference used by the `seek` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
  #[default]
  Absolute,
  Relative,
  AbsolutePercent,
  RelativePercent,
  /// Absolute seek that decodes up to the exact timestamp instead of the nearest keyframe.
  AbsoluteExact,
}

impl SeekMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      SeekMode::Absolute => "absolute",
      SeekMode::Relative => "relative",
      SeekMode::AbsolutePercent => "absolute-percent",
      SeekMode::RelativePercent => "relative-percent",
      SeekMode::AbsoluteExact => "absolute+exact",
    }
  }
}

/// Direction for single-frame stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
  Forward,
  Backward,
}

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  /// Assigned by the correlator when left empty.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub request_id: Option<i64>,
}

impl MpvCommand {
  pub fn new(args: Vec<Value>) -> Self {
    Self {
      command: args,
      request_id: None,
    }
  }

  /// Pin the request ID instead of letting the correlator pick one.
  pub fn with_request_id(mut self, request_id: i64) -> Self {
    self.request_id = Some(request_id);
    self
  }

  /// Operation name (first element of the command array).
  pub fn name(&self) -> &str {
    self.command.first().and_then(Value::as_str).unwrap_or("")
  }

  /// Load a file for playback, replacing the current one.
  pub fn loadfile(path: &str) -> Self {
    Self::new(vec!["loadfile".into(), path.into(), "replace".into()])
  }

  pub fn seek(position: f64, mode: SeekMode) -> Self {
    Self::new(vec!["seek".into(), position.into(), mode.as_str().into()])
  }

  pub fn frame_step(direction: StepDirection) -> Self {
    match direction {
      StepDirection::Forward => Self::new(vec!["frame-step".into()]),
      StepDirection::Backward => Self::new(vec!["frame-back-step".into()]),
    }
  }

  pub fn set_property(name: &str, value: Value) -> Self {
    Self::new(vec!["set_property".into(), name.into(), value])
  }

  /// Set pause state.
  pub fn set_pause(paused: bool) -> Self {
    Self::set_property("pause", paused.into())
  }

  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }

  /// Observe a property for changes. `id` is echoed back in every `property-change` event.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new(vec!["observe_property".into(), id.into(), name.into()])
  }

  /// Stop observing a property.
  pub fn unobserve_property(id: i64) -> Self {
    Self::new(vec!["unobserve_property".into(), id.into()])
  }

  /// Cycle (toggle) a property.
  pub fn cycle(property: &str) -> Self {
    Self::new(vec!["cycle".into(), property.into()])
  }

  /// Bind `key` so that pressing it emits a `client-message` event tagged with [`INPUT_MESSAGE`].
  pub fn keybind(key: &str) -> Self {
    let action = format!("script-message {} {}", INPUT_MESSAGE, quote_arg(key));
    Self::new(vec!["keybind".into(), key.into(), action.into()])
  }

  /// Stop playback and clear the playlist; the player stays alive in idle mode.
  pub fn stop() -> Self {
    Self::new(vec!["stop".into()])
  }

  /// Quit MPV.
  pub fn quit() -> Self {
    Self::new(vec!["quit".into()])
  }
}

/// Quote a value for mpv's input command syntax.
fn quote_arg(arg: &str) -> String {
  let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
  format!("\"{}\"", escaped)
}

/// Response from MPV for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpvReply {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  /// Matching request ID.
  pub request_id: i64,
}

impl MpvReply {
  pub fn success(request_id: i64, data: Option<Value>) -> Self {
    Self {
      error: "success".to_string(),
      data,
      request_id,
    }
  }

  pub fn failure(request_id: i64, error: &str) -> Self {
    Self {
      error: error.to_string(),
      data: None,
      request_id,
    }
  }

  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file", "client-message").
  pub event: String,
  /// Observer ID for property-change events.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  /// Property name for property-change events.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Event data.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  /// Arguments for client-message events (from script-message command).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub args: Option<Vec<String>>,
  /// Any field not covered above.
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl MpvEvent {
  pub fn named(event: &str) -> Self {
    Self {
      event: event.to_string(),
      id: None,
      name: None,
      data: None,
      reason: None,
      args: None,
      extra: Map::new(),
    }
  }

  pub fn property_change(id: i64, name: &str, data: Value) -> Self {
    Self {
      id: Some(id),
      name: Some(name.to_string()),
      data: Some(data),
      ..Self::named("property-change")
    }
  }

  pub fn input(key: &str) -> Self {
    Self {
      args: Some(vec![INPUT_MESSAGE.to_string(), key.to_string()]),
      ..Self::named("client-message")
    }
  }

  /// Routing key used by the dispatcher.
  pub fn topic(&self) -> Topic {
    match self.event.as_str() {
      "property-change" => {
        if let Some(name) = &self.name {
          return Topic::Property(name.clone());
        }
      }
      "client-message" => {
        if let Some([marker, key, ..]) = self.args.as_deref() {
          if marker == INPUT_MESSAGE {
            return Topic::Input(key.clone());
          }
        }
      }
      _ => {}
    }
    Topic::Event(self.event.clone())
  }

  /// Event payload as a typed value.
  pub fn value(&self) -> PropertyValue {
    self
      .data
      .clone()
      .map(PropertyValue::from)
      .unwrap_or(PropertyValue::Null)
  }
}

/// Name under which an event is delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
  /// `property-change` notification for the named property.
  Property(String),
  /// Key or mouse button bound through `keybind`.
  Input(String),
  /// Any other player event (`file-loaded`, `end-file`, `idle`, ...).
  Event(String),
}

impl Topic {
  pub fn property(name: impl Into<String>) -> Self {
    Topic::Property(name.into())
  }

  pub fn input(key: impl Into<String>) -> Self {
    Topic::Input(key.into())
  }

  pub fn event(name: impl Into<String>) -> Self {
    Topic::Event(name.into())
  }
}

impl fmt::Display for Topic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Topic::Property(name) => write!(f, "property:{}", name),
      Topic::Input(key) => write!(f, "input:{}", key),
      Topic::Event(name) => write!(f, "event:{}", name),
    }
  }
}

/// Typed property values from MPV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
  Bool(bool),
  Number(f64),
  String(String),
  Json(Value),
  Null,
}

impl PropertyValue {
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      PropertyValue::Number(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      PropertyValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, PropertyValue::Null)
  }
}

impl From<Value> for PropertyValue {
  fn from(value: Value) -> Self {
    match value {
      Value::Bool(b) => PropertyValue::Bool(b),
      Value::Number(n) => PropertyValue::Number(n.as_f64().unwrap_or(0.0)),
      Value::String(s) => PropertyValue::String(s),
      Value::Array(_) | Value::Object(_) => PropertyValue::Json(value),
      Value::Null => PropertyValue::Null,
    }
  }
}

impl fmt::Display for PropertyValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PropertyValue::Bool(b) => write!(f, "{}", b),
      PropertyValue::Number(n) => write!(f, "{}", n),
      PropertyValue::String(s) => f.write_str(s),
      PropertyValue::Json(v) => write!(f, "{}", v),
      PropertyValue::Null => f.write_str("null"),
    }
  }
}

/// Message received from MPV IPC (either reply or event).
#[derive(Debug, Clone, PartialEq)]
pub enum MpvMessage {
  Reply(MpvReply),
  Event(MpvEvent),
}

/// Serialize a command into one newline-terminated line.
pub fn encode(command: &MpvCommand) -> Result<Vec<u8>, CodecError> {
  check_arguments(&command.command).map_err(CodecError::Encoding)?;
  let mut bytes =
    serde_json::to_vec(command).map_err(|e| CodecError::Encoding(e.to_string()))?;
  bytes.push(b'\n');
  Ok(bytes)
}

fn check_arguments(args: &[Value]) -> Result<(), String> {
  match args.first() {
    None => return Err("command has no operation name".into()),
    Some(Value::String(_)) => {}
    Some(other) => {
      return Err(format!(
        "operation name must be a string, got {}",
        kind_of(other)
      ))
    }
  }

  for (index, arg) in args.iter().enumerate().skip(1) {
    match arg {
      Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
      other => {
        return Err(format!(
          "argument {} is {}, expected string, number or boolean",
          index,
          kind_of(other)
        ))
      }
    }
  }
  Ok(())
}

fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

/// Parse one inbound line. The presence of `request_id` marks a reply; anything
/// else must carry an `event` name.
pub fn decode(line: &[u8]) -> Result<MpvMessage, CodecError> {
  let value: Value =
    serde_json::from_slice(line).map_err(|e| CodecError::Decoding(e.to_string()))?;

  let fields = match value {
    Value::Object(fields) => fields,
    other => {
      return Err(CodecError::Decoding(format!(
        "expected a JSON object, got {}",
        kind_of(&other)
      )))
    }
  };

  if fields.contains_key("request_id") {
    serde_json::from_value(Value::Object(fields))
      .map(MpvMessage::Reply)
      .map_err(|e| CodecError::Decoding(format!("malformed reply: {}", e)))
  } else if fields.contains_key("event") {
    serde_json::from_value(Value::Object(fields))
      .map(MpvMessage::Event)
      .map_err(|e| CodecError::Decoding(format!("malformed event: {}", e)))
  } else {
    Err(CodecError::Decoding(
      "message has neither request_id nor event".into(),
    ))
  }
}

/// Parse an outbound command line, as the player would.
pub fn decode_command(line: &[u8]) -> Result<MpvCommand, CodecError> {
  let command: MpvCommand =
    serde_json::from_slice(line).map_err(|e| CodecError::Decoding(e.to_string()))?;
  check_arguments(&command.command).map_err(CodecError::Decoding)?;
  Ok(command)
}
