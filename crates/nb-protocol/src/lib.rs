// nb-protocol: V8 debugger wire protocol types, framing codec, and command
// builders.
//
// All messages on the stream are length-prefixed JSON envelopes carrying a
// top-level `type` field (`request`, `response`, or `event`) used for
// discriminated deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;
pub mod commands;

pub use codec::{FrameCodec, FrameError};
pub use commands::{Command, CommandTag, ExceptionBreakKind, StepAction};

// ---------------------------------------------------------------------------
// Message envelopes
// ---------------------------------------------------------------------------

/// A decoded message from (or to) the debugger stream.
///
/// ```json
/// { "type": "event", "event": "break", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMessage {
    Request(WireRequest),
    Response(Response),
    Event(Event),
}

/// An outbound request.
///
/// `seq` is assigned by the dispatcher; unique and monotonic within one
/// session. Commands without arguments omit the `arguments` key entirely
/// (the debuggee rejects `"arguments": null` for some commands).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub seq: u32,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// A response to a request, correlated by `request_seq`.
///
/// On `success == false` the `message` field carries the failure text and
/// `body` is usually absent. `refs` holds the object mirrors referenced by
/// handle from `body`; handles are only meaningful within this envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_seq: u32,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<RefValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether the debuggee resumed execution as part of this response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
}

/// A server-originated event (`break`, `exception`, `afterCompile`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

// ---------------------------------------------------------------------------
// Object mirrors
// ---------------------------------------------------------------------------

/// A serialized value mirror, as found in a response's `refs` array or as
/// the body of an `evaluate` response.
///
/// Leaves carry `value`; composites carry `properties` whose slots must be
/// joined against the enclosing envelope's `refs` by handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefValue {
    pub handle: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "className", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<PropertySlot>>,
}

/// A property slot inside an object mirror: a name plus the handle of the
/// value it refers to. Array indices arrive as JSON numbers and are
/// normalized to strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySlot {
    #[serde(deserialize_with = "de_property_name")]
    pub name: String,
    #[serde(rename = "ref")]
    pub handle: u64,
}

/// An inline property, as found in `scope` response bodies
/// (`body.object.properties`): the value summary is embedded rather than
/// referenced through `refs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineProperty {
    #[serde(deserialize_with = "de_property_name")]
    pub name: String,
    pub value: ValueSummary,
}

/// The part of a value mirror the inspection engine keeps: its type, the
/// literal value for leaves, the class name and handle for composites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSummary {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, rename = "className", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,
}

fn de_property_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "property name must be a string or number, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Ref joining
// ---------------------------------------------------------------------------

/// Join an object mirror's property slots with the envelope's `refs` table,
/// producing inline properties. Slots whose handle has no matching ref are
/// skipped.
pub fn join_properties(slots: &[PropertySlot], refs: &[RefValue]) -> Vec<InlineProperty> {
    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
        let Some(r) = refs.iter().find(|r| r.handle == slot.handle) else {
            continue;
        };
        out.push(InlineProperty {
            name: slot.name.clone(),
            value: ValueSummary {
                kind: r.kind.clone(),
                value: r.value.clone(),
                class_name: r.class_name.clone(),
                handle: Some(r.handle),
            },
        });
    }
    out
}

/// Render an `evaluate` result mirror for console display.
///
/// Primitives print their `text`; functions print `#<Function>`; objects and
/// arrays print a one-level property listing with nested composites
/// abbreviated.
pub fn render_evaluate(body: &RefValue, refs: &[RefValue]) -> String {
    match body.kind.as_str() {
        "object" => render_object(body, refs),
        "function" => "#<Function>".to_owned(),
        _ => body.text.clone().unwrap_or_default(),
    }
}

fn render_object(body: &RefValue, refs: &[RefValue]) -> String {
    let mut listing = String::new();
    for slot in body.properties.as_deref().unwrap_or_default() {
        let Some(r) = refs.iter().find(|r| r.handle == slot.handle) else {
            continue;
        };
        let text = match r.kind.as_str() {
            "object" => {
                if r.class_name.as_deref() == Some("Array") {
                    "#<Array>".to_owned()
                } else {
                    "#<Object>".to_owned()
                }
            }
            "function" => "#<Function>".to_owned(),
            _ => r.text.clone().unwrap_or_default(),
        };
        listing.push_str(&format!(" {}: {text}\n", slot.name));
    }
    if body.class_name.as_deref() == Some("Array") {
        format!("[\n{listing}]")
    } else {
        format!("{{\n{listing}}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protocol_message_discriminates_on_type() {
        let raw = r#"{"type":"event","event":"break","body":{"sourceLine":9}}"#;
        let msg: ProtocolMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ProtocolMessage::Event(e) => {
                assert_eq!(e.event, "break");
                assert_eq!(e.body.unwrap()["sourceLine"], 9);
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn request_without_arguments_omits_the_key() {
        let req = WireRequest {
            seq: 3,
            command: "scripts".to_owned(),
            arguments: None,
        };
        let raw = serde_json::to_string(&ProtocolMessage::Request(req)).unwrap();
        assert!(raw.contains(r#""type":"request""#));
        assert!(!raw.contains("arguments"));
    }

    #[test]
    fn response_defaults_for_missing_fields() {
        let raw = r#"{"type":"response","request_seq":7,"command":"continue","success":true}"#;
        let msg: ProtocolMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ProtocolMessage::Response(r) => {
                assert_eq!(r.request_seq, 7);
                assert!(r.refs.is_empty());
                assert!(r.body.is_none());
                assert!(r.message.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn numeric_property_names_normalize_to_strings() {
        let raw = r#"{"name":0,"ref":17}"#;
        let slot: PropertySlot = serde_json::from_str(raw).unwrap();
        assert_eq!(slot.name, "0");
        assert_eq!(slot.handle, 17);
    }

    #[test]
    fn join_skips_slots_without_a_matching_ref() {
        let slots = vec![
            PropertySlot {
                name: "a".to_owned(),
                handle: 1,
            },
            PropertySlot {
                name: "b".to_owned(),
                handle: 2,
            },
        ];
        let refs = vec![RefValue {
            handle: 1,
            kind: "number".to_owned(),
            class_name: None,
            value: Some(json!(42)),
            text: Some("42".to_owned()),
            properties: None,
        }];
        let joined = join_properties(&slots, &refs);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].name, "a");
        assert_eq!(joined[0].value.kind, "number");
        assert_eq!(joined[0].value.handle, Some(1));
        assert_eq!(joined[0].value.value, Some(json!(42)));
    }

    #[test]
    fn evaluate_renders_primitive_text() {
        let body = RefValue {
            handle: 5,
            kind: "number".to_owned(),
            class_name: None,
            value: Some(json!(3)),
            text: Some("3".to_owned()),
            properties: None,
        };
        assert_eq!(render_evaluate(&body, &[]), "3");
    }

    #[test]
    fn evaluate_renders_object_listing() {
        let body = RefValue {
            handle: 9,
            kind: "object".to_owned(),
            class_name: Some("Object".to_owned()),
            value: None,
            text: None,
            properties: Some(vec![
                PropertySlot {
                    name: "x".to_owned(),
                    handle: 10,
                },
                PropertySlot {
                    name: "list".to_owned(),
                    handle: 11,
                },
            ]),
        };
        let refs = vec![
            RefValue {
                handle: 10,
                kind: "number".to_owned(),
                class_name: None,
                value: Some(json!(1)),
                text: Some("1".to_owned()),
                properties: None,
            },
            RefValue {
                handle: 11,
                kind: "object".to_owned(),
                class_name: Some("Array".to_owned()),
                value: None,
                text: Some("#<Array>".to_owned()),
                properties: None,
            },
        ];
        assert_eq!(render_evaluate(&body, &refs), "{\n x: 1\n list: #<Array>\n}");
    }

    #[test]
    fn evaluate_renders_array_with_brackets() {
        let body = RefValue {
            handle: 9,
            kind: "object".to_owned(),
            class_name: Some("Array".to_owned()),
            value: None,
            text: None,
            properties: Some(vec![PropertySlot {
                name: "0".to_owned(),
                handle: 10,
            }]),
        };
        let refs = vec![RefValue {
            handle: 10,
            kind: "string".to_owned(),
            class_name: None,
            value: Some(json!("hi")),
            text: Some("hi".to_owned()),
            properties: None,
        }];
        assert_eq!(render_evaluate(&body, &refs), "[\n 0: hi\n]");
    }

    #[test]
    fn evaluate_renders_function_marker() {
        let body = RefValue {
            handle: 2,
            kind: "function".to_owned(),
            class_name: Some("Function".to_owned()),
            value: None,
            text: Some("function f() {}".to_owned()),
            properties: None,
        };
        assert_eq!(render_evaluate(&body, &[]), "#<Function>");
    }
}
