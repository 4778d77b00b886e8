//! State Manager: holds per-stream watermarks and translates between the
//! legacy map format and the per-stream/global envelope format (§4.9).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SourceError;

/// The two state document shapes accepted on input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateDocument {
    /// `{streamName → opaqueBlob}`.
    Legacy(HashMap<String, Value>),
    /// A sequence of envelope items, optionally led by a `GLOBAL` entry.
    Envelope(Vec<EnvelopeItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnvelopeItem {
    #[serde(rename = "GLOBAL")]
    Global { global: Value },
    #[serde(rename = "STREAM")]
    Stream {
        stream_descriptor: StreamDescriptor,
        stream_state: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StreamDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Legacy,
    EnvelopeWithGlobal,
    EnvelopePerStream,
}

/// Holds the live, mutable watermark state for every stream in a run, and
/// produces snapshots in whichever format the input was provided in.
///
/// Reading a stream's state returns an owned clone, never a reference into
/// the manager's storage, so a caller cannot observe (or cause) a mutation
/// to another stream's state through it.
#[derive(Debug, Clone)]
pub struct StateManager {
    per_stream: HashMap<String, Value>,
    global: Value,
    format: Format,
}

impl StateManager {
    /// Build a manager from a previously-persisted state document.
    pub fn from_document(doc: StateDocument) -> Self {
        match doc {
            StateDocument::Legacy(map) => StateManager {
                per_stream: map,
                global: json!({}),
                format: Format::Legacy,
            },
            StateDocument::Envelope(items) => {
                let mut per_stream = HashMap::new();
                let mut global = json!({});
                let mut has_global = false;
                for item in items {
                    match item {
                        EnvelopeItem::Global { global: g } => {
                            global = g;
                            has_global = true;
                        }
                        EnvelopeItem::Stream {
                            stream_descriptor,
                            stream_state,
                        } => {
                            per_stream.insert(stream_descriptor.name, stream_state);
                        }
                    }
                }
                StateManager {
                    per_stream,
                    global,
                    format: if has_global {
                        Format::EnvelopeWithGlobal
                    } else {
                        Format::EnvelopePerStream
                    },
                }
            }
        }
    }

    /// An empty manager in legacy format, for a fresh run with no prior
    /// state.
    pub fn empty() -> Self {
        StateManager {
            per_stream: HashMap::new(),
            global: json!({}),
            format: Format::Legacy,
        }
    }

    /// Parse a state document from its on-disk JSON representation.
    pub fn load(raw: &[u8]) -> Result<Self, SourceError> {
        let doc: StateDocument = serde_json::from_slice(raw)?;
        Ok(Self::from_document(doc))
    }

    /// This stream's current state blob, or `{}` if the stream has no prior
    /// state. Always an owned clone.
    pub fn get(&self, stream: &str) -> Value {
        self.per_stream.get(stream).cloned().unwrap_or_else(|| json!({}))
    }

    /// The cursor-field watermark for `stream`, if one has been recorded.
    pub fn cutoff_ms(&self, stream: &str) -> Option<i64> {
        self.get(stream).get("cutoff").and_then(Value::as_i64)
    }

    /// Record a new watermark for `stream`, merging with any existing
    /// non-`cutoff` fields already stored for it. Writes to one stream's
    /// state never visibly affect another's.
    pub fn set_cutoff(&mut self, stream: &str, cutoff_ms: i64) {
        let mut current = self.get(stream);
        match current.as_object_mut() {
            Some(obj) => {
                obj.insert("cutoff".to_string(), json!(cutoff_ms));
            }
            None => current = json!({ "cutoff": cutoff_ms }),
        }
        self.per_stream.insert(stream.to_string(), current);
    }

    /// Produce a checkpoint document reflecting a snapshot of all streams
    /// as of this call, in the same shape the manager was constructed from.
    pub fn snapshot(&self) -> StateDocument {
        match self.format {
            Format::Legacy => StateDocument::Legacy(self.per_stream.clone()),
            Format::EnvelopeWithGlobal | Format::EnvelopePerStream => {
                let mut items = Vec::new();
                if self.format == Format::EnvelopeWithGlobal {
                    items.push(EnvelopeItem::Global {
                        global: self.global.clone(),
                    });
                }
                let mut names: Vec<&String> = self.per_stream.keys().collect();
                names.sort();
                for name in names {
                    items.push(EnvelopeItem::Stream {
                        stream_descriptor: StreamDescriptor { name: name.clone() },
                        stream_state: self.per_stream[name].clone(),
                    });
                }
                StateDocument::Envelope(items)
            }
        }
    }

    /// Serialize the full state map as a `serde_json::Value`, the shape
    /// embedded in a STATE protocol message's `data` field.
    pub fn to_state_value(&self) -> Value {
        match self.snapshot() {
            StateDocument::Legacy(map) => serde_json::to_value(map).expect("map serializes"),
            StateDocument::Envelope(items) => serde_json::to_value(items).expect("envelope serializes"),
        }
    }
}
