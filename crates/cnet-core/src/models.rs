//! Data model shared by dispatch, submission, ingestion and status tracking.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::defaults;
use crate::{Error, Result};

// =============================================================================
// TARGET KINDS
// =============================================================================

/// Which kind of object a job message addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Edge,
    Node,
    Measure,
    Point,
    Overlap,
    Image,
    GroundPoint,
    Item,
}

impl TargetKind {
    /// Wire string of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Edge => "edge",
            TargetKind::Node => "node",
            TargetKind::Measure => "measure",
            TargetKind::Point => "point",
            TargetKind::Overlap => "overlap",
            TargetKind::Image => "image",
            TargetKind::GroundPoint => "ground_point",
            TargetKind::Item => "item",
        }
    }

    /// Graph-object kinds are resolved against the in-memory graph.
    pub fn is_graph(&self) -> bool {
        matches!(self, TargetKind::Edge | TargetKind::Node)
    }

    /// Row kinds are resolved against a database table.
    pub fn is_row(&self) -> bool {
        matches!(
            self,
            TargetKind::Measure
                | TargetKind::Point
                | TargetKind::Overlap
                | TargetKind::Image
                | TargetKind::GroundPoint
        )
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = Error;

    /// Accepts the wire names plus the historical short, plural and numeric aliases.
    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "edge" | "edges" | "e" | "0" => TargetKind::Edge,
            "node" | "nodes" | "n" | "1" => TargetKind::Node,
            "measure" | "measures" | "m" | "2" => TargetKind::Measure,
            "point" | "points" | "p" | "3" => TargetKind::Point,
            "overlap" | "overlaps" | "o" | "4" => TargetKind::Overlap,
            "image" | "images" | "i" | "5" => TargetKind::Image,
            "ground_point" | "candidategroundpoint" | "candidategroundpoints" | "6" => {
                TargetKind::GroundPoint
            }
            "item" | "items" => TargetKind::Item,
            other => {
                return Err(Error::UnknownTarget(format!(
                    "'{}' is not a graph collection, database table or iterable",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

// =============================================================================
// IDENTITIES
// =============================================================================

/// Identity of a graph object: a node id or an edge's endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Node(i64),
    Edge(i64, i64),
}

impl ObjectId {
    /// Interpret a wire `id`: a scalar is a node, a two-element array an edge.
    pub fn from_wire(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::Number(n) => n
                .as_i64()
                .map(ObjectId::Node)
                .ok_or_else(|| Error::InvalidInput(format!("node id {} is not an integer", n))),
            JsonValue::Array(pair) if pair.len() == 2 => {
                match (pair[0].as_i64(), pair[1].as_i64()) {
                    (Some(s), Some(d)) => Ok(ObjectId::Edge(s, d)),
                    _ => Err(Error::InvalidInput(format!(
                        "edge id {} must contain two integers",
                        value
                    ))),
                }
            }
            other => Err(Error::InvalidInput(format!(
                "{} is neither a node id nor an edge id pair",
                other
            ))),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            ObjectId::Node(_) => TargetKind::Node,
            ObjectId::Edge(..) => TargetKind::Edge,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Node(id) => write!(f, "{}", id),
            ObjectId::Edge(s, d) => write!(f, "({}, {})", s, d),
        }
    }
}

/// The `id` field of a job message.
///
/// On the wire a node or row id is a number, an edge is `[source, destination]`
/// and an iterable item is carried verbatim. Which one a number denotes is
/// decided by the message's `along` kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetId {
    Node(i64),
    Edge(i64, i64),
    Row(i64),
    Item(JsonValue),
}

impl TargetId {
    pub fn to_wire(&self) -> JsonValue {
        match self {
            TargetId::Node(id) | TargetId::Row(id) => JsonValue::from(*id),
            TargetId::Edge(s, d) => JsonValue::from(vec![*s, *d]),
            TargetId::Item(value) => value.clone(),
        }
    }

    /// Interpret a wire `id` in the context of the message kind.
    pub fn from_wire(kind: TargetKind, value: &JsonValue) -> Result<Self> {
        match kind {
            TargetKind::Item => Ok(TargetId::Item(value.clone())),
            TargetKind::Node | TargetKind::Edge => match ObjectId::from_wire(value)? {
                ObjectId::Node(id) if kind == TargetKind::Node => Ok(TargetId::Node(id)),
                ObjectId::Edge(s, d) if kind == TargetKind::Edge => Ok(TargetId::Edge(s, d)),
                _ => Err(Error::InvalidInput(format!(
                    "id {} does not identify a {}",
                    value, kind
                ))),
            },
            _ => value.as_i64().map(TargetId::Row).ok_or_else(|| {
                Error::InvalidInput(format!("{} row id {} is not an integer", kind, value))
            }),
        }
    }
}

impl From<ObjectId> for TargetId {
    fn from(id: ObjectId) -> Self {
        match id {
            ObjectId::Node(n) => TargetId::Node(n),
            ObjectId::Edge(s, d) => TargetId::Edge(s, d),
        }
    }
}

impl Serialize for TargetId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_wire().serialize(serializer)
    }
}

/// Image path(s) attached to node and edge messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagePath {
    Node(String),
    Edge(String, String),
}

// =============================================================================
// WALLTIME
// =============================================================================

static WALLTIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}):([0-5]\d):([0-5]\d)$").expect("static regex"));

/// Scheduler wall-clock budget in `HH:MM:SS` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime(String);

impl Walltime {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if !WALLTIME_RE.is_match(&value) {
            return Err(Error::InvalidInput(format!(
                "walltime '{}' must be formatted HH:MM:SS",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Total budget in seconds.
    pub fn as_secs(&self) -> u64 {
        self.0
            .split(':')
            .filter_map(|part| part.parse::<u64>().ok())
            .fold(0, |acc, part| acc * 60 + part)
    }
}

impl Default for Walltime {
    fn default() -> Self {
        Self(defaults::WALLTIME.to_string())
    }
}

impl TryFrom<String> for Walltime {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Walltime::new(value)
    }
}

impl From<Walltime> for String {
    fn from(w: Walltime) -> Self {
        w.0
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// A callable shipped to cluster workers in serialized form.
pub trait RemoteFunction: Send + Sync {
    /// Human-readable name used for logging and log-file names.
    fn name(&self) -> &str;

    /// Serialized form carried in the message `func` field.
    fn encode(&self) -> String;
}

/// The operation a dispatch applies: a registered name or a serialized callable.
#[derive(Clone)]
pub enum FunctionRef {
    Named(String),
    Callable(Arc<dyn RemoteFunction>),
}

impl FunctionRef {
    pub fn named(name: impl Into<String>) -> Self {
        FunctionRef::Named(name.into())
    }

    /// Name for logging and scheduler output templates.
    pub fn name(&self) -> &str {
        match self {
            FunctionRef::Named(name) => name,
            FunctionRef::Callable(f) => f.name(),
        }
    }

    /// String identifier placed on the wire.
    pub fn wire_identifier(&self) -> String {
        match self {
            FunctionRef::Named(name) => name.clone(),
            FunctionRef::Callable(f) => f.encode(),
        }
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
            FunctionRef::Callable(func) => f.debug_tuple("Callable").field(&func.name()).finish(),
        }
    }
}

/// A callable already serialized by the caller, carried as base64 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFunction {
    name: String,
    payload: Vec<u8>,
}

impl EncodedFunction {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Recover the raw payload from its wire form.
    pub fn decode_payload(wire: &str) -> Result<Vec<u8>> {
        BASE64
            .decode(wire)
            .map_err(|e| Error::Serialization(format!("function payload: {}", e)))
    }
}

impl RemoteFunction for EncodedFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self) -> String {
        BASE64.encode(&self.payload)
    }
}

impl From<&str> for FunctionRef {
    fn from(name: &str) -> Self {
        FunctionRef::Named(name.to_string())
    }
}

impl From<String> for FunctionRef {
    fn from(name: String) -> Self {
        FunctionRef::Named(name)
    }
}

// =============================================================================
// JOB MESSAGE
// =============================================================================

/// The unit pushed onto the processing queue.
///
/// Every message carries the full run configuration so it can be executed
/// after the dispatching process has exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJobMessage")]
pub struct JobMessage {
    pub id: TargetId,
    pub along: TargetKind,
    pub func: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: Map<String, JsonValue>,
    pub walltime: Walltime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<ImagePath>,
    #[serde(default = "default_param_step")]
    pub param_step: u32,
    pub config: JsonValue,
}

fn default_param_step() -> u32 {
    defaults::PARAM_STEP
}

/// Decoding shape of [`JobMessage`] before the id is interpreted.
#[derive(Deserialize)]
struct RawJobMessage {
    id: JsonValue,
    along: TargetKind,
    func: String,
    #[serde(default)]
    args: Vec<JsonValue>,
    #[serde(default)]
    kwargs: Map<String, JsonValue>,
    walltime: Walltime,
    #[serde(default)]
    image_path: Option<ImagePath>,
    #[serde(default = "default_param_step")]
    param_step: u32,
    config: JsonValue,
}

impl TryFrom<RawJobMessage> for JobMessage {
    type Error = Error;

    fn try_from(raw: RawJobMessage) -> Result<Self> {
        Ok(JobMessage {
            id: TargetId::from_wire(raw.along, &raw.id)?,
            along: raw.along,
            func: raw.func,
            args: raw.args,
            kwargs: raw.kwargs,
            walltime: raw.walltime,
            image_path: raw.image_path,
            param_step: raw.param_step,
            config: raw.config,
        })
    }
}

// =============================================================================
// JOB STATUS
// =============================================================================

/// Outcome of one operation on one graph object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub success: bool,
}

/// Completion report sent back by a cluster worker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompletionMessage {
    pub id: JsonValue,
    pub func: String,
    pub success: bool,
}
