use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Identifier of one pending propagation of an actor's index updates.
pub type WorkflowId = uuid::Uuid;
/// Host (process) identifier, e.g. `"host-a"`.
pub type HostId = String;

/// Opaque, serializable handle to one indexed actor.
///
/// `kind` names the actor class, `id` its identity within that class. Two
/// references are the same actor iff both parts match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorRef {
    pub kind: String,
    pub id: String,
}

impl ActorRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        ActorRef {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Stable across processes and releases; used for shard selection.
    pub fn stable_hash(&self) -> u64 {
        xxh3_64(format!("{}/{}", self.kind, self.id).as_bytes())
    }

    /// Key under which the actor's durable state lives in the state store.
    pub fn state_key(&self) -> String {
        format!("actor/{}/{}", self.kind, self.id)
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A value of one indexed field: the key space of every index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Date(i64),
}

impl IndexValue {
    pub fn text(s: impl Into<String>) -> Self {
        IndexValue::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            IndexValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            IndexValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Stable hash used to route keys to partitioned buckets.
    pub fn stable_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(16);
        match self {
            IndexValue::Text(s) => {
                bytes.push(0u8);
                bytes.extend_from_slice(s.as_bytes());
            }
            IndexValue::Integer(i) => {
                bytes.push(1u8);
                bytes.extend_from_slice(&i.to_le_bytes());
            }
            IndexValue::Boolean(b) => {
                bytes.push(2u8);
                bytes.push(u8::from(*b));
            }
            IndexValue::Date(d) => {
                bytes.push(3u8);
                bytes.extend_from_slice(&d.to_le_bytes());
            }
        }
        xxh3_64(&bytes)
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Text(s) => write!(f, "{}", s),
            IndexValue::Integer(i) => write!(f, "{}", i),
            IndexValue::Boolean(b) => write!(f, "{}", b),
            IndexValue::Date(d) => write!(f, "@{}", d),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::Text(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        IndexValue::Text(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        IndexValue::Integer(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        IndexValue::Boolean(b)
    }
}

/// The indexable part of an actor's state: named field values.
///
/// Use [`ActorProperties::from_json`] to build from a JSON object, or
/// [`ActorProperties::with`] for the builder style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorProperties {
    pub fields: BTreeMap<String, IndexValue>,
}

impl ActorProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<IndexValue>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn set(&mut self, field: &str, value: Option<IndexValue>) {
        match value {
            Some(v) => {
                self.fields.insert(field.to_string(), v);
            }
            None => {
                self.fields.remove(field);
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&IndexValue> {
        self.fields.get(field)
    }

    /// Parse from a flat JSON object. Nulls, floats, arrays and nested
    /// objects are not indexable and are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::IndexingError::Json`] if the value is not an object.
    pub fn from_json(json: &serde_json::Value) -> crate::error::Result<Self> {
        let obj = json.as_object().ok_or_else(|| {
            crate::error::IndexingError::Json("Expected JSON object".to_string())
        })?;

        let mut fields = BTreeMap::new();
        for (key, val) in obj {
            if let Some(v) = json_value_to_index_value(val) {
                fields.insert(key.clone(), v);
            }
        }
        Ok(ActorProperties { fields })
    }
}

pub fn json_value_to_index_value(val: &serde_json::Value) -> Option<IndexValue> {
    match val {
        serde_json::Value::String(s) => Some(IndexValue::Text(s.clone())),
        serde_json::Value::Number(n) => n.as_i64().map(IndexValue::Integer),
        serde_json::Value::Bool(b) => Some(IndexValue::Boolean(*b)),
        serde_json::Value::Null => None,
        serde_json::Value::Array(_) => None,
        serde_json::Value::Object(_) => None,
    }
}

/// Logical identity of one workflow queue: an indexed interface and a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    pub interface: String,
    pub shard: u32,
}

impl QueueId {
    pub fn new(interface: impl Into<String>, shard: u32) -> Self {
        QueueId {
            interface: interface.into(),
            shard,
        }
    }

    /// Shard responsible for `actor` when the interface has `shards` queues.
    pub fn for_actor(interface: &str, actor: &ActorRef, shards: u32) -> Self {
        let shards = shards.max(1);
        QueueId::new(interface, (actor.stable_hash() % u64::from(shards)) as u32)
    }

    pub fn stable_hash(&self) -> u64 {
        xxh3_64(format!("{}/{}", self.interface, self.shard).as_bytes())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interface, self.shard)
    }
}

/// Where a queue instance lives: its identity plus the hosting process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueAddress {
    pub id: QueueId,
    pub host: HostId,
}

impl QueueAddress {
    pub fn new(id: QueueId, host: impl Into<HostId>) -> Self {
        QueueAddress {
            id,
            host: host.into(),
        }
    }

    /// Key of the persisted queue state. Includes the host so that a
    /// reincarnated stand-in can re-derive exactly the dead queue's state.
    pub fn state_key(&self) -> String {
        format!("workflow-queue/{}/{}@{}", self.id.interface, self.id.shard, self.host)
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.host)
    }
}
