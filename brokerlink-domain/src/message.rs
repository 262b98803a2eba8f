use std::collections::{BTreeMap, HashMap};
use std::fmt;

use uuid::Uuid;

// ---------------------------------------------------------------------------
// DestinationKind
// ---------------------------------------------------------------------------

/// The kind of destination an activation or handle works against.
///
/// `Any` mirrors the generic "destination" type: the directory decides
/// whether the resolved object is a queue or a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    // ---
    Queue,
    Topic,
    #[default]
    Any,
}

// ---

impl DestinationKind {
    // ---
    /// Parse an operator-supplied destination type.
    ///
    /// Accepts the short names (`queue`, `topic`) as well as fully qualified
    /// interface names ending in `.Queue` / `.Topic`. Anything else is `Any`.
    pub fn parse(s: &str) -> Self {
        // ---
        let lower = s.trim().to_ascii_lowercase();
        if lower == "queue" || lower.ends_with(".queue") {
            DestinationKind::Queue
        } else if lower == "topic" || lower.ends_with(".topic") {
            DestinationKind::Topic
        } else {
            DestinationKind::Any
        }
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// A resolved broker destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    // ---
    pub name: String,

    /// Never `Any` once resolved by a directory or a session.
    pub kind: DestinationKind,

    /// `true` for connection-scoped temporary destinations.
    pub temporary: bool,
}

// ---

impl Destination {
    // ---
    pub fn queue(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
            temporary: false,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
            temporary: false,
        }
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let kind = match self.kind {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
            DestinationKind::Any => "destination",
        };
        write!(f, "{kind}://{}", self.name)
    }
}

// ---------------------------------------------------------------------------
// MessageBody
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub enum MessageBody {
    // ---
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, String>),
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A broker message as seen by producers, consumers, and endpoints.
///
/// `properties` is application-owned; the adapter never reads or modifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    // ---
    /// Assigned by the broker on send. `None` for a message not yet sent.
    pub id: Option<String>,

    pub body: MessageBody,

    pub properties: HashMap<String, String>,

    /// Set by the broker when a message is delivered more than once.
    pub redelivered: bool,
}

// ---

impl Message {
    // ---
    pub fn new(body: MessageBody) -> Self {
        // ---
        Self {
            id: None,
            body,
            properties: HashMap::new(),
            redelivered: false,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(s.into()))
    }

    /// Attach a property, builder style.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        // ---
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Assign a fresh broker-style message id if none is set yet.
    pub fn ensure_id(&mut self) -> &str {
        self.id.get_or_insert_with(|| format!("ID:{}", Uuid::new_v4()))
    }

    /// Id for log output; `"<unassigned>"` when the message has none.
    pub fn id_for_log(&self) -> &str {
        self.id.as_deref().unwrap_or("<unassigned>")
    }

    pub fn as_text(&self) -> Option<&str> {
        // ---
        match &self.body {
            MessageBody::Text(s) => Some(s),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
