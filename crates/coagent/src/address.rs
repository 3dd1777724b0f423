//! Logical addresses and the canonical topic codec.
//!
//! An [`Address`] names an agent (`name` is the dot-delimited agent type,
//! `id` the session); the broker only sees topics. The mapping is a total
//! bijection on the valid domain and must stay bit-exact across
//! implementations:
//!
//! | Address                     | Topic                         |
//! |-----------------------------|-------------------------------|
//! | `discovery`                 | `coagent.discovery`           |
//! | `discovery.server`          | `coagent.discovery.server`    |
//! | `_INBOX.*` (reply)          | used verbatim                 |
//! | `{name, id: ""}` (factory)  | `coagent.factory.<name>`      |
//! | `{name, id}` (session)      | `coagent.agent.<name>.<id>`   |

use std::fmt;
use std::hash::{Hash, Hasher};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DISCOVERY_NAME: &str = "discovery";
pub const DISCOVERY_SERVER_NAME: &str = "discovery.server";

const DISCOVERY_TOPIC: &str = "coagent.discovery";
const DISCOVERY_SERVER_TOPIC: &str = "coagent.discovery.server";

const FACTORY_TOPIC_PREFIX: &str = "coagent.factory.";
const AGENT_TOPIC_PREFIX: &str = "coagent.agent.";
/// The reply-inbox prefix of the underlying broker.
const REPLY_TOPIC_PREFIX: &str = "_INBOX.";

/// The logical identity of an agent: agent type plus session id.
///
/// An empty `id` addresses the factory for the type. Reply addresses are
/// ephemeral and store the whole `_INBOX.*` topic in `name`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Address {
    /// Agent type (dot-delimited hierarchical namespace).
    pub name: String,
    /// Session id; empty for the factory of the type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

impl Address {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// The factory address for an agent type.
    pub fn factory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
        }
    }

    /// An ephemeral reply address wrapping an `_INBOX.*` topic.
    pub fn reply(topic: impl Into<String>) -> Self {
        Self {
            name: topic.into(),
            id: String::new(),
        }
    }

    /// Whether this is an ephemeral reply address.
    pub fn is_reply(&self) -> bool {
        self.name.starts_with(REPLY_TOPIC_PREFIX)
    }

    fn singleton_topic(&self) -> Option<&'static str> {
        match self.name.as_str() {
            DISCOVERY_NAME => Some(DISCOVERY_TOPIC),
            DISCOVERY_SERVER_NAME => Some(DISCOVERY_SERVER_TOPIC),
            _ => None,
        }
    }

    /// Whether publishing to this address should first probe the factory.
    ///
    /// Only session addresses qualify; singleton, factory and reply
    /// addresses are never probed.
    pub fn needs_probe(&self) -> bool {
        self.singleton_topic().is_none() && !self.is_reply() && !self.id.is_empty()
    }

    /// The broker topic for this address.
    pub fn topic(&self) -> String {
        if let Some(topic) = self.singleton_topic() {
            return topic.to_string();
        }
        if self.is_reply() {
            return self.name.clone();
        }
        if self.id.is_empty() {
            format!("{FACTORY_TOPIC_PREFIX}{}", self.name)
        } else {
            format!("{AGENT_TOPIC_PREFIX}{}.{}", self.name, self.id)
        }
    }

    /// Decode a broker topic back into an address.
    ///
    /// Topics with no recognized prefix are rejected with [`Error::Config`].
    pub fn from_topic(topic: &str) -> Result<Self> {
        match topic {
            DISCOVERY_TOPIC => return Ok(Self::factory(DISCOVERY_NAME)),
            DISCOVERY_SERVER_TOPIC => return Ok(Self::factory(DISCOVERY_SERVER_NAME)),
            _ => {}
        }

        if topic.starts_with(REPLY_TOPIC_PREFIX) {
            return Ok(Self::reply(topic));
        }

        if let Some(rest) = topic.strip_prefix(AGENT_TOPIC_PREFIX) {
            // The id is the final segment; names are hierarchical, ids are
            // opaque session tokens and never contain dots.
            return match rest.rsplit_once('.') {
                Some((name, id)) => Ok(Self::new(name, id)),
                None => Ok(Self::factory(rest)),
            };
        }
        if let Some(rest) = topic.strip_prefix(FACTORY_TOPIC_PREFIX) {
            return Ok(Self::factory(rest));
        }

        Err(Error::Config(format!("invalid topic: {topic}")))
    }
}

// Identity is the topic, not the field pair: the singleton mapping ignores
// `id`, so two addresses are the same agent iff they encode to the same
// topic.
impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.topic() == other.topic()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.topic().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}:{}", self.name, self.id)
        }
    }
}
