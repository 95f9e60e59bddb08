//! Resource identifiers
//!
//! A resource id has the text form `<entity_type>[<agent>,<attribute>=<value>]`,
//! for example `std::testing::NullResource[agent1,name=key1]`. The agent named
//! in the id is the agent responsible for deploying the resource.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

static RESOURCE_ID: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^(?P<type>(?:[\w-]+::)*[\w-]+)\[(?P<agent>[^,\]]+),(?P<attr>[^=\]]+)=(?P<value>[^\]]+)\]$",
    )
    .expect("resource id pattern is valid")
});

const VERSION_SEPARATOR: &str = ",v=";

/// Version-independent identifier of a resource
#[derive(Clone)]
pub struct ResourceId {
    raw: String,
    type_end: usize,
    agent: (usize, usize),
    attribute: (usize, usize),
}

impl ResourceId {
    /// Parse a resource id from its text form
    pub fn parse(s: &str) -> Result<Self> {
        let caps = RESOURCE_ID
            .captures(s)
            .ok_or_else(|| Error::InvalidResourceId(s.to_string()))?;
        let span = |name: &str| {
            caps.name(name)
                .map(|m| (m.start(), m.end()))
                .ok_or_else(|| Error::InvalidResourceId(s.to_string()))
        };

        let (_, type_end) = span("type")?;
        Ok(Self {
            raw: s.to_string(),
            type_end,
            agent: span("agent")?,
            attribute: span("attr")?,
        })
    }

    /// Build an id from its parts
    pub fn new(entity_type: &str, agent: &str, attribute: &str, value: &str) -> Result<Self> {
        Self::parse(&format!("{entity_type}[{agent},{attribute}={value}]"))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Fully qualified type of the resource, e.g. `std::File`
    pub fn entity_type(&self) -> &str {
        &self.raw[..self.type_end]
    }

    /// Name of the agent responsible for this resource
    pub fn agent_name(&self) -> &str {
        &self.raw[self.agent.0..self.agent.1]
    }

    /// Name of the identifying attribute
    pub fn attribute(&self) -> &str {
        &self.raw[self.attribute.0..self.attribute.1]
    }

    /// Value of the identifying attribute
    pub fn attribute_value(&self) -> &str {
        // value sits between "=" and the closing bracket
        &self.raw[self.attribute.1 + 1..self.raw.len() - 1]
    }

    /// Attach a version to this id
    pub fn with_version(&self, version: u64) -> ResourceVersionId {
        ResourceVersionId {
            id: self.clone(),
            version,
        }
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.raw)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A resource id pinned to a model version: `<ResourceId>,v=<version>`
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ResourceVersionId {
    pub id: ResourceId,
    pub version: u64,
}

impl ResourceVersionId {
    pub fn new(id: ResourceId, version: u64) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for ResourceVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{VERSION_SEPARATOR}{}", self.id, self.version)
    }
}

impl FromStr for ResourceVersionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidResourceVersionId(s.to_string());
        let (id, version) = s.rsplit_once(VERSION_SEPARATOR).ok_or_else(invalid)?;
        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let version = version.parse().map_err(|_| invalid())?;
        let id = ResourceId::parse(id).map_err(|_| invalid())?;
        Ok(Self { id, version })
    }
}

impl Serialize for ResourceVersionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceVersionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
