//! Board hierarchy as seen on the wire.
//!
//! ```text
//! Board ──owns──► List ──owns──► Note
//!   id              id             id
//!   title           board_id       list_id
//!                   title          text, raw, min
//!                   order          order
//! ```
//!
//! Ids travel as JSON strings so that 64-bit values survive JavaScript
//! clients. Binary formats (the RocksDB records) keep them as plain `u64`.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Relative position of a sibling under its parent (1 = head).
pub type Position = u64;

/// Server-assigned entity identifier.
///
/// `0` is reserved: it means "unset" in optional fields and doubles as the
/// head sentinel for anchor-based note moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl EntityId {
    /// The reserved "unset" id.
    pub const NONE: EntityId = EntityId(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn is_some(&self) -> bool {
        self.0 != 0
    }

    /// `None` for the reserved id, `Some(self)` otherwise.
    pub fn non_zero(self) -> Option<EntityId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        EntityId(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(EntityId::NONE);
        }
        trimmed.parse::<u64>().map(EntityId)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(&self.0)
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(EntityIdVisitor)
        } else {
            u64::deserialize(deserializer).map(EntityId)
        }
    }
}

/// Accepts `"42"` as well as a bare `42`.
struct EntityIdVisitor;

impl<'de> Visitor<'de> for EntityIdVisitor {
    type Value = EntityId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an entity id as a decimal string or unsigned integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(EntityId(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(EntityId)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(EntityId::NONE)
    }
}

/// A board. `lists` is only populated for `BOARD` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: EntityId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lists: Vec<List>,
}

/// A list on a board. `notes` is only populated for `BOARD` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: EntityId,
    pub board_id: EntityId,
    pub title: String,
    #[serde(rename = "order", default)]
    pub position: Position,
    #[serde(default)]
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: EntityId,
    pub list_id: EntityId,
    #[serde(rename = "min", default)]
    pub minimized: bool,
    #[serde(default)]
    pub raw: bool,
    pub text: String,
    #[serde(rename = "order", default)]
    pub position: Position,
}
