//! Structure description
//!
//! The Miniserver describes its project in a JSON document
//! (`data/LoxAPP3.json`). The engine only needs a sliver of it: the
//! last-modified timestamp, rooms and categories by identifier, and per
//! control the mapping from state names to state identifiers. Everything
//! else in the document is ignored on purpose.

pub mod controls;

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};

use crate::error::Result;
use crate::uuid::Uuid;

/// Timestamp format used throughout the structure file (Miniserver local
/// time).
pub(crate) const STRUCTURE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parsed structure description
#[derive(Debug, Clone, Deserialize)]
pub struct StructureFile {
    #[serde(rename = "lastModified", deserialize_with = "parse_timestamp")]
    last_modified: NaiveDateTime,

    #[serde(rename = "msInfo", default)]
    ms_info: MsInfo,

    #[serde(default)]
    rooms: HashMap<Uuid, Room>,

    #[serde(default)]
    cats: HashMap<Uuid, Category>,

    #[serde(default)]
    controls: HashMap<Uuid, ControlRecord>,
}

/// Project information block, minimal fields only
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MsInfo {
    #[serde(rename = "serialNr", default)]
    pub serial_nr: Option<String>,

    #[serde(rename = "msName", default)]
    pub ms_name: Option<String>,

    #[serde(rename = "projectName", default)]
    pub project_name: Option<String>,
}

/// Room entry
#[derive(Debug, Clone, Deserialize)]
pub struct Room {
    pub name: String,
}

/// Category entry
#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Control entry with its state-identifier map
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRecord {
    pub name: String,

    #[serde(rename = "type")]
    pub control_type: String,

    #[serde(default)]
    pub room: Option<Uuid>,

    #[serde(default)]
    pub cat: Option<Uuid>,

    /// State name → state identifier. Entries whose value is not a single
    /// identifier (some controls publish identifier arrays) are skipped.
    #[serde(default, deserialize_with = "lenient_states")]
    pub states: HashMap<String, Uuid>,

    #[serde(rename = "isSecured", default)]
    pub is_secured: bool,
}

impl StructureFile {
    /// Parse a structure description from its JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// When the project was last modified (Miniserver local time).
    pub fn last_modified(&self) -> NaiveDateTime {
        self.last_modified
    }

    pub fn ms_info(&self) -> &MsInfo {
        &self.ms_info
    }

    pub fn rooms(&self) -> &HashMap<Uuid, Room> {
        &self.rooms
    }

    pub fn categories(&self) -> &HashMap<Uuid, Category> {
        &self.cats
    }

    pub fn controls(&self) -> &HashMap<Uuid, ControlRecord> {
        &self.controls
    }

    pub fn room_name(&self, uuid: Uuid) -> Option<&str> {
        self.rooms.get(&uuid).map(|room| room.name.as_str())
    }

    pub fn category_name(&self, uuid: Uuid) -> Option<&str> {
        self.cats.get(&uuid).map(|cat| cat.name.as_str())
    }
}

fn parse_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<NaiveDateTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&raw, STRUCTURE_TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
}

fn lenient_states<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<HashMap<String, Uuid>, D::Error> {
    let raw: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| {
            let uuid = value.as_str()?.parse().ok()?;
            Some((name, uuid))
        })
        .collect())
}
