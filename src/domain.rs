use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

static ENTITY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[QP][0-9]+$").expect("entity id pattern is valid"));

static LANGUAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2,3}(-[a-z0-9]+)*$").expect("language pattern is valid")
});

pub const ENTITY_URI_PREFIX: &str = "http://www.wikidata.org/entity/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Item,
    Property,
}

/// Identifier of an item (`Q42`) or property (`P31`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> EntityKind {
        if self.0.starts_with('P') {
            EntityKind::Property
        } else {
            EntityKind::Item
        }
    }

    /// Accepts either a bare id or a full entity URI as returned by SPARQL bindings.
    pub fn from_uri(value: &str) -> Result<Self, HarvestError> {
        strip_entity_uri(value.trim()).parse()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !ENTITY_ID_RE.is_match(normalized) {
            return Err(HarvestError::InvalidEntityId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for EntityId {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

/// Strips the entity namespace from a SPARQL binding value; other values pass through.
pub fn strip_entity_uri(value: &str) -> &str {
    value.strip_prefix(ENTITY_URI_PREFIX).unwrap_or(value)
}

/// Joins identifiers the way `wbgetentities` expects them.
pub fn join_ids(ids: &[EntityId]) -> String {
    ids.iter()
        .map(EntityId::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language(String);

impl Language {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Language {
    fn default() -> Self {
        Self("en".to_string())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Language {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if !LANGUAGE_RE.is_match(&normalized) {
            return Err(HarvestError::InvalidLanguage(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Language {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.0
    }
}
