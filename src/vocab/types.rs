//! Vocabulary index types.
//!
//! [`Unit`] is the validated single-character key, [`UnitMetadata`] the payload
//! an extraction carries, and [`VocabularyUnit`] the persisted record.

use serde::{Deserialize, Serialize};

use super::extract::is_core_ideograph;
use crate::error::{RelayError, RelayResult};

/// JLPT proficiency tags. Absence (`None`) means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JlptLevel {
    N1,
    N2,
    N3,
    N4,
    N5,
}

impl JlptLevel {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::N1 => "N1",
            Self::N2 => "N2",
            Self::N3 => "N3",
            Self::N4 => "N4",
            Self::N5 => "N5",
        }
    }

    /// Parse a level tag case-insensitively.
    ///
    /// `Ok(None)` for an explicit unknown marker, `Err` for anything else.
    pub fn parse_tag(tag: &str) -> Result<Option<Self>, String> {
        let tag = tag.trim().trim_matches(|c: char| matches!(c, '*' | '(' | ')' | '.' | ','));
        match tag.to_ascii_uppercase().as_str() {
            "N1" => Ok(Some(Self::N1)),
            "N2" => Ok(Some(Self::N2)),
            "N3" => Ok(Some(Self::N3)),
            "N4" => Ok(Some(Self::N4)),
            "N5" => Ok(Some(Self::N5)),
            "UNKNOWN" | "N/A" | "NONE" | "-" | "?" => Ok(None),
            _ => Err(format!("unknown JLPT level: {tag}")),
        }
    }
}

impl std::fmt::Display for JlptLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JlptLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_tag(s)?.ok_or_else(|| format!("not a concrete JLPT level: {s}"))
    }
}

/// A single-character vocabulary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Unit(String);

impl Unit {
    /// Accepts exactly one core CJK ideograph; anything else (kana, punctuation,
    /// several code points) is [`RelayError::InvalidUnit`].
    pub fn new(text: &str) -> RelayResult<Self> {
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if is_core_ideograph(c) => Ok(Self(text.to_string())),
            _ => Err(RelayError::InvalidUnit(text.to_string())),
        }
    }

    /// Callers guarantee `c` is a core ideograph.
    pub(crate) fn from_char(c: char) -> Self {
        debug_assert!(is_core_ideograph(c));
        Self(c.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Unit {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> Self {
        unit.0
    }
}

/// Metadata one observation contributes. Empty vectors and `None` mean "not supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub readings: Vec<String>,
    pub meanings: Vec<String>,
    pub level: Option<JlptLevel>,
}

impl UnitMetadata {
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty() && self.meanings.is_empty() && self.level.is_none()
    }

    /// First-write-wins merge: each field of `self` that is empty takes the
    /// corresponding field of `incoming`; populated fields are never replaced.
    pub fn merge(mut self, incoming: &UnitMetadata) -> Self {
        if self.readings.is_empty() {
            self.readings = incoming.readings.clone();
        }
        if self.meanings.is_empty() {
            self.meanings = incoming.meanings.clone();
        }
        if self.level.is_none() {
            self.level = incoming.level;
        }
        self
    }
}

/// An extraction result: a unit and whatever metadata accompanied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedUnit {
    pub unit: Unit,
    pub metadata: UnitMetadata,
}

impl ExtractedUnit {
    pub fn bare(unit: Unit) -> Self {
        Self {
            unit,
            metadata: UnitMetadata::default(),
        }
    }
}

/// A persisted vocabulary record, matching the `vocabulary_units` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VocabularyUnit {
    /// UUID v7 primary key.
    pub id: String,
    /// Owning caller scope. Never echoed back to clients.
    #[serde(skip)]
    pub scope: String,
    #[serde(rename = "character")]
    pub unit: Unit,
    pub readings: Vec<String>,
    pub meanings: Vec<String>,
    #[serde(rename = "jlptLevel")]
    pub level: Option<JlptLevel>,
    /// Number of completed observations; starts at 1.
    pub occurrence_count: u64,
    /// Set on insert, never changed.
    pub first_seen_at: String,
    pub last_seen_at: String,
}
