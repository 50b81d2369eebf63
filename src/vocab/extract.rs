//! Entity extraction from model replies and raw conversation text.
//!
//! Two strategies:
//!
//! - **Character scan** ([`scan_characters`]): every distinct code point in the
//!   CJK Unified Ideographs block (U+4E00..=U+9FFF), no metadata. Linear in the
//!   input, memory proportional to the distinct units found.
//! - **Structured blocks** ([`BlockGrammar`]): blocks of the form
//!
//!   ```text
//!   [東]
//!   Readings: とう, ひがし
//!   JLPT: N4
//!   Meaning: east, direction
//!   ```
//!
//!   Fields may also sit on one line. A block is the rest of the marker's
//!   line plus the unbroken run of field lines under it, so example sentences
//!   after a blank line never leak into it. A block needs a level and a
//!   meaning field; readings are optional. The field labels live in [`FieldLabels`] so
//!   the grammar can be localized without touching callers.
//!
//! Extraction never fails: text that matches nothing yields an empty vector.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::types::{ExtractedUnit, JlptLevel, Unit, UnitMetadata};

/// First code point of the CJK Unified Ideographs block.
pub const CJK_UNIFIED_FIRST: char = '\u{4E00}';
/// Last code point of the CJK Unified Ideographs block.
pub const CJK_UNIFIED_LAST: char = '\u{9FFF}';

/// Delimiters for reading and meaning lists: ASCII and full-width commas and
/// semicolons, plus the ideographic comma.
const LIST_DELIMITERS: &[char] = &[',', ';', '，', '；', '、'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CharacterScan,
    StructuredBlocks,
}

/// Run one extraction strategy over `text`.
pub fn extract(text: &str, strategy: Strategy) -> Vec<ExtractedUnit> {
    match strategy {
        Strategy::CharacterScan => scan_characters(text),
        Strategy::StructuredBlocks => BlockGrammar::standard().extract(text),
    }
}

pub fn is_core_ideograph(c: char) -> bool {
    (CJK_UNIFIED_FIRST..=CJK_UNIFIED_LAST).contains(&c)
}

/// Distinct core ideographs in order of first appearance.
pub fn scan_characters(text: &str) -> Vec<ExtractedUnit> {
    let mut seen = HashSet::new();
    text.chars()
        .filter(|c| is_core_ideograph(*c) && seen.insert(*c))
        .map(|c| ExtractedUnit::bare(Unit::from_char(c)))
        .collect()
}

/// Append `enrichment` units not already present in `primary`.
///
/// Used to layer character-scan results under structured ones so each unit is
/// observed once per call and keeps the richer metadata.
pub fn combine(mut primary: Vec<ExtractedUnit>, enrichment: Vec<ExtractedUnit>) -> Vec<ExtractedUnit> {
    let mut seen: HashSet<Unit> = primary.iter().map(|e| e.unit.clone()).collect();
    for extra in enrichment {
        if seen.insert(extra.unit.clone()) {
            primary.push(extra);
        }
    }
    primary
}

/// Regex fragments (alternatives, matched case-insensitively) naming each field.
#[derive(Debug, Clone)]
pub struct FieldLabels {
    pub readings: Vec<String>,
    pub level: Vec<String>,
    pub meaning: Vec<String>,
}

impl Default for FieldLabels {
    fn default() -> Self {
        let owned = |labels: &[&str]| labels.iter().map(|s| s.to_string()).collect();
        Self {
            readings: owned(&[r"readings?", r"on['’\-]?yomi", r"kun['’\-]?yomi", "音読み", "訓読み", "読み"]),
            level: owned(&[r"jlpt(?:\s+level)?", r"level", "レベル"]),
            meaning: owned(&[r"meanings?", "смысл", "значение", "意味"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Readings,
    Level,
    Meaning,
}

/// Compiled marker and field patterns for the structured-block strategy.
#[derive(Debug, Clone)]
pub struct BlockGrammar {
    marker: Regex,
    field: Regex,
}

static STANDARD_GRAMMAR: LazyLock<BlockGrammar> = LazyLock::new(|| {
    BlockGrammar::new(&FieldLabels::default()).expect("built-in field labels are valid regex")
});

impl BlockGrammar {
    pub fn new(labels: &FieldLabels) -> Result<Self, regex::Error> {
        // `[X]` or `【X】`; payloads up to 4 chars still delimit blocks so a
        // malformed marker cannot leak its fields into the previous block.
        let marker = Regex::new(r"\[([^\[\]\s]{1,4})\]|【([^【】\s]{1,4})】")?;
        let field = Regex::new(&format!(
            r"(?i)(?:^|[\s*_\-•・|(])(?:(?P<readings>{})|(?P<level>{})|(?P<meaning>{}))[*_]*\s*[:：]",
            labels.readings.join("|"),
            labels.level.join("|"),
            labels.meaning.join("|"),
        ))?;
        Ok(Self { marker, field })
    }

    /// The English/Japanese/Russian grammar used by the relay.
    pub fn standard() -> &'static BlockGrammar {
        &STANDARD_GRAMMAR
    }

    /// Extract every well-formed block. The first valid block for a unit wins.
    pub fn extract(&self, text: &str) -> Vec<ExtractedUnit> {
        let markers: Vec<(usize, usize, &str)> = self
            .marker
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let payload = caps.get(1).or_else(|| caps.get(2))?;
                Some((whole.start(), whole.end(), payload.as_str()))
            })
            .collect();

        let mut seen = HashSet::new();
        let mut units = Vec::new();

        for (i, &(_, body_start, payload)) in markers.iter().enumerate() {
            let body_end = markers.get(i + 1).map_or(text.len(), |next| next.0);
            let Some(unit) = marker_unit(payload) else {
                continue;
            };
            if seen.contains(&unit) {
                continue;
            }
            let block = self.block_extent(&text[body_start..body_end]);
            if let Some(metadata) = self.parse_block(block) {
                seen.insert(unit.clone());
                units.push(ExtractedUnit { unit, metadata });
            }
        }

        units
    }

    /// Trim `body` to the marker's own line plus the field lines below it.
    /// Blank lines directly under the marker are skipped; after that the first
    /// blank or field-less line ends the block.
    fn block_extent<'t>(&self, body: &'t str) -> &'t str {
        let mut lines = body.split_inclusive('\n');
        let Some(first) = lines.next() else {
            return body;
        };
        let mut end = first.len();
        let mut fields_started = self.field.is_match(first);

        for line in lines {
            let blank = line.trim().is_empty();
            if blank && !fields_started {
                end += line.len();
                continue;
            }
            if blank || !self.field.is_match(line) {
                break;
            }
            fields_started = true;
            end += line.len();
        }
        &body[..end]
    }

    fn parse_block(&self, block: &str) -> Option<UnitMetadata> {
        let fields: Vec<(FieldKind, usize, usize)> = self
            .field
            .captures_iter(block)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let kind = if caps.name("readings").is_some() {
                    FieldKind::Readings
                } else if caps.name("level").is_some() {
                    FieldKind::Level
                } else {
                    FieldKind::Meaning
                };
                Some((kind, whole.start(), whole.end()))
            })
            .collect();

        let mut readings = Vec::new();
        let mut level: Option<Option<JlptLevel>> = None;
        let mut meanings: Option<Vec<String>> = None;

        for (i, &(kind, _, value_start)) in fields.iter().enumerate() {
            let value_end = fields.get(i + 1).map_or(block.len(), |next| next.1);
            let value = field_value(&block[value_start..value_end]);

            match kind {
                FieldKind::Readings => {
                    for reading in split_list(value) {
                        if !readings.contains(&reading) {
                            readings.push(reading);
                        }
                    }
                }
                FieldKind::Level if level.is_none() => {
                    let tag = value.split_whitespace().next().unwrap_or_default();
                    level = Some(JlptLevel::parse_tag(tag).ok()?);
                }
                FieldKind::Meaning if meanings.is_none() => {
                    meanings = Some(split_list(value));
                }
                _ => {}
            }
        }

        let level = level?;
        let meanings = meanings.filter(|m| !m.is_empty())?;

        Some(UnitMetadata {
            readings,
            meanings,
            level,
        })
    }
}

/// A marker payload names a unit only if it is one core ideograph. Footnotes,
/// checkboxes and bracketed kana (`[1]`, `[x]`, `[は]`) are not units.
fn marker_unit(payload: &str) -> Option<Unit> {
    Unit::new(payload).ok()
}

/// A field's value runs to the end of its line or the next label.
fn field_value(raw: &str) -> &str {
    let line = raw.split(['\n', '\r']).next().unwrap_or_default();
    line.trim().trim_matches(|c| c == '*' || c == '_').trim()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(LIST_DELIMITERS)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
