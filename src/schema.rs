//! Canonical schema registry and the processing types shared across the pipeline.
//!
//! The registry owns the ordered list of canonical fields and their aliases.
//! Everything downstream (matchers, normalizer, correction merger) reads it
//! through an `Arc<CanonicalSchema>` built once at startup.

use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Value written into a canonical column that no source header was mapped to.
pub const PLACEHOLDER: &str = "-";

/// Generate an ISO8601 UTC timestamp for the current time.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let (year, month, day) = civil_from_days(secs.div_euclid(86_400));
    let tod = secs.rem_euclid(86_400);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

// ============================================================================
// Canonical schema registry
// ============================================================================

/// One named slot in the target schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalField {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Ordered canonical fields plus the derived alias → field reverse lookup.
#[derive(Debug, Clone)]
pub struct CanonicalSchema {
    fields: Vec<CanonicalField>,
    /// Lower-cased alias and the index of its owning field, in registration order.
    aliases: Vec<(String, usize)>,
}

impl CanonicalSchema {
    /// Build a registry. Every field owns its own lower-cased name as an alias.
    /// An alias registered by more than one field stays with the first owner.
    pub fn new(fields: Vec<CanonicalField>) -> Result<Self> {
        if fields.is_empty() {
            anyhow::bail!("Canonical schema has no fields");
        }

        let mut seen_names = std::collections::HashSet::new();
        let mut owners: HashMap<String, usize> = HashMap::new();
        let mut aliases = Vec::new();

        for (idx, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                anyhow::bail!("Canonical field #{} has an empty name", idx + 1);
            }
            if !seen_names.insert(field.name.clone()) {
                anyhow::bail!("Duplicate canonical field: {}", field.name);
            }

            let own = std::iter::once(field.name.as_str()).chain(field.aliases.iter().map(String::as_str));
            for alias in own {
                let key = alias.trim().to_lowercase();
                if key.is_empty() {
                    continue;
                }
                match owners.get(&key) {
                    Some(&owner) if owner != idx => {
                        warn!(
                            "Alias '{}' of '{}' already owned by '{}', keeping first owner",
                            key, field.name, fields[owner].name
                        );
                    }
                    Some(_) => {}
                    None => {
                        owners.insert(key.clone(), idx);
                        aliases.push((key, idx));
                    }
                }
            }
        }

        Ok(Self { fields, aliases })
    }

    /// Load a registry from a JSON array of `{"name": .., "aliases": [..]}`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema: {:?}", path))?;
        let fields: Vec<CanonicalField> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse schema: {:?}", path))?;
        let schema = Self::new(fields)?;
        info!(
            "Loaded canonical schema from {:?}: {} fields, {} aliases",
            path,
            schema.fields.len(),
            schema.aliases.len()
        );
        Ok(schema)
    }

    /// The cricket statistics schema used when no schema file is configured.
    pub fn cricket() -> Self {
        let table: [(&str, &[&str]); 11] = [
            ("Player Name", &["p_name", "player", "name", "full_name", "player_name", "player_full_name", "player_full"]),
            ("Matches", &["mat", "match_count", "total_matches", "games", "total_games", "matches_played", "matches_count"]),
            ("Innings", &["inns", "innings_count", "played_innings", "total_innings", "innings_played"]),
            ("Total Runs", &["runs", "total_score", "r_total", "total_runs", "runs_scored", "total_runs_scored"]),
            ("Highest Score", &["hs", "max_score", "top_score", "highest", "highest_score"]),
            ("Average", &["ave", "bat_avg", "average_runs", "avg", "batting_average"]),
            ("Wickets", &["wkt", "wickets_taken", "total_wickets", "wicket_count"]),
            ("Centuries", &["100s", "centuries", "century", "100"]),
            ("Half Centuries", &["50s", "half_centuries", "50", "half_century", "fifty"]),
            ("Fifers", &["five_wkts", "5_wickets", "5", "fifer", "five_wicket_haul"]),
            ("Best Bowling Figures", &["bbf", "best_figures", "best_bowling", "best_bowling_figures", "best_bowling_figure"]),
        ];

        let fields = table
            .iter()
            .map(|(name, aliases)| CanonicalField {
                name: name.to_string(),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            })
            .collect();

        Self::new(fields).expect("built-in cricket schema is valid")
    }

    /// Canonical field names in canonical order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn fields(&self) -> &[CanonicalField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Every `(alias, owning field)` pair, in registration order.
    pub fn alias_table(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases
            .iter()
            .map(|(alias, idx)| (alias.as_str(), self.fields[*idx].name.as_str()))
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Owning canonical field of an alias (case-insensitive).
    pub fn owner_of(&self, alias: &str) -> Option<&str> {
        let key = alias.trim().to_lowercase();
        self.aliases
            .iter()
            .find(|(a, _)| *a == key)
            .map(|(_, idx)| self.fields[*idx].name.as_str())
    }

    /// Resolve a proposed target to a canonical field name: exact name first,
    /// then case-insensitive name, then alias ownership.
    pub fn resolve_field(&self, target: &str) -> Option<&str> {
        if let Some(field) = self.fields.iter().find(|f| f.name == target) {
            return Some(field.name.as_str());
        }
        let lowered = target.trim().to_lowercase();
        self.fields
            .iter()
            .find(|f| f.name.to_lowercase() == lowered)
            .map(|f| f.name.as_str())
            .or_else(|| self.owner_of(target))
    }

    pub fn contains_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

// ============================================================================
// Ordered string map
// ============================================================================

/// Insertion-ordered `String -> String` map that serializes as a JSON object.
///
/// Used both for header → canonical-field mappings and for canonical records,
/// where key order (source header order, canonical column order) is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMap {
    entries: Vec<(String, String)>,
}

/// Header → canonical field. At most one field per header.
pub type Mapping = StringMap;

/// One produced row: every canonical field name to a value or [`PLACEHOLDER`].
pub type CanonicalRecord = StringMap;

impl StringMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`, keeping its original position on overwrite.
    /// Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// First key whose value equals `value`.
    pub fn key_for(&self, value: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| v == value)
            .map(|(k, _)| k.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Distinct values in first-seen order.
    pub fn distinct_values(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for v in self.values() {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StringMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = StringMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for StringMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StringMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StringMapVisitor;

        impl<'de> Visitor<'de> for StringMapVisitor {
            type Value = StringMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StringMap, A::Error> {
                let mut map = StringMap::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(StringMapVisitor)
    }
}

// ============================================================================
// Processing summary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Accepted,
    Rejected,
    Partial,
}

/// Outcome of one processing pass over a file.
///
/// Summaries are never mutated once stored: every pass (automatic or
/// correction) produces a new one with `version` bumped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub source: String,
    pub version: u32,
    pub total_records: usize,
    pub accepted_records: usize,
    pub rejected_records: usize,
    pub matched_columns: Mapping,
    #[serde(default)]
    pub unmatched_columns: Vec<String>,
    #[serde(default)]
    pub missing_columns: Vec<String>,
    pub status: FileStatus,
    /// Name of the tier whose proposal became the resolved mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Free-text rationale returned by the resolving tier, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub processed_at: String,
}

impl ProcessingSummary {
    /// A rejected summary for a source that produced nothing usable.
    pub fn rejected(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version: 1,
            total_records: 0,
            accepted_records: 0,
            rejected_records: 0,
            matched_columns: Mapping::new(),
            unmatched_columns: Vec::new(),
            missing_columns: Vec::new(),
            status: FileStatus::Rejected,
            resolved_by: None,
            rationale: None,
            processed_at: now_iso8601(),
        }
    }

    /// Canonical fields covered by the mapping, in first-seen order.
    pub fn matched_fields(&self) -> Vec<&str> {
        self.matched_columns.distinct_values()
    }
}
