//! Player statistics derived from canonical records.
//!
//! Pure functions, no async. Numeric fields are parsed leniently: anything
//! that is not a number (placeholders, blanks, "12*") becomes zero instead of
//! failing the row.

use serde::{Deserialize, Serialize};

use crate::schema::{CanonicalRecord, PLACEHOLDER};

/// One player's career line in the canonical cricket layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player_name: String,
    pub matches: i64,
    pub innings: i64,
    pub batting: BattingStats,
    pub bowling: BowlingStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattingStats {
    pub total_runs: i64,
    pub average: f64,
    pub highest_score: String,
    pub centuries: i64,
    pub half_centuries: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BowlingStats {
    pub wickets: i64,
    pub five_wickets: i64,
    pub best_bowling: String,
}

impl PlayerStats {
    pub fn from_record(record: &CanonicalRecord) -> Self {
        let text = |field: &str| record.get(field).unwrap_or("");
        Self {
            player_name: text_or(text("Player Name"), "Unknown"),
            matches: safe_int(text("Matches")),
            innings: safe_int(text("Innings")),
            batting: BattingStats {
                total_runs: safe_int(text("Total Runs")),
                average: safe_float(text("Average")),
                highest_score: text_or(text("Highest Score"), "0"),
                centuries: safe_int(text("Centuries")),
                half_centuries: safe_int(text("Half Centuries")),
            },
            bowling: BowlingStats {
                wickets: safe_int(text("Wickets")),
                five_wickets: safe_int(text("Fifers")),
                best_bowling: text_or(text("Best Bowling Figures"), "0/0"),
            },
        }
    }
}

pub fn derive_players(records: &[CanonicalRecord]) -> Vec<PlayerStats> {
    records.iter().map(PlayerStats::from_record).collect()
}

/// Integer value of a cell, or 0.
pub fn safe_int(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

/// Float value of a cell, or 0.0. Non-finite values count as unparseable.
pub fn safe_float(value: &str) -> f64 {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn text_or(value: &str, default: &str) -> String {
    let value = value.trim();
    if value.is_empty() || value == PLACEHOLDER {
        default.to_string()
    } else {
        value.to_string()
    }
}
