//! Last-resort tier: edit-distance closeness against the alias table.
//!
//! Deterministic and local. For a fixed alias table and cutoff the same
//! headers always produce the same mapping.

use super::{MappingTier, TierProposal};
use crate::loader::RawTable;
use crate::schema::{CanonicalSchema, Mapping};
use std::sync::Arc;
use strsim::normalized_levenshtein;
use tracing::debug;

pub struct FuzzyTier {
    schema: Arc<CanonicalSchema>,
    cutoff: f64,
}

impl FuzzyTier {
    pub fn new(schema: Arc<CanonicalSchema>, cutoff: f64) -> Self {
        Self { schema, cutoff }
    }

    /// Closest alias to a lower-cased header, if it clears the cutoff.
    /// Ties go to the alias registered first.
    pub fn closest_alias(&self, header: &str) -> Option<(&str, f64)> {
        let needle = header.trim().to_lowercase();
        let mut best: Option<(&str, f64)> = None;
        for (alias, _) in self.schema.alias_table() {
            let score = normalized_levenshtein(&needle, alias);
            if score >= self.cutoff && best.map_or(true, |(_, s)| score > s) {
                best = Some((alias, score));
            }
        }
        best
    }

    pub fn match_headers(&self, headers: &[String]) -> TierProposal {
        let mut matched = Mapping::new();
        let mut unmatched = Vec::new();

        for header in headers {
            let owner = self
                .closest_alias(header)
                .and_then(|(alias, score)| {
                    debug!("Fuzzy: '{}' ~ '{}' ({:.2})", header, alias, score);
                    self.schema.owner_of(alias)
                });
            match owner {
                Some(field) => {
                    matched.insert(header.clone(), field);
                }
                None => unmatched.push(header.clone()),
            }
        }

        TierProposal {
            matched,
            unmatched,
            summary: None,
        }
    }
}

#[async_trait::async_trait]
impl MappingTier for FuzzyTier {
    fn name(&self) -> &str {
        "fuzzy"
    }

    async fn propose(&self, table: &RawTable) -> anyhow::Result<TierProposal> {
        Ok(self.match_headers(&table.headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tier() -> FuzzyTier {
        FuzzyTier::new(Arc::new(CanonicalSchema::cricket()), 0.7)
    }

    fn headers(hs: &[&str]) -> Vec<String> {
        hs.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_exact_aliases_match() {
        let proposal = tier().match_headers(&headers(&["p_name", "runs", "mat"]));
        assert_eq!(proposal.matched.get("p_name"), Some("Player Name"));
        assert_eq!(proposal.matched.get("runs"), Some("Total Runs"));
        assert_eq!(proposal.matched.get("mat"), Some("Matches"));
        assert!(proposal.unmatched.is_empty());
    }

    #[test]
    fn test_case_and_small_typos() {
        let proposal = tier().match_headers(&headers(&["Player_Name", "Wickets_Takn", "Batting_Averag"]));
        assert_eq!(proposal.matched.get("Player_Name"), Some("Player Name"));
        assert_eq!(proposal.matched.get("Wickets_Takn"), Some("Wickets"));
        assert_eq!(proposal.matched.get("Batting_Averag"), Some("Average"));
    }

    #[test]
    fn test_unrelated_header_unmatched() {
        let proposal = tier().match_headers(&headers(&["strike_rate", "team"]));
        assert!(proposal.matched.is_empty());
        assert_eq!(proposal.unmatched, headers(&["strike_rate", "team"]));
    }

    #[test]
    fn test_canonical_names_match_themselves() {
        let t = tier();
        let names: Vec<String> = t.schema.field_names().map(str::to_string).collect();
        let proposal = t.match_headers(&names);
        for name in &names {
            assert_eq!(proposal.matched.get(name), Some(name.as_str()));
        }
    }

    proptest! {
        #[test]
        fn test_fuzzy_is_deterministic(hs in proptest::collection::vec("[a-z_ 0-9]{1,16}", 0..8)) {
            let t = tier();
            let first = t.match_headers(&hs);
            let second = t.match_headers(&hs);
            prop_assert_eq!(first, second);
        }
    }
}
