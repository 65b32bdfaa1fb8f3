//! Pluggable column matching tiers.
//!
//! Defines the [`MappingTier`] trait so the reconciler can run embedding,
//! generative and fuzzy matching in any configured order without special
//! casing any of them.

pub mod embedding;
pub mod fuzzy;
pub mod generative;

use crate::loader::RawTable;
use crate::schema::Mapping;

/// A tier's answer: header → canonical field pairs plus the headers it could
/// not place. `summary` carries the tier's rationale when it has one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierProposal {
    pub matched: Mapping,
    pub unmatched: Vec<String>,
    pub summary: Option<String>,
}

/// Async trait implemented by each matching strategy.
///
/// `Err` means the tier failed as a whole and the next tier should run. A
/// proposal that places no header is still a successful answer.
#[async_trait::async_trait]
pub trait MappingTier: Send + Sync {
    fn name(&self) -> &str;
    async fn propose(&self, table: &RawTable) -> anyhow::Result<TierProposal>;
}

/// Render the header row and up to `max_rows` data rows as a pipe table.
pub fn render_sample(table: &RawTable, max_rows: usize) -> String {
    let mut out = format!("| {} |\n", table.headers.join(" | "));
    out.push_str(&format!(
        "|{}|\n",
        table
            .headers
            .iter()
            .map(|h| "-".repeat(h.len().max(3) + 2))
            .collect::<Vec<_>>()
            .join("|")
    ));

    let row_limit = max_rows.min(table.rows.len());
    for row in &table.rows[..row_limit] {
        out.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    if table.rows.len() > row_limit {
        out.push_str(&format!("... ({} more rows)\n", table.rows.len() - row_limit));
    }
    out
}
