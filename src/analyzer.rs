//! End-to-end processing of one stored file: load, reconcile, normalize.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::correction::{merge_correction, CorrectionOutcome};
use crate::error::ProcessingError;
use crate::loader::{self, RawTable};
use crate::normalizer::{missing_fields, normalize};
use crate::reconciler::{Reconciler, TierAttempt};
use crate::schema::{CanonicalRecord, CanonicalSchema, Mapping, ProcessingSummary};

/// Everything an automatic pass produced for one file.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub table: RawTable,
    pub mapping: Mapping,
    pub summary: ProcessingSummary,
    pub records: Vec<CanonicalRecord>,
    pub attempts: Vec<TierAttempt>,
}

pub struct Analyzer {
    schema: Arc<CanonicalSchema>,
    reconciler: Reconciler,
}

impl Analyzer {
    pub fn new(schema: Arc<CanonicalSchema>, reconciler: Reconciler) -> Self {
        Self { schema, reconciler }
    }

    pub fn schema(&self) -> &CanonicalSchema {
        &self.schema
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.reconciler.tier_names()
    }

    /// Automatic pass over a stored file. `source` is the name shown to users.
    pub async fn analyze(&self, path: &Path, source: &str) -> Result<Analysis, ProcessingError> {
        let table = loader::load_source(path)?;
        info!(
            "{}: loaded {} rows x {} columns",
            source,
            table.row_count(),
            table.headers.len()
        );
        if table.is_empty() {
            warn!("{}: source produced no usable rows", source);
        }

        let reconciliation = self.reconciler.reconcile(source, &table).await;
        let records = normalize(&self.schema, &reconciliation.mapping, &table);

        let mut summary = reconciliation.summary;
        summary.missing_columns = missing_fields(&self.schema, &records);

        Ok(Analysis {
            table,
            mapping: reconciliation.mapping,
            summary,
            records,
            attempts: reconciliation.attempts,
        })
    }

    /// Re-read a stored file and apply a user's mapping on top of `prior`.
    pub fn correct(
        &self,
        path: &Path,
        source: &str,
        user_mapping: &Mapping,
        prior: Option<&ProcessingSummary>,
    ) -> Result<CorrectionOutcome, ProcessingError> {
        let table = loader::load_source(path)?;
        let outcome = merge_correction(&self.schema, source, &table, user_mapping, prior);
        info!(
            "{}: correction applied, {} fields mapped, status {:?}",
            source,
            outcome.summary.matched_fields().len(),
            outcome.summary.status
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconcileConfig, TierKind};
    use crate::matchers::embedding::HashedNgramEncoder;
    use crate::reconciler::build_tiers;
    use crate::schema::{FileStatus, PLACEHOLDER};
    use std::io::Write;

    fn analyzer() -> Analyzer {
        let schema = Arc::new(CanonicalSchema::cricket());
        let config = ReconcileConfig {
            tier_order: vec![TierKind::Fuzzy],
            ..ReconcileConfig::default()
        };
        let encoder = Arc::new(HashedNgramEncoder::new(64).unwrap());
        let tiers = build_tiers(&schema, &config, None, encoder);
        Analyzer::new(schema.clone(), Reconciler::new(schema, tiers, config))
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_short_csv_is_rejected_but_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "stats.csv", "p_name,runs,mat\nA,120,10\nB,45,7\nC,0,1\n");

        let analysis = analyzer().analyze(&path, "stats.csv").await.unwrap();
        assert_eq!(analysis.summary.status, FileStatus::Rejected);
        assert_eq!(analysis.summary.total_records, 3);
        assert_eq!(analysis.summary.accepted_records, 0);
        assert_eq!(analysis.summary.rejected_records, 3);
        assert_eq!(analysis.records[0].get("Player Name"), Some("A"));
        assert_eq!(analysis.records[0].get("Wickets"), Some(PLACEHOLDER));
        assert!(analysis.summary.missing_columns.contains(&"Wickets".to_string()));
        assert!(!analysis.summary.missing_columns.contains(&"Total Runs".to_string()));
    }

    #[tokio::test]
    async fn test_full_csv_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "full.csv",
            "player,mat,inns,runs,hs,ave,wkt\nA,10,12,500,120,45.5,3\nB,8,8,200,70,25.0,10\n",
        );
        let analysis = analyzer().analyze(&path, "full.csv").await.unwrap();
        assert_eq!(analysis.summary.status, FileStatus::Accepted);
        assert_eq!(analysis.summary.accepted_records, 2);
        assert_eq!(analysis.summary.matched_fields().len(), 7);
    }

    #[tokio::test]
    async fn test_key_value_text_is_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "card.txt",
            "Player: A\nRuns: 120\nPlayer: B\nRuns: 45\n",
        );
        let analysis = analyzer().analyze(&path, "card.txt").await.unwrap();
        assert_eq!(analysis.table.headers, vec!["Player".to_string(), "Runs".to_string()]);
        assert_eq!(analysis.summary.total_records, 2);
        assert_eq!(analysis.records[1].get("Total Runs"), Some("45"));
    }

    #[test]
    fn test_correct_rereads_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "stats.csv", "p_name,runs,mat\nA,120,10\n");
        let user: Mapping = [("p_name", "Player Name"), ("runs", "Total Runs"), ("mat", "Matches")]
            .into_iter()
            .collect();
        let outcome = analyzer().correct(&path, "stats.csv", &user, None).unwrap();
        assert_eq!(outcome.summary.status, FileStatus::Accepted);
        assert_eq!(outcome.records[0].get("Matches"), Some("10"));
    }
}
