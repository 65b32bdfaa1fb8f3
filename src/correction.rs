//! Merging user-supplied column corrections into a file's history.
//!
//! A correction never edits a stored summary. It produces the next version
//! from the source table, the user's mapping and the latest prior summary.

use crate::loader::RawTable;
use crate::normalizer::{missing_fields, normalize};
use crate::schema::{
    now_iso8601, CanonicalRecord, CanonicalSchema, FileStatus, Mapping, ProcessingSummary, PLACEHOLDER,
};

/// Name recorded as the resolver of a user correction.
pub const USER_RESOLVER: &str = "user";

#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    pub summary: ProcessingSummary,
    pub records: Vec<CanonicalRecord>,
}

/// Apply `user_mapping` to `table` and derive the next summary.
///
/// The user's target field names are taken as given. Only mapping entries
/// whose header exists in the source take part in the projection.
///
/// Without a prior summary, the recorded mapping is the user's mapping as
/// submitted, a user-mapped header is unmatched when its field came out with
/// no value in any row, and the file is accepted only if there are no such
/// headers. With a prior summary, unmatched headers accumulate:
/// the prior list plus every source header the user left unmapped, and the
/// file is accepted as soon as anything is mapped.
pub fn merge_correction(
    schema: &CanonicalSchema,
    source: &str,
    table: &RawTable,
    user_mapping: &Mapping,
    prior: Option<&ProcessingSummary>,
) -> CorrectionOutcome {
    let effective: Mapping = user_mapping
        .iter()
        .filter(|(header, _)| table.column(header).is_some())
        .collect();

    let records = normalize(schema, &effective, table);
    let total = records.len();

    let (matched, unmatched, status, version) = match prior {
        None => {
            let unmatched: Vec<String> = if records.is_empty() {
                Vec::new()
            } else {
                user_mapping
                    .iter()
                    .filter(|(_, field)| !produced_value(&records, field))
                    .map(|(header, _)| header.to_string())
                    .collect()
            };
            let status = if unmatched.is_empty() {
                FileStatus::Accepted
            } else {
                FileStatus::Partial
            };
            (user_mapping.clone(), unmatched, status, 1)
        }
        Some(prior) => {
            let mut unmatched = prior.unmatched_columns.clone();
            for header in &table.headers {
                if !effective.contains_key(header) && !unmatched.contains(header) {
                    unmatched.push(header.clone());
                }
            }
            let status = if effective.is_empty() {
                FileStatus::Partial
            } else {
                FileStatus::Accepted
            };
            (effective, unmatched, status, prior.version + 1)
        }
    };

    let summary = ProcessingSummary {
        source: source.to_string(),
        version,
        total_records: total,
        accepted_records: total,
        rejected_records: 0,
        matched_columns: matched,
        unmatched_columns: unmatched,
        missing_columns: missing_fields(schema, &records),
        status,
        resolved_by: Some(USER_RESOLVER.to_string()),
        rationale: None,
        processed_at: now_iso8601(),
    };

    CorrectionOutcome { summary, records }
}

fn produced_value(records: &[CanonicalRecord], field: &str) -> bool {
    records
        .iter()
        .any(|r| r.get(field).map_or(false, |v| v != PLACEHOLDER))
}
