//! Record extraction from semi-structured "label: value" text.
//!
//! Documents carry no delimiters between entities, so the only boundary
//! signal is key repetition: when a label shows up a second time inside the
//! open record, that record is closed and a new one starts with this line.
//!
//! Pure functions, no I/O.

use crate::loader::RawTable;
use std::collections::HashSet;

/// Label / value separator.
const SEPARATOR: char = ':';

/// One extracted block: labels in first-seen order with their values.
pub type KvRecord = Vec<(String, String)>;

/// Split a flat sequence of lines into records.
///
/// Lines without a separator, and lines whose label or value is empty after
/// trimming, are skipped without touching the extractor state.
pub fn extract_records<I, S>(lines: I) -> Vec<KvRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut records = Vec::new();
    let mut open: KvRecord = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for line in lines {
        let Some((label, value)) = split_line(line.as_ref()) else {
            continue;
        };

        if seen.contains(label) {
            if !open.is_empty() {
                records.push(std::mem::take(&mut open));
            }
            seen.clear();
        }

        match open.iter_mut().find(|(l, _)| l == label) {
            Some((_, v)) => *v = value.to_string(),
            None => open.push((label.to_string(), value.to_string())),
        }
        seen.insert(label.to_string());
    }

    if !open.is_empty() {
        records.push(open);
    }

    records
}

/// Split on the first separator and trim both sides. `None` unless both
/// label and value are non-empty.
fn split_line(line: &str) -> Option<(&str, &str)> {
    let (label, value) = line.split_once(SEPARATOR)?;
    let (label, value) = (label.trim(), value.trim());
    if label.is_empty() || value.is_empty() {
        return None;
    }
    Some((label, value))
}

/// Assemble extracted records into a table. Headers are the union of labels
/// in first-seen order; a record without a label gets an empty cell.
pub fn records_to_table(name: &str, records: &[KvRecord]) -> RawTable {
    let mut headers: Vec<String> = Vec::new();
    for record in records {
        for (label, _) in record {
            if !headers.iter().any(|h| h == label) {
                headers.push(label.clone());
            }
        }
    }

    let rows = records
        .iter()
        .map(|record| {
            headers
                .iter()
                .map(|h| {
                    record
                        .iter()
                        .find(|(l, _)| l == h)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    RawTable {
        name: name.to_string(),
        headers,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(pairs: &[(&str, &str)]) -> KvRecord {
        pairs.iter().map(|(l, v)| (l.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_key_repetition_starts_new_record() {
        let records = extract_records(["Name: A", "Runs: 1", "Name: B", "Runs: 2"]);
        assert_eq!(
            records,
            vec![rec(&[("Name", "A"), ("Runs", "1")]), rec(&[("Name", "B"), ("Runs", "2")])]
        );
    }

    #[test]
    fn test_splits_on_first_separator_and_trims() {
        let records = extract_records(["  Best Bowling :  5/23 : innings ", "Time: 10:30"]);
        assert_eq!(
            records,
            vec![rec(&[("Best Bowling", "5/23 : innings"), ("Time", "10:30")])]
        );
    }

    #[test]
    fn test_skips_blank_and_separatorless_lines() {
        let records = extract_records([
            "Career summary",
            "",
            "Name: Virat Kohli",
            "Matches:",
            ": orphan",
            "Runs: 8676",
        ]);
        assert_eq!(records, vec![rec(&[("Name", "Virat Kohli"), ("Runs", "8676")])]);
    }

    #[test]
    fn test_empty_value_does_not_trigger_boundary() {
        let records = extract_records(["Name: A", "Name:", "Runs: 1"]);
        assert_eq!(records, vec![rec(&[("Name", "A"), ("Runs", "1")])]);
    }

    #[test]
    fn test_records_need_not_share_labels() {
        let records = extract_records(["Name: A", "Runs: 1", "Name: B", "Wickets: 3"]);
        let table = records_to_table("doc", &records);
        assert_eq!(table.headers, vec!["Name", "Runs", "Wickets"]);
        assert_eq!(table.rows[0], vec!["A", "1", ""]);
        assert_eq!(table.rows[1], vec!["B", "", "3"]);
    }

    #[test]
    fn test_no_lines_yields_no_records() {
        let records = extract_records(Vec::<String>::new());
        assert!(records.is_empty());
        let table = records_to_table("empty", &records);
        assert!(table.headers.is_empty());
        assert!(table.rows.is_empty());
    }

    proptest! {
        #[test]
        fn test_lines_without_separator_yield_nothing(
            lines in proptest::collection::vec("[^:]{0,30}", 0..20)
        ) {
            prop_assert!(extract_records(&lines).is_empty());
        }

        #[test]
        fn test_every_record_has_unique_labels(
            pairs in proptest::collection::vec(("[a-c]", "[0-9]{1,3}"), 0..30)
        ) {
            let lines: Vec<String> = pairs.iter().map(|(l, v)| format!("{}: {}", l, v)).collect();
            let records = extract_records(&lines);
            let total: usize = records.iter().map(|r| r.len()).sum();
            prop_assert_eq!(total, pairs.len());
            for record in &records {
                let labels: HashSet<&String> = record.iter().map(|(l, _)| l).collect();
                prop_assert_eq!(labels.len(), record.len());
            }
        }
    }
}
