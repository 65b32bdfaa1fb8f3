//! Projects source rows onto the canonical schema.

use crate::loader::RawTable;
use crate::schema::{CanonicalRecord, CanonicalSchema, Mapping, PLACEHOLDER};

/// Rename mapped columns to their canonical names and lay every row out in
/// canonical field order.
///
/// Fields nobody mapped get [`PLACEHOLDER`]; mapped but empty cells stay
/// empty strings. Mapping entries whose header is not in the table, or whose
/// target is not a canonical field, contribute nothing. If two headers target
/// the same field the later one wins.
pub fn normalize(schema: &CanonicalSchema, mapping: &Mapping, table: &RawTable) -> Vec<CanonicalRecord> {
    let mut sources: Vec<(&str, usize)> = Vec::new();
    for (header, field) in mapping.iter() {
        let Some(col) = table.column(header) else {
            continue;
        };
        if !schema.contains_field(field) {
            continue;
        }
        match sources.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = col,
            None => sources.push((field, col)),
        }
    }

    table
        .rows
        .iter()
        .map(|row| {
            schema
                .field_names()
                .map(|field| {
                    let value = match sources.iter().find(|(f, _)| *f == field) {
                        Some((_, col)) => row.get(*col).map(String::as_str).unwrap_or(""),
                        None => PLACEHOLDER,
                    };
                    (field, value)
                })
                .collect()
        })
        .collect()
}

/// Canonical fields for which no record carries a real value.
pub fn missing_fields(schema: &CanonicalSchema, records: &[CanonicalRecord]) -> Vec<String> {
    schema
        .field_names()
        .filter(|field| {
            !records
                .iter()
                .any(|r| r.get(field).map_or(false, |v| v != PLACEHOLDER))
        })
        .map(str::to_string)
        .collect()
}
