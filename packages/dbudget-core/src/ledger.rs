//! # Ledger
//!
//! The transaction ledger exchanged between devices. Each record is an
//! ordered list of string fields (account, amount, category, currency,
//! date, description, isIncome, lastUpdated, name, price). Sync never
//! looks inside a record; it only needs the ledger to serialize as a whole.
//!
//! On the wire and in storage a ledger is a JSON array of arrays:
//!
//! ```text
//! [["1","2024-01-01","food","lunch","10","1","","USD","t1","id1"], ...]
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One transaction: opaque ordered string fields
pub type Record = Vec<String>;

/// Ordered collection of transaction records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger(Vec<Record>);

impl Ledger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records
    pub fn from_records(records: Vec<Record>) -> Self {
        Self(records)
    }

    /// Records in order
    pub fn records(&self) -> &[Record] {
        &self.0
    }

    /// Consume into records
    pub fn into_records(self) -> Vec<Record> {
        self.0
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one record
    pub fn push(&mut self, record: Record) {
        self.0.push(record);
    }

    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Deserialize from JSON bytes that came out of a successful decrypt.
    /// Anything malformed here means the two ends disagree on format.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map(Self)
            .map_err(|e| Error::Corrupted(format!("ledger is not valid JSON: {}", e)))
    }

    /// Split into consecutive slices of at most `size` records. An empty
    /// ledger yields one empty batch so a sync always sends something.
    pub fn batches(&self, size: usize) -> Vec<Ledger> {
        if self.0.is_empty() || size == 0 {
            return vec![Ledger::new()];
        }
        self.0
            .chunks(size)
            .map(|slice| Ledger(slice.to_vec()))
            .collect()
    }

    /// Union merge: append every incoming record not already present
    /// verbatim. Returns how many were added.
    pub fn merge(&mut self, incoming: &Ledger) -> usize {
        let mut seen: HashSet<Record> = self.0.iter().cloned().collect();
        let mut added = 0;
        for record in &incoming.0 {
            if seen.insert(record.clone()) {
                self.0.push(record.clone());
                added += 1;
            }
        }
        added
    }
}

impl From<Vec<Record>> for Ledger {
    fn from(records: Vec<Record>) -> Self {
        Self(records)
    }
}

impl FromIterator<Record> for Ledger {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> Record {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_json_shape_is_array_of_arrays() {
        let ledger = Ledger::from_records(vec![record(&["1", "2024-01-01", "food"])]);
        let json = String::from_utf8(ledger.to_json_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"[["1","2024-01-01","food"]]"#);
    }

    #[test]
    fn test_json_round_trip() {
        let ledger = Ledger::from_records(vec![
            record(&["1", "2024-01-01", "food", "lunch", "10", "1", "", "USD", "t1", "id1"]),
            record(&["2", "2024-01-02", "rent", "", "900", "0", "", "EUR", "t2", "id2"]),
        ]);
        let decoded = Ledger::from_json_bytes(&ledger.to_json_bytes().unwrap()).unwrap();
        assert_eq!(decoded, ledger);
    }

    #[test]
    fn test_bad_json_is_corruption() {
        assert!(matches!(
            Ledger::from_json_bytes(b"{\"not\":\"a ledger\"}"),
            Err(Error::Corrupted(_))
        ));
        assert!(matches!(
            Ledger::from_json_bytes(b"[[1,2]]"),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_batches() {
        let ledger: Ledger = (0..2_500).map(|i| record(&[&i.to_string()])).collect();
        let batches = ledger.batches(1_000);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 1_000);
        assert_eq!(batches[2].len(), 500);
        assert_eq!(batches[2].records()[0], record(&["2000"]));
    }

    #[test]
    fn test_empty_ledger_single_batch() {
        let batches = Ledger::new().batches(1_000);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }

    #[test]
    fn test_merge_union() {
        let mut ours = Ledger::from_records(vec![record(&["a"]), record(&["b"])]);
        let theirs = Ledger::from_records(vec![record(&["b"]), record(&["c"]), record(&["c"])]);

        let added = ours.merge(&theirs);

        assert_eq!(added, 1);
        assert_eq!(
            ours,
            Ledger::from_records(vec![record(&["a"]), record(&["b"]), record(&["c"])])
        );
    }
}
