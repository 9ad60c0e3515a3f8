use std::collections::HashMap;

use google_cloud_rust_raw::bigtable::v2::bigtable::ReadRowsResponse_CellChunk as CellChunk;

use crate::cell::Cell;
use crate::error::BigtableError;
use crate::mutation::Timestamp;
use crate::row::Row;
use crate::{FamilyId, Qualifier, RowKey};

/// List of the potential states when we are reading each value from the
/// returned stream and composing a "row"
#[derive(Clone, Debug, Default, Eq, PartialEq)]
enum ReadState {
    #[default]
    RowStart,
    CellStart,
    CellInProgress,
    CellComplete,
    RowComplete,
}

/// An in-progress cell. The value may arrive split across several chunks.
#[derive(Clone, Debug, Default)]
struct PartialCell {
    family: FamilyId,
    qualifier: Qualifier,
    timestamp: Timestamp,
    labels: Vec<String>,
    value: Vec<u8>,
    /// bytes of a split value received so far
    value_index: usize,
}

/// An in-progress row.
#[derive(Clone, Debug, Default)]
struct PartialRow {
    row_key: RowKey,
    /// finished cells, grouped by family, in server order
    cells: HashMap<FamilyId, Vec<Cell>>,
    /// the last family id we encountered; omitted on later chunks until it
    /// changes
    last_family: Option<FamilyId>,
    /// the last column name we encountered; ditto
    last_qualifier: Option<Qualifier>,
}

/// Workhorse struct: reassembles the stream's cell chunks into whole rows,
/// enforcing the chunk framing invariants as it goes.
#[derive(Debug, Default)]
pub(crate) struct RowMerger {
    /// The current state. State progresses while processing a single chunk.
    state: ReadState,
    /// Key order is descending instead of ascending.
    reversed: bool,
    /// The last row key committed or scanned past, for monotonicity checks
    /// and for resuming a broken stream.
    last_seen_row_key: Option<RowKey>,
    /// The row that is currently being compiled.
    row: PartialRow,
    /// Any cell that may be in progress (chunked across multiple portions)
    cell: PartialCell,
}

impl RowMerger {
    pub fn new(reversed: bool) -> Self {
        Self {
            reversed,
            ..Default::default()
        }
    }

    /// The resume point: the last key this stream got past, whether or not a
    /// row was delivered for it.
    pub fn last_seen(&self) -> Option<&RowKey> {
        self.last_seen_row_key.as_ref()
    }

    /// Server progress marker: no row delivered, but everything up to `key`
    /// (down to, when reversed) has been scanned. Non-advancing markers are
    /// ignored.
    pub fn mark_last_scanned(&mut self, key: RowKey) {
        let advances = match &self.last_seen_row_key {
            None => true,
            Some(last) => {
                if self.reversed {
                    key < *last
                } else {
                    key > *last
                }
            }
        };
        if advances {
            self.last_seen_row_key = Some(key);
        }
    }

    /// Feed one chunk. Returns a finished row on `commit_row`.
    pub fn merge_chunk(&mut self, mut chunk: CellChunk) -> Result<Option<Row>, BigtableError> {
        if chunk.get_reset_row() {
            self.reset_row(chunk)?;
            return Ok(None);
        }
        // Each state feeds the same chunk into the next state.
        if self.state == ReadState::RowStart {
            self.row_start(&mut chunk)?;
        }
        if self.state == ReadState::CellStart {
            self.cell_start(&mut chunk)?;
        }
        if self.state == ReadState::CellInProgress {
            self.cell_in_progress(&mut chunk)?;
        }
        if self.state == ReadState::CellComplete {
            self.cell_complete(&chunk)?;
        }
        if self.state == ReadState::RowComplete {
            return Ok(Some(self.row_complete()?));
        }
        if chunk.has_commit_row() {
            return Err(BigtableError::InvalidChunk(format!(
                "Chunk tried to commit row in state {:?}",
                self.state
            )));
        }
        Ok(None)
    }

    /// Wrap up: at stream EOF the reader must not be holding a partial row.
    pub fn finalize(&self) -> Result<(), BigtableError> {
        if self.state != ReadState::RowStart {
            return Err(BigtableError::InvalidChunk(
                "Stream ended with a partial row".to_owned(),
            ));
        }
        Ok(())
    }

    /// Discard data so far and return to a neutral state.
    fn reset_row(&mut self, chunk: CellChunk) -> Result<(), BigtableError> {
        if self.state == ReadState::RowStart {
            return Err(BigtableError::InvalidChunk("Bare reset".to_owned()));
        }
        if !chunk.row_key.is_empty() {
            return Err(BigtableError::InvalidChunk(
                "Reset chunk has a row key".to_owned(),
            ));
        }
        if chunk.has_family_name() {
            return Err(BigtableError::InvalidChunk(
                "Reset chunk has a family_name".to_owned(),
            ));
        }
        if chunk.has_qualifier() {
            return Err(BigtableError::InvalidChunk(
                "Reset chunk has a qualifier".to_owned(),
            ));
        }
        if chunk.timestamp_micros > 0 {
            return Err(BigtableError::InvalidChunk(
                "Reset chunk has a timestamp".to_owned(),
            ));
        }
        if !chunk.get_labels().is_empty() {
            return Err(BigtableError::InvalidChunk(
                "Reset chunk has labels".to_owned(),
            ));
        }
        if !chunk.value.is_empty() || chunk.value_size != 0 {
            return Err(BigtableError::InvalidChunk(
                "Reset chunk has value".to_owned(),
            ));
        }

        trace!("🧩 resetting row");
        self.state = ReadState::RowStart;
        self.row = PartialRow::default();
        self.cell = PartialCell::default();
        Ok(())
    }

    /// The first chunk of a row carries its key; the key must advance in the
    /// scan direction.
    fn row_start(&mut self, chunk: &mut CellChunk) -> Result<(), BigtableError> {
        if chunk.row_key.is_empty() {
            return Err(BigtableError::InvalidChunk(
                "New row is missing a row key".to_owned(),
            ));
        }
        if let Some(last) = &self.last_seen_row_key {
            let out_of_order = if self.reversed {
                chunk.row_key >= *last
            } else {
                chunk.row_key <= *last
            };
            if out_of_order {
                return Err(BigtableError::InvalidChunk(
                    "Out of order row keys".to_owned(),
                ));
            }
        }

        self.row = PartialRow {
            row_key: chunk.row_key.clone(),
            ..Default::default()
        };
        self.cell = PartialCell::default();
        self.state = ReadState::CellStart;
        Ok(())
    }

    /// Start a new cell: resolve the family and qualifier (repeated only
    /// when they change) and begin collecting the value.
    fn cell_start(&mut self, chunk: &mut CellChunk) -> Result<(), BigtableError> {
        if !chunk.row_key.is_empty() && chunk.row_key != self.row.row_key {
            return Err(BigtableError::InvalidChunk(
                "Row key changed mid row".to_owned(),
            ));
        }

        if chunk.has_family_name() {
            // A new family resets the column; the chunk must name one.
            if !chunk.has_qualifier() {
                return Err(BigtableError::InvalidChunk(
                    "Family change without a qualifier".to_owned(),
                ));
            }
            self.row.last_family = Some(chunk.take_family_name().take_value());
        }
        self.cell.family = match &self.row.last_family {
            Some(family) => family.clone(),
            None => {
                return Err(BigtableError::InvalidChunk(
                    "Cell missing family for new cell".to_owned(),
                ))
            }
        };

        if chunk.has_qualifier() {
            self.row.last_qualifier = Some(chunk.take_qualifier().take_value());
        }
        self.cell.qualifier = match &self.row.last_qualifier {
            Some(qualifier) => qualifier.clone(),
            None => {
                return Err(BigtableError::InvalidChunk(
                    "Cell missing qualifier for new cell".to_owned(),
                ))
            }
        };

        self.cell.timestamp = Timestamp(chunk.timestamp_micros);
        self.cell.labels = chunk.take_labels().into_vec();
        self.cell.value_index = 0;

        if chunk.value_size > 0 {
            // A split value: pre-allocate and let cell_in_progress collect
            // the fragments, this chunk's included.
            if chunk.has_commit_row() {
                return Err(BigtableError::InvalidChunk(
                    "Chunk with a partial value tried to commit".to_owned(),
                ));
            }
            self.cell.value = Vec::with_capacity(chunk.value_size as usize);
            self.state = ReadState::CellInProgress;
        } else {
            self.cell.value = chunk.take_value();
            self.state = ReadState::CellComplete;
        }
        Ok(())
    }

    /// Continue a split value. Cell data may exceed a chunk's max size, so
    /// fragments keep arriving until one carries `value_size == 0`.
    fn cell_in_progress(&mut self, chunk: &mut CellChunk) -> Result<(), BigtableError> {
        // Quick gauntlet to ensure this really is a continuation.
        if self.cell.value_index > 0 {
            if !chunk.row_key.is_empty() {
                return Err(BigtableError::InvalidChunk(
                    "Found row key mid cell".to_owned(),
                ));
            }
            if chunk.has_family_name() {
                return Err(BigtableError::InvalidChunk(
                    "Found family name mid cell".to_owned(),
                ));
            }
            if chunk.has_qualifier() {
                return Err(BigtableError::InvalidChunk(
                    "Found qualifier mid cell".to_owned(),
                ));
            }
            if chunk.get_timestamp_micros() > 0 {
                return Err(BigtableError::InvalidChunk(
                    "Found timestamp mid cell".to_owned(),
                ));
            }
            if !chunk.get_labels().is_empty() {
                return Err(BigtableError::InvalidChunk(
                    "Found labels mid cell".to_owned(),
                ));
            }
        }
        if chunk.value_size > 0 && chunk.has_commit_row() {
            return Err(BigtableError::InvalidChunk(
                "Chunk with a partial value tried to commit".to_owned(),
            ));
        }

        let mut value = chunk.take_value();
        self.cell.value_index += value.len();
        self.cell.value.append(&mut value);

        // The final fragment of a split value carries value_size == 0.
        self.state = if chunk.value_size > 0 {
            ReadState::CellInProgress
        } else {
            ReadState::CellComplete
        };
        Ok(())
    }

    /// Wrap up a cell that's been in progress and file it under its family.
    fn cell_complete(&mut self, chunk: &CellChunk) -> Result<(), BigtableError> {
        let finished = std::mem::take(&mut self.cell);
        self.row
            .cells
            .entry(finished.family.clone())
            .or_default()
            .push(Cell {
                family: finished.family,
                qualifier: finished.qualifier,
                value: finished.value,
                timestamp: finished.timestamp,
                labels: finished.labels,
            });

        // If this isn't the last cell in the row, keep going.
        self.state = if chunk.has_commit_row() {
            ReadState::RowComplete
        } else {
            ReadState::CellStart
        };
        Ok(())
    }

    /// Wrap up a row, reinitialize our state to read the next row.
    fn row_complete(&mut self) -> Result<Row, BigtableError> {
        let row = std::mem::take(&mut self.row);
        self.last_seen_row_key = Some(row.row_key.clone());
        self.state = ReadState::RowStart;
        Ok(Row {
            row_key: row.row_key,
            cells: row.cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Chunk construction shorthand for the tests below.
    struct TestChunk<'a> {
        row_key: &'a [u8],
        family: Option<&'a str>,
        qualifier: Option<&'a [u8]>,
        timestamp: i64,
        value: &'a [u8],
        value_size: i32,
        commit: bool,
    }

    impl Default for TestChunk<'_> {
        fn default() -> Self {
            Self {
                row_key: b"",
                family: None,
                qualifier: None,
                timestamp: 0,
                value: b"",
                value_size: 0,
                commit: false,
            }
        }
    }

    fn chunk(parts: TestChunk) -> CellChunk {
        let mut chunk = CellChunk::default();
        chunk.set_row_key(parts.row_key.to_vec());
        if let Some(family) = parts.family {
            chunk.mut_family_name().set_value(family.to_owned());
        }
        if let Some(qualifier) = parts.qualifier {
            chunk.mut_qualifier().set_value(qualifier.to_vec());
        }
        chunk.set_timestamp_micros(parts.timestamp);
        chunk.set_value(parts.value.to_vec());
        chunk.set_value_size(parts.value_size);
        if parts.commit {
            chunk.set_commit_row(true);
        }
        chunk
    }

    fn simple_row_chunk(key: &[u8], value: &[u8], commit: bool) -> CellChunk {
        chunk(TestChunk {
            row_key: key,
            family: Some("cf"),
            qualifier: Some(b"col"),
            timestamp: 1_000,
            value,
            commit,
            ..Default::default()
        })
    }

    #[test]
    fn single_chunk_row() {
        let mut merger = RowMerger::new(false);
        let row = merger
            .merge_chunk(simple_row_chunk(b"a", b"v", true))
            .unwrap()
            .expect("committed row");
        assert_eq!(row.row_key, b"a".to_vec());
        let cells = &row.cells["cf"];
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].qualifier, b"col".to_vec());
        assert_eq!(cells[0].value, b"v".to_vec());
        assert_eq!(cells[0].timestamp, Timestamp(1_000));
        assert_eq!(merger.last_seen(), Some(&b"a".to_vec()));
        merger.finalize().unwrap();
    }

    #[test]
    fn family_and_qualifier_carry_over() {
        let mut merger = RowMerger::new(false);
        // first cell names the family and column
        assert!(merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"a",
                family: Some("cf"),
                qualifier: Some(b"col"),
                timestamp: 2_000,
                value: b"new",
                ..Default::default()
            }))
            .unwrap()
            .is_none());
        // second version of the same column omits both
        assert!(merger
            .merge_chunk(chunk(TestChunk {
                timestamp: 1_000,
                value: b"old",
                ..Default::default()
            }))
            .unwrap()
            .is_none());
        // new column in the same family omits the family
        let row = merger
            .merge_chunk(chunk(TestChunk {
                qualifier: Some(b"other"),
                timestamp: 1_000,
                value: b"x",
                commit: true,
                ..Default::default()
            }))
            .unwrap()
            .expect("committed row");

        let cells = &row.cells["cf"];
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].value, b"new".to_vec());
        assert_eq!(cells[1].value, b"old".to_vec());
        assert_eq!(cells[1].qualifier, b"col".to_vec());
        assert_eq!(cells[2].qualifier, b"other".to_vec());
    }

    #[test]
    fn split_value_reassembles() {
        let mut merger = RowMerger::new(false);
        assert!(merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"a",
                family: Some("cf"),
                qualifier: Some(b"col"),
                value: b"hel",
                value_size: 8,
                ..Default::default()
            }))
            .unwrap()
            .is_none());
        assert!(merger
            .merge_chunk(chunk(TestChunk {
                value: b"lo ",
                value_size: 8,
                ..Default::default()
            }))
            .unwrap()
            .is_none());
        let row = merger
            .merge_chunk(chunk(TestChunk {
                value: b"world",
                commit: true,
                ..Default::default()
            }))
            .unwrap()
            .expect("committed row");
        assert_eq!(row.cells["cf"][0].value, b"hello world".to_vec());
    }

    #[test]
    fn split_value_must_not_commit() {
        let mut merger = RowMerger::new(false);
        let err = merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"a",
                family: Some("cf"),
                qualifier: Some(b"col"),
                value: b"frag",
                value_size: 8,
                commit: true,
                ..Default::default()
            }))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn continuation_with_metadata_is_rejected() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"a",
                family: Some("cf"),
                qualifier: Some(b"col"),
                value: b"frag",
                value_size: 8,
                ..Default::default()
            }))
            .unwrap();
        let err = merger
            .merge_chunk(chunk(TestChunk {
                qualifier: Some(b"other"),
                value: b"more",
                ..Default::default()
            }))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn out_of_order_keys_forward() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(simple_row_chunk(b"b", b"v", true))
            .unwrap();
        let err = merger
            .merge_chunk(simple_row_chunk(b"a", b"v", true))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn reverse_mode_mirrors_key_order() {
        let mut merger = RowMerger::new(true);
        merger
            .merge_chunk(simple_row_chunk(b"y", b"v", true))
            .unwrap();
        merger
            .merge_chunk(simple_row_chunk(b"m", b"v", true))
            .unwrap();
        let err = merger
            .merge_chunk(simple_row_chunk(b"z", b"v", true))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn row_key_change_mid_row() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(simple_row_chunk(b"a", b"v", false))
            .unwrap();
        let err = merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"b",
                qualifier: Some(b"col2"),
                value: b"v2",
                commit: true,
                ..Default::default()
            }))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn first_chunk_without_key_is_rejected() {
        let mut merger = RowMerger::new(false);
        let err = merger
            .merge_chunk(chunk(TestChunk {
                family: Some("cf"),
                qualifier: Some(b"col"),
                value: b"v",
                commit: true,
                ..Default::default()
            }))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn family_without_qualifier_is_rejected() {
        let mut merger = RowMerger::new(false);
        let err = merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"a",
                family: Some("cf"),
                value: b"v",
                commit: true,
                ..Default::default()
            }))
            .unwrap_err();
        assert!(matches!(err, BigtableError::InvalidChunk(_)));
    }

    #[test]
    fn reset_row_discards_progress() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(simple_row_chunk(b"a", b"v", false))
            .unwrap();
        let mut reset = CellChunk::default();
        reset.set_reset_row(true);
        assert!(merger.merge_chunk(reset).unwrap().is_none());

        // the same key may start over after a reset
        let row = merger
            .merge_chunk(simple_row_chunk(b"a", b"v2", true))
            .unwrap()
            .expect("committed row");
        assert_eq!(row.cells["cf"][0].value, b"v2".to_vec());
    }

    #[test]
    fn bare_reset_is_rejected() {
        let mut merger = RowMerger::new(false);
        let mut reset = CellChunk::default();
        reset.set_reset_row(true);
        assert!(merger.merge_chunk(reset).is_err());
    }

    #[test]
    fn reset_with_payload_is_rejected() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(simple_row_chunk(b"a", b"v", false))
            .unwrap();
        let mut reset = CellChunk::default();
        reset.set_reset_row(true);
        reset.set_value(b"leftover".to_vec());
        assert!(merger.merge_chunk(reset).is_err());
    }

    #[test]
    fn eof_with_partial_row_is_a_framing_error() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(simple_row_chunk(b"a", b"v", false))
            .unwrap();
        assert!(merger.finalize().is_err());
    }

    #[test]
    fn last_scanned_marker_advances_resume_point() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(simple_row_chunk(b"a", b"v", true))
            .unwrap();
        merger.mark_last_scanned(b"m".to_vec());
        assert_eq!(merger.last_seen(), Some(&b"m".to_vec()));
        // stale markers are ignored
        merger.mark_last_scanned(b"c".to_vec());
        assert_eq!(merger.last_seen(), Some(&b"m".to_vec()));

        // and rows must still advance past the marker
        assert!(merger
            .merge_chunk(simple_row_chunk(b"d", b"v", true))
            .is_err());
    }

    #[test]
    fn multiple_families_group_cells() {
        let mut merger = RowMerger::new(false);
        merger
            .merge_chunk(chunk(TestChunk {
                row_key: b"a",
                family: Some("cf1"),
                qualifier: Some(b"x"),
                value: b"1",
                ..Default::default()
            }))
            .unwrap();
        let row = merger
            .merge_chunk(chunk(TestChunk {
                family: Some("cf2"),
                qualifier: Some(b"y"),
                value: b"2",
                commit: true,
                ..Default::default()
            }))
            .unwrap()
            .expect("committed row");
        assert_eq!(row.cells["cf1"].len(), 1);
        assert_eq!(row.cells["cf2"].len(), 1);
        assert_eq!(row.cells["cf2"][0].column(), "cf2:y");
    }
}
