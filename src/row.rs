use std::collections::HashMap;

use google_cloud_rust_raw::bigtable::v2::data;

use crate::cell::Cell;
use crate::mutation::Timestamp;
use crate::{FamilyId, RowKey};

/// A materialized storage row. Cells are grouped by family; within a family
/// the server's cell order is preserved (newest version first per column).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    /// The row's key.
    // This may be any ByteArray value.
    pub row_key: RowKey,
    /// The row's collection of cells, indexed by family.
    pub cells: HashMap<FamilyId, Vec<Cell>>,
}

impl Row {
    /// Create a new Row w/ the specified row_key
    pub fn new(row_key: impl Into<RowKey>) -> Self {
        Row {
            row_key: row_key.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Return all cells for a given family
    pub fn take_cells(&mut self, family: &str) -> Option<Vec<Cell>> {
        self.cells.remove(family)
    }

    /// Get only the "top" (newest) cell for the family. Ignore other values.
    pub fn take_cell(&mut self, family: &str) -> Option<Cell> {
        self.take_cells(family)
            .and_then(|mut cells| match cells.is_empty() {
                true => None,
                false => Some(cells.remove(0)),
            })
    }

    /// Add cells to a given family
    pub fn add_cells(&mut self, family: &str, cells: Vec<Cell>) -> Option<Vec<Cell>> {
        self.cells.insert(family.to_owned(), cells)
    }
}

/// Unary RPCs (read-modify-write) return the row in the already-merged wire
/// form rather than as chunks.
impl From<data::Row> for Row {
    fn from(mut wire: data::Row) -> Self {
        let mut row = Row::new(wire.take_key());
        for mut family in wire.take_families().into_iter() {
            let name: FamilyId = family.take_name();
            let mut cells: Vec<Cell> = Vec::new();
            for mut column in family.take_columns().into_iter() {
                let qualifier = column.take_qualifier();
                for mut cell in column.take_cells().into_iter() {
                    cells.push(Cell {
                        family: name.clone(),
                        qualifier: qualifier.clone(),
                        value: cell.take_value(),
                        timestamp: Timestamp(cell.get_timestamp_micros()),
                        labels: cell.take_labels().into_vec(),
                    });
                }
            }
            row.add_cells(&name, cells);
        }
        row
    }
}
