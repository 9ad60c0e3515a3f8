use std::time::{SystemTime, UNIX_EPOCH};

use google_cloud_rust_raw::bigtable::v2::data;
use protobuf::RepeatedField;

use crate::Qualifier;

/// A cell timestamp, in microseconds since the Unix epoch.
///
/// The server only accepts millisecond granularity; write-side timestamps are
/// truncated. [`Timestamp::SERVER_TIME`] asks the server to stamp the cell at
/// write time, at the cost of making the mutation non-retryable.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Wire sentinel: "server supplies the timestamp on write".
    pub const SERVER_TIME: Timestamp = Timestamp(-1);

    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        Timestamp(micros)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis * 1000)
    }

    pub fn micros(self) -> i64 {
        self.0
    }

    /// Round down to server granularity. The server-time sentinel passes
    /// through untouched.
    pub fn truncate_to_milliseconds(self) -> Self {
        if self == Self::SERVER_TIME {
            self
        } else {
            Timestamp(self.0 - self.0 % 1000)
        }
    }
}

/// An ordered batch of operations against a single row, applied atomically.
///
/// A plain mutation is a vector of ops. A conditional mutation instead wraps
/// a predicate filter and up to two child branches; the server applies the
/// true branch when the predicate matches at least one cell in the row.
/// Conditional mutations may not nest and may not be used in bulk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mutation {
    pub(crate) ops: Vec<data::Mutation>,
    pub(crate) predicate: Option<data::RowFilter>,
    pub(crate) mtrue: Option<Box<Mutation>>,
    pub(crate) mfalse: Option<Box<Mutation>>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicate-guarded pair of branches. Either branch may be absent.
    pub fn conditional(
        predicate: data::RowFilter,
        mtrue: Option<Mutation>,
        mfalse: Option<Mutation>,
    ) -> Self {
        Mutation {
            ops: Vec::new(),
            predicate: Some(predicate),
            mtrue: mtrue.map(Box::new),
            mfalse: mfalse.map(Box::new),
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.predicate.is_some()
    }

    /// Write `value` into `family:qualifier` at `timestamp` (truncated to
    /// millisecond granularity).
    pub fn set_cell(
        &mut self,
        family: &str,
        qualifier: impl Into<Qualifier>,
        timestamp: Timestamp,
        value: impl Into<Vec<u8>>,
    ) {
        let mut set_cell = data::Mutation_SetCell::default();
        set_cell.set_family_name(family.to_owned());
        set_cell.set_column_qualifier(qualifier.into());
        set_cell.set_timestamp_micros(timestamp.truncate_to_milliseconds().micros());
        set_cell.set_value(value.into());
        let mut mutation = data::Mutation::default();
        mutation.set_set_cell(set_cell);
        self.ops.push(mutation);
    }

    /// Delete every version of one column.
    pub fn delete_cells_in_column(&mut self, family: &str, qualifier: impl Into<Qualifier>) {
        let mut del_cell = data::Mutation_DeleteFromColumn::default();
        del_cell.set_family_name(family.to_owned());
        del_cell.set_column_qualifier(qualifier.into());
        let mut mutation = data::Mutation::default();
        mutation.set_delete_from_column(del_cell);
        self.ops.push(mutation);
    }

    /// Delete the versions of one column with `start <= timestamp < end`.
    pub fn delete_timestamp_range(
        &mut self,
        family: &str,
        qualifier: impl Into<Qualifier>,
        start: Timestamp,
        end: Timestamp,
    ) {
        let mut time_range = data::TimestampRange::default();
        time_range.set_start_timestamp_micros(start.micros());
        time_range.set_end_timestamp_micros(end.micros());
        let mut del_cell = data::Mutation_DeleteFromColumn::default();
        del_cell.set_family_name(family.to_owned());
        del_cell.set_column_qualifier(qualifier.into());
        del_cell.set_time_range(time_range);
        let mut mutation = data::Mutation::default();
        mutation.set_delete_from_column(del_cell);
        self.ops.push(mutation);
    }

    /// Delete all cells in the family.
    pub fn delete_cells_in_family(&mut self, family: &str) {
        let mut del_family = data::Mutation_DeleteFromFamily::default();
        del_family.set_family_name(family.to_owned());
        let mut mutation = data::Mutation::default();
        mutation.set_delete_from_family(del_family);
        self.ops.push(mutation);
    }

    /// Delete the entire row.
    pub fn delete_row(&mut self) {
        let mut mutation = data::Mutation::default();
        mutation.set_delete_from_row(data::Mutation_DeleteFromRow::default());
        self.ops.push(mutation);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.predicate.is_none()
    }

    /// A mutation may be retried only when replaying it cannot change the
    /// outcome: any server-stamped cell write disqualifies it. For a
    /// conditional mutation, every present branch must qualify.
    pub fn is_idempotent(&self) -> bool {
        if self.is_conditional() {
            self.mtrue.as_ref().map_or(true, |m| m.is_idempotent())
                && self.mfalse.as_ref().map_or(true, |m| m.is_idempotent())
        } else {
            mutations_are_retryable(&self.ops)
        }
    }

    pub(crate) fn wire_ops(&self) -> RepeatedField<data::Mutation> {
        RepeatedField::from_vec(self.ops.clone())
    }

    pub(crate) fn op_count(&self) -> usize {
        self.ops.len()
    }
}

pub(crate) fn mutations_are_retryable(ops: &[data::Mutation]) -> bool {
    ops.iter().all(|op| {
        !(op.has_set_cell()
            && op.get_set_cell().get_timestamp_micros() == Timestamp::SERVER_TIME.micros())
    })
}

/// Rules executed in order against a single row; the RPC returns the new
/// contents of the cells it wrote. Never retried (increments are not
/// idempotent).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadModifyWrite {
    pub(crate) rules: Vec<data::ReadModifyWriteRule>,
}

impl ReadModifyWrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` to the current cell contents (empty if absent).
    pub fn append_value(
        &mut self,
        family: &str,
        qualifier: impl Into<Qualifier>,
        value: impl Into<Vec<u8>>,
    ) {
        let mut rule = data::ReadModifyWriteRule::default();
        rule.set_family_name(family.to_owned());
        rule.set_column_qualifier(qualifier.into());
        rule.set_append_value(value.into());
        self.rules.push(rule);
    }

    /// Treat the current cell as a big-endian i64 (0 if absent) and add
    /// `delta`.
    pub fn increment(&mut self, family: &str, qualifier: impl Into<Qualifier>, delta: i64) {
        let mut rule = data::ReadModifyWriteRule::default();
        rule.set_family_name(family.to_owned());
        rule.set_column_qualifier(qualifier.into());
        rule.set_increment_amount(delta);
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub(crate) fn wire_rules(&self) -> RepeatedField<data::ReadModifyWriteRule> {
        RepeatedField::from_vec(self.rules.clone())
    }
}
