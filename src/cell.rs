use crate::mutation::Timestamp;
use crate::{FamilyId, Qualifier};

/// A finished cell. There can be multiple versions for a given
/// `(row, family, qualifier)`; the server returns them newest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cell {
    /// The family identifier string.
    pub family: FamilyId,
    /// Column name
    pub qualifier: Qualifier,
    /// Column data
    pub value: Vec<u8>,
    /// Microseconds since the Unix epoch; the server stores millisecond
    /// granularity. This value is used by the family garbage collection
    /// rules and may not reflect reality.
    pub timestamp: Timestamp,
    pub labels: Vec<String>,
}

impl Cell {
    /// The two-level column address, `family:qualifier`.
    pub fn column(&self) -> String {
        format!(
            "{}:{}",
            self.family,
            String::from_utf8_lossy(&self.qualifier)
        )
    }
}
