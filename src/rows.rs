use google_cloud_rust_raw::bigtable::v2::data;
use protobuf::RepeatedField;

use crate::RowKey;

/// One end of a row range.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Bound {
    #[default]
    Unbounded,
    /// Excludes the key itself.
    Open(RowKey),
    /// Includes the key itself.
    Closed(RowKey),
}

impl Bound {
    /// The empty key is the wire sentinel for "unbounded".
    fn normalized(self) -> Bound {
        match self {
            Bound::Open(k) | Bound::Closed(k) if k.is_empty() => Bound::Unbounded,
            b => b,
        }
    }
}

/// A contiguous span of row keys with independent start and end bounds.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RowRange {
    pub(crate) start: Bound,
    pub(crate) end: Bound,
}

impl RowRange {
    pub fn new(start: Bound, end: Bound) -> Self {
        Self {
            start: start.normalized(),
            end: end.normalized(),
        }
    }

    /// The half-open interval `[begin, end)`, the common scan shape.
    pub fn closed_open(begin: impl Into<RowKey>, end: impl Into<RowKey>) -> Self {
        Self::new(Bound::Closed(begin.into()), Bound::Open(end.into()))
    }

    /// `(begin, end]`.
    pub fn open_closed(begin: impl Into<RowKey>, end: impl Into<RowKey>) -> Self {
        Self::new(Bound::Open(begin.into()), Bound::Closed(end.into()))
    }

    /// `(begin, end)`.
    pub fn open(begin: impl Into<RowKey>, end: impl Into<RowKey>) -> Self {
        Self::new(Bound::Open(begin.into()), Bound::Open(end.into()))
    }

    /// `[begin, end]`.
    pub fn closed(begin: impl Into<RowKey>, end: impl Into<RowKey>) -> Self {
        Self::new(Bound::Closed(begin.into()), Bound::Closed(end.into()))
    }

    /// Every row in the table.
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Exactly the keys beginning with `prefix`, as the half-open interval
    /// `[prefix, successor(prefix))`.
    pub fn prefix(prefix: impl Into<RowKey>) -> Self {
        let prefix: RowKey = prefix.into();
        let end = match prefix_successor(&prefix) {
            Some(succ) => Bound::Open(succ),
            None => Bound::Unbounded,
        };
        Self::new(Bound::Closed(prefix), end)
    }

    /// A range can match at least one key iff one side is unbounded, any
    /// side is open and `start < end`, or both sides are closed and
    /// `start <= end`.
    pub fn is_valid(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
            (Bound::Closed(s), Bound::Closed(e)) => s <= e,
            (Bound::Closed(s), Bound::Open(e))
            | (Bound::Open(s), Bound::Closed(e))
            | (Bound::Open(s), Bound::Open(e)) => s < e,
        }
    }

    /// The same span minus every key `<= k`. May produce an invalid range;
    /// the caller drops those.
    fn retain_after(&self, k: &[u8]) -> RowRange {
        let start = match &self.start {
            Bound::Unbounded => Bound::Open(k.to_vec()),
            Bound::Closed(s) if k < s.as_slice() => Bound::Closed(s.clone()),
            Bound::Open(s) if k <= s.as_slice() => Bound::Open(s.clone()),
            _ => Bound::Open(k.to_vec()),
        };
        RowRange {
            start,
            end: self.end.clone(),
        }
    }

    /// Mirror of [`RowRange::retain_after`]: minus every key `>= k`.
    fn retain_before(&self, k: &[u8]) -> RowRange {
        let end = match &self.end {
            Bound::Unbounded => Bound::Open(k.to_vec()),
            Bound::Closed(e) if k > e.as_slice() => Bound::Closed(e.clone()),
            Bound::Open(e) if k >= e.as_slice() => Bound::Open(e.clone()),
            _ => Bound::Open(k.to_vec()),
        };
        RowRange {
            start: self.start.clone(),
            end,
        }
    }

    pub(crate) fn to_wire(&self) -> data::RowRange {
        let mut range = data::RowRange::default();
        match &self.start {
            Bound::Unbounded => {}
            Bound::Open(k) => range.set_start_key_open(k.clone()),
            Bound::Closed(k) => range.set_start_key_closed(k.clone()),
        }
        match &self.end {
            Bound::Unbounded => {}
            Bound::Open(k) => range.set_end_key_open(k.clone()),
            Bound::Closed(k) => range.set_end_key_closed(k.clone()),
        }
        range
    }
}

/// A logical selection of rows: discrete keys, one range, or a union of
/// ranges. The shapes share a capability set (wire conversion, narrowing
/// after a progress key, emptiness), dispatched by tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RowSet {
    List(Vec<RowKey>),
    Range(RowRange),
    Ranges(Vec<RowRange>),
}

impl Default for RowSet {
    fn default() -> Self {
        RowSet::Range(RowRange::infinite())
    }
}

impl From<RowRange> for RowSet {
    fn from(range: RowRange) -> Self {
        RowSet::Range(range)
    }
}

impl RowSet {
    pub fn single(key: impl Into<RowKey>) -> Self {
        RowSet::List(vec![key.into()])
    }

    pub fn list<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<RowKey>,
    {
        RowSet::List(keys.into_iter().map(Into::into).collect())
    }

    pub fn prefix(prefix: impl Into<RowKey>) -> Self {
        RowSet::Range(RowRange::prefix(prefix))
    }

    pub fn infinite() -> Self {
        RowSet::default()
    }

    /// The same selection minus every key `<= k`. Used to shrink the
    /// outstanding request when resuming a forward scan at progress key `k`.
    pub fn retain_after(&self, k: &[u8]) -> RowSet {
        if k.is_empty() {
            return self.clone();
        }
        match self {
            RowSet::List(keys) => RowSet::List(
                keys.iter()
                    .filter(|key| key.as_slice() > k)
                    .cloned()
                    .collect(),
            ),
            RowSet::Range(range) => RowSet::Range(range.retain_after(k)),
            RowSet::Ranges(ranges) => RowSet::Ranges(
                ranges
                    .iter()
                    .map(|range| range.retain_after(k))
                    .filter(RowRange::is_valid)
                    .collect(),
            ),
        }
    }

    /// Mirror of [`RowSet::retain_after`], for reverse scans.
    pub fn retain_before(&self, k: &[u8]) -> RowSet {
        if k.is_empty() {
            return self.clone();
        }
        match self {
            RowSet::List(keys) => RowSet::List(
                keys.iter()
                    .filter(|key| key.as_slice() < k)
                    .cloned()
                    .collect(),
            ),
            RowSet::Range(range) => RowSet::Range(range.retain_before(k)),
            RowSet::Ranges(ranges) => RowSet::Ranges(
                ranges
                    .iter()
                    .map(|range| range.retain_before(k))
                    .filter(RowRange::is_valid)
                    .collect(),
            ),
        }
    }

    /// Whether this selection could match at least one key. The read engine
    /// must short-circuit on an empty selection: the wire protocol treats an
    /// empty row set as "all rows".
    pub fn is_nonempty(&self) -> bool {
        match self {
            RowSet::List(keys) => !keys.is_empty(),
            RowSet::Range(range) => range.is_valid(),
            RowSet::Ranges(ranges) => ranges.iter().any(RowRange::is_valid),
        }
    }

    pub(crate) fn to_wire(&self) -> data::RowSet {
        let mut row_set = data::RowSet::default();
        match self {
            RowSet::List(keys) => {
                row_set.set_row_keys(RepeatedField::from_vec(keys.clone()));
            }
            RowSet::Range(range) => {
                row_set.set_row_ranges(RepeatedField::from_vec(vec![range.to_wire()]));
            }
            RowSet::Ranges(ranges) => {
                row_set.set_row_ranges(RepeatedField::from_vec(
                    ranges
                        .iter()
                        .filter(|range| range.is_valid())
                        .map(RowRange::to_wire)
                        .collect(),
                ));
            }
        }
        row_set
    }
}

/// The smallest key strictly greater than every key starting with `prefix`:
/// strip trailing `0xFF` bytes, then increment the last remaining byte.
/// All-`0xFF` (or empty) prefixes have no successor ("unbounded").
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<RowKey> {
    let stripped_len = prefix
        .iter()
        .rposition(|&b| b != 0xFF)
        .map(|pos| pos + 1)?;
    let mut succ = prefix[..stripped_len].to_vec();
    *succ.last_mut().expect("nonempty after strip") += 1;
    Some(succ)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RowKey {
        s.as_bytes().to_vec()
    }

    #[test]
    fn prefix_successor_basics() {
        assert_eq!(prefix_successor(b"row"), Some(key("rox")));
        assert_eq!(prefix_successor(b"a\xff\xff"), Some(key("b")));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn prefix_range_shape() {
        let range = RowRange::prefix("row");
        assert_eq!(range.start, Bound::Closed(key("row")));
        assert_eq!(range.end, Bound::Open(key("rox")));

        // all-0xFF prefixes are unbounded at the top
        let range = RowRange::prefix(b"\xff\xff".to_vec());
        assert_eq!(range.end, Bound::Unbounded);
    }

    #[test]
    fn empty_key_normalizes_to_unbounded() {
        let range = RowRange::closed_open("", "z");
        assert_eq!(range.start, Bound::Unbounded);
        let range = RowRange::closed_open("a", "");
        assert_eq!(range.end, Bound::Unbounded);
    }

    #[test]
    fn validity() {
        assert!(RowRange::infinite().is_valid());
        assert!(RowRange::closed_open("a", "b").is_valid());
        assert!(RowRange::closed("a", "a").is_valid());
        assert!(!RowRange::open("a", "a").is_valid());
        assert!(!RowRange::closed_open("b", "a").is_valid());
        // one unbounded side always matches something
        assert!(RowRange::new(Bound::Open(key("z")), Bound::Unbounded).is_valid());
    }

    #[test]
    fn retain_after_list() {
        let set = RowSet::list(["a", "c", "e"]);
        assert_eq!(set.retain_after(b"c"), RowSet::list(["e"]));
        assert_eq!(set.retain_after(b"b"), RowSet::list(["c", "e"]));
        assert!(!set.retain_after(b"e").is_nonempty());
    }

    #[test]
    fn retain_before_list() {
        let set = RowSet::list(["a", "c", "e"]);
        assert_eq!(set.retain_before(b"c"), RowSet::list(["a"]));
        assert!(!set.retain_before(b"a").is_nonempty());
    }

    #[test]
    fn retain_after_range() {
        let range = RowRange::closed_open("a", "z");

        // mid-range progress reopens just above the progress key
        let narrowed = RowSet::Range(range.clone()).retain_after(b"c");
        assert_eq!(
            narrowed,
            RowSet::Range(RowRange::open("c", "z"))
        );

        // progress below the start leaves the range untouched
        let unchanged = RowSet::Range(range.clone()).retain_after(b"A");
        assert_eq!(unchanged, RowSet::Range(range.clone()));

        // progress at or past the end invalidates the range
        assert!(!RowSet::Range(range).retain_after(b"z").is_nonempty());
    }

    #[test]
    fn retain_after_open_start() {
        let range = RowRange::open("c", "z");
        // the open start already excludes everything <= "c"
        assert_eq!(
            RowSet::Range(range.clone()).retain_after(b"b"),
            RowSet::Range(range.clone())
        );
        assert_eq!(
            RowSet::Range(range.clone()).retain_after(b"c"),
            RowSet::Range(range)
        );
    }

    #[test]
    fn retain_before_range() {
        let range = RowRange::closed_open("a", "z");
        let narrowed = RowSet::Range(range.clone()).retain_before(b"x");
        assert_eq!(
            narrowed,
            RowSet::Range(RowRange::closed_open("a", "x"))
        );
        assert!(!RowSet::Range(range).retain_before(b"a").is_nonempty());
    }

    #[test]
    fn retain_after_range_list_drops_emptied_members() {
        let set = RowSet::Ranges(vec![
            RowRange::closed_open("a", "c"),
            RowRange::closed_open("m", "p"),
        ]);
        let narrowed = set.retain_after(b"d");
        assert_eq!(narrowed, RowSet::Ranges(vec![RowRange::closed_open("m", "p")]));
        assert!(narrowed.is_nonempty());
        assert!(!set.retain_after(b"q").is_nonempty());
    }

    #[test]
    fn retain_after_keeps_later_keys_intact() {
        // law: no key <= k survives, every key > k survives
        let set = RowSet::Ranges(vec![
            RowRange::closed("a", "f"),
            RowRange::open_closed("q", "t"),
        ]);
        let narrowed = set.retain_after(b"d");
        match narrowed {
            RowSet::Ranges(ranges) => {
                assert_eq!(ranges[0], RowRange::open_closed("d", "f"));
                assert_eq!(ranges[1], RowRange::open_closed("q", "t"));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn empty_and_unbounded_wire_shapes() {
        assert!(!RowSet::List(vec![]).is_nonempty());
        assert!(!RowSet::Ranges(vec![]).is_nonempty());
        assert!(RowSet::infinite().is_nonempty());

        let wire = RowSet::single("k").to_wire();
        assert_eq!(wire.get_row_keys().len(), 1);
        assert!(wire.get_row_ranges().is_empty());

        let wire = RowSet::infinite().to_wire();
        assert!(wire.get_row_keys().is_empty());
        let range = &wire.get_row_ranges()[0];
        assert!(!range.has_start_key_closed() && !range.has_start_key_open());
        assert!(!range.has_end_key_closed() && !range.has_end_key_open());
    }

    #[test]
    fn wire_bound_kinds() {
        let wire = RowSet::Range(RowRange::open_closed("a", "b")).to_wire();
        let range = &wire.get_row_ranges()[0];
        assert_eq!(range.get_start_key_open(), b"a".as_slice());
        assert_eq!(range.get_end_key_closed(), b"b".as_slice());
    }
}
