//! Per-slot layout: named byte blocks packed back to back.

use indexmap::IndexMap;

use crate::error::ShmError;

/// Offset table for one slot.
///
/// Every slot in an arena has the same layout. Blocks are packed in
/// declaration order with no padding; the stride is the sum of all
/// block lengths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    /// Maps each key to `(offset, len)` within a slot.
    entries: IndexMap<String, (usize, usize)>,
    stride: usize,
}

impl SlotLayout {
    /// Build a layout from `(key, byte_len)` pairs.
    pub fn new<K: Into<String>>(
        blocks: impl IntoIterator<Item = (K, usize)>,
    ) -> Result<Self, ShmError> {
        let mut entries = IndexMap::new();
        let mut cursor = 0usize;
        for (key, len) in blocks {
            let key = key.into();
            if entries.contains_key(&key) {
                return Err(ShmError::DuplicateEntry { key });
            }
            entries.insert(key, (cursor, len));
            cursor += len;
        }
        Ok(Self {
            entries,
            stride: cursor,
        })
    }

    /// Bytes per slot.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// `(offset, len)` of `key` within a slot.
    pub fn entry(&self, key: &str) -> Result<(usize, usize), ShmError> {
        self.entries
            .get(key)
            .copied()
            .ok_or_else(|| ShmError::UnknownEntry {
                key: key.to_owned(),
            })
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Total bytes for `num_slots` slots.
    pub fn total_len(&self, num_slots: usize) -> usize {
        self.stride * num_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blocks_are_packed_in_order() {
        let layout = SlotLayout::new([("p0", 12), ("p1", 8), ("p2", 4)]).unwrap();
        assert_eq!(layout.stride(), 24);
        assert_eq!(layout.entry("p0").unwrap(), (0, 12));
        assert_eq!(layout.entry("p1").unwrap(), (12, 8));
        assert_eq!(layout.entry("p2").unwrap(), (20, 4));
        assert_eq!(layout.keys().collect::<Vec<_>>(), vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn duplicate_key_rejected() {
        let err = SlotLayout::new([("p0", 4), ("p0", 4)]).unwrap_err();
        assert!(matches!(err, ShmError::DuplicateEntry { key } if key == "p0"));
    }

    #[test]
    fn unknown_key_rejected() {
        let layout = SlotLayout::new([("state", 16)]).unwrap();
        assert!(matches!(
            layout.entry("p9"),
            Err(ShmError::UnknownEntry { .. })
        ));
    }

    proptest! {
        #[test]
        fn entries_never_overlap(lens in proptest::collection::vec(0usize..64, 1..12)) {
            let layout = SlotLayout::new(
                lens.iter().enumerate().map(|(i, len)| (format!("k{i}"), *len)),
            ).unwrap();
            let mut end = 0;
            for (i, len) in lens.iter().enumerate() {
                let (off, l) = layout.entry(&format!("k{i}")).unwrap();
                prop_assert_eq!(off, end);
                prop_assert_eq!(l, *len);
                end = off + l;
            }
            prop_assert_eq!(layout.stride(), end);
        }
    }
}
