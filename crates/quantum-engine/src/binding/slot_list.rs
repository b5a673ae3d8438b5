use crate::position::Position;
use std::fmt;

/// Identifies a variable slot (a definition or an importer) inside a binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub(crate) u64);

/// Identifies a getter inside a binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GetterId(pub(crate) u64);

/// Sort key of a slot. The importer orders below every real position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPosition {
    Importer,
    At(Position),
}

impl SlotPosition {
    pub fn is_importer(self) -> bool {
        matches!(self, SlotPosition::Importer)
    }
}

impl fmt::Display for SlotPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotPosition::Importer => f.write_str("importer"),
            SlotPosition::At(position) => write!(f, "{position}"),
        }
    }
}

/// The ordered slots for one name in one scope.
///
/// Slot 0 is always the importer. The remaining slots are sorted by position;
/// equal positions keep insertion order. The list stores ids only; slot data
/// (position, index, value, getters) lives in the owning table's arena.
#[derive(Debug, Clone)]
pub(crate) struct SlotList {
    slots: Vec<VariableId>,
}

impl SlotList {
    pub(crate) fn new(importer: VariableId) -> Self {
        Self {
            slots: vec![importer],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<VariableId> {
        self.slots.get(index).copied()
    }

    pub(crate) fn importer(&self) -> VariableId {
        self.slots[0]
    }

    pub(crate) fn ids(&self) -> &[VariableId] {
        &self.slots
    }

    /// Index of the first slot ordered strictly after `position`.
    ///
    /// Never returns 0: the importer precedes every position, so `index - 1`
    /// is always the predecessor a getter at `position` binds to.
    pub(crate) fn upper_bound(
        &self,
        position: Position,
        position_of: impl Fn(VariableId) -> SlotPosition,
    ) -> usize {
        let key = SlotPosition::At(position);
        1 + self.slots[1..].partition_point(|&id| position_of(id) <= key)
    }

    pub(crate) fn insert(&mut self, index: usize, id: VariableId) {
        debug_assert!(index >= 1, "only the importer may live at index 0");
        self.slots.insert(index, id);
    }

    pub(crate) fn remove(&mut self, index: usize) -> VariableId {
        debug_assert!(index >= 1, "the importer is never spliced out");
        self.slots.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn list_with(positions: &[f64]) -> (SlotList, HashMap<VariableId, SlotPosition>) {
        let mut keys = HashMap::new();
        keys.insert(VariableId(0), SlotPosition::Importer);
        let mut list = SlotList::new(VariableId(0));
        for (i, y) in positions.iter().enumerate() {
            let id = VariableId(i as u64 + 1);
            keys.insert(id, SlotPosition::At(Position::new(0.0, *y)));
            list.insert(list.len(), id);
        }
        (list, keys)
    }

    #[test]
    fn upper_bound_skips_equal_positions() {
        let (list, keys) = list_with(&[3.0, 4.0, 4.0, 9.0]);
        let at = |y: f64| list.upper_bound(Position::new(0.0, y), |id| keys[&id]);

        assert_eq!(at(1.0), 1);
        assert_eq!(at(3.0), 2);
        assert_eq!(at(3.5), 2);
        assert_eq!(at(4.0), 4);
        assert_eq!(at(100.0), 5);
    }

    #[test]
    fn importer_only_list_binds_everything_to_importer() {
        let (list, keys) = list_with(&[]);
        assert_eq!(list.upper_bound(Position::new(-1e9, -1e9), |id| keys[&id]), 1);
        assert_eq!(list.importer(), VariableId(0));
    }

    #[test]
    fn importer_orders_first() {
        assert!(SlotPosition::Importer < SlotPosition::At(Position::new(f64::MIN, f64::MIN)));
        assert!(SlotPosition::Importer.is_importer());
    }
}
