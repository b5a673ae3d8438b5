use super::slot_list::{GetterId, SlotList, SlotPosition, VariableId};
use crate::position::Position;
use quantum_expr::Expr;
use std::collections::HashMap;

/// What a getter currently observes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BoundValue {
    /// Bound to an importer that has nothing to import: the name is a free symbol.
    #[default]
    Free,
    /// Bound to a definition that has no value yet (pending, cleared or failed).
    Unset,
    Defined(Expr),
}

impl BoundValue {
    pub fn is_unset(&self) -> bool {
        matches!(self, BoundValue::Unset)
    }

    pub fn as_defined(&self) -> Option<&Expr> {
        match self {
            BoundValue::Defined(expr) => Some(expr),
            _ => None,
        }
    }
}

impl From<Option<Expr>> for BoundValue {
    fn from(value: Option<Expr>) -> Self {
        value.map_or(BoundValue::Unset, BoundValue::Defined)
    }
}

/// Side effects of one table mutation, reported after the table is consistent again.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    /// Getters whose observed value changed, in document order.
    pub changed: Vec<GetterId>,
    /// Names whose slot list was created by this mutation.
    pub created: Vec<String>,
    /// Names whose slot list was garbage-collected by this mutation.
    pub dropped: Vec<String>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.created.is_empty() && self.dropped.is_empty()
    }
}

#[derive(Debug, Clone)]
struct VariableSlot {
    name: String,
    position: SlotPosition,
    index: usize,
    value: BoundValue,
    getters: Vec<GetterId>,
}

#[derive(Debug, Clone)]
struct GetterSlot {
    name: String,
    position: Position,
    variable: VariableId,
}

/// Values observed by getters before they were rebound during one mutation.
#[derive(Default)]
struct Rebinds {
    before: HashMap<GetterId, BoundValue>,
}

impl Rebinds {
    fn record(&mut self, getter: GetterId, value: &BoundValue) {
        self.before.entry(getter).or_insert_with(|| value.clone());
    }
}

/// Spatial symbol table for one scope.
///
/// For every name there is one [`SlotList`]: an importer at index 0 followed by
/// the definitions sorted by position. Every getter is attached to the slot
/// immediately preceding it, so a getter's interval is
/// `[slot.position, next_slot.position)`.
#[derive(Debug, Default)]
pub struct BindingTable {
    lists: HashMap<String, SlotList>,
    variables: HashMap<VariableId, VariableSlot>,
    getters: HashMap<GetterId, GetterSlot>,
    next_id: u64,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition of `name` at `position`. It starts [`BoundValue::Unset`].
    pub fn add_variable(&mut self, name: &str, position: Position) -> (VariableId, Effects) {
        let mut effects = Effects::default();
        self.ensure_list(name, &mut effects);

        let id = VariableId(self.alloc_id());
        self.variables.insert(
            id,
            VariableSlot {
                name: name.to_string(),
                position: SlotPosition::At(position),
                index: 0,
                value: BoundValue::Unset,
                getters: Vec::new(),
            },
        );

        let mut rebinds = Rebinds::default();
        self.insert_slot(id, position, &mut rebinds);
        log::trace!("variable {name} added at {position}");
        effects.changed = self.finish(rebinds);
        (id, effects)
    }

    /// Moves a definition, rebinding the getters it gains or loses.
    pub fn move_variable(&mut self, id: VariableId, position: Position) -> Effects {
        let mut effects = Effects::default();
        let Some(slot) = self.variables.get(&id) else {
            return effects;
        };
        let SlotPosition::At(old) = slot.position else {
            return effects;
        };
        if old == position {
            return effects;
        }

        let list = &self.lists[&slot.name];
        let prev = list
            .get(slot.index - 1)
            .expect("definition slot without predecessor");
        let prev_position = self.variables[&prev].position;
        let next_position = list
            .get(slot.index + 1)
            .map(|next| self.variables[&next].position);
        let key = SlotPosition::At(position);
        let stays_in_place = prev_position <= key && next_position.map_or(true, |next| key < next);

        let mut rebinds = Rebinds::default();
        if stays_in_place {
            // Same neighbours: only getters between the old and new position change hands.
            if let Some(slot) = self.variables.get_mut(&id) {
                slot.position = key;
            }
            if position < old {
                self.transfer_getters(prev, id, |g| g >= position, &mut rebinds);
            } else {
                self.transfer_getters(id, prev, |g| g < position, &mut rebinds);
            }
        } else {
            self.detach_slot(id, &mut rebinds);
            self.insert_slot(id, position, &mut rebinds);
        }
        log::trace!("variable moved from {old} to {position}");
        effects.changed = self.finish(rebinds);
        effects
    }

    /// Removes a definition. Its getters fall back to the preceding slot.
    pub fn remove_variable(&mut self, id: VariableId) -> Effects {
        let mut effects = Effects::default();
        let Some(slot) = self.variables.get(&id) else {
            return effects;
        };
        if slot.position.is_importer() {
            return effects;
        }
        let name = slot.name.clone();

        let mut rebinds = Rebinds::default();
        self.detach_slot(id, &mut rebinds);
        self.variables.remove(&id);
        self.collect_garbage(&name, &mut effects);
        effects.changed = self.finish(rebinds);
        effects
    }

    /// Writes a definition's value and reports its getters if the value changed.
    pub fn set_variable_value(&mut self, id: VariableId, value: BoundValue) -> Effects {
        let mut effects = Effects::default();
        let Some(slot) = self.variables.get_mut(&id) else {
            return effects;
        };
        if slot.value == value {
            return effects;
        }
        slot.value = value;
        let mut changed = slot.getters.clone();
        self.sort_in_document_order(&mut changed);
        effects.changed = changed;
        effects
    }

    /// Sets the value inherited through the importer of `name`, if that list exists.
    pub fn set_import_value(&mut self, name: &str, value: BoundValue) -> Effects {
        match self.lists.get(name) {
            Some(list) => {
                let importer = list.importer();
                self.set_variable_value(importer, value)
            }
            None => Effects::default(),
        }
    }

    /// Adds a read of `name` at `position`.
    ///
    /// Unknown names never fail: the list is materialized with a fresh importer.
    pub fn add_getter(&mut self, name: &str, position: Position) -> (GetterId, Effects) {
        let mut effects = Effects::default();
        self.ensure_list(name, &mut effects);

        let id = GetterId(self.alloc_id());
        let variable = self.predecessor(name, position);
        self.getters.insert(
            id,
            GetterSlot {
                name: name.to_string(),
                position,
                variable,
            },
        );
        if let Some(slot) = self.variables.get_mut(&variable) {
            slot.getters.push(id);
        }
        log::trace!("getter {name} added at {position}");
        (id, effects)
    }

    /// Moves a read. Nothing changes while it stays inside its current interval.
    pub fn move_getter(&mut self, id: GetterId, position: Position) -> Effects {
        let mut effects = Effects::default();
        let Some(getter) = self.getters.get(&id) else {
            return effects;
        };
        let bound = getter.variable;
        let name = getter.name.clone();
        let slot = &self.variables[&bound];
        let next_position = self.lists[&name]
            .get(slot.index + 1)
            .map(|next| self.variables[&next].position);
        let key = SlotPosition::At(position);
        if slot.position <= key && next_position.map_or(true, |next| key < next) {
            if let Some(getter) = self.getters.get_mut(&id) {
                getter.position = position;
            }
            return effects;
        }

        let mut rebinds = Rebinds::default();
        rebinds.record(id, &slot.value);
        if let Some(slot) = self.variables.get_mut(&bound) {
            slot.getters.retain(|g| *g != id);
        }
        let variable = self.predecessor(&name, position);
        if let Some(getter) = self.getters.get_mut(&id) {
            getter.position = position;
            getter.variable = variable;
        }
        if let Some(slot) = self.variables.get_mut(&variable) {
            slot.getters.push(id);
        }
        effects.changed = self.finish(rebinds);
        effects
    }

    pub fn remove_getter(&mut self, id: GetterId) -> Effects {
        let mut effects = Effects::default();
        let Some(getter) = self.getters.remove(&id) else {
            return effects;
        };
        if let Some(slot) = self.variables.get_mut(&getter.variable) {
            slot.getters.retain(|g| *g != id);
        }
        self.collect_garbage(&getter.name, &mut effects);
        effects
    }

    pub fn getter_value(&self, id: GetterId) -> Option<&BoundValue> {
        let getter = self.getters.get(&id)?;
        self.variables.get(&getter.variable).map(|slot| &slot.value)
    }

    pub fn variable_value(&self, id: VariableId) -> Option<&BoundValue> {
        self.variables.get(&id).map(|slot| &slot.value)
    }

    /// The slot a getter is currently attached to.
    pub fn getter_binding(&self, id: GetterId) -> Option<VariableId> {
        self.getters.get(&id).map(|getter| getter.variable)
    }

    /// Getters attached to a slot, in document order.
    pub fn variable_getters(&self, id: VariableId) -> Vec<GetterId> {
        let mut getters = self
            .variables
            .get(&id)
            .map(|slot| slot.getters.clone())
            .unwrap_or_default();
        self.sort_in_document_order(&mut getters);
        getters
    }

    pub fn variable_position(&self, id: VariableId) -> Option<SlotPosition> {
        self.variables.get(&id).map(|slot| slot.position)
    }

    pub fn importer(&self, name: &str) -> Option<VariableId> {
        self.lists.get(name).map(SlotList::importer)
    }

    /// Slots of `name` in order, importer first.
    pub fn slots(&self, name: &str) -> Vec<VariableId> {
        self.lists
            .get(name)
            .map(|list| list.ids().to_vec())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.lists.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Names read through the importer, i.e. values this scope takes from outside.
    pub fn imported_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .lists
            .iter()
            .filter(|(_, list)| !self.variables[&list.importer()].getters.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Verifies the structural invariants of every slot list.
    ///
    /// Intended for tests; the mutating operations maintain these on their own.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut attached = 0usize;
        for (name, list) in &self.lists {
            let ids = list.ids();
            for (index, id) in ids.iter().enumerate() {
                let slot = self
                    .variables
                    .get(id)
                    .ok_or_else(|| format!("{name}: slot {id:?} missing from arena"))?;
                if slot.index != index {
                    return Err(format!("{name}: slot {id:?} has index {} at {index}", slot.index));
                }
                if slot.name != *name {
                    return Err(format!("{name}: slot {id:?} belongs to {}", slot.name));
                }
                if (index == 0) != slot.position.is_importer() {
                    return Err(format!("{name}: importer not at index 0"));
                }
                let next = ids.get(index + 1).map(|n| self.variables[n].position);
                if let Some(next) = next {
                    if next < slot.position {
                        return Err(format!("{name}: slots out of order at {index}"));
                    }
                }
                for getter_id in &slot.getters {
                    let getter = self
                        .getters
                        .get(getter_id)
                        .ok_or_else(|| format!("{name}: dangling getter {getter_id:?}"))?;
                    if getter.variable != *id {
                        return Err(format!("{name}: getter {getter_id:?} bound elsewhere"));
                    }
                    let key = SlotPosition::At(getter.position);
                    if key < slot.position || next.is_some_and(|next| key >= next) {
                        return Err(format!(
                            "{name}: getter at {} outside [{}, {})",
                            getter.position,
                            slot.position,
                            next.map_or_else(|| "end".to_string(), |n| n.to_string())
                        ));
                    }
                    attached += 1;
                }
            }
            let importer = &self.variables[&list.importer()];
            if list.len() == 1 && importer.getters.is_empty() {
                return Err(format!("{name}: unused list was not collected"));
            }
        }
        if attached != self.getters.len() {
            return Err(format!(
                "{attached} attached getters but {} registered",
                self.getters.len()
            ));
        }
        let slots: usize = self.lists.values().map(SlotList::len).sum();
        if slots != self.variables.len() {
            return Err(format!(
                "{slots} listed slots but {} in arena",
                self.variables.len()
            ));
        }
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_list(&mut self, name: &str, effects: &mut Effects) {
        if self.lists.contains_key(name) {
            return;
        }
        let importer = VariableId(self.alloc_id());
        self.variables.insert(
            importer,
            VariableSlot {
                name: name.to_string(),
                position: SlotPosition::Importer,
                index: 0,
                value: BoundValue::Free,
                getters: Vec::new(),
            },
        );
        self.lists.insert(name.to_string(), SlotList::new(importer));
        effects.created.push(name.to_string());
    }

    fn collect_garbage(&mut self, name: &str, effects: &mut Effects) {
        let Some(list) = self.lists.get(name) else {
            return;
        };
        let importer = list.importer();
        if list.len() == 1 && self.variables[&importer].getters.is_empty() {
            self.lists.remove(name);
            self.variables.remove(&importer);
            effects.dropped.push(name.to_string());
            log::trace!("slot list {name} collected");
        }
    }

    fn position_of(&self, id: VariableId) -> SlotPosition {
        self.variables[&id].position
    }

    /// Slot a getter of `name` at `position` binds to.
    fn predecessor(&self, name: &str, position: Position) -> VariableId {
        let list = &self.lists[name];
        let index = list.upper_bound(position, |id| self.position_of(id));
        list.get(index - 1)
            .expect("slot list lost its importer: getter has no predecessor")
    }

    /// Splices `id` into its name's list at `position`, taking over the
    /// predecessor's getters at or after `position`.
    fn insert_slot(&mut self, id: VariableId, position: Position, rebinds: &mut Rebinds) {
        let name = self.variables[&id].name.clone();
        let list = &self.lists[&name];
        let index = list.upper_bound(position, |v| self.position_of(v));
        let prev = list
            .get(index - 1)
            .expect("slot list lost its importer: variable has no predecessor");

        if let Some(slot) = self.variables.get_mut(&id) {
            slot.position = SlotPosition::At(position);
        }
        if let Some(list) = self.lists.get_mut(&name) {
            list.insert(index, id);
        }
        self.reindex(&name, index);
        self.transfer_getters(prev, id, |g| g >= position, rebinds);
    }

    /// Takes `id` out of its list, handing all of its getters to the predecessor.
    fn detach_slot(&mut self, id: VariableId, rebinds: &mut Rebinds) {
        let slot = &self.variables[&id];
        let name = slot.name.clone();
        let index = slot.index;
        assert!(index > 0, "importer slot {name} cannot be detached");
        let prev = self.lists[&name]
            .get(index - 1)
            .expect("definition slot without predecessor");

        self.transfer_getters(id, prev, |_| true, rebinds);
        if let Some(list) = self.lists.get_mut(&name) {
            list.remove(index);
        }
        self.reindex(&name, index);
    }

    /// Moves the getters of `from` selected by `select(getter_position)` to `to`.
    fn transfer_getters(
        &mut self,
        from: VariableId,
        to: VariableId,
        select: impl Fn(Position) -> bool,
        rebinds: &mut Rebinds,
    ) {
        let Some(source) = self.variables.get_mut(&from) else {
            return;
        };
        let (moved, kept): (Vec<GetterId>, Vec<GetterId>) = source
            .getters
            .iter()
            .partition(|g| select(self.getters[*g].position));
        if moved.is_empty() {
            return;
        }
        source.getters = kept;
        let old_value = source.value.clone();

        for getter in &moved {
            rebinds.record(*getter, &old_value);
            if let Some(entry) = self.getters.get_mut(getter) {
                entry.variable = to;
            }
        }
        if let Some(target) = self.variables.get_mut(&to) {
            target.getters.extend(moved);
        }
    }

    fn reindex(&mut self, name: &str, from: usize) {
        let Some(list) = self.lists.get(name) else {
            return;
        };
        for (index, id) in list.ids().iter().enumerate().skip(from) {
            if let Some(slot) = self.variables.get_mut(id) {
                slot.index = index;
            }
        }
    }

    /// Getters whose observed value differs from before the mutation.
    fn finish(&self, rebinds: Rebinds) -> Vec<GetterId> {
        let mut changed: Vec<GetterId> = rebinds
            .before
            .into_iter()
            .filter(|(id, before)| self.getter_value(*id).is_some_and(|now| now != before))
            .map(|(id, _)| id)
            .collect();
        self.sort_in_document_order(&mut changed);
        changed
    }

    fn sort_in_document_order(&self, getters: &mut [GetterId]) {
        getters.sort_by_key(|id| (self.getters.get(id).map(|g| g.position), *id));
    }
}
