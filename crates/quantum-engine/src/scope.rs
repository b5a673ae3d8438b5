//! Scopes own a [`BindingTable`] and hand out live handles to its slots.
//!
//! Every mutation goes through the table first and only then notifies
//! subscribers, after the scope's borrow has been released. Subscribers are
//! therefore free to mutate the same scope again (which is exactly what a cell
//! does when an input change makes it re-evaluate and write its own variable).

use crate::binding::{BindingTable, BoundValue, Effects, GetterId, VariableId};
use crate::observe::{Subscribers, Subscription};
use crate::position::Position;
use quantum_expr::Expr;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// A region of the document with its own symbol table.
///
/// Cloning a `Scope` clones the handle, not the table.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

struct ScopeInner {
    name: String,
    closed: bool,
    start: Position,
    parent: Option<Scope>,
    state: RefCell<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    table: BindingTable,
    getter_subscribers: HashMap<GetterId, Subscribers<BoundValue>>,
    variable_subscribers: HashMap<VariableId, Subscribers<BoundValue>>,
    imports: HashMap<String, ImportLink>,
}

/// A read in the parent scope that feeds this scope's importer for one name.
struct ImportLink {
    getter: GetterHandle,
    _subscription: Subscription,
}

impl Scope {
    /// A top-level scope. It has nothing to import from.
    pub fn root() -> Self {
        Self::build("root", false, Position::origin(), None)
    }

    /// A scope nested in `self`, starting at `start`.
    ///
    /// An open child imports every name it uses from its parent, read at
    /// `start`. A closed child never imports.
    pub fn child(&self, name: impl Into<String>, start: Position, closed: bool) -> Self {
        Self::build(name, closed, start, Some(self.clone()))
    }

    fn build(name: impl Into<String>, closed: bool, start: Position, parent: Option<Scope>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                name: name.into(),
                closed,
                start,
                parent,
                state: RefCell::new(ScopeState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed
    }

    pub fn start(&self) -> Position {
        self.inner.start
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Declares a definition of `name` at `position`. It starts unset.
    pub fn add_variable(&self, name: &str, position: Position) -> VariableHandle {
        let (id, effects) = self.inner.state.borrow_mut().table.add_variable(name, position);
        self.inner.apply(effects);
        VariableHandle {
            scope: Rc::downgrade(&self.inner),
            id,
            name: name.to_string(),
        }
    }

    /// Declares a read of `name` at `position`.
    pub fn add_getter(&self, name: &str, position: Position) -> GetterHandle {
        let (id, effects) = self.inner.state.borrow_mut().table.add_getter(name, position);
        self.inner.apply(effects);
        GetterHandle {
            scope: Rc::downgrade(&self.inner),
            id,
            name: name.to_string(),
        }
    }

    /// Names this scope currently reads from outside itself.
    pub fn imported_names(&self) -> Vec<String> {
        let state = self.inner.state.borrow();
        state
            .table
            .imported_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Names with at least one definition in this scope.
    pub fn variable_names(&self) -> Vec<String> {
        let state = self.inner.state.borrow();
        state
            .table
            .names()
            .into_iter()
            .filter(|name| state.table.slots(name).len() > 1)
            .map(str::to_string)
            .collect()
    }

    /// Number of slots for `name`, importer included. Zero if the name is unused.
    pub fn slot_count(&self, name: &str) -> usize {
        self.inner.state.borrow().table.slots(name).len()
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.inner.state.borrow().table.check_invariants()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.inner.name)
            .field("closed", &self.inner.closed)
            .field("start", &self.inner.start)
            .field("parent", &self.inner.parent.as_ref().map(Scope::name))
            .finish()
    }
}

impl ScopeInner {
    /// Finishes a table mutation: maintains import links, then notifies.
    fn apply(self: &Rc<Self>, effects: Effects) {
        let Effects {
            mut changed,
            created,
            dropped,
        } = effects;

        for name in &dropped {
            let link = self.state.borrow_mut().imports.remove(name);
            if let Some(link) = link {
                log::trace!("scope {}: stop importing {name}", self.name);
                link.getter.remove();
            }
        }
        for name in &created {
            changed.extend(self.link_import(name));
        }
        self.notify_getters(changed);
    }

    fn link_import(self: &Rc<Self>, name: &str) -> Vec<GetterId> {
        let Some(parent) = self.parent.as_ref().filter(|_| !self.closed) else {
            return Vec::new();
        };
        let getter = parent.add_getter(name, self.start);
        let subscription = {
            let scope = Rc::downgrade(self);
            let name = name.to_string();
            getter.subscribe(move |value| {
                if let Some(scope) = scope.upgrade() {
                    scope.set_import(&name, value.clone());
                }
            })
        };
        let value = getter.value();
        log::trace!("scope {}: importing {name} from {}", self.name, parent.name());

        let mut state = self.state.borrow_mut();
        let effects = state.table.set_import_value(name, value);
        state.imports.insert(
            name.to_string(),
            ImportLink {
                getter,
                _subscription: subscription,
            },
        );
        effects.changed
    }

    fn set_import(self: &Rc<Self>, name: &str, value: BoundValue) {
        let effects = self.state.borrow_mut().table.set_import_value(name, value);
        self.apply(effects);
    }

    fn notify_getters(&self, changed: Vec<GetterId>) {
        for id in changed {
            // Re-read at call time: an earlier subscriber may have changed it again.
            let (value, callbacks) = {
                let state = self.state.borrow();
                let Some(value) = state.table.getter_value(id).cloned() else {
                    continue;
                };
                let callbacks = state
                    .getter_subscribers
                    .get(&id)
                    .map(Subscribers::snapshot)
                    .unwrap_or_default();
                (value, callbacks)
            };
            for callback in callbacks {
                callback(&value);
            }
        }
    }

    fn notify_variable(&self, id: VariableId) {
        let (value, callbacks) = {
            let state = self.state.borrow();
            let Some(value) = state.table.variable_value(id).cloned() else {
                return;
            };
            let callbacks = state
                .variable_subscribers
                .get(&id)
                .map(Subscribers::snapshot)
                .unwrap_or_default();
            (value, callbacks)
        };
        for callback in callbacks {
            callback(&value);
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let imports = std::mem::take(&mut self.state.get_mut().imports);
        for (_, link) in imports {
            link.getter.remove();
        }
    }
}

/// A definition owned by one cell.
#[derive(Debug, Clone)]
pub struct VariableHandle {
    scope: Weak<ScopeInner>,
    id: VariableId,
    name: String,
}

impl VariableHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    /// Current value, or `Unset` once the handle or its scope is gone.
    pub fn value(&self) -> BoundValue {
        self.scope
            .upgrade()
            .and_then(|scope| scope.state.borrow().table.variable_value(self.id).cloned())
            .unwrap_or(BoundValue::Unset)
    }

    pub fn set_value(&self, value: Expr) {
        self.write(BoundValue::Defined(value));
    }

    /// Resets the definition to unset, which blocks every reader until a new value arrives.
    pub fn clear(&self) {
        self.write(BoundValue::Unset);
    }

    fn write(&self, value: BoundValue) {
        let Some(scope) = self.scope.upgrade() else {
            return;
        };
        let (changed, effects) = {
            let mut state = scope.state.borrow_mut();
            let changed = state.table.variable_value(self.id) != Some(&value);
            (changed, state.table.set_variable_value(self.id, value))
        };
        if changed {
            scope.notify_getters(effects.changed);
            scope.notify_variable(self.id);
        }
    }

    pub fn set_position(&self, position: Position) {
        let Some(scope) = self.scope.upgrade() else {
            return;
        };
        let effects = scope.state.borrow_mut().table.move_variable(self.id, position);
        scope.apply(effects);
    }

    /// Calls `callback` with every new value of this definition.
    pub fn subscribe(&self, callback: impl Fn(&BoundValue) + 'static) -> Subscription {
        let Some(scope) = self.scope.upgrade() else {
            return Subscription::new(|| {});
        };
        let key = scope
            .state
            .borrow_mut()
            .variable_subscribers
            .entry(self.id)
            .or_default()
            .insert(Rc::new(callback));
        let weak = Rc::downgrade(&scope);
        let id = self.id;
        Subscription::new(move || {
            if let Some(scope) = weak.upgrade() {
                if let Some(subscribers) = scope.state.borrow_mut().variable_subscribers.get_mut(&id) {
                    subscribers.remove(key);
                }
            }
        })
    }

    /// Removes the definition. Its readers fall back to the previous one.
    pub fn remove(self) {
        let Some(scope) = self.scope.upgrade() else {
            return;
        };
        let effects = {
            let mut state = scope.state.borrow_mut();
            state.variable_subscribers.remove(&self.id);
            state.table.remove_variable(self.id)
        };
        scope.apply(effects);
    }
}

/// A read owned by one cell.
#[derive(Debug, Clone)]
pub struct GetterHandle {
    scope: Weak<ScopeInner>,
    id: GetterId,
    name: String,
}

impl GetterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> GetterId {
        self.id
    }

    /// The value of the definition this read currently resolves to.
    pub fn value(&self) -> BoundValue {
        self.scope
            .upgrade()
            .and_then(|scope| scope.state.borrow().table.getter_value(self.id).cloned())
            .unwrap_or(BoundValue::Unset)
    }

    /// The slot this read currently resolves to.
    pub fn binding(&self) -> Option<VariableId> {
        let scope = self.scope.upgrade()?;
        let binding = scope.state.borrow().table.getter_binding(self.id);
        binding
    }

    pub fn set_position(&self, position: Position) {
        let Some(scope) = self.scope.upgrade() else {
            return;
        };
        let effects = scope.state.borrow_mut().table.move_getter(self.id, position);
        scope.apply(effects);
    }

    /// Calls `callback` whenever the resolved value changes.
    ///
    /// The callback runs synchronously inside whatever mutation caused the
    /// change, after the table is consistent again.
    pub fn subscribe(&self, callback: impl Fn(&BoundValue) + 'static) -> Subscription {
        let Some(scope) = self.scope.upgrade() else {
            return Subscription::new(|| {});
        };
        let key = scope
            .state
            .borrow_mut()
            .getter_subscribers
            .entry(self.id)
            .or_default()
            .insert(Rc::new(callback));
        let weak = Rc::downgrade(&scope);
        let id = self.id;
        Subscription::new(move || {
            if let Some(scope) = weak.upgrade() {
                if let Some(subscribers) = scope.state.borrow_mut().getter_subscribers.get_mut(&id) {
                    subscribers.remove(key);
                }
            }
        })
    }

    pub fn remove(self) {
        let Some(scope) = self.scope.upgrade() else {
            return;
        };
        let effects = {
            let mut state = scope.state.borrow_mut();
            state.getter_subscribers.remove(&self.id);
            state.table.remove_getter(self.id)
        };
        scope.apply(effects);
    }
}
