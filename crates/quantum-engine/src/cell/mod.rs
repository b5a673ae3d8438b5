//! The per-cell evaluation state machine.
//!
//! A cell owns one expression, the getters and variables that expression
//! needs in its scope, and at most one outstanding backend command. Any input
//! change invalidates the cell: its variables are cleared, placeholders are
//! restored and the in-flight command is cancelled. The cell then evaluates
//! again from scratch.
//!
//! State lives behind `Rc<RefCell<..>>`. The borrow is never held while the
//! cell calls out (into its scope, its backend or its variables), because all
//! of those may call straight back into the cell.

mod plan;

use self::plan::{EvaluationPlan, Step};
use crate::binding::BoundValue;
use crate::cas::{CasBackend, CasCommand, CasOutcome, CommandId};
use crate::error::CellError;
use crate::observe::Subscription;
use crate::position::Position;
use crate::scope::{GetterHandle, Scope, VariableHandle};
use quantum_expr::{evaluable_chain, read_names, strip_results, written_names, Expr};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellStatus {
    /// Nothing to evaluate: no scope, or no evaluable outer form.
    Inert,
    /// At least one input is unset.
    Waiting,
    /// Inputs changed while automatic evaluation is off.
    Stale,
    /// A command is in flight.
    Evaluating,
    Done,
    Failed,
}

/// One cell of a document.
///
/// Cloning yields another handle to the same cell.
#[derive(Clone)]
pub struct ExpressionCell {
    inner: Rc<RefCell<CellState>>,
}

struct CellState {
    expression: Expr,
    position: Position,
    scope: Option<Scope>,
    backend: Rc<dyn CasBackend>,
    getters: BTreeMap<String, GetterEntry>,
    variables: BTreeMap<String, VariableHandle>,
    plan: Option<EvaluationPlan>,
    active: Option<CommandId>,
    /// Bumped by every invalidation; continuations from older runs stop.
    generation: u64,
    status: CellStatus,
    error: Option<CellError>,
    automatic: bool,
    suspended: bool,
    dirty: bool,
}

struct GetterEntry {
    handle: GetterHandle,
    last: BoundValue,
    _subscription: Subscription,
}

impl ExpressionCell {
    /// A detached cell. It does nothing until it is given a scope.
    pub fn new(expression: Expr, position: Position, backend: Rc<dyn CasBackend>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CellState {
                expression,
                position,
                scope: None,
                backend,
                getters: BTreeMap::new(),
                variables: BTreeMap::new(),
                plan: None,
                active: None,
                generation: 0,
                status: CellStatus::Inert,
                error: None,
                automatic: true,
                suspended: false,
                dirty: false,
            })),
        }
    }

    /// The stored expression, including any results spliced in so far.
    pub fn expression(&self) -> Expr {
        self.inner.borrow().expression.clone()
    }

    pub fn position(&self) -> Position {
        self.inner.borrow().position
    }

    pub fn scope(&self) -> Option<Scope> {
        self.inner.borrow().scope.clone()
    }

    pub fn status(&self) -> CellStatus {
        self.inner.borrow().status
    }

    pub fn error(&self) -> Option<CellError> {
        self.inner.borrow().error.clone()
    }

    /// The id of the command this cell is waiting on.
    pub fn active_command(&self) -> Option<CommandId> {
        self.inner.borrow().active.clone()
    }

    /// Names this cell currently reads from its scope.
    pub fn read_names(&self) -> Vec<String> {
        self.inner.borrow().getters.keys().cloned().collect()
    }

    /// Names this cell currently defines in its scope.
    pub fn written_names(&self) -> Vec<String> {
        self.inner.borrow().variables.keys().cloned().collect()
    }

    /// The value this cell has stored for `name`, if it defines `name`.
    pub fn variable_value(&self, name: &str) -> Option<BoundValue> {
        let variable = self.inner.borrow().variables.get(name).cloned();
        variable.map(|variable| variable.value())
    }

    /// The value a read of `name` by this cell currently resolves to.
    pub fn input_value(&self, name: &str) -> Option<BoundValue> {
        let getter = self
            .inner
            .borrow()
            .getters
            .get(name)
            .map(|entry| entry.handle.clone());
        getter.map(|getter| getter.value())
    }

    pub fn is_automatic(&self) -> bool {
        self.inner.borrow().automatic
    }

    /// Turns automatic evaluation on or off.
    ///
    /// A stale cell evaluates as soon as automatic evaluation is turned back on.
    pub fn set_automatic(&self, automatic: bool) {
        let stale = {
            let mut state = self.inner.borrow_mut();
            state.automatic = automatic;
            automatic && state.status == CellStatus::Stale
        };
        if stale {
            self.evaluate();
        }
    }

    /// Moves the cell to another scope, or detaches it with `None`.
    pub fn set_scope(&self, scope: Option<Scope>) {
        let unchanged = {
            let state = self.inner.borrow();
            match (&state.scope, &scope) {
                (Some(current), Some(next)) => current.ptr_eq(next),
                (None, None) => true,
                _ => false,
            }
        };
        if unchanged {
            return;
        }
        log::debug!(
            "cell at {} moves to scope {:?}",
            self.position(),
            scope.as_ref().map(Scope::name)
        );

        self.unregister_all();
        self.inner.borrow_mut().scope = scope;
        self.batch(Self::sync_registrations);
        self.refresh();
    }

    /// Replaces the expression and evaluates it again.
    pub fn set_expression(&self, expression: Expr) {
        self.inner.borrow_mut().expression = expression;
        self.batch(Self::sync_registrations);
        self.refresh();
    }

    /// Moves the cell within its scope.
    ///
    /// Only re-evaluates if the move changed what the cell reads.
    pub fn set_position(&self, position: Position) {
        {
            let mut state = self.inner.borrow_mut();
            if state.position == position {
                return;
            }
            state.position = position;
        }
        if self.batch(Self::sync_registrations) {
            self.refresh();
        }
    }

    /// Invalidates and evaluates, regardless of the automatic flag.
    pub fn recalculate(&self) {
        self.invalidate();
        self.evaluate();
    }

    /// Detaches the cell from its scope and cancels its command.
    pub fn remove(&self) {
        self.set_scope(None);
    }

    /// Runs `f` with input notifications deferred. Returns true if any arrived.
    fn batch(&self, f: impl FnOnce(&Self)) -> bool {
        let outer = std::mem::replace(&mut self.inner.borrow_mut().suspended, true);
        f(self);
        let mut state = self.inner.borrow_mut();
        state.suspended = outer;
        !outer && std::mem::take(&mut state.dirty)
    }

    /// Brings the registered getters and variables in line with the expression.
    ///
    /// Names that are still used keep their handles; they only move.
    fn sync_registrations(&self) {
        let (scope, position, reads, writes) = {
            let state = self.inner.borrow();
            let Some(scope) = state.scope.clone() else {
                return;
            };
            (
                scope,
                state.position,
                read_names(&state.expression),
                written_names(&state.expression),
            )
        };
        // A cell does not see its own definitions.
        let read_position = |name: &str| {
            if writes.contains(name) {
                position.just_before()
            } else {
                position
            }
        };

        let (stale_getters, stale_variables, kept_getters, kept_variables) = {
            let mut state = self.inner.borrow_mut();
            let stale_getters = drain_missing(&mut state.getters, &reads);
            let stale_variables = drain_missing(&mut state.variables, &writes);
            let kept_getters: Vec<GetterHandle> =
                state.getters.values().map(|entry| entry.handle.clone()).collect();
            let kept_variables: Vec<VariableHandle> = state.variables.values().cloned().collect();
            (stale_getters, stale_variables, kept_getters, kept_variables)
        };

        for entry in stale_getters {
            entry.handle.remove();
        }
        for variable in stale_variables {
            variable.remove();
        }
        for variable in kept_variables {
            variable.set_position(position);
        }
        for getter in kept_getters {
            getter.set_position(read_position(getter.name()));
        }

        for name in &writes {
            if self.inner.borrow().variables.contains_key(name) {
                continue;
            }
            let variable = scope.add_variable(name, position);
            self.inner.borrow_mut().variables.insert(name.clone(), variable);
        }
        for name in &reads {
            if self.inner.borrow().getters.contains_key(name) {
                continue;
            }
            let handle = scope.add_getter(name, read_position(name));
            let subscription = {
                let cell = Rc::downgrade(&self.inner);
                let name = name.clone();
                handle.subscribe(move |value| {
                    if let Some(inner) = Weak::upgrade(&cell) {
                        ExpressionCell { inner }.input_changed(&name, value);
                    }
                })
            };
            let last = handle.value();
            self.inner.borrow_mut().getters.insert(
                name.clone(),
                GetterEntry {
                    handle,
                    last,
                    _subscription: subscription,
                },
            );
        }
    }

    /// Drops every registration and the in-flight command.
    fn unregister_all(&self) {
        let (cancelled, backend, getters, variables) = {
            let mut state = self.inner.borrow_mut();
            state.generation += 1;
            state.plan = None;
            (
                state.active.take(),
                Rc::clone(&state.backend),
                std::mem::take(&mut state.getters),
                std::mem::take(&mut state.variables),
            )
        };
        if let Some(id) = cancelled {
            log::debug!("cancelling command {id}");
            backend.cancel(&id);
        }
        for entry in getters.into_values() {
            entry.handle.remove();
        }
        for variable in variables.into_values() {
            variable.remove();
        }
    }

    fn input_changed(&self, name: &str, value: &BoundValue) {
        {
            let mut state = self.inner.borrow_mut();
            let Some(entry) = state.getters.get_mut(name) else {
                return;
            };
            if entry.last == *value {
                return;
            }
            entry.last = value.clone();
            if state.suspended {
                state.dirty = true;
                return;
            }
        }
        log::debug!("input {name} changed for cell at {}", self.position());
        self.refresh();
    }

    fn refresh(&self) {
        self.invalidate();
        if self.is_automatic() {
            self.evaluate();
            return;
        }
        let mut state = self.inner.borrow_mut();
        state.status = if state.scope.is_some() && !evaluable_chain(&state.expression).is_empty() {
            CellStatus::Stale
        } else {
            CellStatus::Inert
        };
    }

    /// Cancels, clears the cell's own definitions and restores placeholders.
    fn invalidate(&self) {
        let (cancelled, backend, variables) = {
            let mut state = self.inner.borrow_mut();
            state.generation += 1;
            state.plan = None;
            state.error = None;
            strip_results(&mut state.expression);
            (
                state.active.take(),
                Rc::clone(&state.backend),
                state.variables.values().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(id) = cancelled {
            log::debug!("cancelling command {id}");
            backend.cancel(&id);
        }
        for variable in variables {
            variable.clear();
        }
    }

    /// Starts a fresh evaluation of the stored expression.
    fn evaluate(&self) {
        let generation = {
            let mut guard = self.inner.borrow_mut();
            let state = &mut *guard;
            state.generation += 1;
            state.plan = None;
            if state.scope.is_none() {
                state.status = CellStatus::Inert;
                return;
            }
            match EvaluationPlan::build(&state.expression) {
                Err(err) => {
                    log::warn!("cell at {}: {err}", state.position);
                    state.error = Some(err);
                    state.status = CellStatus::Failed;
                    return;
                }
                Ok(None) => {
                    state.status = CellStatus::Inert;
                    return;
                }
                Ok(Some(plan)) => {
                    if let Some(name) = state
                        .getters
                        .iter()
                        .find(|(_, entry)| entry.handle.value().is_unset())
                        .map(|(name, _)| name)
                    {
                        log::debug!("cell at {} waits for {name}", state.position);
                        state.status = CellStatus::Waiting;
                        return;
                    }
                    log::trace!("cell at {}: {} stage(s)", state.position, plan.stage_count());
                    state.plan = Some(plan);
                    state.generation
                }
            }
        };
        self.advance(generation);
    }

    /// Runs stages until one needs the backend or the plan is done.
    fn advance(&self, generation: u64) {
        loop {
            let step = {
                let state = self.inner.borrow();
                if state.generation != generation {
                    return;
                }
                match &state.plan {
                    Some(plan) => plan.next_step(&state.expression),
                    None => return,
                }
            };
            match step {
                Step::Finished => {
                    let mut state = self.inner.borrow_mut();
                    state.plan = None;
                    state.status = CellStatus::Done;
                    return;
                }
                Step::Assign { target, value } => {
                    let variable = {
                        let mut guard = self.inner.borrow_mut();
                        let state = &mut *guard;
                        if let Some(plan) = state.plan.as_mut() {
                            plan.complete(&mut state.expression, value.clone());
                        }
                        state.variables.get(&target).cloned()
                    };
                    if let Some(variable) = variable {
                        variable.set_value(value);
                    }
                }
                Step::Dispatch(request) => {
                    self.dispatch(request);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, request: Expr) {
        let (id, inputs, backend) = {
            let mut state = self.inner.borrow_mut();
            let id = CommandId::new();
            state.active = Some(id.clone());
            state.status = CellStatus::Evaluating;
            let inputs: BTreeMap<String, Expr> = state
                .getters
                .iter()
                .filter_map(|(name, entry)| {
                    let value = entry.handle.value();
                    value.as_defined().cloned().map(|expr| (name.clone(), expr))
                })
                .collect();
            (id, inputs, Rc::clone(&state.backend))
        };
        log::debug!("dispatching command {id}: {request}");

        let cell = Rc::downgrade(&self.inner);
        let command_id = id.clone();
        let command = CasCommand::new(id, inputs, request, move |outcome| {
            if let Some(inner) = Weak::upgrade(&cell) {
                ExpressionCell { inner }.receive(&command_id, outcome);
            }
        });
        backend.dispatch(command);
    }

    fn receive(&self, id: &CommandId, outcome: CasOutcome) {
        let (generation, variable, value) = {
            let mut guard = self.inner.borrow_mut();
            let state = &mut *guard;
            if state.active.as_ref() != Some(id) {
                log::debug!("dropping stale result of command {id}");
                return;
            }
            state.active = None;
            let value = match outcome {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("cell at {}: command {id} failed: {err}", state.position);
                    state.plan = None;
                    state.error = Some(CellError::Backend(err));
                    state.status = CellStatus::Failed;
                    return;
                }
            };
            let Some(plan) = state.plan.as_mut() else {
                return;
            };
            let assigned = plan.complete(&mut state.expression, value.clone());
            let variable = assigned.and_then(|target| state.variables.get(&target).cloned());
            (state.generation, variable, value)
        };
        if let Some(variable) = variable {
            variable.set_value(value);
        }
        self.advance(generation);
    }
}

/// Removes and returns the entries whose key is not in `keep`.
fn drain_missing<V>(map: &mut BTreeMap<String, V>, keep: &BTreeSet<String>) -> Vec<V> {
    let stale: Vec<String> = map.keys().filter(|name| !keep.contains(*name)).cloned().collect();
    stale.iter().filter_map(|name| map.remove(name)).collect()
}

impl fmt::Debug for ExpressionCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("ExpressionCell")
            .field("expression", &state.expression)
            .field("position", &state.position)
            .field("scope", &state.scope.as_ref().map(Scope::name))
            .field("status", &state.status)
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}
