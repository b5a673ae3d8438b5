mod common;

use common::{add, assign, at, cell, num, numeric, Event, ImmediateBackend, RecordingBackend};
use pretty_assertions::assert_eq;
use quantum_engine::{BoundValue, CasError, CellError, CellStatus, Expr, Scope};
use std::collections::BTreeMap;
use std::rc::Rc;

fn solve(equation: Expr) -> Expr {
    Expr::function("Evaluate", vec![equation, Expr::string("solve"), Expr::missing()])
}

fn equals(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::function("EqualEqual", vec![a.into(), b.into()])
}

#[test]
fn assignment_of_inline_evaluation_dispatches_once() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let a = cell(&scope, &backend, 0.0, assign("a", numeric(add(3.0, 2.0))));

    assert_eq!(backend.dispatched(), vec![numeric(add(3.0, 2.0))]);
    assert_eq!(a.status(), CellStatus::Evaluating);

    backend.answer_latest(num(5.0));
    assert_eq!(backend.dispatched().len(), 1);
    assert_eq!(a.status(), CellStatus::Done);
    assert_eq!(a.variable_value("a"), Some(BoundValue::Defined(num(5.0))));
    assert_eq!(
        a.expression(),
        assign(
            "a",
            Expr::function("Equal", vec![add(3.0, 2.0), num(5.0)])
        )
    );
}

#[test]
fn plain_assignment_evaluates_its_body() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let a = cell(&scope, &backend, 0.0, assign("a", add(1.0, 1.0)));

    assert_eq!(backend.dispatched(), vec![add(1.0, 1.0)]);
    assert_eq!(a.variable_value("a"), Some(BoundValue::Defined(num(2.0))));
    // No result slot: the expression is unchanged.
    assert_eq!(a.expression(), assign("a", add(1.0, 1.0)));
}

#[test]
fn solve_without_nesting_is_one_command() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let c = cell(&scope, &backend, 0.0, solve(equals("y", 3.0)));

    assert_eq!(backend.dispatched(), vec![solve(equals("y", 3.0))]);
    assert_eq!(
        c.expression(),
        Expr::function("Evaluate", vec![equals("y", 3.0), Expr::string("solve"), num(3.0)])
    );
    // `y` is free, which does not block evaluation.
    assert_eq!(c.input_value("y"), Some(BoundValue::Free));
}

#[test]
fn nested_evaluation_runs_inside_out() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let c = cell(&scope, &backend, 0.0, numeric(solve(equals("y", 3.0))));

    // Only the inner command is in flight.
    assert_eq!(backend.dispatched(), vec![solve(equals("y", 3.0))]);
    backend.answer_latest(num(3.0));

    // The inner placeholder is filled while the outer command runs.
    assert_eq!(
        c.expression(),
        numeric(Expr::function(
            "Evaluate",
            vec![equals("y", 3.0), Expr::string("solve"), num(3.0)]
        ))
    );
    assert_eq!(backend.dispatched().last(), Some(&numeric(num(3.0))));
    assert_eq!(c.status(), CellStatus::Evaluating);

    backend.answer_latest(num(3.0));
    assert_eq!(c.status(), CellStatus::Done);
    assert_eq!(c.expression().at_path(&[1]), Some(&num(3.0)));
}

#[test]
fn changes_propagate_depth_first_before_returning() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let c1 = cell(&scope, &backend, 0.0, assign("a", num(2.0)));
    let c2 = cell(&scope, &backend, 1.0, assign("b", add("a", 1.0)));
    let c3 = cell(&scope, &backend, 2.0, numeric(Expr::symbol("b")));
    assert_eq!(c3.expression(), Expr::function("Equal", vec!["b".into(), num(3.0)]));

    let before = backend.dispatched().len();
    c1.set_expression(assign("a", num(5.0)));

    assert_eq!(
        backend.dispatched()[before..].to_vec(),
        vec![num(5.0), add("a", 1.0), numeric(Expr::symbol("b"))]
    );
    assert_eq!(c2.variable_value("b"), Some(BoundValue::Defined(num(6.0))));
    assert_eq!(c3.expression(), Expr::function("Equal", vec!["b".into(), num(6.0)]));
    assert_eq!(c3.status(), CellStatus::Done);
}

#[test]
fn dependents_wait_for_unset_inputs() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let c1 = cell(&scope, &backend, 0.0, assign("a", add(1.0, 2.0)));
    let c2 = cell(&scope, &backend, 1.0, numeric(add("a", 1.0)));

    assert_eq!(c1.status(), CellStatus::Evaluating);
    assert_eq!(c2.status(), CellStatus::Waiting);
    assert_eq!(backend.dispatched().len(), 1);

    backend.answer_latest(num(3.0));
    assert_eq!(c2.status(), CellStatus::Evaluating);
    match backend.events().last() {
        Some(Event::Dispatched { inputs, expression, .. }) => {
            assert_eq!(expression, &numeric(add("a", 1.0)));
            assert_eq!(inputs, &BTreeMap::from([("a".to_string(), num(3.0))]));
        }
        other => panic!("expected a dispatch, got {other:?}"),
    }
}

#[test]
fn late_result_of_cancelled_command_is_dropped() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let c = cell(&scope, &backend, 0.0, numeric(add(1.0, 1.0)));
    let first = c.active_command().unwrap();

    c.set_expression(numeric(add(2.0, 2.0)));
    let second = c.active_command().unwrap();
    assert_ne!(first, second);
    assert_eq!(backend.cancelled(), vec![first.clone()]);

    backend.answer(&second, Ok(num(4.0)));
    backend.answer(&first, Ok(num(2.0)));

    assert_eq!(c.expression(), Expr::function("Equal", vec![add(2.0, 2.0), num(4.0)]));
    assert_eq!(c.status(), CellStatus::Done);
}

#[test]
fn input_change_cancels_and_restores_placeholders() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let c1 = cell(&scope, &backend, 0.0, assign("a", num(1.0)));
    backend.answer_latest(num(1.0));
    let c2 = cell(&scope, &backend, 1.0, numeric(add("a", 1.0)));
    backend.answer_latest(num(2.0));
    assert_eq!(c2.expression().at_path(&[1]), Some(&num(2.0)));

    c1.set_expression(assign("a", num(10.0)));
    // c2 lost its input, so its old result is gone.
    assert_eq!(c2.status(), CellStatus::Waiting);
    assert!(c2.expression().at_path(&[1]).unwrap().is_missing());

    backend.answer_latest(num(10.0));
    let pending = c2.active_command().unwrap();
    c1.set_expression(assign("a", num(20.0)));
    assert!(backend.cancelled().contains(&pending));
    assert_eq!(c2.active_command(), None);
}

#[test]
fn multiple_assignment_targets_fail_locally() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let target = Expr::function("List", vec!["a".into(), "b".into()]);
    let bad = cell(&scope, &backend, 0.0, Expr::function("Assign", vec![target, num(1.0)]));
    let reader = cell(&scope, &backend, 1.0, numeric(Expr::symbol("a")));
    let neighbour = cell(&scope, &backend, 2.0, assign("c", num(3.0)));

    assert_eq!(bad.status(), CellStatus::Failed);
    assert_eq!(
        bad.error(),
        Some(CellError::MultipleAssignmentTargets {
            names: vec!["a".to_string(), "b".to_string()]
        })
    );
    assert_eq!(reader.status(), CellStatus::Waiting);
    assert_eq!(neighbour.status(), CellStatus::Done);

    // The next edit retries from scratch.
    bad.set_expression(assign("a", num(4.0)));
    assert_eq!(bad.error(), None);
    assert_eq!(reader.expression().at_path(&[1]), Some(&num(4.0)));
}

#[test]
fn backend_failure_keeps_dependents_waiting() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let divide = |a: f64, b: f64| Expr::function("Divide", vec![num(a), num(b)]);
    let c1 = cell(&scope, &backend, 0.0, assign("a", divide(1.0, 0.0)));
    let c2 = cell(&scope, &backend, 1.0, assign("b", add("a", 1.0)));

    assert_eq!(c1.status(), CellStatus::Failed);
    assert_eq!(
        c1.error(),
        Some(CellError::Backend(CasError::Failed("division by zero".to_string())))
    );
    assert_eq!(c1.variable_value("a"), Some(BoundValue::Unset));
    assert_eq!(c2.status(), CellStatus::Waiting);

    c1.set_expression(assign("a", divide(1.0, 4.0)));
    assert_eq!(c2.variable_value("b"), Some(BoundValue::Defined(num(1.25))));
}

#[test]
fn a_cell_reads_the_previous_definition_of_a_name_it_writes() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let _c1 = cell(&scope, &backend, 0.0, assign("x", num(1.0)));
    let c2 = cell(&scope, &backend, 1.0, assign("x", add("x", 1.0)));
    let c3 = cell(&scope, &backend, 2.0, numeric(Expr::symbol("x")));

    assert_eq!(c2.input_value("x"), Some(BoundValue::Defined(num(1.0))));
    assert_eq!(c2.variable_value("x"), Some(BoundValue::Defined(num(2.0))));
    assert_eq!(c3.expression().at_path(&[1]), Some(&num(2.0)));
}

#[test]
fn moving_a_definition_rebinds_readers() {
    let scope = Scope::root();
    let backend = Rc::new(ImmediateBackend::default());
    let c1 = cell(&scope, &backend, 0.0, assign("a", num(1.0)));
    let c2 = cell(&scope, &backend, 1.0, numeric(Expr::symbol("a")));
    assert_eq!(c2.expression().at_path(&[1]), Some(&num(1.0)));

    // Past the reader: `a` is free again and evaluates to itself.
    c1.set_position(at(5.0));
    assert_eq!(c2.input_value("a"), Some(BoundValue::Free));
    assert_eq!(c2.expression().at_path(&[1]), Some(&Expr::symbol("a")));

    // Moving the reader below the definition picks it up again.
    c2.set_position(at(6.0));
    assert_eq!(c2.expression().at_path(&[1]), Some(&num(1.0)));
    scope.check_invariants().unwrap();
}

#[test]
fn removing_a_cell_cancels_its_command() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let c = cell(&scope, &backend, 0.0, assign("a", add(1.0, 2.0)));
    let pending = c.active_command().unwrap();

    c.remove();
    assert_eq!(c.status(), CellStatus::Inert);
    assert_eq!(backend.cancelled(), vec![pending.clone()]);
    assert_eq!(scope.slot_count("a"), 0);

    backend.answer(&pending, Ok(num(3.0)));
    assert_eq!(c.variable_value("a"), None);
    assert!(c.expression().at_path(&[1]).is_some());
}

#[test]
fn inert_expressions_never_dispatch() {
    let scope = Scope::root();
    let backend = Rc::new(RecordingBackend::default());
    let c = cell(&scope, &backend, 0.0, add("x", 1.0));
    assert_eq!(c.status(), CellStatus::Inert);
    assert_eq!(c.read_names(), vec!["x".to_string()]);
    assert!(backend.dispatched().is_empty());
}
