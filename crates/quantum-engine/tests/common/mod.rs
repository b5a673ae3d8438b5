#![allow(dead_code)]

use quantum_engine::{
    CasBackend, CasCommand, CasError, CasOutcome, CommandId, Expr, ExpressionCell, Position, Scope,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

pub fn at(y: f64) -> Position {
    Position::new(0.0, y)
}

/// A cell at `(0, y)` attached to `scope`.
pub fn cell<B: CasBackend + 'static>(scope: &Scope, backend: &Rc<B>, y: f64, expr: Expr) -> ExpressionCell {
    let backend: Rc<dyn CasBackend> = Rc::clone(backend) as Rc<dyn CasBackend>;
    let cell = ExpressionCell::new(expr, at(y), backend);
    cell.set_scope(Some(scope.clone()));
    cell
}

pub fn num(value: f64) -> Expr {
    Expr::number(value)
}

pub fn add(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::function("Add", vec![a.into(), b.into()])
}

pub fn assign(name: &str, body: Expr) -> Expr {
    Expr::function("Assign", vec![Expr::symbol(name), body])
}

/// `body =` with an empty result slot.
pub fn numeric(body: Expr) -> Expr {
    Expr::function("Equal", vec![body, Expr::missing()])
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Dispatched {
        id: CommandId,
        expression: Expr,
        inputs: BTreeMap<String, Expr>,
    },
    Cancelled(CommandId),
}

/// Holds every command until the test answers it, including cancelled ones,
/// so late answers can be delivered on purpose.
#[derive(Default)]
pub struct RecordingBackend {
    commands: RefCell<Vec<CasCommand>>,
    events: RefCell<Vec<Event>>,
}

impl RecordingBackend {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn dispatched(&self) -> Vec<Expr> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Dispatched { expression, .. } => Some(expression.clone()),
                Event::Cancelled(_) => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> Vec<CommandId> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Cancelled(id) => Some(id.clone()),
                Event::Dispatched { .. } => None,
            })
            .collect()
    }

    /// Ids of commands not answered yet, oldest first.
    pub fn unanswered(&self) -> Vec<CommandId> {
        self.commands
            .borrow()
            .iter()
            .map(|command| command.id().clone())
            .collect()
    }

    pub fn answer(&self, id: &CommandId, outcome: CasOutcome) {
        let command = {
            let mut commands = self.commands.borrow_mut();
            let index = commands
                .iter()
                .position(|command| command.id() == id)
                .unwrap_or_else(|| panic!("no command {id}"));
            commands.remove(index)
        };
        command.fulfill(outcome);
    }

    /// Answers the most recent command with `value`.
    pub fn answer_latest(&self, value: Expr) {
        let id = self
            .unanswered()
            .last()
            .cloned()
            .expect("no command to answer");
        self.answer(&id, Ok(value));
    }
}

impl CasBackend for RecordingBackend {
    fn dispatch(&self, command: CasCommand) {
        self.events.borrow_mut().push(Event::Dispatched {
            id: command.id().clone(),
            expression: command.expression().clone(),
            inputs: command.inputs().clone(),
        });
        self.commands.borrow_mut().push(command);
    }

    fn cancel(&self, id: &CommandId) {
        self.events.borrow_mut().push(Event::Cancelled(id.clone()));
    }
}

/// Answers every command before `dispatch` returns, with a tiny arithmetic evaluator.
#[derive(Default)]
pub struct ImmediateBackend {
    dispatched: RefCell<Vec<Expr>>,
}

impl ImmediateBackend {
    pub fn dispatched(&self) -> Vec<Expr> {
        self.dispatched.borrow().clone()
    }
}

impl CasBackend for ImmediateBackend {
    fn dispatch(&self, command: CasCommand) {
        self.dispatched
            .borrow_mut()
            .push(command.expression().clone());
        let outcome = evaluate(command.expression(), command.inputs());
        command.fulfill(outcome);
    }

    fn cancel(&self, _id: &CommandId) {}
}

pub fn evaluate(expr: &Expr, inputs: &BTreeMap<String, Expr>) -> CasOutcome {
    match expr {
        Expr::Number(_) | Expr::String(_) => Ok(expr.clone()),
        Expr::Symbol(name) => Ok(inputs.get(name).cloned().unwrap_or_else(|| expr.clone())),
        Expr::Function { head, args } => match (head.as_str(), args.as_slice()) {
            ("Equal", [operand, _]) => evaluate(operand, inputs),
            ("Evaluate", [Expr::Function { head, args }, _, _]) if head == "EqualEqual" => {
                // Solves `symbol == value` for the symbol.
                match args.as_slice() {
                    [Expr::Symbol(_), value] => evaluate(value, inputs),
                    _ => Err(CasError::Failed("cannot solve".to_string())),
                }
            }
            ("Evaluate", [operand, _, _]) => evaluate(operand, inputs),
            ("Add", _) | ("Multiply", _) => {
                let mut acc = if head == "Add" { 0.0 } else { 1.0 };
                for arg in args {
                    let value = evaluate(arg, inputs)?;
                    let Some(n) = value.as_number() else {
                        return Err(CasError::Failed(format!("not a number: {value}")));
                    };
                    acc = if head == "Add" { acc + n } else { acc * n };
                }
                Ok(Expr::number(acc))
            }
            ("Divide", [a, b]) => {
                let a = evaluate(a, inputs)?.as_number();
                let b = evaluate(b, inputs)?.as_number();
                match (a, b) {
                    (_, Some(b)) if b == 0.0 => Err(CasError::Failed("division by zero".to_string())),
                    (Some(a), Some(b)) => Ok(Expr::number(a / b)),
                    _ => Err(CasError::Failed("not a number".to_string())),
                }
            }
            _ => Err(CasError::Failed(format!("unsupported: {expr}"))),
        },
    }
}
