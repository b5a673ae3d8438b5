//! Recognition of the two evaluable outer forms.
//!
//! * Assignment: `["Assign", target, body]`
//! * Inline evaluation, numeric: `["Equal", operand, result]`
//! * Inline evaluation, symbolic: `["Evaluate", operand, directive, result]`
//!
//! The `result` slot holds [`MISSING`] until the backend answers. Every other
//! shape is inert.

use crate::expr::{Expr, MISSING};

pub const ASSIGN: &str = "Assign";
pub const EQUAL: &str = "Equal";
pub const EVALUATE: &str = "Evaluate";
/// Arrow form (`lhs -> rhs`). Not evaluable, but only its left side is read.
pub const TO: &str = "To";

/// Heads accepted as a multi-name assignment target, e.g. `["List", "a", "b"]`.
const TARGET_LIST_HEADS: [&str; 4] = ["List", "Sequence", "Delimiter", "Tuple"];

/// How an inline evaluation asks the backend to compute its operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalMode {
    Numeric,
    /// Symbolic evaluation with an optional directive such as `solve`.
    Symbolic { directive: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalForm<'a> {
    Assign {
        target: &'a Expr,
        body: &'a Expr,
    },
    Inline {
        mode: EvalMode,
        operand: &'a Expr,
        result: &'a Expr,
    },
}

impl<'a> EvalForm<'a> {
    pub fn classify(expr: &'a Expr) -> Option<Self> {
        let Expr::Function { head, args } = expr else {
            return None;
        };
        match (head.as_str(), args.as_slice()) {
            (ASSIGN, [target, body]) => Some(EvalForm::Assign { target, body }),
            (EQUAL, [operand, result]) => Some(EvalForm::Inline {
                mode: EvalMode::Numeric,
                operand,
                result,
            }),
            (EVALUATE, [operand, directive, result]) => Some(EvalForm::Inline {
                mode: EvalMode::Symbolic {
                    directive: directive_name(directive),
                },
                operand,
                result,
            }),
            _ => None,
        }
    }

    /// The argument evaluated by this form (assignment body or inline operand).
    pub fn operand(&self) -> &'a Expr {
        match self {
            EvalForm::Assign { body, .. } => *body,
            EvalForm::Inline { operand, .. } => *operand,
        }
    }

    /// Argument index of [`EvalForm::operand`] inside the function application.
    pub fn operand_index(&self) -> usize {
        match self {
            EvalForm::Assign { .. } => 1,
            EvalForm::Inline { .. } => 0,
        }
    }

    /// Argument index of the result slot, if the form has one.
    pub fn result_index(&self) -> Option<usize> {
        match self {
            EvalForm::Assign { .. } => None,
            EvalForm::Inline {
                mode: EvalMode::Numeric,
                ..
            } => Some(1),
            EvalForm::Inline {
                mode: EvalMode::Symbolic { .. },
                ..
            } => Some(2),
        }
    }
}

fn directive_name(directive: &Expr) -> Option<String> {
    if directive.is_missing() {
        return None;
    }
    match directive {
        Expr::Symbol(name) | Expr::String(name) if !name.trim().is_empty() => {
            Some(name.trim().to_string())
        }
        _ => None,
    }
}

/// Symbols named by an assignment target.
///
/// A plain symbol yields one name; list-like heads yield every symbol argument.
/// Any other target yields nothing.
pub fn assignment_targets(target: &Expr) -> Vec<&str> {
    match target {
        Expr::Symbol(name) if name != MISSING => vec![name.as_str()],
        Expr::Function { head, args } if TARGET_LIST_HEADS.contains(&head.as_str()) => {
            args.iter().filter_map(Expr::as_symbol).collect()
        }
        _ => Vec::new(),
    }
}

/// Walks the chain of nested evaluable forms starting at the root.
///
/// Yields `(path, form)` outermost first, where `path` addresses the form
/// inside `expr`.
pub fn evaluable_chain(expr: &Expr) -> Vec<(Vec<usize>, EvalForm<'_>)> {
    let mut chain = Vec::new();
    let mut path = Vec::new();
    let mut node = expr;
    while let Some(form) = EvalForm::classify(node) {
        let next_index = form.operand_index();
        let next = form.operand();
        chain.push((path.clone(), form));
        path.push(next_index);
        node = next;
    }
    chain
}

/// Resets every result slot along the evaluable chain to the placeholder.
///
/// Returns true if anything changed.
pub fn strip_results(expr: &mut Expr) -> bool {
    let slots: Vec<Vec<usize>> = evaluable_chain(expr)
        .into_iter()
        .filter_map(|(mut path, form)| {
            let slot = form.result_index()?;
            let occupied = match &form {
                EvalForm::Inline { result, .. } => !result.is_missing(),
                EvalForm::Assign { .. } => false,
            };
            occupied.then(|| {
                path.push(slot);
                path
            })
        })
        .collect();

    for path in &slots {
        expr.replace_at(path, Expr::missing());
    }
    !slots.is_empty()
}

/// Builds the backend request for an inline evaluation of `input`.
pub fn inline_request(mode: &EvalMode, input: Expr) -> Expr {
    match mode {
        EvalMode::Numeric => Expr::function(EQUAL, vec![input, Expr::missing()]),
        EvalMode::Symbolic { directive } => {
            let directive = directive
                .as_deref()
                .map(Expr::string)
                .unwrap_or_else(Expr::missing);
            Expr::function(EVALUATE, vec![input, directive, Expr::missing()])
        }
    }
}
