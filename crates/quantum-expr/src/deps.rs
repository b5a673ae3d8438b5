//! Dependency extraction: which names an expression reads and which it writes.

use crate::expr::Expr;
use crate::forms::{assignment_targets, evaluable_chain, EvalForm, ASSIGN, EQUAL, EVALUATE, TO};
use std::collections::BTreeSet;

/// Names read by `expr` (its getters).
///
/// Result slots, solve directives and assignment targets are not reads. The
/// placeholder symbol is never reported.
pub fn read_names(expr: &Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_reads(expr, &mut names);
    names
}

/// Names written by `expr` (its variable definitions).
///
/// Only assignments on the evaluable chain write, so `["Equal", ["Assign", "a", 1], "Missing"]`
/// defines `a` while `["Add", ["Assign", "a", 1], 2]` defines nothing.
pub fn written_names(expr: &Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for (_, form) in evaluable_chain(expr) {
        if let EvalForm::Assign { target, .. } = form {
            names.extend(assignment_targets(target).into_iter().map(str::to_string));
        }
    }
    names
}

fn collect_reads(expr: &Expr, names: &mut BTreeSet<String>) {
    if expr.is_missing() {
        return;
    }
    match expr {
        Expr::Symbol(name) => {
            names.insert(name.clone());
        }
        Expr::Function { head, args } => match head.as_str() {
            ASSIGN => {
                if let Some(body) = args.get(1) {
                    collect_reads(body, names);
                }
            }
            EQUAL | EVALUATE | TO => {
                if let Some(lhs) = args.first() {
                    collect_reads(lhs, names);
                }
            }
            _ => {
                for arg in args {
                    collect_reads(arg, names);
                }
            }
        },
        Expr::Number(_) | Expr::String(_) => {}
    }
}
