//! Inside-out evaluation order for one cell expression.

use crate::error::CellError;
use quantum_expr::forms::inline_request;
use quantum_expr::{assignment_targets, evaluable_chain, EvalForm, EvalMode, Expr};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StageKind {
    /// Inline evaluation. The answer is spliced into `result_path`.
    Inline {
        mode: EvalMode,
        result_path: Vec<usize>,
    },
    /// Assignment to `target`.
    Assign { target: String },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Stage {
    /// Where this stage's operand lives in the cell expression.
    pub(crate) operand_path: Vec<usize>,
    pub(crate) kind: StageKind,
}

/// What to do next.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    /// Ask the backend to evaluate this expression.
    Dispatch(Expr),
    /// Store `value` in the cell's definition of `target`.
    Assign { target: String, value: Expr },
    Finished,
}

/// The evaluable forms of an expression, innermost first, plus a cursor.
///
/// At most one stage is outstanding at a time. The result of each stage is
/// the input of the next one.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EvaluationPlan {
    stages: Vec<Stage>,
    cursor: usize,
    carried: Option<Expr>,
}

impl EvaluationPlan {
    /// Returns `Ok(None)` for inert expressions.
    pub(crate) fn build(expr: &Expr) -> Result<Option<Self>, CellError> {
        let chain = evaluable_chain(expr);
        if chain.is_empty() {
            return Ok(None);
        }

        let mut stages = Vec::with_capacity(chain.len());
        for (path, form) in chain.into_iter().rev() {
            let mut operand_path = path.clone();
            operand_path.push(form.operand_index());
            let kind = match form {
                EvalForm::Assign { target, .. } => StageKind::Assign {
                    target: single_target(target)?,
                },
                EvalForm::Inline { ref mode, .. } => {
                    let mut result_path = path;
                    // Inline forms always carry a result slot.
                    result_path.extend(form.result_index());
                    StageKind::Inline {
                        mode: mode.clone(),
                        result_path,
                    }
                }
            };
            stages.push(Stage { operand_path, kind });
        }
        Ok(Some(Self {
            stages,
            cursor: 0,
            carried: None,
        }))
    }

    /// The stage waiting for an answer, if any.
    pub(crate) fn current(&self) -> Option<&Stage> {
        self.stages.get(self.cursor)
    }

    /// The next action, given the stored cell expression.
    pub(crate) fn next_step(&self, expr: &Expr) -> Step {
        let Some(stage) = self.current() else {
            return Step::Finished;
        };
        match (&stage.kind, &self.carried) {
            // The body was already evaluated by an inner stage.
            (StageKind::Assign { target }, Some(value)) => Step::Assign {
                target: target.clone(),
                value: value.clone(),
            },
            (StageKind::Assign { .. }, None) => {
                Step::Dispatch(operand(expr, &stage.operand_path))
            }
            (StageKind::Inline { mode, .. }, carried) => {
                let input = carried
                    .clone()
                    .unwrap_or_else(|| operand(expr, &stage.operand_path));
                Step::Dispatch(inline_request(mode, input))
            }
        }
    }

    /// Records the answer to the current stage and moves on.
    ///
    /// Returns the assignment the answer completes, if the current stage is an
    /// assignment.
    pub(crate) fn complete(&mut self, expr: &mut Expr, value: Expr) -> Option<String> {
        let stage = self.stages.get(self.cursor)?;
        let assigned = match &stage.kind {
            StageKind::Inline { result_path, .. } => {
                expr.replace_at(result_path, value.clone());
                None
            }
            StageKind::Assign { target } => Some(target.clone()),
        };
        self.cursor += 1;
        self.carried = Some(value);
        assigned
    }

    pub(crate) fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

fn operand(expr: &Expr, path: &[usize]) -> Expr {
    expr.at_path(path).cloned().unwrap_or_else(Expr::missing)
}

fn single_target(target: &Expr) -> Result<String, CellError> {
    let names = assignment_targets(target);
    match names.as_slice() {
        [name] => Ok((*name).to_string()),
        [] => Err(CellError::InvalidAssignmentTarget(target.clone())),
        _ => Err(CellError::MultipleAssignmentTargets {
            names: names.iter().map(|name| name.to_string()).collect(),
        }),
    }
}
