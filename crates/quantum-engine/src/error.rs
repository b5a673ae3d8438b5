use crate::document::{CellId, ScopeId};
use crate::position::Position;
use quantum_expr::Expr;
use thiserror::Error;

/// Failure reported by the computer-algebra backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CasError {
    #[error("backend error: {0}")]
    Failed(String),
    #[error("malformed backend reply: {0}")]
    MalformedReply(String),
}

/// A problem local to one cell. It never affects the cell's neighbours.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CellError {
    #[error("cannot assign to more than one name at once: {}", names.join(", "))]
    MultipleAssignmentTargets { names: Vec<String> },
    #[error("invalid assignment target {0}")]
    InvalidAssignmentTarget(Expr),
    #[error(transparent)]
    Backend(#[from] CasError),
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("unknown cell {0}")]
    UnknownCell(CellId),
    #[error("unknown scope {0}")]
    UnknownScope(ScopeId),
    #[error("scope region must end after it starts (start {start}, end {end})")]
    InvalidRegion { start: Position, end: Position },
    #[error("invalid document options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}
