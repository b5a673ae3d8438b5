#![forbid(unsafe_code)]

//! Spatial symbol binding and per-cell evaluation for free-form math documents.
//!
//! Cells sit at arbitrary 2-D positions. A read of a name resolves to the
//! nearest preceding definition of that name in reading order (see
//! [`Position`]), and the [`BindingTable`] keeps those links correct while
//! cells move around. Each [`ExpressionCell`] watches the values it reads,
//! re-evaluates through a [`CasBackend`] when they change, and writes its
//! results back into the definitions it owns.
//!
//! Everything here is single-threaded. Notification is synchronous and
//! depth-first: when a definition changes, every dependent cell has reacted
//! before the call that changed it returns.

pub mod binding;
pub mod cas;
pub mod cell;
pub mod document;
pub mod error;
mod observe;
pub mod options;
pub mod position;
pub mod scope;

pub use binding::{BindingTable, BoundValue, Effects, GetterId, SlotPosition, VariableId};
pub use cas::{
    CasBackend, CasCommand, CasOutcome, CasReply, CommandEnvelope, CommandId, CommandQueue,
    ReplyOutcome,
};
pub use cell::{CellStatus, ExpressionCell};
pub use document::{CellId, Document, ScopeId};
pub use error::{CasError, CellError, DocumentError};
pub use observe::Subscription;
pub use options::{CalculationMode, DocumentOptions};
pub use position::{Position, Size, Span};
pub use scope::{GetterHandle, Scope, VariableHandle};

pub use quantum_expr::{self as expr, Expr};
