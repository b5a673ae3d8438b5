#![forbid(unsafe_code)]

//! Expression values for free-form math documents.
//!
//! Cells store their input as a MathJSON-like [`Expr`]. This crate knows how to
//! read and write that representation, which symbols an expression reads and
//! writes ([`read_names`], [`written_names`]), and which outer shapes are
//! evaluable ([`EvalForm`]).

pub mod deps;
pub mod expr;
pub mod forms;

pub use deps::{read_names, written_names};
pub use expr::{Expr, ExprError, MISSING};
pub use forms::{assignment_targets, evaluable_chain, strip_results, EvalForm, EvalMode};
