//! Per-source transformation environment.
//!
//! Each source configuration carries a filter expression and topic/partition
//! expressions or templates. The forwarder talks to the capability interface
//! [`TransformEnv`] only; the built-in implementation [`ExprEnv`] evaluates a
//! small sandboxed expression language with no ambient authority (no I/O, no
//! clock beyond the record's own timestamps).

mod env;
mod expr;
mod template;

pub use env::{ExprEnv, FilterResult, FilterVerdict, TransformEnv};
pub use expr::{CompiledExpr, Value};
pub use template::Template;
