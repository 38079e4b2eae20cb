#![forbid(unsafe_code)]

//! Reference interpreter for instrumented programs. Values are exact
//! rationals, so the budget arithmetic of the instrumentation is checked
//! without floating-point slack.

mod error;
mod value;
mod vm;

pub use error::InterpretError;
pub use value::Value;
pub use vm::{Interpreter, Nondet, Outcome, Queue, Run};
