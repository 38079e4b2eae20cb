#![forbid(unsafe_code)]

mod emit;

pub use emit::{CBackendError, VERIFIER_HEADER, cpachecker_primitives, emit_translation_unit};
