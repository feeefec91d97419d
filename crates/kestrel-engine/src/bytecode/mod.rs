//! Resolved bytecode
//!
//! The loader boundary: instruction streams whose operands are already
//! resolved to type ids, function ids and field offsets, the function
//! descriptors that own them, and the verifier that produces the
//! per-instruction operand-type snapshots the collector relies on.

mod builder;
mod function;
mod instruction;
pub mod verifier;

pub use builder::{BuildError, FunctionBody, FunctionBuilder, Label};
pub use function::{FunctionDefinition, FunctionId, ManagedFunction, NativeRoutine};
pub use instruction::{Condition, FieldRef, Instruction};
pub use verifier::{verify, VerifyError, VerifyErrorKind};
