//! Kestrel runtime
//!
//! Configuration, the error taxonomy, the runtime interface compiled code
//! calls back into, the machine that executes compiled code, and the [`Vm`]
//! facade that owns one load unit with its heap and stacks.

pub mod config;
pub mod defaults;
mod error;
pub mod gc;
mod interface;
mod machine;
mod runtime;
pub mod stack;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{LoadError, Trap, TrapKind, VmError, VmResult};
pub use interface::RuntimeInterface;
pub use machine::{Machine, Registers, HALT_ADDRESS};
pub use runtime::{Builtins, CapturedOutput, Vm};
