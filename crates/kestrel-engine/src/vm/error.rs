//! VM error taxonomy

use super::config::ConfigError;
use super::gc::GcError;
use super::stack::WalkError;
use crate::bytecode::{BuildError, VerifyError};
use crate::jit::CompileError;
use crate::memory::MemoryError;
use crate::types::TypeError;
use std::fmt;
use thiserror::Error;

/// Fatal conditions raised by compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Array created with a negative length
    InvalidArrayCreation,
    /// Element index outside `0..length`
    ArrayOutOfBounds,
    /// Field, element, length or instance-call access through null
    NullReference,
    /// Native stack or call stack exhausted
    StackOverflow,
    /// Integer division by zero
    DivideByZero,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrapKind::InvalidArrayCreation => "InvalidArrayCreation",
            TrapKind::ArrayOutOfBounds => "ArrayOutOfBoundsError",
            TrapKind::NullReference => "NullReferenceError",
            TrapKind::StackOverflow => "StackOverflow",
            TrapKind::DivideByZero => "DivideByZeroError",
        })
    }
}

/// A runtime trap with its diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Trap {
    pub kind: TrapKind,
    pub message: String,
}

/// Load unit errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Two functions with one signature
    #[error("function {0} is declared twice")]
    DuplicateFunction(String),

    /// No `main` in the unit
    #[error("no main function declared")]
    MissingMain,

    /// `main` is not `main() -> Int`
    #[error("main must take no arguments and return Int, found {0}")]
    MalformedMain(String),

    /// A called function was declared but never given a body
    #[error("{caller} calls {callee}, which has no body")]
    UnresolvedCallee { caller: String, callee: String },

    /// A VM accepts a single load unit
    #[error("a load unit has already been loaded")]
    AlreadyLoaded,

    /// The operation needs a loaded unit
    #[error("no load unit has been loaded")]
    NotLoaded,

    #[error("unknown function id")]
    UnknownFunction,

    #[error("function {0} already has a body")]
    BodyAlreadyDefined(String),

    #[error("function {0} is implemented by the runtime")]
    NativeBody(String),

    /// Wrong number of arguments passed to an entry point
    #[error("{function} takes {expected} arguments, {found} given")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },
}

/// VM execution errors
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Runtime trap; execution stopped
    #[error("trap: {0}")]
    Trap(#[from] Trap),

    /// The single heap generation is full
    #[error("heap exhausted: requested {requested} bytes, {available} available")]
    HeapExhausted { requested: usize, available: usize },

    /// Stack walk failed during a collection or call-stack print
    #[error("stack walk failed: {0}")]
    Walk(#[from] WalkError),

    #[error("garbage collection failed: {0}")]
    Gc(#[from] GcError),

    /// Compiled code did something the ABI rules out
    #[error("machine fault at {address:#x}: {reason}")]
    Fault { address: u64, reason: String },

    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// Process exit status an embedder should report
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::Trap(_) => 3,
            VmError::HeapExhausted { .. } => 4,
            VmError::Load(_)
            | VmError::Verify(_)
            | VmError::Compile(_)
            | VmError::Type(_)
            | VmError::Build(_)
            | VmError::Config(_) => 2,
            _ => 1,
        }
    }

    /// The trap kind, if execution stopped on a trap
    pub fn trap_kind(&self) -> Option<TrapKind> {
        match self {
            VmError::Trap(trap) => Some(trap.kind),
            _ => None,
        }
    }
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
