//! Stack frame and call stack model
//!
//! The frame layout every compiled function uses, the native stack region
//! frames live in, the call-stack side table and the walker that combines
//! them to enumerate every live slot of every active frame.

pub mod call_stack;
pub mod frame;
mod native;
mod walker;

pub use call_stack::{CallStack, CallStackEntry, CallStackError};
pub use frame::{FrameSlot, SlotKind, StackFrame};
pub use native::NativeStack;
pub use walker::{FrameRef, StackWalker, WalkError};
