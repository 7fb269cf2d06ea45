//! Brio runtime
//!
//! Back half of the pipeline: the stack [`Vm`] executing compiled
//! bytecode, the builtin library, and the [`Context`] facade hosts
//! embed. A context owns one interpreter end to end; see
//! [`Context::execute`] for the whole source-to-value path.

pub mod builtins;
pub mod context;
pub mod frame;
pub mod vm;

pub use context::Context;
pub use frame::Frame;
pub use vm::{RunEnv, Vm, FRAMES_SIZE, GLOBALS_SIZE, STACK_SIZE};

// The types hosts need to interact with a context.
pub use brio_core::{
    BrioError, Config, ErrorKind, FileReadHook, FileWriteHook, NativeApi, StdoutHook, Value,
    ValueKind,
};
