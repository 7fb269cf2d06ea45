//! Brio core foundation
//!
//! Shared ground for the compiler and the runtime: the NaN-boxed
//! [`Value`] type, the garbage-collected [`Heap`] that owns every
//! allocated object, source positions, the bounded error list, runtime
//! tracebacks, and the bytecode container types the compiler produces
//! and the VM executes.
//!
//! Nothing in this crate parses or executes anything; it is the data
//! vocabulary the other crates speak.

pub mod bytecode;
pub mod config;
pub mod error;
pub mod global_store;
pub mod heap;
pub mod object;
pub mod opcode;
pub mod position;
pub mod string;
pub mod traceback;
pub mod value;

pub use bytecode::CompiledBlock;
pub use config::{Config, FileReadHook, FileWriteHook, StdoutHook};
pub use error::{BrioError, ErrorKind, ErrorList};
pub use global_store::GlobalStore;
pub use heap::{Handle, Heap};
pub use object::{
    stringify, ErrorObj, ExternalData, MapKey, NativeApi, NativeCallback, NativeFunction, ObjData,
    ScriptFunction, ValueMap,
};
pub use opcode::Opcode;
pub use position::{CompiledFile, Pos};
pub use string::BrioString;
pub use traceback::{Traceback, TracebackEntry};
pub use value::{Value, ValueKind};
