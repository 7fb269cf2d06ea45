//! Call frames

use std::rc::Rc;

use brio_core::{CompiledBlock, Pos, Value};

/// Sentinel for "no recover handler installed".
pub const NO_RECOVER: i64 = -1;

/// One activation record. The compiled block is cached here so the
/// dispatch loop does not chase the function object through the heap
/// on every instruction.
#[derive(Debug)]
pub struct Frame {
    pub function: Value,
    pub block: Rc<CompiledBlock>,
    pub ip: usize,
    pub base_pointer: usize,
    /// IP of the opcode currently executing, for tracebacks.
    pub src_ip: usize,
    pub recover_ip: i64,
    pub is_recovering: bool,
}

impl Frame {
    pub fn new(function: Value, block: Rc<CompiledBlock>, base_pointer: usize) -> Frame {
        Frame {
            function,
            block,
            ip: 0,
            base_pointer,
            src_ip: 0,
            recover_ip: NO_RECOVER,
            is_recovering: false,
        }
    }

    /// Source position of the instruction at `src_ip`.
    pub fn current_pos(&self) -> Pos {
        self.block
            .src_positions
            .get(self.src_ip)
            .cloned()
            .unwrap_or_else(Pos::invalid)
    }
}
