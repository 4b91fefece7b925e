//! One call frame per active function invocation, kept on the VM's own
//! frame stack (never the host call stack directly, though this
//! implementation's dispatch loop does recurse through Rust calls for
//! nested invocations — see `vm::Vm::execute_function`).

use loom_core::{Chunk, Value};
use std::rc::Rc;

/// A function value plus the dispatch position within it. `ip` is the next
/// instruction to execute; `src_ip` is where the *current* instruction
/// started, used so a fault reports the position of the opcode that raised
/// it rather than wherever `ip` has already advanced to.
///
/// `function` is a `Value::Heap` reference to the running closure, not an
/// owned copy — `GET_FREE`/`SET_FREE` and `CURRENT_FUNCTION` all need to
/// read or mutate the same heap-resident object a closure's free values
/// live in, so a call can't clone it out without breaking mutation of
/// captured variables across calls.
pub struct Frame {
    pub function: Value,
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    pub src_ip: usize,
    pub base_pointer: usize,
    /// Instruction pointer a `recover` block starts at, or `-1` if this
    /// frame has none in scope.
    pub recover_ip: i32,
    /// Set while executing inside this frame's own recover block, so a
    /// fault raised *there* skips back past it rather than re-entering.
    pub is_recovering: bool,
}

impl Frame {
    pub fn new(function: Value, chunk: Rc<Chunk>, base_pointer: usize) -> Self {
        Self {
            function,
            chunk,
            ip: 0,
            src_ip: 0,
            base_pointer,
            recover_ip: -1,
            is_recovering: false,
        }
    }
}
