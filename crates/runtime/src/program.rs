//! The embedder-facing compiled-program handle.

use loom_compiler::CompiledProgram;

/// A compiled program, ready to execute via [`crate::engine::Engine::execute`].
/// Thin wrapper so embedders depend on `loom_runtime::Program` rather than
/// reaching into `loom_compiler` directly.
pub struct Program {
    pub(crate) compiled: CompiledProgram,
}

impl Program {
    pub(crate) fn new(compiled: CompiledProgram) -> Self {
        Self { compiled }
    }
}
