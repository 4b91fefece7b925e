//! Errors an [`crate::engine::Engine`] call can raise itself, as distinct
//! from [`loom_core::LangError`] (a fault in the *script*, not in the host
//! API around it).

use loom_core::{ErrorList, LangError};

/// Failure modes of the embedder-facing API: compiling or running a program
/// through an [`crate::engine::Engine`].
#[derive(Debug)]
pub enum EngineError {
    /// Lexing/parsing/compiling failed; carries every accumulated error.
    Compile(ErrorList),
    /// The compiled program ran but raised an unrecovered script error.
    Runtime(LangError),
    /// No function with that name is registered as a global.
    NoSuchFunction(String),
    /// A value crossed the host/script boundary but wasn't of the expected shape.
    TypeMismatch(String),
    Io(std::io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Compile(errors) => {
                for e in errors.iter() {
                    writeln!(f, "{e}")?;
                }
                if errors.overflowed() {
                    writeln!(f, "... additional errors omitted")?;
                }
                Ok(())
            }
            EngineError::Runtime(e) => write!(f, "{e}"),
            EngineError::NoSuchFunction(name) => write!(f, "no such function: {name}"),
            EngineError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            EngineError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LangError> for EngineError {
    fn from(e: LangError) -> Self {
        EngineError::Runtime(e)
    }
}

impl From<ErrorList> for EngineError {
    fn from(e: ErrorList) -> Self {
        EngineError::Compile(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}
