//! The language's own error taxonomy: what running/compiling a program can
//! raise, as opposed to [`crate::engine_error`]-style failures in the host API
//! itself. See `SPEC_FULL.md` §7 / §10.2 for the distinction.

use std::fmt;
use std::path::PathBuf;

const MAX_MESSAGE_LEN: usize = 255;
pub const MAX_ERROR_LIST_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parsing,
    Compilation,
    Runtime,
    Timeout,
    Allocation,
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Parsing => "PARSING",
            ErrorKind::Compilation => "COMPILATION",
            ErrorKind::Runtime => "RUNTIME",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Allocation => "ALLOCATION",
            ErrorKind::User => "USER",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourcePosition {
    pub file: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
}

impl SourcePosition {
    pub fn new(file: Option<PathBuf>, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

/// One frame of a captured call stack, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackFrame {
    pub function_name: String,
    pub position: SourcePosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Traceback {
    pub frames: Vec<TracebackFrame>,
}

impl Traceback {
    pub fn push(&mut self, function_name: impl Into<String>, position: SourcePosition) {
        self.frames.push(TracebackFrame {
            function_name: function_name.into(),
            position,
        });
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            let file = frame
                .position
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<input>".to_string());
            writeln!(
                f,
                "\t{} in {} on {}",
                frame.function_name, file, frame.position
            )?;
        }
        Ok(())
    }
}

/// A single language-level error: parse failure, compile failure, or runtime
/// fault. Message length is bounded; longer messages are truncated rather
/// than grown without limit, matching the bounded error list below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LangError {
    pub kind: ErrorKind,
    pub message: String,
    pub position: SourcePosition,
    pub traceback: Option<Traceback>,
}

impl LangError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, position: SourcePosition) -> Self {
        let mut message = message.into();
        if message.len() > MAX_MESSAGE_LEN {
            message.truncate(MAX_MESSAGE_LEN);
        }
        Self {
            kind,
            message,
            position,
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }
}

impl fmt::Display for LangError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self
            .position
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<input>".to_string());
        writeln!(
            f,
            "{} ERROR in \"{}\" on {}: {}",
            self.kind, file, self.position, self.message
        )?;
        if let Some(tb) = &self.traceback {
            write!(f, "{tb}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LangError {}

/// Bounded FIFO of errors accumulated during lexing/parsing/compiling.
/// Once full, further pushes are dropped but recorded once via `overflowed`.
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    errors: Vec<LangError>,
    overflowed: bool,
}

impl ErrorList {
    pub fn push(&mut self, error: LangError) {
        if self.errors.len() < MAX_ERROR_LIST_LEN {
            self.errors.push(error);
        } else {
            self.overflowed = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn iter(&self) -> impl Iterator<Item = &LangError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<LangError> {
        self.errors
    }

    pub fn clear(&mut self) {
        self.errors.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_truncation() {
        let long = "x".repeat(1000);
        let err = LangError::new(ErrorKind::Runtime, long, SourcePosition::unknown());
        assert_eq!(err.message.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn bounded_error_list_overflow() {
        let mut list = ErrorList::default();
        for i in 0..(MAX_ERROR_LIST_LEN + 5) {
            list.push(LangError::new(
                ErrorKind::Parsing,
                format!("err {i}"),
                SourcePosition::unknown(),
            ));
        }
        assert_eq!(list.len(), MAX_ERROR_LIST_LEN);
        assert!(list.overflowed());
    }

    #[test]
    fn display_format_matches_contract() {
        let err = LangError::new(ErrorKind::Runtime, "boom", SourcePosition::new(None, 2, 4));
        let text = format!("{err}");
        assert!(text.starts_with("RUNTIME ERROR in \"<input>\" on 3:5: boom"));
    }
}
