//! Positioned errors and the bounded error list
//!
//! Every stage of the pipeline reports failure the same way: push a
//! positioned error onto the shared list and unwind. The list is
//! bounded; once full, further pushes are dropped on the floor, since
//! the earliest errors are the ones worth reading.

use std::fmt;

use crate::position::Pos;
use crate::traceback::Traceback;

/// Most errors kept per run. Pushes past this are silently dropped.
pub const MAX_ERRORS: usize = 16;

/// Longest message kept; longer messages are truncated at a char
/// boundary.
pub const MAX_ERROR_MESSAGE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parsing,
    Compilation,
    Runtime,
    Timeout,
    Allocation,
    User,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Parsing => "PARSING",
            ErrorKind::Compilation => "COMPILATION",
            ErrorKind::Runtime => "RUNTIME",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Allocation => "ALLOCATION",
            ErrorKind::User => "USER",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrioError {
    pub kind: ErrorKind,
    pub message: String,
    pub pos: Pos,
    pub traceback: Option<Traceback>,
}

impl BrioError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, pos: Pos) -> BrioError {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE {
            let mut cut = MAX_ERROR_MESSAGE;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        BrioError {
            kind,
            message,
            pos,
            traceback: None,
        }
    }

    pub fn parsing(message: impl Into<String>, pos: Pos) -> BrioError {
        BrioError::new(ErrorKind::Parsing, message, pos)
    }

    pub fn compilation(message: impl Into<String>, pos: Pos) -> BrioError {
        BrioError::new(ErrorKind::Compilation, message, pos)
    }

    pub fn runtime(message: impl Into<String>, pos: Pos) -> BrioError {
        BrioError::new(ErrorKind::Runtime, message, pos)
    }

    pub fn timeout(message: impl Into<String>, pos: Pos) -> BrioError {
        BrioError::new(ErrorKind::Timeout, message, pos)
    }

    pub fn allocation(message: impl Into<String>, pos: Pos) -> BrioError {
        BrioError::new(ErrorKind::Allocation, message, pos)
    }

    pub fn user(message: impl Into<String>, pos: Pos) -> BrioError {
        BrioError::new(ErrorKind::User, message, pos)
    }
}

impl fmt::Display for BrioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pos.is_valid() {
            write!(f, "{} ERROR at {}: {}", self.kind.name(), self.pos, self.message)
        } else {
            write!(f, "{} ERROR: {}", self.kind.name(), self.message)
        }
    }
}

impl std::error::Error for BrioError {}

#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<BrioError>,
}

impl ErrorList {
    pub fn new() -> ErrorList {
        ErrorList::default()
    }

    pub fn push(&mut self, err: BrioError) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(err);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, ix: usize) -> Option<&BrioError> {
        self.errors.get(ix)
    }

    pub fn last_mut(&mut self) -> Option<&mut BrioError> {
        self.errors.last_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrioError> {
        self.errors.iter()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Drain the list, leaving it empty.
    pub fn take(&mut self) -> Vec<BrioError> {
        std::mem::take(&mut self.errors)
    }
}
