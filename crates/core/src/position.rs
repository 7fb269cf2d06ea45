//! Source positions and compiled-file records
//!
//! Every token, AST node, and emitted bytecode byte carries a [`Pos`]
//! so that parse, compile, and runtime errors can all point back at
//! the offending source. The position holds a shared handle to the
//! [`CompiledFile`] it came from; the file record keeps the source
//! split into lines for caret-style error display.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

/// One compiled source file: its path, the directory it lives in (used
/// to resolve relative imports), and its source split into lines.
///
/// The lexer populates the line table up front from the whole source,
/// before tokenizing. It sits behind a `RefCell` because the file
/// record is handed out via `Rc` (to the lexer and to every position)
/// before the table is filled.
#[derive(Debug)]
pub struct CompiledFile {
    pub path: String,
    pub dir_path: String,
    lines: RefCell<Vec<String>>,
}

impl CompiledFile {
    pub fn new(path: &str) -> Rc<CompiledFile> {
        let dir_path = match path.rfind('/') {
            Some(ix) => path[..=ix].to_string(),
            None => String::new(),
        };
        Rc::new(CompiledFile {
            path: path.to_string(),
            dir_path,
            lines: RefCell::new(Vec::new()),
        })
    }

    /// Append one source line to the display table.
    pub fn add_line(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }

    pub fn line(&self, ix: usize) -> Option<String> {
        self.lines.borrow().get(ix).cloned()
    }

    pub fn line_count(&self) -> usize {
        self.lines.borrow().len()
    }

    pub fn lines(&self) -> Ref<'_, Vec<String>> {
        self.lines.borrow()
    }
}

/// A position inside a source file. Line and column are 0-indexed;
/// they are rendered 1-indexed for display.
#[derive(Debug, Clone, Default)]
pub struct Pos {
    pub file: Option<Rc<CompiledFile>>,
    pub line: i32,
    pub column: i32,
}

impl Pos {
    /// The "no position" sentinel used for synthesized code.
    pub fn invalid() -> Pos {
        Pos {
            file: None,
            line: -1,
            column: -1,
        }
    }

    pub fn new(file: &Rc<CompiledFile>, line: i32, column: i32) -> Pos {
        Pos {
            file: Some(Rc::clone(file)),
            line,
            column,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.line >= 0 && self.column >= 0
    }

    pub fn file_path(&self) -> &str {
        match &self.file {
            Some(f) => &f.path,
            None => "",
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "?");
        }
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file.path, self.line + 1, self.column + 1),
            None => write!(f, "{}:{}", self.line + 1, self.column + 1),
        }
    }
}
