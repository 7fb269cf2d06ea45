//! Interpreter configuration
//!
//! One record carried by the context and threaded to the stages that
//! need it: the parser (repl mode), the compiler (module file reads),
//! and the VM (execution budget, stdout hook). Hooks default to the
//! process stdout and `std::fs` when unset.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Hook receiving bytes written by `print`/`println`; returns the
/// number of bytes consumed.
pub type StdoutHook = Rc<RefCell<dyn FnMut(&[u8]) -> usize>>;

/// Hook resolving a path to file contents; `Err` carries the message
/// surfaced to the script.
pub type FileReadHook = Rc<RefCell<dyn FnMut(&str) -> Result<String, String>>>;

/// Hook writing file contents; returns bytes written.
pub type FileWriteHook = Rc<RefCell<dyn FnMut(&str, &[u8]) -> Result<usize, String>>>;

#[derive(Default)]
pub struct Config {
    /// Permit top-level expression statements and `{...}` as a map
    /// expression at statement position.
    pub repl_mode: bool,

    /// Cooperative execution budget. Checked on an instruction
    /// sampling cadence, so overshoot by a few opcodes is expected.
    pub max_execution_time: Option<Duration>,

    pub stdout_write: Option<StdoutHook>,
    pub file_read: Option<FileReadHook>,
    pub file_write: Option<FileWriteHook>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_repl_mode(mut self, on: bool) -> Config {
        self.repl_mode = on;
        self
    }

    pub fn with_max_execution_time(mut self, budget: Duration) -> Config {
        self.max_execution_time = Some(budget);
        self
    }

    pub fn with_stdout_write(mut self, hook: StdoutHook) -> Config {
        self.stdout_write = Some(hook);
        self
    }

    pub fn with_file_read(mut self, hook: FileReadHook) -> Config {
        self.file_read = Some(hook);
        self
    }

    pub fn with_file_write(mut self, hook: FileWriteHook) -> Config {
        self.file_write = Some(hook);
        self
    }

    /// Read a file through the hook, or `std::fs` when none is set.
    pub fn read_file(&self, path: &str) -> Result<String, String> {
        match &self.file_read {
            Some(hook) => (&mut *hook.borrow_mut())(path),
            None => std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e)),
        }
    }

    /// Write a file through the hook, or `std::fs` when none is set.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<usize, String> {
        match &self.file_write {
            Some(hook) => (&mut *hook.borrow_mut())(path, data),
            None => std::fs::write(path, data)
                .map(|_| data.len())
                .map_err(|e| format!("{}: {}", path, e)),
        }
    }

    /// Write to stdout through the hook, or the process stdout.
    pub fn write_stdout(&self, bytes: &[u8]) -> usize {
        match &self.stdout_write {
            Some(hook) => (&mut *hook.borrow_mut())(bytes),
            None => {
                use std::io::Write;
                match std::io::stdout().write_all(bytes) {
                    Ok(()) => bytes.len(),
                    Err(_) => 0,
                }
            }
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("repl_mode", &self.repl_mode)
            .field("max_execution_time", &self.max_execution_time)
            .field("stdout_write", &self.stdout_write.is_some())
            .field("file_read", &self.file_read.is_some())
            .field("file_write", &self.file_write.is_some())
            .finish()
    }
}
