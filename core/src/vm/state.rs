use std::io;

use crate::{
    scope_stack::ScopeStack,
    values::{Value, Vars},
    vm::{Program, RuntimeError, Stack},
};

/// Where a macro call returns to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallRecord {
    pub return_ip: usize,
    /// Scope depth before the macro frame was pushed.
    pub scope_depth: usize,
}

/// The mutable context of one in-progress run.
///
/// A fresh state is built for every [`VM::run`](crate::vm::VM::run) and for
/// every included template; states are never shared or reused.
pub struct ExecutionState<'a> {
    pub(crate) program: &'a Program,
    pub(crate) ip: usize,
    pub(crate) scopes: ScopeStack,
    pub(crate) stack: Stack<Value>,
    pub(crate) calls: Vec<CallRecord>,
    /// Output buffers of the macro calls in progress, innermost last.
    pub(crate) captures: Vec<Vec<u8>>,
    pub(crate) sink: &'a mut dyn io::Write,
    /// Bytes written to `sink` (captured macro output is not counted).
    pub(crate) written: usize,
    /// Instructions dispatched so far, including by enclosing runs.
    pub(crate) steps: usize,
    /// Macro calls and includes of the enclosing runs.
    pub(crate) outer_depth: usize,
    /// Number of `INCLUDE`s this run is nested in.
    pub(crate) include_depth: usize,
}

impl<'a> ExecutionState<'a> {
    pub fn new(program: &'a Program, root: Vars, sink: &'a mut dyn io::Write) -> Self {
        Self {
            program,
            ip: 0,
            scopes: ScopeStack::new(root),
            stack: Stack::new(32),
            calls: Vec::new(),
            captures: Vec::new(),
            sink,
            written: 0,
            steps: 0,
            outer_depth: 0,
            include_depth: 0,
        }
    }

    pub fn program(&self) -> &Program {
        self.program
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Nested macro calls and includes enclosing the current instruction.
    pub(crate) fn call_depth(&self) -> usize {
        self.calls.len() + self.outer_depth
    }

    pub(crate) fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::MalformedProgram {
            ip: self.ip,
            reason: "evaluation stack underflow",
        })
    }

    pub(crate) fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        self.stack.pop_n(n).ok_or(RuntimeError::MalformedProgram {
            ip: self.ip,
            reason: "evaluation stack underflow",
        })
    }

    pub(crate) fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack.peek().ok_or(RuntimeError::MalformedProgram {
            ip: self.ip,
            reason: "evaluation stack underflow",
        })
    }

    /// Append text to the innermost macro capture, or to the sink.
    pub(crate) fn write(&mut self, text: &str) -> Result<(), RuntimeError> {
        match self.captures.last_mut() {
            Some(buffer) => buffer.extend_from_slice(text.as_bytes()),
            None => {
                self.sink.write_all(text.as_bytes())?;
                self.written += text.len();
            }
        }
        Ok(())
    }
}
