//! Bytecode compiler for templates.
//!
//! This module lowers a parsed [`Template`] into a [`Program`] for the VM.
//!
//! ## Design
//!
//! - Constants and names are interned into per-program pools
//! - Control flow uses absolute jump targets, back-patched once known
//! - Macros are compiled inline, behind a jump that skips their body
//! - Short-circuit `and`/`or` keep the deciding operand on the stack

mod bytecode;
mod error;


pub use bytecode::BytecodeCompiler;
pub use error::{CompileError, CompileErrorKind};

use crate::{parser::Template, vm::Program};

/// Lowers template ASTs to programs.
///
/// `source` is the text the template was parsed from; it is only used to
/// report error positions.
pub trait Compiler: Send + Sync {
    fn compile(&self, template: &Template, source: &str) -> Result<Program, CompileError>;

    /// Settings that change the emitted bytecode. Cached programs are only
    /// reused by a compiler with the same fingerprint.
    fn fingerprint(&self) -> String;
}
