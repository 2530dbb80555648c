mod code;
mod error;
mod instruction_set;
mod operators;
mod runtime;
mod stack;
mod state;

#[cfg(test)]
mod runtime_test;

pub use code::{MacroDef, Program, ProgramError};
pub use error::{ResourceExceededError, RuntimeError};
pub use instruction_set::{Filter, Instruction, OutputMode};
pub use runtime::VM;
pub use state::ExecutionState;

pub(crate) use stack::Stack;

static_assertions::assert_impl_all!(Program: Send, Sync);
static_assertions::assert_impl_all!(VM: Send, Sync);
