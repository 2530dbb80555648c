//! Runtime values manipulated by the VM.

mod value;

pub use value::{MacroRef, Value, Vars};
