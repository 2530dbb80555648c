//! Xslate VM Instructions
//!
//! This module defines the instruction set of the template virtual machine.
//!
//! # Instruction Format
//!
//! Instructions are a closed `Copy` enum. Operands never carry heap data:
//! literals, names and macro definitions live in per-program pools and are
//! referenced by `u32` index, so a program can be shared read-only by any
//! number of concurrent runs.
//!
//! # Control Flow
//!
//! Every instruction advances the instruction pointer by one, except the
//! control-flow instructions (`Jump`, `PopJumpIfFalse`, `JumpIfFalseOrPop`,
//! `JumpIfTrueOrPop`, `ForIter`, `MacroCall`, `MacroReturn`), which set it
//! themselves. Jump targets are absolute instruction indices.
//!
//! # Stack Discipline
//!
//! Stack effect notation: `[..., operand1, operand2] -> [..., result]`

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::parser::BinaryOp;

/// A single VM instruction.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    // ========================================================================
    // Special
    // ========================================================================
    /// Terminal sentinel: the dispatch loop halts here.
    End,

    // ========================================================================
    // Stack & Constants
    // ========================================================================
    /// Push constant from pool.
    /// Stack: [...] -> [..., value]
    ConstLoad(u32),

    /// Pop top value.
    /// Stack: [..., a] -> [...]
    Pop,

    // ========================================================================
    // Variables
    // ========================================================================
    /// Look up a name (index into the name pool) through the scope chain.
    /// Stack: [...] -> [..., value]
    LoadVar(u32),

    /// Bind a name in the innermost frame.
    /// Stack: [..., value] -> [...]
    StoreVar(u32),

    /// Dotted field access with a name from the pool (`a.b`).
    /// Stack: [..., container] -> [..., element]
    FieldName(u32),

    /// Bracket access (`a[key]`).
    /// Stack: [..., container, key] -> [..., element]
    Index,

    // ========================================================================
    // Operators
    // ========================================================================
    /// Arithmetic, comparison or concatenation.
    /// Stack: [..., a, b] -> [..., a op b]
    BinOp(BinaryOp),

    /// Logical negation by truthiness.
    /// Stack: [..., a] -> [..., !a]
    Not,

    /// Numeric negation.
    /// Stack: [..., a] -> [..., -a]
    Neg,

    /// Collect the top N values into a list.
    /// Stack: [..., a1, ..., aN] -> [..., list]
    MakeList(u32),

    /// Collect the top N key/value pairs into a map.
    /// Stack: [..., k1, v1, ..., kN, vN] -> [..., map]
    MakeMap(u32),

    /// Apply a built-in filter.
    /// Stack: [..., a] -> [..., filter(a)]
    Filter(Filter),

    // ========================================================================
    // Control Flow
    // ========================================================================
    /// Unconditional jump.
    Jump(u32),

    /// Pop the condition and jump if it is falsy.
    /// Stack: [..., cond] -> [...]
    PopJumpIfFalse(u32),

    /// Jump keeping the value if it is falsy, otherwise pop it (`and`).
    /// Stack: [..., a] -> [..., a] (jump) | [...] (fall through)
    JumpIfFalseOrPop(u32),

    /// Jump keeping the value if it is truthy, otherwise pop it (`or`).
    /// Stack: [..., a] -> [..., a] (jump) | [...] (fall through)
    JumpIfTrueOrPop(u32),

    // ========================================================================
    // Loops
    // ========================================================================
    /// Push a loop frame iterating over the popped collection.
    /// Stack: [..., collection] -> [...]
    ForStart,

    /// Bind the next element to `var` and fall through, or pop the loop frame
    /// and jump to `exit` once the iterator is exhausted.
    ForIter { var: u32, exit: u32 },

    // ========================================================================
    // Macros
    // ========================================================================
    /// Push a reference to a macro from the macro table.
    /// Stack: [...] -> [..., macro]
    MakeMacro(u32),

    /// Call a macro with N arguments.
    /// Stack: [..., macro, a1, ..., aN] -> [..., output]
    MacroCall(u32),

    /// Return from the innermost macro call, pushing its captured output.
    MacroReturn,

    // ========================================================================
    // Output
    // ========================================================================
    /// Pop a value and write its text to the output.
    /// Stack: [..., a] -> [...]
    Print(OutputMode),

    /// Render another template into the same output.
    /// Stack: [..., name, args] -> [...]
    Include,
}

/// Escaping applied by `Print`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Write the text as is.
    Raw,
    /// HTML-escape the text unless the value is already marked raw.
    Html,
}

/// Built-in filters (`expr | name`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Mark text as safe for output.
    Raw,
    /// Escape now and mark the result as safe.
    Html,
    Upper,
    Lower,
    Length,
}

impl Filter {
    pub fn from_name(name: &str) -> Option<Filter> {
        match name {
            "raw" | "mark_raw" => Some(Filter::Raw),
            "html" => Some(Filter::Html),
            "uc" | "upper" => Some(Filter::Upper),
            "lc" | "lower" => Some(Filter::Lower),
            "length" | "size" => Some(Filter::Length),
            _ => None,
        }
    }
}

impl Instruction {
    /// Jump target of a control-flow instruction, if any.
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump(target)
            | Instruction::PopJumpIfFalse(target)
            | Instruction::JumpIfFalseOrPop(target)
            | Instruction::JumpIfTrueOrPop(target) => Some(*target),
            Instruction::ForIter { exit, .. } => Some(*exit),
            _ => None,
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            End => write!(f, "End"),
            ConstLoad(index) => write!(f, "ConstLoad({})", index),
            Pop => write!(f, "Pop"),
            LoadVar(name) => write!(f, "LoadVar({})", name),
            StoreVar(name) => write!(f, "StoreVar({})", name),
            FieldName(name) => write!(f, "FieldName({})", name),
            Index => write!(f, "Index"),
            BinOp(op) => write!(f, "BinOp({})", op.symbol()),
            Not => write!(f, "Not"),
            Neg => write!(f, "Neg"),
            MakeList(n) => write!(f, "MakeList({})", n),
            MakeMap(n) => write!(f, "MakeMap({})", n),
            Filter(filter) => write!(f, "Filter({:?})", filter),
            Jump(target) => write!(f, "Jump({})", target),
            PopJumpIfFalse(target) => write!(f, "PopJumpIfFalse({})", target),
            JumpIfFalseOrPop(target) => write!(f, "JumpIfFalseOrPop({})", target),
            JumpIfTrueOrPop(target) => write!(f, "JumpIfTrueOrPop({})", target),
            ForStart => write!(f, "ForStart"),
            ForIter { var, exit } => write!(f, "ForIter(var={}, exit={})", var, exit),
            MakeMacro(index) => write!(f, "MakeMacro({})", index),
            MacroCall(argc) => write!(f, "MacroCall({})", argc),
            MacroReturn => write!(f, "MacroReturn"),
            Print(OutputMode::Raw) => write!(f, "Print(raw)"),
            Print(OutputMode::Html) => write!(f, "Print(html)"),
            Include => write!(f, "Include"),
        }
    }
}
