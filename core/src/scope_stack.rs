//! Scope stack for variable bindings.
//!
//! Every run owns one `ScopeStack`. The root frame holds a copy of the caller's
//! variables; loops and macro calls push child frames on top of it.
//!
//! Frames form a tree rather than a strict chain: each frame records the index
//! of its parent, and lookups follow the parent links starting from the
//! innermost frame. Loop frames parent to the frame that opened them, macro
//! frames to the frame the macro was defined in:
//! ```text
//! [% MACRO greet(name) BLOCK %]Hi [% name %][% END %]
//! [% FOREACH name IN names %][% greet(name) %][% END %]
//! ```
//! Inside `greet`, `name` resolves to the parameter, never to the loop variable.

use core::fmt;
use std::sync::Arc;

use ecow::EcoString;

use crate::values::{Value, Vars};

/// One level of nested bindings.
#[derive(Debug)]
pub struct Frame {
    vars: Vars,
    parent: Option<usize>,
    iter: Option<LoopIter>,
}

/// Iteration state of the loop that owns a frame.
#[derive(Debug)]
pub struct LoopIter {
    items: Arc<[Value]>,
    next: usize,
}

impl LoopIter {
    pub fn new(items: Arc<[Value]>) -> Self {
        Self { items, next: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index the next call to `advance` will yield.
    pub fn position(&self) -> usize {
        self.next
    }

    pub fn advance(&mut self) -> Option<Value> {
        let item = self.items.get(self.next)?.clone();
        self.next += 1;
        Some(item)
    }
}

/// A stack of scope frames, never empty.
#[derive(Debug)]
pub struct ScopeStack {
    frames: Vec<Frame>,
}

impl ScopeStack {
    /// Create a stack whose root frame holds `root`.
    pub fn new(root: Vars) -> Self {
        Self {
            frames: vec![Frame {
                vars: root,
                parent: None,
                iter: None,
            }],
        }
    }

    /// Number of live frames (at least 1).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Index of the innermost frame.
    pub fn current(&self) -> usize {
        self.frames.len() - 1
    }

    /// Push an empty frame whose parent is the current innermost frame.
    pub fn push_child(&mut self) {
        let parent = self.current();
        self.frames.push(Frame {
            vars: Vars::new(),
            parent: Some(parent),
            iter: None,
        });
    }

    /// Push an empty frame parented to an arbitrary live frame.
    pub fn push_with_parent(&mut self, parent: usize) -> Result<(), ScopeError> {
        if parent >= self.frames.len() {
            return Err(ScopeError::DeadFrame(parent));
        }
        self.frames.push(Frame {
            vars: Vars::new(),
            parent: Some(parent),
            iter: None,
        });
        Ok(())
    }

    /// Pop the innermost frame. The root frame cannot be popped.
    pub fn pop(&mut self) -> Result<Frame, ScopeError> {
        if self.frames.len() == 1 {
            return Err(ScopeError::PopRoot);
        }
        self.frames.pop().ok_or(ScopeError::PopRoot)
    }

    /// Pop frames until exactly `depth` remain.
    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth.max(1));
    }

    /// Look up a name, walking parent links from the innermost frame.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let mut index = Some(self.current());
        while let Some(i) = index {
            let frame = &self.frames[i];
            if let Some(value) = frame.vars.get(name) {
                return Some(value);
            }
            index = frame.parent;
        }
        None
    }

    /// Bind a value in the innermost frame, shadowing any outer binding.
    pub fn bind_in_current(&mut self, name: impl Into<EcoString>, value: Value) {
        let current = self.current();
        self.frames[current].vars.insert(name.into(), value);
    }

    /// Attach a loop iterator to the innermost frame.
    pub fn set_iterator(&mut self, iter: LoopIter) {
        let current = self.current();
        self.frames[current].iter = Some(iter);
    }

    /// The loop iterator owned by the innermost frame, if any.
    pub fn iterator_mut(&mut self) -> Option<&mut LoopIter> {
        let current = self.current();
        self.frames[current].iter.as_mut()
    }

    /// Snapshot every binding visible from the innermost frame.
    pub fn visible(&self) -> Vars {
        let mut chain = Vec::new();
        let mut index = Some(self.current());
        while let Some(i) = index {
            chain.push(i);
            index = self.frames[i].parent;
        }

        let mut vars = Vars::new();
        // Outermost first so inner bindings overwrite shadowed ones.
        for i in chain.into_iter().rev() {
            for (name, value) in &self.frames[i].vars {
                vars.insert(name.clone(), value.clone());
            }
        }
        vars
    }
}

/// Errors from manipulating the scope stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// Attempted to pop the root frame.
    PopRoot,
    /// Referenced a frame that has already been popped.
    DeadFrame(usize),
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::PopRoot => write!(f, "Cannot pop the root scope frame"),
            ScopeError::DeadFrame(index) => {
                write!(f, "Scope frame {} is no longer live", index)
            }
        }
    }
}
