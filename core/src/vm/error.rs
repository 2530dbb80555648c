//! Runtime errors raised by the VM.
//!
//! Every error aborts the run: there is no recovery inside a template. Errors
//! carry the instruction pointer of the failing instruction so they can be
//! matched against the bytecode dump.

use ecow::EcoString;

/// Runtime error raised while executing a program.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An operation was applied to values of the wrong kind.
    #[error("type error at instruction {ip}: {message}")]
    Type { ip: usize, message: String },

    /// A variable lookup missed every visible frame.
    #[error("undefined variable '{name}' at instruction {ip}")]
    UnboundName { ip: usize, name: EcoString },

    /// A macro was called with the wrong number of arguments.
    #[error("macro '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        ip: usize,
        name: EcoString,
        expected: usize,
        got: usize,
    },

    /// `FOREACH` over something that is not iterable, or a loop opcode
    /// executed outside its loop frame.
    #[error("iterator protocol violation at instruction {ip}: {message}")]
    IteratorProtocol { ip: usize, message: String },

    /// A configured execution bound was hit.
    #[error(transparent)]
    ResourceExceeded(#[from] ResourceExceededError),

    /// `INCLUDE` was executed by a VM that has no loader.
    #[error("cannot include '{name}': no loader is configured")]
    NoLoader { name: EcoString },

    /// Loading or running an included template failed.
    #[error("in template included as '{name}': {source}")]
    Include {
        name: EcoString,
        #[source]
        source: Box<crate::Error>,
    },

    /// Writing to the output sink failed.
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    /// The program violated a structural invariant (stack underflow,
    /// missing loop frame, ...). Validated programs never do this.
    #[error("malformed program at instruction {ip}: {reason}")]
    MalformedProgram { ip: usize, reason: &'static str },
}

/// Resource limit exceeded errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceExceededError {
    /// Nested macro calls and includes exceeded `max_depth`.
    #[error("call depth {depth} exceeds maximum of {max_depth}")]
    CallDepth { depth: usize, max_depth: usize },

    /// Nested includes exceeded `max_include_depth`.
    #[error("include depth {depth} exceeds maximum of {max_include_depth}")]
    IncludeDepth {
        depth: usize,
        max_include_depth: usize,
    },

    /// The run dispatched more than `max_steps` instructions.
    #[error("execution exceeded the limit of {max_steps} steps")]
    Steps { max_steps: usize },
}

impl RuntimeError {
    pub(crate) fn type_error(ip: usize, message: impl Into<String>) -> Self {
        RuntimeError::Type {
            ip,
            message: message.into(),
        }
    }
}
