use std::{collections::BTreeMap, io, sync::Arc};

use ecow::EcoString;
use tracing::{debug, trace};

use super::{operators, state::CallRecord};
use crate::{
    Error,
    api::ExecutionOptions,
    loader::ByteCodeLoader,
    scope_stack::{LoopIter, ScopeError},
    values::{MacroRef, Value, Vars},
    vm::{
        ExecutionState, Filter, Instruction, OutputMode, Program, ResourceExceededError,
        RuntimeError,
    },
};

/// The template virtual machine.
///
/// The VM is a stateless dispatcher: every [`run`](VM::run) builds its own
/// [`ExecutionState`], so one VM can serve any number of concurrent renders.
/// The only thing it holds across runs is its options and an optional loader
/// used to resolve `INCLUDE`d templates.
#[derive(Clone, Default)]
pub struct VM {
    options: ExecutionOptions,
    loader: Option<Arc<dyn ByteCodeLoader>>,
}

impl VM {
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            options,
            loader: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ByteCodeLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Run `program` against a copy of `vars`, writing to `out`.
    ///
    /// Returns the number of bytes written. On error, output already written
    /// to `out` is not rolled back.
    pub fn run(
        &self,
        program: &Program,
        vars: &Vars,
        out: &mut dyn io::Write,
    ) -> Result<usize, RuntimeError> {
        let mut state = ExecutionState::new(program, vars.clone(), out);
        self.execute(&mut state)?;
        debug!(
            template = %program.name,
            bytes = state.written,
            steps = state.steps,
            "render finished"
        );
        Ok(state.written)
    }

    /// Drive `state` until it reaches `End` or fails.
    pub fn execute(&self, state: &mut ExecutionState<'_>) -> Result<(), RuntimeError> {
        let program = state.program;
        loop {
            if let Some(max_steps) = self.options.max_steps {
                if state.steps >= max_steps {
                    return Err(ResourceExceededError::Steps { max_steps }.into());
                }
            }
            state.steps += 1;

            let ip = state.ip;
            let Some(&instruction) = program.instructions.get(ip) else {
                return Err(RuntimeError::MalformedProgram {
                    ip,
                    reason: "instruction pointer out of range",
                });
            };
            let mut next = ip + 1;

            use Instruction::*;
            match instruction {
                End => return Ok(()),

                ConstLoad(index) => {
                    let literal = program.constants.get(index as usize).ok_or(
                        RuntimeError::MalformedProgram {
                            ip,
                            reason: "constant index out of range",
                        },
                    )?;
                    state.stack.push(literal.to_value());
                }

                Pop => {
                    state.pop()?;
                }

                LoadVar(name) => {
                    let name = name_at(program, ip, name)?;
                    let value = match state.scopes.lookup(name) {
                        Some(value) => value.clone(),
                        None if self.options.strict_variables => {
                            return Err(RuntimeError::UnboundName {
                                ip,
                                name: name.clone(),
                            });
                        }
                        None => Value::Undef,
                    };
                    state.stack.push(value);
                }

                StoreVar(name) => {
                    let name = name_at(program, ip, name)?;
                    let value = state.pop()?;
                    state.scopes.bind_in_current(name.clone(), value);
                }

                FieldName(name) => {
                    let name = name_at(program, ip, name)?;
                    let container = state.pop()?;
                    state.stack.push(field(ip, &container, name)?);
                }

                Index => {
                    let key = state.pop()?;
                    let container = state.pop()?;
                    state.stack.push(index(ip, &container, &key)?);
                }

                BinOp(op) => {
                    let right = state.pop()?;
                    let left = state.pop()?;
                    state
                        .stack
                        .push(operators::binary(ip, op, &left, &right)?);
                }

                Not => {
                    let value = state.pop()?;
                    state.stack.push(Value::Bool(!value.is_truthy()));
                }

                Neg => {
                    let value = state.pop()?;
                    state.stack.push(operators::negate(ip, &value)?);
                }

                MakeList(n) => {
                    let items = state.pop_n(n as usize)?;
                    state.stack.push(Value::List(Arc::from(items)));
                }

                MakeMap(n) => {
                    let flat = state.pop_n(2 * n as usize)?;
                    let mut entries = BTreeMap::new();
                    let mut flat = flat.into_iter();
                    while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                        entries.insert(key.to_text(), value);
                    }
                    state.stack.push(Value::Map(Arc::new(entries)));
                }

                Filter(filter) => {
                    let value = state.pop()?;
                    state.stack.push(apply_filter(ip, filter, value)?);
                }

                Jump(target) => next = target as usize,

                PopJumpIfFalse(target) => {
                    if !state.pop()?.is_truthy() {
                        next = target as usize;
                    }
                }

                JumpIfFalseOrPop(target) => {
                    if state.peek()?.is_truthy() {
                        state.pop()?;
                    } else {
                        next = target as usize;
                    }
                }

                JumpIfTrueOrPop(target) => {
                    if state.peek()?.is_truthy() {
                        next = target as usize;
                    } else {
                        state.pop()?;
                    }
                }

                ForStart => {
                    let items = match state.pop()? {
                        Value::List(items) => items,
                        Value::Map(entries) => entries
                            .keys()
                            .map(|key| Value::Str(key.clone()))
                            .collect(),
                        Value::Undef => Arc::from(Vec::new()),
                        other => {
                            return Err(RuntimeError::IteratorProtocol {
                                ip,
                                message: format!("cannot iterate over a {} value", other.kind()),
                            });
                        }
                    };
                    state.scopes.push_child();
                    state.scopes.set_iterator(LoopIter::new(items));
                }

                ForIter { var, exit } => {
                    let name = name_at(program, ip, var)?;
                    let Some(iter) = state.scopes.iterator_mut() else {
                        return Err(RuntimeError::IteratorProtocol {
                            ip,
                            message: "loop iteration outside of a loop frame".into(),
                        });
                    };
                    let position = iter.position();
                    let size = iter.len();
                    match iter.advance() {
                        Some(item) => {
                            state.scopes.bind_in_current(name.clone(), item);
                            state
                                .scopes
                                .bind_in_current("loop", loop_info(position, size));
                        }
                        None => {
                            state.scopes.pop().map_err(|e| scope_error(ip, e))?;
                            next = exit as usize;
                        }
                    }
                }

                MakeMacro(index) => {
                    let def = program.macros.get(index as usize).ok_or(
                        RuntimeError::MalformedProgram {
                            ip,
                            reason: "macro index out of range",
                        },
                    )?;
                    state.stack.push(Value::Macro(MacroRef {
                        program: program.id(),
                        index,
                        name: def.name.clone(),
                        closure: state.scopes.current(),
                    }));
                }

                MacroCall(argc) => {
                    let args = state.pop_n(argc as usize)?;
                    let callee = match state.pop()? {
                        Value::Macro(callee) => callee,
                        other => {
                            return Err(RuntimeError::type_error(
                                ip,
                                format!("a {} value is not callable", other.kind()),
                            ));
                        }
                    };
                    next = self.call(state, ip, &callee, args)?;
                }

                MacroReturn => {
                    let Some(record) = state.calls.pop() else {
                        return Err(RuntimeError::MalformedProgram {
                            ip,
                            reason: "macro return without a call",
                        });
                    };
                    state.scopes.truncate(record.scope_depth);
                    let output = state.captures.pop().unwrap_or_default();
                    state
                        .stack
                        .push(Value::Raw(String::from_utf8_lossy(&output).as_ref().into()));
                    next = record.return_ip;
                }

                Print(mode) => {
                    let value = state.pop()?;
                    state.write(&value.to_output(mode == OutputMode::Html))?;
                }

                Include => {
                    let args = state.pop()?;
                    let name = state.pop()?.to_text();
                    self.include(state, ip, name, args)?;
                }
            }

            state.ip = next;
        }
    }

    /// Enter a macro body. Returns the instruction to continue at.
    fn call(
        &self,
        state: &mut ExecutionState<'_>,
        ip: usize,
        callee: &MacroRef,
        args: Vec<Value>,
    ) -> Result<usize, RuntimeError> {
        let program = state.program;
        if callee.program != program.id() {
            return Err(RuntimeError::type_error(
                ip,
                format!(
                    "macro '{}' belongs to another template and cannot be called here",
                    callee.name
                ),
            ));
        }
        let def = program.macros.get(callee.index as usize).ok_or(
            RuntimeError::MalformedProgram {
                ip,
                reason: "macro index out of range",
            },
        )?;
        if args.len() != def.params.len() {
            return Err(RuntimeError::Arity {
                ip,
                name: def.name.clone(),
                expected: def.params.len(),
                got: args.len(),
            });
        }
        self.check_depth(state)?;

        let scope_depth = state.scopes.depth();
        state
            .scopes
            .push_with_parent(callee.closure)
            .map_err(|e| scope_error(ip, e))?;
        for (param, arg) in def.params.iter().zip(args) {
            state.scopes.bind_in_current(param.clone(), arg);
        }
        state.calls.push(CallRecord {
            return_ip: ip + 1,
            scope_depth,
        });
        state.captures.push(Vec::new());
        Ok(def.entry as usize)
    }

    /// Load and run another template into the current output.
    fn include(
        &self,
        state: &mut ExecutionState<'_>,
        ip: usize,
        name: EcoString,
        args: Value,
    ) -> Result<(), RuntimeError> {
        let Some(loader) = &self.loader else {
            return Err(RuntimeError::NoLoader { name });
        };
        self.check_depth(state)?;
        let include_depth = state.include_depth + 1;
        if include_depth > self.options.max_include_depth {
            return Err(ResourceExceededError::IncludeDepth {
                depth: include_depth,
                max_include_depth: self.options.max_include_depth,
            }
            .into());
        }

        let mut vars = state.scopes.visible();
        match args {
            Value::Map(entries) => vars.extend(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            ),
            Value::Undef => {}
            other => {
                return Err(RuntimeError::type_error(
                    ip,
                    format!("include arguments must be a map, got {}", other.kind()),
                ));
            }
        }

        let program = loader
            .load(&name)
            .map_err(|source| RuntimeError::Include {
                name: name.clone(),
                source: Box::new(source),
            })?;
        trace!(template = %name, depth = include_depth, "include");

        let outer_depth = state.call_depth() + 1;
        let capturing = !state.captures.is_empty();
        let sink: &mut dyn io::Write = match state.captures.last_mut() {
            Some(buffer) => buffer,
            None => &mut *state.sink,
        };
        let mut child = ExecutionState::new(&program, vars, sink);
        child.outer_depth = outer_depth;
        child.include_depth = include_depth;
        child.steps = state.steps;

        let result = self.execute(&mut child);
        let (steps, written) = (child.steps, child.written);
        drop(child);

        state.steps = steps;
        if !capturing {
            state.written += written;
        }
        result.map_err(|e| match e {
            RuntimeError::ResourceExceeded(limit) => RuntimeError::ResourceExceeded(limit),
            other => RuntimeError::Include {
                name,
                source: Box::new(Error::Runtime(other)),
            },
        })
    }

    fn check_depth(&self, state: &ExecutionState<'_>) -> Result<(), RuntimeError> {
        let depth = state.call_depth() + 1;
        if depth > self.options.max_depth {
            return Err(ResourceExceededError::CallDepth {
                depth,
                max_depth: self.options.max_depth,
            }
            .into());
        }
        Ok(())
    }
}

fn name_at(program: &Program, ip: usize, index: u32) -> Result<&EcoString, RuntimeError> {
    program
        .names
        .get(index as usize)
        .ok_or(RuntimeError::MalformedProgram {
            ip,
            reason: "name index out of range",
        })
}

fn scope_error(ip: usize, error: ScopeError) -> RuntimeError {
    match error {
        ScopeError::PopRoot => RuntimeError::MalformedProgram {
            ip,
            reason: "attempted to pop the root scope",
        },
        ScopeError::DeadFrame(_) => RuntimeError::type_error(
            ip,
            "macro called after the scope it was defined in has ended",
        ),
    }
}

/// The `loop` map bound alongside a loop variable.
fn loop_info(position: usize, size: usize) -> Value {
    Value::map([
        ("index", Value::from(position)),
        ("count", Value::from(position + 1)),
        ("first", Value::Bool(position == 0)),
        ("last", Value::Bool(position + 1 == size)),
        ("size", Value::from(size)),
    ])
}

/// Dotted access: `container.name`.
fn field(ip: usize, container: &Value, name: &str) -> Result<Value, RuntimeError> {
    match container {
        Value::Map(entries) => Ok(entries.get(name).cloned().unwrap_or_default()),
        Value::Undef => Ok(Value::Undef),
        Value::List(items) => match name.parse::<usize>() {
            Ok(i) => Ok(items.get(i).cloned().unwrap_or_default()),
            Err(_) => Err(RuntimeError::type_error(
                ip,
                format!("list has no field '{}'", name),
            )),
        },
        other => Err(RuntimeError::type_error(
            ip,
            format!("cannot access field '{}' of a {} value", name, other.kind()),
        )),
    }
}

/// Bracket access: `container[key]`. Negative list indices count from the end.
fn index(ip: usize, container: &Value, key: &Value) -> Result<Value, RuntimeError> {
    match (container, key) {
        (Value::Undef, _) => Ok(Value::Undef),
        (Value::Map(entries), _) => Ok(entries
            .get(key.to_text().as_str())
            .cloned()
            .unwrap_or_default()),
        (Value::List(items), Value::Int(i)) => {
            let i = if *i < 0 {
                i.checked_add(items.len() as i64)
            } else {
                Some(*i)
            };
            Ok(i
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_default())
        }
        (Value::List(_), other) => Err(RuntimeError::type_error(
            ip,
            format!("list index must be an int, got {}", other.kind()),
        )),
        (other, _) => Err(RuntimeError::type_error(
            ip,
            format!("cannot index into a {} value", other.kind()),
        )),
    }
}

fn apply_filter(ip: usize, filter: Filter, value: Value) -> Result<Value, RuntimeError> {
    match filter {
        Filter::Raw => match value {
            Value::Raw(_) => Ok(value),
            other => Ok(Value::Raw(other.to_text())),
        },
        Filter::Html => Ok(Value::Raw(value.to_output(true))),
        Filter::Upper => Ok(Value::Str(value.to_text().to_uppercase())),
        Filter::Lower => Ok(Value::Str(value.to_text().to_lowercase())),
        Filter::Length => match &value {
            Value::List(items) => Ok(Value::from(items.len())),
            Value::Map(entries) => Ok(Value::from(entries.len())),
            Value::Str(s) | Value::Raw(s) => Ok(Value::from(s.chars().count())),
            Value::Undef => Ok(Value::Int(0)),
            other => Err(RuntimeError::type_error(
                ip,
                format!("a {} value has no length", other.kind()),
            )),
        },
    }
}
