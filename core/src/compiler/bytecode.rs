//! Bytecode compiler implementation.

use ecow::EcoString;
use hashbrown::HashMap;

use crate::{
    api::CompilationOptions,
    compiler::{CompileError, CompileErrorKind, Compiler},
    parser::{BoolOp, Expr, Literal, Node, Span, Template, UnaryOp},
    vm::{Filter, Instruction, MacroDef, OutputMode, Program},
};

/// Bytecode compiler that lowers a template AST into a [`Program`].
///
/// The compiler itself only holds options; each call to
/// [`Compiler::compile`] builds a fresh [`Emitter`], so one compiler can be
/// shared by every load a loader performs.
#[derive(Debug, Clone, Default)]
pub struct BytecodeCompiler {
    options: CompilationOptions,
}

impl BytecodeCompiler {
    pub fn new(options: CompilationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompilationOptions {
        &self.options
    }
}

impl Compiler for BytecodeCompiler {
    fn compile(&self, template: &Template, source: &str) -> Result<Program, CompileError> {
        let mut emitter = Emitter::new(&template.name, source, &self.options);
        emitter.nodes(&template.body)?;
        emitter.emit(Instruction::End);
        let program = emitter.finalize();
        debug_assert!(
            program.validate().is_ok(),
            "compiler produced an invalid program: {:?}",
            program.validate()
        );
        Ok(program)
    }

    fn fingerprint(&self) -> String {
        format!("{:?}", self.options)
    }
}

/// Hashable mirror of [`Literal`] for constant deduplication.
///
/// Floats are keyed by their bit pattern so that `NaN` constants dedupe too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Undef,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(EcoString),
}

impl From<&Literal> for ConstKey {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Undef => ConstKey::Undef,
            Literal::Bool(b) => ConstKey::Bool(*b),
            Literal::Int(i) => ConstKey::Int(*i),
            Literal::Float(f) => ConstKey::Float(f.to_bits()),
            Literal::Str(s) => ConstKey::Str(s.clone()),
        }
    }
}

/// Per-compilation state.
struct Emitter<'s> {
    name: &'s str,
    source: &'s str,
    options: &'s CompilationOptions,

    /// Constant pool for literal values
    constants: Vec<Literal>,

    /// Constant deduplication map: literal -> index
    constant_map: HashMap<ConstKey, u32>,

    /// Name pool for variables, fields and loop variables
    names: Vec<EcoString>,
    name_map: HashMap<EcoString, u32>,

    macros: Vec<MacroDef>,

    /// Bytecode instructions
    instructions: Vec<Instruction>,
}

impl<'s> Emitter<'s> {
    fn new(name: &'s str, source: &'s str, options: &'s CompilationOptions) -> Self {
        Self {
            name,
            source,
            options,
            constants: Vec::new(),
            constant_map: HashMap::new(),
            names: Vec::new(),
            name_map: HashMap::new(),
            macros: Vec::new(),
            instructions: Vec::new(),
        }
    }

    fn finalize(self) -> Program {
        Program::new(
            self.name,
            self.constants,
            self.names,
            self.macros,
            self.instructions,
        )
    }

    fn error(&self, span: Span, kind: CompileErrorKind) -> CompileError {
        CompileError::new(self.name, self.source, span, kind)
    }

    // === Instruction Emission ===

    /// Emit an instruction and return its index.
    fn emit(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    /// Get the current instruction index (for use as a jump label).
    fn label(&self) -> Result<u32, CompileError> {
        u32::try_from(self.instructions.len())
            .map_err(|_| self.error(Span::default(), CompileErrorKind::TooManyInstructions))
    }

    /// Point the jump emitted at `at` to `target`.
    fn patch_jump(&mut self, at: usize, target: u32) {
        use Instruction::*;
        self.instructions[at] = match self.instructions[at] {
            Jump(_) => Jump(target),
            PopJumpIfFalse(_) => PopJumpIfFalse(target),
            JumpIfFalseOrPop(_) => JumpIfFalseOrPop(target),
            JumpIfTrueOrPop(_) => JumpIfTrueOrPop(target),
            ForIter { var, .. } => ForIter { var, exit: target },
            other => other,
        };
    }

    /// Patch a jump placeholder to land on the next emitted instruction.
    fn patch_here(&mut self, at: usize) -> Result<(), CompileError> {
        let target = self.label()?;
        self.patch_jump(at, target);
        Ok(())
    }

    // === Pools ===

    /// Add a constant to the pool (or reuse existing) and return its index.
    fn add_constant(&mut self, literal: Literal) -> Result<u32, CompileError> {
        let key = ConstKey::from(&literal);
        if let Some(&existing_index) = self.constant_map.get(&key) {
            return Ok(existing_index);
        }

        let index = u32::try_from(self.constants.len())
            .map_err(|_| self.error(Span::default(), CompileErrorKind::TooManyConstants))?;
        self.constants.push(literal);
        self.constant_map.insert(key, index);
        Ok(index)
    }

    fn add_name(&mut self, name: &EcoString) -> Result<u32, CompileError> {
        if let Some(&existing_index) = self.name_map.get(name) {
            return Ok(existing_index);
        }

        let index = u32::try_from(self.names.len())
            .map_err(|_| self.error(Span::default(), CompileErrorKind::TooManyNames))?;
        self.names.push(name.clone());
        self.name_map.insert(name.clone(), index);
        Ok(index)
    }

    fn count(&self, n: usize) -> Result<u32, CompileError> {
        u32::try_from(n)
            .map_err(|_| self.error(Span::default(), CompileErrorKind::TooManyInstructions))
    }

    // === Statements ===

    fn nodes(&mut self, nodes: &[Node]) -> Result<(), CompileError> {
        for node in nodes {
            self.node(node)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Text(text) => {
                if !text.is_empty() {
                    let index = self.add_constant(Literal::Str(text.clone()))?;
                    self.emit(Instruction::ConstLoad(index));
                    self.emit(Instruction::Print(OutputMode::Raw));
                }
            }

            Node::Print(expr) => {
                self.expr(expr)?;
                let mode = if self.options.auto_escape {
                    OutputMode::Html
                } else {
                    OutputMode::Raw
                };
                self.emit(Instruction::Print(mode));
            }

            // cond1; PopJumpIfFalse next1; body1; Jump end; next1: cond2; ...
            Node::If {
                branches,
                otherwise,
            } => {
                let mut end_jumps = Vec::with_capacity(branches.len());
                for (cond, body) in branches {
                    self.expr(cond)?;
                    let next = self.emit(Instruction::PopJumpIfFalse(0));
                    self.nodes(body)?;
                    end_jumps.push(self.emit(Instruction::Jump(0)));
                    self.patch_here(next)?;
                }
                if let Some(body) = otherwise {
                    self.nodes(body)?;
                }
                for jump in end_jumps {
                    self.patch_here(jump)?;
                }
            }

            // iterable; ForStart; head: ForIter(var, exit); body; Jump head; exit:
            Node::Foreach {
                var,
                iterable,
                body,
            } => {
                self.expr(iterable)?;
                self.emit(Instruction::ForStart);
                let var = self.add_name(var)?;
                let head = self.label()?;
                let iter = self.emit(Instruction::ForIter { var, exit: 0 });
                self.nodes(body)?;
                self.emit(Instruction::Jump(head));
                self.patch_here(iter)?;
            }

            // head: cond; PopJumpIfFalse exit; body; Jump head; exit:
            Node::While { cond, body } => {
                let head = self.label()?;
                self.expr(cond)?;
                let exit = self.emit(Instruction::PopJumpIfFalse(0));
                self.nodes(body)?;
                self.emit(Instruction::Jump(head));
                self.patch_here(exit)?;
            }

            Node::Set { name, value } => {
                self.expr(value)?;
                let name = self.add_name(name)?;
                self.emit(Instruction::StoreVar(name));
            }

            // MakeMacro; StoreVar name; Jump after; entry: body; MacroReturn; after:
            Node::Macro { name, params, body } => {
                let mut seen: Vec<&EcoString> = Vec::with_capacity(params.len());
                for (param, span) in params {
                    if seen.contains(&param) {
                        return Err(self.error(
                            span.clone(),
                            CompileErrorKind::DuplicateParameter {
                                name: name.clone(),
                                param: param.clone(),
                            },
                        ));
                    }
                    seen.push(param);
                }

                let index = self.count(self.macros.len())?;
                self.macros.push(MacroDef {
                    name: name.clone(),
                    params: params.iter().map(|(param, _)| param.clone()).collect(),
                    entry: 0,
                });
                let name = self.add_name(name)?;
                self.emit(Instruction::MakeMacro(index));
                self.emit(Instruction::StoreVar(name));
                let skip = self.emit(Instruction::Jump(0));

                let entry = self.label()?;
                self.macros[index as usize].entry = entry;
                self.nodes(body)?;
                self.emit(Instruction::MacroReturn);
                self.patch_here(skip)?;
            }

            Node::Include { template, args } => {
                self.expr(template)?;
                for (key, value) in args {
                    let key = self.add_constant(Literal::Str(key.clone()))?;
                    self.emit(Instruction::ConstLoad(key));
                    self.expr(value)?;
                }
                let n = self.count(args.len())?;
                self.emit(Instruction::MakeMap(n));
                self.emit(Instruction::Include);
            }
        }
        Ok(())
    }

    // === Expressions ===

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(literal) => {
                let index = self.add_constant(literal.clone())?;
                self.emit(Instruction::ConstLoad(index));
            }

            Expr::List(items) => {
                for item in items {
                    self.expr(item)?;
                }
                let n = self.count(items.len())?;
                self.emit(Instruction::MakeList(n));
            }

            Expr::Var(name) => {
                let name = self.add_name(name)?;
                self.emit(Instruction::LoadVar(name));
            }

            Expr::Attr { object, field } => {
                self.expr(object)?;
                let field = self.add_name(field)?;
                self.emit(Instruction::FieldName(field));
            }

            Expr::Index { collection, index } => {
                self.expr(collection)?;
                self.expr(index)?;
                self.emit(Instruction::Index);
            }

            Expr::Call { function, args } => {
                self.expr(function)?;
                for arg in args {
                    self.expr(arg)?;
                }
                let argc = self.count(args.len())?;
                self.emit(Instruction::MacroCall(argc));
            }

            Expr::Filter { expr, name, span } => {
                let Some(filter) = Filter::from_name(name) else {
                    return Err(self.error(
                        span.clone(),
                        CompileErrorKind::UnknownFilter { name: name.clone() },
                    ));
                };
                self.expr(expr)?;
                self.emit(Instruction::Filter(filter));
            }

            Expr::Unary { op, expr } => {
                self.expr(expr)?;
                self.emit(match op {
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not => Instruction::Not,
                });
            }

            Expr::Binary { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.emit(Instruction::BinOp(*op));
            }

            // left; JumpIfFalseOrPop end; right; end:
            Expr::Bool { op, left, right } => {
                self.expr(left)?;
                let jump = self.emit(match op {
                    BoolOp::And => Instruction::JumpIfFalseOrPop(0),
                    BoolOp::Or => Instruction::JumpIfTrueOrPop(0),
                });
                self.expr(right)?;
                self.patch_here(jump)?;
            }
        }
        Ok(())
    }
}
