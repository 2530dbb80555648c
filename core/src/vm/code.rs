use core::sync::atomic::{AtomicU64, Ordering};

use ecow::EcoString;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::{parser::Literal, vm::Instruction};

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

fn next_program_id() -> u64 {
    NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// A compiled template: an immutable instruction sequence plus the pools its
/// operands index into.
#[derive(Clone, Serialize, Deserialize)]
pub struct Program {
    /// Process-local identity, reassigned whenever a program is decoded.
    #[serde(skip, default = "next_program_id")]
    id: u64,
    /// Identity of the template this program was compiled from.
    pub name: EcoString,
    pub constants: Vec<Literal>,
    pub names: Vec<EcoString>,
    pub macros: Vec<MacroDef>,
    pub instructions: Vec<Instruction>,
}

/// A macro compiled inline into its program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDef {
    pub name: EcoString,
    pub params: Vec<EcoString>,
    /// First instruction of the macro body.
    pub entry: u32,
}

/// A structural defect found by [`Program::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid program at instruction {position}: {reason}")]
pub struct ProgramError {
    pub position: usize,
    pub reason: String,
}

impl Program {
    pub fn new(
        name: impl Into<EcoString>,
        constants: Vec<Literal>,
        names: Vec<EcoString>,
        macros: Vec<MacroDef>,
        instructions: Vec<Instruction>,
    ) -> Self {
        Self {
            id: next_program_id(),
            name: name.into(),
            constants,
            names,
            macros,
            instructions,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Check that the program is safe to dispatch: it ends with `End`, and
    /// every pool index and jump target is in range.
    pub fn validate(&self) -> Result<(), ProgramError> {
        let len = self.instructions.len();
        if self.instructions.last() != Some(&Instruction::End) {
            return Err(ProgramError {
                position: len,
                reason: "program does not end with End".into(),
            });
        }

        let check = |position: usize, index: u32, pool: usize, what: &str| {
            if (index as usize) < pool {
                Ok(())
            } else {
                Err(ProgramError {
                    position,
                    reason: format!("{} index {} out of range ({})", what, index, pool),
                })
            }
        };

        for (position, instr) in self.instructions.iter().enumerate() {
            match *instr {
                Instruction::ConstLoad(index) => {
                    check(position, index, self.constants.len(), "constant")?
                }
                Instruction::LoadVar(name)
                | Instruction::StoreVar(name)
                | Instruction::FieldName(name)
                | Instruction::ForIter { var: name, .. } => {
                    check(position, name, self.names.len(), "name")?
                }
                Instruction::MakeMacro(index) => {
                    check(position, index, self.macros.len(), "macro")?
                }
                _ => {}
            }
            if let Some(target) = instr.jump_target() {
                check(position, target, len, "jump target")?;
            }
        }

        for def in &self.macros {
            if def.entry as usize >= len {
                return Err(ProgramError {
                    position: def.entry as usize,
                    reason: format!("macro {} entry out of range", def.name),
                });
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for Program {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Program {:?} {{", self.name)?;

        // Print constants pool
        if !self.constants.is_empty() {
            writeln!(f, "  constants: [")?;
            for (i, constant) in self.constants.iter().enumerate() {
                writeln!(f, "    [{}] = {:?}", i, constant)?;
            }
            writeln!(f, "  ]")?;
        } else {
            writeln!(f, "  constants: []")?;
        }

        if !self.names.is_empty() {
            writeln!(f, "  names: {:?}", self.names)?;
        }

        for (i, def) in self.macros.iter().enumerate() {
            writeln!(
                f,
                "  macro [{}] {}({}) @ {}",
                i,
                def.name,
                def.params.join(", "),
                def.entry
            )?;
        }

        // First pass: collect all jump targets to determine which addresses need labels
        let jump_targets: HashSet<usize> = self
            .instructions
            .iter()
            .filter_map(|instr| instr.jump_target())
            .map(|target| target as usize)
            .chain(self.macros.iter().map(|def| def.entry as usize))
            .collect();

        // Assign label numbers to targets (sorted for deterministic output)
        let mut sorted_targets: Vec<_> = jump_targets.into_iter().collect();
        sorted_targets.sort();
        let label_map: HashMap<usize, usize> = sorted_targets
            .into_iter()
            .enumerate()
            .map(|(i, addr)| (addr, i))
            .collect();

        // Second pass: print instructions with labels
        writeln!(f, "  instructions:")?;
        for (addr, instr) in self.instructions.iter().enumerate() {
            let label_prefix = label_map
                .get(&addr)
                .map(|label_num| format!("L{}:", label_num))
                .unwrap_or_default();

            match instr.jump_target() {
                Some(target) => {
                    let target = target as usize;
                    let target_label = label_map
                        .get(&target)
                        .map(|l| format!("L{}", l))
                        .unwrap_or_else(|| format!("@{}", target));
                    writeln!(
                        f,
                        "    {:4} {:>4}  {:?} (to {})",
                        addr, label_prefix, instr, target_label
                    )?;
                }
                None => writeln!(f, "    {:4} {:>4}  {:?}", addr, label_prefix, instr)?,
            }
        }

        write!(f, "}}")
    }
}
