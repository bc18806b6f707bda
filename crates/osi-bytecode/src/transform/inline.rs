//! Table indices to and from inline string operands
//!
//! One rule per concrete opcode that carries an index into a string-like
//! table. The abstract counterpart has the same argument list with the index
//! replaced by the entry's text.

use crate::error::{OsiError, Result};
use crate::instruction::{AbstractInstruction, AbstractKind, Bcl, Instruction, Opcode};
use crate::operand::{GLOBAL_FLAG, MAX_GLOBAL_INDEX};
use crate::primitive::Value;
use crate::subroutine::SubroutineTable;
use crate::table::StringTable;

/// Header table an inlining pass resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableKind {
    Strings,
    Symbols,
    Globals,
}

impl TableKind {
    fn name(self) -> &'static str {
        match self {
            Self::Strings => "strings",
            Self::Symbols => "symbols",
            Self::Globals => "globals",
        }
    }
}

struct InlineRule {
    opcode: Opcode,
    position: usize,
    table: TableKind,
    symbolic: AbstractKind,
}

const RULES: &[InlineRule] = &[
    InlineRule {
        opcode: Opcode::PushString,
        position: 0,
        table: TableKind::Strings,
        symbolic: AbstractKind::PushStringLiteral,
    },
    InlineRule {
        opcode: Opcode::GetMember,
        position: 0,
        table: TableKind::Symbols,
        symbolic: AbstractKind::GetMemberNamed,
    },
    InlineRule {
        opcode: Opcode::SetMember,
        position: 0,
        table: TableKind::Symbols,
        symbolic: AbstractKind::SetMemberNamed,
    },
    InlineRule {
        opcode: Opcode::CallMethod,
        position: 0,
        table: TableKind::Symbols,
        symbolic: AbstractKind::CallMethodNamed,
    },
    InlineRule {
        opcode: Opcode::PushVariable,
        position: 0,
        table: TableKind::Globals,
        symbolic: AbstractKind::PushGlobal,
    },
    InlineRule {
        opcode: Opcode::PopVariable,
        position: 0,
        table: TableKind::Globals,
        symbolic: AbstractKind::PopGlobal,
    },
];

fn rule_for_opcode(kind: TableKind, opcode: Opcode) -> Option<&'static InlineRule> {
    RULES
        .iter()
        .find(|rule| rule.table == kind && rule.opcode == opcode)
}

fn rule_for_symbolic(kind: TableKind, symbolic: AbstractKind) -> Option<&'static InlineRule> {
    RULES
        .iter()
        .find(|rule| rule.table == kind && rule.symbolic == symbolic)
}

/// Table index named by a raw operand, `None` for local variables
fn table_index(kind: TableKind, raw: i64) -> Option<usize> {
    let raw = usize::try_from(raw).ok()?;
    match kind {
        TableKind::Globals if raw & usize::from(GLOBAL_FLAG) == 0 => None,
        TableKind::Globals => Some(raw & usize::from(MAX_GLOBAL_INDEX)),
        TableKind::Strings | TableKind::Symbols => Some(raw),
    }
}

/// Raw operand for a table index
fn operand_for(kind: TableKind, index: usize) -> Result<u16> {
    match kind {
        TableKind::Globals => {
            if index > usize::from(MAX_GLOBAL_INDEX) {
                return Err(OsiError::range(format!(
                    "global index {index} exceeds {MAX_GLOBAL_INDEX}"
                )));
            }
            Ok(GLOBAL_FLAG | index as u16)
        }
        TableKind::Strings | TableKind::Symbols => u16::try_from(index)
            .map_err(|_| OsiError::range(format!("{} index {index} exceeds 16 bits", kind.name()))),
    }
}

/// Replace indices into `entries` with the entries themselves
///
/// Indices past the end of the table are left as they are.
pub(crate) fn add(kind: TableKind, entries: &StringTable, table: &mut SubroutineTable) -> Result<usize> {
    let mut rewrites = Vec::new();
    let mut skipped = 0usize;

    for (sub, subroutine) in table.subroutines().iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            let Some(bcl) = instr.as_bcl() else { continue };
            let Some(rule) = rule_for_opcode(kind, bcl.opcode()) else {
                continue;
            };
            let mut args = bcl.args();
            let Some(entry_index) = args[rule.position]
                .as_i64()
                .and_then(|raw| table_index(kind, raw))
            else {
                continue;
            };
            let Some(entry) = entries.get(entry_index) else {
                tracing::debug!(
                    target: "osi::transform",
                    table = kind.name(),
                    index = entry_index,
                    len = entries.len(),
                    "index past the end of the table left as is"
                );
                skipped += 1;
                continue;
            };
            args[rule.position] = Value::Str(entry.clone());
            let symbolic = AbstractInstruction::from_args(rule.symbolic, &args)?;
            tracing::trace!(
                target: "osi::transform",
                table = kind.name(),
                index = entry_index,
                "{} inlined",
                bcl.opcode().name()
            );
            rewrites.push(((sub, index), symbolic));
        }
    }

    let rewritten = rewrites.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), symbolic) in rewrites {
        subroutines[sub].instructions[index] = Instruction::Abstract(symbolic);
    }

    tracing::debug!(
        target: "osi::transform",
        table = kind.name(),
        rewritten,
        skipped,
        "table references inlined"
    );
    Ok(rewritten)
}

/// Replace inline entries with indices into `entries`, appending missing ones
///
/// Existing entries are reused, the first match winning. `entries` is only
/// updated if the whole pass succeeds.
pub(crate) fn remove(kind: TableKind, entries: &mut StringTable, table: &mut SubroutineTable) -> Result<usize> {
    let mut staged = entries.clone();
    let mut rewrites: Vec<(_, Bcl)> = Vec::new();

    for (sub, subroutine) in table.subroutines().iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            let Some(symbolic) = instr.as_abstract() else { continue };
            let Some(rule) = rule_for_symbolic(kind, symbolic.kind()) else {
                continue;
            };
            let mut args = symbolic.args();
            let Some(text) = args[rule.position].as_str() else {
                return Err(OsiError::internal(format!(
                    "{} carries no text operand",
                    rule.symbolic.name()
                )));
            };
            let entry_index = staged.find_or_push(text)?;
            args[rule.position] = Value::U16(operand_for(kind, entry_index)?);
            rewrites.push(((sub, index), Bcl::from_args(rule.opcode, &args)?));
        }
    }

    let appended = staged.len() - entries.len();
    *entries = staged;
    let rewritten = rewrites.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), bcl) in rewrites {
        subroutines[sub].instructions[index] = Instruction::Bcl(bcl);
    }

    tracing::debug!(
        target: "osi::transform",
        table = kind.name(),
        rewritten,
        appended,
        "inline table references lowered"
    );
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{Literal, Name, StringIndex, SymbolIndex, VariableRef};
    use crate::primitive::StringFlavor;
    use crate::subroutine::Subroutine;

    fn single(instructions: Vec<Instruction>) -> SubroutineTable {
        let mut table = SubroutineTable::new(0);
        table.push(Subroutine { instructions });
        table
    }

    #[test]
    fn test_string_scenario() {
        let strings = StringTable::from_strs(StringFlavor::P16Z, ["a", "bb"]).unwrap();
        let mut table = single(vec![
            Bcl::PushString { index: StringIndex(1) }.into(),
            Bcl::End {}.into(),
        ]);

        add(TableKind::Strings, &strings, &mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions[0],
            Instruction::Abstract(AbstractInstruction::PushStringLiteral {
                value: Literal::new("bb").unwrap()
            })
        );

        let mut fresh = StringTable::new(StringFlavor::P16Z);
        remove(TableKind::Strings, &mut fresh, &mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions[0],
            Instruction::Bcl(Bcl::PushString { index: StringIndex(0) })
        );
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh.get(0).unwrap().as_bytes(), b"bb");
    }

    #[test]
    fn test_out_of_range_index_is_skipped() {
        let strings = StringTable::from_strs(StringFlavor::P16Z, ["a"]).unwrap();
        let mut table = single(vec![
            Bcl::PushString { index: StringIndex(4) }.into(),
            Bcl::End {}.into(),
        ]);
        assert_eq!(add(TableKind::Strings, &strings, &mut table).unwrap(), 0);
        assert_eq!(
            table.subroutines()[0].instructions[0],
            Instruction::Bcl(Bcl::PushString { index: StringIndex(4) })
        );
    }

    #[test]
    fn test_symbols_keep_other_operands() {
        let symbols = StringTable::from_strs(StringFlavor::P8Z, ["length", "push"]).unwrap();
        let call = Bcl::CallMethod {
            symbol: SymbolIndex(1),
            argc: 2,
        };
        let mut table = single(vec![call.into(), Bcl::End {}.into()]);

        add(TableKind::Symbols, &symbols, &mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions[0],
            Instruction::Abstract(AbstractInstruction::CallMethodNamed {
                symbol: Name::new("push").unwrap(),
                argc: 2
            })
        );

        let mut symbols = symbols;
        remove(TableKind::Symbols, &mut symbols, &mut table).unwrap();
        assert_eq!(table.subroutines()[0].instructions[0], Instruction::Bcl(call));
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn test_globals_pass_locals_through() {
        let globals = StringTable::from_strs(StringFlavor::P8Z, ["console", "window"]).unwrap();
        let local = Bcl::PushVariable {
            variable: VariableRef::local(1).unwrap(),
        };
        let global = Bcl::PopVariable {
            variable: VariableRef::global(1).unwrap(),
        };
        let mut table = single(vec![local.into(), global.into(), Bcl::End {}.into()]);

        assert_eq!(add(TableKind::Globals, &globals, &mut table).unwrap(), 1);
        let instrs = &table.subroutines()[0].instructions;
        assert_eq!(instrs[0], Instruction::Bcl(local));
        assert_eq!(
            instrs[1],
            Instruction::Abstract(AbstractInstruction::PopGlobal {
                name: Name::new("window").unwrap()
            })
        );

        let mut fresh = StringTable::new(StringFlavor::P8Z);
        remove(TableKind::Globals, &mut fresh, &mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions[1],
            Instruction::Bcl(Bcl::PopVariable {
                variable: VariableRef::global(0).unwrap()
            })
        );
    }

    #[test]
    fn test_failed_remove_leaves_table_untouched() {
        let mut table = single(vec![
            Instruction::Abstract(AbstractInstruction::PushGlobal {
                name: Name::new("g").unwrap(),
            }),
            Bcl::End {}.into(),
        ]);
        let texts: Vec<String> = (0..=usize::from(MAX_GLOBAL_INDEX)).map(|i| format!("v{i}")).collect();
        let mut globals = StringTable::from_strs(StringFlavor::P8Z, texts.iter().map(String::as_str)).unwrap();
        let before = globals.len();

        assert!(matches!(
            remove(TableKind::Globals, &mut globals, &mut table),
            Err(OsiError::Range(_))
        ));
        assert_eq!(globals.len(), before);
        assert!(table.subroutines()[0].instructions[0].is_abstract());
    }
}
