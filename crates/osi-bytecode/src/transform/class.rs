//! `NewObject` class indices to and from class names

use crate::error::{OsiError, Result};
use crate::instruction::{AbstractInstruction, Bcl, Instruction};
use crate::operand::ClassIndex;
use crate::subroutine::SubroutineTable;
use crate::table::ClassTable;

/// Replace class indices with class names; indices past the table are left as is
pub(crate) fn add(classes: &ClassTable, table: &mut SubroutineTable) -> usize {
    let mut rewrites = Vec::new();
    for (sub, subroutine) in table.subroutines().iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            let Some(Bcl::NewObject { class }) = instr.as_bcl() else {
                continue;
            };
            match classes.entries.get(usize::from(class.raw())) {
                Some(definition) => rewrites.push((
                    (sub, index),
                    AbstractInstruction::NewObjectNamed {
                        class: definition.name.clone(),
                    },
                )),
                None => tracing::debug!(
                    target: "osi::transform",
                    class = class.raw(),
                    len = classes.entries.len(),
                    "class index past the end of the table left as is"
                ),
            }
        }
    }

    let rewritten = rewrites.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), instr) in rewrites {
        subroutines[sub].instructions[index] = Instruction::Abstract(instr);
    }
    tracing::debug!(target: "osi::transform", rewritten, "class names inlined");
    rewritten
}

/// Replace class names with indices of the matching class definitions
pub(crate) fn remove(classes: &ClassTable, table: &mut SubroutineTable) -> Result<usize> {
    let mut rewrites = Vec::new();
    for (sub, subroutine) in table.subroutines().iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            let Some(AbstractInstruction::NewObjectNamed { class }) = instr.as_abstract() else {
                continue;
            };
            let position = classes.unique_position(class.0.as_bytes())?.ok_or_else(|| {
                OsiError::invalid(format!("unknown class {}", class.0.to_string_lossy()))
            })?;
            let raw = u16::try_from(position)
                .map_err(|_| OsiError::range(format!("class index {position} exceeds 16 bits")))?;
            rewrites.push(((sub, index), Bcl::NewObject { class: ClassIndex(raw) }));
        }
    }

    let rewritten = rewrites.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), bcl) in rewrites {
        subroutines[sub].instructions[index] = Instruction::Bcl(bcl);
    }
    tracing::debug!(target: "osi::transform", rewritten, "class names lowered");
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Name;
    use crate::subroutine::Subroutine;
    use crate::table::{ClassDefinition, CountWidth};

    fn classes(names: &[&str]) -> ClassTable {
        let mut table = ClassTable::new(CountWidth::U16);
        for name in names {
            table.entries.push(ClassDefinition::new(name).unwrap());
        }
        table
    }

    fn single(instr: impl Into<Instruction>) -> SubroutineTable {
        let mut table = SubroutineTable::new(0);
        table.push(Subroutine::from_instructions([instr.into(), Bcl::End {}.into()]));
        table
    }

    #[test]
    fn test_class_roundtrip() {
        let classes = classes(&["Point", "Line"]);
        let original = Bcl::NewObject { class: ClassIndex(1) };
        let mut table = single(original);

        assert_eq!(add(&classes, &mut table), 1);
        assert_eq!(
            table.subroutines()[0].instructions[0],
            Instruction::Abstract(AbstractInstruction::NewObjectNamed {
                class: Name::new("Line").unwrap()
            })
        );
        assert_eq!(remove(&classes, &mut table).unwrap(), 1);
        assert_eq!(table.subroutines()[0].instructions[0], Instruction::Bcl(original));
    }

    #[test]
    fn test_unknown_class_is_invalid() {
        let mut table = single(AbstractInstruction::NewObjectNamed {
            class: Name::new("Circle").unwrap(),
        });
        assert!(matches!(
            remove(&classes(&["Point"]), &mut table),
            Err(OsiError::Invalid(_))
        ));
    }

    #[test]
    fn test_ambiguous_class_is_invalid() {
        let mut table = single(AbstractInstruction::NewObjectNamed {
            class: Name::new("Point").unwrap(),
        });
        assert!(matches!(
            remove(&classes(&["Point", "Point"]), &mut table),
            Err(OsiError::Invalid(_))
        ));
    }
}
