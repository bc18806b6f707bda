//! Inline branch displacements to and from symbolic targets
//!
//! Branch destinations never leave their subroutine, so positions here are
//! local: byte 0 is the first instruction of the subroutine.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::{boundaries, insert_all, layout, next_target_id, snap};
use crate::error::{OsiError, Result};
use crate::instruction::{AbstractInstruction, Instruction};
use crate::operand::TargetId;
use crate::subroutine::SubroutineTable;

/// Replace branch displacements with target markers; returns the number of branches rewritten
pub(crate) fn add(table: &mut SubroutineTable) -> Result<usize> {
    let mut next_id = next_target_id(table)?;
    let mut rewrites = Vec::new();
    let mut markers = Vec::new();

    for (sub, subroutine) in table.subroutines().iter().enumerate() {
        let local = std::slice::from_ref(subroutine);
        let (positions, end) = layout(local, 0);
        let boundaries = boundaries(local, &positions, sub);

        let mut ids: BTreeMap<i64, TargetId> = BTreeMap::new();
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            let Some((kind, displacement)) = instr.as_bcl().and_then(|bcl| bcl.branch()) else {
                continue;
            };
            let branch_end = positions[0][index] + instr.size() as i64;
            let raw = branch_end + i64::from(displacement);
            if raw < 0 || raw > end {
                return Err(OsiError::range(format!(
                    "branch at {} in subroutine {sub} targets {raw}, outside 0..={end}",
                    positions[0][index]
                )));
            }
            let (target, adjust) = snap(&boundaries, end, raw).ok_or_else(|| {
                OsiError::internal(format!("no instruction boundary at or before {raw}"))
            })?;

            let id = match ids.get(&target) {
                Some(&id) => id,
                None => {
                    let id = TargetId(next_id);
                    next_id = next_id
                        .checked_add(1)
                        .ok_or_else(|| OsiError::range("target ID space exhausted"))?;
                    ids.insert(target, id);
                    id
                }
            };
            tracing::trace!(
                target: "osi::transform",
                subroutine = sub,
                target,
                adjust,
                id = id.raw(),
                "branch resolved"
            );
            rewrites.push(((sub, index), kind.symbolic(id, adjust)));
        }

        for (&target, &id) in &ids {
            let slot = if target == end {
                (sub, subroutine.len())
            } else {
                *boundaries.get(&target).ok_or_else(|| {
                    OsiError::internal(format!("target {target} lost its boundary"))
                })?
            };
            markers.push((slot, Instruction::Abstract(AbstractInstruction::BranchTarget { id })));
        }
    }

    let rewritten = rewrites.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), instr) in rewrites {
        subroutines[sub].instructions[index] = Instruction::Abstract(instr);
    }
    let targets = markers.len();
    insert_all(subroutines, markers);

    tracing::debug!(
        target: "osi::transform",
        branches = rewritten,
        targets,
        "branch targets added"
    );
    Ok(rewritten)
}

/// Lower branch markers back to inline displacements; returns the number of branches rewritten
pub(crate) fn remove(table: &mut SubroutineTable) -> Result<usize> {
    let mut seen: FxHashMap<TargetId, usize> = FxHashMap::default();
    let mut rewrites = Vec::new();

    for (sub, subroutine) in table.subroutines().iter().enumerate() {
        let (positions, end) = layout(std::slice::from_ref(subroutine), 0);

        let mut markers: FxHashMap<TargetId, i64> = FxHashMap::default();
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            if let Some(AbstractInstruction::BranchTarget { id }) = instr.as_abstract() {
                if let Some(other) = seen.insert(*id, sub) {
                    return Err(OsiError::invalid(format!(
                        "branch target {} defined in subroutines {other} and {sub}",
                        id.raw()
                    )));
                }
                markers.insert(*id, positions[0][index]);
            }
        }

        for (index, instr) in subroutine.instructions.iter().enumerate() {
            let Some((kind, target, adjust)) = instr.as_abstract().and_then(|a| a.branch()) else {
                continue;
            };
            let marker = *markers.get(&target).ok_or_else(|| {
                OsiError::invalid(format!(
                    "branch in subroutine {sub} refers to target {}, which is not in the same subroutine",
                    target.raw()
                ))
            })?;
            let destination = marker + i64::from(adjust);
            if destination > end {
                return Err(OsiError::range(format!(
                    "branch destination {destination} lies past the end of subroutine {sub} at {end}"
                )));
            }
            let branch_end = positions[0][index] + instr.size() as i64;
            let displacement = i16::try_from(destination - branch_end).map_err(|_| {
                OsiError::range(format!(
                    "branch displacement {} does not fit 16 bits",
                    destination - branch_end
                ))
            })?;
            rewrites.push(((sub, index), kind.concrete(displacement)));
        }
    }

    let rewritten = rewrites.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), bcl) in rewrites {
        subroutines[sub].instructions[index] = Instruction::Bcl(bcl);
    }
    for subroutine in subroutines.iter_mut() {
        subroutine.instructions.retain(|instr| {
            !matches!(instr, Instruction::Abstract(AbstractInstruction::BranchTarget { .. }))
        });
    }

    tracing::debug!(
        target: "osi::transform",
        branches = rewritten,
        targets = seen.len(),
        "branch targets removed"
    );
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Bcl;
    use crate::subroutine::Subroutine;

    fn table(subroutines: Vec<Subroutine>) -> SubroutineTable {
        let mut table = SubroutineTable::new(0);
        for subroutine in subroutines {
            table.push(subroutine);
        }
        table
    }

    #[test]
    fn test_loop_roundtrip() {
        // 0: PushTrue, 1: BranchIfTrue -4 (back to 0), 4: End
        let sub = Subroutine::from_instructions([
            Bcl::PushTrue {},
            Bcl::BranchIfTrue { displacement: -4 },
            Bcl::End {},
        ]);
        let mut table = table(vec![sub]);
        let original = table.subroutines().to_vec();

        assert_eq!(add(&mut table).unwrap(), 1);
        assert_eq!(
            table.subroutines()[0].instructions,
            vec![
                Instruction::Abstract(AbstractInstruction::BranchTarget { id: TargetId(0) }),
                Bcl::PushTrue {}.into(),
                Instruction::Abstract(AbstractInstruction::BranchIfTrueTo {
                    target: TargetId(0),
                    adjust: 0
                }),
                Bcl::End {}.into(),
            ]
        );

        assert_eq!(remove(&mut table).unwrap(), 1);
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_shared_target_gets_one_marker() {
        let sub = Subroutine::from_instructions([
            Bcl::Branch { displacement: 3 },
            Bcl::BranchIfFalse { displacement: 0 },
            Bcl::End {},
        ]);
        let mut table = table(vec![sub]);
        add(&mut table).unwrap();

        let markers = table.subroutines()[0]
            .instructions
            .iter()
            .filter(|instr| matches!(instr, Instruction::Abstract(AbstractInstruction::BranchTarget { .. })))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_branch_to_subroutine_end() {
        let sub = Subroutine::from_instructions([Bcl::Branch { displacement: 1 }, Bcl::End {}]);
        let mut table = table(vec![sub]);
        let original = table.subroutines().to_vec();

        add(&mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions.last(),
            Some(&Instruction::Abstract(AbstractInstruction::BranchTarget { id: TargetId(0) }))
        );
        remove(&mut table).unwrap();
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_branch_leaving_subroutine_is_range_error() {
        let sub = Subroutine::from_instructions([Bcl::Branch { displacement: -4 }, Bcl::End {}]);
        let mut table = table(vec![sub]);
        assert!(matches!(add(&mut table), Err(OsiError::Range(_))));
    }

    #[test]
    fn test_remove_rejects_target_in_other_subroutine() {
        let first = Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::BranchTo {
                target: TargetId(0),
                adjust: 0,
            }),
            Bcl::End {}.into(),
        ]);
        let second = Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::BranchTarget { id: TargetId(0) }),
            Bcl::End {}.into(),
        ]);
        let mut table = table(vec![first, second]);
        assert!(matches!(remove(&mut table), Err(OsiError::Invalid(_))));
    }

    #[test]
    fn test_remove_rejects_displacement_overflow() {
        let mut instructions: Vec<Instruction> = vec![
            Instruction::Abstract(AbstractInstruction::BranchTo {
                target: TargetId(0),
                adjust: 0,
            }),
        ];
        instructions.extend((0..7000).map(|_| Instruction::Bcl(Bcl::PushInt32 { value: 0 })));
        instructions.push(Instruction::Abstract(AbstractInstruction::BranchTarget { id: TargetId(0) }));
        instructions.push(Bcl::End {}.into());
        let mut table = table(vec![Subroutine { instructions }]);
        assert!(matches!(remove(&mut table), Err(OsiError::Range(_))));
    }
}
