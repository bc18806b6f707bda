//! `PushInt32 d; JumpRelative` pairs to and from symbolic targets
//!
//! The pushed distance is measured from the byte after the jump and may point
//! into any subroutine of the table.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Slot, boundaries, insert_all, layout, next_target_id, snap};
use crate::error::{OsiError, Result};
use crate::instruction::{AbstractInstruction, Bcl, Instruction, Opcode};
use crate::operand::TargetId;
use crate::subroutine::{Subroutine, SubroutineTable};

/// Instruction feeding `jump`, looking back over target markers only
fn feeding_slot(subroutine: &Subroutine, sub: usize, jump: usize) -> Option<Slot> {
    (0..jump).rev().map(|index| (sub, index)).find(|slot| {
        !matches!(
            subroutine.instructions[slot.1],
            Instruction::Abstract(
                AbstractInstruction::JumpTarget { .. } | AbstractInstruction::BranchTarget { .. }
            )
        )
    })
}

fn is_jump(instr: &Instruction) -> bool {
    matches!(instr, Instruction::Bcl(Bcl::JumpRelative {}))
}

/// Replace jump distances with target markers; returns the number of jumps rewritten
pub(crate) fn add(table: &mut SubroutineTable) -> Result<usize> {
    let base = i64::from(table.base_offset());
    let subroutines = table.subroutines();
    let (positions, end) = layout(subroutines, base);
    let boundaries = boundaries(subroutines, &positions, 0);
    let jump_size = Opcode::JumpRelative.size() as i64;

    // Feeding push -> (adjusted target, adjustment)
    let mut pushes: Vec<(Slot, i64, u32)> = Vec::new();
    for (sub, subroutine) in subroutines.iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            if !is_jump(instr) {
                continue;
            }
            let jump_end = positions[sub][index] + jump_size;
            let feeder =
                feeding_slot(subroutine, sub, index).map(|slot| (slot, &subroutine.instructions[slot.1]));
            let (slot, distance) = match feeder {
                Some((slot, Instruction::Bcl(Bcl::PushInt32 { value }))) => (slot, *value),
                // already symbolic
                Some((_, Instruction::Abstract(AbstractInstruction::JumpPush { .. }))) => continue,
                _ => {
                    return Err(OsiError::invalid(format!(
                        "jump at {} is not fed by a 32-bit push",
                        jump_end - jump_size
                    )));
                }
            };

            let raw = jump_end + i64::from(distance);
            if raw < base || raw > end {
                return Err(OsiError::range(format!(
                    "jump at {} targets {raw}, outside the code range {base}..={end}",
                    jump_end - jump_size
                )));
            }
            let (target, adjust) = snap(&boundaries, end, raw).ok_or_else(|| {
                OsiError::internal(format!("no instruction boundary at or before {raw}"))
            })?;
            tracing::trace!(
                target: "osi::transform",
                jump = jump_end - jump_size,
                target,
                adjust,
                "jump resolved"
            );
            pushes.push((slot, target, adjust));
        }
    }

    let mut next_id = next_target_id(table)?;
    let mut ids: BTreeMap<i64, TargetId> = BTreeMap::new();
    for &(_, target, _) in &pushes {
        if !ids.contains_key(&target) {
            ids.insert(target, TargetId(next_id));
            next_id = next_id
                .checked_add(1)
                .ok_or_else(|| OsiError::range("target ID space exhausted"))?;
        }
    }

    let last = subroutines.len().saturating_sub(1);
    let mut markers = Vec::with_capacity(ids.len());
    for (&target, &id) in &ids {
        let slot = if target == end {
            (last, subroutines[last].len())
        } else {
            *boundaries
                .get(&target)
                .ok_or_else(|| OsiError::internal(format!("target {target} lost its boundary")))?
        };
        markers.push((slot, Instruction::Abstract(AbstractInstruction::JumpTarget { id })));
    }

    let rewritten = pushes.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), target, adjust) in pushes {
        subroutines[sub].instructions[index] = Instruction::Abstract(AbstractInstruction::JumpPush {
            target: ids[&target],
            adjust,
        });
    }
    insert_all(subroutines, markers);

    tracing::debug!(
        target: "osi::transform",
        jumps = rewritten,
        targets = ids.len(),
        "jump targets added"
    );
    Ok(rewritten)
}

/// Lower jump markers back to pushed distances; returns the number of jumps rewritten
pub(crate) fn remove(table: &mut SubroutineTable) -> Result<usize> {
    let base = i64::from(table.base_offset());
    let subroutines = table.subroutines();
    let (positions, end) = layout(subroutines, base);
    let jump_size = Opcode::JumpRelative.size() as i64;

    let mut markers: FxHashMap<TargetId, i64> = FxHashMap::default();
    for (sub, subroutine) in subroutines.iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            if let Some(AbstractInstruction::JumpTarget { id }) = instr.as_abstract() {
                if markers.insert(*id, positions[sub][index]).is_some() {
                    return Err(OsiError::invalid(format!("duplicate jump target {}", id.raw())));
                }
            }
        }
    }

    let mut claimed = FxHashSet::default();
    let mut lowered: Vec<(Slot, i32)> = Vec::new();
    for (sub, subroutine) in subroutines.iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            if !is_jump(instr) {
                continue;
            }
            // jumps still fed by a concrete push need no lowering
            let Some((slot, target, adjust)) = feeding_slot(subroutine, sub, index).and_then(
                |slot| match subroutine.instructions[slot.1].as_abstract() {
                    Some(&AbstractInstruction::JumpPush { target, adjust }) => {
                        Some((slot, target, adjust))
                    }
                    _ => None,
                },
            ) else {
                continue;
            };

            let marker = *markers.get(&target).ok_or_else(|| {
                OsiError::invalid(format!("jump refers to unknown target {}", target.raw()))
            })?;
            let destination = marker + i64::from(adjust);
            if destination > end {
                return Err(OsiError::range(format!(
                    "jump destination {destination} lies past the end of the code at {end}"
                )));
            }
            let jump_end = positions[sub][index] + jump_size;
            let distance = i32::try_from(destination - jump_end).map_err(|_| {
                OsiError::range(format!(
                    "jump distance {} does not fit 32 bits",
                    destination - jump_end
                ))
            })?;
            claimed.insert(slot);
            lowered.push((slot, distance));
        }
    }

    for (sub, subroutine) in subroutines.iter().enumerate() {
        for (index, instr) in subroutine.instructions.iter().enumerate() {
            if matches!(instr, Instruction::Abstract(AbstractInstruction::JumpPush { .. }))
                && !claimed.contains(&(sub, index))
            {
                return Err(OsiError::invalid(format!(
                    "jump placeholder at subroutine {sub}, instruction {index} has no jump"
                )));
            }
        }
    }

    let rewritten = lowered.len();
    let subroutines = table.subroutines_mut();
    for ((sub, index), value) in lowered {
        subroutines[sub].instructions[index] = Instruction::Bcl(Bcl::PushInt32 { value });
    }
    for subroutine in subroutines.iter_mut() {
        subroutine.instructions.retain(|instr| {
            !matches!(instr, Instruction::Abstract(AbstractInstruction::JumpTarget { .. }))
        });
    }

    tracing::debug!(
        target: "osi::transform",
        jumps = rewritten,
        targets = markers.len(),
        "jump targets removed"
    );
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::VariableRef;

    fn table(subroutines: Vec<Subroutine>, base: u32) -> SubroutineTable {
        let mut table = SubroutineTable::new(base);
        for subroutine in subroutines {
            table.push(subroutine);
        }
        table.update_offsets(base).unwrap();
        table
    }

    fn jump_to(distance: i32) -> [Instruction; 2] {
        [
            Bcl::PushInt32 { value: distance }.into(),
            Bcl::JumpRelative {}.into(),
        ]
    }

    #[test]
    fn test_forward_jump_gets_marker() {
        // 0: Nop, 1: PushInt32, 6: JumpRelative, 7: Nop, 8: End
        let mut sub = Subroutine::new();
        sub.push(Bcl::Nop {});
        sub.instructions.extend(jump_to(1));
        sub.push(Bcl::Nop {});
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 40);

        assert_eq!(add(&mut table).unwrap(), 1);
        let instrs = &table.subroutines()[0].instructions;
        assert_eq!(
            instrs[1],
            Instruction::Abstract(AbstractInstruction::JumpPush {
                target: TargetId(0),
                adjust: 0
            })
        );
        assert_eq!(
            instrs[4],
            Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(0) })
        );
        assert_eq!(instrs[5], Instruction::Bcl(Bcl::End {}));
        assert_eq!(table.subroutines()[0].size(), 9);
    }

    #[test]
    fn test_cross_subroutine_jump_roundtrip() {
        let mut first = Subroutine::from_instructions(jump_to(1));
        first.push(Bcl::End {});
        let second = Subroutine::from_instructions([Bcl::PushNull {}, Bcl::End {}]);
        let mut table = table(vec![first, second], 0);
        let original = table.subroutines().to_vec();

        add(&mut table).unwrap();
        // lands on the PushNull that opens the second subroutine
        assert_eq!(
            table.subroutines()[1].instructions[0],
            Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(0) })
        );

        assert_eq!(remove(&mut table).unwrap(), 1);
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_misaligned_target_keeps_adjustment() {
        // target 2 lies inside the PushInt32 starting at 0
        let mut sub = Subroutine::from_instructions(jump_to(-4));
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 0);
        let original = table.subroutines().to_vec();

        add(&mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions[1],
            Instruction::Abstract(AbstractInstruction::JumpPush {
                target: TargetId(0),
                adjust: 2
            })
        );
        remove(&mut table).unwrap();
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_jump_to_table_end_appends_marker() {
        let mut sub = Subroutine::from_instructions(jump_to(1));
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 0);

        add(&mut table).unwrap();
        assert_eq!(
            table.subroutines()[0].instructions.last(),
            Some(&Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(0) }))
        );
    }

    #[test]
    fn test_out_of_range_target_changes_nothing() {
        let mut sub = Subroutine::from_instructions(jump_to(2));
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 0);
        let original = table.subroutines().to_vec();

        assert!(matches!(add(&mut table), Err(OsiError::Range(_))));
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_jump_without_push_is_rejected() {
        let sub = Subroutine::from_instructions([
            Bcl::PushInt8 { value: 0 },
            Bcl::JumpRelative {},
            Bcl::End {},
        ]);
        let mut table = table(vec![sub], 0);
        let original = table.subroutines().to_vec();

        assert!(matches!(add(&mut table), Err(OsiError::Invalid(_))));
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_unrelated_push_is_not_claimed() {
        let sub = Subroutine::from_instructions([
            Bcl::PushInt32 { value: 1 },
            Bcl::PopVariable {
                variable: VariableRef(0),
            },
            Bcl::PushInt8 { value: 0 },
            Bcl::JumpRelative {},
            Bcl::Nop {},
            Bcl::End {},
        ]);
        let mut table = table(vec![sub], 0);
        let original = table.subroutines().to_vec();

        assert!(matches!(add(&mut table), Err(OsiError::Invalid(_))));
        assert_eq!(table.subroutines(), original.as_slice());

        // a huge constant further back no longer looks like a jump distance
        let sub = Subroutine::from_instructions([
            Bcl::PushInt32 { value: 1_000_000 },
            Bcl::Pop {},
            Bcl::PushInt8 { value: 0 },
            Bcl::JumpRelative {},
            Bcl::End {},
        ]);
        let mut table = self::table(vec![sub], 18);
        assert!(matches!(add(&mut table), Err(OsiError::Invalid(_))));
    }

    #[test]
    fn test_push_must_directly_feed_the_jump() {
        let mut sub = Subroutine::from_instructions(jump_to(1));
        sub.instructions.insert(1, Bcl::Nop {}.into());
        sub.push(Bcl::Nop {});
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 0);
        assert!(matches!(add(&mut table), Err(OsiError::Invalid(_))));
    }

    #[test]
    fn test_jump_to_itself_roundtrips_past_marker() {
        // PushInt32 -1 targets the JumpRelative, so the marker lands between push and jump
        let mut sub = Subroutine::from_instructions(jump_to(-1));
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 0);
        let original = table.subroutines().to_vec();

        assert_eq!(add(&mut table).unwrap(), 1);
        assert_eq!(
            table.subroutines()[0].instructions[1],
            Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(0) })
        );
        // a second pass leaves the symbolic pair alone
        assert_eq!(add(&mut table).unwrap(), 0);

        assert_eq!(remove(&mut table).unwrap(), 1);
        assert_eq!(table.subroutines(), original.as_slice());
    }

    #[test]
    fn test_fresh_ids_skip_existing_markers() {
        let mut sub = Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::BranchTarget { id: TargetId(7) }),
        ]);
        sub.instructions.extend(jump_to(0));
        sub.push(Bcl::End {});
        let mut table = table(vec![sub], 0);

        add(&mut table).unwrap();
        assert!(table.subroutines()[0].instructions.contains(&Instruction::Abstract(
            AbstractInstruction::JumpTarget { id: TargetId(8) }
        )));
    }

    #[test]
    fn test_remove_rejects_unknown_target() {
        let sub = Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::JumpPush {
                target: TargetId(3),
                adjust: 0,
            }),
            Bcl::JumpRelative {}.into(),
            Bcl::End {}.into(),
        ]);
        let mut table = table(vec![sub], 0);
        assert!(matches!(remove(&mut table), Err(OsiError::Invalid(_))));
    }

    #[test]
    fn test_remove_rejects_unpaired_placeholder() {
        let sub = Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(0) }),
            Instruction::Abstract(AbstractInstruction::JumpPush {
                target: TargetId(0),
                adjust: 0,
            }),
            Bcl::End {}.into(),
        ]);
        let mut table = table(vec![sub], 0);
        assert!(matches!(remove(&mut table), Err(OsiError::Invalid(_))));
    }

    #[test]
    fn test_remove_rejects_duplicate_marker() {
        let sub = Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(1) }),
            Bcl::Nop {}.into(),
            Instruction::Abstract(AbstractInstruction::JumpTarget { id: TargetId(1) }),
            Bcl::End {}.into(),
        ]);
        let mut table = table(vec![sub], 0);
        assert!(matches!(remove(&mut table), Err(OsiError::Invalid(_))));
    }
}
