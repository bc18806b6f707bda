//! Symbolic rewrite passes
//!
//! Every pass comes in an `add` form, which replaces raw indices and
//! displacements with symbolic instructions, and a `remove` form, which
//! lowers them back. Passes decide every change before touching the table,
//! so a failed pass leaves it as it was.

pub(crate) mod branch;
pub(crate) mod class;
pub(crate) mod inline;
pub(crate) mod jump;

use std::collections::BTreeMap;

use crate::error::{OsiError, Result};
use crate::instruction::Instruction;
use crate::subroutine::{Subroutine, SubroutineTable};

/// Location of an instruction: subroutine index and instruction index
pub(crate) type Slot = (usize, usize);

/// First target ID not used by any marker or reference in the table
pub(crate) fn next_target_id(table: &SubroutineTable) -> Result<u32> {
    let highest = table
        .subroutines()
        .iter()
        .flat_map(|subroutine| subroutine.instructions.iter())
        .filter_map(Instruction::as_abstract)
        .filter_map(|instr| instr.marker_id().or(instr.target_ref()))
        .map(|id| id.raw())
        .max();
    match highest {
        None => Ok(0),
        Some(id) => id
            .checked_add(1)
            .ok_or_else(|| OsiError::range("target ID space exhausted")),
    }
}

/// Instruction start positions for a run of subroutines laid out from `base`
///
/// Returns the per-subroutine positions and the position right after the last
/// instruction.
pub(crate) fn layout(subroutines: &[Subroutine], base: i64) -> (Vec<Vec<i64>>, i64) {
    let mut cursor = base;
    let positions = subroutines
        .iter()
        .map(|subroutine| {
            subroutine
                .instructions
                .iter()
                .map(|instr| {
                    let at = cursor;
                    cursor += instr.size() as i64;
                    at
                })
                .collect()
        })
        .collect();
    (positions, cursor)
}

/// Where a marker for each byte position goes
///
/// Maps the start of every sized instruction to its slot, which is where a
/// marker for that position is inserted. Zero-size instructions never own a
/// position.
pub(crate) fn boundaries(
    subroutines: &[Subroutine],
    positions: &[Vec<i64>],
    first: usize,
) -> BTreeMap<i64, Slot> {
    let mut map = BTreeMap::new();
    for (offset, (subroutine, starts)) in subroutines.iter().zip(positions).enumerate() {
        for (index, (instr, &at)) in subroutine.instructions.iter().zip(starts).enumerate() {
            if instr.size() > 0 {
                map.entry(at).or_insert((first + offset, index));
            }
        }
    }
    map
}

/// Move `target` back to the closest instruction boundary at or before it
///
/// `end` counts as a boundary. Returns the boundary and the distance moved.
pub(crate) fn snap(boundaries: &BTreeMap<i64, Slot>, end: i64, target: i64) -> Option<(i64, u32)> {
    let boundary = if target == end {
        end
    } else {
        *boundaries.range(..=target).next_back()?.0
    };
    let adjust = u32::try_from(target - boundary).ok()?;
    Some((boundary, adjust))
}

/// Insert instructions at the given slots, keeping each slot's meaning
///
/// Slots refer to indices before any insertion. An index equal to the
/// subroutine length appends.
pub(crate) fn insert_all(subroutines: &mut [Subroutine], mut inserts: Vec<(Slot, Instruction)>) {
    // Back to front so earlier indices stay valid
    inserts.sort_by(|a, b| b.0.cmp(&a.0));
    for ((sub, index), instr) in inserts {
        subroutines[sub].instructions.insert(index, instr);
    }
}
