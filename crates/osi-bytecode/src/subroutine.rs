//! Subroutines and the offset-indexed subroutine table
//!
//! A [`SubroutineTable`] is an arena: subroutines are addressed by stable
//! [`SubroutineId`] handles, and each handle has a derived byte offset.
//! Offsets are never edited one by one; [`SubroutineTable::update_offsets`]
//! recomputes all of them from the subroutine sizes.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::{OsiError, Result};
use crate::instruction::{Bcl, Instruction};
use crate::view::{BinaryView, Writable};

/// Ordered instruction stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subroutine {
    /// Instructions in execution order
    pub instructions: Vec<Instruction>,
}

impl Subroutine {
    /// Create an empty subroutine
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a subroutine from instructions
    pub fn from_instructions<I>(instructions: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Instruction>,
    {
        Self {
            instructions: instructions.into_iter().map(Into::into).collect(),
        }
    }

    /// Append an instruction
    pub fn push(&mut self, instruction: impl Into<Instruction>) {
        self.instructions.push(instruction.into());
    }

    /// Number of instructions
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check if there are no instructions
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Sum of instruction sizes
    pub fn size(&self) -> usize {
        self.instructions.iter().map(Instruction::size).sum()
    }

    /// Byte position of every instruction relative to the subroutine start
    pub fn positions(&self) -> Vec<usize> {
        let mut cursor = 0;
        self.instructions
            .iter()
            .map(|instr| {
                let at = cursor;
                cursor += instr.size();
                at
            })
            .collect()
    }

    /// Check if every instruction is wire-encodable
    pub fn is_concrete(&self) -> bool {
        self.instructions.iter().all(|instr| !instr.is_abstract())
    }
}

impl Writable for Subroutine {
    fn buffer_size(&self) -> usize {
        self.size()
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        for instr in &self.instructions {
            match instr {
                Instruction::Bcl(bcl) => view.write_struct(bcl)?,
                Instruction::Abstract(instr) => {
                    return Err(OsiError::internal(format!(
                        "abstract instruction {} reached the encoder; run the removal passes first",
                        instr.kind().name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Stable handle to a subroutine in a [`SubroutineTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct SubroutineId(u32);

impl SubroutineId {
    /// Position in insertion order
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Subroutines laid out back to back from a base offset
#[derive(Debug, Clone, Serialize)]
pub struct SubroutineTable {
    subroutines: Vec<Subroutine>,
    offsets: Vec<u32>,
    #[serde(skip)]
    by_offset: FxHashMap<u32, SubroutineId>,
    base_offset: u32,
}

impl SubroutineTable {
    /// Create an empty table starting at `base_offset`
    pub fn new(base_offset: u32) -> Self {
        Self {
            subroutines: Vec::new(),
            offsets: Vec::new(),
            by_offset: FxHashMap::default(),
            base_offset,
        }
    }

    /// Offset of the first subroutine
    #[inline]
    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    /// Number of subroutines
    #[inline]
    pub fn len(&self) -> usize {
        self.subroutines.len()
    }

    /// Check if the table holds no subroutines
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subroutines.is_empty()
    }

    /// Subroutine behind a handle
    #[inline]
    pub fn get(&self, id: SubroutineId) -> Option<&Subroutine> {
        self.subroutines.get(id.index())
    }

    /// Mutable subroutine behind a handle
    ///
    /// Size changes take effect on offsets at the next `update_offsets`.
    #[inline]
    pub fn get_mut(&mut self, id: SubroutineId) -> Option<&mut Subroutine> {
        self.subroutines.get_mut(id.index())
    }

    /// Stored offset of a subroutine
    #[inline]
    pub fn offset_of(&self, id: SubroutineId) -> Option<u32> {
        self.offsets.get(id.index()).copied()
    }

    /// Subroutine starting at `offset`, as of the last layout
    #[inline]
    pub fn at_offset(&self, offset: u32) -> Option<SubroutineId> {
        self.by_offset.get(&offset).copied()
    }

    /// Handles in insertion order
    pub fn ids(&self) -> impl Iterator<Item = SubroutineId> + use<> {
        (0..self.subroutines.len() as u32).map(SubroutineId)
    }

    /// Handles, stored offsets and subroutines in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (SubroutineId, u32, &Subroutine)> {
        self.subroutines
            .iter()
            .zip(self.offsets.iter())
            .enumerate()
            .map(|(index, (subroutine, &offset))| (SubroutineId(index as u32), offset, subroutine))
    }

    /// Subroutines in insertion order
    pub fn subroutines(&self) -> &[Subroutine] {
        &self.subroutines
    }

    /// Mutable subroutines in insertion order
    pub fn subroutines_mut(&mut self) -> &mut [Subroutine] {
        &mut self.subroutines
    }

    /// Total size of all subroutines
    pub fn size(&self) -> usize {
        self.subroutines.iter().map(Subroutine::size).sum()
    }

    /// Offset right after the last subroutine, per stored offsets
    pub fn end_offset(&self) -> u32 {
        match (self.offsets.last(), self.subroutines.last()) {
            (Some(&offset), Some(last)) => offset.saturating_add(last.size() as u32),
            _ => self.base_offset,
        }
    }

    /// Append an empty subroutine after the current last one
    ///
    /// Returns its handle and temporary offset. The subroutine must be filled
    /// before the next `update_offsets`.
    pub fn add_new(&mut self) -> (SubroutineId, u32) {
        let offset = self.end_offset();
        let id = SubroutineId(self.subroutines.len() as u32);
        self.subroutines.push(Subroutine::new());
        self.offsets.push(offset);
        self.by_offset.insert(offset, id);
        (id, offset)
    }

    /// Append a filled subroutine after the current last one
    pub fn push(&mut self, subroutine: Subroutine) -> (SubroutineId, u32) {
        let (id, offset) = self.add_new();
        self.subroutines[id.index()] = subroutine;
        (id, offset)
    }

    /// Recompute every offset as a running sum of sizes starting at `base`
    ///
    /// Nothing changes if any subroutine is empty or the layout overflows.
    pub fn update_offsets(&mut self, base: u32) -> Result<()> {
        let mut offsets = Vec::with_capacity(self.subroutines.len());
        let mut by_offset = FxHashMap::default();
        by_offset.reserve(self.subroutines.len());

        let mut cursor = u64::from(base);
        for (index, subroutine) in self.subroutines.iter().enumerate() {
            let size = subroutine.size();
            if size == 0 {
                return Err(OsiError::subroutine(format!(
                    "subroutine {index} is empty and has no position of its own"
                )));
            }
            let offset = u32::try_from(cursor).map_err(|_| {
                OsiError::range(format!("subroutine {index} starts beyond the 32-bit offset space"))
            })?;
            offsets.push(offset);
            by_offset.insert(offset, SubroutineId(index as u32));
            cursor += size as u64;
        }
        if cursor > u64::from(u32::MAX) {
            return Err(OsiError::range(format!(
                "subroutines end at {cursor}, beyond the 32-bit offset space"
            )));
        }

        tracing::debug!(
            target: "osi::layout",
            base,
            subroutines = offsets.len(),
            end = cursor,
            "subroutine offsets updated"
        );

        self.offsets = offsets;
        self.by_offset = by_offset;
        self.base_offset = base;
        Ok(())
    }

    /// Decode subroutines from the cursor to the end of the view
    ///
    /// Each subroutine runs up to and including an `End` instruction. `base`
    /// is the absolute offset of the view's cursor. When `expected` is given,
    /// every listed offset must be the start of a subroutine.
    pub fn buffer_read(view: &mut BinaryView, base: u32, expected: Option<&[u32]>) -> Result<Self> {
        let mut expected: Vec<u32> = expected.map(<[u32]>::to_vec).unwrap_or_default();
        expected.sort_unstable();
        expected.dedup();
        let mut pending = expected.into_iter().peekable();

        let origin = view.offset();
        let position = |view: &BinaryView| -> Result<u32> {
            u32::try_from(u64::from(base) + (view.offset() - origin) as u64)
                .map_err(|_| OsiError::range("code extends beyond the 32-bit offset space"))
        };

        let mut table = Self::new(base);
        while view.remaining() > 0 {
            let start = position(view)?;
            if let Some(&next) = pending.peek() {
                if next < start {
                    return Err(OsiError::subroutine(format!(
                        "expected a subroutine at offset {next}, which lies before the code at {start}"
                    )));
                }
                if next == start {
                    pending.next();
                }
            }

            let mut subroutine = Subroutine::new();
            loop {
                if view.remaining() == 0 {
                    return Err(OsiError::subroutine(format!(
                        "subroutine at offset {start} is not terminated by End"
                    )));
                }
                let instr: Bcl = view.read_struct()?;
                let terminated = instr.is_terminator();
                subroutine.push(instr);

                let here = position(view)?;
                if let Some(&next) = pending.peek() {
                    if next < here || (next == here && !terminated) {
                        return Err(OsiError::subroutine(format!(
                            "expected a subroutine at offset {next}, inside the subroutine starting at {start}"
                        )));
                    }
                }
                if terminated {
                    break;
                }
            }

            tracing::trace!(
                target: "osi::read",
                offset = start,
                instructions = subroutine.len(),
                "subroutine decoded"
            );
            let id = SubroutineId(table.subroutines.len() as u32);
            table.subroutines.push(subroutine);
            table.offsets.push(start);
            table.by_offset.insert(start, id);
        }

        if let Some(next) = pending.next() {
            return Err(OsiError::subroutine(format!(
                "expected a subroutine at offset {next}, past the end of the code at {}",
                position(view)?
            )));
        }
        Ok(table)
    }
}

impl Writable for SubroutineTable {
    fn buffer_size(&self) -> usize {
        self.size()
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        for subroutine in &self.subroutines {
            view.write_struct(subroutine)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::AbstractInstruction;
    use crate::operand::TargetId;
    use crate::view::Endian;

    fn sized(bytes: usize) -> Subroutine {
        // PushInt32 (5) + Nop (1) fillers, closed by End (1)
        let mut sub = Subroutine::new();
        let mut left = bytes - 1;
        while left >= 5 {
            sub.push(Bcl::PushInt32 { value: 0 });
            left -= 5;
        }
        for _ in 0..left {
            sub.push(Bcl::Nop {});
        }
        sub.push(Bcl::End {});
        assert_eq!(sub.size(), bytes);
        sub
    }

    #[test]
    fn test_update_offsets_scenario() {
        let mut table = SubroutineTable::new(0);
        let (first, _) = table.push(sized(10));
        table.update_offsets(100).unwrap();
        assert_eq!(table.offset_of(first), Some(100));

        let (second, temporary) = table.add_new();
        assert_eq!(temporary, 110);
        *table.get_mut(second).unwrap() = sized(5);
        table.update_offsets(100).unwrap();

        assert_eq!(table.offset_of(first), Some(100));
        assert_eq!(table.offset_of(second), Some(110));
        assert_eq!(table.at_offset(110), Some(second));
        assert_eq!(table.end_offset(), 115);
    }

    #[test]
    fn test_update_offsets_is_all_or_nothing() {
        let mut table = SubroutineTable::new(0);
        table.push(sized(3));
        table.update_offsets(8).unwrap();
        table.add_new();
        table.push(sized(2));

        let before: Vec<_> = table.iter().map(|(_, offset, _)| offset).collect();
        assert!(matches!(table.update_offsets(50), Err(OsiError::Subroutine(_))));
        let after: Vec<_> = table.iter().map(|(_, offset, _)| offset).collect();
        assert_eq!(before, after);
        assert_eq!(table.base_offset(), 8);
    }

    #[test]
    fn test_marker_only_subroutine_is_empty() {
        let mut table = SubroutineTable::new(0);
        table.push(Subroutine::from_instructions([AbstractInstruction::JumpTarget {
            id: TargetId(1),
        }]));
        assert!(matches!(table.update_offsets(0), Err(OsiError::Subroutine(_))));
    }

    fn encode(table: &SubroutineTable) -> BinaryView {
        let mut view = BinaryView::new(table.buffer_size(), Endian::Little);
        view.write_struct(table).unwrap();
        view.set_offset(0).unwrap();
        view
    }

    #[test]
    fn test_read_splits_on_end() {
        let mut table = SubroutineTable::new(20);
        table.push(sized(6));
        table.push(sized(1));
        table.push(sized(12));
        table.update_offsets(20).unwrap();

        let mut view = encode(&table);
        let decoded = SubroutineTable::buffer_read(&mut view, 20, Some(&[27, 20, 26])).unwrap();
        let offsets: Vec<_> = decoded.iter().map(|(_, offset, _)| offset).collect();
        assert_eq!(offsets, vec![20, 26, 27]);
        assert_eq!(decoded.subroutines(), table.subroutines());
    }

    #[test]
    fn test_read_rejects_expected_offset_inside_subroutine() {
        let mut table = SubroutineTable::new(0);
        table.push(sized(11));
        let mut view = encode(&table);
        // 5 is the boundary between the first PushInt32 and the second
        let err = SubroutineTable::buffer_read(&mut view, 0, Some(&[0, 5])).unwrap_err();
        assert!(matches!(err, OsiError::Subroutine(_)));

        let mut view = encode(&table);
        let err = SubroutineTable::buffer_read(&mut view, 0, Some(&[3])).unwrap_err();
        assert!(matches!(err, OsiError::Subroutine(_)));
    }

    #[test]
    fn test_read_rejects_expected_offset_past_end() {
        let mut table = SubroutineTable::new(0);
        table.push(sized(2));
        let mut view = encode(&table);
        let err = SubroutineTable::buffer_read(&mut view, 0, Some(&[0, 2])).unwrap_err();
        assert!(matches!(err, OsiError::Subroutine(_)));
    }

    #[test]
    fn test_read_rejects_unterminated_subroutine() {
        let mut view = BinaryView::from_hex("00 2f 07", Endian::Little).unwrap();
        let err = SubroutineTable::buffer_read(&mut view, 0, None).unwrap_err();
        assert!(matches!(err, OsiError::Subroutine(_)));
    }

    #[test]
    fn test_abstract_instruction_cannot_be_written() {
        let mut table = SubroutineTable::new(0);
        table.push(Subroutine::from_instructions([
            Instruction::Abstract(AbstractInstruction::JumpPush {
                target: TargetId(0),
                adjust: 0,
            }),
            Instruction::Bcl(Bcl::End {}),
        ]));
        let mut view = BinaryView::new(table.buffer_size(), Endian::Little);
        assert!(matches!(view.write_struct(&table), Err(OsiError::Internal(_))));
    }
}
