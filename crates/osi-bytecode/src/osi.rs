//! Whole OSI file: header plus subroutines

use std::path::Path;

use serde::Serialize;

use crate::error::{OsiError, Result};
use crate::header::{Header, Version};
use crate::options::{ReadOptions, TransformOptions};
use crate::subroutine::{SubroutineId, SubroutineTable};
use crate::transform::{self, inline::TableKind};
use crate::view::{BinaryView, Endian};

/// Decoded OSI file
#[derive(Debug, Clone, Serialize)]
pub struct Osi {
    /// Version and lookup tables
    pub header: Header,
    /// Code
    pub subroutines: SubroutineTable,
    endian: Endian,
}

impl Osi {
    /// Create an empty little-endian file
    pub fn new(version: Version) -> Self {
        let header = Header::new(version);
        let base = header.size() as u32;
        Self {
            header,
            subroutines: SubroutineTable::new(base),
            endian: Endian::Little,
        }
    }

    /// Byte order used when writing
    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Set the byte order used when writing
    #[inline]
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Decode a file
    pub fn from_bytes(bytes: &[u8], options: &ReadOptions) -> Result<Self> {
        let mut view = BinaryView::from_bytes(bytes, Endian::Little);
        view.make_readonly();
        let endian = match options.endian {
            Some(endian) => endian,
            None => Header::detect_endian(&view)?,
        };
        view.set_endian(endian);

        let header: Header = view.read_struct()?;
        let base = u32::try_from(view.offset())
            .map_err(|_| OsiError::range("header exceeds the 32-bit offset space"))?;

        let expected = options.verify_offsets.then(|| {
            header
                .functions
                .entries
                .iter()
                .map(|function| function.offset)
                .chain(
                    header
                        .classes
                        .entries
                        .iter()
                        .flat_map(|class| class.methods.iter().map(|method| method.offset)),
                )
                .collect::<Vec<_>>()
        });
        let subroutines = SubroutineTable::buffer_read(&mut view, base, expected.as_deref())?;

        tracing::debug!(
            target: "osi::read",
            ?endian,
            bytes = bytes.len(),
            subroutines = subroutines.len(),
            functions = header.functions.entries.len(),
            classes = header.classes.entries.len(),
            "file decoded"
        );
        Ok(Self {
            header,
            subroutines,
            endian,
        })
    }

    /// Encode the file
    ///
    /// Offsets must be current: call [`Osi::update_offsets`] after edits that
    /// change the header or subroutine sizes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header_size = self.header.size();
        if self.subroutines.base_offset() as usize != header_size {
            return Err(OsiError::internal(format!(
                "subroutines start at {} but the header is {header_size} bytes; offsets are stale",
                self.subroutines.base_offset()
            )));
        }
        let mut cursor = header_size;
        for (id, offset, subroutine) in self.subroutines.iter() {
            if offset as usize != cursor {
                return Err(OsiError::internal(format!(
                    "subroutine {} is stored at {offset} but lays out at {cursor}; offsets are stale",
                    id.index()
                )));
            }
            cursor += subroutine.size();
        }

        let mut view = BinaryView::new(cursor, self.endian);
        view.write_struct(&self.header)?;
        view.write_struct(&self.subroutines)?;
        tracing::debug!(target: "osi::write", bytes = cursor, "file encoded");
        Ok(view.to_vec())
    }

    /// Read and decode a file from disk
    pub fn load(path: impl AsRef<Path>, options: &ReadOptions) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, options)
    }

    /// Encode and write the file to disk
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Lay the subroutines out after the header and refresh every offset
    ///
    /// Function and method offsets follow the subroutines they pointed at.
    pub fn update_offsets(&mut self) -> Result<()> {
        let resolve = |offset: u32, owner: &dyn Fn() -> String| -> Result<SubroutineId> {
            self.subroutines.at_offset(offset).ok_or_else(|| {
                OsiError::invalid(format!("{} points at {offset}, which starts no subroutine", owner()))
            })
        };

        let functions = self
            .header
            .functions
            .entries
            .iter()
            .map(|function| {
                resolve(function.offset, &|| {
                    format!("function {}", function.name.0.to_string_lossy())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let methods = self
            .header
            .classes
            .entries
            .iter()
            .map(|class| {
                class
                    .methods
                    .iter()
                    .map(|method| {
                        resolve(method.offset, &|| {
                            format!("method of class {}", class.name.0.to_string_lossy())
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let base = u32::try_from(self.header.size())
            .map_err(|_| OsiError::range("header exceeds the 32-bit offset space"))?;
        self.subroutines.update_offsets(base)?;

        let offset_of = |id: SubroutineId| {
            self.subroutines
                .offset_of(id)
                .ok_or_else(|| OsiError::internal(format!("subroutine {} vanished", id.index())))
        };
        let mut function_offsets = Vec::with_capacity(functions.len());
        for id in functions {
            function_offsets.push(offset_of(id)?);
        }
        let mut method_offsets = Vec::with_capacity(methods.len());
        for ids in methods {
            method_offsets.push(ids.into_iter().map(offset_of).collect::<Result<Vec<_>>>()?);
        }

        for (function, offset) in self.header.functions.entries.iter_mut().zip(function_offsets) {
            function.offset = offset;
        }
        for (class, offsets) in self.header.classes.entries.iter_mut().zip(method_offsets) {
            for (method, offset) in class.methods.iter_mut().zip(offsets) {
                method.offset = offset;
            }
        }
        Ok(())
    }

    // ==================== Symbolic passes ====================

    /// Replace pushed jump distances with target markers
    pub fn transform_jumps_add(&mut self) -> Result<usize> {
        transform::jump::add(&mut self.subroutines)
    }

    /// Lower jump target markers back to pushed distances
    pub fn transform_jumps_remove(&mut self) -> Result<usize> {
        transform::jump::remove(&mut self.subroutines)
    }

    /// Replace inline branch displacements with target markers
    pub fn transform_branches_add(&mut self) -> Result<usize> {
        transform::branch::add(&mut self.subroutines)
    }

    /// Lower branch target markers back to inline displacements
    pub fn transform_branches_remove(&mut self) -> Result<usize> {
        transform::branch::remove(&mut self.subroutines)
    }

    /// Inline string-table entries
    pub fn transform_strings_add(&mut self) -> Result<usize> {
        transform::inline::add(TableKind::Strings, &self.header.strings, &mut self.subroutines)
    }

    /// Move inline strings back into the string table
    pub fn transform_strings_remove(&mut self) -> Result<usize> {
        transform::inline::remove(TableKind::Strings, &mut self.header.strings, &mut self.subroutines)
    }

    /// Inline symbol-table entries
    pub fn transform_symbols_add(&mut self) -> Result<usize> {
        transform::inline::add(TableKind::Symbols, &self.header.symbols, &mut self.subroutines)
    }

    /// Move inline symbols back into the symbol table
    pub fn transform_symbols_remove(&mut self) -> Result<usize> {
        transform::inline::remove(TableKind::Symbols, &mut self.header.symbols, &mut self.subroutines)
    }

    /// Inline global variable names
    pub fn transform_globals_add(&mut self) -> Result<usize> {
        transform::inline::add(TableKind::Globals, &self.header.globals, &mut self.subroutines)
    }

    /// Move inline global names back into the global table
    pub fn transform_globals_remove(&mut self) -> Result<usize> {
        transform::inline::remove(TableKind::Globals, &mut self.header.globals, &mut self.subroutines)
    }

    /// Inline class names
    pub fn transform_classes_add(&mut self) -> Result<usize> {
        Ok(transform::class::add(&self.header.classes, &mut self.subroutines))
    }

    /// Resolve inline class names back to class indices
    pub fn transform_classes_remove(&mut self) -> Result<usize> {
        transform::class::remove(&self.header.classes, &mut self.subroutines)
    }

    /// Run the enabled add passes
    pub fn abstract_all(&mut self, options: &TransformOptions) -> Result<()> {
        if options.strings {
            self.transform_strings_add()?;
        }
        if options.symbols {
            self.transform_symbols_add()?;
        }
        if options.globals {
            self.transform_globals_add()?;
        }
        if options.classes {
            self.transform_classes_add()?;
        }
        if options.branches {
            self.transform_branches_add()?;
        }
        if options.jumps {
            self.transform_jumps_add()?;
        }
        Ok(())
    }

    /// Run the enabled remove passes in reverse order, then refresh offsets
    pub fn concretize_all(&mut self, options: &TransformOptions) -> Result<()> {
        if options.jumps {
            self.transform_jumps_remove()?;
        }
        if options.branches {
            self.transform_branches_remove()?;
        }
        if options.classes {
            self.transform_classes_remove()?;
        }
        if options.globals {
            self.transform_globals_remove()?;
        }
        if options.symbols {
            self.transform_symbols_remove()?;
        }
        if options.strings {
            self.transform_strings_remove()?;
        }
        self.update_offsets()
    }
}
