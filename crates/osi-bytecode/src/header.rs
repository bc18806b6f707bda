//! File header: magic, version and the lookup tables

use serde::Serialize;

use crate::error::{OsiError, Result};
use crate::primitive::StringFlavor;
use crate::table::{ClassTable, CountWidth, FunctionTable, StringTable};
use crate::view::{BinaryView, Endian, Readable, Writable};

/// `"OSI\0"` read with the byte order opposite to the file's
pub const MAGIC: u32 = 0x4F53_4900;

const PREAMBLE_SIZE: usize = 4 + 2 + 2;

/// Supported format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Version {
    /// 4.1: one-byte class member counts, source table present
    V4_1,
    /// 6.0: two-byte class member counts, no source table
    V6_0,
}

impl Version {
    /// Validate a major/minor pair
    pub fn from_pair(major: u16, minor: u16) -> Result<Self> {
        match (major, minor) {
            (4, 1) => Ok(Self::V4_1),
            (6, 0) => Ok(Self::V6_0),
            _ => Err(OsiError::invalid(format!(
                "unsupported version {major}.{minor}"
            ))),
        }
    }

    /// Major and minor numbers
    pub const fn pair(self) -> (u16, u16) {
        match self {
            Self::V4_1 => (4, 1),
            Self::V6_0 => (6, 0),
        }
    }

    /// Width of class property and method counts
    pub const fn class_count_width(self) -> CountWidth {
        match self {
            Self::V4_1 => CountWidth::U8,
            Self::V6_0 => CountWidth::U16,
        }
    }

    /// Whether the header carries a source table
    pub const fn has_sources(self) -> bool {
        matches!(self, Self::V4_1)
    }
}

/// Header tables in wire order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Header {
    version: Version,
    /// String literals (P16Z)
    pub strings: StringTable,
    /// Global variable names (P8Z)
    pub globals: StringTable,
    /// Functions
    pub functions: FunctionTable,
    /// Classes
    pub classes: ClassTable,
    /// Property and method names (P8Z)
    pub symbols: StringTable,
    /// Source file names (P8Z), 4.1 only
    pub sources: Option<StringTable>,
}

impl Header {
    /// Create a header with empty tables
    pub fn new(version: Version) -> Self {
        Self {
            version,
            strings: StringTable::new(StringFlavor::P16Z),
            globals: StringTable::new(StringFlavor::P8Z),
            functions: FunctionTable::default(),
            classes: ClassTable::new(version.class_count_width()),
            symbols: StringTable::new(StringFlavor::P8Z),
            sources: version
                .has_sources()
                .then(|| StringTable::new(StringFlavor::P8Z)),
        }
    }

    /// Reset to an empty header of the given version
    pub fn init_version(&mut self, major: u16, minor: u16) -> Result<()> {
        *self = Self::new(Version::from_pair(major, minor)?);
        Ok(())
    }

    /// Format version
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Encoded size, which is also the offset of the first subroutine
    pub fn size(&self) -> usize {
        self.buffer_size()
    }

    /// Byte order of a file, judged by its magic
    pub fn detect_endian(view: &BinaryView) -> Result<Endian> {
        for endian in [Endian::Little, Endian::Big] {
            if view.get_with::<u32>(0, endian.inverted())? == MAGIC {
                return Ok(endian);
            }
        }
        Err(OsiError::invalid("missing OSI magic"))
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new(Version::V6_0)
    }
}

impl Readable for Header {
    fn buffer_read(view: &mut BinaryView) -> Result<Self> {
        let magic: u32 = view.read_with(view.endian().inverted())?;
        if magic != MAGIC {
            return Err(OsiError::invalid(format!(
                "bad magic {magic:#010x}, expected {MAGIC:#010x}"
            )));
        }
        let major = view.read()?;
        let minor = view.read()?;
        let version = Version::from_pair(major, minor)?;

        let strings = StringTable::buffer_read(view, StringFlavor::P16Z)?;
        let globals = StringTable::buffer_read(view, StringFlavor::P8Z)?;
        let functions = view.read_struct()?;
        let classes = ClassTable::buffer_read(view, version.class_count_width())?;
        let symbols = StringTable::buffer_read(view, StringFlavor::P8Z)?;
        let sources = if version.has_sources() {
            Some(StringTable::buffer_read(view, StringFlavor::P8Z)?)
        } else {
            None
        };

        tracing::debug!(
            target: "osi::read",
            major,
            minor,
            strings = strings.len(),
            globals = globals.len(),
            symbols = symbols.len(),
            size = view.offset(),
            "header decoded"
        );

        Ok(Self {
            version,
            strings,
            globals,
            functions,
            classes,
            symbols,
            sources,
        })
    }
}

impl Writable for Header {
    fn buffer_size(&self) -> usize {
        PREAMBLE_SIZE
            + self.strings.buffer_size()
            + self.globals.buffer_size()
            + self.functions.buffer_size()
            + self.classes.buffer_size()
            + self.symbols.buffer_size()
            + self.sources.as_ref().map_or(0, Writable::buffer_size)
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        if self.version.has_sources() != self.sources.is_some() {
            return Err(OsiError::internal(format!(
                "source table presence does not match version {:?}",
                self.version
            )));
        }
        if self.classes.count_width() != self.version.class_count_width() {
            return Err(OsiError::internal(format!(
                "class count width does not match version {:?}",
                self.version
            )));
        }

        let (major, minor) = self.version.pair();
        view.write_with(MAGIC, view.endian().inverted())?;
        view.write(major)?;
        view.write(minor)?;
        view.write_struct(&self.strings)?;
        view.write_struct(&self.globals)?;
        view.write_struct(&self.functions)?;
        view.write_struct(&self.classes)?;
        view.write_struct(&self.symbols)?;
        if let Some(sources) = &self.sources {
            view.write_struct(sources)?;
        }
        Ok(())
    }
}
