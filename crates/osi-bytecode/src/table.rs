//! Length-prefixed header tables

use serde::{Deserialize, Serialize};

use crate::error::{OsiError, Result};
use crate::operand::{Name, SymbolIndex};
use crate::primitive::{PascalString, StringFlavor};
use crate::view::{BinaryView, Readable, Writable};

/// Most entries any table can hold (2-byte count)
pub const MAX_TABLE_ENTRIES: usize = u16::MAX as usize;

/// Width of an entry count on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountWidth {
    /// One-byte count
    U8,
    /// Two-byte count
    U16,
}

impl CountWidth {
    /// Encoded width in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
        }
    }

    /// Largest count that can be encoded
    #[inline]
    pub const fn max(self) -> usize {
        match self {
            Self::U8 => u8::MAX as usize,
            Self::U16 => u16::MAX as usize,
        }
    }

    fn read(self, view: &mut BinaryView) -> Result<usize> {
        Ok(match self {
            Self::U8 => usize::from(view.read::<u8>()?),
            Self::U16 => usize::from(view.read::<u16>()?),
        })
    }

    fn write(self, view: &mut BinaryView, count: usize, what: &str) -> Result<()> {
        if count > self.max() {
            return Err(OsiError::range(format!(
                "{count} {what} do not fit a {}-byte count",
                self.size()
            )));
        }
        match self {
            Self::U8 => view.write(count as u8),
            Self::U16 => view.write(count as u16),
        }
    }
}

// ==================== String tables ====================

/// Table of pascal strings sharing one flavor
///
/// Used for the string, global, symbol and source tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StringTable {
    flavor: StringFlavor,
    entries: Vec<PascalString>,
}

impl StringTable {
    /// Create an empty table
    pub fn new(flavor: StringFlavor) -> Self {
        Self {
            flavor,
            entries: Vec::new(),
        }
    }

    /// Build a table from text entries
    pub fn from_strs<'a>(flavor: StringFlavor, texts: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut table = Self::new(flavor);
        for text in texts {
            table.push(PascalString::new(text.as_bytes(), flavor)?)?;
        }
        Ok(table)
    }

    /// Flavor of every entry
    #[inline]
    pub fn flavor(&self) -> StringFlavor {
        self.flavor
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`
    #[inline]
    pub fn get(&self, index: usize) -> Option<&PascalString> {
        self.entries.get(index)
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &PascalString> {
        self.entries.iter()
    }

    /// Index of the first entry with exactly this content
    pub fn position(&self, bytes: &[u8]) -> Option<usize> {
        self.entries.iter().position(|entry| entry.as_bytes() == bytes)
    }

    /// Append an entry, converting it to the table's flavor; returns its index
    pub fn push(&mut self, value: PascalString) -> Result<usize> {
        if self.entries.len() >= MAX_TABLE_ENTRIES {
            return Err(OsiError::range(format!(
                "table already holds {MAX_TABLE_ENTRIES} entries"
            )));
        }
        let value = if value.flavor() == self.flavor {
            value
        } else {
            value.with_flavor(self.flavor)?
        };
        self.entries.push(value);
        Ok(self.entries.len() - 1)
    }

    /// Index of an entry with this content, appending it if absent
    ///
    /// When the table holds duplicates the first match wins.
    pub fn find_or_push(&mut self, value: &PascalString) -> Result<usize> {
        match self.position(value.as_bytes()) {
            Some(index) => Ok(index),
            None => self.push(value.clone()),
        }
    }

    /// Decode a 2-byte count followed by that many strings
    pub fn buffer_read(view: &mut BinaryView, flavor: StringFlavor) -> Result<Self> {
        let count = CountWidth::U16.read(view)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(PascalString::read(view, flavor)?);
        }
        Ok(Self { flavor, entries })
    }
}

impl Writable for StringTable {
    fn buffer_size(&self) -> usize {
        CountWidth::U16.size() + self.entries.iter().map(PascalString::size).sum::<usize>()
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        CountWidth::U16.write(view, self.entries.len(), "strings")?;
        for entry in &self.entries {
            entry.write(view)?;
        }
        Ok(())
    }
}

// ==================== Functions ====================

/// Function table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionDefinition {
    /// Function name
    pub name: Name,
    /// Number of arguments
    pub arg_count: u8,
    /// Absolute byte offset of the function's subroutine
    pub offset: u32,
}

impl FunctionDefinition {
    /// Create a function entry
    pub fn new(name: &str, arg_count: u8, offset: u32) -> Result<Self> {
        Ok(Self {
            name: Name::new(name)?,
            arg_count,
            offset,
        })
    }
}

impl Readable for FunctionDefinition {
    fn buffer_read(view: &mut BinaryView) -> Result<Self> {
        let name = Name(PascalString::read(view, Name::FLAVOR)?);
        let arg_count = view.read()?;
        let offset = view.read()?;
        Ok(Self {
            name,
            arg_count,
            offset,
        })
    }
}

impl Writable for FunctionDefinition {
    fn buffer_size(&self) -> usize {
        self.name.0.size() + 1 + 4
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        self.name.0.write(view)?;
        view.write(self.arg_count)?;
        view.write(self.offset)
    }
}

/// Function table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunctionTable {
    /// Entries in wire order
    pub entries: Vec<FunctionDefinition>,
}

impl FunctionTable {
    /// Index of the first function with this name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|f| f.name.0.as_bytes() == name.as_bytes())
    }
}

impl Readable for FunctionTable {
    fn buffer_read(view: &mut BinaryView) -> Result<Self> {
        let count = CountWidth::U16.read(view)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(view.read_struct()?);
        }
        Ok(Self { entries })
    }
}

impl Writable for FunctionTable {
    fn buffer_size(&self) -> usize {
        CountWidth::U16.size()
            + self
                .entries
                .iter()
                .map(Writable::buffer_size)
                .sum::<usize>()
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        CountWidth::U16.write(view, self.entries.len(), "functions")?;
        for entry in &self.entries {
            view.write_struct(entry)?;
        }
        Ok(())
    }
}

// ==================== Classes ====================

/// Method of a class: a symbol naming it and the subroutine implementing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassMethod {
    /// Method name in the symbol table
    pub symbol: SymbolIndex,
    /// Absolute byte offset of the method's subroutine
    pub offset: u32,
}

/// Class table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassDefinition {
    /// Class name
    pub name: Name,
    /// Property names in the symbol table
    pub properties: Vec<SymbolIndex>,
    /// Methods
    pub methods: Vec<ClassMethod>,
}

impl ClassDefinition {
    /// Create a class without members
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: Name::new(name)?,
            properties: Vec::new(),
            methods: Vec::new(),
        })
    }

    fn structure_size(&self, width: CountWidth) -> usize {
        2 * width.size() + self.properties.len() * 2 + self.methods.len() * 6
    }

    fn read_structure(view: &mut BinaryView, width: CountWidth) -> Result<(Vec<SymbolIndex>, Vec<ClassMethod>)> {
        let property_count = width.read(view)?;
        let mut properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            properties.push(SymbolIndex(view.read()?));
        }

        let method_count = width.read(view)?;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let symbol = SymbolIndex(view.read()?);
            let offset = view.read()?;
            methods.push(ClassMethod { symbol, offset });
        }
        Ok((properties, methods))
    }

    fn write_structure(&self, view: &mut BinaryView, width: CountWidth) -> Result<()> {
        width.write(view, self.properties.len(), "properties")?;
        for property in &self.properties {
            view.write(property.0)?;
        }
        width.write(view, self.methods.len(), "methods")?;
        for method in &self.methods {
            view.write(method.symbol.0)?;
            view.write(method.offset)?;
        }
        Ok(())
    }
}

/// Class table
///
/// On the wire all class structures come first, then all class names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassTable {
    count_width: CountWidth,
    /// Entries in wire order
    pub entries: Vec<ClassDefinition>,
}

impl ClassTable {
    /// Create an empty table whose member counts use `count_width`
    pub fn new(count_width: CountWidth) -> Self {
        Self {
            count_width,
            entries: Vec::new(),
        }
    }

    /// Width of the property and method counts
    #[inline]
    pub fn count_width(&self) -> CountWidth {
        self.count_width
    }

    /// Index of the only class with this name
    ///
    /// Fails if the name is defined more than once.
    pub fn unique_position(&self, name: &[u8]) -> Result<Option<usize>> {
        let mut matches = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, class)| class.name.0.as_bytes() == name)
            .map(|(index, _)| index);
        let first = matches.next();
        if let (Some(first), Some(second)) = (first, matches.next()) {
            return Err(OsiError::invalid(format!(
                "class name {} is ambiguous (entries {first} and {second})",
                String::from_utf8_lossy(name)
            )));
        }
        Ok(first)
    }

    /// Decode structures then names
    pub fn buffer_read(view: &mut BinaryView, count_width: CountWidth) -> Result<Self> {
        let count = CountWidth::U16.read(view)?;
        let mut structures = Vec::with_capacity(count);
        for _ in 0..count {
            structures.push(ClassDefinition::read_structure(view, count_width)?);
        }

        let mut entries = Vec::with_capacity(count);
        for (properties, methods) in structures {
            let name = Name(PascalString::read(view, Name::FLAVOR)?);
            entries.push(ClassDefinition {
                name,
                properties,
                methods,
            });
        }
        Ok(Self {
            count_width,
            entries,
        })
    }
}

impl Writable for ClassTable {
    fn buffer_size(&self) -> usize {
        CountWidth::U16.size()
            + self
                .entries
                .iter()
                .map(|class| class.structure_size(self.count_width) + class.name.0.size())
                .sum::<usize>()
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        CountWidth::U16.write(view, self.entries.len(), "classes")?;
        for class in &self.entries {
            class.write_structure(view, self.count_width)?;
        }
        for class in &self.entries {
            class.name.0.write(view)?;
        }
        Ok(())
    }
}
