//! Instruction operands
//!
//! Typed wrappers for the table indices and target IDs that instructions
//! carry. [`Operand`] ties each wrapper to its declared [`PrimitiveType`] so
//! the generic argument accessors can check types; [`WireOperand`] adds the
//! binary encoding for operands of concrete instructions.

use serde::{Deserialize, Serialize};

use crate::error::{OsiError, Result};
use crate::primitive::{PascalString, PrimitiveType, StringFlavor, Value};
use crate::view::BinaryView;

/// Bit marking a variable reference as a global-table index
pub const GLOBAL_FLAG: u16 = 0x8000;

/// Largest index addressable through a global variable reference
pub const MAX_GLOBAL_INDEX: u16 = GLOBAL_FLAG - 1;

/// Typed instruction argument
pub trait Operand: Sized {
    /// Declared argument type
    const TYPE: PrimitiveType;

    /// Convert to the generic value representation
    fn to_value(&self) -> Value;

    /// Convert from the generic value representation, `None` on type mismatch
    fn from_value(value: &Value) -> Option<Self>;
}

/// Operand with a fixed-width wire encoding
pub trait WireOperand: Operand {
    /// Encoded width in bytes
    const SIZE: usize;

    /// Decode at the view's cursor
    fn read(view: &mut BinaryView) -> Result<Self>;

    /// Encode at the view's cursor
    fn write(&self, view: &mut BinaryView) -> Result<()>;
}

macro_rules! scalar_operand {
    ($($ty:ty => $variant:ident, $prim:ident;)*) => {
        $(
            impl Operand for $ty {
                const TYPE: PrimitiveType = PrimitiveType::$prim;

                #[inline]
                fn to_value(&self) -> Value {
                    Value::$variant(*self)
                }

                #[inline]
                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => Some(*v),
                        _ => None,
                    }
                }
            }

            impl WireOperand for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read(view: &mut BinaryView) -> Result<Self> {
                    view.read()
                }

                #[inline]
                fn write(&self, view: &mut BinaryView) -> Result<()> {
                    view.write(*self)
                }
            }
        )*
    };
}

scalar_operand! {
    i8 => I8, Int8;
    u8 => U8, UInt8;
    i16 => I16, Int16;
    u16 => U16, UInt16;
    i32 => I32, Int32;
    u32 => U32, UInt32;
    f32 => F32, Float32;
}

macro_rules! index_operand {
    ($($(#[$doc:meta])* $name:ident($inner:ty);)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[repr(transparent)]
            pub struct $name(pub $inner);

            impl $name {
                /// Wrap a raw value
                #[inline]
                pub const fn new(raw: $inner) -> Self {
                    Self(raw)
                }

                /// Raw value
                #[inline]
                pub const fn raw(self) -> $inner {
                    self.0
                }
            }

            impl From<$inner> for $name {
                fn from(raw: $inner) -> Self {
                    Self(raw)
                }
            }

            impl Operand for $name {
                const TYPE: PrimitiveType = <$inner as Operand>::TYPE;

                #[inline]
                fn to_value(&self) -> Value {
                    self.0.to_value()
                }

                #[inline]
                fn from_value(value: &Value) -> Option<Self> {
                    <$inner>::from_value(value).map(Self)
                }
            }

            impl WireOperand for $name {
                const SIZE: usize = <$inner as WireOperand>::SIZE;

                #[inline]
                fn read(view: &mut BinaryView) -> Result<Self> {
                    <$inner>::read(view).map(Self)
                }

                #[inline]
                fn write(&self, view: &mut BinaryView) -> Result<()> {
                    self.0.write(view)
                }
            }
        )*
    };
}

index_operand! {
    /// Index into the string table
    StringIndex(u16);
    /// Index into the symbol table
    SymbolIndex(u16);
    /// Index into the class table
    ClassIndex(u16);
    /// Index into the function table
    FunctionIndex(u16);
    /// Identifier of a jump or branch target marker
    TargetId(u32);
}

/// Variable reference: a local slot, or a global-table index when bit 15 is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VariableRef(pub u16);

impl VariableRef {
    /// Reference to a local variable slot
    pub fn local(slot: u16) -> Result<Self> {
        if slot & GLOBAL_FLAG != 0 {
            return Err(OsiError::range(format!(
                "local slot {slot} collides with the global flag"
            )));
        }
        Ok(Self(slot))
    }

    /// Reference to a global-table entry
    pub fn global(index: usize) -> Result<Self> {
        if index > usize::from(MAX_GLOBAL_INDEX) {
            return Err(OsiError::range(format!(
                "global index {index} exceeds {MAX_GLOBAL_INDEX}"
            )));
        }
        Ok(Self(GLOBAL_FLAG | index as u16))
    }

    /// Check if this refers to the global table
    #[inline]
    pub const fn is_global(self) -> bool {
        self.0 & GLOBAL_FLAG != 0
    }

    /// Global-table index, if this is a global reference
    #[inline]
    pub const fn global_index(self) -> Option<u16> {
        if self.is_global() {
            Some(self.0 & !GLOBAL_FLAG)
        } else {
            None
        }
    }

    /// Raw encoded value
    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl Operand for VariableRef {
    const TYPE: PrimitiveType = PrimitiveType::UInt16;

    fn to_value(&self) -> Value {
        Value::U16(self.0)
    }

    fn from_value(value: &Value) -> Option<Self> {
        u16::from_value(value).map(Self)
    }
}

impl WireOperand for VariableRef {
    const SIZE: usize = 2;

    fn read(view: &mut BinaryView) -> Result<Self> {
        view.read().map(Self)
    }

    fn write(&self, view: &mut BinaryView) -> Result<()> {
        view.write(self.0)
    }
}

/// String literal inlined from the string table (P16Z)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Literal(pub(crate) PascalString);

/// Name inlined from the symbol, global or class table (P8Z)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Name(pub(crate) PascalString);

impl Literal {
    /// Encoding used by the string table
    pub const FLAVOR: StringFlavor = StringFlavor::P16Z;

    /// Build from text
    pub fn new(text: &str) -> Result<Self> {
        PascalString::new(text.as_bytes(), Self::FLAVOR).map(Self)
    }

    /// Underlying string, always in [`Self::FLAVOR`]
    pub fn as_pascal(&self) -> &PascalString {
        &self.0
    }
}

impl Name {
    /// Encoding used by the name tables
    pub const FLAVOR: StringFlavor = StringFlavor::P8Z;

    /// Build from text
    pub fn new(text: &str) -> Result<Self> {
        PascalString::new(text.as_bytes(), Self::FLAVOR).map(Self)
    }

    /// Underlying string, always in [`Self::FLAVOR`]
    pub fn as_pascal(&self) -> &PascalString {
        &self.0
    }
}

macro_rules! string_operand {
    ($($name:ident),*) => {
        $(
            impl Operand for $name {
                const TYPE: PrimitiveType = PrimitiveType::Str($name::FLAVOR);

                fn to_value(&self) -> Value {
                    Value::Str(self.0.clone())
                }

                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::Str(s) if s.flavor() == $name::FLAVOR => Some(Self(s.clone())),
                        _ => None,
                    }
                }
            }
        )*
    };
}

string_operand!(Literal, Name);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::Endian;

    #[test]
    fn test_variable_ref_flag() {
        let global = VariableRef::global(5).unwrap();
        assert_eq!(global.raw(), 0x8005);
        assert_eq!(global.global_index(), Some(5));

        let local = VariableRef::local(5).unwrap();
        assert!(!local.is_global());
        assert_eq!(local.global_index(), None);

        assert!(matches!(VariableRef::global(0x8000), Err(OsiError::Range(_))));
        assert!(matches!(VariableRef::local(0x8000), Err(OsiError::Range(_))));
    }

    #[test]
    fn test_index_operand_value_conversion() {
        let index = StringIndex::new(3);
        assert_eq!(index.to_value(), Value::U16(3));
        assert_eq!(StringIndex::from_value(&Value::U16(9)), Some(StringIndex(9)));
        assert_eq!(StringIndex::from_value(&Value::I16(9)), None);
    }

    #[test]
    fn test_name_rejects_other_flavors() {
        let literal = Literal::new("x").unwrap();
        assert_eq!(literal.as_pascal().flavor(), Literal::FLAVOR);
        assert!(Name::from_value(&literal.to_value()).is_none());
        assert!(Literal::from_value(&literal.to_value()).is_some());

        let name = Name::new("main").unwrap();
        assert_eq!(name.as_pascal().flavor(), StringFlavor::P8Z);
        assert_eq!(name.as_pascal().as_bytes(), b"main");
    }

    #[test]
    fn test_wire_operand_encoding() {
        let mut view = BinaryView::new(6, Endian::Big);
        TargetId(0x0102_0304).write(&mut view).unwrap();
        SymbolIndex(0x0506).write(&mut view).unwrap();
        assert_eq!(view.to_hex(), "010203040506");

        view.set_offset(0).unwrap();
        assert_eq!(TargetId::read(&mut view).unwrap(), TargetId(0x0102_0304));
        assert_eq!(SymbolIndex::read(&mut view).unwrap(), SymbolIndex(0x0506));
    }
}
