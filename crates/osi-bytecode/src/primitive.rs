//! Typed primitive values
//!
//! Fixed-width integers, floats and length-prefixed ("pascal") strings. Every
//! value is range-checked when it is built, knows its encoded size, and can be
//! parsed from or rendered to assembly-style text.

use std::fmt;
use std::num::IntErrorKind;

use serde::{Deserialize, Serialize};

use crate::error::{OsiError, Result};
use crate::view::BinaryView;

/// Width of a pascal string's length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LengthPrefix {
    /// One byte, at most 255 content bytes
    U8,
    /// Two bytes
    U16,
    /// Four bytes
    U32,
}

impl LengthPrefix {
    /// Prefix width in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Longest content the prefix can describe
    #[inline]
    pub const fn max_len(self) -> usize {
        match self {
            Self::U8 => u8::MAX as usize,
            Self::U16 => u16::MAX as usize,
            Self::U32 => u32::MAX as usize,
        }
    }
}

/// Encoding variant of a pascal string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringFlavor {
    /// Length prefix width
    pub prefix: LengthPrefix,
    /// Whether a single NUL byte follows the content
    pub terminated: bool,
}

impl StringFlavor {
    /// 1-byte prefix
    pub const P8: Self = Self::new(LengthPrefix::U8, false);
    /// 1-byte prefix, NUL terminated
    pub const P8Z: Self = Self::new(LengthPrefix::U8, true);
    /// 2-byte prefix
    pub const P16: Self = Self::new(LengthPrefix::U16, false);
    /// 2-byte prefix, NUL terminated
    pub const P16Z: Self = Self::new(LengthPrefix::U16, true);
    /// 4-byte prefix
    pub const P32: Self = Self::new(LengthPrefix::U32, false);
    /// 4-byte prefix, NUL terminated
    pub const P32Z: Self = Self::new(LengthPrefix::U32, true);

    /// Create a flavor
    pub const fn new(prefix: LengthPrefix, terminated: bool) -> Self {
        Self { prefix, terminated }
    }

    /// Short name used in diagnostics
    pub const fn name(self) -> &'static str {
        match (self.prefix, self.terminated) {
            (LengthPrefix::U8, false) => "P8",
            (LengthPrefix::U8, true) => "P8Z",
            (LengthPrefix::U16, false) => "P16",
            (LengthPrefix::U16, true) => "P16Z",
            (LengthPrefix::U32, false) => "P32",
            (LengthPrefix::U32, true) => "P32Z",
        }
    }
}

/// Declared type of an instruction argument or table cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 32-bit integer
    UInt32,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Pascal string of the given flavor
    Str(StringFlavor),
}

impl PrimitiveType {
    /// Encoded size, if it does not depend on the value
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Float64 => Some(8),
            Self::Str(_) => None,
        }
    }

    /// Type name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Str(flavor) => flavor.name(),
        }
    }

    /// Check if this is one of the integer types
    pub const fn is_integer(self) -> bool {
        self.integer_bounds().is_some()
    }

    const fn integer_bounds(self) -> Option<(i64, i64)> {
        match self {
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::UInt8 => Some((0, u8::MAX as i64)),
            Self::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::UInt16 => Some((0, u16::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::UInt32 => Some((0, u32::MAX as i64)),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Length-prefixed byte string
///
/// Content is kept as raw bytes so that files round-trip exactly whatever
/// their text encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PascalString {
    bytes: Vec<u8>,
    flavor: StringFlavor,
}

impl PascalString {
    /// Create a string, validating length and (for terminated flavors) NUL bytes
    pub fn new(bytes: impl Into<Vec<u8>>, flavor: StringFlavor) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > flavor.prefix.max_len() {
            return Err(OsiError::range(format!(
                "{}-byte string does not fit a {} length prefix",
                bytes.len(),
                flavor.name()
            )));
        }
        if flavor.terminated && bytes.contains(&0) {
            return Err(OsiError::value(format!(
                "{} string contains a NUL byte",
                flavor.name()
            )));
        }
        Ok(Self { bytes, flavor })
    }

    /// Content bytes, without prefix or terminator
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Content length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the content is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Encoding flavor
    #[inline]
    pub fn flavor(&self) -> StringFlavor {
        self.flavor
    }

    /// Encoded size: prefix, content and optional terminator
    #[inline]
    pub fn size(&self) -> usize {
        self.flavor.prefix.size() + self.bytes.len() + usize::from(self.flavor.terminated)
    }

    /// Same content re-validated under another flavor
    pub fn with_flavor(&self, flavor: StringFlavor) -> Result<Self> {
        Self::new(self.bytes.clone(), flavor)
    }

    /// Content decoded as UTF-8, replacing invalid sequences
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Decode a string of the given flavor at the view's cursor
    pub fn read(view: &mut BinaryView, flavor: StringFlavor) -> Result<Self> {
        let len = match flavor.prefix {
            LengthPrefix::U8 => usize::from(view.read::<u8>()?),
            LengthPrefix::U16 => usize::from(view.read::<u16>()?),
            LengthPrefix::U32 => view.read::<u32>()? as usize,
        };
        let bytes = view.read_bytes(len)?;
        if flavor.terminated {
            let terminator = view.read::<u8>()?;
            if terminator != 0 {
                return Err(OsiError::value(format!(
                    "{} string is missing its NUL terminator (found {terminator:#04x})",
                    flavor.name()
                )));
            }
        }
        Self::new(bytes, flavor)
    }

    /// Encode at the view's cursor
    pub fn write(&self, view: &mut BinaryView) -> Result<()> {
        match self.flavor.prefix {
            LengthPrefix::U8 => view.write(self.bytes.len() as u8)?,
            LengthPrefix::U16 => view.write(self.bytes.len() as u16)?,
            LengthPrefix::U32 => view.write(self.bytes.len() as u32)?,
        }
        view.write_bytes(&self.bytes)?;
        if self.flavor.terminated {
            view.write::<u8>(0)?;
        }
        Ok(())
    }

    /// Parse a double-quoted literal such as `"a\tb\x7f"`
    pub fn parse(text: &str, flavor: StringFlavor) -> Result<Self> {
        let inner = text
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .filter(|_| text.len() >= 2)
            .ok_or_else(|| OsiError::value(format!("string literal must be quoted: {text}")))?;

        let mut bytes = Vec::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                let mut utf8 = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                continue;
            }
            match chars.next() {
                Some('n') => bytes.push(b'\n'),
                Some('r') => bytes.push(b'\r'),
                Some('t') => bytes.push(b'\t'),
                Some('0') => bytes.push(0),
                Some('\\') => bytes.push(b'\\'),
                Some('"') => bytes.push(b'"'),
                Some('x') => {
                    let high = chars.next().and_then(|d| d.to_digit(16));
                    let low = chars.next().and_then(|d| d.to_digit(16));
                    match (high, low) {
                        (Some(high), Some(low)) => bytes.push((high * 16 + low) as u8),
                        _ => {
                            return Err(OsiError::value(format!(
                                "malformed \\x escape in {text}"
                            )));
                        }
                    }
                }
                Some(other) => {
                    return Err(OsiError::value(format!(
                        "unknown escape \\{other} in {text}"
                    )));
                }
                None => {
                    return Err(OsiError::value(format!("dangling backslash in {text}")));
                }
            }
        }
        Self::new(bytes, flavor)
    }
}

impl fmt::Display for PascalString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for &byte in &self.bytes {
            match byte {
                b'"' => f.write_str("\\\"")?,
                b'\\' => f.write_str("\\\\")?,
                b'\n' => f.write_str("\\n")?,
                b'\r' => f.write_str("\\r")?,
                b'\t' => f.write_str("\\t")?,
                0x20..=0x7E => write!(f, "{}", char::from(byte))?,
                _ => write!(f, "\\x{byte:02x}")?,
            }
        }
        f.write_str("\"")
    }
}

/// A typed primitive value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    /// Signed 8-bit integer
    I8(i8),
    /// Unsigned 8-bit integer
    U8(u8),
    /// Signed 16-bit integer
    I16(i16),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Signed 32-bit integer
    I32(i32),
    /// Unsigned 32-bit integer
    U32(u32),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Pascal string
    Str(PascalString),
}

impl Value {
    /// Type of this value
    pub fn ty(&self) -> PrimitiveType {
        match self {
            Self::I8(_) => PrimitiveType::Int8,
            Self::U8(_) => PrimitiveType::UInt8,
            Self::I16(_) => PrimitiveType::Int16,
            Self::U16(_) => PrimitiveType::UInt16,
            Self::I32(_) => PrimitiveType::Int32,
            Self::U32(_) => PrimitiveType::UInt32,
            Self::F32(_) => PrimitiveType::Float32,
            Self::F64(_) => PrimitiveType::Float64,
            Self::Str(s) => PrimitiveType::Str(s.flavor()),
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            Self::Str(s) => s.size(),
            other => other.ty().fixed_size().unwrap_or(0),
        }
    }

    /// Build an integer value of type `ty`, rejecting anything out of range
    pub fn integer(ty: PrimitiveType, value: i64) -> Result<Self> {
        let (min, max) = ty
            .integer_bounds()
            .ok_or_else(|| OsiError::value(format!("{ty} is not an integer type")))?;
        if value < min || value > max {
            return Err(OsiError::range(format!(
                "{value} is outside the {ty} range {min}..={max}"
            )));
        }
        // Bounds were checked above, the casts are exact
        Ok(match ty {
            PrimitiveType::Int8 => Self::I8(value as i8),
            PrimitiveType::UInt8 => Self::U8(value as u8),
            PrimitiveType::Int16 => Self::I16(value as i16),
            PrimitiveType::UInt16 => Self::U16(value as u16),
            PrimitiveType::Int32 => Self::I32(value as i32),
            _ => Self::U32(value as u32),
        })
    }

    /// Build a numeric value of type `ty` from a float
    ///
    /// Integer types require an integral value.
    pub fn float(ty: PrimitiveType, value: f64) -> Result<Self> {
        match ty {
            PrimitiveType::Float64 => Ok(Self::F64(value)),
            PrimitiveType::Float32 => {
                if value.is_finite() && value.abs() > f64::from(f32::MAX) {
                    return Err(OsiError::range(format!("{value} does not fit float32")));
                }
                Ok(Self::F32(value as f32))
            }
            PrimitiveType::Str(_) => Err(OsiError::value(format!("{ty} is not a numeric type"))),
            _ => {
                if !value.is_finite() || value.fract() != 0.0 {
                    return Err(OsiError::value(format!(
                        "{value} is not an integer, {ty} required"
                    )));
                }
                if value < i64::MIN as f64 || value > i64::MAX as f64 {
                    return Err(OsiError::range(format!("{value} is outside the {ty} range")));
                }
                Self::integer(ty, value as i64)
            }
        }
    }

    /// Parse assembly text as a value of type `ty`
    ///
    /// Integers accept an optional sign and a `0x` prefix; strings must be
    /// double-quoted.
    pub fn parse(ty: PrimitiveType, text: &str) -> Result<Self> {
        let text = text.trim();
        match ty {
            PrimitiveType::Str(flavor) => PascalString::parse(text, flavor).map(Self::Str),
            PrimitiveType::Float32 | PrimitiveType::Float64 => {
                let value: f64 = text
                    .parse()
                    .map_err(|_| OsiError::value(format!("malformed {ty} literal: {text}")))?;
                Self::float(ty, value)
            }
            _ => Self::parse_integer(ty, text),
        }
    }

    fn parse_integer(ty: PrimitiveType, text: &str) -> Result<Self> {
        let (negative, unsigned) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (digits, radix) = match unsigned
            .strip_prefix("0x")
            .or_else(|| unsigned.strip_prefix("0X"))
        {
            Some(hex) => (hex, 16),
            None => (unsigned, 10),
        };
        // from_str_radix takes its own sign
        if digits.starts_with(['+', '-']) {
            return Err(OsiError::value(format!("malformed {ty} literal: {text}")));
        }

        match i128::from_str_radix(digits, radix) {
            Ok(magnitude) => {
                let value = if negative { -magnitude } else { magnitude };
                let value = i64::try_from(value).map_err(|_| {
                    OsiError::range(format!("{text} is outside the {ty} range"))
                })?;
                Self::integer(ty, value)
            }
            Err(e) if matches!(e.kind(), IntErrorKind::PosOverflow | IntErrorKind::NegOverflow) => {
                Err(OsiError::range(format!("{text} is outside the {ty} range")))
            }
            Err(_) => match text.parse::<f64>() {
                Ok(value) if radix == 10 => Self::float(ty, value),
                _ => Err(OsiError::value(format!("malformed {ty} literal: {text}"))),
            },
        }
    }

    /// Integer content widened to `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(i64::from(v)),
            Self::U8(v) => Some(i64::from(v)),
            Self::I16(v) => Some(i64::from(v)),
            Self::U16(v) => Some(i64::from(v)),
            Self::I32(v) => Some(i64::from(v)),
            Self::U32(v) => Some(i64::from(v)),
            _ => None,
        }
    }

    /// String content, if this is a string
    pub fn as_str(&self) -> Option<&PascalString> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Decode a value of type `ty` at the view's cursor
    pub fn buffer_read(view: &mut BinaryView, ty: PrimitiveType) -> Result<Self> {
        Ok(match ty {
            PrimitiveType::Int8 => Self::I8(view.read()?),
            PrimitiveType::UInt8 => Self::U8(view.read()?),
            PrimitiveType::Int16 => Self::I16(view.read()?),
            PrimitiveType::UInt16 => Self::U16(view.read()?),
            PrimitiveType::Int32 => Self::I32(view.read()?),
            PrimitiveType::UInt32 => Self::U32(view.read()?),
            PrimitiveType::Float32 => Self::F32(view.read()?),
            PrimitiveType::Float64 => Self::F64(view.read()?),
            PrimitiveType::Str(flavor) => Self::Str(PascalString::read(view, flavor)?),
        })
    }

    /// Encode at the view's cursor
    pub fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        match self {
            Self::I8(v) => view.write(*v),
            Self::U8(v) => view.write(*v),
            Self::I16(v) => view.write(*v),
            Self::U16(v) => view.write(*v),
            Self::I32(v) => view.write(*v),
            Self::U32(v) => view.write(*v),
            Self::F32(v) => view.write(*v),
            Self::F64(v) => view.write(*v),
            Self::Str(s) => s.write(view),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            // Debug keeps a trailing ".0" so the text reads back as a float
            Self::F32(v) => write!(f, "{v:?}"),
            Self::F64(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}
