//! Bounds-checked, endianness-aware views over a shared byte buffer
//!
//! Every byte the crate reads or writes goes through a [`BinaryView`]. A view
//! is a window `[start, start + length)` into a buffer plus a cursor. Sub-views
//! share the parent's storage, so writes through one are visible through the
//! other.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{OsiError, Result};

/// Byte order used to decode multi-byte values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

impl Endian {
    /// The opposite byte order
    #[inline]
    pub const fn inverted(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }
}

/// Fixed-width numeric type that can be stored in a view
pub trait Scalar: Copy {
    /// Width in bytes
    const SIZE: usize;

    /// Decode from exactly `SIZE` bytes
    fn decode(bytes: &[u8], endian: Endian) -> Self;

    /// Encode into exactly `SIZE` bytes
    fn encode(self, endian: Endian, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn decode(bytes: &[u8], endian: Endian) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    match endian {
                        Endian::Little => <$ty>::from_le_bytes(raw),
                        Endian::Big => <$ty>::from_be_bytes(raw),
                    }
                }

                #[inline]
                fn encode(self, endian: Endian, out: &mut [u8]) {
                    let raw = match endian {
                        Endian::Little => self.to_le_bytes(),
                        Endian::Big => self.to_be_bytes(),
                    };
                    out[..Self::SIZE].copy_from_slice(&raw);
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// A structure that can decode itself from the front of a view
///
/// The view handed to `buffer_read` starts at the structure's first byte; the
/// cursor position it is left at tells the caller how many bytes were used.
pub trait Readable: Sized {
    /// Decode from `view`, advancing its cursor past the consumed bytes
    fn buffer_read(view: &mut BinaryView) -> Result<Self>;
}

/// A structure that can encode itself into a view
pub trait Writable {
    /// Number of bytes `buffer_write` will produce
    fn buffer_size(&self) -> usize;

    /// Encode into `view`, advancing its cursor past the written bytes
    fn buffer_write(&self, view: &mut BinaryView) -> Result<()>;
}

/// Cursor over a shared byte range
#[derive(Clone)]
pub struct BinaryView {
    buffer: Rc<RefCell<Box<[u8]>>>,
    start: usize,
    length: usize,
    offset: usize,
    endian: Endian,
    readonly: bool,
}

impl fmt::Debug for BinaryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryView")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("endian", &self.endian)
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl BinaryView {
    /// Create a zero-filled view owning a fresh buffer
    pub fn new(length: usize, endian: Endian) -> Self {
        Self::from_bytes(vec![0u8; length], endian)
    }

    /// Create a view owning a copy of `bytes`
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, endian: Endian) -> Self {
        let bytes: Box<[u8]> = bytes.into().into_boxed_slice();
        let length = bytes.len();
        Self {
            buffer: Rc::new(RefCell::new(bytes)),
            start: 0,
            length,
            offset: 0,
            endian,
            readonly: false,
        }
    }

    /// Create a view from hexadecimal text; ASCII whitespace is ignored
    pub fn from_hex(hex: &str, endian: Endian) -> Result<Self> {
        let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
        if digits.len() % 2 != 0 {
            return Err(OsiError::value(format!(
                "hex text has an odd number of digits ({})",
                digits.len()
            )));
        }

        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let high = hex_digit(pair[0])?;
            let low = hex_digit(pair[1])?;
            bytes.push((high << 4) | low);
        }
        Ok(Self::from_bytes(bytes, endian))
    }

    /// Length of the view in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Check if the view covers no bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current cursor position
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes between the cursor and the end of the view
    #[inline]
    pub fn remaining(&self) -> usize {
        self.length - self.offset
    }

    /// Move the cursor to an absolute position
    pub fn set_offset(&mut self, offset: usize) -> Result<()> {
        if offset > self.length {
            return Err(OsiError::range(format!(
                "offset {offset} is past the end of a {}-byte view",
                self.length
            )));
        }
        self.offset = offset;
        Ok(())
    }

    /// Advance the cursor without reading
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.check_range(self.offset, count, "skip")?;
        self.offset += count;
        Ok(())
    }

    /// Byte order used by the untagged accessors
    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Change the byte order used by the untagged accessors
    #[inline]
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Check if mutation is forbidden
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Forbid mutation through this view; there is no way back
    #[inline]
    pub fn make_readonly(&mut self) {
        self.readonly = true;
    }

    /// Check if both views are windows into the same buffer
    pub fn shares_buffer(&self, other: &BinaryView) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Copy the viewed bytes out
    pub fn to_vec(&self) -> Vec<u8> {
        let buffer = self.buffer.borrow();
        buffer[self.start..self.start + self.length].to_vec()
    }

    /// Lowercase hexadecimal rendering of the viewed bytes
    pub fn to_hex(&self) -> String {
        use fmt::Write;

        let mut out = String::with_capacity(self.length * 2);
        for byte in self.to_vec() {
            // Writing into a String cannot fail
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Index of the first byte that differs from `other`
    ///
    /// Returns the shorter length if one view is a prefix of the other, and
    /// `None` if both have the same length and content.
    pub fn first_difference(&self, other: &BinaryView) -> Option<usize> {
        let ours = self.to_vec();
        let theirs = other.to_vec();
        if let Some(index) = ours.iter().zip(theirs.iter()).position(|(a, b)| a != b) {
            return Some(index);
        }
        if ours.len() == theirs.len() {
            None
        } else {
            Some(ours.len().min(theirs.len()))
        }
    }

    fn check_range(&self, at: usize, size: usize, what: &str) -> Result<()> {
        match at.checked_add(size) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(OsiError::range(format!(
                "{what} of {size} bytes at offset {at} exceeds view length {}",
                self.length
            ))),
        }
    }

    fn check_writable(&self, what: &str) -> Result<()> {
        if self.readonly {
            return Err(OsiError::ReadOnly(format!("{what} on a read-only view")));
        }
        Ok(())
    }

    // ==================== Scalars ====================

    /// Read a scalar at an absolute position without moving the cursor
    #[inline]
    pub fn get<T: Scalar>(&self, at: usize) -> Result<T> {
        self.get_with(at, self.endian)
    }

    /// Read a scalar at an absolute position with an explicit byte order
    pub fn get_with<T: Scalar>(&self, at: usize, endian: Endian) -> Result<T> {
        self.check_range(at, T::SIZE, "read")?;
        let begin = self.start + at;
        let buffer = self.buffer.borrow();
        Ok(T::decode(&buffer[begin..begin + T::SIZE], endian))
    }

    /// Write a scalar at an absolute position without moving the cursor
    #[inline]
    pub fn set<T: Scalar>(&mut self, at: usize, value: T) -> Result<()> {
        self.set_with(at, value, self.endian)
    }

    /// Write a scalar at an absolute position with an explicit byte order
    pub fn set_with<T: Scalar>(&mut self, at: usize, value: T, endian: Endian) -> Result<()> {
        self.check_writable("write")?;
        self.check_range(at, T::SIZE, "write")?;
        let begin = self.start + at;
        let mut buffer = self.buffer.borrow_mut();
        value.encode(endian, &mut buffer[begin..begin + T::SIZE]);
        Ok(())
    }

    /// Read a scalar at the cursor without advancing
    #[inline]
    pub fn peek<T: Scalar>(&self) -> Result<T> {
        self.get_with(self.offset, self.endian)
    }

    /// Write a scalar at the cursor without advancing
    #[inline]
    pub fn poke<T: Scalar>(&mut self, value: T) -> Result<()> {
        self.set_with(self.offset, value, self.endian)
    }

    /// Read a scalar at the cursor and advance past it
    #[inline]
    pub fn read<T: Scalar>(&mut self) -> Result<T> {
        self.read_with(self.endian)
    }

    /// Read a scalar at the cursor with an explicit byte order and advance
    pub fn read_with<T: Scalar>(&mut self, endian: Endian) -> Result<T> {
        let value = self.get_with(self.offset, endian)?;
        self.offset += T::SIZE;
        Ok(value)
    }

    /// Write a scalar at the cursor and advance past it
    #[inline]
    pub fn write<T: Scalar>(&mut self, value: T) -> Result<()> {
        self.write_with(value, self.endian)
    }

    /// Write a scalar at the cursor with an explicit byte order and advance
    pub fn write_with<T: Scalar>(&mut self, value: T, endian: Endian) -> Result<()> {
        self.set_with(self.offset, value, endian)?;
        self.offset += T::SIZE;
        Ok(())
    }

    // ==================== Raw bytes ====================

    /// Copy `len` bytes starting at an absolute position
    pub fn get_bytes(&self, at: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(at, len, "read")?;
        let begin = self.start + at;
        let buffer = self.buffer.borrow();
        Ok(buffer[begin..begin + len].to_vec())
    }

    /// Copy `len` bytes at the cursor and advance past them
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let bytes = self.get_bytes(self.offset, len)?;
        self.offset += len;
        Ok(bytes)
    }

    /// Overwrite bytes starting at an absolute position
    pub fn set_bytes(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        self.check_writable("write")?;
        self.check_range(at, bytes.len(), "write")?;
        let begin = self.start + at;
        let mut buffer = self.buffer.borrow_mut();
        buffer[begin..begin + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Overwrite bytes at the cursor and advance past them
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_bytes(self.offset, bytes)?;
        self.offset += bytes.len();
        Ok(())
    }

    // ==================== Sub-views ====================

    /// Borrow a window of this view without moving the cursor
    ///
    /// The sub-view inherits byte order and read-only state; `readonly` can
    /// only make it stricter.
    pub fn get_view(&self, at: usize, len: usize, readonly: bool) -> Result<BinaryView> {
        self.check_range(at, len, "sub-view")?;
        Ok(BinaryView {
            buffer: Rc::clone(&self.buffer),
            start: self.start + at,
            length: len,
            offset: 0,
            endian: self.endian,
            readonly: self.readonly || readonly,
        })
    }

    /// Borrow a window at the cursor and advance past it
    pub fn read_view(&mut self, len: usize, readonly: bool) -> Result<BinaryView> {
        let view = self.get_view(self.offset, len, readonly)?;
        self.offset += len;
        Ok(view)
    }

    /// Copy the whole content of `source` to an absolute position
    ///
    /// `source` may overlap this view.
    pub fn set_view(&mut self, at: usize, source: &BinaryView) -> Result<()> {
        let bytes = source.to_vec();
        self.set_bytes(at, &bytes)
    }

    /// Copy the whole content of `source` at the cursor and advance past it
    pub fn write_view(&mut self, source: &BinaryView) -> Result<()> {
        let bytes = source.to_vec();
        self.write_bytes(&bytes)
    }

    // ==================== Structures ====================

    /// Hand the remaining bytes to `T` and advance by what it consumed
    pub fn read_struct<T: Readable>(&mut self) -> Result<T> {
        let mut sub = self.get_view(self.offset, self.remaining(), false)?;
        let value = T::buffer_read(&mut sub)?;
        self.offset += sub.offset();
        Ok(value)
    }

    /// Hand a window of the remaining bytes to `value` and advance by what it wrote
    pub fn write_struct<T: Writable + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.check_writable("structure write")?;
        let size = value.buffer_size();
        self.check_range(self.offset, size, "structure write")?;

        let mut sub = self.get_view(self.offset, self.remaining(), false)?;
        value.buffer_write(&mut sub)?;
        if sub.offset() != size {
            return Err(OsiError::internal(format!(
                "structure announced {size} bytes but wrote {}",
                sub.offset()
            )));
        }
        self.offset += size;
        Ok(())
    }
}

fn hex_digit(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(OsiError::value(format!(
            "invalid hex digit {:?}",
            char::from(digit)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end_of_empty_view() {
        let mut view = BinaryView::new(0, Endian::Little);
        assert!(matches!(view.read::<u8>(), Err(OsiError::Range(_))));
        assert_eq!(view.offset(), 0);
    }

    #[test]
    fn test_write_to_readonly_view() {
        let mut view = BinaryView::new(4, Endian::Little);
        view.make_readonly();
        assert!(matches!(view.write::<u16>(7), Err(OsiError::ReadOnly(_))));
        assert!(matches!(view.set_bytes(0, &[1]), Err(OsiError::ReadOnly(_))));
    }

    #[test]
    fn test_scalar_byte_orders() {
        let mut view = BinaryView::new(8, Endian::Little);
        view.write::<u32>(0x1122_3344).unwrap();
        view.write_with::<u32>(0x1122_3344, Endian::Big).unwrap();
        assert_eq!(view.to_hex(), "4433221111223344");
        assert_eq!(view.get::<u32>(0).unwrap(), 0x1122_3344);
        assert_eq!(view.get_with::<u32>(4, Endian::Big).unwrap(), 0x1122_3344);
        assert_eq!(view.get_with::<u32>(0, Endian::Big).unwrap(), 0x4433_2211);
    }

    #[test]
    fn test_peek_and_poke_keep_cursor() {
        let mut view = BinaryView::from_hex("0102 0304", Endian::Big).unwrap();
        view.set_offset(2).unwrap();
        assert_eq!(view.peek::<u16>().unwrap(), 0x0304);
        view.poke::<u16>(0xBEEF).unwrap();
        assert_eq!(view.offset(), 2);
        assert_eq!(view.read::<u16>().unwrap(), 0xBEEF);
        assert!(matches!(view.peek::<u8>(), Err(OsiError::Range(_))));
    }

    #[test]
    fn test_signed_and_float_scalars() {
        let mut view = BinaryView::new(14, Endian::Big);
        view.write::<i16>(-2).unwrap();
        view.write::<f32>(1.5).unwrap();
        view.write::<f64>(-0.25).unwrap();
        view.set_offset(0).unwrap();
        assert_eq!(view.read::<i16>().unwrap(), -2);
        assert_eq!(view.read::<f32>().unwrap(), 1.5);
        assert_eq!(view.read::<f64>().unwrap(), -0.25);
        assert_eq!(view.remaining(), 0);
    }

    #[test]
    fn test_sub_view_shares_storage() {
        let mut parent = BinaryView::new(6, Endian::Little);
        let mut child = parent.get_view(2, 2, false).unwrap();
        child.write::<u16>(0xBEEF).unwrap();
        assert_eq!(parent.get::<u16>(2).unwrap(), 0xBEEF);
        assert!(parent.shares_buffer(&child));

        parent.set::<u8>(3, 0x00).unwrap();
        assert_eq!(child.get::<u16>(0).unwrap(), 0x00EF);
    }

    #[test]
    fn test_sub_view_readonly_is_inherited() {
        let mut parent = BinaryView::new(4, Endian::Little);
        let strict = parent.get_view(0, 2, true).unwrap();
        assert!(strict.is_readonly());

        parent.make_readonly();
        let inherited = parent.get_view(0, 2, false).unwrap();
        assert!(inherited.is_readonly());
    }

    #[test]
    fn test_sub_view_out_of_bounds() {
        let view = BinaryView::new(4, Endian::Little);
        assert!(matches!(view.get_view(3, 2, false), Err(OsiError::Range(_))));
        assert!(matches!(view.get_view(usize::MAX, 2, false), Err(OsiError::Range(_))));
    }

    #[test]
    fn test_overlapping_view_copy() {
        let mut view = BinaryView::from_bytes(vec![1, 2, 3, 4, 5, 0], Endian::Little);
        let source = view.get_view(0, 5, false).unwrap();
        view.set_view(1, &source).unwrap();
        assert_eq!(view.to_vec(), vec![1, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_hex_roundtrip() {
        let view = BinaryView::from_hex("00 ff 7A\n10", Endian::Little).unwrap();
        assert_eq!(view.to_vec(), vec![0x00, 0xFF, 0x7A, 0x10]);
        assert_eq!(view.to_hex(), "00ff7a10");

        assert!(matches!(
            BinaryView::from_hex("abc", Endian::Little),
            Err(OsiError::Value(_))
        ));
        assert!(matches!(
            BinaryView::from_hex("zz", Endian::Little),
            Err(OsiError::Value(_))
        ));
    }

    #[test]
    fn test_first_difference() {
        let a = BinaryView::from_bytes(vec![1, 2, 3], Endian::Little);
        let b = BinaryView::from_bytes(vec![1, 9, 3], Endian::Little);
        let c = BinaryView::from_bytes(vec![1, 2], Endian::Little);
        let d = BinaryView::from_bytes(vec![1, 2, 3], Endian::Big);

        assert_eq!(a.first_difference(&b), Some(1));
        assert_eq!(a.first_difference(&c), Some(2));
        assert_eq!(c.first_difference(&a), Some(2));
        assert_eq!(a.first_difference(&d), None);
    }

    struct Pair(u8, u16);

    impl Readable for Pair {
        fn buffer_read(view: &mut BinaryView) -> Result<Self> {
            Ok(Pair(view.read()?, view.read()?))
        }
    }

    impl Writable for Pair {
        fn buffer_size(&self) -> usize {
            3
        }

        fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
            view.write(self.0)?;
            view.write(self.1)
        }
    }

    #[test]
    fn test_struct_hand_off() {
        let mut view = BinaryView::new(7, Endian::Little);
        view.write::<u8>(0xAA).unwrap();
        view.write_struct(&Pair(1, 0x0302)).unwrap();
        view.write_struct(&Pair(4, 0x0605)).unwrap();
        assert_eq!(view.offset(), 7);
        assert_eq!(view.to_hex(), "aa010203040506");

        view.set_offset(1).unwrap();
        let first: Pair = view.read_struct().unwrap();
        let second: Pair = view.read_struct().unwrap();
        assert_eq!((first.0, first.1), (1, 0x0302));
        assert_eq!((second.0, second.1), (4, 0x0605));
        assert_eq!(view.remaining(), 0);

        assert!(matches!(
            view.write_struct(&Pair(0, 0)),
            Err(OsiError::Range(_))
        ));
    }
}
