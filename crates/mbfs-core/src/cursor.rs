//! Sequential reader and writer over byte buffers.
//!
//! Scalars are fixed-width integers in a configurable byte order. Variable
//! length fields carry a `u16` length prefix; one prefix value is reserved as
//! the "absent" sentinel so that a missing field stays distinguishable from an
//! empty one.

use thiserror::Error;

/// Byte order used for every fixed-width scalar in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Size and sentinel conventions shared by [`DataReader`] and [`DataWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorConfig {
    /// Byte order for integers and length prefixes.
    pub byte_order: ByteOrder,
    /// Length-prefix value that marks a field as absent.
    pub absent_sentinel: u16,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Big,
            absent_sentinel: 0xFFFF,
        }
    }
}

/// Errors produced while reading or writing a buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// The buffer ended before the requested field did.
    #[error("unexpected end of data at offset {offset}: needed {needed} bytes, {available} available")]
    EndOfData {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A field is too long to be described by a length prefix.
    #[error("field of {len} bytes exceeds the maximum prefixed length of {max}")]
    FieldTooLong { len: usize, max: usize },

    /// A string field did not hold valid UTF-8.
    #[error("invalid UTF-8 in string field at offset {offset}")]
    InvalidUtf8 { offset: usize },
}

macro_rules! read_int {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Read a `", stringify!($ty), "` in the configured byte order.")]
        pub fn $name(&mut self) -> Result<$ty, CursorError> {
            let bytes = self.take_array::<{ size_of::<$ty>() }>()?;
            Ok(match self.config.byte_order {
                ByteOrder::Big => <$ty>::from_be_bytes(bytes),
                ByteOrder::Little => <$ty>::from_le_bytes(bytes),
            })
        }
    };
}

macro_rules! write_int {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Write a `", stringify!($ty), "` in the configured byte order.")]
        pub fn $name(&mut self, value: $ty) {
            match self.config.byte_order {
                ByteOrder::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
                ByteOrder::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
            }
        }
    };
}

/// Forward-only reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct DataReader<'a> {
    data: &'a [u8],
    pos: usize,
    config: CursorConfig,
}

impl<'a> DataReader<'a> {
    pub fn new(data: &'a [u8], config: CursorConfig) -> Self {
        Self {
            data,
            pos: 0,
            config,
        }
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_bytes_available(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Take exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CursorError> {
        if len > self.remaining() {
            return Err(CursorError::EndOfData {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.take_array::<1>()?[0])
    }

    read_int!(read_u16, u16);
    read_int!(read_u32, u32);
    read_int!(read_u64, u64);

    /// Read a length-prefixed byte field. Returns `None` for the absent sentinel.
    pub fn read_bytes(&mut self) -> Result<Option<&'a [u8]>, CursorError> {
        let len = self.read_u16()?;
        if len == self.config.absent_sentinel {
            return Ok(None);
        }
        self.read_raw(usize::from(len)).map(Some)
    }

    /// Read a length-prefixed UTF-8 string. Returns `None` for the absent sentinel.
    pub fn read_string(&mut self) -> Result<Option<&'a str>, CursorError> {
        let offset = self.pos;
        match self.read_bytes()? {
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CursorError::InvalidUtf8 { offset }),
            None => Ok(None),
        }
    }
}

/// Append-only writer producing an owned buffer.
#[derive(Debug, Clone, Default)]
pub struct DataWriter {
    buf: Vec<u8>,
    config: CursorConfig,
}

impl DataWriter {
    pub fn new(config: CursorConfig) -> Self {
        Self {
            buf: Vec::new(),
            config,
        }
    }

    pub fn with_capacity(capacity: usize, config: CursorConfig) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    write_int!(write_u16, u16);
    write_int!(write_u32, u32);
    write_int!(write_u64, u64);

    /// Write a length-prefixed byte field, or the absent sentinel for `None`.
    ///
    /// Lengths equal to or above the sentinel cannot be represented.
    pub fn write_bytes(&mut self, bytes: Option<&[u8]>) -> Result<(), CursorError> {
        let Some(bytes) = bytes else {
            self.write_u16(self.config.absent_sentinel);
            return Ok(());
        };
        let max = usize::from(self.config.absent_sentinel).saturating_sub(1);
        let len = u16::try_from(bytes.len())
            .ok()
            .filter(|len| *len != self.config.absent_sentinel)
            .ok_or(CursorError::FieldTooLong {
                len: bytes.len(),
                max,
            })?;
        self.write_u16(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_string(&mut self, value: Option<&str>) -> Result<(), CursorError> {
        self.write_bytes(value.map(str::as_bytes))
    }
}
