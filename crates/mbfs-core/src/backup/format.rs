//! Binary manifest codec.
//!
//! A manifest is a short header followed by entry records until the end of
//! the buffer:
//!
//! ```text
//! magic "mbdb" | version major u8 | version minor u8
//! record*:
//!   domain, path, link target, digest, encryption key   (prefixed fields)
//!   mode u16 | inode u64 | uid u32 | gid u32
//!   mtime u32 | atime u32 | ctime u32 | file length u64
//!   flag u8 | property count u8 | (name, value)*          (prefixed fields)
//! ```
//!
//! Property values are either tagged (one variant byte, then the payload) or
//! raw bytes, per [`PropertyEncoding`].

use tracing::{debug, instrument, trace};

use super::entry::{Entry, Properties, PropertyValue};
use super::key::EntryKey;
use super::manifest::ManifestError;
use crate::cursor::{ByteOrder, CursorConfig, CursorError, DataReader, DataWriter};

/// Magic bytes opening an MBDB manifest.
pub const MBDB_MAGIC: [u8; 4] = *b"mbdb";

/// Manifest version written by default.
pub const MBDB_VERSION: u8 = 5;

const TAG_STRING: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_BOOLEAN: u8 = 2;
const TAG_BYTES: u8 = 3;

/// On-disk layout of property values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropertyEncoding {
    /// A variant byte followed by the payload. Integers are eight bytes in the
    /// manifest's byte order and booleans a single `0`/`1` byte. Every
    /// [`PropertyValue`] reads back as the variant it was written as.
    #[default]
    Tagged,
    /// Bare bytes, as found in manifests written by other tools. Values read
    /// back as strings when they are UTF-8 and as bytes otherwise.
    Raw,
}

/// Byte-level conventions of one manifest family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestFormat {
    pub magic: [u8; 4],
    /// Major version stamped on written manifests.
    pub version: u8,
    /// Minor version stamped on written manifests.
    pub minor_version: u8,
    /// Major versions accepted when decoding.
    pub supported_versions: &'static [u8],
    pub byte_order: ByteOrder,
    pub absent_sentinel: u16,
    pub property_encoding: PropertyEncoding,
}

impl Default for ManifestFormat {
    fn default() -> Self {
        Self::mbdb()
    }
}

/// Result of decoding a manifest buffer.
#[derive(Debug, Clone)]
pub struct DecodedManifest {
    pub version: u8,
    pub minor_version: u8,
    /// Records in file order.
    pub entries: Vec<Entry>,
    /// Byte offset at which each record starts, parallel to `entries`.
    pub record_offsets: Vec<usize>,
}

fn corrupt(err: CursorError) -> ManifestError {
    let offset = match err {
        CursorError::EndOfData { offset, .. } | CursorError::InvalidUtf8 { offset } => offset,
        CursorError::FieldTooLong { .. } => 0,
    };
    ManifestError::CorruptManifest {
        offset,
        reason: err.to_string(),
    }
}

impl ManifestFormat {
    /// The MBDB v5 layout: big-endian scalars and `0xFFFF` as the absent length.
    pub const fn mbdb() -> Self {
        Self {
            magic: MBDB_MAGIC,
            version: MBDB_VERSION,
            minor_version: 0,
            supported_versions: &[MBDB_VERSION],
            byte_order: ByteOrder::Big,
            absent_sentinel: 0xFFFF,
            property_encoding: PropertyEncoding::Tagged,
        }
    }

    pub fn cursor_config(&self) -> CursorConfig {
        CursorConfig {
            byte_order: self.byte_order,
            absent_sentinel: self.absent_sentinel,
        }
    }

    /// Decode a whole manifest. Any malformed byte fails the whole buffer.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn decode(&self, data: &[u8]) -> Result<DecodedManifest, ManifestError> {
        let mut reader = DataReader::new(data, self.cursor_config());

        let magic = reader.read_raw(self.magic.len()).map_err(corrupt)?;
        if magic != self.magic {
            return Err(ManifestError::CorruptManifest {
                offset: 0,
                reason: format!("bad magic {}", hex::encode(magic)),
            });
        }
        let version = reader.read_u8().map_err(corrupt)?;
        let minor_version = reader.read_u8().map_err(corrupt)?;
        if !self.supported_versions.contains(&version) {
            return Err(ManifestError::UnsupportedVersion {
                version,
                supported: self.supported_versions.to_vec(),
            });
        }

        let mut entries = Vec::new();
        let mut record_offsets = Vec::new();
        while reader.has_bytes_available() {
            let start = reader.position();
            let entry = self.decode_record(&mut reader)?;
            trace!(offset = start, key = %entry.key(), "Decoded record");
            entries.push(entry);
            record_offsets.push(start);
        }

        debug!(version, records = entries.len(), "Decoded manifest");
        Ok(DecodedManifest {
            version,
            minor_version,
            entries,
            record_offsets,
        })
    }

    fn decode_record(&self, reader: &mut DataReader<'_>) -> Result<Entry, ManifestError> {
        let start = reader.position();
        let domain = reader.read_string().map_err(corrupt)?.unwrap_or_default();
        let path = reader.read_string().map_err(corrupt)?.unwrap_or_default();
        let key = EntryKey::new(domain, path).map_err(|e| ManifestError::CorruptManifest {
            offset: start,
            reason: e.to_string(),
        })?;
        if key.is_root() {
            return Err(ManifestError::CorruptManifest {
                offset: start,
                reason: "record without a domain".to_string(),
            });
        }

        let link_offset = reader.position();
        let link_target = reader
            .read_bytes()
            .map_err(corrupt)?
            .map(|b| {
                String::from_utf8(b.to_vec()).map_err(|_| ManifestError::CorruptManifest {
                    offset: link_offset,
                    reason: "invalid UTF-8 in link target".to_string(),
                })
            })
            .transpose()?;
        let digest = reader.read_bytes().map_err(corrupt)?.map(<[u8]>::to_vec);
        let encryption_key = reader.read_bytes().map_err(corrupt)?.map(<[u8]>::to_vec);

        let mut entry = Entry::new(key, reader.read_u16().map_err(corrupt)?);
        entry.link_target = link_target;
        entry.digest = digest;
        entry.encryption_key = encryption_key;
        entry.inode = reader.read_u64().map_err(corrupt)?;
        entry.user_id = reader.read_u32().map_err(corrupt)?;
        entry.group_id = reader.read_u32().map_err(corrupt)?;
        entry.modified_time = reader.read_u32().map_err(corrupt)?;
        entry.accessed_time = reader.read_u32().map_err(corrupt)?;
        entry.created_time = reader.read_u32().map_err(corrupt)?;
        entry.file_length = reader.read_u64().map_err(corrupt)?;
        entry.flag = reader.read_u8().map_err(corrupt)?;

        let count = reader.read_u8().map_err(corrupt)?;
        let mut properties = Properties::new();
        for _ in 0..count {
            let name_offset = reader.position();
            let name = reader
                .read_string()
                .map_err(corrupt)?
                .ok_or_else(|| ManifestError::CorruptManifest {
                    offset: name_offset,
                    reason: "absent property name".to_string(),
                })?;
            let value_offset = reader.position();
            let value = reader.read_bytes().map_err(corrupt)?.unwrap_or_default();
            let value = self.decode_property(value).map_err(|reason| {
                ManifestError::CorruptManifest {
                    offset: value_offset,
                    reason: format!("property {name}: {reason}"),
                }
            })?;
            properties.set(name, value);
        }
        entry.properties = properties;
        Ok(entry)
    }

    fn decode_property(&self, bytes: &[u8]) -> Result<PropertyValue, String> {
        if self.property_encoding == PropertyEncoding::Raw {
            return Ok(PropertyValue::from_raw(bytes));
        }
        let mut reader = DataReader::new(bytes, self.cursor_config());
        let tag = reader
            .read_u8()
            .map_err(|_| "missing value tag".to_string())?;
        let value = match tag {
            TAG_STRING => {
                let payload = reader.read_raw(reader.remaining()).map_err(|e| e.to_string())?;
                let text = std::str::from_utf8(payload)
                    .map_err(|_| "invalid UTF-8 in string value".to_string())?;
                PropertyValue::String(text.to_string())
            }
            TAG_INTEGER => {
                let raw = reader.read_u64().map_err(|e| e.to_string())?;
                PropertyValue::Integer(raw as i64)
            }
            TAG_BOOLEAN => match reader.read_u8().map_err(|e| e.to_string())? {
                0 => PropertyValue::Boolean(false),
                1 => PropertyValue::Boolean(true),
                other => return Err(format!("boolean byte {other}")),
            },
            TAG_BYTES => {
                let payload = reader.read_raw(reader.remaining()).map_err(|e| e.to_string())?;
                PropertyValue::Bytes(payload.to_vec())
            }
            other => return Err(format!("unknown value tag {other}")),
        };
        if reader.has_bytes_available() {
            return Err(format!("{} trailing bytes", reader.remaining()));
        }
        Ok(value)
    }

    fn encode_property(&self, value: &PropertyValue) -> Vec<u8> {
        if self.property_encoding == PropertyEncoding::Raw {
            return value.to_raw();
        }
        let mut writer = DataWriter::new(self.cursor_config());
        match value {
            PropertyValue::String(s) => {
                writer.write_u8(TAG_STRING);
                writer.write_raw(s.as_bytes());
            }
            PropertyValue::Integer(i) => {
                writer.write_u8(TAG_INTEGER);
                writer.write_u64(*i as u64);
            }
            PropertyValue::Boolean(b) => {
                writer.write_u8(TAG_BOOLEAN);
                writer.write_u8(u8::from(*b));
            }
            PropertyValue::Bytes(b) => {
                writer.write_u8(TAG_BYTES);
                writer.write_raw(b);
            }
        }
        writer.into_inner()
    }

    /// Encode `entries` in the given order.
    ///
    /// Fails when a field is too long for its length prefix or an entry holds
    /// more properties than the count byte can describe.
    #[instrument(level = "debug", skip(self, entries))]
    pub fn encode<'a, I>(&self, entries: I) -> Result<Vec<u8>, ManifestError>
    where
        I: IntoIterator<Item = &'a Entry>,
    {
        let mut writer = DataWriter::new(self.cursor_config());
        writer.write_raw(&self.magic);
        writer.write_u8(self.version);
        writer.write_u8(self.minor_version);

        let mut count = 0usize;
        for entry in entries {
            self.encode_record(&mut writer, entry).map_err(|reason| {
                ManifestError::Unencodable {
                    key: entry.key().clone(),
                    reason,
                }
            })?;
            count += 1;
        }
        debug!(records = count, bytes = writer.len(), "Encoded manifest");
        Ok(writer.into_inner())
    }

    fn encode_record(&self, writer: &mut DataWriter, entry: &Entry) -> Result<(), String> {
        let field = |e: CursorError| e.to_string();
        writer.write_string(Some(entry.key().domain())).map_err(field)?;
        writer.write_string(Some(entry.key().path())).map_err(field)?;
        writer
            .write_string(entry.link_target.as_deref())
            .map_err(field)?;
        writer.write_bytes(entry.digest.as_deref()).map_err(field)?;
        writer
            .write_bytes(entry.encryption_key.as_deref())
            .map_err(field)?;
        writer.write_u16(entry.mode);
        writer.write_u64(entry.inode);
        writer.write_u32(entry.user_id);
        writer.write_u32(entry.group_id);
        writer.write_u32(entry.modified_time);
        writer.write_u32(entry.accessed_time);
        writer.write_u32(entry.created_time);
        writer.write_u64(entry.file_length);
        writer.write_u8(entry.flag);

        let count = u8::try_from(entry.properties.len())
            .map_err(|_| format!("{} properties exceed 255", entry.properties.len()))?;
        writer.write_u8(count);
        for (name, value) in entry.properties.iter() {
            writer.write_string(Some(name)).map_err(field)?;
            writer
                .write_bytes(Some(&self.encode_property(value)))
                .map_err(field)?;
        }
        Ok(())
    }
}
