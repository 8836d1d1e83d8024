//! Slot file codec.
//!
//! Each slot file is a single framed record:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | version  | format   | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | payload                                                         |
//! | length bytes                                                    |
//! +-----------------------------------------------------------------+
//! ```
//!
//! Format 1 stores the whole document as JSON. Format 2 stores the
//! document without its side table as length-prefixed JSON, followed by
//! the side table in a compact binary encoding.

use crate::error::StorageError;
use arbor_core::document::SideTable;
use arbor_core::{Limits, SaveDocument, Value, VarTable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Magic bytes for slot files: "ARSV"
pub const SLOT_MAGIC: [u8; 4] = *b"ARSV";

pub const SLOT_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

const TAG_INT: u8 = b'i';
const TAG_FLOAT: u8 = b'f';
const TAG_STR: u8 = b's';
const TAG_BOOL: u8 = b'b';

/// Payload encoding of a slot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SlotFormat {
    #[default]
    Json = 1,
    Binary = 2,
}

impl TryFrom<u8> for SlotFormat {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SlotFormat::Json),
            2 => Ok(SlotFormat::Binary),
            _ => Err(StorageError::Corruption(format!("unknown slot format: {}", value))),
        }
    }
}

impl FromStr for SlotFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "1" => Ok(SlotFormat::Json),
            "binary" | "2" => Ok(SlotFormat::Binary),
            other => Err(format!("unknown slot format: {}", other)),
        }
    }
}

impl fmt::Display for SlotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotFormat::Json => f.write_str("json"),
            SlotFormat::Binary => f.write_str("binary"),
        }
    }
}

/// A parsed slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHeader {
    pub version: u8,
    pub format: SlotFormat,
    pub payload_len: u32,
    pub crc32c: u32,
}

/// Encodes a document into a framed slot record.
pub fn encode(doc: &SaveDocument, format: SlotFormat) -> Result<Bytes, StorageError> {
    let payload = match format {
        SlotFormat::Json => Bytes::from(serde_json::to_vec(doc)?),
        SlotFormat::Binary => {
            let body = SaveDocument {
                version: doc.version,
                instances: doc.instances.clone(),
                side: SideTable::default(),
            };
            let json = serde_json::to_vec(&body)?;
            let mut buf = BytesMut::with_capacity(json.len() + 256);
            put_len(&mut buf, json.len())?;
            buf.put_slice(&json);
            encode_side_table(&mut buf, &doc.side)?;
            buf.freeze()
        }
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(StorageError::RecordTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&SLOT_MAGIC);
    buf.put_u8(SLOT_VERSION);
    buf.put_u8(format as u8);
    buf.put_u16(0);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32c::crc32c(&payload));
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Parses and validates a header. `data` must hold at least the header.
pub fn decode_header(data: &[u8]) -> Result<SlotHeader, StorageError> {
    if data.len() < HEADER_SIZE {
        return Err(StorageError::Corruption(format!(
            "slot file truncated: {} bytes",
            data.len()
        )));
    }
    let mut buf = &data[..HEADER_SIZE];
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != SLOT_MAGIC {
        return Err(StorageError::Corruption(format!("invalid magic: {:?}", magic)));
    }

    let version = buf.get_u8();
    if version > SLOT_VERSION {
        return Err(StorageError::Corruption(format!(
            "slot version {} is newer than supported version {}",
            version, SLOT_VERSION
        )));
    }
    let format = SlotFormat::try_from(buf.get_u8())?;
    let _reserved = buf.get_u16();
    let payload_len = buf.get_u32();
    let crc32c = buf.get_u32();

    if payload_len as usize > MAX_PAYLOAD_SIZE {
        return Err(StorageError::RecordTooLarge {
            size: payload_len as usize,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(SlotHeader {
        version,
        format,
        payload_len,
        crc32c,
    })
}

/// Decodes a framed slot record, checking its checksum and sizes.
pub fn decode(data: &[u8], limits: &Limits) -> Result<(SlotHeader, SaveDocument), StorageError> {
    let header = decode_header(data)?;
    let payload = &data[HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(StorageError::Corruption(format!(
            "payload length {} does not match header length {}",
            payload.len(),
            header.payload_len
        )));
    }

    let actual = crc32c::crc32c(payload);
    if actual != header.crc32c {
        return Err(StorageError::Corruption(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            header.crc32c, actual
        )));
    }

    let doc = match header.format {
        SlotFormat::Json => serde_json::from_slice(payload)?,
        SlotFormat::Binary => {
            let mut reader = Reader::new(payload, limits);
            let json_len = reader.length(MAX_PAYLOAD_SIZE)?;
            let json = reader.bytes(json_len)?;
            let mut doc: SaveDocument = serde_json::from_slice(json)?;
            doc.side = decode_side_table(&mut reader)?;
            if reader.remaining() != 0 {
                return Err(StorageError::Corruption(format!(
                    "{} trailing bytes after side table",
                    reader.remaining()
                )));
            }
            doc
        }
    };

    limits.check_document(&doc)?;
    Ok((header, doc))
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), StorageError> {
    let len = u32::try_from(len).map_err(|_| StorageError::RecordTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    buf.put_u32(len);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), StorageError> {
    put_len(buf, s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), StorageError> {
    match value {
        Value::Int(i) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_str(buf, s)?;
        }
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
    }
    Ok(())
}

fn put_table(buf: &mut BytesMut, table: &VarTable) -> Result<(), StorageError> {
    put_len(buf, table.len())?;
    for (key, value) in table {
        put_str(buf, key)?;
        put_value(buf, value)?;
    }
    Ok(())
}

/// Side table layout: globals table, then per-instance local tables, then
/// per-instance completed transition ids. Every count and string length is
/// a big-endian `u32`.
pub fn encode_side_table(buf: &mut BytesMut, side: &SideTable) -> Result<(), StorageError> {
    put_table(buf, &side.globals)?;

    put_len(buf, side.locals.len())?;
    for (instance, table) in &side.locals {
        put_str(buf, instance)?;
        put_table(buf, table)?;
    }

    put_len(buf, side.completed.len())?;
    for (instance, ids) in &side.completed {
        put_str(buf, instance)?;
        put_len(buf, ids.len())?;
        for id in ids {
            put_str(buf, id)?;
        }
    }
    Ok(())
}

pub fn decode_side_table(reader: &mut Reader<'_>) -> Result<SideTable, StorageError> {
    let limits = reader.limits;
    let mut side = SideTable {
        globals: reader.table()?,
        ..SideTable::default()
    };

    let count = reader.length(limits.max_instances)?;
    for _ in 0..count {
        let instance = reader.string(limits.max_key_len)?;
        let table = reader.table()?;
        side.locals.insert(instance, table);
    }

    let count = reader.length(limits.max_instances)?;
    for _ in 0..count {
        let instance = reader.string(limits.max_key_len)?;
        let n = reader.length(limits.max_history)?;
        let mut ids = Vec::with_capacity(n.min(reader.remaining() / 4));
        for _ in 0..n {
            ids.push(reader.string(limits.max_key_len)?);
        }
        side.completed.insert(instance, ids);
    }
    Ok(side)
}

/// Bounds-checked reader over a binary payload. Every length is compared
/// against both the configured limit and the bytes left before anything is
/// allocated.
pub struct Reader<'a> {
    buf: &'a [u8],
    limits: &'a Limits,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], limits: &'a Limits) -> Self {
        Self { buf, limits }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), StorageError> {
        if self.buf.remaining() < n {
            return Err(StorageError::Corruption(format!(
                "unexpected end of side table: need {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, StorageError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn length(&mut self, max: usize) -> Result<usize, StorageError> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        if len > max {
            return Err(StorageError::Corruption(format!("length {} exceeds limit {}", len, max)));
        }
        Ok(len)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], StorageError> {
        self.need(n)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, max: usize) -> Result<String, StorageError> {
        let len = self.length(max)?;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| StorageError::Corruption(format!("invalid UTF-8: {}", e)))
    }

    fn value(&mut self) -> Result<Value, StorageError> {
        match self.u8()? {
            TAG_INT => {
                self.need(8)?;
                Ok(Value::Int(self.buf.get_i64()))
            }
            TAG_FLOAT => {
                self.need(8)?;
                Ok(Value::Float(self.buf.get_f64()))
            }
            TAG_STR => Ok(Value::Str(self.string(self.limits.max_string_len)?)),
            TAG_BOOL => match self.u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(StorageError::Corruption(format!("invalid bool byte: {}", other))),
            },
            other => Err(StorageError::Corruption(format!("unknown value tag: {:#04x}", other))),
        }
    }

    fn table(&mut self) -> Result<VarTable, StorageError> {
        let count = self.length(self.limits.max_state_entries)?;
        let mut table = VarTable::new();
        for _ in 0..count {
            let key = self.string(self.limits.max_key_len)?;
            let value = self.value()?;
            table.insert(key, value);
        }
        Ok(table)
    }
}
