// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::abi;
use crate::error::TraceError;
use crate::filter::compare;
use crate::schema::Schema;
use crate::Guid;

/// `EventRecord` is a read-only view over a raw EVENT_RECORD delivered by
/// the host. It is only valid for the duration of one dispatch; callbacks
/// must not retain it.
#[repr(transparent)]
pub struct EventRecord(abi::EVENT_RECORD);

impl EventRecord {
    /// Wraps a raw record pointer received from the host.
    ///
    /// # Safety
    /// The pointer must be non-null and the record (including its user
    /// data and extended data) must outlive the returned reference.
    pub unsafe fn from_abi<'a>(
        raw: *const abi::EVENT_RECORD) -> &'a EventRecord {
        &*(raw as *const EventRecord)
    }

    pub fn raw(&self) -> &abi::EVENT_RECORD {
        &self.0
    }

    pub fn provider_id(&self) -> Guid {
        self.0.EventHeader.ProviderId
    }

    pub fn activity_id(&self) -> Guid {
        self.0.EventHeader.ActivityId
    }

    pub fn id(&self) -> u16 {
        self.0.EventHeader.EventDescriptor.Id
    }

    pub fn version(&self) -> u8 {
        self.0.EventHeader.EventDescriptor.Version
    }

    pub fn opcode(&self) -> u8 {
        self.0.EventHeader.EventDescriptor.Opcode
    }

    pub fn level(&self) -> u8 {
        self.0.EventHeader.EventDescriptor.Level
    }

    pub fn keyword(&self) -> u64 {
        self.0.EventHeader.EventDescriptor.Keyword
    }

    pub fn task(&self) -> u16 {
        self.0.EventHeader.EventDescriptor.Task
    }

    pub fn process_id(&self) -> u32 {
        self.0.EventHeader.ProcessId
    }

    pub fn thread_id(&self) -> u32 {
        self.0.EventHeader.ThreadId
    }

    pub fn timestamp(&self) -> u64 {
        self.0.EventHeader.TimeStamp
    }

    pub fn user_data(&self) -> &[u8] {
        self.0.user_data_slice()
    }

    /// Finds the payload of the first extended data item of the given
    /// type, if present.
    pub fn find_extension(
        &self,
        ext_type: u16) -> Option<&[u8]> {
        if self.0.ExtendedData.is_null() {
            return None;
        }

        unsafe {
            for i in 0..self.0.ExtendedDataCount as usize {
                let item = &*self.0.ExtendedData.add(i);

                if item.ExtType == ext_type {
                    if item.DataPtr.is_null() {
                        return None;
                    }

                    return Some(std::slice::from_raw_parts(
                        item.DataPtr,
                        item.DataSize as usize));
                }
            }
        }

        None
    }

    /// Returns the self-describing event name for events logged with the
    /// TraceLogging API, or an empty string for all other events.
    ///
    /// This implements part of the parsing TDH would normally do so that
    /// a schema key can be built without calling TDH. The metadata block
    /// layout is: a u16 total size, one or more extension bytes (read
    /// until a byte with its high bit unset), then a NUL-terminated UTF-8
    /// name.
    pub fn trace_logger_name(&self) -> &str {
        let data = match self.find_extension(
            abi::EVENT_HEADER_EXT_TYPE_EVENT_SCHEMA_TL) {
            Some(data) => data,
            None => { return ""; },
        };

        /* Too small to carry the size prefix */
        if data.len() < 2 {
            return "";
        }

        /* The declared size must match to prevent reading off the end */
        let struct_size = u16::from_le_bytes([data[0], data[1]]) as usize;

        if struct_size != data.len() {
            return "";
        }

        /* Skip the extension bytes to find the name offset */
        let mut offset = 2;

        while offset < struct_size {
            let c = data[offset];
            offset += 1;

            if c & 0x80 != 0x80 {
                break;
            }
        }

        if offset >= struct_size {
            return "";
        }

        let name = &data[offset..];
        let len = name.iter().position(|b| *b == 0).unwrap_or(name.len());

        std::str::from_utf8(&name[..len]).unwrap_or("")
    }
}

/// TDH input types carried by a property view. Values match the
/// TDH_IN_TYPE enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InType {
    UnicodeString,
    AnsiString,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Boolean,
    Binary,
    Guid,
    Pointer,
    FileTime,
    CountedString,
    CountedAnsiString,
}

impl InType {
    pub fn from_raw(
        raw: u16) -> Option<InType> {
        match raw {
            1 => Some(InType::UnicodeString),
            2 => Some(InType::AnsiString),
            3 => Some(InType::Int8),
            4 => Some(InType::UInt8),
            5 => Some(InType::Int16),
            6 => Some(InType::UInt16),
            7 => Some(InType::Int32),
            8 => Some(InType::UInt32),
            9 => Some(InType::Int64),
            10 => Some(InType::UInt64),
            11 => Some(InType::Float),
            12 => Some(InType::Double),
            13 => Some(InType::Boolean),
            14 => Some(InType::Binary),
            15 => Some(InType::Guid),
            16 => Some(InType::Pointer),
            17 => Some(InType::FileTime),
            300 => Some(InType::CountedString),
            301 => Some(InType::CountedAnsiString),
            _ => None,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            InType::UnicodeString => 1,
            InType::AnsiString => 2,
            InType::Int8 => 3,
            InType::UInt8 => 4,
            InType::Int16 => 5,
            InType::UInt16 => 6,
            InType::Int32 => 7,
            InType::UInt32 => 8,
            InType::Int64 => 9,
            InType::UInt64 => 10,
            InType::Float => 11,
            InType::Double => 12,
            InType::Boolean => 13,
            InType::Binary => 14,
            InType::Guid => 15,
            InType::Pointer => 16,
            InType::FileTime => 17,
            InType::CountedString => 300,
            InType::CountedAnsiString => 301,
        }
    }

    /// Fixed byte size for fixed-width types, None for variable-length.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            InType::Int8 | InType::UInt8 | InType::Boolean => Some(1),
            InType::Int16 | InType::UInt16 => Some(2),
            InType::Int32 | InType::UInt32 | InType::Float => Some(4),
            InType::Int64 | InType::UInt64 |
            InType::Double | InType::FileTime | InType::Pointer => Some(8),
            InType::Guid => Some(16),
            _ => None,
        }
    }
}

/// A located property: the property's bytes within the record's user
/// data and the input type declared by the schema. For null-terminated
/// strings the bytes include the terminator.
pub struct PropertyView<'a> {
    pub data: &'a [u8],
    pub in_type: InType,
}

impl<'a> PropertyView<'a> {
    pub fn try_get_u8(&self) -> Option<u8> {
        if self.data.is_empty() { return None; }

        Some(self.data[0])
    }

    pub fn try_get_u16(&self) -> Option<u16> {
        if self.data.len() < 2 { return None; }

        match self.data[0..2].try_into() {
            Ok(bytes) => Some(u16::from_ne_bytes(bytes)),
            Err(_) => None,
        }
    }

    pub fn try_get_u32(&self) -> Option<u32> {
        if self.data.len() < 4 { return None; }

        match self.data[0..4].try_into() {
            Ok(bytes) => Some(u32::from_ne_bytes(bytes)),
            Err(_) => None,
        }
    }

    pub fn try_get_u64(&self) -> Option<u64> {
        if self.data.len() < 8 { return None; }

        match self.data[0..8].try_into() {
            Ok(bytes) => Some(u64::from_ne_bytes(bytes)),
            Err(_) => None,
        }
    }

    pub fn try_get_i32(&self) -> Option<i32> {
        self.try_get_u32().map(|v| v as i32)
    }

    pub fn try_get_i64(&self) -> Option<i64> {
        self.try_get_u64().map(|v| v as i64)
    }
}

/// The narrow decode contract the core relies on. The TDH-backed
/// implementation lives outside this crate; `testing::TableReader`
/// implements it over synthetic schemas for tests.
pub trait PropertyReader {
    /// Locates a named property in the record's user data using the
    /// event's schema. Returns None when the schema does not describe
    /// the property or the payload is too short.
    fn find_property<'a>(
        &self,
        record: &'a EventRecord,
        schema: &Schema,
        name: &str) -> Option<PropertyView<'a>>;
}

/// A reader that never finds anything. Installed by default until a host
/// supplies a real parser.
#[derive(Default)]
pub struct NoopReader;

impl PropertyReader for NoopReader {
    fn find_property<'a>(
        &self,
        _record: &'a EventRecord,
        _schema: &Schema,
        _name: &str) -> Option<PropertyView<'a>> {
        None
    }
}

/// `TypedRecord` binds a record to its schema and a property reader for
/// the duration of one dispatch. The borrow keeps callbacks from
/// retaining it past their return; property reads must complete within
/// the callback.
pub struct TypedRecord<'a> {
    record: &'a EventRecord,
    schema: &'a Schema,
    reader: &'a dyn PropertyReader,
}

impl<'a> TypedRecord<'a> {
    pub fn new(
        record: &'a EventRecord,
        schema: &'a Schema,
        reader: &'a dyn PropertyReader) -> Self {
        Self {
            record,
            schema,
            reader,
        }
    }

    pub fn record(&self) -> &EventRecord {
        self.record
    }

    pub fn schema(&self) -> &Schema {
        self.schema
    }

    pub fn provider_id(&self) -> Guid {
        self.record.provider_id()
    }

    pub fn id(&self) -> u16 {
        self.record.id()
    }

    pub fn version(&self) -> u8 {
        self.record.version()
    }

    pub fn opcode(&self) -> u8 {
        self.record.opcode()
    }

    pub fn level(&self) -> u8 {
        self.record.level()
    }

    pub fn keyword(&self) -> u64 {
        self.record.keyword()
    }

    pub fn process_id(&self) -> u32 {
        self.record.process_id()
    }

    pub fn thread_id(&self) -> u32 {
        self.record.thread_id()
    }

    pub fn timestamp(&self) -> u64 {
        self.record.timestamp()
    }

    pub fn property(
        &self,
        name: &str) -> Option<PropertyView<'_>> {
        self.reader.find_property(self.record, self.schema, name)
    }

    fn expect_property(
        &self,
        name: &str) -> Result<PropertyView<'_>, TraceError> {
        self.property(name).ok_or_else(|| TraceError::DecodeFailed {
            property: name.into(),
            reason: "property not found in schema",
        })
    }

    fn short_data(
        name: &str) -> TraceError {
        TraceError::DecodeFailed {
            property: name.into(),
            reason: "not enough data",
        }
    }

    pub fn get_u8(
        &self,
        name: &str) -> Result<u8, TraceError> {
        self.expect_property(name)?
            .try_get_u8()
            .ok_or_else(|| Self::short_data(name))
    }

    pub fn get_u16(
        &self,
        name: &str) -> Result<u16, TraceError> {
        self.expect_property(name)?
            .try_get_u16()
            .ok_or_else(|| Self::short_data(name))
    }

    pub fn get_u32(
        &self,
        name: &str) -> Result<u32, TraceError> {
        self.expect_property(name)?
            .try_get_u32()
            .ok_or_else(|| Self::short_data(name))
    }

    pub fn get_u64(
        &self,
        name: &str) -> Result<u64, TraceError> {
        self.expect_property(name)?
            .try_get_u64()
            .ok_or_else(|| Self::short_data(name))
    }

    pub fn get_i32(
        &self,
        name: &str) -> Result<i32, TraceError> {
        self.expect_property(name)?
            .try_get_i32()
            .ok_or_else(|| Self::short_data(name))
    }

    pub fn get_i64(
        &self,
        name: &str) -> Result<i64, TraceError> {
        self.expect_property(name)?
            .try_get_i64()
            .ok_or_else(|| Self::short_data(name))
    }

    /// Decodes a string property. Null terminators are excluded;
    /// counted strings honor their count prefix.
    pub fn get_string(
        &self,
        name: &str) -> Result<String, TraceError> {
        let view = self.expect_property(name)?;

        match view.in_type {
            InType::UnicodeString => {
                let units: Vec<u16> =
                    compare::null_terminated_wide(view.data).collect();

                Ok(String::from_utf16_lossy(&units))
            },

            InType::CountedString => {
                let units: Vec<u16> =
                    compare::counted_wide(view.data).collect();

                Ok(String::from_utf16_lossy(&units))
            },

            InType::AnsiString => {
                let bytes: Vec<u8> =
                    compare::null_terminated_ansi(view.data).collect();

                Ok(String::from_utf8_lossy(&bytes).into_owned())
            },

            InType::CountedAnsiString => {
                let bytes: Vec<u8> =
                    compare::counted_ansi(view.data).collect();

                Ok(String::from_utf8_lossy(&bytes).into_owned())
            },

            _ => Err(TraceError::DecodeFailed {
                property: name.into(),
                reason: "property is not a string",
            }),
        }
    }
}

/// The view handed to error callbacks: the failure message plus the
/// header of the record that caused it. Valid only for the duration of
/// the callback.
pub struct RecordError<'a> {
    message: &'a str,
    record: &'a EventRecord,
}

impl<'a> RecordError<'a> {
    pub fn new(
        message: &'a str,
        record: &'a EventRecord) -> Self {
        Self {
            message,
            record,
        }
    }

    pub fn message(&self) -> &str {
        self.message
    }

    pub fn record(&self) -> &EventRecord {
        self.record
    }
}

pub type EventCallback =
    Box<dyn FnMut(&TypedRecord<'_>) -> anyhow::Result<()>>;

pub type MetadataCallback =
    Box<dyn FnMut(&EventRecord) -> anyhow::Result<()>>;

pub type ErrorCallback =
    Box<dyn FnMut(&RecordError<'_>)>;
